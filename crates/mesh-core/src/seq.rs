//! 送信 SEQ の管理
//!
//! SEQ は要素ごとに単調増加する 24 ビット値で、IV Index が変わるまで再利用できない。
//! 永続化が必要なホストは `SequenceStore` を実装して、予約のたびに保存する。

use hashbrown::HashMap;
use mesh_proto::SEQ_MAX;
use tracing::warn;

/// SEQ の払い出し
pub trait SequenceStore {
    /// `count` 個連続した SEQ を予約し、先頭を返す
    ///
    /// 24 ビットに収まらない場合は `None`（IV Update が必要）。
    fn reserve(&mut self, element: u16, count: u32) -> Option<u32>;

    /// 次に払い出す SEQ
    fn current(&self, element: u16) -> u32;

    /// IV Update 完了時にすべての要素の SEQ を 0 に戻す
    fn reset(&mut self);

    /// SEQ を 1 つ払い出す
    fn next(&mut self, element: u16) -> Option<u32> {
        self.reserve(element, 1)
    }
}

/// メモリ上の SEQ ストア
#[derive(Debug, Default)]
pub struct MemorySequenceStore {
    next: HashMap<u16, u32>,
}

impl MemorySequenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 永続化していた値から再開する
    pub fn restore(&mut self, element: u16, next_seq: u32) {
        self.next.insert(element, next_seq);
    }
}

impl SequenceStore for MemorySequenceStore {
    fn reserve(&mut self, element: u16, count: u32) -> Option<u32> {
        let next = self.next.entry(element).or_insert(0);
        let start = *next;
        let end = start.checked_add(count)?;
        if count == 0 || end - 1 > SEQ_MAX {
            warn!(element = %format_args!("{:04x}", element), seq = start, "sequence numbers exhausted");
            return None;
        }
        *next = end;
        Some(start)
    }

    fn current(&self, element: u16) -> u32 {
        self.next.get(&element).copied().unwrap_or(0)
    }

    fn reset(&mut self) {
        self.next.clear();
    }
}
