//! リプレイキャッシュ
//!
//! 送信元アドレスごとに、受理済みの最大 `(IV Index, SEQ)` だけを保持する。
//! 比較は IV Index が優先（IV Update 後は SEQ が 0 から再開してよい）。
//!
//! 容量を超えて新しい送信元が来たときだけ追い出しが起きる。追い出せるのは
//! 受信可能な IV Index より古い（＝もう一致しえない）エントリのみで、
//! 有効なエントリを追い出すとその送信元のリプレイ窓が再び開いてしまうため、
//! その場合は新しい送信元の PDU を拒否する。

use hashbrown::HashMap;
use tracing::warn;

#[derive(Debug, Clone, Copy)]
struct Entry {
    iv_index: u32,
    seq: u32,
    /// 最終更新時刻（論理クロック）
    stamp: u64,
}

/// 送信元ごとの最大 `(IV Index, SEQ)` を持つリプレイキャッシュ
#[derive(Debug)]
pub struct ReplayCache {
    entries: HashMap<u16, Entry>,
    capacity: usize,
    /// 受信可能な最小 IV Index（これより古いエントリは追い出し対象）
    oldest_iv: u32,
    clock: u64,
    /// 容量不足で拒否した回数
    saturated: u64,
}

impl ReplayCache {
    pub fn with_capacity(capacity: usize) -> Self {
        ReplayCache {
            entries: HashMap::with_capacity(capacity),
            capacity,
            oldest_iv: 0,
            clock: 0,
            saturated: 0,
        }
    }

    /// PDU を受理するか判定し、受理した場合はキャッシュを更新する
    ///
    /// 以下のとき `true`:
    /// - `src` のエントリがなく、空きがある（または古いエントリを追い出せる）
    /// - 既存エントリの `(iv_index, seq)` より辞書順で大きい
    pub fn accept(&mut self, src: u16, seq: u32, iv_index: u32) -> bool {
        self.clock += 1;
        let stamp = self.clock;

        if let Some(entry) = self.entries.get_mut(&src) {
            if (iv_index, seq) <= (entry.iv_index, entry.seq) {
                return false;
            }
            *entry = Entry {
                iv_index,
                seq,
                stamp,
            };
            return true;
        }

        if self.entries.len() >= self.capacity && !self.evict_stale() {
            self.saturated += 1;
            warn!(
                src = %format_args!("{:04x}", src),
                capacity = self.capacity,
                "replay cache saturated, rejecting new source"
            );
            return false;
        }

        self.entries.insert(
            src,
            Entry {
                iv_index,
                seq,
                stamp,
            },
        );
        true
    }

    /// キャッシュを更新せずに、PDU がリプレイかどうかだけを判定する
    pub fn is_replay(&self, src: u16, seq: u32, iv_index: u32) -> bool {
        match self.entries.get(&src) {
            Some(entry) => (iv_index, seq) <= (entry.iv_index, entry.seq),
            None => false,
        }
    }

    /// 現在の IV Index を通知する
    ///
    /// 受信可能な IV Index（現在値と 1 つ前）より古いエントリは、もう
    /// どの PDU とも一致しないので、以後は追い出し対象になる。
    pub fn set_iv_index(&mut self, current: u32) {
        self.oldest_iv = current.saturating_sub(1);
    }

    /// 追い出し対象（期限切れ）のエントリをすべて削除する
    pub fn prune(&mut self) -> usize {
        let oldest = self.oldest_iv;
        let before = self.entries.len();
        self.entries.retain(|_, e| e.iv_index >= oldest);
        before - self.entries.len()
    }

    /// 最も古い（LRU）期限切れエントリを 1 つ追い出す
    fn evict_stale(&mut self) -> bool {
        let oldest = self.oldest_iv;
        let victim = self
            .entries
            .iter()
            .filter(|(_, e)| e.iv_index < oldest)
            .min_by_key(|(_, e)| e.stamp)
            .map(|(src, _)| *src);
        match victim {
            Some(src) => {
                self.entries.remove(&src);
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, src: u16) -> bool {
        self.entries.remove(&src).is_some()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 容量不足で拒否した回数
    pub fn saturated(&self) -> u64 {
        self.saturated
    }
}
