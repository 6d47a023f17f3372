//! タイマーキュー
//!
//! トランスポート層が返す `Schedule { token, delay_ms }` を期限順に保持する。
//! 取り消しはしない。古いトークンはトランスポート層が世代とエポックで無視し、
//! 先頭に溜まった古いトークンは `discard_stale` で捨てる。

use alloc::collections::BinaryHeap;
use alloc::vec::Vec;
use core::cmp::{Ordering, Reverse};

use mesh_transport::TimerToken;

#[derive(Debug, Clone, Copy)]
struct Entry {
    deadline_ms: u64,
    /// 同じ期限なら登録順
    order: u64,
    token: TimerToken,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline_ms == other.deadline_ms && self.order == other.order
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.deadline_ms, self.order).cmp(&(other.deadline_ms, other.order))
    }
}

/// 期限付きトークンの優先度キュー
#[derive(Debug, Default)]
pub struct TimerQueue {
    heap: BinaryHeap<Reverse<Entry>>,
    order: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, token: TimerToken, deadline_ms: u64) {
        self.order += 1;
        self.heap.push(Reverse(Entry {
            deadline_ms,
            order: self.order,
            token,
        }));
    }

    /// 期限が来たトークンを 1 つ取り出す
    pub fn pop_due(&mut self, now_ms: u64) -> Option<TimerToken> {
        match self.heap.peek() {
            Some(Reverse(entry)) if entry.deadline_ms <= now_ms => {
                self.heap.pop().map(|Reverse(e)| e.token)
            }
            _ => None,
        }
    }

    /// 先頭から、もう有効でないトークンを捨てる
    ///
    /// 先頭が有効なトークンになったところで止まる。捨てた数を返す。
    pub fn discard_stale(&mut self, mut is_live: impl FnMut(&TimerToken) -> bool) -> usize {
        let mut discarded = 0;
        while let Some(Reverse(entry)) = self.heap.peek() {
            if is_live(&entry.token) {
                break;
            }
            self.heap.pop();
            discarded += 1;
        }
        discarded
    }

    /// 最も近い期限
    pub fn next_deadline(&self) -> Option<u64> {
        self.heap.peek().map(|Reverse(e)| e.deadline_ms)
    }

    /// 期限順にトークンを列挙する（デバッグ用）
    pub fn pending(&self) -> Vec<(u64, TimerToken)> {
        let mut entries: Vec<Entry> = self.heap.iter().map(|Reverse(e)| *e).collect();
        entries.sort();
        entries.into_iter().map(|e| (e.deadline_ms, e.token)).collect()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }
}
