//! インターフェースごとの送信フレームキュー

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use serde::Serialize;

/// 送信待ちの Network PDU を溜める有界 FIFO
///
/// ネットワーク層は `push` して即座に戻り（submit-and-return）、
/// 無線ドライバ（またはホスト側）が `drain` で取り出して送信する。
/// 満杯のときは最も古いフレームを捨てる。中継トラフィックが溜まり続けて
/// 最新の PDU を送れなくなるのを避けるため。
pub struct FrameQueue {
    frames: VecDeque<Vec<u8>>,
    capacity: usize,
    stats: QueueStats,
}

/// キュー統計
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// キューに積んだフレーム数
    pub queued_frames: u64,
    /// 取り出された（送信に渡った）フレーム数
    pub drained_frames: u64,
    /// 取り出された総バイト数
    pub drained_bytes: u64,
    /// 満杯で捨てたフレーム数
    pub dropped_frames: u64,
}

impl FrameQueue {
    /// 新しい FrameQueue を生成する
    pub fn new(capacity: usize) -> Self {
        FrameQueue {
            frames: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            stats: QueueStats::default(),
        }
    }

    /// フレームを積む
    ///
    /// # 戻り値
    /// - `true`: 古いフレームを捨てて場所を空けた
    pub fn push(&mut self, frame: &[u8]) -> bool {
        let mut dropped = false;
        if self.frames.len() >= self.capacity {
            self.frames.pop_front();
            self.stats.dropped_frames += 1;
            dropped = true;
        }
        self.frames.push_back(frame.to_vec());
        self.stats.queued_frames += 1;
        dropped
    }

    /// 溜まっているフレームをすべて取り出す
    pub fn drain(&mut self) -> Vec<Vec<u8>> {
        let frames: Vec<Vec<u8>> = self.frames.drain(..).collect();
        self.stats.drained_frames += frames.len() as u64;
        self.stats.drained_bytes += frames.iter().map(|f| f.len() as u64).sum::<u64>();
        frames
    }

    /// 先頭のフレームを 1 つ取り出す
    pub fn pop(&mut self) -> Option<Vec<u8>> {
        let frame = self.frames.pop_front()?;
        self.stats.drained_frames += 1;
        self.stats.drained_bytes += frame.len() as u64;
        Some(frame)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn stats(&self) -> QueueStats {
        self.stats
    }
}
