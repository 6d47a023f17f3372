//! タイマートークン
//!
//! トランスポート層はタイマーを直接持たず、`Schedule { token, delay_ms }` を
//! 返すだけ。期限が来たらホスト側がトークンを戻してくる。
//!
//! トークンはスロットハンドル（index + generation）とエポックを持つ。
//! コンテキストを解放するとスロットの generation が、再アームするとエポックが
//! 進むので、取り消し済みのタイマーが発火しても無視される。

use mesh_proto::SlotHandle;
use serde::{Deserialize, Serialize};

/// タイマーの種別
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimerKind {
    /// セグメント再送タイマー（送信側）
    SegmentRetransmit,
    /// ACK 送信タイマー（受信側）
    ReassemblyAck,
    /// 受信未完了タイマー（受信側）
    ReassemblyIncomplete,
}

/// 発火時にコンテキストを特定するトークン
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimerToken {
    pub kind: TimerKind,
    pub slot: SlotHandle,
    pub epoch: u32,
}

impl TimerToken {
    pub fn new(kind: TimerKind, slot: SlotHandle, epoch: u32) -> Self {
        TimerToken { kind, slot, epoch }
    }
}
