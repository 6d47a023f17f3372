//! # mesh-proto
//!
//! Bluetooth Mesh のネットワーク層・下位トランスポート層で共有する基本型。
//!
//! - アドレス（Unicast / Group / Virtual）
//! - IV Index と IVI ビットによる受信 IV の選択
//! - SEQ（24 ビット）・TTL（7 ビット）の範囲
//! - Access opcode
//! - 世代番号付きスロットプール（セグメント送受信コンテキスト・インターフェース用）

#![no_std]
extern crate alloc;

pub mod address;
pub mod error;
pub mod opcode;
pub mod pool;

pub use address::{Address, ALL_FRIENDS, ALL_NODES, ALL_PROXIES, ALL_RELAYS};
pub use error::ProtoError;
pub use opcode::Opcode;
pub use pool::{SlotHandle, SlotPool};

use serde::{Deserialize, Serialize};

/// SEQ の最大値（24 ビット）
pub const SEQ_MAX: u32 = 0x00FF_FFFF;

/// TTL の最大値（7 ビット）
pub const TTL_MAX: u8 = 0x7F;

/// Network Key / Application Key のインデックス（12 ビット）
pub type NetKeyIndex = u16;
pub type AppKeyIndex = u16;

/// キーインデックスの最大値
pub const KEY_INDEX_MAX: u16 = 0x0FFF;

/// TTL の妥当性チェック
pub fn check_ttl(ttl: u8) -> Result<u8, ProtoError> {
    if ttl > TTL_MAX {
        Err(ProtoError::InvalidTtl(ttl))
    } else {
        Ok(ttl)
    }
}

/// ネットワーク全体で共有する IV Index
///
/// `update_in_progress` の間は送信に `index - 1` を使い、
/// 受信は IVI ビットで `index` と `index - 1` を選ぶ。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IvIndex {
    pub index: u32,
    pub update_in_progress: bool,
}

impl IvIndex {
    pub fn new(index: u32, update_in_progress: bool) -> Self {
        IvIndex {
            index,
            update_in_progress,
        }
    }

    /// 送信に使う IV Index
    pub fn tx_index(&self) -> u32 {
        if self.update_in_progress {
            self.index.saturating_sub(1)
        } else {
            self.index
        }
    }

    /// 受信 PDU の IVI ビットから IV Index を決める
    ///
    /// IVI が現在値の LSB と一致すれば現在値、そうでなければ 1 つ前の値。
    pub fn rx_index(&self, ivi: bool) -> u32 {
        if (self.index & 1 == 1) == ivi {
            self.index
        } else {
            self.index.wrapping_sub(1)
        }
    }

    /// 受信できる最小の IV Index（これより古いものは期限切れ）
    pub fn oldest_receivable(&self) -> u32 {
        self.index.saturating_sub(1)
    }
}

/// セグメント受信時、ネットワーク SEQ と SeqZero から SeqAuth を復元する
///
/// SeqZero は SeqAuth の下位 13 ビット。SEQ は SeqAuth 以上かつ差が 8192 未満。
/// 復元できない（SEQ が小さすぎる）場合は `None`。
pub fn seq_auth_from(seq: u32, seq_zero: u16) -> Option<u32> {
    let delta = (seq.wrapping_sub(seq_zero as u32)) & 0x1FFF;
    seq.checked_sub(delta)
}
