//! # mesh-bearer
//!
//! Bearer（無線の送受信路）の抽象化レイヤー
//!
//! ネットワーク層から見たベアラは「Network PDU を受け取って送る口」だけを持つ。
//! 広告ベアラと GATT Proxy ベアラはそれぞれ `Bearer` を実装し、
//! ネットワーク層のインターフェースレジストリにトレイトオブジェクトとして登録される。
//!
//! ```text
//! 送信:
//!   1. ネットワーク層 → bearer.send(pdu)       （キューに積んで即座に戻る）
//!   2. 無線ドライバ   → bearer.drain()         （送信するフレームを取り出す）
//!
//! 受信:
//!   無線ドライバ → MeshContext::on_bearer_pdu(interface, bytes)
//! ```

#![no_std]
extern crate alloc;

pub mod bearer;
pub mod queue;

pub use bearer::{AdvertisingBearer, GattProxyBearer, MAX_NETWORK_PDU_LEN};
pub use queue::{FrameQueue, QueueStats};

use alloc::vec::Vec;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// ベアラの種別
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BearerKind {
    Advertising,
    GattProxy,
}

/// ベアラ操作のエラー
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BearerError {
    /// ベアラが閉じている（切断済み）
    #[error("Bearer closed")]
    Closed,
    /// フレームが Network PDU の最大長を超えている
    #[error("Frame too long ({0} bytes)")]
    FrameTooLong(usize),
}

/// Network PDU を運ぶベアラ
pub trait Bearer {
    /// ベアラの種別
    fn kind(&self) -> BearerKind;

    /// Network PDU を送信に回す。ブロックせずに戻る
    fn send(&mut self, pdu: &[u8]) -> Result<(), BearerError>;

    /// 送信待ちフレームを取り出す。直接無線に書き込む実装は空を返す
    fn drain(&mut self) -> Vec<Vec<u8>> {
        Vec::new()
    }

    /// 送信統計
    fn stats(&self) -> QueueStats {
        QueueStats::default()
    }
}
