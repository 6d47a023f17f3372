//! mesh-transport エラー型

use mesh_crypto::CryptoError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// トランスポート層のエラー
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// ヘッダー・セグメント長・SegO/SegN の組み合わせが不正
    #[error("Malformed lower transport PDU")]
    MalformedPdu,
    /// 空いているセグメント送信コンテキストがない
    #[error("No free segmentation context")]
    Busy,
    /// 1 メッセージで運べる最大長を超えている
    #[error("Upper transport PDU too large ({0} bytes)")]
    TooLarge(usize),
    /// どの候補鍵でも TransMIC を検証できなかった
    #[error("TransMIC authentication failed")]
    AuthenticationFailed,
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

/// セグメント送信が失敗で終わった理由（完了通知で非同期に届く）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum SendFailure {
    /// 再送回数を使い切っても ACK が揃わなかった
    #[error("Segmented send failed (retransmissions exhausted)")]
    SendFailed,
    /// ローカルで取り消された（切断など）
    #[error("Send cancelled")]
    Cancelled,
    /// 受信側が BlockAck 0 で拒否した
    #[error("Rejected by peer")]
    RejectedByPeer,
}
