//! mesh-proto エラー型

use thiserror::Error;

/// Mesh の基本フィールドに関するエラー
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtoError {
    /// アドレスが用途に合わない（例: SRC に unicast 以外）
    #[error("Invalid address 0x{0:04x}")]
    InvalidAddress(u16),
    /// TTL が 0〜127 の範囲外
    #[error("Invalid TTL {0} (expected 0..=127)")]
    InvalidTtl(u8),
    /// シーケンス番号が 24 ビットを超えた
    #[error("Sequence number overflow (24-bit space exhausted)")]
    SequenceOverflow,
    /// Access opcode の形式が不正
    #[error("Invalid access opcode")]
    InvalidOpcode,
}
