//! mesh-core エラー型

use mesh_network::NetworkError;
use mesh_proto::ProtoError;
use mesh_transport::TransportError;
use thiserror::Error;

/// 設定・鍵登録のエラー
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// 設定値が範囲外
    #[error("Invalid configuration value: {0}")]
    InvalidValue(&'static str),
    /// 鍵インデックスが 12 ビットを超えている
    #[error("Key index out of range: {0}")]
    KeyIndexOutOfRange(u16),
    /// 未登録の Network Key
    #[error("Unknown network key index: {0}")]
    UnknownNetKey(u16),
    /// 未登録の Application Key
    #[error("Unknown application key index: {0}")]
    UnknownAppKey(u16),
    /// 同じインデックスの鍵が登録済み
    #[error("Key index already in use: {0}")]
    DuplicateKey(u16),
}

/// 受信処理・インターフェース操作のエラー
///
/// 受信側のエラーは観測用で、呼び出し側のループは無視して次の PDU に進む。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MeshError {
    #[error("Network layer: {0}")]
    Network(#[from] NetworkError),
    #[error("Transport layer: {0}")]
    Transport(#[from] TransportError),
    #[error("Access layer: {0}")]
    Proto(#[from] ProtoError),
    #[error("Configuration: {0}")]
    Config(#[from] ConfigError),
    /// アドレス種別が操作に合わない
    #[error("Invalid address: 0x{0:04x}")]
    InvalidAddress(u16),
}

/// 送信要求を同期的に拒否する理由
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    /// 空きセグメント送信コンテキストがない
    #[error("Busy: no free segmentation context")]
    Busy,
    /// 1 メッセージの最大長を超えている
    #[error("Message too large ({0} bytes)")]
    TooLarge(usize),
    /// 鍵が登録されていない
    #[error("Unknown key")]
    UnknownKey,
    /// 送信元がローカル要素でない、宛先が未割り当て、ラベル未登録など
    #[error("Invalid address: 0x{0:04x}")]
    InvalidAddress(u16),
    /// SEQ を使い切った（IV Update が必要）
    #[error("Sequence numbers exhausted")]
    SequenceExhausted,
    /// ペイロード・オペコード・TTL などが符号化できない
    #[error("Encoding error: {0}")]
    Encoding(&'static str),
}
