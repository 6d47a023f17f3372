//! mesh-network エラー型

use mesh_crypto::CryptoError;
use thiserror::Error;

/// ネットワーク層のエラー
///
/// 受信側のエラーはすべて「黙って破棄」で、上位へは伝播しない。
/// 呼び出し側は観測（ログ・統計）のためにだけ参照する。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetworkError {
    /// 長さ・予約ビット・アドレス種別が不正
    #[error("Malformed network PDU")]
    MalformedPdu,
    /// どの候補鍵でも NetMIC を検証できなかった（鍵更新中は日常的に起きる）
    #[error("NetMIC authentication failed for every candidate key")]
    AuthenticationFailed,
    /// リプレイキャッシュが重複・古い PDU と判断した
    #[error("Replay rejected")]
    ReplayRejected,
    /// 送信フィールドが範囲外
    #[error("Invalid field: {0}")]
    InvalidField(&'static str),
    /// インターフェースの登録数が上限に達した
    #[error("Interface limit reached")]
    InterfaceLimit,
    /// 未登録（または解除済み）のインターフェース
    #[error("Unknown interface")]
    UnknownInterface,
    /// 暗号処理の失敗（送信側）
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
}
