//! 暗号エラー型

use thiserror::Error;

/// 暗号操作のエラー
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    /// 鍵の長さが不正（16バイト以外）
    #[error("Invalid key length (expected 16 bytes)")]
    InvalidKeyLength,
    /// 16 進文字列のデコードに失敗
    #[error("Invalid hex encoding")]
    InvalidHex,
    /// 暗号化に失敗
    #[error("Encryption failed")]
    EncryptionFailed,
    /// 復号に失敗（MIC 検証失敗を含む）
    #[error("Decryption failed (MIC mismatch)")]
    AuthenticationFailed,
    /// 入力が MIC より短い
    #[error("Input too short")]
    TooShort,
}
