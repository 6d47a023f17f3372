//! AES-128 ブロック暗号の利用形態
//!
//! - AES-CCM: NetMIC / TransMIC の付与と検証（MIC 長 4 or 8 バイト、nonce 13 バイト）
//! - AES-ECB（単一ブロック）: ヘッダー難読化の PECB 生成

use alloc::vec::Vec;

use aead::generic_array::GenericArray;
use aead::{Aead, KeyInit, Payload};
use aes::cipher::BlockEncrypt;
use aes::Aes128;
use ccm::consts::{U13, U4, U8};
use ccm::Ccm;

use crate::error::CryptoError;
use crate::nonce::MeshNonce;

/// 32 ビット MIC の AES-CCM
type MeshCcm32 = Ccm<Aes128, U4, U13>;
/// 64 ビット MIC の AES-CCM
type MeshCcm64 = Ccm<Aes128, U8, U13>;

/// MIC（NetMIC / TransMIC）の長さ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MicSize {
    /// 32 ビット（アクセスメッセージの NetMIC、既定の TransMIC）
    Small,
    /// 64 ビット（制御メッセージの NetMIC、SZMIC=1 の TransMIC）
    Large,
}

impl MicSize {
    pub fn len(&self) -> usize {
        match self {
            MicSize::Small => 4,
            MicSize::Large => 8,
        }
    }
}

/// AES-CCM で暗号化し、`暗号文 || MIC` を返す
pub fn ccm_encrypt(
    key: &[u8; 16],
    nonce: &MeshNonce,
    aad: &[u8],
    plaintext: &[u8],
    mic: MicSize,
) -> Result<Vec<u8>, CryptoError> {
    let nonce = GenericArray::from_slice(nonce.as_bytes());
    let payload = Payload {
        msg: plaintext,
        aad,
    };
    let result = match mic {
        MicSize::Small => MeshCcm32::new(GenericArray::from_slice(key)).encrypt(nonce, payload),
        MicSize::Large => MeshCcm64::new(GenericArray::from_slice(key)).encrypt(nonce, payload),
    };
    result.map_err(|_| CryptoError::EncryptionFailed)
}

/// `暗号文 || MIC` を検証・復号して平文を返す
///
/// # エラー
/// - `CryptoError::TooShort`: MIC 長に満たない
/// - `CryptoError::AuthenticationFailed`: MIC 不一致
pub fn ccm_decrypt(
    key: &[u8; 16],
    nonce: &MeshNonce,
    aad: &[u8],
    data: &[u8],
    mic: MicSize,
) -> Result<Vec<u8>, CryptoError> {
    if data.len() < mic.len() {
        return Err(CryptoError::TooShort);
    }
    let nonce = GenericArray::from_slice(nonce.as_bytes());
    let payload = Payload { msg: data, aad };
    let result = match mic {
        MicSize::Small => MeshCcm32::new(GenericArray::from_slice(key)).decrypt(nonce, payload),
        MicSize::Large => MeshCcm64::new(GenericArray::from_slice(key)).decrypt(nonce, payload),
    };
    result.map_err(|_| CryptoError::AuthenticationFailed)
}

/// AES-128 で 1 ブロックを暗号化する（e(key, plaintext)）
pub fn aes_ecb(key: &[u8; 16], block: &[u8; 16]) -> [u8; 16] {
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut buf: aes::Block = GenericArray::clone_from_slice(block);
    cipher.encrypt_block(&mut buf);
    let mut out = [0u8; 16];
    out.copy_from_slice(&buf);
    out
}
