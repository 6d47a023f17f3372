//! # mesh-crypto
//!
//! Bluetooth Mesh の暗号プリミティブ実装
//!
//! ネットワーク層・上位トランスポート層が使う AES-128 ベースの処理をまとめたクレート。
//! `no_std` + `alloc` 環境（SoC / WASM を含む）で動作する。
//!
//! ## 使い方の概要
//!
//! ```text
//! NetKey ──k2──▶ NID, EncryptionKey, PrivacyKey
//!        ──k3──▶ Network ID
//! AppKey ──k4──▶ AID
//!
//! Network PDU:  AES-CCM(EncryptionKey, NetworkNonce, DST || TransportPDU) → NetMIC 32/64
//!               e(PrivacyKey, 0x0000000000 || IV Index || PrivacyRandom) → PECB
//! Upper PDU:    AES-CCM(AppKey|DevKey, App/DevNonce, AccessPayload, AAD=LabelUUID) → TransMIC 32/64
//! ```

#![no_std]
extern crate alloc;

mod cipher;
mod error;
mod kdf;
mod keys;
mod nonce;

pub use cipher::{aes_ecb, ccm_decrypt, ccm_encrypt, MicSize};
pub use error::CryptoError;
pub use kdf::{aes_cmac, k1, k2, k3, k4, s1, virtual_address, K2Output};
pub use keys::{AppKeyMaterial, NetKeyMaterial};
pub use nonce::{MeshNonce, NonceKind};

/// 32 桁の 16 進文字列を 16 バイトの鍵にデコードする
///
/// プロビジョナーや設定ファイルが出力する形式: `7dd7364cd842ad18c17c2b820c84c3d6`
pub fn decode_hex_key(key_hex: &str) -> Result<[u8; 16], CryptoError> {
    if key_hex.len() != 32 {
        return Err(CryptoError::InvalidKeyLength);
    }
    let mut key = [0u8; 16];
    hex::decode_to_slice(key_hex, &mut key).map_err(|_| CryptoError::InvalidHex)?;
    Ok(key)
}
