//! Mesh の鍵導出関数
//!
//! すべて AES-CMAC（AES-128）の上に組み立てる。
//!
//! ```text
//! s1(M)       = AES-CMAC_ZERO(M)
//! k1(N, S, P) = AES-CMAC_T(P),  T = AES-CMAC_S(N)
//! k2(N, P)    = NID || EncryptionKey || PrivacyKey
//! k3(N)       = Network ID（64 ビット）
//! k4(N)       = AID（6 ビット）
//! ```

use aead::generic_array::GenericArray;
use aes::Aes128;
use cmac::{Cmac, Mac};

/// AES-CMAC を計算する。`parts` は連結したものとして扱う
pub fn aes_cmac(key: &[u8; 16], parts: &[&[u8]]) -> [u8; 16] {
    let mut mac = <Cmac<Aes128> as Mac>::new(GenericArray::from_slice(key));
    for part in parts {
        mac.update(part);
    }
    let tag = mac.finalize().into_bytes();
    let mut out = [0u8; 16];
    out.copy_from_slice(&tag);
    out
}

/// s1: ソルト生成関数
pub fn s1(m: &[u8]) -> [u8; 16] {
    aes_cmac(&[0u8; 16], &[m])
}

/// k1: 汎用の鍵導出関数
pub fn k1(n: &[u8], salt: &[u8; 16], p: &[u8]) -> [u8; 16] {
    let t = aes_cmac(salt, &[n]);
    aes_cmac(&t, &[p])
}

/// k2 の出力
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct K2Output {
    /// 7 ビットのネットワーク識別子
    pub nid: u8,
    pub encryption_key: [u8; 16],
    pub privacy_key: [u8; 16],
}

/// k2: NID・EncryptionKey・PrivacyKey の導出
///
/// マスタークレデンシャルでは `p = [0x00]`。
pub fn k2(n: &[u8; 16], p: &[u8]) -> K2Output {
    let salt = s1(b"smk2");
    let t = aes_cmac(&salt, &[&n[..]]);
    let t1 = aes_cmac(&t, &[p, &[0x01u8][..]]);
    let t2 = aes_cmac(&t, &[&t1[..], p, &[0x02u8][..]]);
    let t3 = aes_cmac(&t, &[&t2[..], p, &[0x03u8][..]]);
    K2Output {
        nid: t1[15] & 0x7F,
        encryption_key: t2,
        privacy_key: t3,
    }
}

/// k3: 64 ビットの Network ID を導出する
pub fn k3(n: &[u8; 16]) -> [u8; 8] {
    let salt = s1(b"smk3");
    let t = aes_cmac(&salt, &[&n[..]]);
    let full = aes_cmac(&t, &[&b"id64"[..], &[0x01u8][..]]);
    let mut out = [0u8; 8];
    out.copy_from_slice(&full[8..16]);
    out
}

/// k4: 6 ビットの AID を導出する
pub fn k4(n: &[u8; 16]) -> u8 {
    let salt = s1(b"smk4");
    let t = aes_cmac(&salt, &[&n[..]]);
    let full = aes_cmac(&t, &[&b"id6"[..], &[0x01u8][..]]);
    full[15] & 0x3F
}

/// Label UUID から仮想アドレス（0x8000..0xBFFF）を求める
pub fn virtual_address(label_uuid: &[u8; 16]) -> u16 {
    let salt = s1(b"vtad");
    let hash = aes_cmac(&salt, &[&label_uuid[..]]);
    let low = u16::from_be_bytes([hash[14], hash[15]]);
    0x8000 | (low & 0x3FFF)
}
