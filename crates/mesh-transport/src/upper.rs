//! 上位トランスポートの暗号化と復号
//!
//! アクセスペイロードを Application Key か Device Key で AES-CCM し、
//! TransMIC（32 / 64 ビット）を付ける。Nonce の SEQ は SeqAuth。
//! 宛先が仮想アドレスのときは Label UUID を AAD に入れる。

use alloc::vec::Vec;

use mesh_crypto::{ccm_decrypt, ccm_encrypt, virtual_address, AppKeyMaterial, MeshNonce, MicSize};
use mesh_proto::Address;

use crate::error::TransportError;

/// 上位トランスポートの暗号鍵
#[derive(Debug, Clone, Copy)]
pub enum AccessKey<'a> {
    App(&'a AppKeyMaterial),
    Device(&'a [u8; 16]),
}

impl AccessKey<'_> {
    /// 下位トランスポートヘッダーの AKF
    pub fn akf(&self) -> bool {
        matches!(self, AccessKey::App(_))
    }

    /// 下位トランスポートヘッダーの AID（Device Key は 0）
    pub fn aid(&self) -> u8 {
        match self {
            AccessKey::App(k) => k.aid,
            AccessKey::Device(_) => 0,
        }
    }

    fn bytes(&self) -> &[u8; 16] {
        match self {
            AccessKey::App(k) => &k.key,
            AccessKey::Device(k) => k,
        }
    }

    fn nonce(&self, params: &UpperParams) -> MeshNonce {
        let aszmic = params.mic == MicSize::Large;
        match self {
            AccessKey::App(_) => {
                MeshNonce::application(aszmic, params.seq_auth, params.src, params.dst, params.iv_index)
            }
            AccessKey::Device(_) => {
                MeshNonce::device(aszmic, params.seq_auth, params.src, params.dst, params.iv_index)
            }
        }
    }
}

/// Nonce と MIC 長を決めるパラメータ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpperParams {
    /// SeqAuth の下位 24 ビット（非分割なら SEQ そのもの）
    pub seq_auth: u32,
    pub src: u16,
    pub dst: u16,
    pub iv_index: u32,
    pub mic: MicSize,
}

/// アクセスペイロードを暗号化し、`暗号文 || TransMIC` を返す
pub fn encrypt(
    key: AccessKey<'_>,
    params: &UpperParams,
    label: Option<&[u8; 16]>,
    access_payload: &[u8],
) -> Result<Vec<u8>, TransportError> {
    let aad: &[u8] = label.map(|l| &l[..]).unwrap_or(&[]);
    let nonce = key.nonce(params);
    Ok(ccm_encrypt(key.bytes(), &nonce, aad, access_payload, params.mic)?)
}

/// `暗号文 || TransMIC` を検証・復号する
///
/// # エラー
/// - `TransportError::AuthenticationFailed`: TransMIC 不一致
pub fn decrypt(
    key: AccessKey<'_>,
    params: &UpperParams,
    label: Option<&[u8; 16]>,
    upper_pdu: &[u8],
) -> Result<Vec<u8>, TransportError> {
    let aad: &[u8] = label.map(|l| &l[..]).unwrap_or(&[]);
    let nonce = key.nonce(params);
    ccm_decrypt(key.bytes(), &nonce, aad, upper_pdu, params.mic)
        .map_err(|_| TransportError::AuthenticationFailed)
}

/// 復号に成功した鍵とラベル
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decrypted<H> {
    pub key: H,
    /// 仮想アドレス宛てのとき、検証に使った Label UUID
    pub label: Option<[u8; 16]>,
    pub access_payload: Vec<u8>,
}

/// 候補鍵（と仮想アドレスなら候補ラベル）を順に試して復号する
///
/// 仮想アドレス宛てのときは、ハッシュが宛先と一致するラベルだけを試す。
///
/// # エラー
/// - `TransportError::AuthenticationFailed`: どの組み合わせでも検証できない
pub fn decrypt_with_candidates<'a, H: Copy>(
    keys: impl IntoIterator<Item = (H, AccessKey<'a>)>,
    labels: &[[u8; 16]],
    params: &UpperParams,
    upper_pdu: &[u8],
) -> Result<Decrypted<H>, TransportError> {
    let virtual_dst = Address::from_u16(params.dst).is_virtual();
    let matching: Vec<&[u8; 16]> = if virtual_dst {
        labels
            .iter()
            .filter(|l| virtual_address(l) == params.dst)
            .collect()
    } else {
        Vec::new()
    };
    if virtual_dst && matching.is_empty() {
        return Err(TransportError::AuthenticationFailed);
    }

    for (handle, key) in keys {
        if virtual_dst {
            for label in &matching {
                if let Ok(access_payload) = decrypt(key, params, Some(*label), upper_pdu) {
                    return Ok(Decrypted {
                        key: handle,
                        label: Some(**label),
                        access_payload,
                    });
                }
            }
        } else if let Ok(access_payload) = decrypt(key, params, None, upper_pdu) {
            return Ok(Decrypted {
                key: handle,
                label: None,
                access_payload,
            });
        }
    }
    Err(TransportError::AuthenticationFailed)
}
