//! Network PDU の符号化と復号
//!
//! ## Wire Format
//! ```text
//! [IVI:1|NID:7]                         平文
//! [CTL:1|TTL:7][SEQ:24 BE][SRC:16 BE]    難読化（PECB との XOR）
//! [DST:16 BE][TransportPDU:1..16]        AES-CCM で暗号化
//! [NetMIC: 4 (CTL=0) / 8 (CTL=1)]
//! ```
//!
//! 難読化:
//! ```text
//! PrivacyRandom = (EncDST || EncTransportPDU || NetMIC)[0..7]
//! PECB          = e(PrivacyKey, 0x0000000000 || IV Index || PrivacyRandom)
//! ```
//! 復号側は難読化の解除自体に鍵が必要なため、候補鍵ごとに
//! 「ヘッダー解除 → NetMIC 検証」を試す。

use alloc::vec::Vec;

use mesh_crypto::{aes_ecb, ccm_decrypt, ccm_encrypt, MeshNonce, MicSize, NetKeyMaterial};
use mesh_proto::{Address, IvIndex, SEQ_MAX, TTL_MAX};

use crate::error::NetworkError;

/// 難読化されるヘッダー部（CTL|TTL, SEQ, SRC）の長さ
const OBFUSCATED_LEN: usize = 6;
/// 平文ヘッダー + 難読化ヘッダー
const HEADER_LEN: usize = 1 + OBFUSCATED_LEN;

/// アクセスメッセージの TransportPDU 最大長
pub const MAX_ACCESS_TRANSPORT_LEN: usize = 16;
/// 制御メッセージの TransportPDU 最大長
pub const MAX_CONTROL_TRANSPORT_LEN: usize = 12;
/// Network PDU の最小長（TransportPDU 1 バイト + NetMIC 32）
pub const MIN_PDU_LEN: usize = HEADER_LEN + 2 + 1 + 4;
/// Network PDU の最大長
pub const MAX_PDU_LEN: usize = HEADER_LEN + 2 + MAX_ACCESS_TRANSPORT_LEN + 4;

/// 復号済み（または送信前）の Network PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkPdu {
    /// IV Index の LSB（送信時は IV Index から決まる）
    pub ivi: bool,
    /// 鍵の NID（送信時は鍵から決まる）
    pub nid: u8,
    /// 制御メッセージなら true
    pub ctl: bool,
    pub ttl: u8,
    /// 24 ビット SEQ
    pub seq: u32,
    pub src: u16,
    pub dst: u16,
    pub transport_pdu: Vec<u8>,
}

impl NetworkPdu {
    /// 送信用 PDU を組み立てる（`ivi` / `nid` は符号化時に埋まる）
    pub fn new(ctl: bool, ttl: u8, seq: u32, src: u16, dst: u16, transport_pdu: Vec<u8>) -> Self {
        NetworkPdu {
            ivi: false,
            nid: 0,
            ctl,
            ttl,
            seq,
            src,
            dst,
            transport_pdu,
        }
    }

    /// NetMIC の長さ
    pub fn mic_size(&self) -> MicSize {
        if self.ctl {
            MicSize::Large
        } else {
            MicSize::Small
        }
    }

    fn max_transport_len(&self) -> usize {
        if self.ctl {
            MAX_CONTROL_TRANSPORT_LEN
        } else {
            MAX_ACCESS_TRANSPORT_LEN
        }
    }

    fn ctl_ttl(&self) -> u8 {
        ((self.ctl as u8) << 7) | (self.ttl & TTL_MAX)
    }

    fn validate(&self) -> Result<(), NetworkError> {
        if self.ttl > TTL_MAX {
            return Err(NetworkError::InvalidField("ttl"));
        }
        if self.seq > SEQ_MAX {
            return Err(NetworkError::InvalidField("seq"));
        }
        if !Address::from_u16(self.src).is_unicast() {
            return Err(NetworkError::InvalidField("src"));
        }
        if self.dst == 0 {
            return Err(NetworkError::InvalidField("dst"));
        }
        if self.transport_pdu.is_empty() || self.transport_pdu.len() > self.max_transport_len() {
            return Err(NetworkError::InvalidField("transport_pdu"));
        }
        Ok(())
    }
}

/// 復号結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedPdu<H> {
    pub pdu: NetworkPdu,
    /// 検証に成功した候補鍵のハンドル
    pub key: H,
    /// IVI から選んだ IV Index
    pub iv_index: u32,
}

/// PECB を計算する
fn pecb(privacy_key: &[u8; 16], iv_index: u32, privacy_random: &[u8]) -> [u8; 16] {
    let mut block = [0u8; 16];
    block[5..9].copy_from_slice(&iv_index.to_be_bytes());
    block[9..16].copy_from_slice(&privacy_random[..7]);
    aes_ecb(privacy_key, &block)
}

/// Network PDU を符号化する
///
/// # 引数
/// - `key`: 送信に使う Network Key のマテリアル（NID もここから決まる）
/// - `iv_index`: 送信用 IV Index（`IvIndex::tx_index()`）
/// - `pdu`: 平文のフィールド
///
/// # エラー
/// - `NetworkError::InvalidField`: TTL / SEQ / SRC / DST / TransportPDU 長が範囲外
pub fn encode(key: &NetKeyMaterial, iv_index: u32, pdu: &NetworkPdu) -> Result<Vec<u8>, NetworkError> {
    pdu.validate()?;

    let ctl_ttl = pdu.ctl_ttl();
    let nonce = MeshNonce::network(ctl_ttl, pdu.seq, pdu.src, iv_index);

    let mut plaintext = Vec::with_capacity(2 + pdu.transport_pdu.len());
    plaintext.extend_from_slice(&pdu.dst.to_be_bytes());
    plaintext.extend_from_slice(&pdu.transport_pdu);
    let encrypted = ccm_encrypt(&key.encryption_key, &nonce, &[], &plaintext, pdu.mic_size())?;

    let seq = pdu.seq.to_be_bytes();
    let src = pdu.src.to_be_bytes();
    let mut header = [ctl_ttl, seq[1], seq[2], seq[3], src[0], src[1]];
    let pecb = pecb(&key.privacy_key, iv_index, &encrypted);
    for (h, p) in header.iter_mut().zip(pecb.iter()) {
        *h ^= *p;
    }

    let mut out = Vec::with_capacity(HEADER_LEN + encrypted.len());
    out.push((((iv_index & 1) as u8) << 7) | (key.nid & 0x7F));
    out.extend_from_slice(&header);
    out.extend_from_slice(&encrypted);
    Ok(out)
}

/// Network PDU を復号する
///
/// NID が一致する候補鍵を順に試し、最初に NetMIC を検証できた鍵の結果を返す。
///
/// # エラー
/// - `NetworkError::MalformedPdu`: 長さが範囲外、または検証後のフィールドが不正
/// - `NetworkError::AuthenticationFailed`: どの候補鍵でも検証できない
pub fn decode<'a, H: Copy>(
    candidates: impl IntoIterator<Item = (H, &'a NetKeyMaterial)>,
    iv: IvIndex,
    bytes: &[u8],
) -> Result<DecodedPdu<H>, NetworkError> {
    if bytes.len() < MIN_PDU_LEN || bytes.len() > MAX_PDU_LEN {
        return Err(NetworkError::MalformedPdu);
    }

    let ivi = bytes[0] & 0x80 != 0;
    let nid = bytes[0] & 0x7F;
    let iv_index = iv.rx_index(ivi);
    let encrypted = &bytes[HEADER_LEN..];

    for (handle, key) in candidates {
        if key.nid != nid {
            continue;
        }

        let pecb = pecb(&key.privacy_key, iv_index, encrypted);
        let mut header = [0u8; OBFUSCATED_LEN];
        for (i, h) in header.iter_mut().enumerate() {
            *h = bytes[1 + i] ^ pecb[i];
        }

        let ctl = header[0] & 0x80 != 0;
        let ttl = header[0] & TTL_MAX;
        let seq = u32::from_be_bytes([0, header[1], header[2], header[3]]);
        let src = u16::from_be_bytes([header[4], header[5]]);
        let mic = if ctl { MicSize::Large } else { MicSize::Small };

        // DST(2) + TransportPDU(1 以上) + NetMIC が入らない長さはこの鍵では解釈できない
        if encrypted.len() < 2 + 1 + mic.len() {
            continue;
        }

        let nonce = MeshNonce::network(header[0], seq, src, iv_index);
        let plaintext = match ccm_decrypt(&key.encryption_key, &nonce, &[], encrypted, mic) {
            Ok(p) => p,
            Err(_) => continue,
        };

        let dst = u16::from_be_bytes([plaintext[0], plaintext[1]]);
        if !Address::from_u16(src).is_unicast() || dst == 0 {
            return Err(NetworkError::MalformedPdu);
        }

        return Ok(DecodedPdu {
            pdu: NetworkPdu {
                ivi,
                nid,
                ctl,
                ttl,
                seq,
                src,
                dst,
                transport_pdu: plaintext[2..].to_vec(),
            },
            key: handle,
            iv_index,
        });
    }

    Err(NetworkError::AuthenticationFailed)
}
