//! ネットワーク鍵・アプリケーション鍵の導出済みマテリアル

use crate::kdf::{k2, k3, k4};

/// Network Key から導出したマテリアル
///
/// PDU ごとに複製せず、鍵ストアが保持してインデックスで参照させる。
#[derive(Clone, PartialEq, Eq)]
pub struct NetKeyMaterial {
    pub key: [u8; 16],
    /// 7 ビットのネットワーク識別子（平文ヘッダーに載る）
    pub nid: u8,
    pub encryption_key: [u8; 16],
    pub privacy_key: [u8; 16],
    pub network_id: [u8; 8],
}

impl NetKeyMaterial {
    /// マスタークレデンシャル（k2 の P = 0x00）で導出する
    pub fn derive(key: [u8; 16]) -> Self {
        let k2 = k2(&key, &[0x00]);
        NetKeyMaterial {
            key,
            nid: k2.nid,
            encryption_key: k2.encryption_key,
            privacy_key: k2.privacy_key,
            network_id: k3(&key),
        }
    }
}

// 鍵そのものをログに出さない
impl core::fmt::Debug for NetKeyMaterial {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("NetKeyMaterial")
            .field("nid", &self.nid)
            .field("network_id", &self.network_id)
            .finish_non_exhaustive()
    }
}

/// Application Key と AID
#[derive(Clone, PartialEq, Eq)]
pub struct AppKeyMaterial {
    pub key: [u8; 16],
    /// 6 ビットの Application Key 識別子
    pub aid: u8,
}

impl AppKeyMaterial {
    pub fn derive(key: [u8; 16]) -> Self {
        AppKeyMaterial { key, aid: k4(&key) }
    }
}

impl core::fmt::Debug for AppKeyMaterial {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AppKeyMaterial")
            .field("aid", &self.aid)
            .finish_non_exhaustive()
    }
}
