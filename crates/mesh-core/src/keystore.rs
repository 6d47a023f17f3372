//! 鍵ストア
//!
//! ネットワーク層と上位トランスポート層は鍵をインデックスで参照するだけで、
//! PDU ごとに鍵を複製しない。鍵更新（Key Refresh）中は旧鍵と新鍵の両方を持ち、
//! 受信はどちらでも受け付ける。送信はフェーズ 2 から新鍵に切り替わる。

use alloc::vec::Vec;

use mesh_crypto::{AppKeyMaterial, NetKeyMaterial};
use mesh_proto::{AppKeyIndex, NetKeyIndex, KEY_INDEX_MAX};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ConfigError;

/// 鍵更新のフェーズ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum KeyRefreshPhase {
    #[default]
    Normal,
    /// 新鍵を配布中（送信は旧鍵、受信は両方）
    Phase1,
    /// 新鍵で送信（受信は両方）
    Phase2,
}

/// Network Key の世代付き参照
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NetKeyRef {
    pub index: NetKeyIndex,
    /// 鍵更新中の新しい鍵
    pub new: bool,
}

/// ネットワーク層・トランスポート層が使う鍵の問い合わせ口
pub trait KeyStore {
    /// NID が一致する Network Key（鍵更新中は旧・新の両方）
    fn net_keys_by_nid(&self, nid: u8) -> Vec<(NetKeyRef, &NetKeyMaterial)>;

    /// 参照が指す Network Key
    fn net_key(&self, key: NetKeyRef) -> Option<&NetKeyMaterial>;

    /// 送信に使う Network Key（フェーズに応じて旧か新）
    fn tx_net_key(&self, index: NetKeyIndex) -> Option<&NetKeyMaterial>;

    /// Network Key に結び付いた、AID が一致する Application Key
    fn app_keys_by_aid(&self, net_key: NetKeyIndex, aid: u8) -> Vec<(AppKeyIndex, &AppKeyMaterial)>;

    /// 送信に使う Application Key と、結び付いた Network Key のインデックス
    fn tx_app_key(&self, index: AppKeyIndex) -> Option<(NetKeyIndex, &AppKeyMaterial)>;

    /// ノードの Device Key
    fn device_key(&self, address: u16) -> Option<&[u8; 16]>;
}

struct NetKeyEntry {
    index: NetKeyIndex,
    old: NetKeyMaterial,
    new: Option<NetKeyMaterial>,
    phase: KeyRefreshPhase,
}

impl NetKeyEntry {
    fn tx(&self) -> &NetKeyMaterial {
        match (&self.new, self.phase) {
            (Some(new), KeyRefreshPhase::Phase2) => new,
            _ => &self.old,
        }
    }
}

struct AppKeyEntry {
    index: AppKeyIndex,
    net_key: NetKeyIndex,
    old: AppKeyMaterial,
    new: Option<AppKeyMaterial>,
}

/// メモリ上の鍵ストア
#[derive(Default)]
pub struct MemoryKeyStore {
    net_keys: Vec<NetKeyEntry>,
    app_keys: Vec<AppKeyEntry>,
    device_keys: Vec<(u16, [u8; 16])>,
}

fn check_index(index: u16) -> Result<(), ConfigError> {
    if index > KEY_INDEX_MAX {
        Err(ConfigError::KeyIndexOutOfRange(index))
    } else {
        Ok(())
    }
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Network Key を登録する
    pub fn add_net_key(&mut self, index: NetKeyIndex, key: [u8; 16]) -> Result<(), ConfigError> {
        check_index(index)?;
        if self.net_entry(index).is_some() {
            return Err(ConfigError::DuplicateKey(index));
        }
        self.net_keys.push(NetKeyEntry {
            index,
            old: NetKeyMaterial::derive(key),
            new: None,
            phase: KeyRefreshPhase::Normal,
        });
        Ok(())
    }

    /// 鍵更新を開始する（フェーズ 1 に入る）
    pub fn update_net_key(&mut self, index: NetKeyIndex, key: [u8; 16]) -> Result<(), ConfigError> {
        let entry = self
            .net_entry_mut(index)
            .ok_or(ConfigError::UnknownNetKey(index))?;
        entry.new = Some(NetKeyMaterial::derive(key));
        entry.phase = KeyRefreshPhase::Phase1;
        info!(index, "key refresh phase 1");
        Ok(())
    }

    /// 鍵更新のフェーズを進める
    ///
    /// `Normal` に戻すと新鍵が旧鍵を置き換え、結び付いた Application Key も
    /// 同じく切り替わる。
    pub fn set_phase(&mut self, index: NetKeyIndex, phase: KeyRefreshPhase) -> Result<(), ConfigError> {
        let entry = self
            .net_entry_mut(index)
            .ok_or(ConfigError::UnknownNetKey(index))?;
        if entry.new.is_none() && phase != KeyRefreshPhase::Normal {
            return Err(ConfigError::InvalidValue("phase"));
        }
        entry.phase = phase;
        if phase == KeyRefreshPhase::Normal {
            if let Some(new) = entry.new.take() {
                entry.old = new;
            }
            for app in self.app_keys.iter_mut().filter(|a| a.net_key == index) {
                if let Some(new) = app.new.take() {
                    app.old = new;
                }
            }
        }
        info!(index, ?phase, "key refresh phase changed");
        Ok(())
    }

    pub fn phase(&self, index: NetKeyIndex) -> Option<KeyRefreshPhase> {
        self.net_entry(index).map(|e| e.phase)
    }

    /// Application Key を登録して Network Key に結び付ける
    pub fn add_app_key(
        &mut self,
        index: AppKeyIndex,
        net_key: NetKeyIndex,
        key: [u8; 16],
    ) -> Result<(), ConfigError> {
        check_index(index)?;
        if self.net_entry(net_key).is_none() {
            return Err(ConfigError::UnknownNetKey(net_key));
        }
        if self.app_keys.iter().any(|a| a.index == index) {
            return Err(ConfigError::DuplicateKey(index));
        }
        self.app_keys.push(AppKeyEntry {
            index,
            net_key,
            old: AppKeyMaterial::derive(key),
            new: None,
        });
        Ok(())
    }

    /// 鍵更新中に Application Key の新しい値を登録する
    pub fn update_app_key(&mut self, index: AppKeyIndex, key: [u8; 16]) -> Result<(), ConfigError> {
        let app = self
            .app_keys
            .iter_mut()
            .find(|a| a.index == index)
            .ok_or(ConfigError::UnknownAppKey(index))?;
        app.new = Some(AppKeyMaterial::derive(key));
        Ok(())
    }

    /// Device Key を登録する（同じアドレスなら上書き）
    pub fn add_device_key(&mut self, address: u16, key: [u8; 16]) {
        match self.device_keys.iter_mut().find(|(a, _)| *a == address) {
            Some(entry) => entry.1 = key,
            None => self.device_keys.push((address, key)),
        }
    }

    pub fn remove_net_key(&mut self, index: NetKeyIndex) -> bool {
        let before = self.net_keys.len();
        self.net_keys.retain(|e| e.index != index);
        self.app_keys.retain(|a| a.net_key != index);
        self.net_keys.len() != before
    }

    pub fn remove_app_key(&mut self, index: AppKeyIndex) -> bool {
        let before = self.app_keys.len();
        self.app_keys.retain(|a| a.index != index);
        self.app_keys.len() != before
    }

    fn net_entry(&self, index: NetKeyIndex) -> Option<&NetKeyEntry> {
        self.net_keys.iter().find(|e| e.index == index)
    }

    fn net_entry_mut(&mut self, index: NetKeyIndex) -> Option<&mut NetKeyEntry> {
        self.net_keys.iter_mut().find(|e| e.index == index)
    }
}

impl KeyStore for MemoryKeyStore {
    fn net_keys_by_nid(&self, nid: u8) -> Vec<(NetKeyRef, &NetKeyMaterial)> {
        let mut out = Vec::new();
        for entry in &self.net_keys {
            if entry.old.nid == nid {
                out.push((
                    NetKeyRef {
                        index: entry.index,
                        new: false,
                    },
                    &entry.old,
                ));
            }
            if let Some(new) = entry.new.as_ref().filter(|n| n.nid == nid) {
                out.push((
                    NetKeyRef {
                        index: entry.index,
                        new: true,
                    },
                    new,
                ));
            }
        }
        out
    }

    fn net_key(&self, key: NetKeyRef) -> Option<&NetKeyMaterial> {
        let entry = self.net_entry(key.index)?;
        if key.new {
            entry.new.as_ref()
        } else {
            Some(&entry.old)
        }
    }

    fn tx_net_key(&self, index: NetKeyIndex) -> Option<&NetKeyMaterial> {
        self.net_entry(index).map(NetKeyEntry::tx)
    }

    fn app_keys_by_aid(&self, net_key: NetKeyIndex, aid: u8) -> Vec<(AppKeyIndex, &AppKeyMaterial)> {
        let mut out = Vec::new();
        for app in self.app_keys.iter().filter(|a| a.net_key == net_key) {
            if app.old.aid == aid {
                out.push((app.index, &app.old));
            }
            if let Some(new) = app.new.as_ref().filter(|n| n.aid == aid) {
                out.push((app.index, new));
            }
        }
        out
    }

    fn tx_app_key(&self, index: AppKeyIndex) -> Option<(NetKeyIndex, &AppKeyMaterial)> {
        let app = self.app_keys.iter().find(|a| a.index == index)?;
        let phase = self.net_entry(app.net_key)?.phase;
        let material = match (&app.new, phase) {
            (Some(new), KeyRefreshPhase::Phase2) => new,
            _ => &app.old,
        };
        Some((app.net_key, material))
    }

    fn device_key(&self, address: u16) -> Option<&[u8; 16]> {
        self.device_keys
            .iter()
            .find(|(a, _)| *a == address)
            .map(|(_, k)| k)
    }
}
