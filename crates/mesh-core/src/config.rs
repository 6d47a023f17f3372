//! ノード設定
//!
//! すべてのフィールドに既定値があり、JSON などで一部だけ指定できる。

use mesh_network::InterfacePolicy;
use mesh_proto::{Address, TTL_MAX};
use mesh_transport::{ReassemblerConfig, SegmenterConfig};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// `MeshContext` の設定
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// 先頭要素のユニキャストアドレス
    pub primary_address: u16,
    /// ローカル要素数
    pub element_count: u16,
    /// TTL 未指定時の既定値
    pub default_ttl: u8,
    /// Relay 機能
    pub relay_enabled: bool,
    /// リプレイキャッシュの容量（追跡する送信元数）
    pub net_msg_cache_size: usize,
    /// 同時分割送信数
    pub nb_segmentation: usize,
    /// 同時分割受信数
    pub nb_reassembly: usize,
    /// 完了済み分割受信を覚えておく数
    pub nb_segment_filter: usize,
    /// 分割送信の再送回数
    pub nb_seg_packet_retrans: u8,
    /// インターフェース登録数の上限
    pub max_interfaces: usize,
    pub seg_retrans_base_ms: u32,
    pub seg_retrans_per_hop_ms: u32,
    /// グループ・仮想アドレス宛ての再送間隔
    pub group_retrans_interval_ms: u32,
    pub ack_timer_base_ms: u32,
    pub ack_timer_per_hop_ms: u32,
    /// 分割受信の未完了タイマー
    pub incomplete_timeout_ms: u32,
    /// 広告ベアラが 1 PDU を追加で送る回数
    pub adv_transmit_count: u8,
    /// インターフェースごとの送信キュー長
    pub frame_queue_capacity: usize,
    /// 新規インターフェースの既定ポリシー
    pub interface_policy: InterfacePolicy,
}

impl Default for MeshConfig {
    fn default() -> Self {
        MeshConfig {
            primary_address: 0x0001,
            element_count: 1,
            default_ttl: 7,
            relay_enabled: true,
            net_msg_cache_size: 32,
            nb_segmentation: 2,
            nb_reassembly: 2,
            nb_segment_filter: 8,
            nb_seg_packet_retrans: 3,
            max_interfaces: 4,
            seg_retrans_base_ms: 200,
            seg_retrans_per_hop_ms: 50,
            group_retrans_interval_ms: 300,
            ack_timer_base_ms: 150,
            ack_timer_per_hop_ms: 50,
            incomplete_timeout_ms: 10_000,
            adv_transmit_count: 0,
            frame_queue_capacity: 16,
            interface_policy: InterfacePolicy::default(),
        }
    }
}

impl MeshConfig {
    /// 設定値を検証する
    ///
    /// # エラー
    /// - `ConfigError::InvalidValue`: 範囲外のフィールド名
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.element_count == 0 {
            return Err(ConfigError::InvalidValue("element_count"));
        }
        let last = self
            .primary_address
            .checked_add(self.element_count - 1)
            .ok_or(ConfigError::InvalidValue("element_count"))?;
        if !Address::from_u16(self.primary_address).is_unicast() {
            return Err(ConfigError::InvalidValue("primary_address"));
        }
        if !Address::from_u16(last).is_unicast() {
            return Err(ConfigError::InvalidValue("element_count"));
        }
        // TTL 1 は送信に使えない
        if self.default_ttl > TTL_MAX || self.default_ttl == 1 {
            return Err(ConfigError::InvalidValue("default_ttl"));
        }
        if self.net_msg_cache_size == 0 {
            return Err(ConfigError::InvalidValue("net_msg_cache_size"));
        }
        if self.nb_segmentation == 0 || self.nb_segmentation > u16::MAX as usize {
            return Err(ConfigError::InvalidValue("nb_segmentation"));
        }
        if self.nb_reassembly == 0 || self.nb_reassembly > u16::MAX as usize {
            return Err(ConfigError::InvalidValue("nb_reassembly"));
        }
        if self.max_interfaces == 0 || self.max_interfaces > u16::MAX as usize {
            return Err(ConfigError::InvalidValue("max_interfaces"));
        }
        if self.frame_queue_capacity == 0 {
            return Err(ConfigError::InvalidValue("frame_queue_capacity"));
        }
        if self.incomplete_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue("incomplete_timeout_ms"));
        }
        Ok(())
    }

    /// アドレスがローカル要素か
    pub fn is_local_element(&self, address: u16) -> bool {
        address >= self.primary_address
            && (address - self.primary_address) < self.element_count
    }

    pub(crate) fn segmenter(&self) -> SegmenterConfig {
        SegmenterConfig {
            max_contexts: self.nb_segmentation,
            nb_retrans: self.nb_seg_packet_retrans,
            retrans_base_ms: self.seg_retrans_base_ms,
            retrans_per_hop_ms: self.seg_retrans_per_hop_ms,
            group_interval_ms: self.group_retrans_interval_ms,
        }
    }

    pub(crate) fn reassembler(&self) -> ReassemblerConfig {
        ReassemblerConfig {
            max_contexts: self.nb_reassembly,
            filter_len: self.nb_segment_filter,
            ack_base_ms: self.ack_timer_base_ms,
            ack_per_hop_ms: self.ack_timer_per_hop_ms,
            incomplete_timeout_ms: self.incomplete_timeout_ms,
            default_ttl: self.default_ttl,
        }
    }
}
