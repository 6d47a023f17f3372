//! 上位（アクセス層・ホスト）へ通知するイベントと統計

use alloc::vec::Vec;

use mesh_proto::{AppKeyIndex, NetKeyIndex, Opcode};
use mesh_transport::SendFailure;
use serde::{Deserialize, Serialize};

/// `send_access` が返す送信ハンドル
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SendHandle(pub u32);

/// 受信したアクセスメッセージ
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccessMessage {
    pub src: u16,
    pub dst: u16,
    pub opcode: Opcode,
    pub params: Vec<u8>,
    pub rssi: Option<i8>,
    /// 受信時の TTL
    pub ttl: u8,
    pub net_key_index: NetKeyIndex,
    /// `None` なら Device Key で暗号化されていた
    pub app_key_index: Option<AppKeyIndex>,
    /// 仮想アドレス宛てのときの Label UUID
    pub label: Option<[u8; 16]>,
}

/// 受信した制御メッセージ（Segment Ack 以外）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ControlMessage {
    pub src: u16,
    pub dst: u16,
    pub opcode: u8,
    pub params: Vec<u8>,
    pub rssi: Option<i8>,
    pub ttl: u8,
    pub net_key_index: NetKeyIndex,
}

/// `take_events` で取り出すイベント
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum MeshEvent {
    AccessReceived(AccessMessage),
    ControlReceived(ControlMessage),
    SendComplete {
        handle: SendHandle,
        result: Result<(), SendFailure>,
    },
}

/// 受信・送信の統計
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MeshStats {
    pub rx_pdus: u64,
    pub relayed: u64,
    pub replay_drops: u64,
    pub auth_failures: u64,
    pub malformed_drops: u64,
    /// 自分が送った PDU がリレーで戻ってきた
    pub own_src_drops: u64,
    pub tx_pdus: u64,
    pub segments_sent: u64,
    pub segments_retransmitted: u64,
    pub acks_sent: u64,
    pub delivered: u64,
    pub sends_completed: u64,
    pub send_failures: u64,
}
