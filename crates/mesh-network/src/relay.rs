//! リレー判定と転送
//!
//! リプレイキャッシュを通過した PDU だけがここに来る（重複 PDU のリレーは
//! キャッシュの段階で止まる）。転送時は SEQ / SRC / 鍵をそのまま使い、
//! TTL だけを 1 減らして再符号化する。

use mesh_crypto::NetKeyMaterial;
use tracing::trace;

use crate::error::NetworkError;
use crate::interface::{InterfaceId, InterfaceRegistry};
use crate::pdu::{encode, NetworkPdu};

/// リレーしない理由
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Relay 機能が無効
    Disabled,
    /// TTL が 0 または 1
    TtlExpired,
    /// 自ノードのユニキャスト要素宛て
    LocalDestination,
}

/// リレー判定の結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayDecision {
    /// 指定の TTL で転送する
    Forward { ttl: u8 },
    Skip(SkipReason),
}

/// 受信 PDU をリレーするか判定する
pub fn relay_decision(pdu: &NetworkPdu, relay_enabled: bool, dst_is_local_unicast: bool) -> RelayDecision {
    if !relay_enabled {
        return RelayDecision::Skip(SkipReason::Disabled);
    }
    if dst_is_local_unicast {
        return RelayDecision::Skip(SkipReason::LocalDestination);
    }
    if pdu.ttl < 2 {
        return RelayDecision::Skip(SkipReason::TtlExpired);
    }
    RelayDecision::Forward { ttl: pdu.ttl - 1 }
}

/// PDU を TTL を減らして再符号化し、受信元以外の全インターフェースに送る
///
/// # 戻り値
/// 送信できたインターフェース数
///
/// # エラー
/// - `NetworkError::InvalidField` / `NetworkError::Crypto`: 再符号化に失敗
pub fn relay(
    registry: &mut InterfaceRegistry,
    key: &NetKeyMaterial,
    iv_index: u32,
    pdu: &NetworkPdu,
    ttl: u8,
    received_on: InterfaceId,
) -> Result<usize, NetworkError> {
    let mut forwarded = pdu.clone();
    forwarded.ttl = ttl;
    let frame = encode(key, iv_index, &forwarded)?;
    let sent = registry.transmit(Some(received_on), &frame, ttl);
    trace!(
        src = %format_args!("{:04x}", pdu.src),
        dst = %format_args!("{:04x}", pdu.dst),
        seq = pdu.seq,
        ttl,
        interfaces = sent,
        "relayed"
    );
    Ok(sent)
}
