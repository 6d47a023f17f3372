//! ネットワークインターフェースレジストリ
//!
//! ベアラが開かれるたびに `NetworkInterface` を登録し、`InterfaceId`
//! （世代付きハンドル）で参照する。リレーや送信はハンドル経由で参照するだけで、
//! ベアラを所有するのはこのレジストリだけ。

use alloc::boxed::Box;
use alloc::vec::Vec;

use mesh_bearer::{Bearer, BearerKind, QueueStats};
use mesh_proto::{SlotHandle, SlotPool};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::NetworkError;

/// インターフェースの識別子
pub type InterfaceId = SlotHandle;

/// 送受信の方向ポリシー
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Direction {
    #[default]
    Both,
    /// 受信のみ（送信もリレーもしない）
    RxOnly,
    /// 送信のみ（受信 PDU は破棄）
    TxOnly,
}

/// インターフェースごとのポリシー
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InterfacePolicy {
    pub direction: Direction,
    /// この値未満の TTL を持つ PDU はこのインターフェースに送らない
    pub ttl_floor: u8,
}

impl InterfacePolicy {
    fn allows_rx(&self) -> bool {
        self.direction != Direction::TxOnly
    }

    fn allows_tx(&self, ttl: u8) -> bool {
        self.direction != Direction::RxOnly && ttl >= self.ttl_floor
    }
}

/// インターフェースごとの統計
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InterfaceCounters {
    pub rx_pdus: u64,
    pub tx_pdus: u64,
    pub tx_errors: u64,
}

/// 登録済みのネットワークインターフェース
pub struct NetworkInterface {
    bearer: Box<dyn Bearer>,
    policy: InterfacePolicy,
    counters: InterfaceCounters,
}

impl NetworkInterface {
    pub fn kind(&self) -> BearerKind {
        self.bearer.kind()
    }

    pub fn policy(&self) -> InterfacePolicy {
        self.policy
    }

    pub fn counters(&self) -> InterfaceCounters {
        self.counters
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.bearer.stats()
    }
}

/// 容量固定のインターフェースレジストリ
pub struct InterfaceRegistry {
    interfaces: SlotPool<NetworkInterface>,
}

impl InterfaceRegistry {
    pub fn new(max_interfaces: usize) -> Self {
        InterfaceRegistry {
            interfaces: SlotPool::with_capacity(max_interfaces),
        }
    }

    /// ベアラを登録する
    ///
    /// # エラー
    /// - `NetworkError::InterfaceLimit`: 登録数が上限に達している
    pub fn register(
        &mut self,
        bearer: Box<dyn Bearer>,
        policy: InterfacePolicy,
    ) -> Result<InterfaceId, NetworkError> {
        let kind = bearer.kind();
        let id = self
            .interfaces
            .insert(NetworkInterface {
                bearer,
                policy,
                counters: InterfaceCounters::default(),
            })
            .map_err(|_| NetworkError::InterfaceLimit)?;
        debug!(interface = id.index, ?kind, "interface registered");
        Ok(id)
    }

    /// 登録を解除し、ベアラを返す。解除後の ID は無効になる
    pub fn unregister(&mut self, id: InterfaceId) -> Option<Box<dyn Bearer>> {
        let iface = self.interfaces.remove(id)?;
        debug!(interface = id.index, "interface unregistered");
        Some(iface.bearer)
    }

    pub fn get(&self, id: InterfaceId) -> Option<&NetworkInterface> {
        self.interfaces.get(id)
    }

    /// 受信 PDU を受け付けるか判定し、受信カウンタを進める
    ///
    /// # エラー
    /// - `NetworkError::UnknownInterface`: 未登録の ID
    pub fn on_receive(&mut self, id: InterfaceId) -> Result<bool, NetworkError> {
        let iface = self
            .interfaces
            .get_mut(id)
            .ok_or(NetworkError::UnknownInterface)?;
        if !iface.policy.allows_rx() {
            return Ok(false);
        }
        iface.counters.rx_pdus += 1;
        Ok(true)
    }

    /// Network PDU を登録済みインターフェースに送る
    ///
    /// `except` で指定したインターフェース（受信元）は除外する。
    /// ポリシーで許可されたインターフェースのうち、送信に成功した数を返す。
    pub fn transmit(&mut self, except: Option<InterfaceId>, frame: &[u8], ttl: u8) -> usize {
        let mut sent = 0;
        for id in self.interfaces.handles() {
            if Some(id) == except {
                continue;
            }
            let Some(iface) = self.interfaces.get_mut(id) else {
                continue;
            };
            if !iface.policy.allows_tx(ttl) {
                continue;
            }
            match iface.bearer.send(frame) {
                Ok(()) => {
                    iface.counters.tx_pdus += 1;
                    sent += 1;
                }
                Err(e) => {
                    iface.counters.tx_errors += 1;
                    trace!(interface = id.index, error = %e, "bearer send failed");
                }
            }
        }
        sent
    }

    /// ベアラの送信待ちフレームを取り出す
    pub fn drain(&mut self, id: InterfaceId) -> Vec<Vec<u8>> {
        match self.interfaces.get_mut(id) {
            Some(iface) => iface.bearer.drain(),
            None => Vec::new(),
        }
    }

    pub fn ids(&self) -> Vec<InterfaceId> {
        self.interfaces.handles()
    }

    pub fn len(&self) -> usize {
        self.interfaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interfaces.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_bearer::{AdvertisingBearer, GattProxyBearer};

    fn adv() -> Box<dyn Bearer> {
        Box::new(AdvertisingBearer::new(8, 0))
    }

    #[test]
    fn test_register_limit() {
        let mut registry = InterfaceRegistry::new(2);
        registry.register(adv(), InterfacePolicy::default()).unwrap();
        registry.register(adv(), InterfacePolicy::default()).unwrap();
        let result = registry.register(adv(), InterfacePolicy::default());
        assert!(matches!(result, Err(NetworkError::InterfaceLimit)));
    }

    #[test]
    fn test_transmit_skips_received_on() {
        let mut registry = InterfaceRegistry::new(4);
        let a = registry.register(adv(), InterfacePolicy::default()).unwrap();
        let b = registry
            .register(Box::new(GattProxyBearer::new(8)), InterfacePolicy::default())
            .unwrap();

        assert_eq!(registry.transmit(Some(a), &[1, 2, 3], 5), 1);
        assert!(registry.drain(a).is_empty());
        assert_eq!(registry.drain(b), alloc::vec![alloc::vec![1, 2, 3]]);
        assert_eq!(registry.get(b).unwrap().counters().tx_pdus, 1);
    }

    #[test]
    fn test_policy_direction_and_ttl_floor() {
        let mut registry = InterfaceRegistry::new(4);
        let rx_only = registry
            .register(
                adv(),
                InterfacePolicy {
                    direction: Direction::RxOnly,
                    ttl_floor: 0,
                },
            )
            .unwrap();
        let floor = registry
            .register(
                adv(),
                InterfacePolicy {
                    direction: Direction::Both,
                    ttl_floor: 2,
                },
            )
            .unwrap();
        let tx_only = registry
            .register(
                adv(),
                InterfacePolicy {
                    direction: Direction::TxOnly,
                    ttl_floor: 0,
                },
            )
            .unwrap();

        assert_eq!(registry.transmit(None, &[0xAA], 1), 1);
        assert!(registry.drain(rx_only).is_empty());
        assert!(registry.drain(floor).is_empty());
        assert_eq!(registry.drain(tx_only).len(), 1);

        assert_eq!(registry.on_receive(rx_only), Ok(true));
        assert_eq!(registry.on_receive(tx_only), Ok(false));
    }

    #[test]
    fn test_unregistered_id_is_stale() {
        let mut registry = InterfaceRegistry::new(1);
        let a = registry.register(adv(), InterfacePolicy::default()).unwrap();
        assert!(registry.unregister(a).is_some());
        assert!(registry.unregister(a).is_none());

        // 同じスロットが再利用されても古い ID は使えない
        let b = registry.register(adv(), InterfacePolicy::default()).unwrap();
        assert_eq!(a.index, b.index);
        assert_ne!(a, b);
        assert_eq!(registry.on_receive(a), Err(NetworkError::UnknownInterface));
        assert!(registry.drain(a).is_empty());
    }

    #[test]
    fn test_closed_bearer_counts_error() {
        let mut registry = InterfaceRegistry::new(1);
        let mut bearer = AdvertisingBearer::new(8, 0);
        bearer.close();
        let a = registry
            .register(Box::new(bearer), InterfacePolicy::default())
            .unwrap();
        assert_eq!(registry.transmit(None, &[1], 3), 0);
        assert_eq!(registry.get(a).unwrap().counters().tx_errors, 1);
    }
}
