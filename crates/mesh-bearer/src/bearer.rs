//! Bearer の実装（ベアラ種別ごとに 1 つ）

use alloc::vec::Vec;

use tracing::debug;

use crate::queue::{FrameQueue, QueueStats};
use crate::{Bearer, BearerError, BearerKind};

/// Network PDU の最大長（1 + 1 + 3 + 2 + 2 + 16 + 4）
pub const MAX_NETWORK_PDU_LEN: usize = 29;

/// 広告ベアラ
///
/// 各 PDU を Network Transmit の回数分（`transmit_count + 1` 回）キューに積む。
/// 実際の広告間隔の制御は無線ドライバが担当する。
pub struct AdvertisingBearer {
    queue: FrameQueue,
    transmit_count: u8,
    open: bool,
}

impl AdvertisingBearer {
    pub fn new(queue_capacity: usize, transmit_count: u8) -> Self {
        AdvertisingBearer {
            queue: FrameQueue::new(queue_capacity),
            transmit_count,
            open: true,
        }
    }

    /// 無線停止などでベアラを閉じる。以降の送信は `Closed`
    pub fn close(&mut self) {
        self.open = false;
    }
}

impl Bearer for AdvertisingBearer {
    fn kind(&self) -> BearerKind {
        BearerKind::Advertising
    }

    fn send(&mut self, pdu: &[u8]) -> Result<(), BearerError> {
        if !self.open {
            return Err(BearerError::Closed);
        }
        if pdu.len() > MAX_NETWORK_PDU_LEN {
            return Err(BearerError::FrameTooLong(pdu.len()));
        }
        for _ in 0..=self.transmit_count {
            if self.queue.push(pdu) {
                debug!(len = pdu.len(), "advertising queue full, oldest frame dropped");
            }
        }
        Ok(())
    }

    fn drain(&mut self) -> Vec<Vec<u8>> {
        self.queue.drain()
    }

    fn stats(&self) -> QueueStats {
        self.queue.stats()
    }
}

/// GATT Proxy ベアラ（接続指向）
///
/// 1 PDU を 1 回だけキューに積む。Proxy PDU のフレーミング（SAR ヘッダー）は
/// GATT 層が担当する。
pub struct GattProxyBearer {
    queue: FrameQueue,
    connected: bool,
}

impl GattProxyBearer {
    pub fn new(queue_capacity: usize) -> Self {
        GattProxyBearer {
            queue: FrameQueue::new(queue_capacity),
            connected: true,
        }
    }

    /// 切断を通知する
    pub fn disconnect(&mut self) {
        self.connected = false;
    }
}

impl Bearer for GattProxyBearer {
    fn kind(&self) -> BearerKind {
        BearerKind::GattProxy
    }

    fn send(&mut self, pdu: &[u8]) -> Result<(), BearerError> {
        if !self.connected {
            return Err(BearerError::Closed);
        }
        if pdu.len() > MAX_NETWORK_PDU_LEN {
            return Err(BearerError::FrameTooLong(pdu.len()));
        }
        if self.queue.push(pdu) {
            debug!(len = pdu.len(), "proxy queue full, oldest frame dropped");
        }
        Ok(())
    }

    fn drain(&mut self) -> Vec<Vec<u8>> {
        self.queue.drain()
    }

    fn stats(&self) -> QueueStats {
        self.queue.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advertising_repeats_transmit_count() {
        let mut bearer = AdvertisingBearer::new(8, 2);
        bearer.send(&[0xAA; 14]).unwrap();
        let frames = bearer.drain();
        assert_eq!(frames.len(), 3);
        assert!(frames.iter().all(|f| f == &[0xAA; 14]));
    }

    #[test]
    fn test_gatt_sends_once() {
        let mut bearer = GattProxyBearer::new(8);
        bearer.send(&[0x01; 20]).unwrap();
        assert_eq!(bearer.drain().len(), 1);
        assert_eq!(bearer.kind(), BearerKind::GattProxy);
    }

    #[test]
    fn test_closed_bearer_rejects() {
        let mut bearer = GattProxyBearer::new(8);
        bearer.disconnect();
        assert_eq!(bearer.send(&[0u8; 14]), Err(BearerError::Closed));

        let mut adv = AdvertisingBearer::new(8, 0);
        adv.close();
        assert_eq!(adv.send(&[0u8; 14]), Err(BearerError::Closed));
    }

    #[test]
    fn test_full_queue_drops_oldest_frame() {
        let mut adv = AdvertisingBearer::new(1, 0);
        adv.send(&[0x01; 14]).unwrap();
        adv.send(&[0x02; 14]).unwrap();
        assert_eq!(adv.stats().dropped_frames, 1);
        assert_eq!(adv.drain(), alloc::vec![alloc::vec![0x02; 14]]);

        let mut gatt = GattProxyBearer::new(1);
        gatt.send(&[0x03; 20]).unwrap();
        gatt.send(&[0x04; 20]).unwrap();
        assert_eq!(gatt.stats().dropped_frames, 1);
        assert_eq!(gatt.drain(), alloc::vec![alloc::vec![0x04; 20]]);
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut bearer = AdvertisingBearer::new(8, 0);
        assert_eq!(
            bearer.send(&[0u8; 30]),
            Err(BearerError::FrameTooLong(30))
        );
    }
}
