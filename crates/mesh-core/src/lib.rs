//! # mesh-core
//!
//! Bluetooth Mesh ノードのネットワーク層 + 下位トランスポート層を束ねる `MeshContext`。
//!
//! - 設定（`MeshConfig`、JSON で一部だけ上書きできる）
//! - 鍵ストア（Network / Application / Device Key、鍵更新フェーズ）
//! - 送信 SEQ の払い出し（要素ごと、IV Update でリセット）
//! - タイマーキュー（分割送信の再送、ACK、受信未完了）
//! - 受信パイプライン・送信パイプラインとイベント
//!
//! ## 使い方
//!
//! ```text
//! let mut node = MeshContext::new(config, keys, seq)?;
//! let iface = node.register_interface(Box::new(AdvertisingBearer::new(16, 0)))?;
//!
//! // 無線から受信
//! node.on_bearer_pdu(iface, &bytes, Some(rssi), now_ms);
//! // 送信
//! let handle = node.send_access(AccessSend::new(dst, KeyRef::App(0), payload), now_ms)?;
//! // 定期的に
//! node.tick(now_ms);
//! for frame in node.drain_bearer(iface) { radio.send(frame) }
//! for event in node.take_events() { ... }
//! ```
//!
//! スレッドを持たない。すべての操作は同じ実行コンテキストから呼ぶ。

#![no_std]
extern crate alloc;

pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod keystore;
pub mod seq;
pub mod timer;

pub use config::MeshConfig;
pub use context::{AccessSend, ControlSend, KeyRef, MeshContext};
pub use error::{ConfigError, MeshError, SendError};
pub use event::{AccessMessage, ControlMessage, MeshEvent, MeshStats, SendHandle};
pub use keystore::{KeyRefreshPhase, KeyStore, MemoryKeyStore, NetKeyRef};
pub use seq::{MemorySequenceStore, SequenceStore};
pub use timer::TimerQueue;
