//! # mesh-network
//!
//! Bluetooth Mesh ネットワーク層の実装。
//!
//! Network PDU の符号化/復号（ヘッダー難読化 + NetMIC）、リプレイキャッシュ、
//! ベアラを束ねるインターフェースレジストリとリレー判定を担当する。
//!
//! ## 受信処理の順序
//!
//! ```text
//! bytes → decode（NID で候補鍵を選び、難読化解除 → NetMIC 検証）
//!       → ReplayCache::accept（重複・古い PDU はここで止まる）
//!       → ローカル配送（下位トランスポートへ） / relay（TTL-1 で他インターフェースへ）
//! ```
//!
//! リプレイ判定をリレーより先に行うので、重複 PDU はどのインターフェースにも
//! 転送されない。

#![no_std]
extern crate alloc;

pub mod error;
pub mod interface;
pub mod pdu;
pub mod relay;
pub mod replay;

pub use error::NetworkError;
pub use interface::{Direction, InterfaceCounters, InterfaceId, InterfacePolicy, InterfaceRegistry, NetworkInterface};
pub use pdu::{decode, encode, DecodedPdu, NetworkPdu, MAX_PDU_LEN, MIN_PDU_LEN};
pub use relay::{relay, relay_decision, RelayDecision, SkipReason};
pub use replay::ReplayCache;
