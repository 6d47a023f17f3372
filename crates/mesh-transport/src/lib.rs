//! # mesh-transport
//!
//! Bluetooth Mesh の下位トランスポート層と上位トランスポート層の実装。
//!
//! - 下位トランスポート PDU（非分割 / 分割 / Segment Ack）の符号化と復号
//! - 分割送信（`Segmenter`）: ACK と再送タイマーで駆動される
//! - 分割受信（`Reassembler`）: ACK タイマー・受信未完了タイマー・フィルタリスト
//! - 上位トランスポートの AES-CCM（Application Key / Device Key, TransMIC 32/64）
//!
//! 状態を持つ部分は I/O もタイマーも持たない。各操作はアクションの列を返し、
//! 呼び出し側（`MeshContext`）が送信・タイマー登録・配送を実行する。
//!
//! ```text
//! 送信: AccessPayload ─encrypt─▶ UpperPDU ─▶ ≤15B: UnsegmentedAccess
//!                                          └▶ それ以上: Segmenter ─▶ SegmentedAccess × (SegN+1)
//! 受信: SegmentedAccess ─▶ Reassembler ─▶ UpperPDU ─decrypt─▶ AccessPayload
//! ```

#![no_std]
extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod error;
pub mod lower;
pub mod reassembly;
pub mod segment;
pub mod timer;
pub mod upper;

pub use error::{SendFailure, TransportError};
pub use lower::{
    segment_len, LowerPdu, SegmentAck, SegmentHeader, ACCESS_SEGMENT_LEN, CONTROL_SEGMENT_LEN,
    MAX_SEGMENTS, MAX_UNSEGMENTED_ACCESS_LEN, MAX_UNSEGMENTED_CONTROL_LEN, MAX_UPPER_PDU_LEN,
    OPCODE_SEGMENT_ACK,
};
pub use reassembly::{
    InboundSegment, OutboundAck, Reassembled, Reassembler, ReassemblerConfig, ReassemblyAction,
};
pub use segment::{
    OutboundMessage, OutboundSegment, SegmentAction, SegmentedKind, Segmenter, SegmenterConfig,
};
pub use timer::{TimerKind, TimerToken};
pub use upper::{decrypt, decrypt_with_candidates, encrypt, AccessKey, Decrypted, UpperParams};
