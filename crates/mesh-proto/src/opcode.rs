//! Access レイヤーの opcode
//!
//! ```text
//! 0xxxxxxx                      1 オクテット（0x7F は RFU）
//! 10xxxxxx xxxxxxxx             2 オクテット（SIG モデル）
//! 11xxxxxx zzzzzzzz zzzzzzzz    3 オクテット（ベンダー、z = Company ID）
//! ```

use alloc::vec::Vec;

use serde::{Deserialize, Serialize};

use crate::error::ProtoError;

/// Access opcode（1〜3 オクテット）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Opcode {
    Single(u8),
    Double(u16),
    Vendor { opcode: u8, company_id: u16 },
}

impl Opcode {
    /// Access ペイロードの先頭から opcode を取り出し、残りのパラメータを返す
    pub fn parse(payload: &[u8]) -> Result<(Opcode, &[u8]), ProtoError> {
        let first = *payload.first().ok_or(ProtoError::InvalidOpcode)?;
        match first >> 6 {
            0b00 | 0b01 => {
                if first == 0x7F {
                    return Err(ProtoError::InvalidOpcode);
                }
                Ok((Opcode::Single(first), &payload[1..]))
            }
            0b10 => {
                if payload.len() < 2 {
                    return Err(ProtoError::InvalidOpcode);
                }
                Ok((
                    Opcode::Double(u16::from_be_bytes([first, payload[1]])),
                    &payload[2..],
                ))
            }
            _ => {
                if payload.len() < 3 {
                    return Err(ProtoError::InvalidOpcode);
                }
                // Company ID はリトルエンディアン
                Ok((
                    Opcode::Vendor {
                        opcode: first,
                        company_id: u16::from_le_bytes([payload[1], payload[2]]),
                    },
                    &payload[3..],
                ))
            }
        }
    }

    /// Wire 形式のバイト列
    pub fn to_bytes(&self) -> Vec<u8> {
        match *self {
            Opcode::Single(op) => alloc::vec![op],
            Opcode::Double(op) => op.to_be_bytes().to_vec(),
            Opcode::Vendor { opcode, company_id } => {
                let cid = company_id.to_le_bytes();
                alloc::vec![opcode, cid[0], cid[1]]
            }
        }
    }

    /// opcode のオクテット数
    pub fn len(&self) -> usize {
        match self {
            Opcode::Single(_) => 1,
            Opcode::Double(_) => 2,
            Opcode::Vendor { .. } => 3,
        }
    }

    /// 表示・ログ用に 1 つの整数へ詰める
    pub fn as_u32(&self) -> u32 {
        match *self {
            Opcode::Single(op) => op as u32,
            Opcode::Double(op) => op as u32,
            Opcode::Vendor { opcode, company_id } => ((opcode as u32) << 16) | company_id as u32,
        }
    }
}
