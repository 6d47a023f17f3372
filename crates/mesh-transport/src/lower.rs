//! 下位トランスポート PDU
//!
//! ## Wire Format（先頭オクテットの bit7 = SEG）
//! ```text
//! 非分割アクセス:   [0|AKF|AID:6][UpperPDU: 5..15]
//! 分割アクセス:     [1|AKF|AID:6][SZMIC:1|SeqZero:13|SegO:5|SegN:5][Segment: 1..12]
//! 非分割制御:       [0|Opcode:7][Parameters: 0..11]
//! 分割制御:         [1|Opcode:7][RFU:1|SeqZero:13|SegO:5|SegN:5][Segment: 1..8]
//! Segment Ack:      [0|0x00][OBO:1|SeqZero:13|RFU:2][BlockAck: 32 BE]
//! ```

use alloc::vec::Vec;

use crate::error::TransportError;

/// 分割アクセスメッセージのセグメント長
pub const ACCESS_SEGMENT_LEN: usize = 12;
/// 分割制御メッセージのセグメント長
pub const CONTROL_SEGMENT_LEN: usize = 8;
/// 非分割アクセスメッセージの上位 PDU 最大長（TransMIC 込み）
pub const MAX_UNSEGMENTED_ACCESS_LEN: usize = 15;
/// 非分割制御メッセージのパラメータ最大長
pub const MAX_UNSEGMENTED_CONTROL_LEN: usize = 11;
/// 1 メッセージの最大セグメント数
pub const MAX_SEGMENTS: usize = 32;
/// 分割で運べる上位 PDU の最大長（32 × 12）
pub const MAX_UPPER_PDU_LEN: usize = MAX_SEGMENTS * ACCESS_SEGMENT_LEN;

/// Segment Acknowledgment の制御オペコード
pub const OPCODE_SEGMENT_ACK: u8 = 0x00;

const SEQ_ZERO_MASK: u16 = 0x1FFF;

/// セグメント長（制御 / アクセス）
pub fn segment_len(ctl: bool) -> usize {
    if ctl {
        CONTROL_SEGMENT_LEN
    } else {
        ACCESS_SEGMENT_LEN
    }
}

/// Segment Acknowledgment メッセージ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentAck {
    /// Friend が LPN の代わりに ACK した
    pub obo: bool,
    pub seq_zero: u16,
    /// 受信済みセグメントのビットマップ（bit n = SegO n）
    pub block_ack: u32,
}

impl SegmentAck {
    pub const PARAMS_LEN: usize = 6;

    pub fn to_params(&self) -> [u8; Self::PARAMS_LEN] {
        let word = ((self.obo as u16) << 15) | ((self.seq_zero & SEQ_ZERO_MASK) << 2);
        let w = word.to_be_bytes();
        let b = self.block_ack.to_be_bytes();
        [w[0], w[1], b[0], b[1], b[2], b[3]]
    }

    pub fn from_params(params: &[u8]) -> Result<Self, TransportError> {
        if params.len() != Self::PARAMS_LEN {
            return Err(TransportError::MalformedPdu);
        }
        let word = u16::from_be_bytes([params[0], params[1]]);
        if word & 0x0003 != 0 {
            return Err(TransportError::MalformedPdu);
        }
        Ok(SegmentAck {
            obo: word & 0x8000 != 0,
            seq_zero: (word >> 2) & SEQ_ZERO_MASK,
            block_ack: u32::from_be_bytes([params[2], params[3], params[4], params[5]]),
        })
    }
}

/// 分割 PDU の共通ヘッダー
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    /// アクセス: SZMIC、制御: 常に false（RFU）
    pub szmic: bool,
    pub seq_zero: u16,
    pub seg_o: u8,
    pub seg_n: u8,
}

impl SegmentHeader {
    fn to_bytes(self) -> [u8; 3] {
        let word = ((self.szmic as u32) << 23)
            | (((self.seq_zero & SEQ_ZERO_MASK) as u32) << 10)
            | (((self.seg_o & 0x1F) as u32) << 5)
            | (self.seg_n & 0x1F) as u32;
        let b = word.to_be_bytes();
        [b[1], b[2], b[3]]
    }

    fn from_bytes(bytes: &[u8]) -> Self {
        let word = u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]]);
        SegmentHeader {
            szmic: word & 0x80_0000 != 0,
            seq_zero: ((word >> 10) as u16) & SEQ_ZERO_MASK,
            seg_o: ((word >> 5) & 0x1F) as u8,
            seg_n: (word & 0x1F) as u8,
        }
    }
}

/// 下位トランスポート PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LowerPdu {
    UnsegmentedAccess {
        akf: bool,
        aid: u8,
        upper_pdu: Vec<u8>,
    },
    SegmentedAccess {
        akf: bool,
        aid: u8,
        header: SegmentHeader,
        segment: Vec<u8>,
    },
    UnsegmentedControl {
        opcode: u8,
        params: Vec<u8>,
    },
    SegmentedControl {
        opcode: u8,
        header: SegmentHeader,
        segment: Vec<u8>,
    },
    SegmentAck(SegmentAck),
}

impl LowerPdu {
    /// 制御メッセージ（CTL=1）として運ぶか
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            LowerPdu::UnsegmentedControl { .. } | LowerPdu::SegmentedControl { .. } | LowerPdu::SegmentAck(_)
        )
    }

    /// Wire Format に変換する
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16);
        match self {
            LowerPdu::UnsegmentedAccess { akf, aid, upper_pdu } => {
                out.push(((*akf as u8) << 6) | (aid & 0x3F));
                out.extend_from_slice(upper_pdu);
            }
            LowerPdu::SegmentedAccess {
                akf,
                aid,
                header,
                segment,
            } => {
                out.push(0x80 | ((*akf as u8) << 6) | (aid & 0x3F));
                out.extend_from_slice(&header.to_bytes());
                out.extend_from_slice(segment);
            }
            LowerPdu::UnsegmentedControl { opcode, params } => {
                out.push(opcode & 0x7F);
                out.extend_from_slice(params);
            }
            LowerPdu::SegmentedControl {
                opcode,
                header,
                segment,
            } => {
                out.push(0x80 | (opcode & 0x7F));
                let rfu = SegmentHeader {
                    szmic: false,
                    ..*header
                };
                out.extend_from_slice(&rfu.to_bytes());
                out.extend_from_slice(segment);
            }
            LowerPdu::SegmentAck(ack) => {
                out.push(OPCODE_SEGMENT_ACK);
                out.extend_from_slice(&ack.to_params());
            }
        }
        out
    }

    /// Network PDU の TransportPDU から復元する
    ///
    /// # エラー
    /// - `TransportError::MalformedPdu`: 長さ・SegO/SegN が不正
    pub fn decode(ctl: bool, bytes: &[u8]) -> Result<Self, TransportError> {
        let first = *bytes.first().ok_or(TransportError::MalformedPdu)?;
        let seg = first & 0x80 != 0;

        if seg {
            if bytes.len() < 5 {
                return Err(TransportError::MalformedPdu);
            }
            let header = SegmentHeader::from_bytes(&bytes[1..4]);
            let segment = &bytes[4..];
            if header.seg_o > header.seg_n || segment.len() > segment_len(ctl) {
                return Err(TransportError::MalformedPdu);
            }
            if ctl {
                if header.szmic {
                    return Err(TransportError::MalformedPdu);
                }
                return Ok(LowerPdu::SegmentedControl {
                    opcode: first & 0x7F,
                    header,
                    segment: segment.to_vec(),
                });
            }
            return Ok(LowerPdu::SegmentedAccess {
                akf: first & 0x40 != 0,
                aid: first & 0x3F,
                header,
                segment: segment.to_vec(),
            });
        }

        if ctl {
            let opcode = first & 0x7F;
            let params = &bytes[1..];
            if params.len() > MAX_UNSEGMENTED_CONTROL_LEN {
                return Err(TransportError::MalformedPdu);
            }
            if opcode == OPCODE_SEGMENT_ACK {
                return SegmentAck::from_params(params).map(LowerPdu::SegmentAck);
            }
            return Ok(LowerPdu::UnsegmentedControl {
                opcode,
                params: params.to_vec(),
            });
        }

        // TransMIC(4) + オペコード 1 バイト以上
        let upper = &bytes[1..];
        if upper.len() < 5 || upper.len() > MAX_UNSEGMENTED_ACCESS_LEN {
            return Err(TransportError::MalformedPdu);
        }
        Ok(LowerPdu::UnsegmentedAccess {
            akf: first & 0x40 != 0,
            aid: first & 0x3F,
            upper_pdu: upper.to_vec(),
        })
    }
}
