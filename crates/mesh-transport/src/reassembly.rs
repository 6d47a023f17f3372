//! セグメント受信（Reassembler）
//!
//! `(src, SeqAuth)` ごとにセグメントを集め、揃ったら上位 PDU を配送する。
//!
//! - ユニキャスト宛ては ACK タイマーでまとめて部分 ACK を返し、完了時は即座に
//!   全ビットの ACK を返す。グループ・仮想アドレス宛ては ACK しない。
//! - 受信未完了タイマーは新しいセグメントを受けるたびに張り直す。期限切れなら
//!   配送せずに破棄する。
//! - 完了・期限切れになった `(src, SeqAuth)` はフィルタリストに残し、遅れて届いた
//!   重複セグメントでコンテキストを再確保しない。完了済みのユニキャストには
//!   全ビットの ACK を返し直す（最後の ACK が失われた場合の送信側の失敗を防ぐ）。
//! - 送信元ごとに受信中のメッセージは 1 つ。新しい SeqAuth（IV Index 込み）の
//!   セグメントが来たら古いコンテキストを破棄して失敗としてフィルタに記録し、
//!   古い SeqAuth のセグメントは黙って捨てる。

use alloc::collections::VecDeque;
use alloc::vec;
use alloc::vec::Vec;

use mesh_proto::{seq_auth_from, Address, SlotPool};
use tracing::{debug, trace};

use crate::error::TransportError;
use crate::lower::{segment_len, SegmentAck, SegmentHeader};
use crate::segment::SegmentedKind;
use crate::timer::{TimerKind, TimerToken};

/// Reassembler の設定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReassemblerConfig {
    /// 同時に受信できる分割メッセージ数
    pub max_contexts: usize,
    /// 完了済み `(src, SeqAuth)` を覚えておく数
    pub filter_len: usize,
    /// ACK タイマー = base + per_hop × TTL
    pub ack_base_ms: u32,
    pub ack_per_hop_ms: u32,
    /// 受信未完了タイマー
    pub incomplete_timeout_ms: u32,
    /// ACK の TTL（受信セグメントの TTL が 0 のときは 0）
    pub default_ttl: u8,
}

impl Default for ReassemblerConfig {
    fn default() -> Self {
        ReassemblerConfig {
            max_contexts: 2,
            filter_len: 8,
            ack_base_ms: 150,
            ack_per_hop_ms: 50,
            incomplete_timeout_ms: 10_000,
            default_ttl: 7,
        }
    }
}

/// ネットワーク層から届いたセグメント
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundSegment {
    pub net_key_index: u16,
    pub iv_index: u32,
    pub src: u16,
    pub dst: u16,
    pub ttl: u8,
    /// ネットワーク PDU の SEQ
    pub seq: u32,
    pub kind: SegmentedKind,
    pub header: SegmentHeader,
    pub segment: Vec<u8>,
}

/// 再組み立てが完了した上位 PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reassembled {
    pub net_key_index: u16,
    pub iv_index: u32,
    pub src: u16,
    pub dst: u16,
    pub kind: SegmentedKind,
    pub seq_auth: u32,
    /// 最初のセグメントを受けたときの TTL
    pub ttl: u8,
    pub upper_pdu: Vec<u8>,
}

/// 送信する Segment Acknowledgment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundAck {
    pub net_key_index: u16,
    /// ローカル要素（受信メッセージの宛先）
    pub src: u16,
    /// 送信元ノード
    pub dst: u16,
    pub ttl: u8,
    pub ack: SegmentAck,
}

/// Reassembler が返すアクション
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReassemblyAction {
    Deliver(Reassembled),
    SendAck(OutboundAck),
    Schedule { token: TimerToken, delay_ms: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Completed { block_ack: u32 },
    Failed,
}

#[derive(Debug, Clone, Copy)]
struct FilterEntry {
    src: u16,
    iv_index: u32,
    seq_auth: u32,
    outcome: Outcome,
    net_key_index: u16,
    dst: u16,
    ack_ttl: u8,
}

struct RxContext {
    net_key_index: u16,
    iv_index: u32,
    src: u16,
    dst: u16,
    kind: SegmentedKind,
    seq_auth: u32,
    seg_n: u8,
    received: u32,
    buffer: Vec<u8>,
    last_len: usize,
    ack_ttl: u8,
    /// 最初のセグメントの TTL
    hop_ttl: u8,
    unicast: bool,
    ack_armed: bool,
    ack_epoch: u32,
    incomplete_epoch: u32,
}

impl RxContext {
    fn full_mask(&self) -> u32 {
        if self.seg_n >= 31 {
            u32::MAX
        } else {
            (1u32 << (self.seg_n + 1)) - 1
        }
    }

    fn is_complete(&self) -> bool {
        self.received == self.full_mask()
    }

    fn outbound_ack(&self, block_ack: u32) -> OutboundAck {
        OutboundAck {
            net_key_index: self.net_key_index,
            src: self.dst,
            dst: self.src,
            ttl: self.ack_ttl,
            ack: SegmentAck {
                obo: false,
                seq_zero: (self.seq_auth & 0x1FFF) as u16,
                block_ack,
            },
        }
    }

    fn filter_entry(&self, outcome: Outcome) -> FilterEntry {
        FilterEntry {
            src: self.src,
            iv_index: self.iv_index,
            seq_auth: self.seq_auth,
            outcome,
            net_key_index: self.net_key_index,
            dst: self.dst,
            ack_ttl: self.ack_ttl,
        }
    }
}

/// 分割受信コンテキストのプールとフィルタリスト
pub struct Reassembler {
    contexts: SlotPool<RxContext>,
    filter: VecDeque<FilterEntry>,
    config: ReassemblerConfig,
}

impl Reassembler {
    pub fn new(config: ReassemblerConfig) -> Self {
        Reassembler {
            contexts: SlotPool::with_capacity(config.max_contexts),
            filter: VecDeque::with_capacity(config.filter_len),
            config,
        }
    }

    /// セグメントを 1 つ処理する
    ///
    /// # エラー
    /// - `TransportError::MalformedPdu`: セグメント長・SegN が不正、SeqAuth を復元できない、
    ///   または既存コンテキストと矛盾する
    pub fn on_segment(&mut self, seg: InboundSegment) -> Result<Vec<ReassemblyAction>, TransportError> {
        let mut actions = Vec::new();
        let ctl = matches!(seg.kind, SegmentedKind::Control { .. });
        let seg_len = segment_len(ctl);
        let SegmentHeader {
            seq_zero,
            seg_o,
            seg_n,
            ..
        } = seg.header;

        if seg_o > seg_n
            || seg.segment.is_empty()
            || seg.segment.len() > seg_len
            || (seg_o < seg_n && seg.segment.len() != seg_len)
        {
            return Err(TransportError::MalformedPdu);
        }
        let seq_auth = seq_auth_from(seg.seq, seq_zero).ok_or(TransportError::MalformedPdu)?;

        if let Some(entry) = self
            .filter
            .iter()
            .find(|e| e.src == seg.src && e.iv_index == seg.iv_index && e.seq_auth == seq_auth)
        {
            if let Outcome::Completed { block_ack } = entry.outcome {
                if Address::from_u16(entry.dst).is_unicast() {
                    trace!(src = %format_args!("{:04x}", seg.src), seq_zero, "late segment, re-acking");
                    actions.push(ReassemblyAction::SendAck(OutboundAck {
                        net_key_index: entry.net_key_index,
                        src: entry.dst,
                        dst: entry.src,
                        ttl: entry.ack_ttl,
                        ack: SegmentAck {
                            obo: false,
                            seq_zero,
                            block_ack,
                        },
                    }));
                }
            }
            return Ok(actions);
        }

        // 送信元ごとに受信中のメッセージは 1 つだけ
        let incoming = (seg.iv_index, seq_auth);
        let newest_done = self
            .filter
            .iter()
            .filter(|e| e.src == seg.src)
            .map(|e| (e.iv_index, e.seq_auth))
            .max();
        if newest_done.is_some_and(|done| incoming < done) {
            trace!(src = %format_args!("{:04x}", seg.src), seq_zero, "segment of an older message dropped");
            return Ok(actions);
        }
        let current = self.contexts.find(|c| c.src == seg.src);
        let current_key = current
            .and_then(|h| self.contexts.get(h))
            .map(|c| (c.iv_index, c.seq_auth));
        let existing = match (current, current_key) {
            (Some(handle), Some(key)) if key == incoming => Some(handle),
            (Some(_), Some(key)) if incoming < key => {
                trace!(src = %format_args!("{:04x}", seg.src), seq_zero, "segment of an older message dropped");
                return Ok(actions);
            }
            (Some(handle), Some(_)) => {
                if let Some(old) = self.contexts.remove(handle) {
                    debug!(
                        src = %format_args!("{:04x}", old.src),
                        seq_zero = old.seq_auth & 0x1FFF,
                        "newer message from the same source, abandoning reassembly"
                    );
                    self.remember(old.filter_entry(Outcome::Failed));
                }
                None
            }
            _ => None,
        };

        let handle = match existing {
            Some(handle) => handle,
            None => {
                let ack_ttl = if seg.ttl == 0 { 0 } else { self.config.default_ttl };
                let ctx = RxContext {
                    net_key_index: seg.net_key_index,
                    iv_index: seg.iv_index,
                    src: seg.src,
                    dst: seg.dst,
                    kind: seg.kind,
                    seq_auth,
                    seg_n,
                    received: 0,
                    buffer: vec![0u8; seg_len * (seg_n as usize + 1)],
                    last_len: 0,
                    ack_ttl,
                    hop_ttl: seg.ttl,
                    unicast: Address::from_u16(seg.dst).is_unicast(),
                    ack_armed: false,
                    ack_epoch: 0,
                    incomplete_epoch: 0,
                };
                match self.contexts.insert(ctx) {
                    Ok(handle) => handle,
                    Err(_) => {
                        // ACK しない（送信側は後で再送する）
                        debug!(
                            src = %format_args!("{:04x}", seg.src),
                            seq_zero,
                            "no free reassembly context, segment dropped"
                        );
                        return Ok(actions);
                    }
                }
            }
        };

        let ack_delay = self.ack_delay(seg.ttl);
        let incomplete_ms = self.config.incomplete_timeout_ms;
        let Some(ctx) = self.contexts.get_mut(handle) else {
            return Ok(actions);
        };
        if ctx.kind != seg.kind || ctx.seg_n != seg_n {
            return Err(TransportError::MalformedPdu);
        }

        let bit = 1u32 << seg_o;
        if ctx.received & bit != 0 {
            trace!(src = %format_args!("{:04x}", seg.src), seq_zero, seg_o, "duplicate segment");
            return Ok(actions);
        }
        let offset = seg_o as usize * seg_len;
        ctx.buffer[offset..offset + seg.segment.len()].copy_from_slice(&seg.segment);
        if seg_o == seg_n {
            ctx.last_len = seg.segment.len();
        }
        ctx.received |= bit;

        if ctx.is_complete() {
            let total = seg_n as usize * seg_len + ctx.last_len;
            let block_ack = ctx.received;
            let unicast = ctx.unicast;
            let entry = ctx.filter_entry(Outcome::Completed { block_ack });
            let ack = ctx.outbound_ack(block_ack);
            let Some(mut ctx) = self.contexts.remove(handle) else {
                return Ok(actions);
            };
            ctx.buffer.truncate(total);
            debug!(
                src = %format_args!("{:04x}", ctx.src),
                seq_zero,
                len = total,
                "segmented message reassembled"
            );
            actions.push(ReassemblyAction::Deliver(Reassembled {
                net_key_index: ctx.net_key_index,
                iv_index: ctx.iv_index,
                src: ctx.src,
                dst: ctx.dst,
                kind: ctx.kind,
                seq_auth: ctx.seq_auth,
                ttl: ctx.hop_ttl,
                upper_pdu: ctx.buffer,
            }));
            if unicast {
                actions.push(ReassemblyAction::SendAck(ack));
            }
            self.remember(entry);
            return Ok(actions);
        }

        ctx.incomplete_epoch = ctx.incomplete_epoch.wrapping_add(1);
        actions.push(ReassemblyAction::Schedule {
            token: TimerToken::new(TimerKind::ReassemblyIncomplete, handle, ctx.incomplete_epoch),
            delay_ms: incomplete_ms,
        });
        if ctx.unicast && !ctx.ack_armed {
            ctx.ack_armed = true;
            ctx.ack_epoch = ctx.ack_epoch.wrapping_add(1);
            actions.push(ReassemblyAction::Schedule {
                token: TimerToken::new(TimerKind::ReassemblyAck, handle, ctx.ack_epoch),
                delay_ms: ack_delay,
            });
        }
        Ok(actions)
    }

    /// ACK タイマー・受信未完了タイマーの発火を処理する。古いトークンは無視する
    pub fn on_timer(&mut self, token: TimerToken) -> Vec<ReassemblyAction> {
        let mut actions = Vec::new();
        match token.kind {
            TimerKind::ReassemblyAck => {
                if let Some(ctx) = self.contexts.get_mut(token.slot) {
                    if ctx.ack_armed && ctx.ack_epoch == token.epoch {
                        ctx.ack_armed = false;
                        actions.push(ReassemblyAction::SendAck(ctx.outbound_ack(ctx.received)));
                    }
                }
            }
            TimerKind::ReassemblyIncomplete => {
                let expired = matches!(
                    self.contexts.get(token.slot),
                    Some(ctx) if ctx.incomplete_epoch == token.epoch
                );
                if expired {
                    if let Some(ctx) = self.contexts.remove(token.slot) {
                        debug!(
                            src = %format_args!("{:04x}", ctx.src),
                            seq_zero = ctx.seq_auth & 0x1FFF,
                            "reassembly timed out"
                        );
                        self.remember(ctx.filter_entry(Outcome::Failed));
                    }
                }
            }
            TimerKind::SegmentRetransmit => {}
        }
        actions
    }

    /// タイマートークンがまだ意味を持つか
    pub fn is_timer_live(&self, token: &TimerToken) -> bool {
        match (token.kind, self.contexts.get(token.slot)) {
            (TimerKind::ReassemblyAck, Some(ctx)) => ctx.ack_armed && ctx.ack_epoch == token.epoch,
            (TimerKind::ReassemblyIncomplete, Some(ctx)) => ctx.incomplete_epoch == token.epoch,
            _ => false,
        }
    }

    /// 受信中の分割メッセージ数
    pub fn in_progress(&self) -> usize {
        self.contexts.len()
    }

    /// 受信中のコンテキストをすべて破棄する
    pub fn clear(&mut self) {
        for handle in self.contexts.handles() {
            self.contexts.remove(handle);
        }
        self.filter.clear();
    }

    fn remember(&mut self, entry: FilterEntry) {
        if self.config.filter_len == 0 {
            return;
        }
        if self.filter.len() >= self.config.filter_len {
            self.filter.pop_front();
        }
        self.filter.push_back(entry);
    }

    fn ack_delay(&self, ttl: u8) -> u32 {
        self.config.ack_base_ms + self.config.ack_per_hop_ms * ttl as u32
    }
}
