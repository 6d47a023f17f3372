//! セグメント送信（Segmenter）
//!
//! 1 つのネットワーク PDU に収まらない上位 PDU をセグメントに分割し、
//! ACK が揃うか再送回数を使い切るまで再送を駆動する。
//!
//! ## 状態遷移（コンテキストごと）
//! ```text
//! send() ── 全セグメント送信 ──▶ WaitingAck ──(全 ACK)──────────▶ Complete
//!                                  │  ├─(部分 ACK)── 未 ACK 分だけ再送
//!                                  │  └─(タイマー)── 未 ACK 分を再送, retries+1
//!                                  └─(retries 超過 / BlockAck 0 / cancel)──▶ Abandoned
//! ```
//!
//! グループ・仮想アドレス宛ては ACK が来ないので、固定間隔で
//! `nb_retrans` 回だけ全セグメントを再送して成功扱いで完了する。
//!
//! I/O は持たない。各操作は `SegmentAction` の列を返し、ホストが
//! 送信・タイマー登録・完了通知を行う。

use alloc::vec::Vec;

use mesh_proto::{Address, SlotHandle, SlotPool};
use tracing::debug;

use crate::error::{SendFailure, TransportError};
use crate::lower::{segment_len, LowerPdu, SegmentAck, SegmentHeader, MAX_SEGMENTS};
use crate::timer::{TimerKind, TimerToken};

/// Segmenter の設定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmenterConfig {
    /// 同時に送信できる分割メッセージ数
    pub max_contexts: usize,
    /// 再送回数
    pub nb_retrans: u8,
    /// ユニキャスト再送タイマー = base + per_hop × TTL
    pub retrans_base_ms: u32,
    pub retrans_per_hop_ms: u32,
    /// グループ・仮想アドレス宛ての再送間隔
    pub group_interval_ms: u32,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        SegmenterConfig {
            max_contexts: 2,
            nb_retrans: 3,
            retrans_base_ms: 200,
            retrans_per_hop_ms: 50,
            group_interval_ms: 300,
        }
    }
}

/// 分割するメッセージの種別
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentedKind {
    Access { akf: bool, aid: u8, szmic: bool },
    Control { opcode: u8 },
}

/// 送信する上位 PDU（暗号化済み）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub net_key_index: u16,
    pub kind: SegmentedKind,
    pub src: u16,
    pub dst: u16,
    pub ttl: u8,
    /// 最初のセグメントの SEQ（SeqZero はこの下位 13 ビット）
    pub seq_auth: u32,
    pub upper_pdu: Vec<u8>,
}

impl OutboundMessage {
    fn ctl(&self) -> bool {
        matches!(self.kind, SegmentedKind::Control { .. })
    }
}

/// ネットワーク層に渡すセグメント
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundSegment {
    pub net_key_index: u16,
    pub ctl: bool,
    pub ttl: u8,
    pub src: u16,
    pub dst: u16,
    /// 初回送信は `SeqAuth + SegO`。`None` なら送信時に新しい SEQ を割り当てる
    pub seq: Option<u32>,
    pub lower_pdu: LowerPdu,
}

/// Segmenter が返すアクション
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentAction {
    Transmit(OutboundSegment),
    Schedule { token: TimerToken, delay_ms: u32 },
    Complete {
        send_id: u32,
        result: Result<(), SendFailure>,
    },
}

struct SegContext {
    send_id: u32,
    msg: OutboundMessage,
    seq_zero: u16,
    seg_n: u8,
    /// 未 ACK セグメントのビットマップ
    unacked: u32,
    retries: u8,
    epoch: u32,
    unicast: bool,
}

impl SegContext {
    fn segment(&self, seg_o: u8) -> LowerPdu {
        let len = segment_len(self.msg.ctl());
        let start = seg_o as usize * len;
        let end = (start + len).min(self.msg.upper_pdu.len());
        let segment = self.msg.upper_pdu[start..end].to_vec();
        match self.msg.kind {
            SegmentedKind::Access { akf, aid, szmic } => LowerPdu::SegmentedAccess {
                akf,
                aid,
                header: SegmentHeader {
                    szmic,
                    seq_zero: self.seq_zero,
                    seg_o,
                    seg_n: self.seg_n,
                },
                segment,
            },
            SegmentedKind::Control { opcode } => LowerPdu::SegmentedControl {
                opcode,
                header: SegmentHeader {
                    szmic: false,
                    seq_zero: self.seq_zero,
                    seg_o,
                    seg_n: self.seg_n,
                },
                segment,
            },
        }
    }

    fn transmit(&self, seg_o: u8, seq: Option<u32>) -> SegmentAction {
        SegmentAction::Transmit(OutboundSegment {
            net_key_index: self.msg.net_key_index,
            ctl: self.msg.ctl(),
            ttl: self.msg.ttl,
            src: self.msg.src,
            dst: self.msg.dst,
            seq,
            lower_pdu: self.segment(seg_o),
        })
    }

    /// 未 ACK のセグメントを新しい SEQ で再送する
    fn retransmit_unacked(&self, actions: &mut Vec<SegmentAction>) {
        for seg_o in 0..=self.seg_n {
            if self.unacked & (1 << seg_o) != 0 {
                actions.push(self.transmit(seg_o, None));
            }
        }
    }
}

fn full_mask(seg_n: u8) -> u32 {
    if seg_n as usize + 1 >= 32 {
        u32::MAX
    } else {
        (1u32 << (seg_n + 1)) - 1
    }
}

/// 分割送信コンテキストのプール
pub struct Segmenter {
    contexts: SlotPool<SegContext>,
    config: SegmenterConfig,
}

impl Segmenter {
    pub fn new(config: SegmenterConfig) -> Self {
        Segmenter {
            contexts: SlotPool::with_capacity(config.max_contexts),
            config,
        }
    }

    /// 分割送信を開始する
    ///
    /// 全セグメントを `SeqAuth + SegO` の SEQ で送信するアクションと、
    /// 再送タイマーの登録アクションを返す。
    ///
    /// # エラー
    /// - `TransportError::TooLarge`: 32 セグメントに収まらない
    /// - `TransportError::Busy`: 空きコンテキストがない（キューイングしない）
    pub fn send(
        &mut self,
        msg: OutboundMessage,
        send_id: u32,
    ) -> Result<(SlotHandle, Vec<SegmentAction>), TransportError> {
        let len = msg.upper_pdu.len();
        let seg_len = segment_len(msg.ctl());
        if len == 0 {
            return Err(TransportError::MalformedPdu);
        }
        if len > MAX_SEGMENTS * seg_len {
            return Err(TransportError::TooLarge(len));
        }
        if self.contexts.is_full() {
            return Err(TransportError::Busy);
        }

        let seg_n = ((len + seg_len - 1) / seg_len - 1) as u8;
        let unicast = Address::from_u16(msg.dst).is_unicast();
        let ctx = SegContext {
            send_id,
            seq_zero: (msg.seq_auth & 0x1FFF) as u16,
            seg_n,
            unacked: full_mask(seg_n),
            retries: 0,
            epoch: 0,
            unicast,
            msg,
        };

        let mut actions = Vec::with_capacity(seg_n as usize + 2);
        for seg_o in 0..=seg_n {
            actions.push(ctx.transmit(seg_o, Some(ctx.msg.seq_auth + seg_o as u32)));
        }
        let delay_ms = self.retransmit_delay(&ctx);
        let blind_done = !unicast && self.config.nb_retrans == 0;

        let handle = self
            .contexts
            .insert(ctx)
            .map_err(|_| TransportError::Busy)?;

        if blind_done {
            self.contexts.remove(handle);
            actions.push(SegmentAction::Complete {
                send_id,
                result: Ok(()),
            });
        } else {
            actions.push(SegmentAction::Schedule {
                token: TimerToken::new(TimerKind::SegmentRetransmit, handle, 0),
                delay_ms,
            });
        }
        Ok((handle, actions))
    }

    /// Segment Acknowledgment を処理する
    ///
    /// # 引数
    /// - `ack_src`: ACK の送信元（メッセージの宛先、OBO なら Friend）
    /// - `ack_dst`: ACK の宛先（メッセージの送信元要素）
    pub fn on_ack(&mut self, ack_src: u16, ack_dst: u16, ack: &SegmentAck) -> Vec<SegmentAction> {
        let mut actions = Vec::new();
        let Some(handle) = self.contexts.find(|c| {
            c.unicast
                && c.seq_zero == ack.seq_zero
                && c.msg.src == ack_dst
                && (ack.obo || c.msg.dst == ack_src)
        }) else {
            debug!(
                src = %format_args!("{:04x}", ack_src),
                seq_zero = ack.seq_zero,
                "segment ack for unknown transfer"
            );
            return actions;
        };

        if ack.block_ack == 0 {
            if let Some(ctx) = self.contexts.remove(handle) {
                debug!(seq_zero = ctx.seq_zero, "transfer rejected by peer");
                actions.push(SegmentAction::Complete {
                    send_id: ctx.send_id,
                    result: Err(SendFailure::RejectedByPeer),
                });
            }
            return actions;
        }

        let delay_ms = match self.contexts.get(handle) {
            Some(ctx) => self.retransmit_delay(ctx),
            None => return actions,
        };
        let Some(ctx) = self.contexts.get_mut(handle) else {
            return actions;
        };
        let newly = ctx.unacked & ack.block_ack;
        if newly == 0 {
            return actions;
        }
        ctx.unacked &= !ack.block_ack;

        if ctx.unacked == 0 {
            let send_id = ctx.send_id;
            self.contexts.remove(handle);
            actions.push(SegmentAction::Complete {
                send_id,
                result: Ok(()),
            });
            return actions;
        }

        // 部分 ACK: 欠けているセグメントだけを再送し、タイマーを張り直す
        ctx.epoch = ctx.epoch.wrapping_add(1);
        debug!(
            seq_zero = ctx.seq_zero,
            missing = ctx.unacked.count_ones(),
            "partial ack, retransmitting missing segments"
        );
        ctx.retransmit_unacked(&mut actions);
        actions.push(SegmentAction::Schedule {
            token: TimerToken::new(TimerKind::SegmentRetransmit, handle, ctx.epoch),
            delay_ms,
        });
        actions
    }

    /// 再送タイマーの発火を処理する。古いトークンは無視する
    pub fn on_timer(&mut self, token: TimerToken) -> Vec<SegmentAction> {
        let mut actions = Vec::new();
        if token.kind != TimerKind::SegmentRetransmit {
            return actions;
        }
        let nb_retrans = self.config.nb_retrans;
        let delay_ms = match self.contexts.get(token.slot) {
            Some(ctx) if ctx.epoch == token.epoch => self.retransmit_delay(ctx),
            _ => return actions,
        };
        let Some(ctx) = self.contexts.get_mut(token.slot) else {
            return actions;
        };

        if ctx.unicast && ctx.retries >= nb_retrans {
            let send_id = ctx.send_id;
            debug!(seq_zero = ctx.seq_zero, "retransmissions exhausted");
            self.contexts.remove(token.slot);
            actions.push(SegmentAction::Complete {
                send_id,
                result: Err(SendFailure::SendFailed),
            });
            return actions;
        }

        ctx.retries += 1;
        ctx.epoch = ctx.epoch.wrapping_add(1);
        ctx.retransmit_unacked(&mut actions);

        if !ctx.unicast && ctx.retries >= nb_retrans {
            let send_id = ctx.send_id;
            self.contexts.remove(token.slot);
            actions.push(SegmentAction::Complete {
                send_id,
                result: Ok(()),
            });
            return actions;
        }

        actions.push(SegmentAction::Schedule {
            token: TimerToken::new(TimerKind::SegmentRetransmit, token.slot, ctx.epoch),
            delay_ms,
        });
        actions
    }

    /// タイマートークンがまだ意味を持つか
    pub fn is_timer_live(&self, token: &TimerToken) -> bool {
        token.kind == TimerKind::SegmentRetransmit
            && self
                .contexts
                .get(token.slot)
                .is_some_and(|ctx| ctx.epoch == token.epoch)
    }

    /// 送信を取り消してコンテキストを即座に解放する
    ///
    /// 以降、このコンテキストのタイマーが発火しても何も起きない。
    pub fn cancel(&mut self, handle: SlotHandle) -> Option<SegmentAction> {
        let ctx = self.contexts.remove(handle)?;
        Some(SegmentAction::Complete {
            send_id: ctx.send_id,
            result: Err(SendFailure::Cancelled),
        })
    }

    /// 送信元要素の送信をすべて `SendFailed` で打ち切る（SEQ を使い切ったとき）
    pub fn abandon_from(&mut self, src: u16) -> Vec<SegmentAction> {
        let handles: Vec<SlotHandle> = self
            .contexts
            .handles()
            .into_iter()
            .filter(|h| self.contexts.get(*h).is_some_and(|c| c.msg.src == src))
            .collect();
        handles
            .into_iter()
            .filter_map(|h| self.contexts.remove(h))
            .map(|ctx| SegmentAction::Complete {
                send_id: ctx.send_id,
                result: Err(SendFailure::SendFailed),
            })
            .collect()
    }

    /// 全送信を取り消す
    pub fn cancel_all(&mut self) -> Vec<SegmentAction> {
        self.contexts
            .handles()
            .into_iter()
            .filter_map(|h| self.cancel(h))
            .collect()
    }

    /// send_id から送信中コンテキストを探す
    pub fn handle_of(&self, send_id: u32) -> Option<SlotHandle> {
        self.contexts.find(|c| c.send_id == send_id)
    }

    /// 送信中の分割メッセージ数
    pub fn in_flight(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_full(&self) -> bool {
        self.contexts.is_full()
    }

    fn retransmit_delay(&self, ctx: &SegContext) -> u32 {
        if ctx.unicast {
            self.config.retrans_base_ms + self.config.retrans_per_hop_ms * ctx.msg.ttl as u32
        } else {
            self.config.group_interval_ms
        }
    }
}
