//! ノードのコンテキスト
//!
//! ベアラから届いた Network PDU を復号・リレー・再組み立てしてイベントにし、
//! 送信要求を暗号化・分割してインターフェースへ流す。
//! 時刻はすべて呼び出し側が渡す（`now_ms`）。タイマーは `tick` で進める。
//!
//! ```text
//! 受信:
//!   on_bearer_pdu → 復号(NID で鍵を選ぶ) → 自分の SRC を除外 → リプレイ検査
//!                 → リレー → ローカル宛てなら下位トランスポート
//!                 → 非分割: 上位復号 / 分割: Reassembler / ACK: Segmenter
//!
//! 送信:
//!   send_access → 上位暗号化 → 非分割ならそのまま送信
//!                            → 分割なら Segmenter（完了は SendComplete イベント）
//! ```

use alloc::boxed::Box;
use alloc::vec::Vec;

use mesh_bearer::Bearer;
use mesh_crypto::{virtual_address, MicSize};
use mesh_network::{
    decode, encode, relay, relay_decision, DecodedPdu, InterfaceId, InterfacePolicy,
    InterfaceRegistry, NetworkError, NetworkInterface, NetworkPdu, RelayDecision, ReplayCache,
};
use mesh_proto::{check_ttl, Address, AppKeyIndex, IvIndex, NetKeyIndex, Opcode, ALL_NODES, ALL_RELAYS};
use mesh_transport::{
    decrypt_with_candidates, encrypt, AccessKey, InboundSegment, LowerPdu, OutboundAck,
    OutboundMessage, Reassembler, ReassemblyAction, SegmentAction, SegmentedKind, Segmenter,
    SendFailure, TimerKind, TransportError, UpperParams, ACCESS_SEGMENT_LEN,
    MAX_UNSEGMENTED_ACCESS_LEN, MAX_UNSEGMENTED_CONTROL_LEN, MAX_UPPER_PDU_LEN,
    OPCODE_SEGMENT_ACK,
};
use tracing::{debug, info, trace, warn};

use crate::config::MeshConfig;
use crate::error::{ConfigError, MeshError, SendError};
use crate::event::{AccessMessage, ControlMessage, MeshEvent, MeshStats, SendHandle};
use crate::keystore::KeyStore;
use crate::seq::SequenceStore;
use crate::timer::TimerQueue;

/// アクセスメッセージの暗号鍵の指定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyRef {
    /// Application Key（Network Key は結び付いたものを使う）
    App(AppKeyIndex),
    /// 宛先ノードの Device Key（なければ自ノードの Device Key）
    Device { net_key_index: NetKeyIndex },
}

/// アクセスメッセージの送信要求
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessSend {
    /// 送信元要素。`None` なら先頭要素
    pub src: Option<u16>,
    pub dst: u16,
    pub key: KeyRef,
    /// `None` なら既定 TTL
    pub ttl: Option<u8>,
    /// opcode + パラメータ
    pub payload: Vec<u8>,
    /// 短くても分割送信して ACK を待つ
    pub ack_required: bool,
    pub trans_mic: MicSize,
}

impl AccessSend {
    pub fn new(dst: u16, key: KeyRef, payload: Vec<u8>) -> Self {
        AccessSend {
            src: None,
            dst,
            key,
            ttl: None,
            payload,
            ack_required: false,
            trans_mic: MicSize::Small,
        }
    }
}

/// 非分割の制御メッセージの送信要求
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlSend {
    pub src: Option<u16>,
    pub dst: u16,
    pub net_key_index: NetKeyIndex,
    /// 0x01〜0x7F（0x00 は Segment Ack）
    pub opcode: u8,
    pub params: Vec<u8>,
    pub ttl: Option<u8>,
}

/// 受信したアクセス PDU の復号に必要な情報
struct RxAccess {
    net_key_index: NetKeyIndex,
    iv_index: u32,
    src: u16,
    dst: u16,
    ttl: u8,
    rssi: Option<i8>,
    seq_auth: u32,
    akf: bool,
    aid: u8,
    mic: MicSize,
}

/// Mesh ノードのネットワーク層 + 下位トランスポート層
pub struct MeshContext<K: KeyStore, S: SequenceStore> {
    config: MeshConfig,
    keys: K,
    seq: S,
    iv: IvIndex,
    relay_enabled: bool,
    interfaces: InterfaceRegistry,
    replay: ReplayCache,
    segmenter: Segmenter,
    reassembler: Reassembler,
    timers: TimerQueue,
    events: Vec<MeshEvent>,
    /// 購読中のグループ・仮想アドレス
    subscriptions: Vec<u16>,
    /// 既知の Label UUID
    labels: Vec<[u8; 16]>,
    next_send_id: u32,
    stats: MeshStats,
}

impl<K: KeyStore, S: SequenceStore> MeshContext<K, S> {
    /// 設定を検証してコンテキストを作る
    ///
    /// # エラー
    /// - `ConfigError::InvalidValue`: 設定値が範囲外
    pub fn new(config: MeshConfig, keys: K, seq: S) -> Result<Self, ConfigError> {
        config.validate()?;
        info!(
            primary = %format_args!("{:04x}", config.primary_address),
            elements = config.element_count,
            relay = config.relay_enabled,
            "mesh context created"
        );
        Ok(MeshContext {
            relay_enabled: config.relay_enabled,
            interfaces: InterfaceRegistry::new(config.max_interfaces),
            replay: ReplayCache::with_capacity(config.net_msg_cache_size),
            segmenter: Segmenter::new(config.segmenter()),
            reassembler: Reassembler::new(config.reassembler()),
            timers: TimerQueue::new(),
            events: Vec::new(),
            subscriptions: Vec::new(),
            labels: Vec::new(),
            next_send_id: 0,
            stats: MeshStats::default(),
            iv: IvIndex::default(),
            config,
            keys,
            seq,
        })
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn keys(&self) -> &K {
        &self.keys
    }

    /// 鍵の追加・鍵更新のフェーズ変更に使う
    pub fn keys_mut(&mut self) -> &mut K {
        &mut self.keys
    }

    pub fn stats(&self) -> MeshStats {
        self.stats
    }

    pub fn relay_enabled(&self) -> bool {
        self.relay_enabled
    }

    pub fn set_relay_enabled(&mut self, enabled: bool) {
        info!(enabled, "relay feature changed");
        self.relay_enabled = enabled;
    }

    // ---- インターフェース ----

    /// 設定の既定ポリシーでベアラを登録する
    pub fn register_interface(&mut self, bearer: Box<dyn Bearer>) -> Result<InterfaceId, MeshError> {
        let policy = self.config.interface_policy;
        self.register_interface_with_policy(bearer, policy)
    }

    /// ポリシーを指定してベアラを登録する
    ///
    /// # エラー
    /// - `NetworkError::InterfaceLimit`: 登録数の上限
    pub fn register_interface_with_policy(
        &mut self,
        bearer: Box<dyn Bearer>,
        policy: InterfacePolicy,
    ) -> Result<InterfaceId, MeshError> {
        let id = self.interfaces.register(bearer, policy)?;
        info!(interface = id.to_raw(), "interface registered");
        Ok(id)
    }

    /// インターフェースを外してベアラを返す
    ///
    /// 最後のインターフェースが外れると、送信中の分割メッセージは
    /// すべて `Cancelled` で終わる。
    pub fn unregister_interface(&mut self, id: InterfaceId) -> Option<Box<dyn Bearer>> {
        let bearer = self.interfaces.unregister(id)?;
        info!(interface = id.to_raw(), "interface unregistered");
        if self.interfaces.is_empty() {
            for action in self.segmenter.cancel_all() {
                if let SegmentAction::Complete { send_id, result } = action {
                    self.complete_send(SendHandle(send_id), result);
                }
            }
        }
        Some(bearer)
    }

    pub fn interface(&self, id: InterfaceId) -> Option<&NetworkInterface> {
        self.interfaces.get(id)
    }

    pub fn interface_ids(&self) -> Vec<InterfaceId> {
        self.interfaces.ids()
    }

    /// ベアラの送信待ちフレームを取り出す
    pub fn drain_bearer(&mut self, id: InterfaceId) -> Vec<Vec<u8>> {
        self.interfaces.drain(id)
    }

    // ---- 受信 ----

    /// ベアラから届いた Network PDU を処理する
    ///
    /// 戻り値のエラーは観測用で、状態は壊れない。
    /// 呼び出し側は無視して次の PDU を処理してよい。
    pub fn on_bearer_pdu(
        &mut self,
        interface: InterfaceId,
        bytes: &[u8],
        rssi: Option<i8>,
        now_ms: u64,
    ) -> Result<(), MeshError> {
        if !self.interfaces.on_receive(interface)? {
            trace!(interface = interface.to_raw(), "interface does not receive");
            return Ok(());
        }
        self.stats.rx_pdus += 1;

        let nid = bytes.first().map_or(0, |b| b & 0x7F);
        let decoded = decode(self.keys.net_keys_by_nid(nid), self.iv, bytes);
        let DecodedPdu { pdu, key, iv_index } = match decoded {
            Ok(d) => d,
            Err(e) => {
                match e {
                    NetworkError::AuthenticationFailed => self.stats.auth_failures += 1,
                    _ => self.stats.malformed_drops += 1,
                }
                trace!(error = %e, len = bytes.len(), "network pdu dropped");
                return Err(e.into());
            }
        };

        if self.config.is_local_element(pdu.src) {
            self.stats.own_src_drops += 1;
            trace!(seq = pdu.seq, "own pdu came back");
            return Ok(());
        }

        if !self.replay.accept(pdu.src, pdu.seq, iv_index) {
            self.stats.replay_drops += 1;
            debug!(
                src = %format_args!("{:04x}", pdu.src),
                seq = pdu.seq,
                iv_index,
                "replay rejected"
            );
            return Err(NetworkError::ReplayRejected.into());
        }

        let local_unicast = self.config.is_local_element(pdu.dst);
        if let RelayDecision::Forward { ttl } = relay_decision(&pdu, self.relay_enabled, local_unicast) {
            if let Some(material) = self.keys.net_key(key) {
                match relay(&mut self.interfaces, material, iv_index, &pdu, ttl, interface) {
                    Ok(0) => {}
                    Ok(_) => self.stats.relayed += 1,
                    Err(e) => debug!(error = %e, "relay failed"),
                }
            }
        }

        if !local_unicast && !self.is_subscribed(pdu.dst) {
            return Ok(());
        }
        self.on_transport_pdu(pdu, key.index, iv_index, rssi, now_ms)
    }

    fn is_subscribed(&self, dst: u16) -> bool {
        dst == ALL_NODES
            || (dst == ALL_RELAYS && self.relay_enabled)
            || self.subscriptions.contains(&dst)
    }

    fn on_transport_pdu(
        &mut self,
        pdu: NetworkPdu,
        net_key_index: NetKeyIndex,
        iv_index: u32,
        rssi: Option<i8>,
        now_ms: u64,
    ) -> Result<(), MeshError> {
        let lower = match LowerPdu::decode(pdu.ctl, &pdu.transport_pdu) {
            Ok(lower) => lower,
            Err(e) => {
                self.stats.malformed_drops += 1;
                debug!(error = %e, "lower transport pdu dropped");
                return Err(e.into());
            }
        };

        match lower {
            LowerPdu::UnsegmentedAccess { akf, aid, upper_pdu } => {
                let rx = RxAccess {
                    net_key_index,
                    iv_index,
                    src: pdu.src,
                    dst: pdu.dst,
                    ttl: pdu.ttl,
                    rssi,
                    seq_auth: pdu.seq,
                    akf,
                    aid,
                    mic: MicSize::Small,
                };
                self.deliver_access(&rx, &upper_pdu)
            }
            LowerPdu::SegmentedAccess { akf, aid, header, segment } => {
                let seg = InboundSegment {
                    net_key_index,
                    iv_index,
                    src: pdu.src,
                    dst: pdu.dst,
                    ttl: pdu.ttl,
                    seq: pdu.seq,
                    kind: SegmentedKind::Access { akf, aid, szmic: header.szmic },
                    header,
                    segment,
                };
                self.on_segment(seg, rssi, now_ms)
            }
            LowerPdu::SegmentedControl { opcode, header, segment } => {
                let seg = InboundSegment {
                    net_key_index,
                    iv_index,
                    src: pdu.src,
                    dst: pdu.dst,
                    ttl: pdu.ttl,
                    seq: pdu.seq,
                    kind: SegmentedKind::Control { opcode },
                    header,
                    segment,
                };
                self.on_segment(seg, rssi, now_ms)
            }
            LowerPdu::UnsegmentedControl { opcode, params } => {
                self.stats.delivered += 1;
                self.events.push(MeshEvent::ControlReceived(ControlMessage {
                    src: pdu.src,
                    dst: pdu.dst,
                    opcode,
                    params,
                    rssi,
                    ttl: pdu.ttl,
                    net_key_index,
                }));
                Ok(())
            }
            LowerPdu::SegmentAck(ack) => {
                // ACK はユニキャストにしか来ない
                if self.config.is_local_element(pdu.dst) {
                    let actions = self.segmenter.on_ack(pdu.src, pdu.dst, &ack);
                    self.apply_segment_actions(actions, now_ms);
                }
                Ok(())
            }
        }
    }

    fn on_segment(&mut self, seg: InboundSegment, rssi: Option<i8>, now_ms: u64) -> Result<(), MeshError> {
        let actions = match self.reassembler.on_segment(seg) {
            Ok(actions) => actions,
            Err(e) => {
                self.stats.malformed_drops += 1;
                debug!(error = %e, "segment dropped");
                return Err(e.into());
            }
        };
        self.apply_reassembly_actions(actions, rssi, now_ms)
    }

    /// 上位 PDU を復号して `AccessReceived` を積む
    fn deliver_access(&mut self, rx: &RxAccess, upper_pdu: &[u8]) -> Result<(), MeshError> {
        let params = UpperParams {
            seq_auth: rx.seq_auth,
            src: rx.src,
            dst: rx.dst,
            iv_index: rx.iv_index,
            mic: rx.mic,
        };
        let decrypted = if rx.akf {
            let candidates = self
                .keys
                .app_keys_by_aid(rx.net_key_index, rx.aid)
                .into_iter()
                .map(|(index, key)| (Some(index), AccessKey::App(key)));
            decrypt_with_candidates(candidates, &self.labels, &params, upper_pdu)
        } else {
            let mut candidates: Vec<(Option<AppKeyIndex>, AccessKey<'_>)> = Vec::with_capacity(2);
            if self.config.is_local_element(rx.dst) {
                if let Some(key) = self.keys.device_key(self.config.primary_address) {
                    candidates.push((None, AccessKey::Device(key)));
                }
            }
            if let Some(key) = self.keys.device_key(rx.src) {
                candidates.push((None, AccessKey::Device(key)));
            }
            decrypt_with_candidates(candidates, &self.labels, &params, upper_pdu)
        };
        let decrypted = match decrypted {
            Ok(d) => d,
            Err(e) => {
                self.stats.auth_failures += 1;
                debug!(
                    src = %format_args!("{:04x}", rx.src),
                    seq_auth = rx.seq_auth,
                    akf = rx.akf,
                    "transmic check failed"
                );
                return Err(e.into());
            }
        };

        let (opcode, params) = match Opcode::parse(&decrypted.access_payload) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.stats.malformed_drops += 1;
                debug!(error = %e, "access payload dropped");
                return Err(e.into());
            }
        };
        self.stats.delivered += 1;
        trace!(
            src = %format_args!("{:04x}", rx.src),
            dst = %format_args!("{:04x}", rx.dst),
            opcode = opcode.as_u32(),
            len = params.len(),
            "access message received"
        );
        let message = AccessMessage {
            src: rx.src,
            dst: rx.dst,
            opcode,
            params: params.to_vec(),
            rssi: rx.rssi,
            ttl: rx.ttl,
            net_key_index: rx.net_key_index,
            app_key_index: decrypted.key,
            label: decrypted.label,
        };
        self.events.push(MeshEvent::AccessReceived(message));
        Ok(())
    }

    // ---- 送信 ----

    /// アクセスメッセージを送る
    ///
    /// 非分割メッセージは即座に送信され、`SendComplete(Ok)` がすぐに積まれる。
    /// 分割メッセージの結果は後で `SendComplete` として届く。
    ///
    /// # エラー
    /// - `SendError::Busy`: 分割送信コンテキストが埋まっている
    /// - `SendError::TooLarge`: 上位 PDU が 384 バイトを超える
    /// - `SendError::UnknownKey`: 鍵が未登録
    /// - `SendError::InvalidAddress`: 送信元がローカル要素でない、宛先が未割り当て、仮想アドレスのラベルが未登録
    /// - `SendError::SequenceExhausted`: SEQ を使い切った
    pub fn send_access(&mut self, request: AccessSend, now_ms: u64) -> Result<SendHandle, SendError> {
        let src = request.src.unwrap_or(self.config.primary_address);
        if !self.config.is_local_element(src) {
            return Err(SendError::InvalidAddress(src));
        }
        let dst = Address::from_u16(request.dst);
        if dst == Address::Unassigned {
            return Err(SendError::InvalidAddress(request.dst));
        }
        let ttl = self.resolve_ttl(request.ttl)?;
        Opcode::parse(&request.payload).map_err(|_| SendError::Encoding("opcode"))?;

        let label = if dst.is_virtual() {
            let label = self
                .labels
                .iter()
                .find(|l| virtual_address(l) == request.dst)
                .ok_or(SendError::InvalidAddress(request.dst))?;
            Some(*label)
        } else {
            None
        };

        let upper_len = request.payload.len() + request.trans_mic.len();
        let segmented = request.ack_required
            || request.trans_mic == MicSize::Large
            || upper_len > MAX_UNSEGMENTED_ACCESS_LEN;
        if segmented {
            if upper_len > MAX_UPPER_PDU_LEN {
                return Err(SendError::TooLarge(upper_len));
            }
            if self.segmenter.is_full() {
                return Err(SendError::Busy);
            }
        }

        let (net_key_index, access_key) = match request.key {
            KeyRef::App(index) => {
                let (net_key_index, key) = self.keys.tx_app_key(index).ok_or(SendError::UnknownKey)?;
                (net_key_index, AccessKey::App(key))
            }
            KeyRef::Device { net_key_index } => {
                let key = self
                    .keys
                    .device_key(request.dst)
                    .or_else(|| self.keys.device_key(self.config.primary_address))
                    .ok_or(SendError::UnknownKey)?;
                (net_key_index, AccessKey::Device(key))
            }
        };
        if self.keys.tx_net_key(net_key_index).is_none() {
            return Err(SendError::UnknownKey);
        }

        let count = if segmented {
            upper_len.div_ceil(ACCESS_SEGMENT_LEN) as u32
        } else {
            1
        };
        let seq_auth = self.seq.reserve(src, count).ok_or(SendError::SequenceExhausted)?;

        let params = UpperParams {
            seq_auth,
            src,
            dst: request.dst,
            iv_index: self.iv.tx_index(),
            mic: request.trans_mic,
        };
        let akf = access_key.akf();
        let aid = access_key.aid();
        let upper_pdu = encrypt(access_key, &params, label.as_ref(), &request.payload)
            .map_err(|_| SendError::Encoding("upper transport"))?;

        let handle = SendHandle(self.next_send_id);
        self.next_send_id = self.next_send_id.wrapping_add(1);

        if !segmented {
            let lower = LowerPdu::UnsegmentedAccess { akf, aid, upper_pdu }.encode();
            self.transmit(net_key_index, false, ttl, seq_auth, src, request.dst, lower)
                .map_err(|_| SendError::Encoding("network"))?;
            debug!(handle = handle.0, seq = seq_auth, "unsegmented access sent");
            self.complete_send(handle, Ok(()));
            return Ok(handle);
        }

        let message = OutboundMessage {
            net_key_index,
            kind: SegmentedKind::Access {
                akf,
                aid,
                szmic: request.trans_mic == MicSize::Large,
            },
            src,
            dst: request.dst,
            ttl,
            seq_auth,
            upper_pdu,
        };
        let (_, actions) = self.segmenter.send(message, handle.0).map_err(|e| match e {
            TransportError::Busy => SendError::Busy,
            TransportError::TooLarge(len) => SendError::TooLarge(len),
            _ => SendError::Encoding("lower transport"),
        })?;
        debug!(handle = handle.0, seq_auth, segments = count, "segmented access started");
        self.apply_segment_actions(actions, now_ms);
        Ok(handle)
    }

    /// 非分割の制御メッセージを送る
    ///
    /// # エラー
    /// - `SendError::Encoding`: opcode が 0x00（Segment Ack）か 7 ビットを超える
    /// - `SendError::TooLarge`: パラメータが 11 バイトを超える
    pub fn send_control(&mut self, request: ControlSend) -> Result<(), SendError> {
        let src = request.src.unwrap_or(self.config.primary_address);
        if !self.config.is_local_element(src) {
            return Err(SendError::InvalidAddress(src));
        }
        if Address::from_u16(request.dst) == Address::Unassigned {
            return Err(SendError::InvalidAddress(request.dst));
        }
        let ttl = self.resolve_ttl(request.ttl)?;
        if request.opcode == OPCODE_SEGMENT_ACK || request.opcode > 0x7F {
            return Err(SendError::Encoding("control opcode"));
        }
        if request.params.len() > MAX_UNSEGMENTED_CONTROL_LEN {
            return Err(SendError::TooLarge(request.params.len()));
        }
        if self.keys.tx_net_key(request.net_key_index).is_none() {
            return Err(SendError::UnknownKey);
        }
        let seq = self.seq.next(src).ok_or(SendError::SequenceExhausted)?;
        let lower = LowerPdu::UnsegmentedControl {
            opcode: request.opcode,
            params: request.params,
        }
        .encode();
        self.transmit(request.net_key_index, true, ttl, seq, src, request.dst, lower)
            .map_err(|_| SendError::Encoding("network"))?;
        Ok(())
    }

    /// 送信中の分割メッセージを取り消す
    ///
    /// 取り消せたら `SendComplete(Cancelled)` が積まれて `true`。
    pub fn cancel_send(&mut self, handle: SendHandle) -> bool {
        let Some(slot) = self.segmenter.handle_of(handle.0) else {
            return false;
        };
        match self.segmenter.cancel(slot) {
            Some(SegmentAction::Complete { send_id, result }) => {
                self.complete_send(SendHandle(send_id), result);
                true
            }
            _ => false,
        }
    }

    /// 送信中の分割メッセージ数
    pub fn sends_in_flight(&self) -> usize {
        self.segmenter.in_flight()
    }

    /// 再組み立て中のメッセージ数
    pub fn reassemblies_in_progress(&self) -> usize {
        self.reassembler.in_progress()
    }

    fn resolve_ttl(&self, ttl: Option<u8>) -> Result<u8, SendError> {
        let ttl = ttl.unwrap_or(self.config.default_ttl);
        if ttl == 1 {
            return Err(SendError::Encoding("ttl"));
        }
        check_ttl(ttl).map_err(|_| SendError::Encoding("ttl"))
    }

    /// Network PDU を組み立ててすべての送信可能インターフェースに流す
    #[allow(clippy::too_many_arguments)]
    fn transmit(
        &mut self,
        net_key_index: NetKeyIndex,
        ctl: bool,
        ttl: u8,
        seq: u32,
        src: u16,
        dst: u16,
        transport_pdu: Vec<u8>,
    ) -> Result<usize, MeshError> {
        let key = self
            .keys
            .tx_net_key(net_key_index)
            .ok_or(ConfigError::UnknownNetKey(net_key_index))?;
        let pdu = NetworkPdu::new(ctl, ttl, seq, src, dst, transport_pdu);
        let frame = encode(key, self.iv.tx_index(), &pdu)?;
        let sent = self.interfaces.transmit(None, &frame, ttl);
        self.stats.tx_pdus += 1;
        trace!(
            src = %format_args!("{:04x}", src),
            dst = %format_args!("{:04x}", dst),
            seq,
            ctl,
            interfaces = sent,
            "network pdu sent"
        );
        Ok(sent)
    }

    fn apply_segment_actions(&mut self, actions: Vec<SegmentAction>, now_ms: u64) {
        for action in actions {
            match action {
                SegmentAction::Transmit(segment) => {
                    let retransmission = segment.seq.is_none();
                    let seq = match segment.seq {
                        Some(seq) => seq,
                        None => match self.seq.next(segment.src) {
                            Some(seq) => seq,
                            None => {
                                warn!(
                                    src = %format_args!("{:04x}", segment.src),
                                    "sequence exhausted during retransmission, abandoning sends"
                                );
                                for abandoned in self.segmenter.abandon_from(segment.src) {
                                    if let SegmentAction::Complete { send_id, result } = abandoned {
                                        self.complete_send(SendHandle(send_id), result);
                                    }
                                }
                                continue;
                            }
                        },
                    };
                    let lower = segment.lower_pdu.encode();
                    match self.transmit(
                        segment.net_key_index,
                        segment.ctl,
                        segment.ttl,
                        seq,
                        segment.src,
                        segment.dst,
                        lower,
                    ) {
                        Ok(_) if retransmission => self.stats.segments_retransmitted += 1,
                        Ok(_) => self.stats.segments_sent += 1,
                        Err(e) => warn!(error = %e, "segment transmit failed"),
                    }
                }
                SegmentAction::Schedule { token, delay_ms } => {
                    self.timers.schedule(token, now_ms + u64::from(delay_ms));
                }
                SegmentAction::Complete { send_id, result } => {
                    self.complete_send(SendHandle(send_id), result);
                }
            }
        }
    }

    fn apply_reassembly_actions(
        &mut self,
        actions: Vec<ReassemblyAction>,
        rssi: Option<i8>,
        now_ms: u64,
    ) -> Result<(), MeshError> {
        let mut first_error = None;
        for action in actions {
            let result = match action {
                ReassemblyAction::Deliver(message) => match message.kind {
                    SegmentedKind::Access { akf, aid, szmic } => {
                        let rx = RxAccess {
                            net_key_index: message.net_key_index,
                            iv_index: message.iv_index,
                            src: message.src,
                            dst: message.dst,
                            ttl: message.ttl,
                            rssi,
                            seq_auth: message.seq_auth,
                            akf,
                            aid,
                            mic: if szmic { MicSize::Large } else { MicSize::Small },
                        };
                        self.deliver_access(&rx, &message.upper_pdu)
                    }
                    SegmentedKind::Control { opcode } => {
                        self.stats.delivered += 1;
                        self.events.push(MeshEvent::ControlReceived(ControlMessage {
                            src: message.src,
                            dst: message.dst,
                            opcode,
                            params: message.upper_pdu,
                            rssi,
                            ttl: message.ttl,
                            net_key_index: message.net_key_index,
                        }));
                        Ok(())
                    }
                },
                ReassemblyAction::SendAck(ack) => self.send_ack(ack),
                ReassemblyAction::Schedule { token, delay_ms } => {
                    self.timers.schedule(token, now_ms + u64::from(delay_ms));
                    Ok(())
                }
            };
            if let Err(e) = result {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn send_ack(&mut self, ack: OutboundAck) -> Result<(), MeshError> {
        let Some(seq) = self.seq.next(ack.src) else {
            return Ok(());
        };
        let lower = LowerPdu::SegmentAck(ack.ack).encode();
        self.transmit(ack.net_key_index, true, ack.ttl, seq, ack.src, ack.dst, lower)?;
        self.stats.acks_sent += 1;
        Ok(())
    }

    fn complete_send(&mut self, handle: SendHandle, result: Result<(), SendFailure>) {
        self.stats.sends_completed += 1;
        match result {
            Ok(()) => debug!(handle = handle.0, "send complete"),
            Err(failure) => {
                self.stats.send_failures += 1;
                info!(handle = handle.0, %failure, "send failed");
            }
        }
        self.events.push(MeshEvent::SendComplete { handle, result });
    }

    // ---- 時間 ----

    /// 期限を過ぎたタイマーをすべて処理する
    pub fn tick(&mut self, now_ms: u64) {
        while let Some(token) = self.timers.pop_due(now_ms) {
            match token.kind {
                TimerKind::SegmentRetransmit => {
                    let actions = self.segmenter.on_timer(token);
                    self.apply_segment_actions(actions, now_ms);
                }
                TimerKind::ReassemblyAck | TimerKind::ReassemblyIncomplete => {
                    let actions = self.reassembler.on_timer(token);
                    if let Err(e) = self.apply_reassembly_actions(actions, None, now_ms) {
                        debug!(error = %e, "reassembly timer action failed");
                    }
                }
            }
        }
        self.discard_stale_timers();
    }

    /// 次にタイマーが切れる時刻
    ///
    /// 終わったコンテキストのタイマーは数えない。
    pub fn next_deadline(&mut self) -> Option<u64> {
        self.discard_stale_timers();
        self.timers.next_deadline()
    }

    fn discard_stale_timers(&mut self) {
        let segmenter = &self.segmenter;
        let reassembler = &self.reassembler;
        let discarded = self.timers.discard_stale(|token| match token.kind {
            TimerKind::SegmentRetransmit => segmenter.is_timer_live(token),
            TimerKind::ReassemblyAck | TimerKind::ReassemblyIncomplete => {
                reassembler.is_timer_live(token)
            }
        });
        if discarded > 0 {
            trace!(discarded, "stale timers discarded");
        }
    }

    /// 溜まったイベントを取り出す
    pub fn take_events(&mut self) -> Vec<MeshEvent> {
        core::mem::take(&mut self.events)
    }

    // ---- IV Index ----

    pub fn iv_index(&self) -> IvIndex {
        self.iv
    }

    /// IV Index を設定する（プロビジョニング・IV Recovery）
    ///
    /// 送信用 IV Index が変わると SEQ は 0 に戻る。
    ///
    /// # エラー
    /// - `ConfigError::InvalidValue`: 現在より小さい値
    pub fn set_iv_index(&mut self, index: u32, update_in_progress: bool) -> Result<(), MeshError> {
        if index < self.iv.index {
            return Err(ConfigError::InvalidValue("iv_index").into());
        }
        let next = IvIndex::new(index, update_in_progress);
        if next.tx_index() != self.iv.tx_index() {
            self.seq.reset();
        }
        self.iv = next;
        self.replay.set_iv_index(index);
        let pruned = self.replay.prune();
        info!(index, update_in_progress, pruned, "iv index set");
        Ok(())
    }

    /// IV Update を開始する（index + 1、更新中フラグ付き）
    ///
    /// 既に更新中、または上限に達していれば `false`。
    pub fn begin_iv_update(&mut self) -> bool {
        if self.iv.update_in_progress {
            return false;
        }
        let Some(index) = self.iv.index.checked_add(1) else {
            return false;
        };
        self.iv = IvIndex::new(index, true);
        self.replay.set_iv_index(index);
        info!(index, "iv update started");
        true
    }

    /// IV Update を完了する。SEQ は 0 に戻り、古い IV のリプレイ記録は消える
    pub fn complete_iv_update(&mut self) -> bool {
        if !self.iv.update_in_progress {
            return false;
        }
        self.iv.update_in_progress = false;
        self.seq.reset();
        let pruned = self.replay.prune();
        info!(index = self.iv.index, pruned, "iv update completed");
        true
    }

    // ---- 購読 ----

    /// グループ・仮想アドレスを購読する
    ///
    /// # エラー
    /// - `MeshError::InvalidAddress`: ユニキャスト・未割り当てアドレス
    pub fn subscribe(&mut self, address: u16) -> Result<(), MeshError> {
        if !Address::from_u16(address).is_multicast() {
            return Err(MeshError::InvalidAddress(address));
        }
        if !self.subscriptions.contains(&address) {
            self.subscriptions.push(address);
        }
        Ok(())
    }

    pub fn unsubscribe(&mut self, address: u16) -> bool {
        let before = self.subscriptions.len();
        self.subscriptions.retain(|a| *a != address);
        self.subscriptions.len() != before
    }

    /// Label UUID を登録して仮想アドレスを返す（送信・復号に使う）
    pub fn add_virtual_label(&mut self, label: [u8; 16]) -> u16 {
        if !self.labels.contains(&label) {
            self.labels.push(label);
        }
        virtual_address(&label)
    }

    /// Label UUID を登録し、その仮想アドレスを購読する
    pub fn subscribe_virtual(&mut self, label: [u8; 16]) -> u16 {
        let address = self.add_virtual_label(label);
        if !self.subscriptions.contains(&address) {
            self.subscriptions.push(address);
        }
        address
    }

    pub fn subscriptions(&self) -> &[u16] {
        &self.subscriptions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;
    use crate::keystore::MemoryKeyStore;
    use crate::seq::MemorySequenceStore;
    use mesh_bearer::AdvertisingBearer;

    const NET_KEY: [u8; 16] = [0x7d, 0xd7, 0x36, 0x4c, 0xd8, 0x42, 0xad, 0x18, 0xc1, 0x7c, 0x2b, 0x82, 0x0c, 0x84, 0xc3, 0xd6];
    const APP_KEY: [u8; 16] = [0x63, 0x96, 0x47, 0x71, 0x73, 0x4f, 0xbd, 0x76, 0xe3, 0xb4, 0x05, 0x19, 0xd1, 0xd9, 0x4a, 0x48];

    type Node = MeshContext<MemoryKeyStore, MemorySequenceStore>;

    fn node(address: u16) -> (Node, InterfaceId) {
        let mut keys = MemoryKeyStore::new();
        keys.add_net_key(0, NET_KEY).unwrap();
        keys.add_app_key(0, 0, APP_KEY).unwrap();
        let config = MeshConfig {
            primary_address: address,
            ..MeshConfig::default()
        };
        let mut ctx = MeshContext::new(config, keys, MemorySequenceStore::new()).unwrap();
        let id = ctx
            .register_interface(Box::new(AdvertisingBearer::new(64, 0)))
            .unwrap();
        (ctx, id)
    }

    fn deliver_all(from: &mut Node, from_if: InterfaceId, to: &mut Node, to_if: InterfaceId, now: u64) {
        for frame in from.drain_bearer(from_if) {
            let _ = to.on_bearer_pdu(to_if, &frame, Some(-50), now);
        }
    }

    #[test]
    fn test_rejects_invalid_config() {
        let config = MeshConfig {
            default_ttl: 1,
            ..MeshConfig::default()
        };
        let result = MeshContext::new(config, MemoryKeyStore::new(), MemorySequenceStore::new());
        assert!(matches!(result, Err(ConfigError::InvalidValue("default_ttl"))));
    }

    #[test]
    fn test_unsegmented_access_roundtrip() {
        let (mut a, a_if) = node(0x0001);
        let (mut b, b_if) = node(0x0002);

        let handle = a
            .send_access(AccessSend::new(0x0002, KeyRef::App(0), vec![0x82, 0x02, 0x01]), 0)
            .unwrap();
        assert_eq!(
            a.take_events(),
            vec![MeshEvent::SendComplete { handle, result: Ok(()) }]
        );

        deliver_all(&mut a, a_if, &mut b, b_if, 0);
        let events = b.take_events();
        assert_eq!(events.len(), 1);
        match &events[0] {
            MeshEvent::AccessReceived(msg) => {
                assert_eq!(msg.src, 0x0001);
                assert_eq!(msg.dst, 0x0002);
                assert_eq!(msg.opcode, Opcode::Double(0x8202));
                assert_eq!(msg.params, vec![0x01]);
                assert_eq!(msg.app_key_index, Some(0));
                assert_eq!(msg.rssi, Some(-50));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_replayed_pdu_is_rejected() {
        let (mut a, a_if) = node(0x0001);
        let (mut b, b_if) = node(0x0002);
        a.send_access(AccessSend::new(0x0002, KeyRef::App(0), vec![0x01]), 0)
            .unwrap();
        let frames = a.drain_bearer(a_if);
        assert_eq!(frames.len(), 1);

        assert!(b.on_bearer_pdu(b_if, &frames[0], None, 0).is_ok());
        assert_eq!(
            b.on_bearer_pdu(b_if, &frames[0], None, 0),
            Err(MeshError::Network(NetworkError::ReplayRejected))
        );
        assert_eq!(b.stats().replay_drops, 1);
        assert_eq!(b.stats().delivered, 1);
    }

    #[test]
    fn test_own_pdu_is_dropped() {
        let (mut a, a_if) = node(0x0001);
        a.send_access(AccessSend::new(0x0002, KeyRef::App(0), vec![0x01]), 0)
            .unwrap();
        let frames = a.drain_bearer(a_if);
        assert!(a.on_bearer_pdu(a_if, &frames[0], None, 0).is_ok());
        assert_eq!(a.stats().own_src_drops, 1);
        // リレーもしない
        assert!(a.drain_bearer(a_if).is_empty());
    }

    #[test]
    fn test_unknown_key_and_bad_addresses() {
        let (mut a, _) = node(0x0001);
        assert_eq!(
            a.send_access(AccessSend::new(0x0002, KeyRef::App(9), vec![0x01]), 0),
            Err(SendError::UnknownKey)
        );
        assert_eq!(
            a.send_access(AccessSend::new(0x0000, KeyRef::App(0), vec![0x01]), 0),
            Err(SendError::InvalidAddress(0x0000))
        );
        let mut foreign = AccessSend::new(0x0002, KeyRef::App(0), vec![0x01]);
        foreign.src = Some(0x0005);
        assert_eq!(a.send_access(foreign, 0), Err(SendError::InvalidAddress(0x0005)));
        // ラベル未登録の仮想アドレス
        assert_eq!(
            a.send_access(AccessSend::new(0x8123, KeyRef::App(0), vec![0x01]), 0),
            Err(SendError::InvalidAddress(0x8123))
        );
        assert_eq!(
            a.send_access(AccessSend::new(0x0002, KeyRef::App(0), Vec::new()), 0),
            Err(SendError::Encoding("opcode"))
        );
    }

    #[test]
    fn test_too_large_and_busy() {
        let (mut a, _) = node(0x0001);
        let big = vec![0x01; MAX_UPPER_PDU_LEN];
        assert_eq!(
            a.send_access(AccessSend::new(0x0002, KeyRef::App(0), big), 0),
            Err(SendError::TooLarge(MAX_UPPER_PDU_LEN + 4))
        );

        let seq_before = a.seq.current(0x0001);
        for _ in 0..2 {
            a.send_access(AccessSend::new(0x0002, KeyRef::App(0), vec![0x01; 40]), 0)
                .unwrap();
        }
        assert_eq!(a.sends_in_flight(), 2);
        let seq_used = a.seq.current(0x0001);
        assert_eq!(
            a.send_access(AccessSend::new(0x0002, KeyRef::App(0), vec![0x01; 40]), 0),
            Err(SendError::Busy)
        );
        // Busy では SEQ を消費しない
        assert_eq!(a.seq.current(0x0001), seq_used);
        assert_eq!(seq_used - seq_before, 8);
    }

    #[test]
    fn test_cancel_send_emits_cancelled() {
        let (mut a, _) = node(0x0001);
        let handle = a
            .send_access(AccessSend::new(0x0002, KeyRef::App(0), vec![0x01; 30]), 0)
            .unwrap();
        assert!(a.cancel_send(handle));
        assert!(!a.cancel_send(handle));
        assert_eq!(
            a.take_events(),
            vec![MeshEvent::SendComplete {
                handle,
                result: Err(SendFailure::Cancelled)
            }]
        );
        assert_eq!(a.sends_in_flight(), 0);
    }

    #[test]
    fn test_sequence_exhaustion_during_retransmission_fails_send() {
        let mut keys = MemoryKeyStore::new();
        keys.add_net_key(0, NET_KEY).unwrap();
        keys.add_app_key(0, 0, APP_KEY).unwrap();
        let mut seq = MemorySequenceStore::new();
        // 最初の 3 セグメント分しか残っていない
        seq.restore(0x0001, mesh_proto::SEQ_MAX - 2);
        let mut a = MeshContext::new(MeshConfig::default(), keys, seq).unwrap();
        let a_if = a
            .register_interface(Box::new(AdvertisingBearer::new(64, 0)))
            .unwrap();

        let handle = a
            .send_access(AccessSend::new(0x0002, KeyRef::App(0), vec![0x01; 30]), 0)
            .unwrap();
        assert_eq!(a.drain_bearer(a_if).len(), 3);

        a.tick(550);
        assert!(a.drain_bearer(a_if).is_empty());
        assert_eq!(
            a.take_events(),
            vec![MeshEvent::SendComplete {
                handle,
                result: Err(SendFailure::SendFailed)
            }]
        );
        assert_eq!(a.sends_in_flight(), 0);
        assert_eq!(a.next_deadline(), None);
    }

    #[test]
    fn test_no_deadline_left_after_transfer_completes() {
        let (mut a, a_if) = node(0x0001);
        let (mut b, b_if) = node(0x0002);
        a.send_access(AccessSend::new(0x0002, KeyRef::App(0), vec![0x01; 200]), 0)
            .unwrap();
        deliver_all(&mut a, a_if, &mut b, b_if, 10);
        deliver_all(&mut b, b_if, &mut a, a_if, 20);

        assert_eq!(b.reassemblies_in_progress(), 0);
        assert_eq!(a.sends_in_flight(), 0);
        assert_eq!(b.next_deadline(), None);
        assert_eq!(a.next_deadline(), None);
    }

    #[test]
    fn test_last_interface_removal_cancels_sends() {
        let (mut a, a_if) = node(0x0001);
        let handle = a
            .send_access(AccessSend::new(0x0002, KeyRef::App(0), vec![0x01; 30]), 0)
            .unwrap();
        assert!(a.unregister_interface(a_if).is_some());
        assert_eq!(
            a.take_events(),
            vec![MeshEvent::SendComplete {
                handle,
                result: Err(SendFailure::Cancelled)
            }]
        );
    }

    #[test]
    fn test_control_message() {
        let (mut a, a_if) = node(0x0001);
        let (mut b, b_if) = node(0x0002);
        let request = ControlSend {
            src: None,
            dst: 0x0002,
            net_key_index: 0,
            opcode: 0x0A,
            params: vec![1, 2, 3],
            ttl: Some(0),
        };
        a.send_control(request.clone()).unwrap();
        deliver_all(&mut a, a_if, &mut b, b_if, 0);
        assert_eq!(
            b.take_events(),
            vec![MeshEvent::ControlReceived(ControlMessage {
                src: 0x0001,
                dst: 0x0002,
                opcode: 0x0A,
                params: vec![1, 2, 3],
                rssi: Some(-50),
                ttl: 0,
                net_key_index: 0,
            })]
        );

        let ack_opcode = ControlSend { opcode: 0x00, ..request.clone() };
        assert_eq!(a.send_control(ack_opcode), Err(SendError::Encoding("control opcode")));
        let too_long = ControlSend { params: vec![0; 12], ..request };
        assert_eq!(a.send_control(too_long), Err(SendError::TooLarge(12)));
    }

    #[test]
    fn test_subscriptions() {
        let (mut a, _) = node(0x0001);
        assert_eq!(a.subscribe(0x0005), Err(MeshError::InvalidAddress(0x0005)));
        assert!(a.subscribe(0xC001).is_ok());
        assert!(a.subscribe(0xC001).is_ok());
        assert_eq!(a.subscriptions(), &[0xC001]);
        let label = [0x55u8; 16];
        let va = a.subscribe_virtual(label);
        assert!(Address::from_u16(va).is_virtual());
        assert!(a.unsubscribe(0xC001));
        assert!(!a.unsubscribe(0xC001));
        assert_eq!(a.subscriptions(), &[va]);
    }

    #[test]
    fn test_iv_update_resets_sequence() {
        let (mut a, _) = node(0x0001);
        a.send_access(AccessSend::new(0x0002, KeyRef::App(0), vec![0x01]), 0)
            .unwrap();
        assert_eq!(a.seq.current(0x0001), 1);

        assert!(a.begin_iv_update());
        assert!(!a.begin_iv_update());
        assert_eq!(a.iv_index(), IvIndex::new(1, true));
        assert_eq!(a.iv_index().tx_index(), 0);
        // 更新中は旧 IV で送り続けるので SEQ はそのまま
        assert_eq!(a.seq.current(0x0001), 1);

        assert!(a.complete_iv_update());
        assert!(!a.complete_iv_update());
        assert_eq!(a.seq.current(0x0001), 0);
        assert_eq!(
            a.set_iv_index(0, false),
            Err(MeshError::Config(ConfigError::InvalidValue("iv_index")))
        );
    }
}
