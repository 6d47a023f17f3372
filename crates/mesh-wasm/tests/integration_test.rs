//! mesh-wasm 統合テスト
//!
//! 複数の `MeshContext` ノードをメモリ上のベアラでつなぎ、
//! ネットワーク層 + 下位トランスポート層の完全なパイプラインをテストする。
//! ベアラ間のフレーム受け渡し（と取りこぼし）はテスト側が行う。

use mesh_bearer::{AdvertisingBearer, GattProxyBearer};
use mesh_core::{
    AccessMessage, AccessSend, ControlSend, KeyRef, KeyRefreshPhase, MemoryKeyStore,
    MemorySequenceStore, MeshConfig, MeshContext, MeshError, MeshEvent, SendHandle,
};
use mesh_crypto::{MicSize, NetKeyMaterial};
use mesh_network::{decode, encode, InterfaceId, NetworkError, NetworkPdu, ReplayCache};
use mesh_proto::{IvIndex, Opcode};
use mesh_transport::{LowerPdu, SegmentAck, SendFailure};

// ==============================================================
// ヘルパー
// ==============================================================

type Node = MeshContext<MemoryKeyStore, MemorySequenceStore>;

/// Mesh Profile のサンプルデータの鍵
const NET_KEY: [u8; 16] = [
    0x7d, 0xd7, 0x36, 0x4c, 0xd8, 0x42, 0xad, 0x18, 0xc1, 0x7c, 0x2b, 0x82, 0x0c, 0x84, 0xc3, 0xd6,
];
const NEW_NET_KEY: [u8; 16] = [
    0xf7, 0xa2, 0xa4, 0x4f, 0x8e, 0x8a, 0x80, 0x29, 0x06, 0x4f, 0x17, 0x3d, 0xdc, 0x1e, 0x2b, 0x00,
];
const APP_KEY: [u8; 16] = [
    0x63, 0x96, 0x47, 0x71, 0x73, 0x4f, 0xbd, 0x76, 0xe3, 0xb4, 0x05, 0x19, 0xd1, 0xd9, 0x4a, 0x48,
];
const DEV_KEY: [u8; 16] = [
    0x9d, 0x6d, 0xd0, 0xe9, 0x6e, 0xb2, 0x5d, 0xc1, 0x9a, 0x40, 0xed, 0x99, 0x14, 0xf8, 0xf0, 0x3f,
];

/// ユニキャスト分割送信の再送タイマー（200 + 50 × TTL 7）
const RETRANS_MS: u64 = 550;
/// ACK タイマー（150 + 50 × TTL 7）
const ACK_MS: u64 = 500;

fn node_with(config: MeshConfig) -> Node {
    let mut keys = MemoryKeyStore::new();
    keys.add_net_key(0, NET_KEY).unwrap();
    keys.add_app_key(0, 0, APP_KEY).unwrap();
    MeshContext::new(config, keys, MemorySequenceStore::new()).unwrap()
}

fn node(address: u16) -> Node {
    node_with(MeshConfig {
        primary_address: address,
        ..MeshConfig::default()
    })
}

fn adv(node: &mut Node) -> InterfaceId {
    node.register_interface(Box::new(AdvertisingBearer::new(64, 0)))
        .unwrap()
}

/// `from` の送信待ちフレームをすべて `to` に渡し、渡した数を返す
fn pump(from: &mut Node, from_if: InterfaceId, to: &mut Node, to_if: InterfaceId, now_ms: u64) -> usize {
    let frames = from.drain_bearer(from_if);
    let n = frames.len();
    for frame in frames {
        let _ = to.on_bearer_pdu(to_if, &frame, Some(-60), now_ms);
    }
    n
}

fn access_messages(events: &[MeshEvent]) -> Vec<AccessMessage> {
    events
        .iter()
        .filter_map(|e| match e {
            MeshEvent::AccessReceived(m) => Some(m.clone()),
            _ => None,
        })
        .collect()
}

fn completions(events: &[MeshEvent]) -> Vec<(SendHandle, Result<(), SendFailure>)> {
    events
        .iter()
        .filter_map(|e| match e {
            MeshEvent::SendComplete { handle, result } => Some((*handle, *result)),
            _ => None,
        })
        .collect()
}

/// opcode 0x01 + パラメータ（`len` バイトのアクセスペイロード）
fn payload(len: usize) -> Vec<u8> {
    let mut p = vec![0x01];
    p.extend((0..len - 1).map(|i| i as u8));
    p
}

/// 期限のタイマーがなくなるまで時間を進める
fn run_timers(node: &mut Node) {
    while let Some(deadline) = node.next_deadline() {
        node.tick(deadline);
    }
}

// ==============================================================
// テスト
// ==============================================================

/// NetKey 0, IVI=0, seq=5, 0x0001 → 0x0002, 14 バイトの TransportPDU
#[test]
fn test_network_codec_concrete_scenario() {
    let key = NetKeyMaterial::derive(NET_KEY);
    let pdu = NetworkPdu::new(false, 7, 5, 0x0001, 0x0002, (0u8..14).collect());
    let bytes = encode(&key, 0, &pdu).unwrap();
    assert_eq!(bytes[0] & 0x80, 0, "IVI は 0");

    let iv = IvIndex::new(0, false);
    let decoded = decode([(0u16, &key)], iv, &bytes).unwrap();
    assert_eq!(decoded.key, 0);
    assert_eq!(decoded.iv_index, 0);
    assert!(!decoded.pdu.ctl);
    assert_eq!(decoded.pdu.ttl, 7);
    assert_eq!(decoded.pdu.seq, 5);
    assert_eq!(decoded.pdu.src, 0x0001);
    assert_eq!(decoded.pdu.dst, 0x0002);
    assert_eq!(decoded.pdu.transport_pdu, pdu.transport_pdu);

    let mut replay = ReplayCache::with_capacity(4);
    assert!(replay.accept(decoded.pdu.src, decoded.pdu.seq, decoded.iv_index));
    let again = decode([(0u16, &key)], iv, &bytes).unwrap();
    assert!(!replay.accept(again.pdu.src, again.pdu.seq, again.iv_index));

    // ノードに流しても 2 回目はリプレイで止まる
    let mut b = node(0x0002);
    let b_if = adv(&mut b);
    let _ = b.on_bearer_pdu(b_if, &bytes, None, 0);
    assert_eq!(
        b.on_bearer_pdu(b_if, &bytes, None, 0),
        Err(MeshError::Network(NetworkError::ReplayRejected))
    );
}

/// 200 バイトのアクセスメッセージを分割送信し、ACK で完了する
#[test]
fn test_segmented_unicast_200_bytes() {
    let mut a = node(0x0001);
    let mut b = node(0x0002);
    let a_if = adv(&mut a);
    let b_if = adv(&mut b);

    let data = payload(200);
    let handle = a
        .send_access(AccessSend::new(0x0002, KeyRef::App(0), data.clone()), 0)
        .unwrap();
    assert!(a.take_events().is_empty());

    // 204 バイト（+TransMIC）= 17 セグメント
    assert_eq!(pump(&mut a, a_if, &mut b, b_if, 10), 17);
    let received = access_messages(&b.take_events());
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].opcode, Opcode::Single(0x01));
    assert_eq!(received[0].params, data[1..].to_vec());
    assert_eq!(received[0].app_key_index, Some(0));
    assert_eq!(b.stats().acks_sent, 1);

    assert_eq!(pump(&mut b, b_if, &mut a, a_if, 20), 1);
    assert_eq!(completions(&a.take_events()), vec![(handle, Ok(()))]);
    assert_eq!(a.sends_in_flight(), 0);
    assert_eq!(a.stats().segments_sent, 17);

    // 終わった転送のタイマーでホストを起こさない
    assert_eq!(a.next_deadline(), None);
    assert_eq!(b.next_deadline(), None);

    run_timers(&mut a);
    run_timers(&mut b);
    assert!(a.drain_bearer(a_if).is_empty());
    assert!(b.drain_bearer(b_if).is_empty());
    assert!(a.take_events().is_empty());
    assert!(b.take_events().is_empty());
}

/// 1 セグメントを取りこぼすと、部分 ACK で欠けたセグメントだけが再送される
#[test]
fn test_lost_segment_is_retransmitted_alone() {
    let mut a = node(0x0001);
    let mut b = node(0x0002);
    let a_if = adv(&mut a);
    let b_if = adv(&mut b);

    // 44 バイト = 4 セグメント
    let handle = a
        .send_access(AccessSend::new(0x0002, KeyRef::App(0), payload(40)), 0)
        .unwrap();
    let frames = a.drain_bearer(a_if);
    assert_eq!(frames.len(), 4);
    for (i, frame) in frames.iter().enumerate() {
        if i != 2 {
            let _ = b.on_bearer_pdu(b_if, frame, None, 0);
        }
    }
    assert_eq!(b.reassemblies_in_progress(), 1);
    assert!(b.drain_bearer(b_if).is_empty(), "ACK はタイマーまで遅らせる");

    b.tick(ACK_MS);
    assert_eq!(pump(&mut b, b_if, &mut a, a_if, ACK_MS), 1);

    let retransmitted = a.drain_bearer(a_if);
    assert_eq!(retransmitted.len(), 1, "欠けた 1 セグメントだけを再送");
    assert_eq!(a.stats().segments_retransmitted, 1);

    // 古い再送タイマー（epoch 0）は無視される
    a.tick(RETRANS_MS);
    assert!(a.drain_bearer(a_if).is_empty());

    let _ = b.on_bearer_pdu(b_if, &retransmitted[0], None, ACK_MS + 10);
    assert_eq!(access_messages(&b.take_events()).len(), 1);
    assert_eq!(pump(&mut b, b_if, &mut a, a_if, ACK_MS + 20), 1);
    assert_eq!(completions(&a.take_events()), vec![(handle, Ok(()))]);
}

/// ACK が来ないまま再送回数を使い切ると SendFailed で終わり、コンテキストが空く
#[test]
fn test_abandonment_after_retransmissions() {
    let mut a = node(0x0001);
    let a_if = adv(&mut a);

    let handle = a
        .send_access(AccessSend::new(0x0002, KeyRef::App(0), payload(40)), 0)
        .unwrap();
    let _ = a
        .send_access(AccessSend::new(0x0003, KeyRef::App(0), payload(40)), 0)
        .unwrap();
    assert_eq!(
        a.send_access(AccessSend::new(0x0004, KeyRef::App(0), payload(40)), 0),
        Err(mesh_core::SendError::Busy)
    );
    assert!(a.cancel_send(SendHandle(1)));
    a.take_events();

    run_timers(&mut a);
    assert_eq!(
        completions(&a.take_events()),
        vec![(handle, Err(SendFailure::SendFailed))]
    );
    // 3 回 × 4 セグメント
    assert_eq!(a.stats().segments_retransmitted, 12);
    assert_eq!(a.drain_bearer(a_if).len(), 4 + 4 + 12);
    assert_eq!(a.sends_in_flight(), 0);

    // プールが空いたので次の送信を受け付ける
    assert!(a
        .send_access(AccessSend::new(0x0002, KeyRef::App(0), payload(40)), 0)
        .is_ok());
}

/// 同時分割送信数を超えた要求は Busy で、進行中の送信は壊れない
#[test]
fn test_busy_does_not_disturb_existing_sends() {
    let mut a = node(0x0001);
    let mut b = node(0x0002);
    let a_if = adv(&mut a);
    let b_if = adv(&mut b);

    let first = a
        .send_access(AccessSend::new(0x0002, KeyRef::App(0), payload(30)), 0)
        .unwrap();
    let second = a
        .send_access(AccessSend::new(0x0002, KeyRef::App(0), payload(50)), 0)
        .unwrap();
    for _ in 0..3 {
        assert_eq!(
            a.send_access(AccessSend::new(0x0002, KeyRef::App(0), payload(20)), 0),
            Err(mesh_core::SendError::Busy)
        );
    }

    pump(&mut a, a_if, &mut b, b_if, 5);
    let received = access_messages(&b.take_events());
    assert_eq!(received.len(), 2);
    assert_eq!(received[0].params.len(), 29);
    assert_eq!(received[1].params.len(), 49);

    pump(&mut b, b_if, &mut a, a_if, 10);
    assert_eq!(
        completions(&a.take_events()),
        vec![(first, Ok(())), (second, Ok(()))]
    );
}

/// A ─ B(relay) ─ C: リプレイキャッシュにある PDU はどのインターフェースにも転送しない
#[test]
fn test_relay_suppression_three_nodes() {
    let mut a = node(0x0001);
    let mut b = node(0x0002);
    let mut c = node(0x0003);
    let a_if = adv(&mut a);
    let b_to_a = adv(&mut b);
    let b_to_c = b
        .register_interface(Box::new(GattProxyBearer::new(16)))
        .unwrap();
    let c_if = adv(&mut c);

    a.send_access(AccessSend::new(0x0003, KeyRef::App(0), vec![0x01, 0xAA]), 0)
        .unwrap();
    let frames = a.drain_bearer(a_if);
    assert_eq!(frames.len(), 1);

    assert!(b.on_bearer_pdu(b_to_a, &frames[0], None, 0).is_ok());
    assert!(b.drain_bearer(b_to_a).is_empty(), "受信元には送り返さない");
    let relayed = b.drain_bearer(b_to_c);
    assert_eq!(relayed.len(), 1);
    assert_eq!(b.stats().relayed, 1);
    assert!(access_messages(&b.take_events()).is_empty());

    // 同じ PDU をもう一度: リプレイで止まり、転送しない
    assert_eq!(
        b.on_bearer_pdu(b_to_a, &frames[0], None, 1),
        Err(MeshError::Network(NetworkError::ReplayRejected))
    );
    // リレーされた PDU が反対側から戻ってきても転送しない
    assert_eq!(
        b.on_bearer_pdu(b_to_c, &relayed[0], None, 2),
        Err(MeshError::Network(NetworkError::ReplayRejected))
    );
    assert!(b.drain_bearer(b_to_a).is_empty());
    assert!(b.drain_bearer(b_to_c).is_empty());
    assert_eq!(b.stats().relayed, 1);
    assert_eq!(b.stats().replay_drops, 2);

    assert!(c.on_bearer_pdu(c_if, &relayed[0], None, 3).is_ok());
    let received = access_messages(&c.take_events());
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].src, 0x0001);
    assert_eq!(received[0].ttl, 6, "リレーで TTL が 1 減る");
    assert_eq!(received[0].params, vec![0xAA]);
}

/// リレーが無効なら転送しない
#[test]
fn test_relay_disabled() {
    let mut a = node(0x0001);
    let mut b = node(0x0002);
    let a_if = adv(&mut a);
    let b_to_a = adv(&mut b);
    let b_to_c = adv(&mut b);
    b.set_relay_enabled(false);

    a.send_access(AccessSend::new(0x0003, KeyRef::App(0), vec![0x01]), 0)
        .unwrap();
    pump(&mut a, a_if, &mut b, b_to_a, 0);
    assert!(b.drain_bearer(b_to_c).is_empty());
    assert_eq!(b.stats().relayed, 0);
}

/// グループ宛ての分割送信は ACK を待たずに決まった回数だけ再送して完了する
#[test]
fn test_group_blind_retransmission() {
    let mut a = node(0x0001);
    let mut b = node(0x0002);
    let a_if = adv(&mut a);
    let b_if = adv(&mut b);
    b.subscribe(0xC000).unwrap();

    // 34 バイト = 3 セグメント
    let handle = a
        .send_access(AccessSend::new(0xC000, KeyRef::App(0), payload(30)), 0)
        .unwrap();
    assert_eq!(pump(&mut a, a_if, &mut b, b_if, 0), 3);
    let received = access_messages(&b.take_events());
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].dst, 0xC000);

    // 300 ms ごとに 3 回
    for round in 1..=3u64 {
        a.tick(300 * round);
        assert_eq!(pump(&mut a, a_if, &mut b, b_if, 300 * round), 3);
    }
    assert_eq!(completions(&a.take_events()), vec![(handle, Ok(()))]);
    assert_eq!(a.sends_in_flight(), 0);

    // 再送分は重複として捨てられ、ACK も返さない
    assert!(b.take_events().is_empty());
    assert_eq!(b.stats().acks_sent, 0);
    assert!(b.drain_bearer(b_if).is_empty());
}

/// 再送回数 0 のグループ宛て分割送信は即座に完了する
#[test]
fn test_group_send_without_retransmissions_completes_immediately() {
    let mut a = node_with(MeshConfig {
        nb_seg_packet_retrans: 0,
        ..MeshConfig::default()
    });
    let a_if = adv(&mut a);
    let handle = a
        .send_access(AccessSend::new(0xC001, KeyRef::App(0), payload(30)), 0)
        .unwrap();
    assert_eq!(completions(&a.take_events()), vec![(handle, Ok(()))]);
    assert_eq!(a.drain_bearer(a_if).len(), 3);
    assert_eq!(a.sends_in_flight(), 0);
}

/// 未購読のグループ宛ては配送しない
#[test]
fn test_unsubscribed_group_is_not_delivered() {
    let mut a = node(0x0001);
    let mut b = node(0x0002);
    let a_if = adv(&mut a);
    let b_if = adv(&mut b);

    a.send_access(AccessSend::new(0xC123, KeyRef::App(0), vec![0x01]), 0)
        .unwrap();
    pump(&mut a, a_if, &mut b, b_if, 0);
    assert!(b.take_events().is_empty());

    // all-nodes は常に配送する
    a.send_access(AccessSend::new(0xFFFF, KeyRef::App(0), vec![0x01]), 0)
        .unwrap();
    pump(&mut a, a_if, &mut b, b_if, 0);
    assert_eq!(access_messages(&b.take_events()).len(), 1);
}

/// 仮想アドレス宛て: Label UUID が AAD に入り、受信側はラベルを報告する
#[test]
fn test_virtual_address_delivery() {
    let label = [
        0xf4, 0xa0, 0x02, 0xc7, 0xfb, 0x1e, 0x4c, 0xa0, 0xa4, 0x69, 0xa0, 0x21, 0xde, 0x0d, 0xb8, 0x75,
    ];
    let mut a = node(0x0001);
    let mut b = node(0x0002);
    let a_if = adv(&mut a);
    let b_if = adv(&mut b);

    let va = b.subscribe_virtual(label);
    assert_eq!(a.add_virtual_label(label), va);

    a.send_access(AccessSend::new(va, KeyRef::App(0), vec![0x01, 0x02]), 0)
        .unwrap();
    pump(&mut a, a_if, &mut b, b_if, 0);
    let received = access_messages(&b.take_events());
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].dst, va);
    assert_eq!(received[0].label, Some(label));
    assert_eq!(received[0].params, vec![0x02]);
}

/// Device Key のメッセージ（設定メッセージ）
#[test]
fn test_device_key_message() {
    let mut provisioner = node(0x0001);
    let mut b = node(0x0002);
    let p_if = adv(&mut provisioner);
    let b_if = adv(&mut b);
    provisioner.keys_mut().add_device_key(0x0002, DEV_KEY);
    b.keys_mut().add_device_key(0x0002, DEV_KEY);

    provisioner
        .send_access(
            AccessSend::new(0x0002, KeyRef::Device { net_key_index: 0 }, vec![0x80, 0x08]),
            0,
        )
        .unwrap();
    pump(&mut provisioner, p_if, &mut b, b_if, 0);
    let received = access_messages(&b.take_events());
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].opcode, Opcode::Double(0x8008));
    assert_eq!(received[0].app_key_index, None);
}

/// 64 ビット TransMIC は短くても分割して送られる
#[test]
fn test_large_transmic() {
    let mut a = node(0x0001);
    let mut b = node(0x0002);
    let a_if = adv(&mut a);
    let b_if = adv(&mut b);

    let mut request = AccessSend::new(0x0002, KeyRef::App(0), vec![0x01, 0x02, 0x03]);
    request.trans_mic = MicSize::Large;
    let handle = a.send_access(request, 0).unwrap();
    assert_eq!(pump(&mut a, a_if, &mut b, b_if, 0), 1);
    assert_eq!(access_messages(&b.take_events())[0].params, vec![0x02, 0x03]);
    pump(&mut b, b_if, &mut a, a_if, 0);
    assert_eq!(completions(&a.take_events()), vec![(handle, Ok(()))]);
}

/// Block Ack が 0 の ACK は受信側の拒否として扱う
#[test]
fn test_zero_block_ack_rejects_transfer() {
    let mut a = node(0x0001);
    let a_if = adv(&mut a);
    let handle = a
        .send_access(AccessSend::new(0x0002, KeyRef::App(0), payload(30)), 0)
        .unwrap();
    a.drain_bearer(a_if);

    // 0x0002 からの ACK を手で組み立てる（SeqZero = SeqAuth 0）
    let lower = LowerPdu::SegmentAck(SegmentAck {
        obo: false,
        seq_zero: 0,
        block_ack: 0,
    })
    .encode();
    let pdu = NetworkPdu::new(true, 0, 100, 0x0002, 0x0001, lower);
    let frame = encode(&NetKeyMaterial::derive(NET_KEY), 0, &pdu).unwrap();

    assert!(a.on_bearer_pdu(a_if, &frame, None, 10).is_ok());
    assert_eq!(
        completions(&a.take_events()),
        vec![(handle, Err(SendFailure::RejectedByPeer))]
    );
    assert_eq!(a.sends_in_flight(), 0);
}

/// 完了済みメッセージの遅れたセグメントには全ビットの ACK を返し直す
#[test]
fn test_lost_ack_is_recovered_by_reack() {
    let mut a = node(0x0001);
    let mut b = node(0x0002);
    let a_if = adv(&mut a);
    let b_if = adv(&mut b);

    let handle = a
        .send_access(AccessSend::new(0x0002, KeyRef::App(0), payload(40)), 0)
        .unwrap();
    pump(&mut a, a_if, &mut b, b_if, 0);
    assert_eq!(access_messages(&b.take_events()).len(), 1);
    // ACK を取りこぼす
    assert_eq!(b.drain_bearer(b_if).len(), 1);

    a.tick(RETRANS_MS);
    assert_eq!(pump(&mut a, a_if, &mut b, b_if, RETRANS_MS), 4);
    assert!(b.take_events().is_empty(), "再配送しない");
    assert_eq!(b.reassemblies_in_progress(), 0);

    pump(&mut b, b_if, &mut a, a_if, RETRANS_MS + 10);
    assert_eq!(completions(&a.take_events()), vec![(handle, Ok(()))]);
}

/// 受信未完了タイマーで諦めたメッセージは、後から届いたセグメントでも再開しない
#[test]
fn test_incomplete_timeout_discards_reassembly() {
    let mut a = node(0x0001);
    let mut b = node(0x0002);
    let a_if = adv(&mut a);
    let b_if = adv(&mut b);

    a.send_access(AccessSend::new(0x0002, KeyRef::App(0), payload(40)), 0)
        .unwrap();
    let frames = a.drain_bearer(a_if);
    for frame in &frames[..3] {
        let _ = b.on_bearer_pdu(b_if, frame, None, 0);
    }
    b.tick(10_000);
    assert_eq!(b.reassemblies_in_progress(), 0);

    assert!(b.on_bearer_pdu(b_if, &frames[3], None, 10_001).is_ok());
    assert!(b.take_events().is_empty());
    assert_eq!(b.reassemblies_in_progress(), 0);
}

/// 分割受信コンテキストがなければセグメントは黙って捨てられる（ACK しない）
#[test]
fn test_no_free_reassembly_context() {
    let mut a = node(0x0001);
    let mut c = node(0x0003);
    let mut b = node_with(MeshConfig {
        primary_address: 0x0002,
        nb_reassembly: 1,
        ..MeshConfig::default()
    });
    let a_if = adv(&mut a);
    let c_if = adv(&mut c);
    let b_if = adv(&mut b);

    a.send_access(AccessSend::new(0x0002, KeyRef::App(0), payload(40)), 0)
        .unwrap();
    c.send_access(AccessSend::new(0x0002, KeyRef::App(0), payload(40)), 0)
        .unwrap();
    let from_a = a.drain_bearer(a_if);
    let _ = b.on_bearer_pdu(b_if, &from_a[0], None, 0);
    pump(&mut c, c_if, &mut b, b_if, 0);

    assert_eq!(b.reassemblies_in_progress(), 1);
    assert!(b.take_events().is_empty());
    assert!(b.drain_bearer(b_if).is_empty());
}

/// 同じ送信元が新しいメッセージを始めたら古い受信コンテキストは解放され、
/// 他の送信元のメッセージを受けられる
#[test]
fn test_restarted_transfer_does_not_hold_reassembly_slots() {
    let mut a = node(0x0001);
    let mut c = node(0x0003);
    let mut b = node(0x0002);
    let a_if = adv(&mut a);
    let c_if = adv(&mut c);
    let b_if = adv(&mut b);

    let first = a
        .send_access(AccessSend::new(0x0002, KeyRef::App(0), payload(40)), 0)
        .unwrap();
    let frames = a.drain_bearer(a_if);
    let _ = b.on_bearer_pdu(b_if, &frames[0], None, 0);
    assert!(a.cancel_send(first));

    a.send_access(AccessSend::new(0x0002, KeyRef::App(0), payload(40)), 10)
        .unwrap();
    let frames = a.drain_bearer(a_if);
    let _ = b.on_bearer_pdu(b_if, &frames[0], None, 10);
    assert_eq!(b.reassemblies_in_progress(), 1);

    c.send_access(AccessSend::new(0x0002, KeyRef::App(0), payload(40)), 20)
        .unwrap();
    assert_eq!(pump(&mut c, c_if, &mut b, b_if, 20), 4);
    let received = access_messages(&b.take_events());
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].src, 0x0003);
}

/// 鍵更新:フェーズ 1 は旧鍵で送信、フェーズ 2 で新鍵、Normal で旧鍵は使えなくなる
#[test]
fn test_key_refresh() {
    let mut a = node(0x0001);
    let mut b = node(0x0002);
    let a_if = adv(&mut a);
    let b_if = adv(&mut b);

    b.keys_mut().update_net_key(0, NEW_NET_KEY).unwrap();
    a.send_access(AccessSend::new(0x0002, KeyRef::App(0), vec![0x01, 1]), 0)
        .unwrap();
    pump(&mut a, a_if, &mut b, b_if, 0);
    assert_eq!(access_messages(&b.take_events()).len(), 1);

    // 旧鍵で送ったフレームを取っておく
    a.send_access(AccessSend::new(0x0002, KeyRef::App(0), vec![0x01, 2]), 0)
        .unwrap();
    let stale = a.drain_bearer(a_if);

    a.keys_mut().update_net_key(0, NEW_NET_KEY).unwrap();
    a.keys_mut().set_phase(0, KeyRefreshPhase::Phase2).unwrap();
    a.send_access(AccessSend::new(0x0002, KeyRef::App(0), vec![0x01, 3]), 0)
        .unwrap();
    let new_frames = a.drain_bearer(a_if);
    assert_eq!(new_frames.len(), 1);
    // B はフェーズ 1 でも新鍵で受信できる
    let _ = b.on_bearer_pdu(b_if, &new_frames[0], None, 0);
    assert_eq!(access_messages(&b.take_events())[0].params, vec![3]);

    b.keys_mut().set_phase(0, KeyRefreshPhase::Normal).unwrap();
    assert_eq!(
        b.on_bearer_pdu(b_if, &stale[0], None, 0),
        Err(MeshError::Network(NetworkError::AuthenticationFailed))
    );
    assert_eq!(b.stats().auth_failures, 1);
}

/// IV Update の完了で SEQ が 0 に戻っても、相手は新しい IV Index で受け付ける
#[test]
fn test_iv_update_sequence_reset_is_accepted() {
    let mut a = node(0x0001);
    let mut b = node(0x0002);
    let a_if = adv(&mut a);
    let b_if = adv(&mut b);

    for _ in 0..3 {
        a.send_access(AccessSend::new(0x0002, KeyRef::App(0), vec![0x01]), 0)
            .unwrap();
    }
    pump(&mut a, a_if, &mut b, b_if, 0);
    assert_eq!(access_messages(&b.take_events()).len(), 3);

    assert!(a.begin_iv_update());
    assert!(b.begin_iv_update());
    // 更新中は旧 IV Index で送る
    a.send_access(AccessSend::new(0x0002, KeyRef::App(0), vec![0x01]), 0)
        .unwrap();
    pump(&mut a, a_if, &mut b, b_if, 0);
    assert_eq!(access_messages(&b.take_events()).len(), 1);

    assert!(a.complete_iv_update());
    a.send_access(AccessSend::new(0x0002, KeyRef::App(0), vec![0x01]), 0)
        .unwrap();
    let frames = a.drain_bearer(a_if);
    assert_eq!(frames[0][0] & 0x80, 0x80, "IVI = 1");
    assert!(b.on_bearer_pdu(b_if, &frames[0], None, 0).is_ok());
    assert_eq!(access_messages(&b.take_events()).len(), 1);
}

/// 制御メッセージ（非分割）の送受信
#[test]
fn test_control_message_between_nodes() {
    let mut a = node(0x0001);
    let mut b = node(0x0002);
    let a_if = adv(&mut a);
    let b_if = adv(&mut b);

    a.send_control(ControlSend {
        src: None,
        dst: 0x0002,
        net_key_index: 0,
        opcode: 0x0A,
        params: vec![0x01, 0x02],
        ttl: None,
    })
    .unwrap();
    pump(&mut a, a_if, &mut b, b_if, 0);
    match b.take_events().as_slice() {
        [MeshEvent::ControlReceived(msg)] => {
            assert_eq!(msg.opcode, 0x0A);
            assert_eq!(msg.params, vec![0x01, 0x02]);
            assert_eq!(msg.ttl, 7);
        }
        other => panic!("unexpected events: {:?}", other),
    }
}

/// 最後のインターフェースが切断されると送信中のメッセージは Cancelled になる
#[test]
fn test_proxy_disconnect_cancels_sends() {
    let mut a = node(0x0001);
    let proxy = a
        .register_interface(Box::new(GattProxyBearer::new(16)))
        .unwrap();
    let handle = a
        .send_access(AccessSend::new(0x0002, KeyRef::App(0), payload(40)), 0)
        .unwrap();
    assert_eq!(a.drain_bearer(proxy).len(), 4);

    assert!(a.unregister_interface(proxy).is_some());
    assert_eq!(
        completions(&a.take_events()),
        vec![(handle, Err(SendFailure::Cancelled))]
    );
    // 取り消したコンテキストのタイマーは何もしない
    run_timers(&mut a);
    assert!(a.take_events().is_empty());
}

/// イベントと統計は JSON でホストに渡せる
#[test]
fn test_events_serialize_to_json() {
    let mut a = node(0x0001);
    let mut b = node(0x0002);
    let a_if = adv(&mut a);
    let b_if = adv(&mut b);

    a.send_access(AccessSend::new(0x0002, KeyRef::App(0), vec![0x82, 0x04]), 0)
        .unwrap();
    pump(&mut a, a_if, &mut b, b_if, 0);

    let json = serde_json::to_string(&b.take_events()).unwrap();
    assert!(json.contains("AccessReceived"));
    assert!(json.contains("\"Double\":33284"));
    let stats = serde_json::to_string(&b.stats()).unwrap();
    assert!(stats.contains("\"delivered\":1"));

    let config: MeshConfig = serde_json::from_str(r#"{"primary_address": 5, "default_ttl": 3}"#).unwrap();
    assert_eq!(config.primary_address, 5);
    assert_eq!(config.default_ttl, 3);
    assert_eq!(config.nb_segmentation, MeshConfig::default().nb_segmentation);
}
