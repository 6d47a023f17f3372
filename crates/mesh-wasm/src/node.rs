//! MeshNode wasm-bindgen エクスポート
//!
//! JS ホスト（Web Bluetooth / Node.js の BLE ドライバ）から呼び出す Mesh ノードの主エントリポイント。
//! ベアラの送受信とタイマー駆動はホストが行い、このクラスは `MeshContext` を包むだけ。

extern crate alloc;

use alloc::boxed::Box;
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use js_sys::Uint8Array;
use serde::Serialize;
use wasm_bindgen::prelude::*;

use mesh_bearer::{AdvertisingBearer, Bearer, BearerKind, GattProxyBearer, QueueStats};
use mesh_core::{
    AccessSend, KeyRef, KeyRefreshPhase, MemoryKeyStore, MemorySequenceStore, MeshConfig,
    MeshContext, MeshStats,
};
use mesh_crypto::{decode_hex_key, MicSize};
use mesh_network::{InterfaceCounters, InterfaceId};

type Context = MeshContext<MemoryKeyStore, MemorySequenceStore>;

/// `getStats` が返す JSON
#[derive(Serialize)]
struct StatsReport {
    mesh: MeshStats,
    interfaces: Vec<InterfaceReport>,
}

#[derive(Serialize)]
struct InterfaceReport {
    id: u32,
    kind: BearerKind,
    counters: InterfaceCounters,
    queue: QueueStats,
}

/// Bluetooth Mesh ノード
///
/// ## 内部アーキテクチャ
///
/// ```text
/// MeshNode
///   └── MeshContext        (mesh-core)
///         ├── MemoryKeyStore / MemorySequenceStore
///         ├── InterfaceRegistry, ReplayCache (mesh-network)
///         ├── Segmenter, Reassembler         (mesh-transport)
///         └── TimerQueue
/// ```
///
/// ## スレッド安全性
///
/// WASM はシングルスレッドのため、JS からは単一スレッドで呼び出される前提。
#[wasm_bindgen]
pub struct MeshNode {
    ctx: Context,
}

#[wasm_bindgen]
impl MeshNode {
    /// ノードを初期化する
    ///
    /// # 引数
    /// - `config_json`: `MeshConfig` の JSON。省略したフィールドは既定値
    ///   例: `{"primary_address": 2, "default_ttl": 5}`
    ///
    /// # エラー
    /// - JSON の解析失敗
    /// - 設定値が範囲外
    #[wasm_bindgen(constructor)]
    pub fn new(config_json: Option<String>) -> Result<MeshNode, JsError> {
        let config: MeshConfig = match config_json {
            Some(json) => serde_json::from_str(&json)
                .map_err(|e| JsError::new(&format!("Invalid config JSON: {}", e)))?,
            None => MeshConfig::default(),
        };
        let ctx = MeshContext::new(config, MemoryKeyStore::new(), MemorySequenceStore::new())
            .map_err(|e| JsError::new(&format!("Invalid config: {}", e)))?;
        Ok(MeshNode { ctx })
    }

    // ---- 鍵 ----

    /// Network Key を登録する（32 桁の 16 進文字列）
    #[wasm_bindgen(js_name = "addNetKey")]
    pub fn add_net_key(&mut self, index: u16, key_hex: &str) -> Result<(), JsError> {
        let key = parse_key(key_hex)?;
        self.ctx
            .keys_mut()
            .add_net_key(index, key)
            .map_err(|e| JsError::new(&format!("{}", e)))
    }

    /// Application Key を登録して Network Key に結び付ける
    #[wasm_bindgen(js_name = "addAppKey")]
    pub fn add_app_key(&mut self, index: u16, net_key_index: u16, key_hex: &str) -> Result<(), JsError> {
        let key = parse_key(key_hex)?;
        self.ctx
            .keys_mut()
            .add_app_key(index, net_key_index, key)
            .map_err(|e| JsError::new(&format!("{}", e)))
    }

    /// ノードの Device Key を登録する（自ノードは `primary_address`）
    #[wasm_bindgen(js_name = "addDeviceKey")]
    pub fn add_device_key(&mut self, address: u16, key_hex: &str) -> Result<(), JsError> {
        let key = parse_key(key_hex)?;
        self.ctx.keys_mut().add_device_key(address, key);
        Ok(())
    }

    /// 鍵更新を開始する（新しい Network Key を登録してフェーズ 1 へ）
    #[wasm_bindgen(js_name = "updateNetKey")]
    pub fn update_net_key(&mut self, index: u16, key_hex: &str) -> Result<(), JsError> {
        let key = parse_key(key_hex)?;
        self.ctx
            .keys_mut()
            .update_net_key(index, key)
            .map_err(|e| JsError::new(&format!("{}", e)))
    }

    /// 鍵更新中の Application Key の新しい値
    #[wasm_bindgen(js_name = "updateAppKey")]
    pub fn update_app_key(&mut self, index: u16, key_hex: &str) -> Result<(), JsError> {
        let key = parse_key(key_hex)?;
        self.ctx
            .keys_mut()
            .update_app_key(index, key)
            .map_err(|e| JsError::new(&format!("{}", e)))
    }

    /// 鍵更新のフェーズ（0 = Normal, 1, 2）
    #[wasm_bindgen(js_name = "setKeyRefreshPhase")]
    pub fn set_key_refresh_phase(&mut self, index: u16, phase: u8) -> Result<(), JsError> {
        let phase = match phase {
            0 => KeyRefreshPhase::Normal,
            1 => KeyRefreshPhase::Phase1,
            2 => KeyRefreshPhase::Phase2,
            other => return Err(JsError::new(&format!("Invalid key refresh phase: {}", other))),
        };
        self.ctx
            .keys_mut()
            .set_phase(index, phase)
            .map_err(|e| JsError::new(&format!("{}", e)))
    }

    // ---- インターフェース ----

    /// ベアラを開いてインターフェース ID を返す
    ///
    /// # 引数
    /// - `kind`: `"advertising"` または `"proxy"`
    #[wasm_bindgen(js_name = "openInterface")]
    pub fn open_interface(&mut self, kind: &str) -> Result<u32, JsError> {
        let capacity = self.ctx.config().frame_queue_capacity;
        let bearer: Box<dyn Bearer> = match kind {
            "advertising" => Box::new(AdvertisingBearer::new(
                capacity,
                self.ctx.config().adv_transmit_count,
            )),
            "proxy" => Box::new(GattProxyBearer::new(capacity)),
            other => return Err(JsError::new(&format!("Unknown bearer kind: {}", other))),
        };
        let id = self
            .ctx
            .register_interface(bearer)
            .map_err(|e| JsError::new(&format!("{}", e)))?;
        Ok(id.to_raw())
    }

    /// インターフェースを閉じる（GATT 切断など）
    #[wasm_bindgen(js_name = "closeInterface")]
    pub fn close_interface(&mut self, id: u32) -> bool {
        self.ctx
            .unregister_interface(InterfaceId::from_raw(id))
            .is_some()
    }

    /// ベアラから受信した Network PDU を処理する
    ///
    /// # 戻り値
    /// PDU を受け付けたか。拒否（リプレイ・認証失敗・不正形式）はメッシュでは日常的なので例外にしない
    #[wasm_bindgen(js_name = "recvBearerPdu")]
    pub fn recv_bearer_pdu(&mut self, id: u32, bytes: &[u8], rssi: Option<i8>, now_ms: f64) -> bool {
        self.ctx
            .on_bearer_pdu(InterfaceId::from_raw(id), bytes, rssi, now_ms as u64)
            .is_ok()
    }

    /// インターフェースの送信待ちフレームを取り出す
    ///
    /// # 戻り値
    /// 無線に流す Network PDU（Uint8Array）の配列
    #[wasm_bindgen(js_name = "takeOutgoing")]
    pub fn take_outgoing(&mut self, id: u32) -> js_sys::Array {
        let result = js_sys::Array::new();
        for frame in self.ctx.drain_bearer(InterfaceId::from_raw(id)) {
            let arr = Uint8Array::new_with_length(frame.len() as u32);
            arr.copy_from(&frame);
            result.push(&arr);
        }
        result
    }

    // ---- 送信 ----

    /// Application Key でアクセスメッセージを送る
    ///
    /// # 引数
    /// - `payload`: opcode + パラメータ
    /// - `ack_required`: 短いメッセージでも分割送信して ACK を待つ
    ///
    /// # 戻り値
    /// 送信ハンドル（`SendComplete` イベントで結果が届く）
    #[wasm_bindgen(js_name = "sendAccess")]
    pub fn send_access(
        &mut self,
        dst: u16,
        app_key_index: u16,
        payload: &[u8],
        ttl: Option<u8>,
        ack_required: bool,
        now_ms: f64,
    ) -> Result<u32, JsError> {
        let mut request = AccessSend::new(dst, KeyRef::App(app_key_index), payload.to_vec());
        request.ttl = ttl;
        request.ack_required = ack_required;
        self.send(request, now_ms)
    }

    /// Device Key でアクセスメッセージを送る（設定メッセージ）
    #[wasm_bindgen(js_name = "sendDeviceAccess")]
    pub fn send_device_access(
        &mut self,
        dst: u16,
        net_key_index: u16,
        payload: &[u8],
        now_ms: f64,
    ) -> Result<u32, JsError> {
        let request = AccessSend::new(dst, KeyRef::Device { net_key_index }, payload.to_vec());
        self.send(request, now_ms)
    }

    /// 64 ビット TransMIC で分割送信する
    #[wasm_bindgen(js_name = "sendAccessLargeMic")]
    pub fn send_access_large_mic(
        &mut self,
        dst: u16,
        app_key_index: u16,
        payload: &[u8],
        now_ms: f64,
    ) -> Result<u32, JsError> {
        let mut request = AccessSend::new(dst, KeyRef::App(app_key_index), payload.to_vec());
        request.trans_mic = MicSize::Large;
        self.send(request, now_ms)
    }

    /// 送信中の分割メッセージを取り消す
    #[wasm_bindgen(js_name = "cancelSend")]
    pub fn cancel_send(&mut self, handle: u32) -> bool {
        self.ctx.cancel_send(mesh_core::SendHandle(handle))
    }

    // ---- 時間・イベント ----

    /// 定期タイマー tick（再送・ACK・受信タイムアウト）
    ///
    /// `nextDeadline()` の時刻か、`setInterval` から呼び出す。
    #[wasm_bindgen]
    pub fn tick(&mut self, now_ms: f64) {
        self.ctx.tick(now_ms as u64);
    }

    /// 次にタイマーが切れる時刻（ms）。タイマーがなければ undefined
    #[wasm_bindgen(js_name = "nextDeadline")]
    pub fn next_deadline(&mut self) -> Option<f64> {
        self.ctx.next_deadline().map(|d| d as f64)
    }

    /// 溜まったイベントを JSON 配列で取り出す
    ///
    /// ```json
    /// [{"AccessReceived":{"src":1,"dst":2,"opcode":{"Double":33282},"params":[1], ...}},
    ///  {"SendComplete":{"handle":0,"result":{"Ok":null}}}]
    /// ```
    #[wasm_bindgen(js_name = "takeEvents")]
    pub fn take_events(&mut self) -> Result<String, JsError> {
        let events = self.ctx.take_events();
        serde_json::to_string(&events).map_err(|e| JsError::new(&format!("{}", e)))
    }

    /// 統計を JSON 文字列で返す
    ///
    /// ```json
    /// {
    ///   "mesh": {"rx_pdus": 12, "relayed": 3, "replay_drops": 1, ...},
    ///   "interfaces": [{"id": 0, "kind": "Advertising", "counters": {...}, "queue": {...}}]
    /// }
    /// ```
    #[wasm_bindgen(js_name = "getStats")]
    pub fn get_stats(&self) -> Result<String, JsError> {
        let interfaces = self
            .ctx
            .interface_ids()
            .into_iter()
            .filter_map(|id| {
                self.ctx.interface(id).map(|iface| InterfaceReport {
                    id: id.to_raw(),
                    kind: iface.kind(),
                    counters: iface.counters(),
                    queue: iface.queue_stats(),
                })
            })
            .collect();
        let report = StatsReport {
            mesh: self.ctx.stats(),
            interfaces,
        };
        serde_json::to_string(&report).map_err(|e| JsError::new(&format!("{}", e)))
    }

    // ---- IV Index・購読・機能 ----

    #[wasm_bindgen(js_name = "setIvIndex")]
    pub fn set_iv_index(&mut self, index: u32, update_in_progress: bool) -> Result<(), JsError> {
        self.ctx
            .set_iv_index(index, update_in_progress)
            .map_err(|e| JsError::new(&format!("{}", e)))
    }

    #[wasm_bindgen(js_name = "beginIvUpdate")]
    pub fn begin_iv_update(&mut self) -> bool {
        self.ctx.begin_iv_update()
    }

    #[wasm_bindgen(js_name = "completeIvUpdate")]
    pub fn complete_iv_update(&mut self) -> bool {
        self.ctx.complete_iv_update()
    }

    #[wasm_bindgen]
    pub fn subscribe(&mut self, address: u16) -> Result<(), JsError> {
        self.ctx
            .subscribe(address)
            .map_err(|e| JsError::new(&format!("{}", e)))
    }

    #[wasm_bindgen]
    pub fn unsubscribe(&mut self, address: u16) -> bool {
        self.ctx.unsubscribe(address)
    }

    /// Label UUID（32 桁の 16 進）の仮想アドレスを購読し、アドレスを返す
    #[wasm_bindgen(js_name = "subscribeVirtual")]
    pub fn subscribe_virtual(&mut self, label_hex: &str) -> Result<u16, JsError> {
        let label = parse_key(label_hex)?;
        Ok(self.ctx.subscribe_virtual(label))
    }

    /// 送信先として使う Label UUID を登録し、仮想アドレスを返す
    #[wasm_bindgen(js_name = "addVirtualLabel")]
    pub fn add_virtual_label(&mut self, label_hex: &str) -> Result<u16, JsError> {
        let label = parse_key(label_hex)?;
        Ok(self.ctx.add_virtual_label(label))
    }

    #[wasm_bindgen(js_name = "setRelayEnabled")]
    pub fn set_relay_enabled(&mut self, enabled: bool) {
        self.ctx.set_relay_enabled(enabled);
    }
}

impl MeshNode {
    fn send(&mut self, request: AccessSend, now_ms: f64) -> Result<u32, JsError> {
        self.ctx
            .send_access(request, now_ms as u64)
            .map(|handle| handle.0)
            .map_err(|e| JsError::new(&format!("Send rejected: {}", e)))
    }
}

fn parse_key(key_hex: &str) -> Result<[u8; 16], JsError> {
    decode_hex_key(key_hex).map_err(|e| JsError::new(&format!("Invalid key: {}", e)))
}
