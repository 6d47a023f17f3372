//! # mesh-wasm
//!
//! wasm-bindgen エクスポート：JS ホスト（Web Bluetooth / Node.js）から呼び出す公開 API。
//!
//! ## 使用方法（TypeScript）
//!
//! ```typescript
//! import { MeshNode, init_panic_hook } from '../mesh-wasm-pkg/mesh_wasm';
//!
//! // パニック時のスタックトレースを有効化（開発時）
//! init_panic_hook();
//!
//! const node = new MeshNode('{"primary_address": 2}');
//! node.addNetKey(0, "7dd7364cd842ad18c17c2b820c84c3d6");
//! node.addAppKey(0, 0, "63964771734fbd76e3b40519d1d94a48");
//! const adv = node.openInterface("advertising");
//!
//! // 受信した Network PDU
//! scanner.on('pdu', (pdu, rssi) => node.recvBearerPdu(adv, pdu, rssi, Date.now()));
//!
//! // アクセスメッセージの送信
//! const handle = node.sendAccess(0x0003, 0, payload, undefined, false, Date.now());
//!
//! // 定期タイマー
//! node.tick(Date.now());
//! for (const pdu of node.takeOutgoing(adv)) {
//!     advertiser.send(pdu);
//! }
//! for (const ev of JSON.parse(node.takeEvents())) { ... }
//! ```

use wasm_bindgen::prelude::*;

pub mod node;

pub use node::MeshNode;

/// パニック時にブラウザコンソールにスタックトレースを出力する
///
/// 開発時に必ず呼び出すこと。本番ビルドでは feature flag で無効化可能。
#[wasm_bindgen]
pub fn init_panic_hook() {
    #[cfg(feature = "console_error_panic_hook")]
    console_error_panic_hook::set_once();
}

/// 16 進の鍵（32 桁）を 16 バイトの Uint8Array に変換するユーティリティ
///
/// テスト・デバッグ用。実際の使用では `MeshNode` の鍵登録メソッドに文字列のまま渡す。
///
/// # エラー
/// - 16 進デコード失敗
/// - 鍵長が 16 バイト以外
#[wasm_bindgen(js_name = "decodeHexKey")]
pub fn decode_hex_key(key_hex: &str) -> Result<js_sys::Uint8Array, JsError> {
    let key = mesh_crypto::decode_hex_key(key_hex)
        .map_err(|e| JsError::new(&alloc::format!("{}", e)))?;
    let arr = js_sys::Uint8Array::new_with_length(16);
    arr.copy_from(&key);
    Ok(arr)
}

/// Label UUID（16 進 32 桁）から仮想アドレスを計算する
#[wasm_bindgen(js_name = "virtualAddress")]
pub fn virtual_address(label_hex: &str) -> Result<u16, JsError> {
    let label = mesh_crypto::decode_hex_key(label_hex)
        .map_err(|e| JsError::new(&alloc::format!("{}", e)))?;
    Ok(mesh_crypto::virtual_address(&label))
}

extern crate alloc;
