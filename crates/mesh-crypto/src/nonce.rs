//! Mesh Nonce 実装
//!
//! ## Nonce 構造（13バイト）
//! ```text
//! Network:     [0x00][CTL|TTL][SEQ:3][SRC:2][0x0000][IV Index:4]
//! Application: [0x01][ASZMIC<<7][SEQ:3][SRC:2][DST:2][IV Index:4]
//! Device:      [0x02][ASZMIC<<7][SEQ:3][SRC:2][DST:2][IV Index:4]
//! ```
//!
//! すべてのフィールドはビッグエンディアン。
//! 上位トランスポートの SEQ にはセグメント送信でも SeqAuth（先頭セグメントの SEQ）を使う。

/// Nonce の種別（先頭 1 バイト）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceKind {
    Network = 0x00,
    Application = 0x01,
    Device = 0x02,
}

/// AES-CCM に渡す 13 バイトの Nonce
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeshNonce([u8; 13]);

impl MeshNonce {
    /// ネットワーク層 Nonce
    ///
    /// # 引数
    /// - `ctl_ttl`: CTL（bit7）と TTL（bit0..6）をまとめた 1 オクテット
    pub fn network(ctl_ttl: u8, seq: u32, src: u16, iv_index: u32) -> Self {
        let mut bytes = [0u8; 13];
        bytes[0] = NonceKind::Network as u8;
        bytes[1] = ctl_ttl;
        bytes[2..5].copy_from_slice(&seq.to_be_bytes()[1..4]);
        bytes[5..7].copy_from_slice(&src.to_be_bytes());
        // bytes[7..9] は 0x0000（パディング）
        bytes[9..13].copy_from_slice(&iv_index.to_be_bytes());
        MeshNonce(bytes)
    }

    /// Application Key 用 Nonce
    pub fn application(aszmic: bool, seq: u32, src: u16, dst: u16, iv_index: u32) -> Self {
        Self::upper(NonceKind::Application, aszmic, seq, src, dst, iv_index)
    }

    /// Device Key 用 Nonce
    pub fn device(aszmic: bool, seq: u32, src: u16, dst: u16, iv_index: u32) -> Self {
        Self::upper(NonceKind::Device, aszmic, seq, src, dst, iv_index)
    }

    fn upper(kind: NonceKind, aszmic: bool, seq: u32, src: u16, dst: u16, iv_index: u32) -> Self {
        let mut bytes = [0u8; 13];
        bytes[0] = kind as u8;
        bytes[1] = if aszmic { 0x80 } else { 0x00 };
        bytes[2..5].copy_from_slice(&seq.to_be_bytes()[1..4]);
        bytes[5..7].copy_from_slice(&src.to_be_bytes());
        bytes[7..9].copy_from_slice(&dst.to_be_bytes());
        bytes[9..13].copy_from_slice(&iv_index.to_be_bytes());
        MeshNonce(bytes)
    }

    /// 24 ビットの SEQ を取得する
    pub fn seq(&self) -> u32 {
        u32::from_be_bytes([0, self.0[2], self.0[3], self.0[4]])
    }

    /// 13 バイトの nonce データへの参照を返す
    pub fn as_bytes(&self) -> &[u8; 13] {
        &self.0
    }
}
