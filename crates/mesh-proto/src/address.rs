//! Mesh アドレス
//!
//! ```text
//! 0x0000          Unassigned
//! 0x0001..0x7FFF  Unicast（エレメント）
//! 0x8000..0xBFFF  Virtual（Label UUID のハッシュ）
//! 0xC000..0xFFFF  Group（0xFF00 以降は固定グループ）
//! ```

use serde::{Deserialize, Serialize};

/// 全 Proxy ノード宛ての固定グループ
pub const ALL_PROXIES: u16 = 0xFFFC;
/// 全 Friend ノード宛ての固定グループ
pub const ALL_FRIENDS: u16 = 0xFFFD;
/// 全 Relay ノード宛ての固定グループ
pub const ALL_RELAYS: u16 = 0xFFFE;
/// 全ノード宛ての固定グループ
pub const ALL_NODES: u16 = 0xFFFF;

/// 16 ビットの Mesh アドレス
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Address {
    Unassigned,
    Unicast(u16),
    Virtual(u16),
    Group(u16),
}

impl Address {
    /// 生の 16 ビット値から分類する
    pub fn from_u16(raw: u16) -> Self {
        match raw {
            0x0000 => Address::Unassigned,
            0x0001..=0x7FFF => Address::Unicast(raw),
            0x8000..=0xBFFF => Address::Virtual(raw),
            _ => Address::Group(raw),
        }
    }

    /// 生の 16 ビット値
    pub fn raw(&self) -> u16 {
        match *self {
            Address::Unassigned => 0,
            Address::Unicast(a) | Address::Virtual(a) | Address::Group(a) => a,
        }
    }

    pub fn is_unicast(&self) -> bool {
        matches!(self, Address::Unicast(_))
    }

    pub fn is_virtual(&self) -> bool {
        matches!(self, Address::Virtual(_))
    }

    pub fn is_group(&self) -> bool {
        matches!(self, Address::Group(_))
    }

    /// グループまたは仮想アドレス（Block Ack を返さない宛先）
    pub fn is_multicast(&self) -> bool {
        self.is_group() || self.is_virtual()
    }
}

impl From<u16> for Address {
    fn from(raw: u16) -> Self {
        Address::from_u16(raw)
    }
}

impl From<Address> for u16 {
    fn from(addr: Address) -> u16 {
        addr.raw()
    }
}

impl core::fmt::Display for Address {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "0x{:04x}", self.raw())
    }
}
