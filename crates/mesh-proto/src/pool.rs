//! 世代番号付きスロットプール
//!
//! 固定数のスロットに値を置き、`SlotHandle`（index + generation）で参照する。
//! スロットを解放すると generation が進むので、解放済みスロットを指す古いハンドル
//! （期限切れタイマーのトークンなど）は `get` で `None` になり、再利用された
//! 新しいコンテキストを誤って操作することがない。

use alloc::vec::Vec;

use serde::{Deserialize, Serialize};

/// プール内の値への参照
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlotHandle {
    pub index: u16,
    pub generation: u16,
}

impl SlotHandle {
    /// 32 ビット整数に詰める（JS などの外部ホストに渡す用）
    pub fn to_raw(&self) -> u32 {
        ((self.generation as u32) << 16) | self.index as u32
    }

    pub fn from_raw(raw: u32) -> Self {
        SlotHandle {
            index: (raw & 0xFFFF) as u16,
            generation: (raw >> 16) as u16,
        }
    }
}

struct Slot<T> {
    generation: u16,
    value: Option<T>,
}

/// 容量固定のスロットプール
pub struct SlotPool<T> {
    slots: Vec<Slot<T>>,
    len: usize,
}

impl<T> SlotPool<T> {
    /// `capacity` 個のスロットを持つプールを生成する
    pub fn with_capacity(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            slots.push(Slot {
                generation: 0,
                value: None,
            });
        }
        SlotPool { slots, len: 0 }
    }

    /// 空きスロットに値を置く。満杯なら値を返す
    pub fn insert(&mut self, value: T) -> Result<SlotHandle, T> {
        match self.slots.iter().position(|s| s.value.is_none()) {
            Some(index) => {
                let slot = &mut self.slots[index];
                slot.value = Some(value);
                self.len += 1;
                Ok(SlotHandle {
                    index: index as u16,
                    generation: slot.generation,
                })
            }
            None => Err(value),
        }
    }

    pub fn get(&self, handle: SlotHandle) -> Option<&T> {
        self.slots
            .get(handle.index as usize)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.value.as_ref())
    }

    pub fn get_mut(&mut self, handle: SlotHandle) -> Option<&mut T> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.value.as_mut())
    }

    /// 値を取り出してスロットを解放する（generation を進める）
    pub fn remove(&mut self, handle: SlotHandle) -> Option<T> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.len -= 1;
        Some(value)
    }

    /// 条件に合う最初の値のハンドル
    pub fn find(&self, mut pred: impl FnMut(&T) -> bool) -> Option<SlotHandle> {
        self.iter().find(|(_, v)| pred(v)).map(|(h, _)| h)
    }

    /// 使用中スロットを列挙する
    pub fn iter(&self) -> impl Iterator<Item = (SlotHandle, &T)> {
        self.slots.iter().enumerate().filter_map(|(i, s)| {
            s.value.as_ref().map(|v| {
                (
                    SlotHandle {
                        index: i as u16,
                        generation: s.generation,
                    },
                    v,
                )
            })
        })
    }

    pub fn handles(&self) -> Vec<SlotHandle> {
        self.iter().map(|(h, _)| h).collect()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn is_full(&self) -> bool {
        self.len == self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_until_full() {
        let mut pool = SlotPool::with_capacity(2);
        assert!(pool.insert(1u32).is_ok());
        assert!(pool.insert(2u32).is_ok());
        assert!(pool.is_full());
        assert_eq!(pool.insert(3u32), Err(3));
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_stale_handle_rejected_after_reuse() {
        let mut pool = SlotPool::with_capacity(1);
        let old = pool.insert("first").unwrap();
        assert_eq!(pool.remove(old), Some("first"));

        // 同じスロットが再利用されても古いハンドルは無効
        let new = pool.insert("second").unwrap();
        assert_eq!(new.index, old.index);
        assert_ne!(new.generation, old.generation);
        assert!(pool.get(old).is_none());
        assert!(pool.remove(old).is_none());
        assert_eq!(pool.get(new), Some(&"second"));
    }

    #[test]
    fn test_raw_handle_roundtrip() {
        let handle = SlotHandle {
            index: 3,
            generation: 0x1234,
        };
        assert_eq!(SlotHandle::from_raw(handle.to_raw()), handle);
    }

    #[test]
    fn test_find_and_iter() {
        let mut pool = SlotPool::with_capacity(3);
        pool.insert(10u8).unwrap();
        let h = pool.insert(20u8).unwrap();
        assert_eq!(pool.find(|v| *v == 20), Some(h));
        assert_eq!(pool.iter().count(), 2);
    }
}
