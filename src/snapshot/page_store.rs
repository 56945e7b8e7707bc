//! Content-addressed page arena (spec §4.5).
//!
//! Grounded on the teacher's `debugee::dwarf::parser::unit` arena style (flat `Vec` + free-list
//! reuse) rather than any single teacher file dedicated to memory pooling — the source's
//! `PageStore` doesn't have a direct teacher analogue, so the free-list/refcount shape is our own
//! composition of the arena idiom the teacher uses elsewhere plus the spec's own algorithm.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use crate::error::{Error, Result};

pub const PAGE: usize = 4096;

/// Non-zero dense index into the [`PageStore`]; index 0 is reserved (spec §3 "Page").
pub type PageIndex = u32;

fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    bytes.iter().fold(OFFSET, |h, &b| (h ^ b as u64).wrapping_mul(PRIME))
}

struct Slot {
    bytes: Box<[u8; PAGE]>,
    refcount: u32,
}

/// Owns all page bytes. Two pages with identical content always share the same index (spec §4.5
/// "Dedup is content-exact, not just hash-equal").
#[derive(Default)]
pub struct PageStore {
    slots: Vec<Option<Slot>>,
    hash_buckets: HashMap<u64, Vec<PageIndex>>,
    free_list: Vec<PageIndex>,
}

impl PageStore {
    pub fn new() -> Self {
        // Index 0 is reserved: push a permanent occupied-but-inert placeholder.
        Self {
            slots: vec![None],
            hash_buckets: HashMap::new(),
            free_list: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len() - 1 - self.free_list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stores a page, reusing an existing index on exact content match (spec §4.5).
    pub fn store_page(&mut self, bytes: &[u8; PAGE]) -> PageIndex {
        let hash = fnv1a(bytes);
        if let Some(candidates) = self.hash_buckets.get(&hash) {
            for &idx in candidates {
                if let Some(slot) = &mut self.slots[idx as usize] {
                    if slot.bytes.as_ref() == bytes {
                        slot.refcount += 1;
                        return idx;
                    }
                }
            }
        }

        let slot = Slot {
            bytes: Box::new(*bytes),
            refcount: 1,
        };
        let idx = match self.free_list.pop() {
            Some(idx) => {
                self.slots[idx as usize] = Some(slot);
                idx
            }
            None => {
                let idx = self.slots.len() as PageIndex;
                self.slots.push(Some(slot));
                idx
            }
        };
        self.hash_buckets.entry(hash).or_default().push(idx);
        idx
    }

    pub fn ref_page(&mut self, idx: PageIndex) {
        if let Some(slot) = self.slots[idx as usize].as_mut() {
            slot.refcount += 1;
        }
    }

    /// Decrements the refcount; on reaching zero, frees the slot and drops its hash-bucket entry.
    pub fn unref_page(&mut self, idx: PageIndex) {
        let should_free = match self.slots[idx as usize].as_mut() {
            Some(slot) => {
                slot.refcount -= 1;
                slot.refcount == 0
            }
            None => return,
        };
        if should_free {
            let hash = fnv1a(self.slots[idx as usize].as_ref().unwrap().bytes.as_ref());
            self.slots[idx as usize] = None;
            self.free_list.push(idx);
            if let Entry::Occupied(mut bucket) = self.hash_buckets.entry(hash) {
                bucket.get_mut().retain(|&i| i != idx);
                if bucket.get().is_empty() {
                    bucket.remove();
                }
            }
        }
    }

    pub fn get_page(&self, idx: PageIndex) -> Result<&[u8; PAGE]> {
        self.slots
            .get(idx as usize)
            .and_then(|s| s.as_ref())
            .map(|s| s.bytes.as_ref())
            .ok_or(Error::PageNotFound(idx))
    }

    pub fn refcount(&self, idx: PageIndex) -> u32 {
        self.slots
            .get(idx as usize)
            .and_then(|s| s.as_ref())
            .map(|s| s.refcount)
            .unwrap_or(0)
    }

    /// Occupied slot indices, for property tests that check refcount/occupancy soundness.
    pub fn occupied_indices(&self) -> Vec<PageIndex> {
        self.slots
            .iter()
            .enumerate()
            .skip(1)
            .filter_map(|(i, s)| s.as_ref().map(|_| i as PageIndex))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(fill: u8) -> [u8; PAGE] {
        [fill; PAGE]
    }

    #[test]
    fn identical_pages_dedup_distinct_pages_dont() {
        let mut store = PageStore::new();
        let a1 = store.store_page(&page(0xAA));
        let b = store.store_page(&page(0xBB));
        let a2 = store.store_page(&page(0xAA));
        assert_eq!(a1, a2);
        assert_ne!(a1, b);
        assert_eq!(store.refcount(a1), 2);
    }

    #[test]
    fn unref_to_zero_frees_slot_for_reuse() {
        let mut store = PageStore::new();
        let a = store.store_page(&page(0xAA));
        let b = store.store_page(&page(0xBB));
        store.unref_page(a);
        assert_eq!(store.refcount(a), 0);
        let c = store.store_page(&page(0xCC));
        assert_eq!(c, a, "freed slot should be reused before growing");
        assert_eq!(store.refcount(b), 1, "unrelated page untouched");
    }

    #[test]
    fn net_zero_sequence_restores_occupancy() {
        let mut store = PageStore::new();
        let before = store.occupied_indices();
        let a = store.store_page(&page(1));
        let b = store.store_page(&page(2));
        store.unref_page(a);
        store.unref_page(b);
        assert_eq!(store.occupied_indices(), before);
    }
}
