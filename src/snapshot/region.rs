//! A snapshot of one contiguous virtual-address range (spec §4.6, §9 "Privatization").

use std::cmp::Ordering;

use bytes::Bytes;

use crate::error::Result;
use crate::remote::{AddressSpace, ReadOptions};
use crate::snapshot::page_store::{PageIndex, PageStore, PAGE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionTag {
    Data,
    Heap,
}

/// A region's backing storage. Only `Chunked` is produced by `take_region` today; `Flat` exists
/// for the `sparse_checkpoint = false` configuration path, where paying the page-store's hashing
/// overhead isn't worth it for a region the checker will overwrite wholesale on restore anyway.
#[derive(Debug, Clone)]
pub enum Storage {
    Flat(Bytes),
    Chunked(Vec<PageIndex>),
}

/// One `Data` or `Heap` region of a [`super::Snapshot`] (spec §3 Region).
#[derive(Debug, Clone)]
pub struct Region {
    pub tag: RegionTag,
    pub start_addr: u64,
    pub end_addr: u64,
    pub storage: Storage,
}

impl Region {
    pub fn len(&self) -> u64 {
        self.end_addr - self.start_addr
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start_addr && addr < self.end_addr
    }

    /// Takes a page-store-backed snapshot of `[permanent_addr, permanent_addr + size)`, read via
    /// `space`, and files it under `start_addr` for later restore (spec §4.6 `take_region`).
    pub fn take_chunked(
        space: &dyn AddressSpace,
        tag: RegionTag,
        start_addr: u64,
        permanent_addr: u64,
        size: u64,
        store: &mut PageStore,
    ) -> Result<Self> {
        debug_assert_eq!(start_addr % PAGE as u64, 0);
        debug_assert_eq!(permanent_addr % PAGE as u64, 0);
        let n = size.div_ceil(PAGE as u64);
        let mut pages = Vec::with_capacity(n as usize);
        let mut scratch = [0u8; PAGE];
        for i in 0..n {
            space.read_bytes(&mut scratch, PAGE, permanent_addr + i * PAGE as u64, ReadOptions::default())?;
            pages.push(store.store_page(&scratch));
        }
        Ok(Region {
            tag,
            start_addr,
            end_addr: start_addr + size,
            storage: Storage::Chunked(pages),
        })
    }

    pub fn take_flat(
        space: &dyn AddressSpace,
        tag: RegionTag,
        start_addr: u64,
        size: u64,
    ) -> Result<Self> {
        let mut buf = vec![0u8; size as usize];
        space.read_bytes(&mut buf, size as usize, start_addr, ReadOptions::default())?;
        Ok(Region {
            tag,
            start_addr,
            end_addr: start_addr + size,
            storage: Storage::Flat(Bytes::from(buf)),
        })
    }

    /// Writes this region's content back into the application (spec §4.6 `restore_region`). May
    /// overwrite past `end_addr` within the final page; harmless since pages are OS-page aligned.
    pub fn restore(&self, space: &dyn AddressSpace, store: &PageStore) -> Result<()> {
        match &self.storage {
            Storage::Flat(bytes) => space.write_bytes(self.start_addr, bytes)?,
            Storage::Chunked(pages) => {
                for (i, &idx) in pages.iter().enumerate() {
                    let page = store.get_page(idx)?;
                    space.write_bytes(self.start_addr + (i * PAGE) as u64, page)?;
                }
            }
        }
        Ok(())
    }

    /// Drops this region's page references (called when the owning `Snapshot` is discarded).
    pub fn release(&self, store: &mut PageStore) {
        if let Storage::Chunked(pages) = &self.storage {
            for &idx in pages {
                store.unref_page(idx);
            }
        }
    }

    /// Reads `len` bytes starting at `addr` (spec §4.6 "Region read"). Returns a borrowed slice
    /// when the read stays within one page of a `Chunked` region or is `Flat`; otherwise copies
    /// across page boundaries into `scratch` and returns that.
    pub fn read<'a>(
        &'a self,
        addr: u64,
        len: usize,
        scratch: &'a mut Vec<u8>,
        store: &'a PageStore,
    ) -> Result<&'a [u8]> {
        let offset = (addr - self.start_addr) as usize;
        match &self.storage {
            Storage::Flat(bytes) => Ok(&bytes[offset..offset + len]),
            Storage::Chunked(pages) => {
                let first_page = offset / PAGE;
                let page_off = offset % PAGE;
                if page_off + len <= PAGE {
                    let page = store.get_page(pages[first_page])?;
                    return Ok(&page[page_off..page_off + len]);
                }
                scratch.clear();
                scratch.reserve(len);
                let mut remaining = len;
                let mut page_idx = first_page;
                let mut within = page_off;
                while remaining > 0 {
                    let page = store.get_page(pages[page_idx])?;
                    let take = (PAGE - within).min(remaining);
                    scratch.extend_from_slice(&page[within..within + take]);
                    remaining -= take;
                    within = 0;
                    page_idx += 1;
                }
                Ok(scratch.as_slice())
            }
        }
    }
}

/// `memcmp`-equivalent comparison of two (region, offset) byte ranges (spec §4.6).
pub fn memcmp(
    a: &Region,
    addr_a: u64,
    store_a: &PageStore,
    b: &Region,
    addr_b: u64,
    store_b: &PageStore,
    len: usize,
) -> Result<Ordering> {
    let mut scratch_a = Vec::new();
    let mut scratch_b = Vec::new();
    let bytes_a = a.read(addr_a, len, &mut scratch_a, store_a)?;
    let bytes_b = b.read(addr_b, len, &mut scratch_b, store_b)?;
    Ok(bytes_a.cmp(bytes_b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;

    struct FakeMemory(RefCell<HashMap<u64, u8>>);
    impl AddressSpace for FakeMemory {
        fn read_bytes<'a>(
            &self,
            dst: &'a mut [u8],
            len: usize,
            addr: u64,
            _opts: ReadOptions,
        ) -> Result<&'a [u8]> {
            let map = self.0.borrow();
            for i in 0..len {
                dst[i] = *map.get(&(addr + i as u64)).unwrap_or(&0);
            }
            Ok(&dst[..len])
        }
        fn write_bytes(&self, addr: u64, src: &[u8]) -> Result<()> {
            let mut map = self.0.borrow_mut();
            for (i, &b) in src.iter().enumerate() {
                map.insert(addr + i as u64, b);
            }
            Ok(())
        }
    }

    #[test]
    fn round_trip_preserves_bytes_exactly() {
        let mut content = HashMap::new();
        for i in 0..(PAGE * 2) {
            content.insert(i as u64, (i % 251) as u8);
        }
        let space = FakeMemory(RefCell::new(content.clone()));
        let mut store = PageStore::new();
        let region =
            Region::take_chunked(&space, RegionTag::Heap, 0, 0, (PAGE * 2) as u64, &mut store).unwrap();

        let dest = FakeMemory(RefCell::new(HashMap::new()));
        region.restore(&dest, &store).unwrap();
        for i in 0..(PAGE * 2) as u64 {
            assert_eq!(dest.0.borrow()[&i], content[&i]);
        }
    }

    #[test]
    fn memcmp_reflexive_and_consistent_with_bytes() {
        let mut content = HashMap::new();
        for i in 0..PAGE {
            content.insert(i as u64, if i < 10 { 1 } else { 2 });
        }
        let space = FakeMemory(RefCell::new(content));
        let mut store = PageStore::new();
        let region =
            Region::take_chunked(&space, RegionTag::Data, 0, 0, PAGE as u64, &mut store).unwrap();

        assert_eq!(
            memcmp(&region, 0, &store, &region, 0, &store, 10).unwrap(),
            Ordering::Equal
        );
        assert_ne!(
            memcmp(&region, 0, &store, &region, 10, &store, 5).unwrap(),
            Ordering::Equal
        );
    }

    #[test]
    fn read_spans_page_boundary_via_scratch() {
        let mut content = HashMap::new();
        for i in 0..(PAGE * 2) {
            content.insert(i as u64, (i % 7) as u8);
        }
        let space = FakeMemory(RefCell::new(content.clone()));
        let mut store = PageStore::new();
        let region =
            Region::take_chunked(&space, RegionTag::Heap, 0, 0, (PAGE * 2) as u64, &mut store).unwrap();

        let mut scratch = Vec::new();
        let start = PAGE as u64 - 3;
        let bytes = region.read(start, 6, &mut scratch, &store).unwrap();
        let expected: Vec<u8> = (0..6).map(|i| content[&(start + i)]).collect();
        assert_eq!(bytes, expected.as_slice());
    }
}
