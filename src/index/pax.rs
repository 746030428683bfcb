//! PAX (partition-attributes-across) fixed-size node layout (spec.md #3
//! "PAX layout") for fixed-width numeric key types with no duplicates.
//!
//! Instead of Default's slotted variable-size layout, a PAX node stores
//! three parallel fixed-stride arrays — flags, keys, records — so slot `i`
//! is always at a constant offset and needs no descriptor indirection or
//! compaction. This only applies when both the key and the record have a
//! fixed size (spec.md #6 "fixed-size record contract"); `BtreeIndex`
//! picks this layout at database-open when `KeyType::fixed_size()` is
//! `Some` and the database was opened with a fixed `record_size`.

use crate::error::{DbError, Result};
use crate::index::key::{compare_keys, KeyType};
use crate::storage::page::PageId;

/// `key_count:u16 | left:u64 | right:u64 | ptr_down:u64`
const PAX_HEADER_SIZE: usize = 2 + 8 + 8 + 8;

pub struct PaxNodeView<'a> {
    payload: &'a mut [u8],
    key_size: usize,
    record_size: usize,
}

impl<'a> PaxNodeView<'a> {
    pub fn new(payload: &'a mut [u8], key_size: usize, record_size: usize) -> Self {
        Self {
            payload,
            key_size,
            record_size,
        }
    }

    pub fn capacity(payload_len: usize, key_size: usize, record_size: usize) -> usize {
        (payload_len - PAX_HEADER_SIZE) / (1 + key_size + record_size)
    }

    pub fn init(payload: &mut [u8]) {
        payload[0..2].copy_from_slice(&0u16.to_le_bytes());
        payload[2..10].copy_from_slice(&0u64.to_le_bytes());
        payload[10..18].copy_from_slice(&0u64.to_le_bytes());
        payload[18..26].copy_from_slice(&0u64.to_le_bytes());
    }

    pub fn key_count(&self) -> usize {
        u16::from_le_bytes(self.payload[0..2].try_into().unwrap()) as usize
    }

    fn set_key_count(&mut self, n: usize) {
        self.payload[0..2].copy_from_slice(&(n as u16).to_le_bytes());
    }

    pub fn left_sibling(&self) -> PageId {
        u64::from_le_bytes(self.payload[2..10].try_into().unwrap())
    }

    pub fn set_left_sibling(&mut self, id: PageId) {
        self.payload[2..10].copy_from_slice(&id.to_le_bytes());
    }

    pub fn right_sibling(&self) -> PageId {
        u64::from_le_bytes(self.payload[10..18].try_into().unwrap())
    }

    pub fn set_right_sibling(&mut self, id: PageId) {
        self.payload[10..18].copy_from_slice(&id.to_le_bytes());
    }

    pub fn ptr_down(&self) -> PageId {
        u64::from_le_bytes(self.payload[18..26].try_into().unwrap())
    }

    pub fn set_ptr_down(&mut self, id: PageId) {
        self.payload[18..26].copy_from_slice(&id.to_le_bytes());
    }

    fn flag_offset(&self, i: usize) -> usize {
        PAX_HEADER_SIZE + i
    }

    fn key_offset(&self, i: usize) -> usize {
        PAX_HEADER_SIZE + self.flags_region_len() + i * self.key_size
    }

    fn record_offset(&self, i: usize) -> usize {
        PAX_HEADER_SIZE + self.flags_region_len() + self.keys_region_len() + i * self.record_size
    }

    fn capacity_here(&self) -> usize {
        Self::capacity(self.payload.len(), self.key_size, self.record_size)
    }

    fn flags_region_len(&self) -> usize {
        self.capacity_here()
    }

    fn keys_region_len(&self) -> usize {
        self.capacity_here() * self.key_size
    }

    pub fn flags(&self, i: usize) -> u8 {
        self.payload[self.flag_offset(i)]
    }

    pub fn set_flags(&mut self, i: usize, f: u8) {
        let off = self.flag_offset(i);
        self.payload[off] = f;
    }

    pub fn key(&self, i: usize) -> &[u8] {
        let off = self.key_offset(i);
        &self.payload[off..off + self.key_size]
    }

    pub fn record(&self, i: usize) -> &[u8] {
        let off = self.record_offset(i);
        &self.payload[off..off + self.record_size]
    }

    pub fn has_room(&self) -> bool {
        self.key_count() < self.capacity_here()
    }

    /// Binary search by key, returning `Ok(i)` on exact match or `Err(i)`
    /// as the sorted insertion point.
    pub fn find_slot(&self, key_type: KeyType, key: &[u8]) -> std::result::Result<usize, usize> {
        let n = self.key_count();
        let mut lo = 0usize;
        let mut hi = n;
        while lo < hi {
            let mid = (lo + hi) / 2;
            match compare_keys(key_type, self.key(mid), key) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => return Ok(mid),
            }
        }
        Err(lo)
    }

    pub fn insert_at(&mut self, i: usize, key: &[u8], record: &[u8], flags: u8) -> Result<()> {
        if !self.has_room() {
            return Err(DbError::IntegrityViolated("PAX node is full".into()));
        }
        let n = self.key_count();
        for j in (i..n).rev() {
            let (ko, ro, fo) = (self.key_offset(j), self.record_offset(j), self.flag_offset(j));
            let (kd, rd, fd) = (
                self.key_offset(j + 1),
                self.record_offset(j + 1),
                self.flag_offset(j + 1),
            );
            let (ks, rs) = (self.key_size, self.record_size);
            self.payload.copy_within(ko..ko + ks, kd);
            self.payload.copy_within(ro..ro + rs, rd);
            self.payload[fd] = self.payload[fo];
        }
        let ko = self.key_offset(i);
        let ro = self.record_offset(i);
        let fo = self.flag_offset(i);
        self.payload[ko..ko + self.key_size].copy_from_slice(key);
        self.payload[ro..ro + self.record_size].copy_from_slice(record);
        self.payload[fo] = flags;
        self.set_key_count(n + 1);
        Ok(())
    }

    pub fn remove_at(&mut self, i: usize) {
        let n = self.key_count();
        for j in i..n - 1 {
            let (ko, ro, fo) = (self.key_offset(j), self.record_offset(j), self.flag_offset(j));
            let (ks, rs) = (self.key_size, self.record_size);
            let (kd, rd, fd) = (
                self.key_offset(j + 1),
                self.record_offset(j + 1),
                self.flag_offset(j + 1),
            );
            self.payload.copy_within(kd..kd + ks, ko);
            self.payload.copy_within(rd..rd + rs, ro);
            self.payload[fo] = self.payload[fd];
        }
        self.set_key_count(n - 1);
    }

    pub fn overwrite_record(&mut self, i: usize, record: &[u8]) {
        let off = self.record_offset(i);
        self.payload[off..off + self.record_size].copy_from_slice(record);
    }

    /// Move entries `[mid, n)` into an already-`init`ialized `right` node.
    /// Returns the pivot key (a copy of entry `mid`'s key, captured before
    /// the move).
    pub fn split_into(&mut self, right: &mut PaxNodeView, mid: usize) -> Vec<u8> {
        let n = self.key_count();
        let pivot = self.key(mid).to_vec();
        for (dst, src) in (mid..n).enumerate() {
            let key = self.key(src).to_vec();
            let record = self.record(src).to_vec();
            let flags = self.flags(src);
            right.insert_at(dst, &key, &record, flags).expect("right has room");
        }
        for _ in mid..n {
            self.remove_at(mid);
        }
        pivot
    }
}

/// Orchestrates a chain of PAX pages in ascending key order. Unlike
/// `BtreeIndex`, there is no internal-node routing layer: lookups walk the
/// sibling chain, checking each page's last key to decide whether to stop
/// or continue. This fits the layout's target workload — dense,
/// fixed-width keys with no duplicates, usually small enough that a chain
/// scan over a handful of full pages beats the bookkeeping of a second
/// node format for internal routing. A workload large enough to need
/// multi-level routing over a PAX leaf is better served by `BtreeIndex`
/// with `KeyType`'s Default layout; see DESIGN.md.
pub struct PaxIndex {
    pub root: PageId,
    pub key_type: KeyType,
    pub key_size: usize,
    pub record_size: usize,
}

impl PaxIndex {
    pub fn create(
        cache: &mut crate::buffer::page_cache::PageCache,
        changeset: &mut crate::buffer::changeset::Changeset,
        key_type: KeyType,
        key_size: usize,
        record_size: usize,
    ) -> Result<Self> {
        use crate::buffer::changeset::PageBucket;
        use crate::storage::page::PageType;
        let root = cache.allocate_page(PageType::BtreeLeaf)?;
        {
            let page = cache.fetch(root)?;
            PaxNodeView::init(page.payload_mut());
        }
        changeset.add_page(cache, PageBucket::Index, root);
        Ok(Self {
            root,
            key_type,
            key_size,
            record_size,
        })
    }

    /// Reattach to a page chain that already exists on the device (spec.md
    /// #4.7 reopen).
    pub fn attach(root: PageId, key_type: KeyType, key_size: usize, record_size: usize) -> Self {
        Self {
            root,
            key_type,
            key_size,
            record_size,
        }
    }

    fn find_page(&self, cache: &mut crate::buffer::page_cache::PageCache, key: &[u8]) -> Result<PageId> {
        let mut current = self.root;
        loop {
            let page = cache.fetch(current)?;
            let view = PaxNodeView::new(page.payload_mut(), self.key_size, self.record_size);
            let n = view.key_count();
            let right = view.right_sibling();
            if n == 0 || right == crate::storage::page::INVALID_PAGE_ID {
                return Ok(current);
            }
            if compare_keys(self.key_type, key, view.key(n - 1)) != std::cmp::Ordering::Greater {
                return Ok(current);
            }
            current = right;
        }
    }

    pub fn find(
        &self,
        cache: &mut crate::buffer::page_cache::PageCache,
        key: &[u8],
    ) -> Result<Option<(PageId, usize)>> {
        let page_id = self.find_page(cache, key)?;
        let page = cache.fetch(page_id)?;
        let view = PaxNodeView::new(page.payload_mut(), self.key_size, self.record_size);
        Ok(view.find_slot(self.key_type, key).ok().map(|i| (page_id, i)))
    }

    pub fn insert(
        &mut self,
        cache: &mut crate::buffer::page_cache::PageCache,
        changeset: &mut crate::buffer::changeset::Changeset,
        key: &[u8],
        record: &[u8],
        overwrite: bool,
    ) -> Result<()> {
        use crate::buffer::changeset::PageBucket;
        let page_id = self.find_page(cache, key)?;
        let page = cache.fetch(page_id)?;
        let mut view = PaxNodeView::new(page.payload_mut(), self.key_size, self.record_size);
        match view.find_slot(self.key_type, key) {
            Ok(i) => {
                if !overwrite {
                    return Err(DbError::DuplicateKey);
                }
                view.overwrite_record(i, record);
                changeset.add_page(cache, PageBucket::Index, page_id);
                Ok(())
            }
            Err(pos) => {
                if view.has_room() {
                    view.insert_at(pos, key, record, 0)?;
                    changeset.add_page(cache, PageBucket::Index, page_id);
                    Ok(())
                } else {
                    drop(view);
                    self.split_and_insert(cache, changeset, page_id, key, record)
                }
            }
        }
    }

    fn split_and_insert(
        &mut self,
        cache: &mut crate::buffer::page_cache::PageCache,
        changeset: &mut crate::buffer::changeset::Changeset,
        page_id: PageId,
        key: &[u8],
        record: &[u8],
    ) -> Result<()> {
        use crate::buffer::changeset::PageBucket;
        use crate::storage::page::PageType;

        let new_id = cache.allocate_page(PageType::BtreeLeaf)?;
        {
            let page = cache.fetch(new_id)?;
            PaxNodeView::init(page.payload_mut());
        }

        let page_size = cache.page_size();
        let left_bytes = cache.fetch(page_id)?.data.clone();
        let mut left_copy = left_bytes;
        let mut left = PaxNodeView::new(
            &mut left_copy[crate::storage::page::HEADER_SIZE..],
            self.key_size,
            self.record_size,
        );
        let mid = left.key_count() / 2;
        let old_right = left.right_sibling();
        {
            let right_page = cache.fetch(new_id)?;
            let mut right = PaxNodeView::new(right_page.payload_mut(), self.key_size, self.record_size);
            left.split_into(&mut right, mid);
            right.set_left_sibling(page_id);
            right.set_right_sibling(old_right);
        }
        left.set_right_sibling(new_id);
        {
            let left_page = cache.fetch(page_id)?;
            left_page.data = left_copy;
            debug_assert_eq!(left_page.data.len(), page_size);
        }
        if old_right != crate::storage::page::INVALID_PAGE_ID {
            let far = cache.fetch(old_right)?;
            PaxNodeView::new(far.payload_mut(), self.key_size, self.record_size).set_left_sibling(new_id);
            changeset.add_page(cache, PageBucket::Index, old_right);
        }
        changeset.add_page(cache, PageBucket::Index, page_id);
        changeset.add_page(cache, PageBucket::Index, new_id);

        self.insert(cache, changeset, key, record, false)
    }

    pub fn erase(
        &mut self,
        cache: &mut crate::buffer::page_cache::PageCache,
        changeset: &mut crate::buffer::changeset::Changeset,
        key: &[u8],
    ) -> Result<bool> {
        use crate::buffer::changeset::PageBucket;
        let page_id = self.find_page(cache, key)?;
        let page = cache.fetch(page_id)?;
        let mut view = PaxNodeView::new(page.payload_mut(), self.key_size, self.record_size);
        let Ok(i) = view.find_slot(self.key_type, key) else {
            return Ok(false);
        };
        view.remove_at(i);
        changeset.add_page(cache, PageBucket::Index, page_id);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::key::KeyType;

    fn node(buf: &mut [u8]) -> PaxNodeView<'_> {
        PaxNodeView::init(buf);
        PaxNodeView::new(buf, 4, 8)
    }

    #[test]
    fn insert_keeps_sorted_order() {
        let mut buf = vec![0u8; 512];
        let mut n = node(&mut buf);
        for k in [30u32, 10, 20] {
            let pos = n.find_slot(KeyType::Uint32, &k.to_le_bytes()).unwrap_err();
            n.insert_at(pos, &k.to_le_bytes(), &[0u8; 8], 0).unwrap();
        }
        let keys: Vec<u32> = (0..n.key_count())
            .map(|i| u32::from_le_bytes(n.key(i).try_into().unwrap()))
            .collect();
        assert_eq!(keys, vec![10, 20, 30]);
    }

    #[test]
    fn split_moves_upper_half() {
        let mut left_buf = vec![0u8; 512];
        let mut right_buf = vec![0u8; 512];
        let mut left = node(&mut left_buf);
        for k in 0u32..6 {
            let pos = left.find_slot(KeyType::Uint32, &k.to_le_bytes()).unwrap_err();
            left.insert_at(pos, &k.to_le_bytes(), &[0u8; 8], 0).unwrap();
        }
        PaxNodeView::init(&mut right_buf);
        let mut right = PaxNodeView::new(&mut right_buf, 4, 8);
        let pivot = left.split_into(&mut right, 3);
        assert_eq!(u32::from_le_bytes(pivot.try_into().unwrap()), 3);
        assert_eq!(left.key_count(), 3);
        assert_eq!(right.key_count(), 3);
    }

    #[test]
    fn pax_index_insert_find_erase_roundtrip() {
        use crate::buffer::changeset::Changeset;
        use crate::buffer::page_cache::PageCache;
        use crate::storage::device::MemoryDevice;

        let mut cache = PageCache::new(Box::new(MemoryDevice::new(0)), 256, 32);
        let mut cs = Changeset::new();
        let mut idx = PaxIndex::create(&mut cache, &mut cs, KeyType::Uint32, 4, 8).unwrap();
        let k = 5u32.to_le_bytes();
        idx.insert(&mut cache, &mut cs, &k, &[1u8; 8], false).unwrap();
        assert!(idx.find(&mut cache, &k).unwrap().is_some());
        assert!(idx.erase(&mut cache, &mut cs, &k).unwrap());
        assert!(idx.find(&mut cache, &k).unwrap().is_none());
    }

    #[test]
    fn pax_index_splits_across_pages_and_stays_sorted() {
        use crate::buffer::changeset::Changeset;
        use crate::buffer::page_cache::PageCache;
        use crate::storage::device::MemoryDevice;

        let mut cache = PageCache::new(Box::new(MemoryDevice::new(0)), 128, 64);
        let mut cs = Changeset::new();
        let mut idx = PaxIndex::create(&mut cache, &mut cs, KeyType::Uint32, 4, 8).unwrap();
        for k in (0u32..100).rev() {
            idx.insert(&mut cache, &mut cs, &k.to_le_bytes(), &[2u8; 8], false).unwrap();
        }
        for k in 0u32..100 {
            assert!(idx.find(&mut cache, &k.to_le_bytes()).unwrap().is_some());
        }
    }
}
