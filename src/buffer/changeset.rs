//! Changeset: the per-operation group of dirty pages flushed atomically
//! (spec.md #4.2).

use crate::buffer::page_cache::PageCache;
use crate::error::Result;
use crate::journal::wal::Journal;
use crate::storage::page::PageId;
use std::collections::HashSet;

/// Flush-order bucket. Declared order (blob, page-manager, index, other)
/// is the order `Changeset::flush` writes pages back in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageBucket {
    Blob,
    PageManager,
    Index,
    Other,
}

impl PageBucket {
    fn rank(self) -> u8 {
        match self {
            PageBucket::Blob => 0,
            PageBucket::PageManager => 1,
            PageBucket::Index => 2,
            PageBucket::Other => 3,
        }
    }
}

/// Ordered set of dirty pages produced by one externally visible operation.
#[derive(Default)]
pub struct Changeset {
    pages: Vec<(PageBucket, PageId)>,
    seen: HashSet<PageId>,
}

impl Changeset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Insert `page_id` into the changeset exactly once, pinning it in the
    /// cache for the lifetime of the changeset.
    pub fn add_page(&mut self, cache: &mut PageCache, bucket: PageBucket, page_id: PageId) {
        if self.seen.insert(page_id) {
            cache.pin(page_id);
            self.pages.push((bucket, page_id));
        }
    }

    /// Stamp every page with `lsn`, durably log the changeset, then write
    /// pages back through the device in bucket order, unpinning as it goes.
    /// If journaling fails no page has been written back (spec.md #4.2).
    ///
    /// `journal` is `None` for `in-memory` environments (spec.md #6): there
    /// is nothing to crash-recover, so the changeset's only job is to stamp
    /// LSNs and write pages back through the cache in bucket order.
    pub fn flush(&mut self, lsn: u64, cache: &mut PageCache, journal: Option<&mut Journal>) -> Result<()> {
        if self.pages.is_empty() {
            return Ok(());
        }
        let mut ordered = self.pages.clone();
        ordered.sort_by_key(|(bucket, _)| bucket.rank());

        let mut entries = Vec::with_capacity(ordered.len());
        for &(_, id) in &ordered {
            let page = cache.fetch(id)?;
            page.set_lsn(lsn);
            page.seal();
            entries.push((page.id, page.data.clone()));
        }

        if let Some(journal) = journal {
            journal.append_changeset(lsn, &entries)?;
            journal.flush()?;
        }

        for &(_, id) in &ordered {
            cache.write_through(id)?;
            cache.unpin(id);
        }

        self.pages.clear();
        self.seen.clear();
        Ok(())
    }

    /// Discard the changeset without writing anything back (used when an
    /// operation aborts before flush).
    pub fn discard(&mut self, cache: &mut PageCache) {
        for &(_, id) in &self.pages {
            cache.unpin(id);
        }
        self.pages.clear();
        self.seen.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::page_cache::PageCache;
    use crate::journal::wal::Journal;
    use crate::storage::device::MemoryDevice;
    use crate::storage::page::PageType;
    use tempfile::tempdir;

    #[test]
    fn flush_writes_back_in_bucket_order() {
        let mut cache = PageCache::new(Box::new(MemoryDevice::new(0)), 256, 8);
        let dir = tempdir().unwrap();
        let mut journal = Journal::create(dir.path(), 1024 * 1024).unwrap();

        let blob_page = cache.allocate_page(PageType::Blob).unwrap();
        let index_page = cache.allocate_page(PageType::BtreeLeaf).unwrap();

        let mut cs = Changeset::new();
        // Insert in reverse of flush order to exercise the bucket sort.
        cs.add_page(&mut cache, PageBucket::Index, index_page);
        cs.add_page(&mut cache, PageBucket::Blob, blob_page);
        cs.flush(1, &mut cache, Some(&mut journal)).unwrap();

        assert!(cs.is_empty());
        assert_eq!(cache.fetch(blob_page).unwrap().lsn(), 1);
        assert_eq!(cache.fetch(index_page).unwrap().lsn(), 1);
    }
}
