//! B+-tree index orchestration (spec.md #4.4 "BtreeIndex").
//!
//! Wraps the `Default` node layout (`node::NodeView`) with the standard
//! B+-tree algorithms: descend-with-parent-stack for split propagation on
//! insert, sibling-chain leaf traversal for approximate matches and
//! cursors, merge-or-redistribute-through-the-parent on erase to hold the
//! minimum-occupancy invariant, and an `integrity_check` that walks the
//! whole tree verifying sort order, sibling-link consistency, and fill
//! ratio.
//!
//! Node rebalancing on erase (spec.md #3/#4.4/#8 "ceil(capacity/3)
//! minimum") merges an underflowed node with a same-parent sibling when
//! the combination fits one page, otherwise borrows a single entry from
//! whichever same-parent sibling exists; an internal root left with no
//! separators collapses into its sole child. Because this layout's keys
//! and records are variable-length there is no fixed slot capacity to
//! take a third of, so `NodeView::is_underflowed` checks byte fill ratio
//! instead of slot count.
//!
//! Duplicate keys (spec.md #4.4 "dup_count / extended duplicate table")
//! are kept inline as a `bincode`-encoded `Vec<Vec<u8>>` in the slot's
//! record bytes up to `duplicate_threshold` entries. Crossing the
//! threshold promotes the slot in one step (spec.md #4.4 "allocate a blob
//! of capacity = 2x current, copy existing duplicates in, set
//! ExtendedDuplicates"): the encoded list moves to a blob, the slot's
//! record bytes become that blob's 8-byte id, and `KEY_FLAG_EXTENDED_
//! DUPLICATES` is set. This crate's blob chains already grow/shrink with
//! their contents (`BlobManager::overwrite`), so there is no separate
//! `capacity` field to track the way spec.md's `(count, capacity,
//! entries)` layout names one — the blob's own page count plays that
//! role. See DESIGN.md.
//!
//! Keys longer than `extended_key_threshold` (spec.md #3/#4.4 "Extended
//! key") are externalized the same way oversized records are in
//! `Database::maybe_externalize`: the slot stores an 8-byte blob id in
//! place of the literal key, tagged with `KEY_FLAG_EXTENDED_KEY`. This
//! applies uniformly to leaf slots and internal separators — a pivot
//! derived from an externalized leaf key keeps its placeholder
//! representation as it propagates up through splits, since re-inlining
//! it into a separator would just reproduce the same unbounded-split
//! problem one level up. `locate_slot`/`slot_key` transparently resolve
//! blob-backed keys wherever a binary search needs to compare against
//! real content.

use crate::blob::BlobManager;
use crate::buffer::changeset::{Changeset, PageBucket};
use crate::buffer::page_cache::PageCache;
use crate::error::{DbError, Result};
use crate::index::key::{compare_keys, FindMode, KeyType, MatchKind, KEY_FLAG_EXTENDED_DUPLICATES, KEY_FLAG_EXTENDED_KEY};
use crate::index::node::{NodeView, NODE_HEADER_SIZE};
use crate::storage::page::{PageId, PageType, INVALID_PAGE_ID};

fn encode_dup_list(records: &[Vec<u8>]) -> Result<Vec<u8>> {
    bincode::serde::encode_to_vec(records, bincode::config::standard())
        .map_err(|e| DbError::Serialization(e.to_string()))
}

fn decode_dup_list(bytes: &[u8]) -> Result<Vec<Vec<u8>>> {
    let (records, _) =
        bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| DbError::Serialization(e.to_string()))?;
    Ok(records)
}

/// How a duplicate-key insert should behave when the key already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertMode {
    /// Fail with `DuplicateKey` if the key exists.
    Unique,
    /// Replace the existing record (or the first duplicate) in place.
    Overwrite,
    /// Append a new duplicate record under the same key.
    Duplicate,
}

/// The position a lookup landed on: which page/slot, and (for duplicate
/// keys) which entry in the inline duplicate list. `match_kind` carries
/// the transient approximate-match marker spec.md #3 attaches to a
/// lookup result: whether the slot holds the requested key exactly, or
/// the nearest predecessor/successor an approximate `FindMode` settled for.
#[derive(Debug, Clone, Copy)]
pub struct Position {
    pub page_id: PageId,
    pub slot: usize,
    pub duplicate_index: u32,
    pub match_kind: crate::index::key::MatchKind,
}

#[derive(Debug, Clone, Copy)]
pub struct BtreeIndex {
    pub root: PageId,
    pub key_type: KeyType,
    pub duplicate_threshold: u8,
    pub extended_key_threshold: usize,
}

impl BtreeIndex {
    pub fn create(
        cache: &mut PageCache,
        changeset: &mut Changeset,
        key_type: KeyType,
        duplicate_threshold: u8,
        extended_key_threshold: usize,
    ) -> Result<Self> {
        let root = cache.allocate_page(PageType::BtreeLeaf)?;
        {
            let page = cache.fetch(root)?;
            page.set_flag(crate::storage::page::PAGE_FLAG_LEAF, true);
            NodeView::init(page.payload_mut());
        }
        changeset.add_page(cache, PageBucket::Index, root);
        Ok(Self {
            root,
            key_type,
            duplicate_threshold,
            extended_key_threshold,
        })
    }

    /// Reattach to a tree whose root already exists on the device (spec.md
    /// #4.7: reopening an environment reconstructs its databases from the
    /// header's descriptor array rather than creating fresh ones).
    pub fn attach(root: PageId, key_type: KeyType, duplicate_threshold: u8, extended_key_threshold: usize) -> Self {
        Self {
            root,
            key_type,
            duplicate_threshold,
            extended_key_threshold,
        }
    }

    fn is_leaf(&self, cache: &mut PageCache, id: PageId) -> Result<bool> {
        Ok(cache.fetch(id)?.page_type()? == PageType::BtreeLeaf)
    }

    /// Externalize `key` through the blob manager when it's longer than
    /// `extended_key_threshold`, mirroring `Database::maybe_externalize`'s
    /// record handling. Returns what to actually store in a slot (literal
    /// key bytes, or an 8-byte blob id) plus the `KEY_FLAG_EXTENDED_KEY`
    /// bit to fold into that slot's flags.
    fn store_key(&self, cache: &mut PageCache, changeset: &mut Changeset, key: &[u8]) -> Result<(Vec<u8>, u8)> {
        if key.len() > self.extended_key_threshold {
            let blobs = BlobManager::new(cache.page_size());
            let blob_id = blobs.allocate(cache, changeset, key)?;
            Ok((blob_id.to_le_bytes().to_vec(), KEY_FLAG_EXTENDED_KEY))
        } else {
            Ok((key.to_vec(), 0))
        }
    }

    /// Resolve slot `i`'s real key bytes, reading its blob if the slot is
    /// flagged `KEY_FLAG_EXTENDED_KEY`.
    fn slot_key(&self, cache: &mut PageCache, node_id: PageId, i: usize) -> Result<Vec<u8>> {
        let (extended, raw) = {
            let page = cache.fetch(node_id)?;
            let node = NodeView::new(page.payload_mut());
            (node.is_extended_key(i), node.key_bytes(i).to_vec())
        };
        if extended {
            let blob_id = u64_from(&raw);
            let blobs = BlobManager::new(cache.page_size());
            blobs.read(cache, blob_id)
        } else {
            Ok(raw)
        }
    }

    /// Resolve a key that isn't (yet) in any slot — a pivot or separator
    /// carried as `(stored_bytes, flags)` between node operations — to its
    /// real content.
    fn resolve_stored(&self, cache: &mut PageCache, stored: &[u8], flags: u8) -> Result<Vec<u8>> {
        if flags & KEY_FLAG_EXTENDED_KEY != 0 {
            let blob_id = u64_from(stored);
            let blobs = BlobManager::new(cache.page_size());
            blobs.read(cache, blob_id)
        } else {
            Ok(stored.to_vec())
        }
    }

    /// Binary-search a node for `key`, resolving any extended (blob-backed)
    /// slot keys along the way so comparisons always see real content
    /// instead of a slot's blob-id placeholder.
    fn locate_slot(
        &self,
        cache: &mut PageCache,
        node_id: PageId,
        key: &[u8],
    ) -> Result<std::result::Result<usize, usize>> {
        let n = {
            let page = cache.fetch(node_id)?;
            NodeView::new(page.payload_mut()).key_count()
        };
        let mut lo = 0usize;
        let mut hi = n;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let candidate = self.slot_key(cache, node_id, mid)?;
            match compare_keys(self.key_type, &candidate, key) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => return Ok(Ok(mid)),
            }
        }
        Ok(Err(lo))
    }

    /// Descend from the root to the leaf that would contain `key`,
    /// recording the path of internal page ids walked (root first).
    fn descend(&self, cache: &mut PageCache, key: &[u8]) -> Result<(PageId, Vec<PageId>)> {
        let mut path = Vec::new();
        let mut current = self.root;
        while !self.is_leaf(cache, current)? {
            path.push(current);
            let located = self.locate_slot(cache, current, key)?;
            let page = cache.fetch(current)?;
            let node = NodeView::new(page.payload_mut());
            let child = match located {
                Ok(i) => u64_from(node.record_bytes(i)),
                Err(0) => node.ptr_down(),
                Err(i) => u64_from(node.record_bytes(i - 1)),
            };
            current = child;
        }
        Ok((current, path))
    }

    /// Exact-match lookup; for `Exact` mode this is the whole job. Other
    /// modes fall through to leaf-chain walks.
    pub fn find(
        &self,
        cache: &mut PageCache,
        key: &[u8],
        mode: FindMode,
    ) -> Result<Option<Position>> {
        let (leaf, _) = self.descend(cache, key)?;
        match self.locate_slot(cache, leaf, key)? {
            Ok(i) => {
                if matches!(mode, FindMode::Exact | FindMode::Le | FindMode::Ge) {
                    return Ok(Some(Position {
                        page_id: leaf,
                        slot: i,
                        duplicate_index: 0,
                        match_kind: MatchKind::Exact,
                    }));
                }
                // Lt / Gt must step past the exact match.
                self.step_from(cache, leaf, i, mode)
            }
            Err(i) => {
                match mode {
                    FindMode::Exact => Ok(None),
                    FindMode::Lt | FindMode::Le => {
                        if i == 0 {
                            self.prev_leaf_last(cache, leaf)
                        } else {
                            Ok(Some(Position {
                                page_id: leaf,
                                slot: i - 1,
                                duplicate_index: 0,
                                match_kind: MatchKind::Lower,
                            }))
                        }
                    }
                    FindMode::Gt | FindMode::Ge => {
                        let node = NodeView::new(cache.fetch(leaf)?.payload_mut());
                        if i < node.key_count() {
                            Ok(Some(Position {
                                page_id: leaf,
                                slot: i,
                                duplicate_index: 0,
                                match_kind: MatchKind::Greater,
                            }))
                        } else {
                            self.next_leaf_first(cache, leaf)
                        }
                    }
                }
            }
        }
    }

    fn step_from(
        &self,
        cache: &mut PageCache,
        leaf: PageId,
        i: usize,
        mode: FindMode,
    ) -> Result<Option<Position>> {
        match mode {
            FindMode::Lt => {
                if i == 0 {
                    self.prev_leaf_last(cache, leaf)
                } else {
                    Ok(Some(Position {
                        page_id: leaf,
                        slot: i - 1,
                        duplicate_index: 0,
                        match_kind: MatchKind::Lower,
                    }))
                }
            }
            FindMode::Gt => {
                let node = NodeView::new(cache.fetch(leaf)?.payload_mut());
                if i + 1 < node.key_count() {
                    Ok(Some(Position {
                        page_id: leaf,
                        slot: i + 1,
                        duplicate_index: 0,
                        match_kind: MatchKind::Greater,
                    }))
                } else {
                    self.next_leaf_first(cache, leaf)
                }
            }
            _ => unreachable!(),
        }
    }

    /// Walk left across the sibling chain to the last key of the nearest
    /// non-empty predecessor leaf, tagged `Lower` (spec.md #3): every
    /// caller of this helper is already looking for the nearest key
    /// strictly below the one it couldn't find in the current leaf.
    fn prev_leaf_last(&self, cache: &mut PageCache, leaf: PageId) -> Result<Option<Position>> {
        let left = NodeView::new(cache.fetch(leaf)?.payload_mut()).left_sibling();
        if left == INVALID_PAGE_ID {
            return Ok(None);
        }
        let node = NodeView::new(cache.fetch(left)?.payload_mut());
        if node.key_count() == 0 {
            return self.prev_leaf_last(cache, left);
        }
        Ok(Some(Position {
            page_id: left,
            slot: node.key_count() - 1,
            duplicate_index: 0,
            match_kind: MatchKind::Lower,
        }))
    }

    /// Walk right across the sibling chain to the first key of the
    /// nearest non-empty successor leaf, tagged `Greater` (spec.md #3),
    /// mirroring `prev_leaf_last`.
    fn next_leaf_first(&self, cache: &mut PageCache, leaf: PageId) -> Result<Option<Position>> {
        let right = NodeView::new(cache.fetch(leaf)?.payload_mut()).right_sibling();
        if right == INVALID_PAGE_ID {
            return Ok(None);
        }
        let node = NodeView::new(cache.fetch(right)?.payload_mut());
        if node.key_count() == 0 {
            return self.next_leaf_first(cache, right);
        }
        Ok(Some(Position {
            page_id: right,
            slot: 0,
            duplicate_index: 0,
            match_kind: MatchKind::Greater,
        }))
    }

    pub fn insert(
        &mut self,
        cache: &mut PageCache,
        changeset: &mut Changeset,
        key: &[u8],
        record: &[u8],
        mode: InsertMode,
    ) -> Result<()> {
        let (leaf, path) = self.descend(cache, key)?;
        let existing = self.locate_slot(cache, leaf, key)?;

        match existing {
            Ok(i) => {
                let (stored_key, key_ext_flag) = {
                    let page = cache.fetch(leaf)?;
                    let node = NodeView::new(page.payload_mut());
                    (node.key_bytes(i).to_vec(), node.flags(i) & KEY_FLAG_EXTENDED_KEY)
                };
                match mode {
                    InsertMode::Unique => Err(DbError::DuplicateKey),
                    InsertMode::Overwrite => {
                        let overwrote = {
                            let page = cache.fetch(leaf)?;
                            let mut node = NodeView::new(page.payload_mut());
                            let flags = node.flags(i);
                            node.try_overwrite_record(i, record, flags)
                        };
                        if !overwrote {
                            let flags = {
                                let page = cache.fetch(leaf)?;
                                NodeView::new(page.payload_mut()).flags(i)
                            };
                            {
                                let page = cache.fetch(leaf)?;
                                let mut node = NodeView::new(page.payload_mut());
                                node.remove_slot(i);
                                node.compact();
                            }
                            let has_room = {
                                let page = cache.fetch(leaf)?;
                                NodeView::new(page.payload_mut()).has_room(stored_key.len(), record.len())
                            };
                            if has_room {
                                let pos = self.locate_slot(cache, leaf, key)?.unwrap_err();
                                let page = cache.fetch(leaf)?;
                                let mut node = NodeView::new(page.payload_mut());
                                node.insert_slot(pos, &stored_key, record, flags, 0)?;
                            } else {
                                self.split_and_retry(cache, changeset, leaf, path, key, &stored_key, record, 0, flags)?;
                            }
                        }
                        changeset.add_page(cache, PageBucket::Index, leaf);
                        Ok(())
                    }
                    InsertMode::Duplicate => {
                        let extended_dup = {
                            let page = cache.fetch(leaf)?;
                            NodeView::new(page.payload_mut()).is_extended_duplicates(i)
                        };
                        if extended_dup {
                            let blob_id = {
                                let page = cache.fetch(leaf)?;
                                u64_from(NodeView::new(page.payload_mut()).record_bytes(i))
                            };
                            let blobs = BlobManager::new(cache.page_size());
                            let mut list = decode_dup_list(&blobs.read(cache, blob_id)?)?;
                            list.push(record.to_vec());
                            let encoded = encode_dup_list(&list)?;
                            let new_blob_id = blobs.overwrite(cache, changeset, blob_id, &encoded)?;
                            let page = cache.fetch(leaf)?;
                            let mut node = NodeView::new(page.payload_mut());
                            let flags = node.flags(i);
                            let ok = node.try_overwrite_record(i, &new_blob_id.to_le_bytes(), flags);
                            debug_assert!(ok, "extended-duplicate slot always has room for an 8-byte blob id");
                            changeset.add_page(cache, PageBucket::Index, leaf);
                            return Ok(());
                        }
                        let (dup_count, flags) = {
                            let page = cache.fetch(leaf)?;
                            let node = NodeView::new(page.payload_mut());
                            (node.dup_count(i), node.flags(i))
                        };
                        let mut list = if dup_count > 0 {
                            let page = cache.fetch(leaf)?;
                            decode_dup_list(NodeView::new(page.payload_mut()).record_bytes(i))?
                        } else {
                            let page = cache.fetch(leaf)?;
                            vec![NodeView::new(page.payload_mut()).record_bytes(i).to_vec()]
                        };
                        if list.len() as u32 >= self.duplicate_threshold as u32 {
                            list.push(record.to_vec());
                            let encoded = encode_dup_list(&list)?;
                            let blobs = BlobManager::new(cache.page_size());
                            let blob_id = blobs.allocate(cache, changeset, &encoded)?;
                            let new_flags = flags | KEY_FLAG_EXTENDED_DUPLICATES | key_ext_flag;
                            {
                                let page = cache.fetch(leaf)?;
                                let mut node = NodeView::new(page.payload_mut());
                                node.remove_slot(i);
                                node.compact();
                            }
                            let blob_id_bytes = blob_id.to_le_bytes();
                            let has_room = {
                                let page = cache.fetch(leaf)?;
                                NodeView::new(page.payload_mut()).has_room(stored_key.len(), blob_id_bytes.len())
                            };
                            if has_room {
                                let pos = self.locate_slot(cache, leaf, key)?.unwrap_err();
                                let page = cache.fetch(leaf)?;
                                let mut node = NodeView::new(page.payload_mut());
                                node.insert_slot(pos, &stored_key, &blob_id_bytes, new_flags, 0)?;
                            } else {
                                self.split_and_retry(
                                    cache, changeset, leaf, path, key, &stored_key, &blob_id_bytes, 0, new_flags,
                                )?;
                            }
                            changeset.add_page(cache, PageBucket::Index, leaf);
                            return Ok(());
                        }
                        list.push(record.to_vec());
                        let encoded = encode_dup_list(&list)?;
                        let new_count = list.len() as u8;
                        {
                            let page = cache.fetch(leaf)?;
                            let mut node = NodeView::new(page.payload_mut());
                            node.remove_slot(i);
                            node.compact();
                        }
                        let has_room = {
                            let page = cache.fetch(leaf)?;
                            NodeView::new(page.payload_mut()).has_room(stored_key.len(), encoded.len())
                        };
                        if has_room {
                            let pos = self.locate_slot(cache, leaf, key)?.unwrap_err();
                            let page = cache.fetch(leaf)?;
                            let mut node = NodeView::new(page.payload_mut());
                            node.insert_slot(pos, &stored_key, &encoded, flags, new_count)?;
                        } else {
                            self.split_and_retry(
                                cache, changeset, leaf, path, key, &stored_key, &encoded, new_count, flags,
                            )?;
                        }
                        changeset.add_page(cache, PageBucket::Index, leaf);
                        Ok(())
                    }
                }
            }
            Err(pos) => {
                let (stored_key, key_ext_flag) = self.store_key(cache, changeset, key)?;
                let has_room = {
                    let page = cache.fetch(leaf)?;
                    NodeView::new(page.payload_mut()).has_room(stored_key.len(), record.len())
                };
                if has_room {
                    let page = cache.fetch(leaf)?;
                    let mut node = NodeView::new(page.payload_mut());
                    node.insert_slot(pos, &stored_key, record, key_ext_flag, 0)?;
                    changeset.add_page(cache, PageBucket::Index, leaf);
                    Ok(())
                } else {
                    self.split_and_retry(cache, changeset, leaf, path, key, &stored_key, record, 0, key_ext_flag)
                }
            }
        }
    }

    /// Split a full leaf, propagate the pivot up the path, then retry the
    /// insert (guaranteed to fit post-split). `real_key` is used to
    /// re-descend to the post-split leaf; `stored_key` (its literal bytes
    /// or blob-id placeholder) is what actually goes in the slot.
    #[allow(clippy::too_many_arguments)]
    fn split_and_retry(
        &mut self,
        cache: &mut PageCache,
        changeset: &mut Changeset,
        leaf: PageId,
        path: Vec<PageId>,
        real_key: &[u8],
        stored_key: &[u8],
        record: &[u8],
        dup_count: u8,
        flags: u8,
    ) -> Result<()> {
        self.split_leaf(cache, changeset, leaf, path)?;
        let (leaf2, _) = self.descend(cache, real_key)?;
        let pos = self.locate_slot(cache, leaf2, real_key)?.unwrap_err();
        let page = cache.fetch(leaf2)?;
        let mut node = NodeView::new(page.payload_mut());
        node.insert_slot(pos, stored_key, record, flags, dup_count)?;
        changeset.add_page(cache, PageBucket::Index, leaf2);
        Ok(())
    }

    fn split_leaf(
        &mut self,
        cache: &mut PageCache,
        changeset: &mut Changeset,
        leaf: PageId,
        path: Vec<PageId>,
    ) -> Result<()> {
        let right_id = cache.allocate_page(PageType::BtreeLeaf)?;
        {
            let page = cache.fetch(right_id)?;
            page.set_flag(crate::storage::page::PAGE_FLAG_LEAF, true);
            NodeView::init(page.payload_mut());
        }

        let (pivot, pivot_flags, old_right_sibling) = {
            let page_size = cache.page_size();
            let left_bytes = cache.fetch(leaf)?.data.clone();
            let mut left_copy = left_bytes;
            let mut left = NodeView::new(&mut left_copy[crate::storage::page::HEADER_SIZE..]);
            let mid = left.key_count() / 2;
            let old_right_sibling = left.right_sibling();
            let right_page = cache.fetch(right_id)?;
            let mut right = NodeView::new(right_page.payload_mut());
            let (pivot, pivot_flags) = left.split_into(&mut right, mid);
            right.set_left_sibling(leaf);
            right.set_right_sibling(old_right_sibling);
            left.set_right_sibling(right_id);
            let left_page = cache.fetch(leaf)?;
            left_page.data = left_copy;
            debug_assert_eq!(left_page.data.len(), page_size);
            (pivot, pivot_flags, old_right_sibling)
        };

        if old_right_sibling != INVALID_PAGE_ID {
            let far = cache.fetch(old_right_sibling)?;
            NodeView::new(far.payload_mut()).set_left_sibling(right_id);
            changeset.add_page(cache, PageBucket::Index, old_right_sibling);
        }
        changeset.add_page(cache, PageBucket::Index, leaf);
        changeset.add_page(cache, PageBucket::Index, right_id);

        self.insert_separator(cache, changeset, path, leaf, right_id, &pivot, pivot_flags)
    }

    #[allow(clippy::too_many_arguments)]
    fn insert_separator(
        &mut self,
        cache: &mut PageCache,
        changeset: &mut Changeset,
        mut path: Vec<PageId>,
        left_child: PageId,
        right_child: PageId,
        separator: &[u8],
        separator_flags: u8,
    ) -> Result<()> {
        let Some(parent) = path.pop() else {
            // No parent: the split node was the root. Build a new root.
            let new_root = cache.allocate_page(PageType::BtreeInternal)?;
            {
                let page = cache.fetch(new_root)?;
                NodeView::init(page.payload_mut());
                let mut node = NodeView::new(page.payload_mut());
                node.set_ptr_down(left_child);
                node.insert_slot(0, separator, &right_child.to_le_bytes(), separator_flags, 0)?;
            }
            changeset.add_page(cache, PageBucket::Index, new_root);
            self.root = new_root;
            return Ok(());
        };

        let real_separator = self.resolve_stored(cache, separator, separator_flags)?;
        let has_room = {
            let page = cache.fetch(parent)?;
            NodeView::new(page.payload_mut()).has_room(separator.len(), 8)
        };
        if has_room {
            let pos = self.locate_slot(cache, parent, &real_separator)?.unwrap_or_else(|e| e);
            let page = cache.fetch(parent)?;
            let mut node = NodeView::new(page.payload_mut());
            node.insert_slot(pos, separator, &right_child.to_le_bytes(), separator_flags, 0)?;
            changeset.add_page(cache, PageBucket::Index, parent);
            Ok(())
        } else {
            // Parent is full: split it too and recurse up.
            self.split_internal(cache, changeset, parent, path, separator, separator_flags, right_child)
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn split_internal(
        &mut self,
        cache: &mut PageCache,
        changeset: &mut Changeset,
        node_id: PageId,
        path: Vec<PageId>,
        incoming_key: &[u8],
        incoming_key_flags: u8,
        incoming_child: PageId,
    ) -> Result<()> {
        let right_id = cache.allocate_page(PageType::BtreeInternal)?;
        {
            let page = cache.fetch(right_id)?;
            NodeView::init(page.payload_mut());
        }

        let (pivot, pivot_flags) = {
            let page_size = cache.page_size();
            let left_bytes = cache.fetch(node_id)?.data.clone();
            let mut left_copy = left_bytes;
            let (pivot, pivot_flags) = {
                let mut left = NodeView::new(&mut left_copy[crate::storage::page::HEADER_SIZE..]);
                let mid = left.key_count() / 2;
                let right_page = cache.fetch(right_id)?;
                let mut right = NodeView::new(right_page.payload_mut());
                let (pivot, pivot_flags) = left.split_into(&mut right, mid);
                // The pivot key moves up and is NOT duplicated into
                // `right`; the leftmost child of `right`'s former first
                // entry becomes its `ptr_down`.
                let right_ptr_down = u64_from(right.record_bytes(0));
                right.remove_slot(0);
                right.compact();
                right.set_ptr_down(right_ptr_down);
                (pivot, pivot_flags)
            };
            let left_page = cache.fetch(node_id)?;
            left_page.data = left_copy;
            debug_assert_eq!(left_page.data.len(), page_size);
            (pivot, pivot_flags)
        };
        changeset.add_page(cache, PageBucket::Index, node_id);
        changeset.add_page(cache, PageBucket::Index, right_id);

        let real_incoming = self.resolve_stored(cache, incoming_key, incoming_key_flags)?;
        let real_pivot = self.resolve_stored(cache, &pivot, pivot_flags)?;
        let insert_into_left = compare_keys(self.key_type, &real_incoming, &real_pivot) == std::cmp::Ordering::Less;

        if insert_into_left {
            let pos = self.locate_slot(cache, node_id, &real_incoming)?.unwrap_or_else(|e| e);
            let page = cache.fetch(node_id)?;
            let mut left = NodeView::new(page.payload_mut());
            left.insert_slot(pos, incoming_key, &incoming_child.to_le_bytes(), incoming_key_flags, 0)?;
            changeset.add_page(cache, PageBucket::Index, node_id);
        } else {
            let pos = self.locate_slot(cache, right_id, &real_incoming)?.unwrap_or_else(|e| e);
            let page = cache.fetch(right_id)?;
            let mut right = NodeView::new(page.payload_mut());
            right.insert_slot(pos, incoming_key, &incoming_child.to_le_bytes(), incoming_key_flags, 0)?;
            changeset.add_page(cache, PageBucket::Index, right_id);
        }

        self.insert_separator(cache, changeset, path, node_id, right_id, &pivot, pivot_flags)
    }

    /// Erase a key (or one duplicate entry of it). Returns whether
    /// anything was removed.
    pub fn erase(
        &mut self,
        cache: &mut PageCache,
        changeset: &mut Changeset,
        key: &[u8],
        duplicate_index: Option<u32>,
    ) -> Result<bool> {
        let (leaf, path) = self.descend(cache, key)?;
        let Ok(i) = self.locate_slot(cache, leaf, key)? else {
            return Ok(false);
        };
        let is_extended_dup = {
            let page = cache.fetch(leaf)?;
            NodeView::new(page.payload_mut()).is_extended_duplicates(i)
        };
        if is_extended_dup {
            let (blob_id, flags_before, stored_key) = {
                let page = cache.fetch(leaf)?;
                let node = NodeView::new(page.payload_mut());
                (u64_from(node.record_bytes(i)), node.flags(i), node.key_bytes(i).to_vec())
            };
            let blobs = BlobManager::new(cache.page_size());
            let mut list = decode_dup_list(&blobs.read(cache, blob_id)?)?;
            let idx = duplicate_index.unwrap_or(0) as usize;
            if idx >= list.len() {
                return Ok(false);
            }
            list.remove(idx);
            // Demote back to inline storage once the list is small enough
            // that it no longer needs an out-of-line table; a table with
            // zero or one entries has no reason to keep its blob.
            if list.len() <= 1 {
                blobs.free(cache, changeset, blob_id)?;
                let flags = flags_before & !KEY_FLAG_EXTENDED_DUPLICATES;
                {
                    let page = cache.fetch(leaf)?;
                    let mut node = NodeView::new(page.payload_mut());
                    node.remove_slot(i);
                    node.compact();
                }
                if let Some(sole) = list.into_iter().next() {
                    let pos = self.locate_slot(cache, leaf, key)?.unwrap_err();
                    let page = cache.fetch(leaf)?;
                    let mut node = NodeView::new(page.payload_mut());
                    node.insert_slot(pos, &stored_key, &sole, flags, 0)?;
                }
                // else: the duplicate list is now empty, the key itself is erased.
            } else {
                let encoded = encode_dup_list(&list)?;
                let new_blob_id = blobs.overwrite(cache, changeset, blob_id, &encoded)?;
                let page = cache.fetch(leaf)?;
                let mut node = NodeView::new(page.payload_mut());
                let flags = node.flags(i);
                let ok = node.try_overwrite_record(i, &new_blob_id.to_le_bytes(), flags);
                debug_assert!(ok, "extended-duplicate slot always has room for an 8-byte blob id");
            }
            changeset.add_page(cache, PageBucket::Index, leaf);
            self.rebalance_after_shrink(cache, changeset, leaf, path)?;
            return Ok(true);
        }
        let (dup_count, stored_key) = {
            let page = cache.fetch(leaf)?;
            let node = NodeView::new(page.payload_mut());
            (node.dup_count(i), node.key_bytes(i).to_vec())
        };
        if dup_count > 1 {
            let (flags, mut list) = {
                let page = cache.fetch(leaf)?;
                let node = NodeView::new(page.payload_mut());
                (node.flags(i), decode_dup_list(node.record_bytes(i))?)
            };
            let idx = duplicate_index.unwrap_or(0) as usize;
            if idx >= list.len() {
                return Ok(false);
            }
            list.remove(idx);
            if list.len() == 1 {
                let sole = list.remove(0);
                {
                    let page = cache.fetch(leaf)?;
                    let mut node = NodeView::new(page.payload_mut());
                    node.remove_slot(i);
                    node.compact();
                }
                let pos = self.locate_slot(cache, leaf, key)?.unwrap_err();
                let page = cache.fetch(leaf)?;
                let mut node = NodeView::new(page.payload_mut());
                node.insert_slot(pos, &stored_key, &sole, flags, 0)?;
            } else {
                let encoded = encode_dup_list(&list)?;
                let new_count = list.len() as u8;
                {
                    let page = cache.fetch(leaf)?;
                    let mut node = NodeView::new(page.payload_mut());
                    node.remove_slot(i);
                    node.compact();
                }
                let has_room = {
                    let page = cache.fetch(leaf)?;
                    NodeView::new(page.payload_mut()).has_room(stored_key.len(), encoded.len())
                };
                if has_room {
                    let pos = self.locate_slot(cache, leaf, key)?.unwrap_err();
                    let page = cache.fetch(leaf)?;
                    let mut node = NodeView::new(page.payload_mut());
                    node.insert_slot(pos, &stored_key, &encoded, flags, new_count)?;
                } else {
                    return Err(DbError::IntegrityViolated(
                        "duplicate list shrank but node has no room to reinsert".into(),
                    ));
                }
            }
        } else {
            let page = cache.fetch(leaf)?;
            let mut node = NodeView::new(page.payload_mut());
            node.remove_slot(i);
            node.compact();
        }
        changeset.add_page(cache, PageBucket::Index, leaf);
        self.rebalance_after_shrink(cache, changeset, leaf, path)?;
        Ok(true)
    }

    /// After a node's slot count shrinks (erase, or cascaded from a
    /// child's merge), fix up underflow: merge with a same-parent sibling
    /// when the combination fits one page, otherwise borrow a single entry
    /// from whichever same-parent sibling exists. `path` is `node_id`'s
    /// ancestor chain, root-first, not including `node_id` itself.
    fn rebalance_after_shrink(
        &mut self,
        cache: &mut PageCache,
        changeset: &mut Changeset,
        node_id: PageId,
        mut path: Vec<PageId>,
    ) -> Result<()> {
        let Some(parent) = path.pop() else {
            return self.collapse_root_if_single_child(cache, node_id);
        };
        let underflowed = {
            let page = cache.fetch(node_id)?;
            NodeView::new(page.payload_mut()).is_underflowed()
        };
        if !underflowed {
            return Ok(());
        }
        let is_leaf = self.is_leaf(cache, node_id)?;
        let (left_sib, right_sib, sep_left, sep_right) = self.same_parent_siblings(cache, parent, node_id)?;

        if let Some(left_id) = left_sib {
            if self.try_merge(cache, changeset, left_id, node_id, parent, sep_left.unwrap(), is_leaf)? {
                return self.rebalance_after_shrink(cache, changeset, parent, path);
            }
            if self.try_redistribute(cache, changeset, left_id, node_id, parent, sep_left.unwrap(), is_leaf, true)? {
                return Ok(());
            }
        }
        if let Some(right_id) = right_sib {
            if self.try_merge(cache, changeset, node_id, right_id, parent, sep_right.unwrap(), is_leaf)? {
                return self.rebalance_after_shrink(cache, changeset, parent, path);
            }
            if self.try_redistribute(cache, changeset, node_id, right_id, parent, sep_right.unwrap(), is_leaf, false)? {
                return Ok(());
            }
        }
        Ok(())
    }

    /// The same-parent left/right siblings of `child` (if any), and the
    /// index of the parent separator sitting between each pair.
    fn same_parent_siblings(
        &self,
        cache: &mut PageCache,
        parent: PageId,
        child: PageId,
    ) -> Result<(Option<PageId>, Option<PageId>, Option<usize>, Option<usize>)> {
        let page = cache.fetch(parent)?;
        let node = NodeView::new(page.payload_mut());
        let n = node.key_count();
        let mut children = Vec::with_capacity(n + 1);
        children.push(node.ptr_down());
        for i in 0..n {
            children.push(u64_from(node.record_bytes(i)));
        }
        let idx = children
            .iter()
            .position(|&c| c == child)
            .expect("node must be a child of the parent recorded on its descent path");
        let left = if idx > 0 { Some(children[idx - 1]) } else { None };
        let right = if idx + 1 < children.len() { Some(children[idx + 1]) } else { None };
        let sep_left = if idx > 0 { Some(idx - 1) } else { None };
        let sep_right = if idx + 1 < children.len() { Some(idx) } else { None };
        Ok((left, right, sep_left, sep_right))
    }

    /// Collapse an internal root left with no separators (both its
    /// children merged into one) down to its sole child. A root leaf is
    /// never collapsed regardless of emptiness.
    fn collapse_root_if_single_child(&mut self, cache: &mut PageCache, node_id: PageId) -> Result<()> {
        if node_id != self.root || self.is_leaf(cache, node_id)? {
            return Ok(());
        }
        let (key_count, only_child) = {
            let page = cache.fetch(node_id)?;
            let node = NodeView::new(page.payload_mut());
            (node.key_count(), node.ptr_down())
        };
        if key_count > 0 {
            return Ok(());
        }
        self.root = only_child;
        let page_size = cache.page_size();
        cache.device_mut().free(node_id, page_size);
        cache.evict_without_writeback(node_id);
        Ok(())
    }

    /// Merge `right_id` into `left_id` (both children of `parent`,
    /// separated by `parent`'s slot `sep_idx`) when the combined entries
    /// fit in one page. Frees `right_id` and removes the separator on
    /// success.
    fn try_merge(
        &mut self,
        cache: &mut PageCache,
        changeset: &mut Changeset,
        left_id: PageId,
        right_id: PageId,
        parent: PageId,
        sep_idx: usize,
        is_leaf: bool,
    ) -> Result<bool> {
        let capacity = cache.page_size() - crate::storage::page::HEADER_SIZE - NODE_HEADER_SIZE;

        let (left_entries, left_ptr_down, left_left_sibling) = {
            let page = cache.fetch(left_id)?;
            let node = NodeView::new(page.payload_mut());
            (node_entries(&node), node.ptr_down(), node.left_sibling())
        };
        let (right_entries, right_ptr_down, right_right_sibling) = {
            let page = cache.fetch(right_id)?;
            let node = NodeView::new(page.payload_mut());
            (node_entries(&node), node.ptr_down(), node.right_sibling())
        };
        let (separator_key, separator_flags) = {
            let page = cache.fetch(parent)?;
            let node = NodeView::new(page.payload_mut());
            (node.key_bytes(sep_idx).to_vec(), node.flags(sep_idx) & KEY_FLAG_EXTENDED_KEY)
        };

        let mut merged = left_entries;
        if !is_leaf {
            merged.push((separator_key, right_ptr_down.to_le_bytes().to_vec(), separator_flags, 0));
        }
        merged.extend(right_entries);

        let required: usize = merged
            .iter()
            .map(|(k, r, _, _)| NodeView::space_needed(k.len(), r.len()))
            .sum();
        if required > capacity {
            return Ok(false);
        }

        {
            let page = cache.fetch(left_id)?;
            NodeView::init(page.payload_mut());
            let mut node = NodeView::new(page.payload_mut());
            node.set_left_sibling(left_left_sibling);
            if is_leaf {
                node.set_right_sibling(right_right_sibling);
            } else {
                node.set_ptr_down(left_ptr_down);
            }
            for (key, record, flags, dup_count) in &merged {
                let pos = node.key_count();
                node.insert_slot(pos, key, record, *flags, *dup_count)?;
            }
        }

        if is_leaf && right_right_sibling != INVALID_PAGE_ID {
            let far = cache.fetch(right_right_sibling)?;
            NodeView::new(far.payload_mut()).set_left_sibling(left_id);
            changeset.add_page(cache, PageBucket::Index, right_right_sibling);
        }

        {
            let page = cache.fetch(parent)?;
            let mut node = NodeView::new(page.payload_mut());
            node.remove_slot(sep_idx);
            node.compact();
        }

        let page_size = cache.page_size();
        cache.device_mut().free(right_id, page_size);
        cache.evict_without_writeback(right_id);

        changeset.add_page(cache, PageBucket::Index, left_id);
        changeset.add_page(cache, PageBucket::Index, parent);
        Ok(true)
    }

    /// Borrow a single entry across the parent separator between
    /// `left_id` and `right_id` — from `left_id` if `right_needs_entries`,
    /// otherwise from `right_id` — when the donor has more than the bare
    /// minimum to spare.
    #[allow(clippy::too_many_arguments)]
    fn try_redistribute(
        &mut self,
        cache: &mut PageCache,
        changeset: &mut Changeset,
        left_id: PageId,
        right_id: PageId,
        parent: PageId,
        sep_idx: usize,
        is_leaf: bool,
        right_needs_entries: bool,
    ) -> Result<bool> {
        let donor_id = if right_needs_entries { left_id } else { right_id };
        let donor_key_count = {
            let page = cache.fetch(donor_id)?;
            NodeView::new(page.payload_mut()).key_count()
        };
        if donor_key_count <= 1 {
            return Ok(false);
        }

        let (new_sep, new_sep_flags): (Vec<u8>, u8) = if right_needs_entries {
            let last_idx = donor_key_count - 1;
            let (last_key, last_record, last_flags, last_dup) = {
                let page = cache.fetch(left_id)?;
                let node = NodeView::new(page.payload_mut());
                (
                    node.key_bytes(last_idx).to_vec(),
                    node.record_bytes(last_idx).to_vec(),
                    node.flags(last_idx),
                    node.dup_count(last_idx),
                )
            };
            {
                let page = cache.fetch(left_id)?;
                let mut node = NodeView::new(page.payload_mut());
                node.remove_slot(last_idx);
                node.compact();
            }
            if is_leaf {
                let page = cache.fetch(right_id)?;
                let mut node = NodeView::new(page.payload_mut());
                node.insert_slot(0, &last_key, &last_record, last_flags, last_dup)?;
                (last_key, last_flags & KEY_FLAG_EXTENDED_KEY)
            } else {
                let (sep_key, sep_flags) = {
                    let page = cache.fetch(parent)?;
                    let node = NodeView::new(page.payload_mut());
                    (node.key_bytes(sep_idx).to_vec(), node.flags(sep_idx) & KEY_FLAG_EXTENDED_KEY)
                };
                let old_right_ptr_down = {
                    let page = cache.fetch(right_id)?;
                    NodeView::new(page.payload_mut()).ptr_down()
                };
                let last_child = u64_from(&last_record);
                {
                    let page = cache.fetch(right_id)?;
                    let mut node = NodeView::new(page.payload_mut());
                    node.insert_slot(0, &sep_key, &old_right_ptr_down.to_le_bytes(), sep_flags, 0)?;
                    node.set_ptr_down(last_child);
                }
                (last_key, last_flags & KEY_FLAG_EXTENDED_KEY)
            }
        } else {
            let (first_key, first_record, first_flags, first_dup) = {
                let page = cache.fetch(right_id)?;
                let node = NodeView::new(page.payload_mut());
                (
                    node.key_bytes(0).to_vec(),
                    node.record_bytes(0).to_vec(),
                    node.flags(0),
                    node.dup_count(0),
                )
            };
            if is_leaf {
                {
                    let page = cache.fetch(right_id)?;
                    let mut node = NodeView::new(page.payload_mut());
                    node.remove_slot(0);
                    node.compact();
                }
                {
                    let page = cache.fetch(left_id)?;
                    let mut node = NodeView::new(page.payload_mut());
                    let pos = node.key_count();
                    node.insert_slot(pos, &first_key, &first_record, first_flags, first_dup)?;
                }
                let page = cache.fetch(right_id)?;
                let node = NodeView::new(page.payload_mut());
                (node.key_bytes(0).to_vec(), node.flags(0) & KEY_FLAG_EXTENDED_KEY)
            } else {
                let right_ptr_down = u64_from(&first_record);
                {
                    let page = cache.fetch(right_id)?;
                    let mut node = NodeView::new(page.payload_mut());
                    node.remove_slot(0);
                    node.compact();
                    node.set_ptr_down(right_ptr_down);
                }
                let (sep_key, sep_flags) = {
                    let page = cache.fetch(parent)?;
                    let node = NodeView::new(page.payload_mut());
                    (node.key_bytes(sep_idx).to_vec(), node.flags(sep_idx) & KEY_FLAG_EXTENDED_KEY)
                };
                {
                    let page = cache.fetch(left_id)?;
                    let mut node = NodeView::new(page.payload_mut());
                    let pos = node.key_count();
                    node.insert_slot(pos, &sep_key, &first_record, sep_flags, 0)?;
                }
                (first_key, first_flags & KEY_FLAG_EXTENDED_KEY)
            }
        };

        let sep_record = {
            let page = cache.fetch(parent)?;
            NodeView::new(page.payload_mut()).record_bytes(sep_idx).to_vec()
        };
        {
            let page = cache.fetch(parent)?;
            let mut node = NodeView::new(page.payload_mut());
            node.remove_slot(sep_idx);
            node.compact();
        }
        let real_new_sep = self.resolve_stored(cache, &new_sep, new_sep_flags)?;
        let pos = self.locate_slot(cache, parent, &real_new_sep)?.unwrap_or_else(|e| e);
        {
            let page = cache.fetch(parent)?;
            let mut node = NodeView::new(page.payload_mut());
            node.insert_slot(pos, &new_sep, &sep_record, new_sep_flags, 0)?;
        }

        changeset.add_page(cache, PageBucket::Index, left_id);
        changeset.add_page(cache, PageBucket::Index, right_id);
        changeset.add_page(cache, PageBucket::Index, parent);
        Ok(true)
    }

    /// Number of records stored under `key`: 0 if absent, 1 for a plain
    /// key, and the duplicate-list length (inline or extended) otherwise.
    pub fn record_count(&self, cache: &mut PageCache, key: &[u8]) -> Result<u32> {
        let (leaf, _) = self.descend(cache, key)?;
        let Ok(i) = self.locate_slot(cache, leaf, key)? else {
            return Ok(0);
        };
        let (is_ext_dup, dup_count) = {
            let page = cache.fetch(leaf)?;
            let node = NodeView::new(page.payload_mut());
            (node.is_extended_duplicates(i), node.dup_count(i))
        };
        if is_ext_dup {
            let blob_id = {
                let page = cache.fetch(leaf)?;
                u64_from(NodeView::new(page.payload_mut()).record_bytes(i))
            };
            let blobs = BlobManager::new(cache.page_size());
            let list = decode_dup_list(&blobs.read(cache, blob_id)?)?;
            return Ok(list.len() as u32);
        }
        Ok(if dup_count > 0 { dup_count as u32 } else { 1 })
    }

    /// Duplicate-list length at a specific `(page_id, slot)`, as opposed to
    /// `record_count`'s by-key lookup. Used by `Cursor` to know whether to
    /// step within a key's duplicates before moving to the next key.
    pub fn slot_duplicate_count(&self, cache: &mut PageCache, page_id: PageId, slot: usize) -> Result<u32> {
        let (is_ext_dup, dup_count) = {
            let page = cache.fetch(page_id)?;
            let node = NodeView::new(page.payload_mut());
            (node.is_extended_duplicates(slot), node.dup_count(slot))
        };
        if is_ext_dup {
            let blob_id = {
                let page = cache.fetch(page_id)?;
                u64_from(NodeView::new(page.payload_mut()).record_bytes(slot))
            };
            let blobs = BlobManager::new(cache.page_size());
            let list = decode_dup_list(&blobs.read(cache, blob_id)?)?;
            return Ok(list.len() as u32);
        }
        Ok(if dup_count > 0 { dup_count as u32 } else { 1 })
    }

    /// The record at `(page_id, slot)`'s `duplicate_index`'th duplicate
    /// (just the slot's own record when it isn't a duplicate list),
    /// resolving an inline or blob-backed duplicate list the same way
    /// `insert`/`erase` do.
    pub fn record_at(&self, cache: &mut PageCache, page_id: PageId, slot: usize, duplicate_index: u32) -> Result<Vec<u8>> {
        let (is_ext_dup, dup_count, raw) = {
            let page = cache.fetch(page_id)?;
            let node = NodeView::new(page.payload_mut());
            (node.is_extended_duplicates(slot), node.dup_count(slot), node.record_bytes(slot).to_vec())
        };
        if is_ext_dup {
            let blob_id = u64_from(&raw);
            let blobs = BlobManager::new(cache.page_size());
            let list = decode_dup_list(&blobs.read(cache, blob_id)?)?;
            return list.get(duplicate_index as usize).cloned().ok_or_else(|| {
                DbError::IntegrityViolated("duplicate_index out of range for extended duplicate table".into())
            });
        }
        if dup_count > 0 {
            let list = decode_dup_list(&raw)?;
            return list.get(duplicate_index as usize).cloned().ok_or_else(|| {
                DbError::IntegrityViolated("duplicate_index out of range for inline duplicate list".into())
            });
        }
        Ok(raw)
    }

    /// Walk the leaf chain left-to-right verifying sort order, sibling
    /// pointer consistency, and minimum fill ratio.
    pub fn integrity_check(&self, cache: &mut PageCache) -> Result<()> {
        let mut current = self.leftmost_leaf(cache)?;
        let mut prev_last_key: Option<Vec<u8>> = None;
        let mut prev_id = INVALID_PAGE_ID;
        loop {
            let (left_sibling, n, right_sibling, underflowed) = {
                let page = cache.fetch(current)?;
                let node = NodeView::new(page.payload_mut());
                (node.left_sibling(), node.key_count(), node.right_sibling(), node.is_underflowed())
            };
            if left_sibling != prev_id {
                return Err(DbError::IntegrityViolated(format!(
                    "leaf {current} has left_sibling {left_sibling} but walk arrived from {prev_id}"
                )));
            }
            if current != self.root && underflowed {
                return Err(DbError::IntegrityViolated(format!(
                    "leaf {current} is underflowed below the minimum fill ratio"
                )));
            }
            let mut keys = Vec::with_capacity(n);
            for i in 0..n {
                keys.push(self.slot_key(cache, current, i)?);
            }
            for i in 1..n {
                if compare_keys(self.key_type, &keys[i - 1], &keys[i]) != std::cmp::Ordering::Less {
                    return Err(DbError::IntegrityViolated(format!("leaf {current} slot {i} out of order")));
                }
            }
            if let (Some(prev), true) = (&prev_last_key, n > 0) {
                if compare_keys(self.key_type, prev, &keys[0]) != std::cmp::Ordering::Less {
                    return Err(DbError::IntegrityViolated(format!(
                        "leaf {current} out of order with predecessor"
                    )));
                }
            }
            if n > 0 {
                prev_last_key = Some(keys[n - 1].clone());
            }
            prev_id = current;
            if right_sibling == INVALID_PAGE_ID {
                break;
            }
            current = right_sibling;
        }
        Ok(())
    }

    fn leftmost_leaf(&self, cache: &mut PageCache) -> Result<PageId> {
        let mut current = self.root;
        while !self.is_leaf(cache, current)? {
            let page = cache.fetch(current)?;
            current = NodeView::new(page.payload_mut()).ptr_down();
        }
        Ok(current)
    }

}

/// Snapshot a node's entries as owned `(key, record, flags, dup_count)`
/// tuples, for merging into a sibling.
fn node_entries(node: &NodeView) -> Vec<(Vec<u8>, Vec<u8>, u8, u8)> {
    (0..node.key_count())
        .map(|i| (node.key_bytes(i).to_vec(), node.record_bytes(i).to_vec(), node.flags(i), node.dup_count(i)))
        .collect()
}

fn u64_from(bytes: &[u8]) -> u64 {
    u64::from_le_bytes(bytes[0..8].try_into().unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::device::MemoryDevice;

    fn setup(page_size: usize) -> (PageCache, Changeset, BtreeIndex) {
        let mut cache = PageCache::new(Box::new(MemoryDevice::new(0)), page_size, 64);
        let mut cs = Changeset::new();
        let idx = BtreeIndex::create(&mut cache, &mut cs, KeyType::Uint32, 32, 64).unwrap();
        (cache, cs, idx)
    }

    #[test]
    fn insert_find_erase_roundtrip() {
        let (mut cache, mut cs, mut idx) = setup(512);
        let k = 7u32.to_le_bytes();
        idx.insert(&mut cache, &mut cs, &k, b"value", InsertMode::Unique).unwrap();
        let pos = idx.find(&mut cache, &k, FindMode::Exact).unwrap().unwrap();
        let page = cache.fetch(pos.page_id).unwrap();
        let node = NodeView::new(page.payload_mut());
        assert_eq!(node.record_bytes(pos.slot), b"value");
        assert!(idx.erase(&mut cache, &mut cs, &k, None).unwrap());
        assert!(idx.find(&mut cache, &k, FindMode::Exact).unwrap().is_none());
    }

    #[test]
    fn inserting_many_keys_forces_splits_and_stays_sorted() {
        let (mut cache, mut cs, mut idx) = setup(256);
        for k in (0u32..200).rev() {
            idx.insert(&mut cache, &mut cs, &k.to_le_bytes(), b"xxxxxxxxxxxx", InsertMode::Unique)
                .unwrap();
        }
        idx.integrity_check(&mut cache).unwrap();
        for k in 0u32..200 {
            assert!(idx.find(&mut cache, &k.to_le_bytes(), FindMode::Exact).unwrap().is_some());
        }
    }

    #[test]
    fn duplicate_key_insert_promotes_then_demotes() {
        let (mut cache, mut cs, mut idx) = setup(512);
        let k = 1u32.to_le_bytes();
        idx.insert(&mut cache, &mut cs, &k, b"a", InsertMode::Unique).unwrap();
        idx.insert(&mut cache, &mut cs, &k, b"b", InsertMode::Duplicate).unwrap();
        idx.insert(&mut cache, &mut cs, &k, b"c", InsertMode::Duplicate).unwrap();
        let pos = idx.find(&mut cache, &k, FindMode::Exact).unwrap().unwrap();
        {
            let page = cache.fetch(pos.page_id).unwrap();
            let node = NodeView::new(page.payload_mut());
            assert_eq!(node.dup_count(pos.slot), 3);
        }
        // Remove "b": two duplicates remain.
        assert!(idx.erase(&mut cache, &mut cs, &k, Some(1)).unwrap());
        let pos = idx.find(&mut cache, &k, FindMode::Exact).unwrap().unwrap();
        {
            let page = cache.fetch(pos.page_id).unwrap();
            let node = NodeView::new(page.payload_mut());
            assert_eq!(node.dup_count(pos.slot), 2);
        }
        // Remove the new index-1 entry ("c"): back to a single plain record.
        assert!(idx.erase(&mut cache, &mut cs, &k, Some(1)).unwrap());
        let pos = idx.find(&mut cache, &k, FindMode::Exact).unwrap().unwrap();
        let page = cache.fetch(pos.page_id).unwrap();
        let node = NodeView::new(page.payload_mut());
        assert_eq!(node.dup_count(pos.slot), 0);
        assert_eq!(node.record_bytes(pos.slot), b"a");
    }

    #[test]
    fn duplicate_insert_past_threshold_promotes_to_extended_table() {
        let mut cache = PageCache::new(Box::new(MemoryDevice::new(0)), 512, 64);
        let mut cs = Changeset::new();
        let mut idx = BtreeIndex::create(&mut cache, &mut cs, KeyType::Binary(None), 4, 64).unwrap();
        let k = b"k".to_vec();
        idx.insert(&mut cache, &mut cs, &k, b"dup-0", InsertMode::Unique).unwrap();
        for i in 1..5 {
            idx.insert(&mut cache, &mut cs, &k, format!("dup-{i}").as_bytes(), InsertMode::Duplicate)
                .unwrap();
        }
        // 5 records now occupy the slot, crossing the threshold of 4.
        assert_eq!(idx.record_count(&mut cache, &k).unwrap(), 5);
        let pos = idx.find(&mut cache, &k, FindMode::Exact).unwrap().unwrap();
        {
            let page = cache.fetch(pos.page_id).unwrap();
            let node = NodeView::new(page.payload_mut());
            assert!(node.is_extended_duplicates(pos.slot));
        }
        // A further insert keeps growing the same extended table.
        idx.insert(&mut cache, &mut cs, &k, b"dup-5", InsertMode::Duplicate).unwrap();
        assert_eq!(idx.record_count(&mut cache, &k).unwrap(), 6);

        // Erasing back down to a single entry demotes to inline storage.
        for i in (1..6).rev() {
            assert!(idx.erase(&mut cache, &mut cs, &k, Some(1)).unwrap());
            let _ = i;
        }
        assert_eq!(idx.record_count(&mut cache, &k).unwrap(), 1);
        let pos = idx.find(&mut cache, &k, FindMode::Exact).unwrap().unwrap();
        let page = cache.fetch(pos.page_id).unwrap();
        let node = NodeView::new(page.payload_mut());
        assert!(!node.is_extended_duplicates(pos.slot));
        assert_eq!(node.record_bytes(pos.slot), b"dup-0");
    }

    #[test]
    fn numeric_keys_sort_numerically() {
        let (mut cache, mut cs, mut idx) = setup(512);
        for k in [300u32, 2, 10] {
            idx.insert(&mut cache, &mut cs, &k.to_le_bytes(), b"v", InsertMode::Unique).unwrap();
        }
        idx.integrity_check(&mut cache).unwrap();
    }

    /// Erasing most of a populated tree must keep every surviving leaf at
    /// or above the minimum fill ratio, via merges and the occasional
    /// borrow-through-parent redistribution, rather than leaving
    /// threadbare leaves in the sibling chain.
    #[test]
    fn erasing_most_keys_triggers_merges_and_keeps_tree_balanced() {
        let (mut cache, mut cs, mut idx) = setup(256);
        for k in 0u32..300 {
            idx.insert(&mut cache, &mut cs, &k.to_le_bytes(), b"xxxxxxxxxxxx", InsertMode::Unique)
                .unwrap();
        }
        idx.integrity_check(&mut cache).unwrap();
        for k in 0u32..290 {
            assert!(idx.erase(&mut cache, &mut cs, &k.to_le_bytes(), None).unwrap());
        }
        idx.integrity_check(&mut cache).unwrap();
        for k in 290u32..300 {
            assert!(idx.find(&mut cache, &k.to_le_bytes(), FindMode::Exact).unwrap().is_some());
        }
        for k in 0u32..290 {
            assert!(idx.find(&mut cache, &k.to_le_bytes(), FindMode::Exact).unwrap().is_none());
        }
    }

    /// Erasing every key collapses the tree back to a single empty root
    /// leaf instead of leaving a dangling chain of internal nodes.
    #[test]
    fn erasing_every_key_collapses_back_to_a_single_root_leaf() {
        let (mut cache, mut cs, mut idx) = setup(256);
        for k in 0u32..300 {
            idx.insert(&mut cache, &mut cs, &k.to_le_bytes(), b"xxxxxxxxxxxx", InsertMode::Unique)
                .unwrap();
        }
        for k in 0u32..300 {
            assert!(idx.erase(&mut cache, &mut cs, &k.to_le_bytes(), None).unwrap());
        }
        idx.integrity_check(&mut cache).unwrap();
        assert!(idx.is_leaf(&mut cache, idx.root).unwrap());
        assert!(idx.find(&mut cache, &0u32.to_le_bytes(), FindMode::Exact).unwrap().is_none());
    }

    /// A binary key far longer than `extended_key_threshold` externalizes
    /// to a blob instead of blowing out leaf capacity, and still round
    /// trips through find/erase across page splits.
    #[test]
    fn oversized_key_externalizes_and_round_trips() {
        let mut cache = PageCache::new(Box::new(MemoryDevice::new(0)), 256, 64);
        let mut cs = Changeset::new();
        let mut idx = BtreeIndex::create(&mut cache, &mut cs, KeyType::Binary(None), 32, 16).unwrap();

        let big_key = vec![7u8; 200];
        idx.insert(&mut cache, &mut cs, &big_key, b"big-value", InsertMode::Unique).unwrap();
        for k in 0u32..40 {
            idx.insert(&mut cache, &mut cs, &k.to_le_bytes(), b"v", InsertMode::Unique).unwrap();
        }
        idx.integrity_check(&mut cache).unwrap();

        let pos = idx.find(&mut cache, &big_key, FindMode::Exact).unwrap().unwrap();
        {
            let page = cache.fetch(pos.page_id).unwrap();
            let node = NodeView::new(page.payload_mut());
            assert!(node.is_extended_key(pos.slot));
            assert_eq!(node.record_bytes(pos.slot), b"big-value");
        }
        assert!(idx.erase(&mut cache, &mut cs, &big_key, None).unwrap());
        assert!(idx.find(&mut cache, &big_key, FindMode::Exact).unwrap().is_none());
    }
}
