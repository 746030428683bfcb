//! Cursor bridging a B+-tree leaf position with a transaction's pending
//! operations (spec.md #4.5 "Cursor").
//!
//! A cursor is plain position data rather than a live borrow: every
//! movement method takes the `PageCache`/`BtreeIndex`/`TxnManager` it
//! needs for that one call, so a `Cursor` can be stored on `Database`
//! state without fighting the borrow checker over a long-lived reference
//! into the cache (spec.md #9 "zero-copy typed accessors", same spirit
//! applied one level up). Only the `Default` layout supports cursors —
//! `Pax`/`Bitmap` chains have no duplicate-navigation concept to expose
//! (see DESIGN.md).

use crate::buffer::page_cache::PageCache;
use crate::error::{DbError, Result};
use crate::index::btree::{BtreeIndex, Position};
use crate::index::key::FindMode;
use crate::index::node::NodeView;
use crate::transaction::{OperationKind, TxnManager};

#[derive(Debug, Clone)]
pub struct Cursor {
    position: Option<Position>,
    pub txn_id: Option<u64>,
}

impl Cursor {
    pub fn new(txn_id: Option<u64>) -> Self {
        Self {
            position: None,
            txn_id,
        }
    }

    pub fn is_nil(&self) -> bool {
        self.position.is_none()
    }

    fn require_position(&self) -> Result<Position> {
        self.position.ok_or(DbError::CursorIsNil)
    }

    /// The approximate-match marker of the cursor's current position
    /// (spec.md #3 "transient flags that mark approximate-match results"):
    /// `Exact` unless the last `move_to` call used `FindMode::Lt/Gt/Le/Ge`
    /// and the requested key wasn't present, in which case it records
    /// whether the cursor settled on the predecessor or successor.
    pub fn match_kind(&self) -> Result<crate::index::key::MatchKind> {
        Ok(self.require_position()?.match_kind)
    }

    pub fn move_to(&mut self, cache: &mut PageCache, index: &BtreeIndex, key: &[u8], mode: FindMode) -> Result<bool> {
        self.position = index.find(cache, key, mode)?;
        Ok(self.position.is_some())
    }

    pub fn first(&mut self, cache: &mut PageCache, index: &BtreeIndex) -> Result<bool> {
        let mut current = index.root;
        loop {
            let page = cache.fetch(current)?;
            if page.page_type()? == crate::storage::page::PageType::BtreeLeaf {
                break;
            }
            current = NodeView::new(page.payload_mut()).ptr_down();
        }
        let node = NodeView::new(cache.fetch(current)?.payload_mut());
        if node.key_count() == 0 {
            self.position = None;
            return Ok(false);
        }
        self.position = Some(Position {
            page_id: current,
            slot: 0,
            duplicate_index: 0,
            match_kind: crate::index::key::MatchKind::Exact,
        });
        Ok(true)
    }

    pub fn last(&mut self, cache: &mut PageCache, index: &BtreeIndex) -> Result<bool> {
        let mut current = index.root;
        loop {
            let page = cache.fetch(current)?;
            if page.page_type()? == crate::storage::page::PageType::BtreeLeaf {
                break;
            }
            let node = NodeView::new(page.payload_mut());
            let n = node.key_count();
            current = if n == 0 { node.ptr_down() } else { u64_from(node.record_bytes(n - 1)) };
        }
        loop {
            let node = NodeView::new(cache.fetch(current)?.payload_mut());
            let right = node.right_sibling();
            if right == crate::storage::page::INVALID_PAGE_ID {
                break;
            }
            current = right;
        }
        let node = NodeView::new(cache.fetch(current)?.payload_mut());
        if node.key_count() == 0 {
            self.position = None;
            return Ok(false);
        }
        let slot = node.key_count() - 1;
        drop(node);
        let last_dup = index.slot_duplicate_count(cache, current, slot)?.saturating_sub(1);
        self.position = Some(Position {
            page_id: current,
            slot,
            duplicate_index: last_dup,
            match_kind: crate::index::key::MatchKind::Exact,
        });
        Ok(true)
    }

    /// Step to the next record: the current key's next duplicate if any
    /// remain, otherwise the first duplicate of the next distinct key
    /// (spec.md #4.5 round-trip law: `insert(k, v, DUPLICATE) n times;
    /// cursor scan at k yields v n times`).
    pub fn next(&mut self, cache: &mut PageCache, index: &BtreeIndex) -> Result<bool> {
        let pos = self.require_position()?;
        let dup_count = index.slot_duplicate_count(cache, pos.page_id, pos.slot)?;
        if pos.duplicate_index + 1 < dup_count {
            self.position = Some(Position {
                duplicate_index: pos.duplicate_index + 1,
                ..pos
            });
            return Ok(true);
        }
        let key = self.current_key(cache)?;
        self.position = index.find(cache, &key, FindMode::Gt)?;
        Ok(self.position.is_some())
    }

    /// Step to the previous record: the current key's previous duplicate
    /// if any remain, otherwise the last duplicate of the previous
    /// distinct key.
    pub fn previous(&mut self, cache: &mut PageCache, index: &BtreeIndex) -> Result<bool> {
        let pos = self.require_position()?;
        if pos.duplicate_index > 0 {
            self.position = Some(Position {
                duplicate_index: pos.duplicate_index - 1,
                ..pos
            });
            return Ok(true);
        }
        let key = self.current_key(cache)?;
        let prev_pos = index.find(cache, &key, FindMode::Lt)?;
        self.position = match prev_pos {
            Some(p) => {
                let last_dup = index.slot_duplicate_count(cache, p.page_id, p.slot)?.saturating_sub(1);
                Some(Position {
                    duplicate_index: last_dup,
                    ..p
                })
            }
            None => None,
        };
        Ok(self.position.is_some())
    }

    pub fn current_key(&self, cache: &mut PageCache) -> Result<Vec<u8>> {
        let pos = self.require_position()?;
        let page = cache.fetch(pos.page_id)?;
        let node = NodeView::new(page.payload_mut());
        Ok(node.key_bytes(pos.slot).to_vec())
    }

    /// The record at the cursor's position (selecting `duplicate_index`
    /// out of an inline or blob-backed duplicate list when the slot holds
    /// one), merged against the owning transaction's pending ops if any
    /// (spec.md #4.5 "merge-on-read"): a pending erase hides the tree's
    /// record, a pending insert/overwrite shadows it. The merge only
    /// applies to a non-duplicate slot — a transaction's pending op
    /// replaces the *whole* key's entry, which the in-flight duplicate
    /// list format doesn't carry an index-level merge for.
    pub fn current_record(
        &self,
        cache: &mut PageCache,
        index: &BtreeIndex,
        txn_manager: Option<&TxnManager>,
    ) -> Result<Option<Vec<u8>>> {
        let pos = self.require_position()?;
        let key = self.current_key(cache)?;
        if pos.duplicate_index == 0 {
            if let (Some(mgr), Some(txn_id)) = (txn_manager, self.txn_id) {
                if let Some(op) = mgr.pending_op(&key, txn_id) {
                    return Ok(match op.kind {
                        OperationKind::Erase | OperationKind::Nop => None,
                        _ => Some(op.record.clone()),
                    });
                }
            }
        }
        Ok(Some(index.record_at(cache, pos.page_id, pos.slot, pos.duplicate_index)?))
    }
}

fn u64_from(bytes: &[u8]) -> u64 {
    u64::from_le_bytes(bytes[0..8].try_into().unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::changeset::Changeset;
    use crate::index::btree::InsertMode;
    use crate::index::key::KeyType;
    use crate::storage::device::MemoryDevice;

    fn setup() -> (PageCache, Changeset, BtreeIndex) {
        let mut cache = PageCache::new(Box::new(MemoryDevice::new(0)), 512, 64);
        let mut cs = Changeset::new();
        let idx = BtreeIndex::create(&mut cache, &mut cs, KeyType::Uint32, 32, 64).unwrap();
        (cache, cs, idx)
    }

    #[test]
    fn first_last_next_previous_walk_in_order() {
        let (mut cache, mut cs, mut idx) = setup();
        for k in [3u32, 1, 2] {
            idx.insert(&mut cache, &mut cs, &k.to_le_bytes(), b"v", InsertMode::Unique).unwrap();
        }
        let mut cur = Cursor::new(None);
        assert!(cur.first(&mut cache, &idx).unwrap());
        assert_eq!(cur.current_key(&mut cache).unwrap(), 1u32.to_le_bytes());
        assert!(cur.next(&mut cache, &idx).unwrap());
        assert_eq!(cur.current_key(&mut cache).unwrap(), 2u32.to_le_bytes());
        assert!(cur.next(&mut cache, &idx).unwrap());
        assert_eq!(cur.current_key(&mut cache).unwrap(), 3u32.to_le_bytes());
        assert!(!cur.next(&mut cache, &idx).unwrap());

        assert!(cur.last(&mut cache, &idx).unwrap());
        assert_eq!(cur.current_key(&mut cache).unwrap(), 3u32.to_le_bytes());
        assert!(cur.previous(&mut cache, &idx).unwrap());
        assert_eq!(cur.current_key(&mut cache).unwrap(), 2u32.to_le_bytes());
    }

    #[test]
    fn approximate_move_to_reports_lower_or_greater_match_kind() {
        use crate::index::key::MatchKind;

        let (mut cache, mut cs, mut idx) = setup();
        for k in [10u32, 20, 30] {
            idx.insert(&mut cache, &mut cs, &k.to_le_bytes(), b"v", InsertMode::Unique).unwrap();
        }
        let mut cur = Cursor::new(None);

        assert!(cur.move_to(&mut cache, &idx, &20u32.to_le_bytes(), FindMode::Exact).unwrap());
        assert_eq!(cur.match_kind().unwrap(), MatchKind::Exact);

        // 25 isn't present: Gt settles on the successor (30), Lt on the
        // predecessor (10).
        assert!(cur.move_to(&mut cache, &idx, &25u32.to_le_bytes(), FindMode::Gt).unwrap());
        assert_eq!(cur.current_key(&mut cache).unwrap(), 30u32.to_le_bytes());
        assert_eq!(cur.match_kind().unwrap(), MatchKind::Greater);

        assert!(cur.move_to(&mut cache, &idx, &25u32.to_le_bytes(), FindMode::Lt).unwrap());
        assert_eq!(cur.current_key(&mut cache).unwrap(), 10u32.to_le_bytes());
        assert_eq!(cur.match_kind().unwrap(), MatchKind::Lower);
    }

    /// spec.md #4.5 round-trip law: `insert(k, v, DUPLICATE) n times;
    /// cursor scan at k yields v n times` — `next` must step through every
    /// duplicate of one key before moving on to the next key.
    #[test]
    fn cursor_yields_every_duplicate_of_a_key_before_advancing() {
        let (mut cache, mut cs, mut idx) = setup();
        let k = 1u32.to_le_bytes();
        idx.insert(&mut cache, &mut cs, &k, b"v0", InsertMode::Unique).unwrap();
        for i in 1..5 {
            idx.insert(&mut cache, &mut cs, &k, format!("v{i}").as_bytes(), InsertMode::Duplicate)
                .unwrap();
        }
        let k2 = 2u32.to_le_bytes();
        idx.insert(&mut cache, &mut cs, &k2, b"only", InsertMode::Unique).unwrap();

        let mut cur = Cursor::new(None);
        assert!(cur.first(&mut cache, &idx).unwrap());
        let mut seen = Vec::new();
        loop {
            seen.push(cur.current_record(&mut cache, &idx, None).unwrap().unwrap());
            if !cur.next(&mut cache, &idx).unwrap() {
                break;
            }
        }
        assert_eq!(
            seen,
            vec![
                b"v0".to_vec(),
                b"v1".to_vec(),
                b"v2".to_vec(),
                b"v3".to_vec(),
                b"v4".to_vec(),
                b"only".to_vec(),
            ]
        );

        // Walking backward from the end revisits the same duplicates in
        // reverse, landing on each key's last duplicate first.
        assert!(cur.last(&mut cache, &idx).unwrap());
        let mut seen_back = Vec::new();
        loop {
            seen_back.push(cur.current_record(&mut cache, &idx, None).unwrap().unwrap());
            if !cur.previous(&mut cache, &idx).unwrap() {
                break;
            }
        }
        seen_back.reverse();
        assert_eq!(seen_back, seen);
    }

    #[test]
    fn nil_cursor_rejects_position_queries() {
        let cur = Cursor::new(None);
        let mut cache = PageCache::new(Box::new(MemoryDevice::new(0)), 512, 4);
        assert!(matches!(cur.current_key(&mut cache), Err(DbError::CursorIsNil)));
    }
}
