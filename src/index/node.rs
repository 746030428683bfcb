//! The "Default" node payload layout: variable-size keys and records with
//! optional duplicates (spec.md #3 "Default layout").
//!
//! A fixed-size index of slot descriptors grows from the top of the
//! payload; key and record bytes grow from the bottom. Rather than the
//! teacher's persisted per-node freelist of evicted-entry chunk sizes,
//! this layout reclaims fragmentation with an on-demand `compact()` pass
//! before a split is considered (see DESIGN.md) — functionally equivalent,
//! simpler to keep correct without a compiler to check it against.

use crate::error::{DbError, Result};
use crate::index::key::{compare_keys, KeyType, KEY_FLAG_EXTENDED_DUPLICATES, KEY_FLAG_EXTENDED_KEY};
use std::cmp::Ordering;

/// `key_count:u16 | left:u64 | right:u64 | ptr_down:u64 | data_start:u16`
pub const NODE_HEADER_SIZE: usize = 2 + 8 + 8 + 8 + 2;
/// `flags:u8 | key_size:u16 | record_size:u16 | dup_count:u8 | data_offset:u16`
pub const SLOT_DESC_SIZE: usize = 1 + 2 + 2 + 1 + 2;

#[derive(Debug, Clone, Copy, Default)]
pub struct SlotDescriptor {
    pub flags: u8,
    pub key_size: u16,
    pub record_size: u16,
    pub dup_count: u8,
    pub data_offset: u16,
}

/// A borrowed, mutable view over one btree node's page payload.
pub struct NodeView<'a> {
    payload: &'a mut [u8],
}

impl<'a> NodeView<'a> {
    pub fn new(payload: &'a mut [u8]) -> Self {
        Self { payload }
    }

    pub fn init(payload: &mut [u8]) {
        payload[0..2].copy_from_slice(&0u16.to_le_bytes());
        payload[2..10].copy_from_slice(&0u64.to_le_bytes());
        payload[10..18].copy_from_slice(&0u64.to_le_bytes());
        payload[18..26].copy_from_slice(&0u64.to_le_bytes());
        let data_start = payload.len() as u16;
        payload[26..28].copy_from_slice(&data_start.to_le_bytes());
    }

    pub fn key_count(&self) -> usize {
        u16::from_le_bytes(self.payload[0..2].try_into().unwrap()) as usize
    }

    fn set_key_count(&mut self, n: usize) {
        self.payload[0..2].copy_from_slice(&(n as u16).to_le_bytes());
    }

    pub fn left_sibling(&self) -> u64 {
        u64::from_le_bytes(self.payload[2..10].try_into().unwrap())
    }

    pub fn set_left_sibling(&mut self, id: u64) {
        self.payload[2..10].copy_from_slice(&id.to_le_bytes());
    }

    pub fn right_sibling(&self) -> u64 {
        u64::from_le_bytes(self.payload[10..18].try_into().unwrap())
    }

    pub fn set_right_sibling(&mut self, id: u64) {
        self.payload[10..18].copy_from_slice(&id.to_le_bytes());
    }

    pub fn ptr_down(&self) -> u64 {
        u64::from_le_bytes(self.payload[18..26].try_into().unwrap())
    }

    pub fn set_ptr_down(&mut self, id: u64) {
        self.payload[18..26].copy_from_slice(&id.to_le_bytes());
    }

    fn data_start(&self) -> usize {
        u16::from_le_bytes(self.payload[26..28].try_into().unwrap()) as usize
    }

    fn set_data_start(&mut self, off: usize) {
        self.payload[26..28].copy_from_slice(&(off as u16).to_le_bytes());
    }

    fn descriptor_offset(&self, i: usize) -> usize {
        NODE_HEADER_SIZE + i * SLOT_DESC_SIZE
    }

    pub fn descriptor(&self, i: usize) -> SlotDescriptor {
        let off = self.descriptor_offset(i);
        let b = &self.payload[off..off + SLOT_DESC_SIZE];
        SlotDescriptor {
            flags: b[0],
            key_size: u16::from_le_bytes(b[1..3].try_into().unwrap()),
            record_size: u16::from_le_bytes(b[3..5].try_into().unwrap()),
            dup_count: b[5],
            data_offset: u16::from_le_bytes(b[6..8].try_into().unwrap()),
        }
    }

    fn set_descriptor(&mut self, i: usize, d: SlotDescriptor) {
        let off = self.descriptor_offset(i);
        let b = &mut self.payload[off..off + SLOT_DESC_SIZE];
        b[0] = d.flags;
        b[1..3].copy_from_slice(&d.key_size.to_le_bytes());
        b[3..5].copy_from_slice(&d.record_size.to_le_bytes());
        b[5] = d.dup_count;
        b[6..8].copy_from_slice(&d.data_offset.to_le_bytes());
    }

    pub fn key_bytes(&self, i: usize) -> &[u8] {
        let d = self.descriptor(i);
        let start = d.data_offset as usize;
        &self.payload[start..start + d.key_size as usize]
    }

    pub fn record_bytes(&self, i: usize) -> &[u8] {
        let d = self.descriptor(i);
        let start = d.data_offset as usize + d.key_size as usize;
        &self.payload[start..start + d.record_size as usize]
    }

    pub fn flags(&self, i: usize) -> u8 {
        self.descriptor(i).flags
    }

    pub fn set_flags(&mut self, i: usize, flags: u8) {
        let mut d = self.descriptor(i);
        d.flags = flags;
        self.set_descriptor(i, d);
    }

    pub fn dup_count(&self, i: usize) -> u8 {
        self.descriptor(i).dup_count
    }

    /// Bytes of free space between the end of the descriptor array and the
    /// start of the data area.
    fn free_space(&self) -> usize {
        let desc_end = self.descriptor_offset(self.key_count());
        let data_start = self.data_start();
        data_start.saturating_sub(desc_end)
    }

    /// Space a new entry of `key_len + record_len` bytes would need,
    /// including its descriptor.
    pub fn space_needed(key_len: usize, record_len: usize) -> usize {
        SLOT_DESC_SIZE + key_len + record_len
    }

    pub fn has_room(&self, key_len: usize, record_len: usize) -> bool {
        self.free_space() >= Self::space_needed(key_len, record_len)
    }

    /// Byte-fill-ratio analogue of the classic B-tree "at least
    /// ceil(capacity/3) entries" minimum-occupancy invariant (spec.md #3,
    /// #4.4, #8). This layout's keys and records are variable length, so
    /// there is no fixed slot capacity to take a third of; a node counts
    /// as underflowed once less than a third of its payload (header,
    /// descriptors, and key/record bytes together) is actually in use.
    pub fn is_underflowed(&self) -> bool {
        let total = self.payload.len();
        let used = total - self.free_space();
        used * 3 < total
    }

    /// Rebuild the data area, dropping fragmentation left by erased slots.
    pub fn compact(&mut self) {
        let n = self.key_count();
        let mut entries: Vec<(SlotDescriptor, Vec<u8>, Vec<u8>)> = Vec::with_capacity(n);
        for i in 0..n {
            let d = self.descriptor(i);
            entries.push((d, self.key_bytes(i).to_vec(), self.record_bytes(i).to_vec()));
        }
        let mut cursor = self.payload.len();
        for (d, key, record) in entries.iter_mut() {
            let total = key.len() + record.len();
            cursor -= total;
            self.payload[cursor..cursor + key.len()].copy_from_slice(key);
            self.payload[cursor + key.len()..cursor + total].copy_from_slice(record);
            d.data_offset = cursor as u16;
        }
        for (i, (d, _, _)) in entries.into_iter().enumerate() {
            self.set_descriptor(i, d);
        }
        self.set_data_start(cursor);
    }

    /// Binary-search for `key` under `key_type`'s comparator.
    /// `Ok(i)` on an exact match, `Err(i)` for the insertion point.
    pub fn find_slot(&self, key_type: KeyType, key: &[u8]) -> std::result::Result<usize, usize> {
        let n = self.key_count();
        let mut lo = 0usize;
        let mut hi = n;
        while lo < hi {
            let mid = (lo + hi) / 2;
            match compare_keys(key_type, self.key_bytes(mid), key) {
                Ordering::Less => lo = mid + 1,
                Ordering::Greater => hi = mid,
                Ordering::Equal => return Ok(mid),
            }
        }
        Err(lo)
    }

    /// Insert a new slot at position `i`, shifting later descriptors up.
    /// Caller must have already verified `has_room` (after a `compact` if
    /// necessary).
    pub fn insert_slot(
        &mut self,
        i: usize,
        key: &[u8],
        record: &[u8],
        flags: u8,
        dup_count: u8,
    ) -> Result<()> {
        if !self.has_room(key.len(), record.len()) {
            return Err(DbError::IntegrityViolated(
                "insert_slot called without sufficient room".into(),
            ));
        }
        let n = self.key_count();
        // Shift descriptors [i, n) up by one slot.
        for idx in (i..n).rev() {
            let d = self.descriptor(idx);
            self.set_descriptor(idx + 1, d);
        }
        let new_data_start = self.data_start() - (key.len() + record.len());
        self.payload[new_data_start..new_data_start + key.len()].copy_from_slice(key);
        self.payload[new_data_start + key.len()..new_data_start + key.len() + record.len()]
            .copy_from_slice(record);
        self.set_data_start(new_data_start);
        self.set_descriptor(
            i,
            SlotDescriptor {
                flags,
                key_size: key.len() as u16,
                record_size: record.len() as u16,
                dup_count,
                data_offset: new_data_start as u16,
            },
        );
        self.set_key_count(n + 1);
        Ok(())
    }

    /// Remove the slot at `i`. Its data bytes become garbage until the
    /// next `compact()`.
    pub fn remove_slot(&mut self, i: usize) {
        let n = self.key_count();
        for idx in i..n - 1 {
            let d = self.descriptor(idx + 1);
            self.set_descriptor(idx, d);
        }
        self.set_key_count(n - 1);
    }

    /// Replace the record bytes of an existing slot in place when they fit
    /// in the slot's current record footprint; otherwise the caller must
    /// remove and reinsert.
    pub fn try_overwrite_record(&mut self, i: usize, record: &[u8], flags: u8) -> bool {
        let d = self.descriptor(i);
        if record.len() > d.record_size as usize {
            return false;
        }
        let start = d.data_offset as usize + d.key_size as usize;
        self.payload[start..start + record.len()].copy_from_slice(record);
        self.set_descriptor(
            i,
            SlotDescriptor {
                flags,
                record_size: record.len() as u16,
                ..d
            },
        );
        true
    }

    pub fn is_extended_key(&self, i: usize) -> bool {
        self.flags(i) & KEY_FLAG_EXTENDED_KEY != 0
    }

    pub fn is_extended_duplicates(&self, i: usize) -> bool {
        self.flags(i) & KEY_FLAG_EXTENDED_DUPLICATES != 0
    }

    /// Split this (full) node: entries `[mid, n)` move to `right`, which
    /// must already be `NodeView::init`ialized. Returns the pivot key (the
    /// first key moved to `right`) as an owned buffer, plus that key's
    /// `KEY_FLAG_EXTENDED_KEY` bit — callers propagating the pivot up into
    /// a separator need to know whether it's a blob-id placeholder rather
    /// than literal key bytes.
    pub fn split_into(&mut self, right: &mut NodeView, mid: usize) -> (Vec<u8>, u8) {
        let n = self.key_count();
        let pivot = self.key_bytes(mid).to_vec();
        let pivot_flags = self.flags(mid) & KEY_FLAG_EXTENDED_KEY;
        for i in mid..n {
            let flags = self.flags(i);
            let dup = self.dup_count(i);
            let key = self.key_bytes(i).to_vec();
            let record = self.record_bytes(i).to_vec();
            right.insert_slot(i - mid, &key, &record, flags, dup).expect(
                "right sibling sized from the same page must fit the moved entries",
            );
        }
        for i in (mid..n).rev() {
            self.remove_slot(i);
        }
        self.compact();
        (pivot, pivot_flags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blank(size: usize) -> Vec<u8> {
        let mut v = vec![0u8; size];
        NodeView::init(&mut v);
        v
    }

    #[test]
    fn insert_keeps_sorted_order() {
        let mut buf = blank(512);
        let mut node = NodeView::new(&mut buf);
        for k in [b"c".as_slice(), b"a".as_slice(), b"b".as_slice()] {
            let pos = node.find_slot(KeyType::Binary(None), k).unwrap_err();
            node.insert_slot(pos, k, b"v", 0, 1).unwrap();
        }
        assert_eq!(node.key_bytes(0), b"a");
        assert_eq!(node.key_bytes(1), b"b");
        assert_eq!(node.key_bytes(2), b"c");
    }

    #[test]
    fn remove_then_compact_reclaims_space() {
        let mut buf = blank(256);
        let mut node = NodeView::new(&mut buf);
        for i in 0u8..5 {
            let k = [i];
            node.insert_slot(node.key_count(), &k, b"xxxxxxxx", 0, 1).unwrap();
        }
        node.remove_slot(0);
        node.remove_slot(0);
        node.compact();
        assert_eq!(node.key_count(), 3);
        assert_eq!(node.key_bytes(0), &[2]);
    }

    #[test]
    fn split_moves_upper_half() {
        let mut left_buf = blank(256);
        let mut right_buf = blank(256);
        let mut left = NodeView::new(&mut left_buf);
        for i in 0u8..6 {
            left.insert_slot(i as usize, &[i], b"v", 0, 1).unwrap();
        }
        let mut right = NodeView::new(&mut right_buf);
        let (pivot, pivot_flags) = left.split_into(&mut right, 3);
        assert_eq!(pivot, vec![3u8]);
        assert_eq!(pivot_flags, 0);
        assert_eq!(left.key_count(), 3);
        assert_eq!(right.key_count(), 3);
        assert_eq!(right.key_bytes(0), &[3]);
    }
}
