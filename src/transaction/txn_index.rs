//! In-memory arena of per-key pending operations (spec.md #4.5 "TxnIndex").
//!
//! A slotted `Vec<TxnNode>` kept sorted by key under the database's
//! comparator, rather than the teacher's `Rc<RefCell<_>>` pointer graph
//! (spec.md #9 "Pointer graphs") — index-based and trivially `Send`.

use crate::index::key::{compare_keys, KeyType};
use crate::transaction::types::{TxnNode, TxnOperation};
use std::cmp::Ordering;

#[derive(Default)]
pub struct TxnIndex {
    nodes: Vec<TxnNode>,
    /// Commit sequence number of the most recent transaction that wrote
    /// each key, kept after the writing transaction's node is pruned by
    /// `clear_txn` so a transaction that began before that commit keeps
    /// seeing the conflict for the rest of its own lifetime (spec.md #4.5
    /// scenario 5: "B still sees conflict ... until B completes"), even
    /// though the committing transaction itself is long gone.
    committed: std::collections::HashMap<Vec<u8>, u64>,
}

impl TxnIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn find_slot(&self, key_type: KeyType, key: &[u8]) -> std::result::Result<usize, usize> {
        let mut lo = 0usize;
        let mut hi = self.nodes.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            match compare_keys(key_type, &self.nodes[mid].key, key) {
                Ordering::Less => lo = mid + 1,
                Ordering::Greater => hi = mid,
                Ordering::Equal => return Ok(mid),
            }
        }
        Err(lo)
    }

    pub fn pending_op(&self, key_type: KeyType, key: &[u8], txn_id: u64) -> Option<&TxnOperation> {
        let idx = self.find_slot(key_type, key).ok()?;
        self.nodes[idx].op_for(txn_id)
    }

    /// Record (or replace) `txn_id`'s pending operation on `key`.
    pub fn set_op(&mut self, key_type: KeyType, key: &[u8], txn_id: u64, op: TxnOperation) {
        match self.find_slot(key_type, key) {
            Ok(idx) => self.nodes[idx].set_op(txn_id, op),
            Err(pos) => {
                let mut node = TxnNode::new(key.to_vec());
                node.set_op(txn_id, op);
                self.nodes.insert(pos, node);
            }
        }
    }

    /// Drop every pending op belonging to `txn_id` (called on commit and
    /// abort), pruning nodes left with no remaining ops.
    pub fn clear_txn(&mut self, txn_id: u64) {
        for node in &mut self.nodes {
            node.remove_txn(txn_id);
        }
        self.nodes.retain(|n| !n.by_txn.is_empty());
    }

    /// Whether another transaction's write on `key` must block `txn_id`
    /// with `begin_seq`: either another currently-open transaction already
    /// holds a pending write on it, or some transaction committed a write
    /// to it after `txn_id` began (used to reject a second writer before
    /// it even reaches commit-time conflict detection, spec.md #4.5).
    pub fn has_other_writer(&self, key_type: KeyType, key: &[u8], txn_id: u64, begin_seq: u64) -> bool {
        let pending = match self.find_slot(key_type, key) {
            Ok(idx) => self.nodes[idx].by_txn.iter().any(|(id, _)| *id != txn_id),
            Err(_) => false,
        };
        pending || self.committed_after(key, begin_seq)
    }

    fn committed_after(&self, key: &[u8], begin_seq: u64) -> bool {
        self.committed.get(key).is_some_and(|seq| *seq > begin_seq)
    }

    /// Record that `key` was written by a transaction that committed at
    /// `commit_seq`, regardless of whether that transaction's `TxnNode`
    /// survives the `clear_txn` that follows.
    pub fn note_commit(&mut self, key: &[u8], commit_seq: u64) {
        self.committed
            .entry(key.to_vec())
            .and_modify(|seq| *seq = (*seq).max(commit_seq))
            .or_insert(commit_seq);
    }

    /// Drop commit tombstones that can no longer produce a conflict: none
    /// of the transactions still open began before `min_open_begin_seq`
    /// would ever see `seq > their begin_seq` for an entry at or below it.
    /// Pass `u64::MAX` when no transaction is open, dropping everything.
    pub fn forget_commits_at_or_before(&mut self, min_open_begin_seq: u64) {
        self.committed.retain(|_, seq| *seq > min_open_begin_seq);
    }
}
