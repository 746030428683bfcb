//! Transaction lifecycle and conflict detection (spec.md #4.5).
//!
//! The single environment-wide mutex (spec.md #5) means two transactions
//! never literally race; "conflict" here means two transactions were left
//! open at the same time and both tried to write the same key. Detection
//! is eager: the second writer is rejected the moment it records its op,
//! rather than deferred to commit — simpler to reason about and to test,
//! and no less correct under a single-mutex model where nothing can
//! change between a transaction's last write and its commit.
//!
//! Once a transaction has been refused a key this way, it must keep
//! refusing that key for the rest of its life, even after the transaction
//! it collided with commits and disappears: `TxnIndex` keeps a commit
//! tombstone per key for exactly that purpose, so the conflict doesn't
//! silently lapse the instant the other side finishes.

use crate::error::{DbError, Result};
use crate::index::key::KeyType;
use crate::transaction::txn_index::TxnIndex;
use crate::transaction::types::{OperationKind, Transaction, TransactionState, TxnOperation};
use std::collections::HashMap;

pub struct TxnManager {
    key_type: KeyType,
    next_txn_id: u64,
    next_seq: u64,
    transactions: HashMap<u64, Transaction>,
    index: TxnIndex,
}

impl TxnManager {
    /// One `TxnManager` per open database, scoped to that database's key
    /// comparator — pending-op lookups must use the same ordering the
    /// underlying index does.
    pub fn new(key_type: KeyType) -> Self {
        Self {
            key_type,
            next_txn_id: 1,
            next_seq: 0,
            transactions: HashMap::new(),
            index: TxnIndex::new(),
        }
    }

    pub fn begin(&mut self, name: Option<String>) -> u64 {
        let id = self.next_txn_id;
        self.next_txn_id += 1;
        self.begin_with_id(id, name);
        id
    }

    /// Register an already-allocated transaction id as open here. Used by
    /// `Environment`, which allocates one id shared across every database
    /// a transaction touches rather than letting each database's
    /// `TxnManager` number transactions independently.
    pub fn begin_with_id(&mut self, id: u64, name: Option<String>) {
        self.next_seq += 1;
        self.next_txn_id = self.next_txn_id.max(id + 1);
        self.transactions.insert(
            id,
            Transaction {
                id,
                name,
                state: TransactionState::Open,
                begin_seq: self.next_seq,
                write_set: Vec::new(),
            },
        );
    }

    pub fn is_open(&self, txn_id: u64) -> bool {
        matches!(
            self.transactions.get(&txn_id),
            Some(Transaction { state: TransactionState::Open, .. })
        )
    }

    fn require_open(&self, txn_id: u64) -> Result<&Transaction> {
        match self.transactions.get(&txn_id) {
            Some(t) if t.state == TransactionState::Open => Ok(t),
            Some(_) => Err(DbError::TxnStillOpen),
            None => Err(DbError::InvalidArgument(format!("unknown transaction {txn_id}"))),
        }
    }

    /// Record a pending write, failing with `TxnConflict` if another open
    /// transaction already holds a pending write on the same key.
    pub fn record_op(
        &mut self,
        txn_id: u64,
        key: &[u8],
        kind: OperationKind,
        record: Vec<u8>,
        flags: u32,
        duplicate_index: Option<u32>,
    ) -> Result<()> {
        let begin_seq = self.require_open(txn_id)?.begin_seq;
        if self.index.has_other_writer(self.key_type, key, txn_id, begin_seq) {
            return Err(DbError::TxnConflict);
        }
        self.index.set_op(
            self.key_type,
            key,
            txn_id,
            TxnOperation {
                kind,
                record,
                flags,
                duplicate_index,
            },
        );
        let txn = self.transactions.get_mut(&txn_id).expect("checked by require_open");
        if !txn.write_set.iter().any(|k| k.as_slice() == key) {
            txn.write_set.push(key.to_vec());
        }
        Ok(())
    }

    pub fn pending_op(&self, key: &[u8], txn_id: u64) -> Option<&TxnOperation> {
        self.index.pending_op(self.key_type, key, txn_id)
    }

    /// Commit a transaction, returning its ops in write order (spec.md
    /// #4.5: later writes to the same key within one transaction already
    /// collapsed to one `TxnOperation` in `TxnIndex::set_op`).
    pub fn commit(&mut self, txn_id: u64) -> Result<Vec<(Vec<u8>, TxnOperation)>> {
        let txn = self.require_open(txn_id)?;
        let write_set = txn.write_set.clone();

        let mut ops = Vec::with_capacity(write_set.len());
        for key in &write_set {
            if let Some(op) = self.index.pending_op(self.key_type, key, txn_id) {
                ops.push((key.clone(), op.clone()));
            }
        }

        self.next_seq += 1;
        let commit_seq = self.next_seq;
        for key in &write_set {
            self.index.note_commit(key, commit_seq);
        }

        self.index.clear_txn(txn_id);
        self.transactions.remove(&txn_id);

        let min_open_begin_seq = self.transactions.values().map(|t| t.begin_seq).min().unwrap_or(u64::MAX);
        self.index.forget_commits_at_or_before(min_open_begin_seq);
        Ok(ops)
    }

    pub fn abort(&mut self, txn_id: u64) -> Result<()> {
        self.require_open(txn_id)?;
        self.index.clear_txn(txn_id);
        self.transactions.remove(&txn_id);
        Ok(())
    }
}
