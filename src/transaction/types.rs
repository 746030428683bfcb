//! Transaction-layer value types (spec.md #4.5 "TxnOperation / TxnNode").

/// What a pending operation will do to the tree when its transaction
/// commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Insert,
    InsertOverwrite,
    InsertDuplicate,
    Erase,
    Nop,
}

/// One pending write, scoped to a single (transaction, key) pair. A
/// transaction holds at most one `TxnOperation` per key: writing the same
/// key twice in one transaction replaces the pending op rather than
/// stacking a second one (spec.md #4.5 "latest write wins within a
/// transaction").
#[derive(Debug, Clone)]
pub struct TxnOperation {
    pub kind: OperationKind,
    pub record: Vec<u8>,
    pub flags: u32,
    pub duplicate_index: Option<u32>,
}

/// All pending operations against one key, one per transaction currently
/// holding a write on it.
#[derive(Debug, Clone, Default)]
pub struct TxnNode {
    pub key: Vec<u8>,
    pub by_txn: Vec<(u64, TxnOperation)>,
}

impl TxnNode {
    pub fn new(key: Vec<u8>) -> Self {
        Self {
            key,
            by_txn: Vec::new(),
        }
    }

    pub fn op_for(&self, txn_id: u64) -> Option<&TxnOperation> {
        self.by_txn.iter().find(|(id, _)| *id == txn_id).map(|(_, op)| op)
    }

    pub fn set_op(&mut self, txn_id: u64, op: TxnOperation) {
        if let Some(slot) = self.by_txn.iter_mut().find(|(id, _)| *id == txn_id) {
            slot.1 = op;
        } else {
            self.by_txn.push((txn_id, op));
        }
    }

    pub fn remove_txn(&mut self, txn_id: u64) {
        self.by_txn.retain(|(id, _)| *id != txn_id);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Open,
    Committed,
    Aborted,
}

/// A transaction's bookkeeping: identity plus the set of keys it has
/// written, used for commit-time conflict detection (spec.md #4.5).
#[derive(Debug, Clone)]
pub struct Transaction {
    pub id: u64,
    pub name: Option<String>,
    pub state: TransactionState,
    pub begin_seq: u64,
    pub write_set: Vec<Vec<u8>>,
}
