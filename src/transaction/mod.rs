//! Transaction layer (spec.md #4.5).

pub mod manager;
pub mod txn_index;
pub mod types;

pub use manager::TxnManager;
pub use txn_index::TxnIndex;
pub use types::{OperationKind, Transaction, TransactionState, TxnNode, TxnOperation};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::key::KeyType;

    #[test]
    fn second_writer_on_open_key_conflicts() {
        let mut mgr = TxnManager::new(KeyType::Binary(None));
        let t1 = mgr.begin(None);
        let t2 = mgr.begin(None);
        mgr.record_op(t1, b"k", OperationKind::Insert, b"v1".to_vec(), 0, None)
            .unwrap();
        let err = mgr
            .record_op(t2, b"k", OperationKind::Insert, b"v2".to_vec(), 0, None)
            .unwrap_err();
        assert!(matches!(err, crate::error::DbError::TxnConflict));
    }

    #[test]
    fn commit_returns_write_set_and_clears_pending_ops() {
        let mut mgr = TxnManager::new(KeyType::Binary(None));
        let t1 = mgr.begin(None);
        mgr.record_op(t1, b"a", OperationKind::Insert, b"1".to_vec(), 0, None).unwrap();
        mgr.record_op(t1, b"b", OperationKind::Insert, b"2".to_vec(), 0, None).unwrap();
        let ops = mgr.commit(t1).unwrap();
        assert_eq!(ops.len(), 2);
        assert!(mgr.pending_op(b"a", t1).is_none());
    }

    #[test]
    fn abort_drops_pending_ops_and_frees_the_key() {
        let mut mgr = TxnManager::new(KeyType::Binary(None));
        let t1 = mgr.begin(None);
        mgr.record_op(t1, b"k", OperationKind::Insert, b"v".to_vec(), 0, None).unwrap();
        mgr.abort(t1).unwrap();
        let t2 = mgr.begin(None);
        // The key is free again now that t1 aborted.
        mgr.record_op(t2, b"k", OperationKind::Insert, b"v2".to_vec(), 0, None)
            .unwrap();
    }

    #[test]
    fn rewriting_the_same_key_in_one_txn_replaces_the_pending_op() {
        let mut mgr = TxnManager::new(KeyType::Binary(None));
        let t1 = mgr.begin(None);
        mgr.record_op(t1, b"k", OperationKind::Insert, b"first".to_vec(), 0, None).unwrap();
        mgr.record_op(t1, b"k", OperationKind::InsertOverwrite, b"second".to_vec(), 0, None)
            .unwrap();
        let ops = mgr.commit(t1).unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].1.record, b"second");
    }
}
