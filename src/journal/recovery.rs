//! Crash recovery (spec.md #4.6).
//!
//! `recover` restores durable page images and hands back the list of
//! already-committed operations that must be replayed through the normal
//! insert/erase paths — it does not call into `BtreeIndex`/`Database`
//! itself, to avoid a dependency from the journal back up to the index and
//! transaction layers. `Environment::open` drives the replay.

use crate::buffer::page_cache::PageCache;
use crate::journal::wal::{Journal, JournalEntry};
use std::collections::{HashMap, HashSet};

/// One previously-committed mutation that must be reapplied because its
/// LSN is newer than the last durable changeset.
#[derive(Debug, Clone)]
pub enum ReplayOp {
    Insert {
        lsn: u64,
        db_id: u16,
        key: Vec<u8>,
        record: Vec<u8>,
        flags: u32,
        partial: Option<(u32, u32)>,
    },
    Erase {
        lsn: u64,
        db_id: u16,
        key: Vec<u8>,
        duplicate_index: Option<u32>,
    },
}

impl ReplayOp {
    pub fn lsn(&self) -> u64 {
        match self {
            ReplayOp::Insert { lsn, .. } => *lsn,
            ReplayOp::Erase { lsn, .. } => *lsn,
        }
    }
}

#[derive(Debug, Default)]
pub struct RecoveryOutcome {
    /// Mutations to replay, in ascending LSN order.
    pub replay: Vec<ReplayOp>,
    /// Highest LSN observed anywhere in the journal; the environment
    /// should resume LSN allocation from `max_lsn + 1`.
    pub max_lsn: u64,
}

/// Scan both journal files, restore every durable changeset's page images,
/// and compute the set of committed-but-undurable operations to replay.
pub fn recover(cache: &mut PageCache, journal: &mut Journal) -> crate::Result<RecoveryOutcome> {
    let mut entries = journal.read_all()?;
    entries.sort_by_key(|e| e.lsn());

    let device_size = cache.device().size();
    let lsn_durable = entries
        .iter()
        .filter_map(|e| match e {
            JournalEntry::Changeset { lsn, pages } => {
                // A torn changeset references a page outside the device;
                // treat it as if it never existed (spec.md #4.6).
                if pages.iter().all(|(id, _)| *id < device_size || device_size == 0) {
                    Some(*lsn)
                } else {
                    None
                }
            }
            _ => None,
        })
        .max()
        .unwrap_or(0);

    for entry in &entries {
        if let JournalEntry::Changeset { lsn, pages } = entry {
            if *lsn > lsn_durable {
                continue;
            }
            for (page_id, bytes) in pages {
                cache.evict_without_writeback(*page_id);
                cache.device_mut().write(*page_id, bytes)?;
            }
        }
    }
    cache.device_mut().flush()?;

    let mut committed: HashSet<u64> = HashSet::new();
    let mut aborted: HashSet<u64> = HashSet::new();
    for entry in &entries {
        match entry {
            JournalEntry::TxnCommit { txn_id, .. } => {
                committed.insert(*txn_id);
            }
            JournalEntry::TxnAbort { txn_id, .. } => {
                aborted.insert(*txn_id);
            }
            _ => {}
        }
    }
    // A txn with neither a commit nor an abort record is a crash-time
    // in-flight transaction: treat it as aborted (spec.md #4.6 step 3).
    let mut began: HashMap<u64, ()> = HashMap::new();
    for entry in &entries {
        if let JournalEntry::TxnBegin { txn_id, .. } = entry {
            began.insert(*txn_id, ());
        }
    }
    for txn_id in began.keys() {
        if !committed.contains(txn_id) && !aborted.contains(txn_id) {
            aborted.insert(*txn_id);
        }
    }

    let mut replay = Vec::new();
    for entry in &entries {
        match entry {
            JournalEntry::Insert {
                lsn,
                txn_id,
                db_id,
                key,
                record,
                flags,
                partial,
            } if *lsn > lsn_durable && committed.contains(txn_id) => {
                replay.push(ReplayOp::Insert {
                    lsn: *lsn,
                    db_id: *db_id,
                    key: key.clone(),
                    record: record.clone(),
                    flags: *flags,
                    partial: *partial,
                });
            }
            JournalEntry::Erase {
                lsn,
                txn_id,
                db_id,
                key,
                duplicate_index,
                ..
            } if *lsn > lsn_durable && committed.contains(txn_id) => {
                replay.push(ReplayOp::Erase {
                    lsn: *lsn,
                    db_id: *db_id,
                    key: key.clone(),
                    duplicate_index: *duplicate_index,
                });
            }
            _ => {}
        }
    }
    replay.sort_by_key(|op| op.lsn());

    let max_lsn = entries.iter().map(|e| e.lsn()).max().unwrap_or(0);

    Ok(RecoveryOutcome { replay, max_lsn })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::device::MemoryDevice;
    use crate::storage::page::PageType;
    use tempfile::tempdir;

    #[test]
    fn replays_committed_ops_past_last_durable_changeset() {
        let dir = tempdir().unwrap();
        let mut journal = Journal::create(dir.path(), 1_000_000).unwrap();
        journal.append_begin(1, 1, 0, None).unwrap();
        journal
            .append_insert(2, 1, 1, b"a".to_vec(), b"1".to_vec(), 0, None)
            .unwrap();
        journal.append_changeset(2, &[]).unwrap();
        journal
            .append_insert(3, 1, 1, b"b".to_vec(), b"2".to_vec(), 0, None)
            .unwrap();
        journal.append_commit(4, 1).unwrap();
        journal.flush().unwrap();

        let mut cache = PageCache::new(Box::new(MemoryDevice::new(0)), 256, 4);
        let _ = cache.allocate_page(PageType::BtreeLeaf);
        let outcome = recover(&mut cache, &mut journal).unwrap();

        assert_eq!(outcome.replay.len(), 1);
        match &outcome.replay[0] {
            ReplayOp::Insert { key, .. } => assert_eq!(key, b"b"),
            _ => panic!("expected insert"),
        }
        assert_eq!(outcome.max_lsn, 4);
    }

    #[test]
    fn uncommitted_txn_is_not_replayed() {
        let dir = tempdir().unwrap();
        let mut journal = Journal::create(dir.path(), 1_000_000).unwrap();
        journal.append_begin(1, 2, 0, None).unwrap();
        journal
            .append_insert(2, 2, 1, b"x".to_vec(), b"1".to_vec(), 0, None)
            .unwrap();
        journal.flush().unwrap();

        let mut cache = PageCache::new(Box::new(MemoryDevice::new(0)), 256, 4);
        let outcome = recover(&mut cache, &mut journal).unwrap();
        assert!(outcome.replay.is_empty());
    }
}
