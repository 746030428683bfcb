//! A single open database: its index layout plus its transaction state
//! (spec.md #4.4, #4.5, #6 "Database").

use crate::blob::BlobManager;
use crate::buffer::changeset::Changeset;
use crate::buffer::page_cache::PageCache;
use crate::config::{DatabaseConfig, DbFlags};
use crate::cursor::Cursor;
use crate::error::{DbError, Result};
use crate::index::btree::InsertMode;
use crate::index::key::FindMode;
use crate::index::LayoutKind;
use crate::transaction::{OperationKind, TxnManager};

/// Tag byte prefixed to every record the `Default` layout stores, so a
/// blob indirection can be told apart from an inline record of the same
/// length as a blob id (spec.md #4.3 "Partial I/O" / #4.4 inline records).
const RECORD_TAG_INLINE: u8 = 0;
const RECORD_TAG_BLOB: u8 = 1;

pub struct Database {
    pub id: u16,
    pub config: DatabaseConfig,
    pub layout: LayoutKind,
    pub txn_manager: TxnManager,
    blob_manager: BlobManager,
    max_key_size: usize,
    /// Records no longer than this stay inline in the leaf slot; longer
    /// ones move to a blob (spec.md #3 "Record", default 8 bytes).
    record_inline_threshold: usize,
}

impl Database {
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        id: u16,
        cache: &mut PageCache,
        changeset: &mut Changeset,
        config: DatabaseConfig,
        extended_key_threshold: usize,
        max_key_size: usize,
        duplicate_threshold: u8,
        record_inline_threshold: usize,
    ) -> Result<Self> {
        let layout = LayoutKind::create(cache, changeset, &config, duplicate_threshold, extended_key_threshold)?;
        let txn_manager = TxnManager::new(config.key_type);
        let blob_manager = BlobManager::new(cache.page_size());
        Ok(Self {
            id,
            config,
            layout,
            txn_manager,
            blob_manager,
            max_key_size,
            record_inline_threshold,
        })
    }

    /// Reconstruct an already-existing database from its header descriptor
    /// (spec.md #4.7, `Environment::open`) rather than allocating a fresh
    /// root page.
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        id: u16,
        root: crate::storage::page::PageId,
        cache: &PageCache,
        config: DatabaseConfig,
        extended_key_threshold: usize,
        max_key_size: usize,
        duplicate_threshold: u8,
        record_inline_threshold: usize,
    ) -> Self {
        let layout = LayoutKind::attach(root, &config, duplicate_threshold, extended_key_threshold);
        let txn_manager = TxnManager::new(config.key_type);
        let blob_manager = BlobManager::new(cache.page_size());
        Self {
            id,
            config,
            layout,
            txn_manager,
            blob_manager,
            max_key_size,
            record_inline_threshold,
        }
    }

    /// The root page of this database's index, persisted in the
    /// environment header's descriptor array (spec.md #4.7).
    pub fn root_page(&self) -> crate::storage::page::PageId {
        match &self.layout {
            LayoutKind::Default(b) => b.root,
            LayoutKind::Pax(p) => p.root,
            LayoutKind::Bitmap(b) => b.root,
        }
    }

    fn validate_key(&self, key: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(DbError::InvalidKeySize(0));
        }
        match self.config.key_type.fixed_size() {
            Some(fixed) => {
                if key.len() != fixed {
                    return Err(DbError::InvalidKeySize(key.len()));
                }
            }
            // Unbounded binary keys (spec.md #6 "key_size = unlimited
            // sentinel") are still capped by the environment-wide
            // `max_key_size`. The btree does externalize oversized keys to
            // a blob past `extended_key_threshold` (see `store_key` /
            // `resolve_stored` in `index::btree`), but that threshold is
            // itself bounded: a key too large to ever fit in a freshly
            // split leaf, even with its stored form reduced to a blob
            // pointer, would recurse `split_and_retry` indefinitely. This
            // cap exists to fail such a key cleanly instead.
            None => {
                if key.len() > self.max_key_size {
                    return Err(DbError::InvalidKeySize(key.len()));
                }
            }
        }
        Ok(())
    }

    /// Prefix a record with its storage tag, moving it out of line via the
    /// blob manager first when it's too large to keep inline. Only the
    /// `Default` layout's variable-size records are ever externalized —
    /// `Pax`'s fixed record width has no notion of "too large".
    fn maybe_externalize(
        &self,
        cache: &mut PageCache,
        changeset: &mut Changeset,
        record: &[u8],
    ) -> Result<Vec<u8>> {
        if record.len() <= self.record_inline_threshold {
            let mut out = Vec::with_capacity(1 + record.len());
            out.push(RECORD_TAG_INLINE);
            out.extend_from_slice(record);
            return Ok(out);
        }
        let blob_id = self.blob_manager.allocate(cache, changeset, record)?;
        let mut out = Vec::with_capacity(9);
        out.push(RECORD_TAG_BLOB);
        out.extend_from_slice(&blob_id.to_le_bytes());
        Ok(out)
    }

    /// Resolve a stored `Default`-layout record, following the blob
    /// indirection when the record was externalized.
    fn resolve_record(&self, cache: &mut PageCache, stored: &[u8]) -> Result<Vec<u8>> {
        match stored.first() {
            Some(&RECORD_TAG_BLOB) => {
                let blob_id = u64::from_le_bytes(stored[1..9].try_into().map_err(|_| {
                    DbError::IntegrityViolated("blob-tagged record missing its 8-byte id".into())
                })?);
                self.blob_manager.read(cache, blob_id)
            }
            _ => Ok(stored.get(1..).unwrap_or_default().to_vec()),
        }
    }

    /// Insert a key/record pair directly against the index (outside a
    /// transaction, or as the final apply step of a transaction commit).
    pub fn insert_direct(
        &mut self,
        cache: &mut PageCache,
        changeset: &mut Changeset,
        key: &[u8],
        record: &[u8],
        mode: InsertMode,
    ) -> Result<()> {
        self.validate_key(key)?;
        // Computed before matching on `self.layout` (borrowed mutably
        // below): `maybe_externalize` needs `&self.blob_manager`, which
        // can't overlap a `&mut self.layout` borrow through a method call.
        let default_stored = if matches!(self.layout, LayoutKind::Default(_)) {
            Some(self.maybe_externalize(cache, changeset, record)?)
        } else {
            None
        };
        match &mut self.layout {
            LayoutKind::Default(btree) => {
                let stored = default_stored.expect("computed above for the Default layout");
                btree.insert(cache, changeset, key, &stored, mode)
            }
            LayoutKind::Pax(pax) => pax.insert(cache, changeset, key, record, mode != InsertMode::Unique),
            LayoutKind::Bitmap(bitmap) => {
                let record_number = u64::from_le_bytes(
                    key[..8].try_into().map_err(|_| DbError::InvalidKeySize(key.len()))?,
                );
                bitmap.insert(cache, changeset, record_number)
            }
        }
    }

    pub fn find_direct(&self, cache: &mut PageCache, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.validate_key(key)?;
        match &self.layout {
            LayoutKind::Default(btree) => {
                let Some(pos) = btree.find(cache, key, FindMode::Exact)? else {
                    return Ok(None);
                };
                enum Slot {
                    Single(Vec<u8>),
                    InlineDupList(Vec<u8>),
                    ExtendedTableBlob(u64),
                }
                let slot = {
                    let page = cache.fetch(pos.page_id)?;
                    let node = crate::index::node::NodeView::new(page.payload_mut());
                    if node.is_extended_duplicates(pos.slot) {
                        let blob_id = u64::from_le_bytes(node.record_bytes(pos.slot).try_into().map_err(|_| {
                            DbError::IntegrityViolated("extended duplicate slot missing blob id".into())
                        })?);
                        Slot::ExtendedTableBlob(blob_id)
                    } else if node.dup_count(pos.slot) > 1 {
                        Slot::InlineDupList(node.record_bytes(pos.slot).to_vec())
                    } else {
                        Slot::Single(node.record_bytes(pos.slot).to_vec())
                    }
                };
                let stored = match slot {
                    Slot::Single(bytes) => bytes,
                    Slot::InlineDupList(bytes) => {
                        let list: Vec<Vec<u8>> =
                            bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                                .map_err(|e| DbError::Serialization(e.to_string()))?
                                .0;
                        list.into_iter().next().unwrap_or_default()
                    }
                    Slot::ExtendedTableBlob(blob_id) => {
                        let bytes = self.blob_manager.read(cache, blob_id)?;
                        let list: Vec<Vec<u8>> =
                            bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                                .map_err(|e| DbError::Serialization(e.to_string()))?
                                .0;
                        list.into_iter().next().unwrap_or_default()
                    }
                };
                Ok(Some(self.resolve_record(cache, &stored)?))
            }
            LayoutKind::Pax(pax) => {
                let Some((page_id, i)) = pax.find(cache, key)? else {
                    return Ok(None);
                };
                let page = cache.fetch(page_id)?;
                let view = crate::index::pax::PaxNodeView::new(page.payload_mut(), pax.key_size, pax.record_size);
                Ok(Some(view.record(i).to_vec()))
            }
            LayoutKind::Bitmap(bitmap) => {
                let record_number = u64::from_le_bytes(key[..8].try_into().map_err(|_| DbError::InvalidKeySize(key.len()))?);
                Ok(if bitmap.contains(cache, record_number)? {
                    Some(Vec::new())
                } else {
                    None
                })
            }
        }
    }

    /// Number of records stored under `key` (spec.md #8 scenario 4
    /// "record_count"): 0 if absent, 1 for a plain key, the duplicate
    /// count (inline or promoted to an extended table) otherwise. Only
    /// meaningful for the `Default` layout, which is the only one with a
    /// notion of duplicates.
    pub fn record_count(&self, cache: &mut PageCache, key: &[u8]) -> Result<u32> {
        self.validate_key(key)?;
        match &self.layout {
            LayoutKind::Default(btree) => btree.record_count(cache, key),
            LayoutKind::Pax(pax) => Ok(if pax.find(cache, key)?.is_some() { 1 } else { 0 }),
            LayoutKind::Bitmap(bitmap) => {
                let record_number = u64::from_le_bytes(key[..8].try_into().map_err(|_| DbError::InvalidKeySize(key.len()))?);
                Ok(if bitmap.contains(cache, record_number)? { 1 } else { 0 })
            }
        }
    }

    pub fn erase_direct(&mut self, cache: &mut PageCache, changeset: &mut Changeset, key: &[u8]) -> Result<bool> {
        self.validate_key(key)?;
        match &mut self.layout {
            LayoutKind::Default(btree) => btree.erase(cache, changeset, key, None),
            LayoutKind::Pax(pax) => pax.erase(cache, changeset, key),
            LayoutKind::Bitmap(bitmap) => {
                let record_number = u64::from_le_bytes(key[..8].try_into().map_err(|_| DbError::InvalidKeySize(key.len()))?);
                bitmap.erase(cache, changeset, record_number)
            }
        }
    }

    /// Insert/find/erase within a transaction: the write is only recorded
    /// in the transaction's pending-op set, not applied to the tree until
    /// commit (spec.md #4.5).
    pub fn insert_txn(&mut self, txn_id: u64, key: &[u8], record: Vec<u8>, overwrite: bool) -> Result<()> {
        self.validate_key(key)?;
        let kind = if overwrite {
            OperationKind::InsertOverwrite
        } else {
            OperationKind::Insert
        };
        self.txn_manager.record_op(txn_id, key, kind, record, 0, None)
    }

    pub fn erase_txn(&mut self, txn_id: u64, key: &[u8]) -> Result<()> {
        self.validate_key(key)?;
        self.txn_manager
            .record_op(txn_id, key, OperationKind::Erase, Vec::new(), 0, None)
    }

    /// Find, honoring the transaction's own uncommitted writes over the
    /// tree's committed state (spec.md #4.5 "merge-on-read").
    pub fn find_txn(&self, cache: &mut PageCache, txn_id: u64, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if let Some(op) = self.txn_manager.pending_op(key, txn_id) {
            return Ok(match op.kind {
                OperationKind::Erase | OperationKind::Nop => None,
                _ => Some(op.record.clone()),
            });
        }
        self.find_direct(cache, key)
    }

    pub fn cursor(&self, txn_id: Option<u64>) -> Cursor {
        Cursor::new(txn_id)
    }

    /// Apply a committed transaction's write set to the index, in the
    /// order `TxnManager::commit` returned them (spec.md #4.5). Called by
    /// the owning environment once the commit's ops are journaled.
    pub fn apply_committed_ops(
        &mut self,
        cache: &mut PageCache,
        changeset: &mut Changeset,
        ops: Vec<(Vec<u8>, crate::transaction::TxnOperation)>,
    ) -> Result<()> {
        for (key, op) in ops {
            match op.kind {
                OperationKind::Insert => {
                    self.insert_direct(cache, changeset, &key, &op.record, InsertMode::Unique)?;
                }
                OperationKind::InsertOverwrite => {
                    self.insert_direct(cache, changeset, &key, &op.record, InsertMode::Overwrite)?;
                }
                OperationKind::InsertDuplicate => {
                    self.insert_direct(cache, changeset, &key, &op.record, InsertMode::Duplicate)?;
                }
                OperationKind::Erase => {
                    self.erase_direct(cache, changeset, &key)?;
                }
                OperationKind::Nop => {}
            }
        }
        Ok(())
    }

    pub fn integrity_check(&self, cache: &mut PageCache) -> Result<()> {
        self.layout.integrity_check(cache)
    }

    pub fn has_duplicate_support(&self) -> bool {
        self.config.flags.contains(DbFlags::ENABLE_DUPLICATES) && matches!(self.layout, LayoutKind::Default(_))
    }
}
