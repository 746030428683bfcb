//! Environment: owns the `Device`/`PageCache`/`Journal` and every open
//! `Database`, and is the sole entry point for mutating API calls
//! (spec.md #4.7, #5).
//!
//! Every public method here takes `&mut self` and is called under the
//! single environment mutex the embedder (not this crate — see
//! `crate::config` and spec.md #5) is expected to hold; there is no
//! internal locking, matching the "single environment-wide mutex" model
//! instead of re-deriving it with a `parking_lot::Mutex` field that every
//! caller would immediately have to lock anyway.

pub mod header;

use crate::buffer::changeset::{Changeset, PageBucket};
use crate::buffer::page_cache::PageCache;
use crate::config::{DatabaseConfig, DbFlags, EnvFlags, EnvironmentConfig};
use crate::database::Database;
use crate::error::{DbError, Result};
use crate::index::btree::InsertMode;
use crate::journal::recovery::{recover, ReplayOp};
use crate::journal::wal::Journal;
use crate::storage::device::{Device, FileDevice, MemoryDevice};
use crate::storage::page::PageType;
use crate::transaction::OperationKind;
use header::{DatabaseDescriptor, EnvironmentHeader};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

/// Page 0 is reserved for the environment header (spec.md #3 invariants).
const HEADER_PAGE_ID: crate::storage::page::PageId = 0;

/// Bookkeeping for one open transaction, at the environment level rather
/// than per-database: a transaction may touch several databases under one
/// id (spec.md #4.5, #9 "Pointer graphs" — allocate the id once, share it).
struct TxnMeta {
    name: Option<String>,
    /// Databases this transaction has written to, so commit/abort know
    /// which `Database::txn_manager` instances to finalize.
    touched: HashSet<u16>,
    /// A `TEMPORARY` transaction wraps a single non-transactional API
    /// call (spec.md #4.5) and is committed immediately by the same
    /// method that began it.
    temporary: bool,
}

/// What a scan visitor returns to continue or stop a cooperative walk
/// (spec.md #5 "Cancellation": "the visitor may request termination by
/// returning a sentinel").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanControl {
    Continue,
    Stop,
}

pub struct Environment {
    config: EnvironmentConfig,
    cache: PageCache,
    /// `None` for `in-memory` environments: there is nothing to
    /// crash-recover, so the changeset flush path skips journaling
    /// entirely (spec.md #6 Environment flags).
    journal: Option<Journal>,
    header: EnvironmentHeader,
    databases: HashMap<u16, Database>,
    transactions: HashMap<u64, TxnMeta>,
    next_txn_id: u64,
    next_lsn: u64,
    last_error: Option<String>,
    in_error_state: bool,
}

impl Environment {
    /// Create a brand-new environment at `path` (ignored for
    /// `EnvFlags::IN_MEMORY`).
    pub fn create(path: impl AsRef<Path>, config: EnvironmentConfig) -> Result<Self> {
        let device: Box<dyn Device> = if config.flags.contains(EnvFlags::IN_MEMORY) {
            Box::new(MemoryDevice::new(0))
        } else {
            Box::new(FileDevice::create(
                path.as_ref(),
                0,
                config.flags.contains(EnvFlags::ENABLE_FSYNC),
            )?)
        };
        let capacity = (config.cache_limit_bytes / config.page_size).max(1);
        let mut cache = PageCache::new(device, config.page_size, capacity);

        let header_page = cache.allocate_page(PageType::EnvironmentHeader)?;
        debug_assert_eq!(header_page, HEADER_PAGE_ID, "header must be the first page allocated");

        let journal = if config.flags.contains(EnvFlags::IN_MEMORY) {
            None
        } else {
            Some(Journal::create(&config.journal_dir, config.journal_segment_size)?)
        };

        let mut env = Self {
            header: EnvironmentHeader::new(config.page_size as u32, config.max_databases, config.flags),
            config,
            cache,
            journal,
            databases: HashMap::new(),
            transactions: HashMap::new(),
            next_txn_id: 1,
            next_lsn: 1,
            last_error: None,
            in_error_state: false,
        };
        env.write_header_now()?;
        tracing::info!(page_size = env.config.page_size, "environment created");
        Ok(env)
    }

    /// Open an existing environment, replaying the journal first if the
    /// header's clean-shutdown bit is unset (spec.md #4.6 "Recovery").
    pub fn open(path: impl AsRef<Path>, config: EnvironmentConfig) -> Result<Self> {
        if config.flags.contains(EnvFlags::IN_MEMORY) {
            // Nothing durable to reopen; an in-memory environment's
            // lifetime is exactly one `create`.
            return Self::create(path, config);
        }
        let device = FileDevice::open(path.as_ref(), config.flags.contains(EnvFlags::ENABLE_FSYNC))?;
        let page_size = config.page_size;
        let capacity = (config.cache_limit_bytes / page_size).max(1);
        let mut cache = PageCache::new(Box::new(device), page_size, capacity);

        let header = {
            let page = cache.fetch(HEADER_PAGE_ID)?;
            EnvironmentHeader::decode(page.payload())?
        };
        if header.page_size as usize != page_size {
            return Err(DbError::InvalidArgument(format!(
                "page size mismatch: header has {}, config asked for {}",
                header.page_size, page_size
            )));
        }

        let mut journal = Some(Journal::open(&config.journal_dir, config.journal_segment_size)?);
        let needs_recovery = !header.clean_shutdown;
        let mut max_recovered_lsn = header.last_lsn;
        let mut pending_replay = Vec::new();

        if needs_recovery {
            if !config.flags.contains(EnvFlags::AUTO_RECOVERY) {
                return Err(DbError::NeedRecovery);
            }
            tracing::warn!("environment was not cleanly shut down, running recovery");
            let outcome = recover(&mut cache, journal.as_mut().expect("journal opened above"))?;
            tracing::info!(
                replayed = outcome.replay.len(),
                max_lsn = outcome.max_lsn,
                "recovery scan complete"
            );
            max_recovered_lsn = max_recovered_lsn.max(outcome.max_lsn);
            pending_replay = outcome.replay;
        }

        let mut databases = HashMap::new();
        for descriptor in &header.databases {
            let db = Database::open(
                descriptor.db_id,
                descriptor.root,
                &cache,
                descriptor.config.clone(),
                config.extended_key_threshold,
                config.max_key_size,
                config.duplicate_threshold.min(u8::MAX as usize) as u8,
                config.record_inline_threshold,
            );
            databases.insert(descriptor.db_id, db);
        }

        let mut env = Self {
            header,
            config,
            cache,
            journal,
            databases,
            transactions: HashMap::new(),
            next_txn_id: 1,
            next_lsn: max_recovered_lsn + 1,
            last_error: None,
            in_error_state: false,
        };

        if !pending_replay.is_empty() {
            env.replay_committed_ops(pending_replay)?;
        }

        env.header.clean_shutdown = false;
        env.write_header_now()?;
        tracing::info!(databases = env.databases.len(), "environment opened");
        Ok(env)
    }

    /// Apply operations committed-but-not-durable-as-of-crash, in LSN
    /// order, each through the normal insert/erase path flushed
    /// synchronously (spec.md #4.6 step 4).
    fn replay_committed_ops(&mut self, ops: Vec<ReplayOp>) -> Result<()> {
        for op in ops {
            let mut changeset = Changeset::new();
            let applied = match op {
                ReplayOp::Insert {
                    db_id, key, record, flags, ..
                } => {
                    if let Some(db) = self.databases.get_mut(&db_id) {
                        let mode = if flags & 1 != 0 {
                            InsertMode::Overwrite
                        } else {
                            InsertMode::Unique
                        };
                        db.insert_direct(&mut self.cache, &mut changeset, &key, &record, mode)
                    } else {
                        Ok(())
                    }
                }
                ReplayOp::Erase { db_id, key, .. } => {
                    if let Some(db) = self.databases.get_mut(&db_id) {
                        db.erase_direct(&mut self.cache, &mut changeset, &key).map(|_| ())
                    } else {
                        Ok(())
                    }
                }
            };
            if let Err(e) = applied {
                changeset.discard(&mut self.cache);
                return Err(e);
            }
            let lsn = self.alloc_lsn();
            if let Err(e) = changeset.flush(lsn, &mut self.cache, self.journal.as_mut()) {
                changeset.discard(&mut self.cache);
                return Err(e);
            }
        }
        Ok(())
    }

    fn alloc_lsn(&mut self) -> u64 {
        let lsn = self.next_lsn;
        self.next_lsn += 1;
        lsn
    }

    fn require_not_error_state(&self) -> Result<()> {
        if self.in_error_state {
            return Err(DbError::EnvironmentReadOnly);
        }
        Ok(())
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    fn write_header_now(&mut self) -> Result<()> {
        let bytes = self.header.encode()?;
        {
            let page = self.cache.fetch(HEADER_PAGE_ID)?;
            if bytes.len() > page.payload().len() {
                return Err(DbError::LimitsReached(
                    "environment header no longer fits in page 0".into(),
                ));
            }
            page.payload_mut()[..bytes.len()].copy_from_slice(&bytes);
        }
        self.cache.write_through(HEADER_PAGE_ID)
    }

    /// Flush every dirty page through the device without going through a
    /// changeset/journal record (used by `close` and the public `flush`
    /// operation, spec.md #4.7).
    pub fn flush(&mut self) -> Result<()> {
        self.cache.flush_all()
    }

    /// Off-hot-path maintenance hook (spec.md #9 "Background thread"): no
    /// internal worker thread exists, so the embedder calls this
    /// periodically to bound dirty-page accumulation between changesets.
    pub fn maintenance_tick(&mut self) -> Result<()> {
        self.cache.purge_dirty()
    }

    /// Close the environment: abort any transactions still open (spec.md
    /// #4.7 implies a clean close has none outstanding), flush, and mark
    /// the header's clean-shutdown bit so the next `open` skips recovery.
    pub fn close(&mut self) -> Result<()> {
        let open_txns: Vec<u64> = self.transactions.keys().copied().collect();
        if !open_txns.is_empty() {
            tracing::warn!(count = open_txns.len(), "aborting transactions still open at close");
        }
        for txn_id in open_txns {
            self.abort_transaction(txn_id)?;
        }
        self.flush()?;
        self.header.clean_shutdown = true;
        self.header.last_lsn = self.next_lsn.saturating_sub(1);
        self.write_header_now()?;
        if let Some(journal) = self.journal.as_mut() {
            journal.truncate_all()?;
            journal.flush()?;
        }
        tracing::info!("environment closed cleanly");
        Ok(())
    }

    // ---- database lifecycle ------------------------------------------

    pub fn create_database(&mut self, db_id: u16, name: Option<String>, config: DatabaseConfig) -> Result<()> {
        self.require_not_error_state()?;
        if self.databases.contains_key(&db_id) {
            return Err(DbError::DatabaseExists(db_id));
        }
        if self.header.databases.len() >= self.header.max_databases as usize {
            return Err(DbError::LimitsReached("max_databases reached".into()));
        }
        let mut changeset = Changeset::new();
        let db = match Database::create(
            db_id,
            &mut self.cache,
            &mut changeset,
            config.clone(),
            self.config.extended_key_threshold,
            self.config.max_key_size,
            self.config.duplicate_threshold.min(u8::MAX as usize) as u8,
            self.config.record_inline_threshold,
        ) {
            Ok(db) => db,
            Err(e) => {
                changeset.discard(&mut self.cache);
                return Err(e);
            }
        };
        let root = db.root_page();
        self.header.databases.push(DatabaseDescriptor {
            db_id,
            root,
            name,
            config,
            current_record_number: 0,
        });
        if let Err(e) = self.finish_create_database(&mut changeset) {
            self.header.databases.pop();
            changeset.discard(&mut self.cache);
            return Err(e);
        }
        self.databases.insert(db_id, db);
        Ok(())
    }

    fn finish_create_database(&mut self, changeset: &mut Changeset) -> Result<()> {
        let header_bytes = self.header.encode()?;
        {
            let page = self.cache.fetch(HEADER_PAGE_ID)?;
            if header_bytes.len() > page.payload().len() {
                return Err(DbError::LimitsReached("environment header no longer fits in page 0".into()));
            }
            page.payload_mut()[..header_bytes.len()].copy_from_slice(&header_bytes);
        }
        changeset.add_page(&mut self.cache, PageBucket::PageManager, HEADER_PAGE_ID);
        let lsn = self.alloc_lsn();
        changeset.flush(lsn, &mut self.cache, self.journal.as_mut())?;
        Ok(())
    }

    pub fn open_database(&self, db_id: u16) -> Result<()> {
        if self.databases.contains_key(&db_id) {
            Ok(())
        } else {
            Err(DbError::DatabaseNotFound(db_id))
        }
    }

    /// Drop a database's handle and its header descriptor. Its blob and
    /// index pages are not reclaimed (no page-manager free pass walks the
    /// dropped tree) — a real embedder-facing implementation would free
    /// them; documented as a simplification in DESIGN.md.
    pub fn erase_database(&mut self, db_id: u16) -> Result<()> {
        self.require_not_error_state()?;
        if self.databases.remove(&db_id).is_none() {
            return Err(DbError::DatabaseNotFound(db_id));
        }
        self.header.databases.retain(|d| d.db_id != db_id);
        self.write_header_now()
    }

    pub fn rename_database(&mut self, db_id: u16, name: Option<String>) -> Result<()> {
        self.require_not_error_state()?;
        let descriptor = self
            .header
            .databases
            .iter_mut()
            .find(|d| d.db_id == db_id)
            .ok_or(DbError::DatabaseNotFound(db_id))?;
        descriptor.name = name;
        self.write_header_now()
    }

    // ---- transactions --------------------------------------------------

    pub fn txn_begin(&mut self, name: Option<String>) -> Result<u64> {
        self.begin_transaction_internal(name, false)
    }

    fn begin_transaction_internal(&mut self, name: Option<String>, temporary: bool) -> Result<u64> {
        self.require_not_error_state()?;
        let id = self.next_txn_id;
        self.next_txn_id += 1;
        if let Some(journal) = self.journal.as_mut() {
            let lsn = self.next_lsn;
            self.next_lsn += 1;
            journal.append_begin(lsn, id, 0, name.clone())?;
        }
        self.transactions.insert(
            id,
            TxnMeta {
                name,
                touched: HashSet::new(),
                temporary,
            },
        );
        Ok(id)
    }

    pub fn txn_commit(&mut self, txn_id: u64) -> Result<()> {
        self.commit_transaction(txn_id)
    }

    fn commit_transaction(&mut self, txn_id: u64) -> Result<()> {
        self.require_not_error_state()?;
        let meta = self
            .transactions
            .remove(&txn_id)
            .ok_or_else(|| DbError::InvalidArgument(format!("unknown transaction {txn_id}")))?;

        let mut changeset = Changeset::new();
        // Oldest-to-newest across databases doesn't matter here: each
        // database's own write_set already preserves its ops' arrival
        // order (spec.md #4.5 "applied ... in exactly the order they were
        // appended").
        for db_id in &meta.touched {
            let db = match self.databases.get_mut(db_id) {
                Some(db) => db,
                None => {
                    changeset.discard(&mut self.cache);
                    return Err(DbError::DatabaseNotFound(*db_id));
                }
            };
            let ops = match db.txn_manager.commit(txn_id) {
                Ok(ops) => ops,
                Err(e) => {
                    changeset.discard(&mut self.cache);
                    return Err(e);
                }
            };
            // A failure partway through leaves some of this transaction's
            // ops already applied to the index with no way to unwind them;
            // we can't pretend the commit didn't happen, so the changeset's
            // already-dirtied pages still need to come out of the pin set
            // and the environment moves to the same error state a failed
            // flush would produce.
            if let Err(e) = db.apply_committed_ops(&mut self.cache, &mut changeset, ops) {
                changeset.discard(&mut self.cache);
                tracing::error!(error = %e, txn_id, "commit failed partway through applying ops, environment entering error state");
                self.in_error_state = true;
                self.last_error = Some(e.to_string());
                return Err(e);
            }
        }

        if let Some(journal) = self.journal.as_mut() {
            let lsn = self.next_lsn;
            self.next_lsn += 1;
            if let Err(e) = journal.append_commit(lsn, txn_id) {
                changeset.discard(&mut self.cache);
                return Err(e);
            }
        }
        let lsn = self.alloc_lsn();
        let result = changeset.flush(lsn, &mut self.cache, self.journal.as_mut());
        if let Err(e) = &result {
            tracing::error!(error = %e, txn_id, "changeset flush failed, environment entering error state");
            changeset.discard(&mut self.cache);
            self.in_error_state = true;
            self.last_error = Some(e.to_string());
        }
        result
    }

    pub fn txn_abort(&mut self, txn_id: u64) -> Result<()> {
        self.abort_transaction(txn_id)
    }

    fn abort_transaction(&mut self, txn_id: u64) -> Result<()> {
        let meta = self
            .transactions
            .remove(&txn_id)
            .ok_or_else(|| DbError::InvalidArgument(format!("unknown transaction {txn_id}")))?;
        for db_id in &meta.touched {
            if let Some(db) = self.databases.get_mut(db_id) {
                db.txn_manager.abort(txn_id)?;
            }
        }
        if let Some(journal) = self.journal.as_mut() {
            let lsn = self.next_lsn;
            self.next_lsn += 1;
            journal.append_abort(lsn, txn_id)?;
        }
        Ok(())
    }

    fn require_open_txn(&self, txn_id: u64) -> Result<()> {
        if self.transactions.contains_key(&txn_id) {
            Ok(())
        } else {
            Err(DbError::InvalidArgument(format!("unknown or closed transaction {txn_id}")))
        }
    }

    // ---- data operations ------------------------------------------------

    /// Insert `key -> record`. `txn_id = None` wraps the write in a
    /// `TEMPORARY` transaction so it still flows through the changeset/
    /// journal path (spec.md #4.5 "Transactions may be marked TEMPORARY").
    pub fn insert(
        &mut self,
        db_id: u16,
        key: &[u8],
        record: &[u8],
        overwrite: bool,
        txn_id: Option<u64>,
    ) -> Result<()> {
        self.with_txn(txn_id, |env, id| {
            env.require_open_txn(id)?;
            if !env.databases.contains_key(&db_id) {
                return Err(DbError::DatabaseNotFound(db_id));
            }
            env.ensure_txn_open_on_db(id, db_id)?;
            let db = env.databases.get_mut(&db_id).expect("checked above");
            db.insert_txn(id, key, record.to_vec(), overwrite)?;
            if let Some(journal) = env.journal.as_mut() {
                let lsn = env.next_lsn;
                env.next_lsn += 1;
                journal.append_insert(lsn, id, db_id, key.to_vec(), record.to_vec(), overwrite as u32, None)?;
            }
            Ok(())
        })
    }

    /// Insert a duplicate record under an already-present key (spec.md
    /// #4.4 "Duplicate handling"). Only meaningful for databases opened
    /// with `DbFlags::ENABLE_DUPLICATES`.
    pub fn insert_duplicate(&mut self, db_id: u16, key: &[u8], record: &[u8], txn_id: Option<u64>) -> Result<()> {
        self.with_txn(txn_id, |env, id| {
            env.require_open_txn(id)?;
            if !env.databases.get(&db_id).ok_or(DbError::DatabaseNotFound(db_id))?.has_duplicate_support() {
                return Err(DbError::InvalidArgument("database does not support duplicates".into()));
            }
            env.ensure_txn_open_on_db(id, db_id)?;
            let db = env.databases.get_mut(&db_id).expect("checked above");
            db.txn_manager
                .record_op(id, key, OperationKind::InsertDuplicate, record.to_vec(), 0, None)?;
            if let Some(journal) = env.journal.as_mut() {
                let lsn = env.next_lsn;
                env.next_lsn += 1;
                journal.append_insert(lsn, id, db_id, key.to_vec(), record.to_vec(), 2, None)?;
            }
            Ok(())
        })
    }

    pub fn erase(&mut self, db_id: u16, key: &[u8], txn_id: Option<u64>) -> Result<()> {
        self.with_txn(txn_id, |env, id| {
            env.require_open_txn(id)?;
            if !env.databases.contains_key(&db_id) {
                return Err(DbError::DatabaseNotFound(db_id));
            }
            env.ensure_txn_open_on_db(id, db_id)?;
            let db = env.databases.get_mut(&db_id).expect("checked above");
            db.erase_txn(id, key)?;
            if let Some(journal) = env.journal.as_mut() {
                let lsn = env.next_lsn;
                env.next_lsn += 1;
                journal.append_erase(lsn, id, db_id, key.to_vec(), None, 0)?;
            }
            Ok(())
        })
    }

    /// Register `txn_id` with `db_id`'s own `TxnManager` the first time the
    /// transaction writes there, and remember the database in `touched` so
    /// commit/abort know which per-database managers to finalize. A
    /// transaction's id is allocated once at the environment level (spec.md
    /// #4.5, #9 "Pointer graphs") but each `Database` keeps an independent
    /// `TxnManager`, which must see `begin_with_id` before it will accept
    /// `record_op`.
    fn ensure_txn_open_on_db(&mut self, txn_id: u64, db_id: u16) -> Result<()> {
        let meta = self
            .transactions
            .get_mut(&txn_id)
            .expect("require_open_txn checked this transaction is open");
        let first_touch = meta.touched.insert(db_id);
        let name = meta.name.clone();
        if first_touch {
            let db = self.databases.get_mut(&db_id).expect("checked by caller");
            if !db.txn_manager.is_open(txn_id) {
                db.txn_manager.begin_with_id(txn_id, name);
            }
        }
        Ok(())
    }

    /// Run `body` inside `txn_id`, or inside a fresh `TEMPORARY`
    /// transaction that is committed (or aborted, on error) before
    /// returning when `txn_id` is `None`.
    fn with_txn(&mut self, txn_id: Option<u64>, body: impl FnOnce(&mut Self, u64) -> Result<()>) -> Result<()> {
        match txn_id {
            Some(id) => body(self, id),
            None => {
                let id = self.begin_transaction_internal(None, true)?;
                match body(self, id) {
                    Ok(()) => self.commit_transaction(id),
                    Err(e) => {
                        let _ = self.abort_transaction(id);
                        Err(e)
                    }
                }
            }
        }
    }

    pub fn find(&mut self, db_id: u16, key: &[u8], txn_id: Option<u64>) -> Result<Option<Vec<u8>>> {
        let db = self.databases.get(&db_id).ok_or(DbError::DatabaseNotFound(db_id))?;
        match txn_id {
            Some(id) => db.find_txn(&mut self.cache, id, key),
            None => db.find_direct(&mut self.cache, key),
        }
    }

    /// Number of records stored under `key` (spec.md #8 scenario 4): 0 if
    /// absent, 1 for a plain key, and the duplicate count otherwise.
    /// Reads only the committed tree, the same as `find` with `txn_id:
    /// None` — a transaction's own pending duplicate inserts are not
    /// reflected until commit.
    pub fn record_count(&mut self, db_id: u16, key: &[u8]) -> Result<u32> {
        let db = self.databases.get(&db_id).ok_or(DbError::DatabaseNotFound(db_id))?;
        db.record_count(&mut self.cache, key)
    }

    pub fn cursor(&mut self, db_id: u16, txn_id: Option<u64>) -> Result<crate::cursor::Cursor> {
        let db = self.databases.get(&db_id).ok_or(DbError::DatabaseNotFound(db_id))?;
        Ok(db.cursor(txn_id))
    }

    /// Peek the record number an `insert_record_number` call on `db_id`
    /// would assign next, without reserving it. Read straight from the
    /// header descriptor's persisted `current_record_number` (spec.md #4.4
    /// "maintain `current_record_number` in the database header"), not
    /// derived from the tree's contents: deriving it from the rightmost
    /// leaf's max key would reissue an already-used number the instant the
    /// highest-numbered record is erased and reinserted.
    pub fn next_record_number(&self, db_id: u16) -> Result<u64> {
        let descriptor = self
            .header
            .databases
            .iter()
            .find(|d| d.db_id == db_id)
            .ok_or(DbError::DatabaseNotFound(db_id))?;
        Ok(descriptor.current_record_number + 1)
    }

    /// Insert a key using the database's auto-assigned record number
    /// (spec.md #4.4 "Record-number databases"): reserves
    /// `current_record_number + 1` and persists it to the header
    /// immediately, *before* attempting the insert, so a crash between
    /// reservation and insert only burns a number rather than ever
    /// reissuing one already assigned to a prior record. Branches on
    /// `DbFlags::RECORD_NUMBER_32` vs `_64` for both the key's on-disk
    /// width (4 vs 8 bytes) and the overflow bound ("wrap-around raises
    /// 'limits reached'").
    pub fn insert_record_number(&mut self, db_id: u16, record: &[u8], txn_id: Option<u64>) -> Result<u64> {
        let descriptor = self
            .header
            .databases
            .iter()
            .find(|d| d.db_id == db_id)
            .ok_or(DbError::DatabaseNotFound(db_id))?;
        let flags = descriptor.config.flags;
        let is_32 = flags.contains(DbFlags::RECORD_NUMBER_32);
        let is_64 = flags.contains(DbFlags::RECORD_NUMBER_64);
        if !is_32 && !is_64 {
            return Err(DbError::InvalidArgument(
                "database was not created with RECORD_NUMBER_32 or RECORD_NUMBER_64".into(),
            ));
        }
        let bound: u64 = if is_32 { u32::MAX as u64 } else { u64::MAX };
        let current = descriptor.current_record_number;
        if current >= bound {
            return Err(DbError::LimitsReached("record number space exhausted".into()));
        }
        let next = current + 1;

        let descriptor = self
            .header
            .databases
            .iter_mut()
            .find(|d| d.db_id == db_id)
            .expect("looked up by the same db_id above");
        descriptor.current_record_number = next;
        self.write_header_now()?;

        let key_bytes: Vec<u8> = if is_32 {
            (next as u32).to_le_bytes().to_vec()
        } else {
            next.to_le_bytes().to_vec()
        };
        self.insert(db_id, &key_bytes, record, false, txn_id)?;
        Ok(next)
    }

    pub fn integrity_check(&mut self, db_id: u16) -> Result<()> {
        let db = self.databases.get(&db_id).ok_or(DbError::DatabaseNotFound(db_id))?;
        db.integrity_check(&mut self.cache)
    }

    /// Cooperative scan over every distinct key in `db_id`, in ascending
    /// order, calling `visitor(key, record)` once per key until it asks to
    /// stop or the tree is exhausted (spec.md #5 "Cancellation"). A key
    /// with duplicates is visited once with its first record, same as
    /// `find`; `Cursor::next`/`previous` step through duplicates
    /// individually for callers that want every one of them.
    ///
    /// Records are re-resolved through `Database::find_direct` rather than
    /// read straight off the cursor's node position, since the `Default`
    /// layout's stored bytes carry an inline/blob tag (spec.md #4.3) that
    /// only `Database` knows how to strip.
    pub fn scan(
        &mut self,
        db_id: u16,
        mut visitor: impl FnMut(&[u8], &[u8]) -> ScanControl,
    ) -> Result<()> {
        // Copy the index out (its fields are all `Copy`) so the walk below
        // can borrow `self.cache` mutably without holding a borrow of
        // `self.databases` across the loop.
        let index = self.btree_index(db_id)?;
        let mut cursor = crate::cursor::Cursor::new(None);

        if !cursor.first(&mut self.cache, &index)? {
            return Ok(());
        }
        loop {
            let key = cursor.current_key(&mut self.cache)?;
            let record = self
                .databases
                .get(&db_id)
                .ok_or(DbError::DatabaseNotFound(db_id))?
                .find_direct(&mut self.cache, &key)?
                .unwrap_or_default();
            if visitor(&key, &record) == ScanControl::Stop {
                return Ok(());
            }
            // Skip past any remaining duplicates of `key` so each distinct
            // key is visited exactly once.
            loop {
                if !cursor.next(&mut self.cache, &index)? {
                    return Ok(());
                }
                if cursor.current_key(&mut self.cache)? != key {
                    break;
                }
            }
        }
    }

    fn btree_index(&self, db_id: u16) -> Result<crate::index::btree::BtreeIndex> {
        match &self
            .databases
            .get(&db_id)
            .ok_or(DbError::DatabaseNotFound(db_id))?
            .layout
        {
            crate::index::LayoutKind::Default(b) => Ok(*b),
            _ => Err(DbError::InvalidArgument(
                "cursor scan is only implemented for the Default layout".into(),
            )),
        }
    }

    pub fn path_for_journal(&self) -> Option<PathBuf> {
        self.journal.as_ref().map(|j| j.dir().to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DatabaseConfig, DbFlags};
    use crate::index::key::KeyType;
    use tempfile::tempdir;

    fn test_config(dir: &Path) -> EnvironmentConfig {
        EnvironmentConfig {
            page_size: 1024,
            cache_limit_bytes: 1024 * 64,
            journal_dir: dir.to_path_buf(),
            ..Default::default()
        }
    }

    #[test]
    fn create_db_insert_find_erase() {
        let dir = tempdir().unwrap();
        let mut env = Environment::create(dir.path().join("env.db"), test_config(dir.path())).unwrap();
        env.create_database(1, None, DatabaseConfig::default()).unwrap();

        assert_eq!(env.find(1, b"key", None).unwrap(), None);
        env.insert(1, b"key", b"value", false, None).unwrap();
        assert_eq!(env.find(1, b"key", None).unwrap(), Some(b"value".to_vec()));
        env.erase(1, b"key", None).unwrap();
        assert_eq!(env.find(1, b"key", None).unwrap(), None);
    }

    #[test]
    fn numeric_sort_via_cursor_scan() {
        let dir = tempdir().unwrap();
        let mut env = Environment::create(dir.path().join("env.db"), test_config(dir.path())).unwrap();
        env.create_database(
            1,
            None,
            DatabaseConfig {
                key_type: KeyType::Uint32,
                record_size: None,
                flags: DbFlags::default(),
            },
        )
        .unwrap();
        for k in [1u32, 256, 16, 65536] {
            env.insert(1, &k.to_le_bytes(), b"", false, None).unwrap();
        }
        let mut seen = Vec::new();
        env.scan(1, |key, _| {
            seen.push(u32::from_le_bytes(key.try_into().unwrap()));
            ScanControl::Continue
        })
        .unwrap();
        assert_eq!(seen, vec![1, 16, 256, 65536]);
    }

    #[test]
    fn transaction_conflict_blocks_second_writer() {
        let dir = tempdir().unwrap();
        let mut env = Environment::create(dir.path().join("env.db"), test_config(dir.path())).unwrap();
        env.create_database(1, None, DatabaseConfig::default()).unwrap();

        let a = env.txn_begin(None).unwrap();
        let b = env.txn_begin(None).unwrap();
        env.insert(1, b"k", b"a", false, Some(a)).unwrap();
        let err = env.insert(1, b"k", b"b", false, Some(b)).unwrap_err();
        assert!(matches!(err, DbError::TxnConflict));
        env.txn_commit(a).unwrap();
        assert_eq!(env.find(1, b"k", None).unwrap(), Some(b"a".to_vec()));
    }

    #[test]
    fn close_then_reopen_preserves_committed_data() {
        let dir = tempdir().unwrap();
        let env_path = dir.path().join("env.db");
        {
            let mut env = Environment::create(&env_path, test_config(dir.path())).unwrap();
            env.create_database(1, None, DatabaseConfig::default()).unwrap();
            env.insert(1, b"a", b"1", false, None).unwrap();
            env.insert(1, b"b", b"2", false, None).unwrap();
            env.close().unwrap();
        }
        let mut config = test_config(dir.path());
        config.flags = config.flags.with(EnvFlags::AUTO_RECOVERY);
        let mut env = Environment::open(&env_path, config).unwrap();
        assert_eq!(env.find(1, b"a", None).unwrap(), Some(b"1".to_vec()));
        assert_eq!(env.find(1, b"b", None).unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn in_memory_environment_needs_no_journal() {
        let mut config = EnvironmentConfig {
            flags: EnvFlags(EnvFlags::IN_MEMORY),
            ..Default::default()
        };
        config.page_size = 1024;
        let mut env = Environment::create("ignored", config).unwrap();
        env.create_database(1, None, DatabaseConfig::default()).unwrap();
        env.insert(1, b"k", b"v", false, None).unwrap();
        assert_eq!(env.find(1, b"k", None).unwrap(), Some(b"v".to_vec()));
    }
}
