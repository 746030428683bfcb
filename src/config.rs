//! Environment and database configuration.
//!
//! Plain structs with `Default` impls rather than a builder-macro DSL,
//! following the shape of the teacher's `BufferPoolConfig`. Thresholds that
//! the original C++ source keeps as process-wide statics (spec.md #9,
//! "Global mutable state") live here per-`Environment` instead.

use serde::{Deserialize, Serialize};

/// Default page size: 16 KiB, per spec.md #3.
pub const DEFAULT_PAGE_SIZE: usize = 16 * 1024;

/// Default extended-key threshold: keys longer than this move to a blob.
/// Scales with page size in the original; fixed fraction here.
pub const DEFAULT_EXTENDED_KEY_THRESHOLD: usize = 64;

/// Default inline-record threshold (spec.md #3: 8 bytes for the default layout).
pub const DEFAULT_RECORD_INLINE_THRESHOLD: usize = 8;

/// Default number of duplicates before a slot moves to an extended duplicate table.
pub const DEFAULT_DUPLICATE_THRESHOLD: usize = 32;

/// Default global cap on unbounded binary key size.
pub const DEFAULT_MAX_KEY_SIZE: usize = 4096;

/// Environment-level flags (spec.md #6). A hand-rolled bitset: the crate's
/// dependency set has no flags crate, and these six bits don't earn one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvFlags(pub u32);

impl EnvFlags {
    pub const IN_MEMORY: u32 = 0x0001;
    pub const READ_ONLY: u32 = 0x0002;
    pub const ENABLE_TRANSACTIONS: u32 = 0x0004;
    pub const ENABLE_RECOVERY: u32 = 0x0008;
    pub const AUTO_RECOVERY: u32 = 0x0010;
    pub const DISABLE_MMAP: u32 = 0x0020;
    pub const ENABLE_FSYNC: u32 = 0x0040;
    pub const CACHE_UNLIMITED: u32 = 0x0080;

    pub fn contains(&self, bit: u32) -> bool {
        self.0 & bit != 0
    }

    pub fn with(mut self, bit: u32) -> Self {
        self.0 |= bit;
        self
    }
}

impl Default for EnvFlags {
    fn default() -> Self {
        EnvFlags(Self::ENABLE_TRANSACTIONS | Self::ENABLE_RECOVERY)
    }
}

/// Database-level flags (spec.md #6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DbFlags(pub u32);

impl DbFlags {
    pub const ENABLE_DUPLICATES: u32 = 0x0001;
    pub const RECORD_NUMBER_32: u32 = 0x0002;
    pub const RECORD_NUMBER_64: u32 = 0x0004;
    pub const FORCE_RECORDS_INLINE: u32 = 0x0008;
    pub const SORT_DUPLICATES: u32 = 0x0010;
    pub const CUSTOM_COMPARE_HASH: u32 = 0x0020;

    pub fn contains(&self, bit: u32) -> bool {
        self.0 & bit != 0
    }

    pub fn with(mut self, bit: u32) -> Self {
        self.0 |= bit;
        self
    }
}

/// Per-environment configuration, resolved once at `Environment::create`/`open`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    pub page_size: usize,
    pub cache_limit_bytes: usize,
    pub max_databases: u16,
    pub flags: EnvFlags,
    pub journal_dir: std::path::PathBuf,
    pub journal_segment_size: u64,
    pub extended_key_threshold: usize,
    pub duplicate_threshold: usize,
    pub max_key_size: usize,
    pub record_inline_threshold: usize,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            cache_limit_bytes: 64 * 1024 * 1024,
            max_databases: 64,
            flags: EnvFlags::default(),
            journal_dir: std::path::PathBuf::from("."),
            journal_segment_size: 16 * 1024 * 1024,
            extended_key_threshold: DEFAULT_EXTENDED_KEY_THRESHOLD,
            duplicate_threshold: DEFAULT_DUPLICATE_THRESHOLD,
            max_key_size: DEFAULT_MAX_KEY_SIZE,
            record_inline_threshold: DEFAULT_RECORD_INLINE_THRESHOLD,
        }
    }
}

/// Per-database configuration, supplied at `create_database` time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub key_type: crate::index::key::KeyType,
    pub record_size: Option<u32>,
    pub flags: DbFlags,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            key_type: crate::index::key::KeyType::Binary(None),
            record_size: None,
            flags: DbFlags::default(),
        }
    }
}
