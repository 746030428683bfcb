//! Environment header page (page 0) wire format (spec.md #3, #6
//! "On-disk layout": "Page 0: environment header (magic bytes, version
//! triple, page size, max-dbs, flags, per-database descriptor array,
//! clean-shutdown bit)").
//!
//! Unlike the hot-path node layouts in `index::node`/`index::pax`, the
//! header is read/written a handful of times per environment lifetime
//! (create, open, every `create_database`/`erase_database`, close) so it
//! is serialized with `bincode` rather than given its own byte-offset
//! accessors.

use crate::config::{DatabaseConfig, EnvFlags};
use crate::error::{DbError, Result};
use crate::storage::page::PageId;
use serde::{Deserialize, Serialize};

pub const HEADER_MAGIC: [u8; 4] = *b"PKV0";
pub const HEADER_VERSION: (u16, u16, u16) = (1, 0, 0);

/// One entry of the header's "fixed array of (dbid, btree-root-pageid,
/// key-type, flags, key-size, record-type, record-size, ...)" (spec.md
/// #4.7). `key-size`/`record-type`/`record-size` live inside `config`
/// rather than being duplicated as separate fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseDescriptor {
    pub db_id: u16,
    pub root: PageId,
    pub name: Option<String>,
    pub config: DatabaseConfig,
    /// The last record number assigned by `Environment::insert_record_number`
    /// (spec.md #4.4 "Record-number databases": "maintain
    /// `current_record_number` in the database header"). `0` means none
    /// assigned yet; the next insert gets `current_record_number + 1`.
    /// Persisted here rather than derived from the tree's max key so that
    /// erasing the highest-numbered record and inserting again never
    /// reissues it.
    #[serde(default)]
    pub current_record_number: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentHeader {
    pub magic: [u8; 4],
    pub version: (u16, u16, u16),
    pub page_size: u32,
    pub max_databases: u16,
    pub flags: EnvFlags,
    pub databases: Vec<DatabaseDescriptor>,
    pub clean_shutdown: bool,
    pub last_lsn: u64,
}

impl EnvironmentHeader {
    pub fn new(page_size: u32, max_databases: u16, flags: EnvFlags) -> Self {
        Self {
            magic: HEADER_MAGIC,
            version: HEADER_VERSION,
            page_size,
            max_databases,
            flags,
            databases: Vec::new(),
            clean_shutdown: false,
            last_lsn: 0,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serde::encode_to_vec(self, bincode::config::standard()).map_err(Into::into)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (header, _): (Self, usize) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| DbError::Serialization(e.to_string()))?;
        if header.magic != HEADER_MAGIC {
            return Err(DbError::IntegrityViolated(
                "environment header magic mismatch".into(),
            ));
        }
        Ok(header)
    }
}
