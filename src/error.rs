//! Stable error taxonomy surfaced at the crate boundary (spec.md #6, #7).
//!
//! `Success` has no variant here: it is `Ok(())` / `Ok(T)`. Every other
//! stable numeric code named in spec.md #6 has a corresponding variant so
//! that an embedder wiring in the excluded C API or query layer has
//! somewhere to map a code to.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("key not found")]
    KeyNotFound,

    #[error("duplicate key")]
    DuplicateKey,

    #[error("invalid key size: {0}")]
    InvalidKeySize(usize),

    #[error("invalid record size: {0}")]
    InvalidRecordSize(usize),

    #[error("cursor is nil")]
    CursorIsNil,

    #[error("transaction conflict")]
    TxnConflict,

    #[error("transaction still open")]
    TxnStillOpen,

    #[error("database needs recovery")]
    NeedRecovery,

    #[error("integrity violated: {0}")]
    IntegrityViolated(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("out of memory")]
    OutOfMemory,

    #[error("environment is not ready: {0}")]
    NotReady(String),

    #[error("limits reached: {0}")]
    LimitsReached(String),

    #[error("plugin not found: {0}")]
    PluginNotFound(String),

    #[error("parser error: {0}")]
    ParserError(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("environment is in a read-only error state")]
    EnvironmentReadOnly,

    #[error("database not found: {0}")]
    DatabaseNotFound(u16),

    #[error("database already exists: {0}")]
    DatabaseExists(u16),
}

impl From<bincode::error::EncodeError> for DbError {
    fn from(e: bincode::error::EncodeError) -> Self {
        DbError::Serialization(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for DbError {
    fn from(e: bincode::error::DecodeError) -> Self {
        DbError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for DbError {
    fn from(e: serde_json::Error) -> Self {
        DbError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DbError>;
