//! An embedded, single-process key-value storage engine backed by a
//! memory-mapped... in this crate's case, cached-and-paged, file. See
//! `SPEC_FULL.md` for the full design; `DESIGN.md` for how each piece is
//! grounded.
//!
//! The paged store (`storage`, `buffer`), the B+-tree index (`index`),
//! the blob manager (`blob`), the transaction layer (`transaction`), and
//! the journal/recovery path (`journal`) are each usable on their own;
//! `environment::Environment` is the component that wires them together
//! behind the single-mutex API described in spec.md #4.7 and #5.

pub mod blob;
pub mod buffer;
pub mod config;
pub mod cursor;
pub mod database;
pub mod environment;
pub mod error;
pub mod index;
pub mod journal;
pub mod storage;
pub mod transaction;

pub use config::{DatabaseConfig, EnvFlags, EnvironmentConfig};
pub use database::Database;
pub use environment::{Environment, ScanControl};
pub use error::{DbError, Result};
