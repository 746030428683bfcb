//! Journal and recovery (spec.md #4.6).

pub mod recovery;
pub mod wal;

pub use recovery::{recover, RecoveryOutcome, ReplayOp};
pub use wal::{Journal, JournalEntry};
