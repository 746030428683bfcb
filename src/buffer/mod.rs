//! Page cache and changeset: the paged store's write-buffering layer
//! (spec.md #4.1, #4.2).

pub mod changeset;
pub mod page_cache;

pub use changeset::{Changeset, PageBucket};
pub use page_cache::PageCache;
