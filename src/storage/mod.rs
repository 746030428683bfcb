//! The paged store's leaf layer: raw device I/O and the page header
//! (spec.md #4.1, #3).

pub mod checksum;
pub mod device;
pub mod page;

pub use device::{Device, FileDevice, MemoryDevice};
pub use page::{Page, PageId, PageType, HEADER_SIZE, INVALID_PAGE_ID};
