//! Resume-state ("breakpoint") model and stores.
//!
//! A breakpoint records how far a download got: the ordered block list
//! partitioning the resource, the per-block progress cursors, and the
//! etag validator the server handed out. The [`BreakpointStore`] trait
//! owns these records; [`MemoryBreakpointStore`] keeps them for the
//! process lifetime and [`JournalBreakpointStore`] persists them across
//! restarts.

pub mod block;
pub mod info;
pub mod journal;
pub mod memory;
pub mod store;

pub use block::{BlockInfo, CHUNKED_CONTENT_LENGTH};
pub use info::BreakpointInfo;
pub use journal::JournalBreakpointStore;
pub use memory::MemoryBreakpointStore;
pub use store::{BreakpointStore, StoreError};
