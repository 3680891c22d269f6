//! The breakpoint store contract.
//!
//! The store is the authoritative owner of resume-state: it assigns
//! stable task ids, hands out live record handles, and is the *only*
//! path by which persisted per-block progress advances
//! ([`BreakpointStore::on_sync_to_filesystem_success`], called strictly
//! after the bytes are durable on disk).
//!
//! Implementations must make `get`/`update`/`create_and_insert` atomic
//! with respect to each other per id. A durable implementation must load
//! its entire table into memory at construction time and keep the
//! in-memory view authoritative for reads even when the durable layer
//! fails a write.

use std::sync::Arc;

use thiserror::Error;

use crate::breakpoint::info::BreakpointInfo;
use crate::download::task::DownloadTask;
use crate::error::DownloadError;

/// Errors from breakpoint store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Durable-layer I/O failure. The in-memory cache stays consistent.
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Record (de)serialization failure in a durable layer.
    #[error("store encoding error: {0}")]
    Encode(String),

    /// An operation referenced an id with no record.
    #[error("no breakpoint record for id {0}")]
    UnknownId(u32),
}

impl From<StoreError> for DownloadError {
    fn from(err: StoreError) -> Self {
        DownloadError::Store(err.to_string())
    }
}

/// Authoritative mapping of task identity to resume-state.
pub trait BreakpointStore: Send + Sync {
    /// Returns the id of the record matching this task's identity
    /// (url + parent path + filename, ignoring numeric id), or allocates
    /// the smallest positive integer not currently in use. Ids are
    /// compact: they are reused after `complete_download`/`discard`.
    fn find_or_create_id(&self, task: &DownloadTask) -> Result<u32, StoreError>;

    /// Live record handle for an id, if present.
    fn get(&self, id: u32) -> Option<Arc<BreakpointInfo>>;

    /// Builds an empty-blocks record from task metadata under the task's
    /// already-assigned id and stores it.
    fn create_and_insert(&self, task: &DownloadTask) -> Result<Arc<BreakpointInfo>, StoreError>;

    /// Replaces the stored copy's mutable fields (etag, chunked flag,
    /// filename, block list) if a record with that id exists; returns
    /// `false` otherwise. Block handles are shared by reference so that
    /// progress cursors advanced by the sync path stay visible to later
    /// `get` calls without a full update.
    fn update(&self, info: &Arc<BreakpointInfo>) -> Result<bool, StoreError>;

    /// Advances the persisted progress cursor of one block. Must be
    /// called only after the corresponding bytes were flushed and synced
    /// to the filesystem. Safe to call concurrently for different block
    /// indices of the same record; calls for one block index are
    /// serialized by the single fetch loop that owns it.
    fn on_sync_to_filesystem_success(
        &self,
        info: &Arc<BreakpointInfo>,
        block_index: usize,
        increase_length: u64,
    ) -> Result<(), StoreError>;

    /// Removes the record entirely after a successful download.
    fn complete_download(&self, id: u32) -> Result<(), StoreError>;

    /// Removes the record entirely for an abandoned task.
    fn discard(&self, id: u32) -> Result<(), StoreError>;

    /// Filename previously determined from a response for this url, if
    /// any. Lets a restarted task reuse the served filename before it
    /// connects.
    fn find_response_filename(&self, url: &str) -> Option<String>;
}
