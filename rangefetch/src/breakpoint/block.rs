//! A single contiguous byte range of the remote resource.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Reserved content-length value meaning "length unknown, the server uses
/// chunked transfer encoding". Only ever valid on the sole block of a
/// single-block download.
pub const CHUNKED_CONTENT_LENGTH: u64 = u64::MAX;

/// One contiguous byte range of the target resource, fetched and written
/// independently of its siblings.
///
/// `current_offset` is the progress cursor *relative to the block*: the
/// number of bytes of this range already written. It is advanced only by
/// the write-completion path ([`BlockInfo::increase_current_offset`],
/// driven by the store's sync callback), so the persisted value can never
/// run ahead of durable file content.
#[derive(Debug)]
pub struct BlockInfo {
    start_offset: u64,
    content_length: u64,
    current_offset: AtomicU64,
}

impl BlockInfo {
    /// Creates a block covering `[start_offset, start_offset + content_length)`
    /// with no progress.
    pub fn new(start_offset: u64, content_length: u64) -> Self {
        Self::with_offset(start_offset, content_length, 0)
    }

    /// Creates a block with an existing progress cursor (resume path).
    pub fn with_offset(start_offset: u64, content_length: u64, current_offset: u64) -> Self {
        Self {
            start_offset,
            content_length,
            current_offset: AtomicU64::new(current_offset),
        }
    }

    /// Absolute start of this block in the resource.
    pub fn start_offset(&self) -> u64 {
        self.start_offset
    }

    /// Declared byte count of this block, or [`CHUNKED_CONTENT_LENGTH`].
    pub fn content_length(&self) -> u64 {
        self.content_length
    }

    /// Bytes of this block already written and persisted.
    pub fn current_offset(&self) -> u64 {
        self.current_offset.load(Ordering::Acquire)
    }

    /// Absolute offset of the next byte to request: `start + current`.
    pub fn range_left(&self) -> u64 {
        self.start_offset + self.current_offset()
    }

    /// Absolute, inclusive end offset of this block.
    pub fn range_right(&self) -> u64 {
        self.start_offset + self.content_length - 1
    }

    /// Whether the declared length is the chunked sentinel.
    pub fn is_chunked(&self) -> bool {
        self.content_length == CHUNKED_CONTENT_LENGTH
    }

    /// Advances the progress cursor. Called only after the corresponding
    /// bytes are durable on disk.
    pub fn increase_current_offset(&self, increase_length: u64) {
        self.current_offset
            .fetch_add(increase_length, Ordering::AcqRel);
    }

    /// Resets the progress cursor to the start of the block.
    pub fn reset(&self) {
        self.current_offset.store(0, Ordering::Release);
    }

    /// Deep copy; block state is copied, never aliased, when a breakpoint
    /// record is cloned.
    pub fn copy(&self) -> BlockInfo {
        BlockInfo::with_offset(self.start_offset, self.content_length, self.current_offset())
    }
}

impl std::fmt::Display for BlockInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}, {})-current:{}",
            self.start_offset,
            self.start_offset.saturating_add(self.content_length),
            self.current_offset()
        )
    }
}

/// Serializable snapshot of a block, used by durable stores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockRecord {
    pub start_offset: u64,
    pub content_length: u64,
    pub current_offset: u64,
}

impl From<&BlockInfo> for BlockRecord {
    fn from(block: &BlockInfo) -> Self {
        BlockRecord {
            start_offset: block.start_offset(),
            content_length: block.content_length(),
            current_offset: block.current_offset(),
        }
    }
}

impl From<&BlockRecord> for BlockInfo {
    fn from(record: &BlockRecord) -> Self {
        BlockInfo::with_offset(
            record.start_offset,
            record.content_length,
            record.current_offset,
        )
    }
}
