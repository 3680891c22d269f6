//! Task lifecycle callbacks.

use crate::breakpoint::info::BreakpointInfo;
use crate::download::task::DownloadTask;
use crate::error::{DownloadError, EndCause, ResumeFailedCause};

/// Observer of one task's lifecycle. All methods have no-op defaults so
/// implementors override only what they need.
///
/// Callbacks are invoked from engine worker threads. `task_start` and
/// `task_end` are called exactly once per submission; exactly one of
/// `download_from_beginning` / `download_from_breakpoint` precedes the
/// first `connect_start`. Per-block callbacks may interleave across
/// blocks.
pub trait DownloadListener: Send + Sync {
    fn task_start(&self, _task: &DownloadTask) {}

    /// The persisted record could not be used; the download restarts from
    /// offset zero for the given reason.
    fn download_from_beginning(&self, _task: &DownloadTask, _cause: ResumeFailedCause) {}

    /// A persisted record was accepted; the download resumes from
    /// `info.total_offset()`.
    fn download_from_breakpoint(&self, _task: &DownloadTask, _info: &BreakpointInfo) {}

    fn connect_start(&self, _task: &DownloadTask, _block_index: usize) {}

    fn connect_end(&self, _task: &DownloadTask, _block_index: usize, _response_code: u16) {}

    fn fetch_start(&self, _task: &DownloadTask, _block_index: usize, _content_length: u64) {}

    /// Throttled by the task's `min_progress_interval`; `increase_bytes`
    /// is the accumulated count since the previous callback.
    fn fetch_progress(&self, _task: &DownloadTask, _block_index: usize, _increase_bytes: u64) {}

    fn fetch_end(&self, _task: &DownloadTask, _block_index: usize) {}

    /// Terminal callback; `error` is present for [`EndCause::Error`] and
    /// [`EndCause::PreAllocateFailed`].
    fn task_end(&self, _task: &DownloadTask, _cause: EndCause, _error: Option<&DownloadError>) {}
}

/// Listener that ignores every callback.
pub struct NoopListener;

impl DownloadListener for NoopListener {}
