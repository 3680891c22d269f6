//! Error taxonomy for the download engine.
//!
//! Errors fall into five families, each with a distinct propagation path:
//!
//! 1. **Retryable-within-connect** (`DownloadError::RetryConnect`) —
//!    consumed entirely inside the connect retry stage; never visible to
//!    callers.
//! 2. **Resume-ineligible** (`DownloadError::ResumeFailed`) — not fatal;
//!    the task restarts from offset zero with a fresh breakpoint record
//!    and the caller sees a [`ResumeFailedCause`] in its
//!    `download_from_beginning` callback.
//! 3. **Fatal protocol errors** (`Protocol`, `ServerCanceled`,
//!    `NetworkPolicy`, `PreAllocate`) — abort the task and surface in the
//!    terminal `task_end` callback.
//! 4. **Cancellation** (`Interrupted`) — a signal, not an error; it is
//!    never retried and never logged at error level.
//! 5. **I/O and store failures** — surfaced synchronously to whoever
//!    invoked the mutating operation.

use std::io;

use thiserror::Error;

/// Why a persisted breakpoint could not be reused, forcing a download
/// from the beginning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeFailedCause {
    /// The stored record is inconsistent: no blocks, or its resolved path
    /// no longer matches the task's target file.
    InfoDirty,
    /// The target file on disk is gone.
    FileNotExist,
    /// The output backend cannot seek and the stored record needs
    /// multi-point writes.
    OutputStreamNotSupport,
    /// The server rejected the conditional request (HTTP 412).
    ResponsePreconditionFailed,
    /// The resource's ETag changed since the record was created.
    ResponseEtagChanged,
    /// HTTP 201 on a ranged request that already had progress.
    ResponseCreatedRangeNotFrom0,
    /// HTTP 205 on a ranged request that already had progress.
    ResponseResetRangeNotFrom0,
}

impl std::fmt::Display for ResumeFailedCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            ResumeFailedCause::InfoDirty => "breakpoint record is dirty",
            ResumeFailedCause::FileNotExist => "target file does not exist",
            ResumeFailedCause::OutputStreamNotSupport => {
                "output stream does not support resuming"
            }
            ResumeFailedCause::ResponsePreconditionFailed => "server precondition failed",
            ResumeFailedCause::ResponseEtagChanged => "resource etag changed",
            ResumeFailedCause::ResponseCreatedRangeNotFrom0 => {
                "resource recreated while mid-range"
            }
            ResumeFailedCause::ResponseResetRangeNotFrom0 => "resource reset while mid-range",
        };
        f.write_str(text)
    }
}

/// How a task ended. Exactly one terminal cause is reported per
/// submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndCause {
    /// All blocks fetched and verified; the store entry was purged.
    Completed,
    /// A fatal error ended the task; see the accompanying error.
    Error,
    /// The user canceled the task.
    Canceled,
    /// Another in-flight task already targets the same file path.
    FileBusy,
    /// The identical task is already queued or running.
    SameTaskBusy,
    /// Pre-allocating the target file failed.
    PreAllocateFailed,
}

/// Errors produced by the download execution engine.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Cooperative cancellation signal. Observed at stage checkpoints and
    /// propagated promptly; never a real failure.
    #[error("download interrupted")]
    Interrupted,

    /// Recoverable negotiation failure: re-run the connect pipeline from
    /// the top. Consumed by the retry stage, invisible above it.
    #[error("connect must be retried: {0}")]
    RetryConnect(&'static str),

    /// The persisted breakpoint cannot be resumed; restart from zero.
    #[error("resume failed: {0}")]
    ResumeFailed(ResumeFailedCause),

    /// The server answered a ranged request with a code that cannot
    /// satisfy it.
    #[error("server canceled with code {code} at offset {offset}")]
    ServerCanceled { code: u16, offset: u64 },

    /// A network-policy constraint forbids executing the request.
    #[error("network policy violation: {0}")]
    NetworkPolicy(String),

    /// Pre-allocating the target file to its final length failed.
    #[error("pre-allocate {requested} bytes failed")]
    PreAllocate {
        requested: u64,
        #[source]
        source: io::Error,
    },

    /// Unrecoverable protocol violation (redirect bound exceeded, missing
    /// Location header, bad block count, fetched-length mismatch).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The target file path became busy after this task already started.
    #[error("file became busy after the task started")]
    FileBusyAfterRun,

    /// Underlying I/O failure (network or filesystem).
    #[error(transparent)]
    Io(#[from] io::Error),

    /// The breakpoint store rejected or failed a mutating operation.
    #[error("breakpoint store: {0}")]
    Store(String),
}

impl DownloadError {
    /// Whether this error is the cooperative cancellation signal.
    pub fn is_interrupt(&self) -> bool {
        matches!(self, DownloadError::Interrupted)
    }
}
