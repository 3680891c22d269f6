//! Shared per-attempt state for the blocks of one running task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::error::DownloadError;
use crate::file::multi_point::MultiPointOutputStream;

/// State shared by all block chains of one download attempt: interrupt
/// flags, error classification for the terminal callback, the one-shot
/// split gate, and the shared output stream handle.
///
/// A fresh cache is created per attempt; a restart-from-beginning after a
/// resume failure gets a new one.
pub struct TaskCache {
    user_canceled: AtomicBool,
    error_interrupted: AtomicBool,
    precondition_failed: AtomicBool,
    server_canceled: AtomicBool,
    pre_allocate_failed: AtomicBool,
    unknown_error: AtomicBool,
    /// Set while the first block's trial connect has not yet determined
    /// the split; cleared once the block list is final.
    first_connect_pending: AtomicBool,
    gate: Mutex<bool>,
    gate_signal: Condvar,
    output: Mutex<Option<Arc<MultiPointOutputStream>>>,
}

impl TaskCache {
    /// `fresh` marks an attempt that starts with a trial connect (no
    /// usable breakpoint); a resumed attempt has its split already.
    pub fn new(fresh: bool) -> Arc<Self> {
        Arc::new(Self {
            user_canceled: AtomicBool::new(false),
            error_interrupted: AtomicBool::new(false),
            precondition_failed: AtomicBool::new(false),
            server_canceled: AtomicBool::new(false),
            pre_allocate_failed: AtomicBool::new(false),
            unknown_error: AtomicBool::new(false),
            first_connect_pending: AtomicBool::new(fresh),
            gate: Mutex::new(!fresh),
            gate_signal: Condvar::new(),
            output: Mutex::new(None),
        })
    }

    /// Whether chains should stop at their next checkpoint.
    pub fn is_interrupted(&self) -> bool {
        self.user_canceled.load(Ordering::Acquire) || self.error_interrupted.load(Ordering::Acquire)
    }

    pub fn is_user_canceled(&self) -> bool {
        self.user_canceled.load(Ordering::Acquire)
    }

    pub fn set_user_canceled(&self) {
        self.user_canceled.store(true, Ordering::Release);
        self.open_gate();
    }

    pub fn is_server_canceled(&self) -> bool {
        self.server_canceled.load(Ordering::Acquire)
    }

    pub fn is_precondition_failed(&self) -> bool {
        self.precondition_failed.load(Ordering::Acquire)
    }

    pub fn is_pre_allocate_failed(&self) -> bool {
        self.pre_allocate_failed.load(Ordering::Acquire)
    }

    /// Classifies a chain failure for the terminal callback and stops the
    /// sibling chains. The interrupt signal itself is never recorded.
    pub fn record_error(&self, err: &DownloadError) {
        match err {
            DownloadError::Interrupted => return,
            DownloadError::ResumeFailed(_) => {
                self.precondition_failed.store(true, Ordering::Release);
            }
            DownloadError::ServerCanceled { .. } => {
                self.server_canceled.store(true, Ordering::Release);
            }
            DownloadError::PreAllocate { .. } => {
                self.pre_allocate_failed.store(true, Ordering::Release);
            }
            _ => {
                self.unknown_error.store(true, Ordering::Release);
            }
        }
        self.error_interrupted.store(true, Ordering::Release);
        self.open_gate();
    }

    pub fn is_first_connect_pending(&self) -> bool {
        self.first_connect_pending.load(Ordering::Acquire)
    }

    pub fn finish_first_connect(&self) {
        self.first_connect_pending.store(false, Ordering::Release);
    }

    /// Opens the split gate, waking anything parked in
    /// [`TaskCache::wait_for_split`]. Idempotent; also called on error
    /// and cancel paths so waiters never hang.
    pub fn open_gate(&self) {
        let mut open = self.gate.lock();
        if !*open {
            *open = true;
            self.gate_signal.notify_all();
        }
    }

    /// Parks until the first block's response has determined the final
    /// block split (or the attempt was interrupted).
    pub fn wait_for_split(&self) {
        let mut open = self.gate.lock();
        while !*open {
            self.gate_signal.wait(&mut open);
        }
    }

    pub fn set_output(&self, output: Arc<MultiPointOutputStream>) {
        *self.output.lock() = Some(output);
    }

    /// Shared output stream, once the first block (or the resume path)
    /// has created it.
    pub fn output(&self) -> Result<Arc<MultiPointOutputStream>, DownloadError> {
        self.output
            .lock()
            .clone()
            .ok_or_else(|| DownloadError::Protocol("output stream not ready".to_string()))
    }

    pub fn output_if_ready(&self) -> Option<Arc<MultiPointOutputStream>> {
        self.output.lock().clone()
    }
}
