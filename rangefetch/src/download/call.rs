//! Whole-task orchestration: one call per accepted submission.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{debug, info as log_info, warn};

use crate::breakpoint::block::BlockInfo;
use crate::breakpoint::info::BreakpointInfo;
use crate::dispatcher::DownloadDispatcher;
use crate::download::cache::TaskCache;
use crate::download::chain::{ChainContext, DownloadChain};
use crate::download::listener::DownloadListener;
use crate::download::task::DownloadTask;
use crate::engine::EngineContext;
use crate::error::{DownloadError, EndCause, ResumeFailedCause};
use crate::file::multi_point::MultiPointOutputStream;
use crate::strategy;

/// One accepted submission being (or about to be) executed. Owns the
/// restart-from-beginning retry and the terminal-cause resolution; block
/// level work is delegated to per-block chains on named worker threads.
pub struct DownloadCall {
    task: Arc<DownloadTask>,
    listener: Arc<dyn DownloadListener>,
    ctx: Arc<EngineContext>,
    dispatcher: Weak<DownloadDispatcher>,
    attempt_cache: Mutex<Option<Arc<TaskCache>>>,
    canceled: AtomicBool,
}

impl DownloadCall {
    pub(crate) fn new(
        task: Arc<DownloadTask>,
        listener: Arc<dyn DownloadListener>,
        ctx: Arc<EngineContext>,
        dispatcher: Weak<DownloadDispatcher>,
    ) -> Arc<Self> {
        Arc::new(Self {
            task,
            listener,
            ctx,
            dispatcher,
            attempt_cache: Mutex::new(None),
            canceled: AtomicBool::new(false),
        })
    }

    pub fn task(&self) -> &Arc<DownloadTask> {
        &self.task
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    /// Requests cancellation; the running attempt observes it at its next
    /// checkpoint.
    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::Release);
        if let Some(cache) = self.attempt_cache.lock().clone() {
            cache.set_user_canceled();
        }
    }

    /// Terminal callback for a call that never started running (canceled
    /// while queued).
    pub(crate) fn end_without_running(&self, cause: EndCause) {
        self.canceled.store(true, Ordering::Release);
        self.listener.task_end(&self.task, cause, None);
    }

    /// Runs the task to its terminal state and reports it. Exactly one
    /// `task_end` is emitted per call.
    pub fn execute(&self) -> (EndCause, Option<DownloadError>) {
        self.listener.task_start(&self.task);
        let outcome = self.run();

        let (cause, error) = match outcome {
            Ok(()) => (EndCause::Completed, None),
            Err(DownloadError::Interrupted) => (EndCause::Canceled, None),
            Err(DownloadError::FileBusyAfterRun) => (EndCause::FileBusy, None),
            Err(err @ DownloadError::PreAllocate { .. }) => {
                (EndCause::PreAllocateFailed, Some(err))
            }
            Err(err) => (EndCause::Error, Some(err)),
        };

        if cause == EndCause::Completed {
            if let Err(err) = self.ctx.store.complete_download(self.task.id()) {
                warn!(task_id = self.task.id(), %err, "failed to purge completed record");
            }
        }

        log_info!(task_id = self.task.id(), ?cause, "task ended");
        self.listener.task_end(&self.task, cause, error.as_ref());
        (cause, error)
    }

    fn run(&self) -> Result<(), DownloadError> {
        if self.task.filename().is_none() {
            if let Some(name) = self.ctx.store.find_response_filename(self.task.url()) {
                debug!(task_id = self.task.id(), name, "reusing filename from earlier response");
                self.task.set_filename(&name);
            }
        }

        let mut forced_restart: Option<ResumeFailedCause> = None;
        let mut restarted = false;
        loop {
            let result = self.run_attempt(forced_restart.take());
            match result {
                Err(DownloadError::ResumeFailed(cause)) if !restarted && !self.is_canceled() => {
                    restarted = true;
                    forced_restart = Some(cause);
                }
                Err(DownloadError::ServerCanceled { code, offset })
                    if offset > 0 && !restarted && !self.is_canceled() =>
                {
                    debug!(code, offset, "server refused mid-range; restarting from zero");
                    restarted = true;
                    forced_restart = Some(ResumeFailedCause::ResponsePreconditionFailed);
                }
                other => return other,
            }
        }
    }

    /// One attempt: either resume from the persisted record or start
    /// fresh with a trial connect that settles the block split.
    fn run_attempt(&self, forced_restart: Option<ResumeFailedCause>) -> Result<(), DownloadError> {
        let store = &self.ctx.store;
        let info = match store.get(self.task.id()) {
            Some(info) => info,
            None => store.create_and_insert(&self.task)?,
        };

        let check = match forced_restart {
            Some(cause) => strategy::ResumeCheck::NotAvailable(cause),
            None => strategy::check_local_resume(
                &self.task,
                &info,
                self.ctx.output_factory.supports_seek(),
                self.ctx.pre_allocate && self.ctx.output_factory.supports_pre_allocate(),
            ),
        };

        match check {
            strategy::ResumeCheck::Available => self.run_from_breakpoint(info),
            strategy::ResumeCheck::NotAvailable(cause) => self.run_from_beginning(info, cause),
        }
    }

    fn run_from_breakpoint(&self, info: Arc<BreakpointInfo>) -> Result<(), DownloadError> {
        strategy::reset_block_if_dirty(&info);
        log_info!(
            task_id = self.task.id(),
            offset = info.total_offset(),
            total = info.total_length(),
            "resuming from breakpoint"
        );
        self.listener.download_from_breakpoint(&self.task, &info);

        let cache = TaskCache::new(false);
        self.install_cache(&cache)?;

        let path = info
            .target_path()
            .ok_or_else(|| DownloadError::Protocol("resumable record has no path".to_string()))?;
        let output = MultiPointOutputStream::new(
            Arc::clone(&info),
            Arc::clone(&self.ctx.store),
            Arc::clone(&self.ctx.output_factory),
            path,
            self.task.flush_buffer_size(),
            self.task.sync_buffer_size(),
            self.task.sync_buffer_interval(),
            self.ctx.pre_allocate,
        );
        cache.set_output(output);

        let chain_ctx = self.chain_context(&info, &cache);
        let mut handles = Vec::new();
        for (index, block) in info.blocks_snapshot().iter().enumerate() {
            if !block.is_chunked() && block.current_offset() >= block.content_length() {
                continue;
            }
            handles.push(self.spawn_chain(index, &chain_ctx)?);
        }
        self.join_chains(handles, &cache)
    }

    fn run_from_beginning(
        &self,
        info: Arc<BreakpointInfo>,
        cause: ResumeFailedCause,
    ) -> Result<(), DownloadError> {
        log_info!(task_id = self.task.id(), %cause, "starting from the beginning");
        self.listener.download_from_beginning(&self.task, cause);

        info.reset_info();
        // Placeholder block for the trial connect; the response settles
        // the real split.
        info.add_block(BlockInfo::new(0, 0));
        self.ctx.store.update(&info)?;

        let cache = TaskCache::new(true);
        self.install_cache(&cache)?;
        let chain_ctx = self.chain_context(&info, &cache);

        let mut handles = vec![self.spawn_chain(0, &chain_ctx)?];
        cache.wait_for_split();

        if !cache.is_interrupted() && !cache.is_first_connect_pending() {
            for index in 1..info.block_count() {
                handles.push(self.spawn_chain(index, &chain_ctx)?);
            }
        }
        self.join_chains(handles, &cache)
    }

    fn chain_context(&self, info: &Arc<BreakpointInfo>, cache: &Arc<TaskCache>) -> Arc<ChainContext> {
        Arc::new(ChainContext {
            task: Arc::clone(&self.task),
            info: Arc::clone(info),
            cache: Arc::clone(cache),
            store: Arc::clone(&self.ctx.store),
            connection_factory: Arc::clone(&self.ctx.connection_factory),
            output_factory: Arc::clone(&self.ctx.output_factory),
            network_policy: Arc::clone(&self.ctx.network_policy),
            listener: Arc::clone(&self.listener),
            dispatcher: Weak::clone(&self.dispatcher),
            pre_allocate: self.ctx.pre_allocate,
        })
    }

    fn install_cache(&self, cache: &Arc<TaskCache>) -> Result<(), DownloadError> {
        *self.attempt_cache.lock() = Some(Arc::clone(cache));
        if self.is_canceled() {
            cache.set_user_canceled();
            return Err(DownloadError::Interrupted);
        }
        Ok(())
    }

    fn spawn_chain(
        &self,
        block_index: usize,
        chain_ctx: &Arc<ChainContext>,
    ) -> Result<JoinHandle<Result<(), DownloadError>>, DownloadError> {
        let ctx = Arc::clone(chain_ctx);
        let handle = thread::Builder::new()
            .name(format!("rangefetch-block-{}-{}", self.task.id(), block_index))
            .spawn(move || DownloadChain::new(block_index, ctx).run())?;
        Ok(handle)
    }

    fn join_chains(
        &self,
        handles: Vec<JoinHandle<Result<(), DownloadError>>>,
        cache: &Arc<TaskCache>,
    ) -> Result<(), DownloadError> {
        let mut errors = Vec::new();
        for handle in handles {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(err)) => errors.push(err),
                Err(_) => errors.push(DownloadError::Protocol(
                    "block worker thread panicked".to_string(),
                )),
            }
        }
        if let Some(output) = cache.output_if_ready() {
            output.cancel();
        }

        if cache.is_user_canceled() {
            return Err(DownloadError::Interrupted);
        }
        if let Some(err) = pick_primary_error(errors) {
            return Err(err);
        }
        Ok(())
    }
}

/// Chooses the error that best explains the attempt's failure: resume
/// ineligibility and server refusals drive the restart logic, so they
/// outrank secondary failures; interrupt signals from sibling shutdown
/// are noise.
fn pick_primary_error(errors: Vec<DownloadError>) -> Option<DownloadError> {
    let mut fallback = None;
    for err in errors {
        match err {
            DownloadError::Interrupted => {}
            DownloadError::ResumeFailed(_) | DownloadError::ServerCanceled { .. } => {
                return Some(err)
            }
            other => {
                if fallback.is_none() {
                    fallback = Some(other);
                }
            }
        }
    }
    fallback
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primary_error_prefers_restart_drivers() {
        let picked = pick_primary_error(vec![
            DownloadError::Interrupted,
            DownloadError::Protocol("secondary".to_string()),
            DownloadError::ServerCanceled { code: 200, offset: 7 },
        ]);
        assert!(matches!(
            picked,
            Some(DownloadError::ServerCanceled { code: 200, offset: 7 })
        ));
    }

    #[test]
    fn test_interrupts_alone_are_not_errors() {
        assert!(pick_primary_error(vec![DownloadError::Interrupted]).is_none());
        assert!(pick_primary_error(Vec::new()).is_none());
    }
}
