//! Task admission, deduplication, and scheduling.

use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use tracing::{debug, info as log_info, warn};

use crate::download::call::DownloadCall;
use crate::download::listener::DownloadListener;
use crate::download::task::DownloadTask;
use crate::engine::EngineContext;
use crate::error::{DownloadError, EndCause};

/// Default cap on concurrently running tasks.
pub const DEFAULT_MAX_PARALLEL_RUNNING: usize = 15;

struct DispatcherState {
    /// Queued calls ordered by descending priority, FIFO within a
    /// priority.
    ready: Vec<Arc<DownloadCall>>,
    running: Vec<Arc<DownloadCall>>,
    shutdown: bool,
}

/// Schedules accepted tasks onto worker threads.
///
/// Admission rejects duplicates before anything is queued: a submission
/// matching a queued or running task's identity ends immediately with
/// [`EndCause::SameTaskBusy`]; one targeting the same resolved file path
/// as a different in-flight task ends with [`EndCause::FileBusy`]. The
/// running set is capped; the ready queue is unbounded.
pub struct DownloadDispatcher {
    ctx: Arc<EngineContext>,
    max_parallel_running: usize,
    state: Mutex<DispatcherState>,
}

impl DownloadDispatcher {
    pub(crate) fn new(ctx: Arc<EngineContext>, max_parallel_running: usize) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            max_parallel_running: max_parallel_running.max(1),
            state: Mutex::new(DispatcherState {
                ready: Vec::new(),
                running: Vec::new(),
                shutdown: false,
            }),
        })
    }

    /// Admits a task for asynchronous execution, returning its assigned
    /// id. Conflicting submissions get their terminal callback before
    /// this returns.
    pub fn enqueue(
        self: &Arc<Self>,
        mut task: DownloadTask,
        listener: Arc<dyn DownloadListener>,
    ) -> Result<u32, DownloadError> {
        task.id = self.ctx.store.find_or_create_id(&task)?;
        let task = Arc::new(task);
        let call = DownloadCall::new(
            Arc::clone(&task),
            Arc::clone(&listener),
            Arc::clone(&self.ctx),
            Arc::downgrade(self),
        );

        let spawn_now = {
            let mut state = self.state.lock();
            if state.shutdown {
                return Err(DownloadError::Protocol("dispatcher is shut down".to_string()));
            }
            if let Some(cause) = conflict_cause(&state, &task) {
                drop(state);
                debug!(task_id = task.id(), ?cause, "rejecting conflicting submission");
                listener.task_end(&task, cause, None);
                return Ok(task.id());
            }
            if state.running.len() < self.max_parallel_running {
                state.running.push(Arc::clone(&call));
                true
            } else {
                insert_by_priority(&mut state.ready, Arc::clone(&call));
                false
            }
        };

        if spawn_now {
            self.spawn_call(call);
        }
        Ok(task.id())
    }

    /// Runs a task synchronously on the caller's thread. Subject to the
    /// same conflict checks as [`DownloadDispatcher::enqueue`] but not to
    /// the running-set cap.
    pub fn execute(
        self: &Arc<Self>,
        mut task: DownloadTask,
        listener: Arc<dyn DownloadListener>,
    ) -> Result<(EndCause, Option<DownloadError>), DownloadError> {
        task.id = self.ctx.store.find_or_create_id(&task)?;
        let task = Arc::new(task);
        let call = DownloadCall::new(
            Arc::clone(&task),
            Arc::clone(&listener),
            Arc::clone(&self.ctx),
            Arc::downgrade(self),
        );

        {
            let mut state = self.state.lock();
            if state.shutdown {
                return Err(DownloadError::Protocol("dispatcher is shut down".to_string()));
            }
            if let Some(cause) = conflict_cause(&state, &task) {
                drop(state);
                listener.task_end(&task, cause, None);
                return Ok((cause, None));
            }
            state.running.push(Arc::clone(&call));
        }

        let outcome = call.execute();
        self.finish(&call);
        Ok(outcome)
    }

    fn spawn_call(self: &Arc<Self>, call: Arc<DownloadCall>) {
        let dispatcher = Arc::clone(self);
        let task_id = call.task().id();
        let spawned = thread::Builder::new()
            .name(format!("rangefetch-task-{task_id}"))
            .spawn(move || {
                call.execute();
                dispatcher.finish(&call);
            });
        if let Err(err) = spawned {
            warn!(task_id, %err, "failed to spawn task thread");
            let mut state = self.state.lock();
            state.running.retain(|running| running.task().id() != task_id);
        }
    }

    /// Retires a finished call and promotes ready tasks into freed
    /// capacity.
    fn finish(self: &Arc<Self>, call: &Arc<DownloadCall>) {
        let promoted = {
            let mut state = self.state.lock();
            state.running.retain(|running| !Arc::ptr_eq(running, call));
            let mut promoted = Vec::new();
            while state.running.len() < self.max_parallel_running && !state.ready.is_empty() {
                let next = state.ready.remove(0);
                state.running.push(Arc::clone(&next));
                promoted.push(next);
            }
            promoted
        };
        for next in promoted {
            debug!(task_id = next.task().id(), "promoting ready task");
            self.spawn_call(next);
        }
    }

    /// Cancels the task with this id. A ready task is removed and ended
    /// immediately; a running one is signaled and winds down on its own.
    /// Returns false when the id is not in flight.
    pub fn cancel(&self, task_id: u32) -> bool {
        let (ended, signaled) = {
            let mut state = self.state.lock();
            let before = state.ready.len();
            let mut ended = Vec::new();
            state.ready.retain(|call| {
                if call.task().id() == task_id {
                    ended.push(Arc::clone(call));
                    false
                } else {
                    true
                }
            });
            debug_assert!(state.ready.len() + ended.len() == before);
            let signaled: Vec<_> = state
                .running
                .iter()
                .filter(|call| call.task().id() == task_id)
                .cloned()
                .collect();
            (ended, signaled)
        };

        for call in &ended {
            call.end_without_running(EndCause::Canceled);
        }
        for call in &signaled {
            call.cancel();
        }
        !ended.is_empty() || !signaled.is_empty()
    }

    /// Cancels everything in flight.
    pub fn cancel_all(&self) {
        let (ended, signaled) = {
            let mut state = self.state.lock();
            (
                std::mem::take(&mut state.ready),
                state.running.clone(),
            )
        };
        log_info!(
            ready = ended.len(),
            running = signaled.len(),
            "canceling all tasks"
        );
        for call in &ended {
            call.end_without_running(EndCause::Canceled);
        }
        for call in &signaled {
            call.cancel();
        }
    }

    /// Stops intake and returns the not-yet-started tasks without running
    /// them. Already-running tasks keep going.
    pub fn shutdown(&self) -> Vec<Arc<DownloadTask>> {
        let drained = {
            let mut state = self.state.lock();
            state.shutdown = true;
            std::mem::take(&mut state.ready)
        };
        drained.iter().map(|call| Arc::clone(call.task())).collect()
    }

    /// Whether a *different* in-flight task already owns this task's
    /// resolved file path. Used once a response-determined filename makes
    /// the path final.
    pub fn is_file_conflict_after_run(&self, task: &DownloadTask) -> bool {
        let path = match task.file_path() {
            Some(path) => path,
            None => return false,
        };
        let state = self.state.lock();
        state
            .running
            .iter()
            .chain(state.ready.iter())
            .any(|call| call.task().id() != task.id() && call.task().file_path() == Some(path.clone()))
    }
}

fn conflict_cause(state: &DispatcherState, task: &DownloadTask) -> Option<EndCause> {
    for call in state.running.iter().chain(state.ready.iter()) {
        let existing = call.task();
        if existing.compare_ignore_id(task) {
            return Some(EndCause::SameTaskBusy);
        }
        if let (Some(a), Some(b)) = (existing.file_path(), task.file_path()) {
            if a == b {
                return Some(EndCause::FileBusy);
            }
        }
    }
    None
}

fn insert_by_priority(ready: &mut Vec<Arc<DownloadCall>>, call: Arc<DownloadCall>) {
    let priority = call.task().priority();
    let position = ready
        .iter()
        .position(|queued| queued.task().priority() < priority)
        .unwrap_or(ready.len());
    ready.insert(position, call);
}
