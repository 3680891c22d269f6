//! Engine assembly: configuration and the public task surface.

use std::sync::Arc;

use crate::breakpoint::memory::MemoryBreakpointStore;
use crate::breakpoint::store::BreakpointStore;
use crate::connection::http::HttpConnectionFactory;
use crate::connection::ConnectionFactory;
use crate::dispatcher::{DownloadDispatcher, DEFAULT_MAX_PARALLEL_RUNNING};
use crate::download::listener::DownloadListener;
use crate::download::task::DownloadTask;
use crate::error::{DownloadError, EndCause};
use crate::file::output::{FileOutputStreamFactory, OutputStreamFactory};

/// Gate consulted before any request goes on the wire. Embedders hook
/// metered-network or offline constraints here; the engine only supplies
/// the task (including its `wifi_required` flag).
pub trait NetworkPolicy: Send + Sync {
    fn check(&self, task: &DownloadTask) -> Result<(), DownloadError>;
}

/// Policy that permits every request.
pub struct AllowAllPolicy;

impl NetworkPolicy for AllowAllPolicy {
    fn check(&self, _task: &DownloadTask) -> Result<(), DownloadError> {
        Ok(())
    }
}

/// Collaborators shared by every call the engine runs.
pub(crate) struct EngineContext {
    pub store: Arc<dyn BreakpointStore>,
    pub connection_factory: Arc<dyn ConnectionFactory>,
    pub output_factory: Arc<dyn OutputStreamFactory>,
    pub network_policy: Arc<dyn NetworkPolicy>,
    pub pre_allocate: bool,
}

/// The download engine. All collaborators are injected explicitly; two
/// engines in one process are fully independent.
///
/// # Example
///
/// ```ignore
/// let engine = Engine::builder()
///     .store(Arc::new(JournalBreakpointStore::open("/var/lib/app/breakpoints.json")?))
///     .build()?;
/// let task = DownloadTask::builder("https://example.com/big.iso", "/downloads").build();
/// let id = engine.enqueue(task, Arc::new(NoopListener))?;
/// ```
pub struct Engine {
    store: Arc<dyn BreakpointStore>,
    dispatcher: Arc<DownloadDispatcher>,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder {
            store: None,
            connection_factory: None,
            output_factory: None,
            network_policy: None,
            pre_allocate: true,
            max_parallel_running: DEFAULT_MAX_PARALLEL_RUNNING,
        }
    }

    /// Submits a task for asynchronous execution and returns its assigned
    /// id.
    pub fn enqueue(
        &self,
        task: DownloadTask,
        listener: Arc<dyn DownloadListener>,
    ) -> Result<u32, DownloadError> {
        self.dispatcher.enqueue(task, listener)
    }

    /// Runs a task to completion on the caller's thread and returns its
    /// terminal cause.
    pub fn execute(
        &self,
        task: DownloadTask,
        listener: Arc<dyn DownloadListener>,
    ) -> Result<(EndCause, Option<DownloadError>), DownloadError> {
        self.dispatcher.execute(task, listener)
    }

    /// Cancels the task with this id; returns false when it is not in
    /// flight.
    pub fn cancel(&self, task_id: u32) -> bool {
        self.dispatcher.cancel(task_id)
    }

    pub fn cancel_all(&self) {
        self.dispatcher.cancel_all()
    }

    /// Stops intake and returns tasks that never started.
    pub fn shutdown(&self) -> Vec<Arc<DownloadTask>> {
        self.dispatcher.shutdown()
    }

    pub fn store(&self) -> &Arc<dyn BreakpointStore> {
        &self.store
    }
}

/// Builder for [`Engine`]. Defaults: in-memory store, shared blocking
/// HTTP client, regular-file output, allow-all policy, pre-allocation
/// on, running cap of 15.
pub struct EngineBuilder {
    store: Option<Arc<dyn BreakpointStore>>,
    connection_factory: Option<Arc<dyn ConnectionFactory>>,
    output_factory: Option<Arc<dyn OutputStreamFactory>>,
    network_policy: Option<Arc<dyn NetworkPolicy>>,
    pre_allocate: bool,
    max_parallel_running: usize,
}

impl EngineBuilder {
    pub fn store(mut self, store: Arc<dyn BreakpointStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn connection_factory(mut self, factory: Arc<dyn ConnectionFactory>) -> Self {
        self.connection_factory = Some(factory);
        self
    }

    pub fn output_factory(mut self, factory: Arc<dyn OutputStreamFactory>) -> Self {
        self.output_factory = Some(factory);
        self
    }

    pub fn network_policy(mut self, policy: Arc<dyn NetworkPolicy>) -> Self {
        self.network_policy = Some(policy);
        self
    }

    /// Whether to extend the target file to its final length before
    /// multi-block writes begin. Ignored by backends that cannot.
    pub fn pre_allocate(mut self, pre_allocate: bool) -> Self {
        self.pre_allocate = pre_allocate;
        self
    }

    pub fn max_parallel_running(mut self, cap: usize) -> Self {
        self.max_parallel_running = cap;
        self
    }

    pub fn build(self) -> Result<Engine, DownloadError> {
        let store = match self.store {
            Some(store) => store,
            None => Arc::new(MemoryBreakpointStore::new()),
        };
        let connection_factory = match self.connection_factory {
            Some(factory) => factory,
            None => Arc::new(HttpConnectionFactory::new()?),
        };
        let ctx = Arc::new(EngineContext {
            store: Arc::clone(&store),
            connection_factory,
            output_factory: self
                .output_factory
                .unwrap_or_else(|| Arc::new(FileOutputStreamFactory)),
            network_policy: self
                .network_policy
                .unwrap_or_else(|| Arc::new(AllowAllPolicy)),
            pre_allocate: self.pre_allocate,
        });
        Ok(Engine {
            store,
            dispatcher: DownloadDispatcher::new(ctx, self.max_parallel_running),
        })
    }
}
