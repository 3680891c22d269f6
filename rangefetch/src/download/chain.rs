//! Per-block execution context driving the connect and fetch pipelines.

use std::sync::{Arc, Weak};
use std::time::Instant;

use crate::breakpoint::info::BreakpointInfo;
use crate::breakpoint::store::BreakpointStore;
use crate::connection::{Connected, Connection, ConnectionFactory};
use crate::dispatcher::DownloadDispatcher;
use crate::download::cache::TaskCache;
use crate::download::listener::DownloadListener;
use crate::download::stages;
use crate::download::task::DownloadTask;
use crate::engine::NetworkPolicy;
use crate::error::DownloadError;
use crate::file::output::OutputStreamFactory;

/// One stage of the connect pipeline. Stages either delegate downstream
/// via [`DownloadChain::process_connect`] or short-circuit with an error.
pub trait ConnectStage: Send + Sync {
    fn intercept_connect(
        &self,
        chain: &mut DownloadChain,
    ) -> Result<Box<dyn Connected>, DownloadError>;
}

/// One stage of the fetch pipeline. Returns the bytes consumed in this
/// iteration; zero means the response body is exhausted.
pub trait FetchStage: Send + Sync {
    fn intercept_fetch(&self, chain: &mut DownloadChain) -> Result<u64, DownloadError>;
}

/// Everything shared by the block chains of one download attempt.
pub struct ChainContext {
    pub task: Arc<DownloadTask>,
    pub info: Arc<BreakpointInfo>,
    pub cache: Arc<TaskCache>,
    pub store: Arc<dyn BreakpointStore>,
    pub connection_factory: Arc<dyn ConnectionFactory>,
    pub output_factory: Arc<dyn OutputStreamFactory>,
    pub network_policy: Arc<dyn NetworkPolicy>,
    pub listener: Arc<dyn DownloadListener>,
    pub dispatcher: Weak<DownloadDispatcher>,
    pub pre_allocate: bool,
}

/// Mutable per-block state threaded through the pipeline stages.
///
/// State machine per block: connecting (with bounded redirect hops),
/// headers exchanged, fetching in a loop, complete; any state may fail,
/// and only the retry stage transitions a failed negotiation back to
/// connecting.
pub struct DownloadChain {
    pub(crate) block_index: usize,
    pub(crate) ctx: Arc<ChainContext>,
    current_url: String,
    connection: Option<Box<dyn Connection>>,
    connected: Option<Box<dyn Connected>>,
    response_content_length: u64,
    connect_stages: Arc<[Arc<dyn ConnectStage>]>,
    fetch_stages: Arc<[Arc<dyn FetchStage>]>,
    connect_index: usize,
    fetch_index: usize,
    read_buffer: Vec<u8>,
    callback_bytes: u64,
    last_progress: Instant,
}

impl DownloadChain {
    pub fn new(block_index: usize, ctx: Arc<ChainContext>) -> Self {
        let read_buffer = vec![0u8; ctx.task.read_buffer_size()];
        let current_url = ctx.task.url().to_string();
        Self {
            block_index,
            ctx,
            current_url,
            connection: None,
            connected: None,
            response_content_length: 0,
            connect_stages: stages::connect_pipeline(),
            fetch_stages: stages::fetch_pipeline(),
            connect_index: 0,
            fetch_index: 0,
            read_buffer,
            callback_bytes: 0,
            last_progress: Instant::now(),
        }
    }

    /// Runs the block to completion: connect pipeline once (internally
    /// retried/redirected), then the fetch pipeline until the body is
    /// drained.
    pub fn run(&mut self) -> Result<(), DownloadError> {
        let task = Arc::clone(&self.ctx.task);
        self.ctx.listener.connect_start(&task, self.block_index);

        self.connect_index = 0;
        let connected = self.process_connect()?;
        let response_code = connected.response_code();
        self.connected = Some(connected);
        self.ctx
            .listener
            .connect_end(&task, self.block_index, response_code);

        self.ctx
            .listener
            .fetch_start(&task, self.block_index, self.response_content_length);
        self.fetch_index = 0;
        self.process_fetch()?;
        self.ctx.listener.fetch_end(&task, self.block_index);
        Ok(())
    }

    /// Invokes the next connect stage.
    pub fn process_connect(&mut self) -> Result<Box<dyn Connected>, DownloadError> {
        if self.ctx.cache.is_interrupted() {
            return Err(DownloadError::Interrupted);
        }
        let index = self.connect_index;
        let stage = Arc::clone(
            self.connect_stages
                .get(index)
                .ok_or_else(|| DownloadError::Protocol("connect pipeline exhausted".to_string()))?,
        );
        self.connect_index = index + 1;
        stage.intercept_connect(self)
    }

    /// Invokes the next fetch stage.
    pub fn process_fetch(&mut self) -> Result<u64, DownloadError> {
        let index = self.fetch_index;
        let stage = Arc::clone(
            self.fetch_stages
                .get(index)
                .ok_or_else(|| DownloadError::Protocol("fetch pipeline exhausted".to_string()))?,
        );
        self.fetch_index = index + 1;
        stage.intercept_fetch(self)
    }

    /// One iteration of the downstream fetch stages, with the pipeline
    /// position restored afterwards so the caller can loop.
    pub fn loop_fetch(&mut self) -> Result<u64, DownloadError> {
        let reset_to = self.fetch_index;
        let fetched = self.process_fetch()?;
        self.fetch_index = reset_to;
        Ok(fetched)
    }

    /// Rewinds the connect pipeline for a fresh negotiation; the retry
    /// stage itself (index 0) is not re-entered.
    pub fn reset_connect_for_retry(&mut self) {
        self.release_connection();
        self.current_url = self.ctx.task.url().to_string();
        self.connect_index = 1;
    }

    /// Rewinds the connect pipeline to the given stage index; used by the
    /// redirect stage to replay header negotiation against a new URL.
    pub fn rewind_connect_to(&mut self, stage_index: usize) {
        self.connect_index = stage_index;
    }

    pub fn connect_stage_index(&self) -> usize {
        self.connect_index
    }

    pub fn current_url(&self) -> &str {
        &self.current_url
    }

    pub fn redirect_to(&mut self, url: String) {
        self.release_connection();
        self.current_url = url;
    }

    /// The request under construction, created on first use.
    pub fn connection(&mut self) -> Result<&mut dyn Connection, DownloadError> {
        if self.connection.is_none() {
            self.connection = Some(self.ctx.connection_factory.create(&self.current_url)?);
        }
        match self.connection.as_deref_mut() {
            Some(connection) => Ok(connection),
            None => Err(DownloadError::Protocol("connection unavailable".to_string())),
        }
    }

    pub fn release_connection(&mut self) {
        self.connection = None;
        self.connected = None;
    }

    /// Effective content length of this block's response, set by the
    /// header stage.
    pub fn response_content_length(&self) -> u64 {
        self.response_content_length
    }

    pub fn set_response_content_length(&mut self, length: u64) {
        self.response_content_length = length;
    }

    /// Reads one buffer from the response body, writes it at this block's
    /// offset, and emits a throttled progress callback.
    pub fn fetch_one(&mut self) -> Result<u64, DownloadError> {
        let read = {
            let connected = self
                .connected
                .as_mut()
                .ok_or_else(|| DownloadError::Protocol("fetch before connect".to_string()))?;
            connected.body().read(&mut self.read_buffer)?
        };
        if read == 0 {
            self.flush_progress();
            return Ok(0);
        }

        let output = self.ctx.cache.output()?;
        output.write(self.block_index, &self.read_buffer[..read])?;

        self.callback_bytes += read as u64;
        if self.last_progress.elapsed() >= self.ctx.task.min_progress_interval() {
            self.flush_progress();
        }
        Ok(read as u64)
    }

    fn flush_progress(&mut self) {
        if self.callback_bytes > 0 {
            self.ctx
                .listener
                .fetch_progress(&self.ctx.task, self.block_index, self.callback_bytes);
            self.callback_bytes = 0;
        }
        self.last_progress = Instant::now();
    }
}
