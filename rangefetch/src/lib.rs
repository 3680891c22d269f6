//! rangefetch - Resumable multi-connection HTTP(S) download engine
//!
//! Splits a resource into byte-range blocks fetched concurrently into one
//! target file, persists per-block progress crash-consistently so
//! interrupted downloads resume where they stopped, and validates resumes
//! against the server (ETag / precondition semantics). Tasks are
//! scheduled through a deduplicating dispatcher with priority ordering
//! and a running cap.

pub mod breakpoint;
pub mod connection;
pub mod dispatcher;
pub mod download;
pub mod engine;
pub mod error;
pub mod file;
pub mod speed;
pub mod strategy;

pub use breakpoint::{
    BlockInfo, BreakpointInfo, BreakpointStore, JournalBreakpointStore, MemoryBreakpointStore,
    StoreError, CHUNKED_CONTENT_LENGTH,
};
pub use connection::{Connected, Connection, ConnectionFactory, HttpConnectionFactory};
pub use dispatcher::DEFAULT_MAX_PARALLEL_RUNNING;
pub use download::{DownloadListener, DownloadTask, DownloadTaskBuilder, NoopListener};
pub use engine::{AllowAllPolicy, Engine, EngineBuilder, NetworkPolicy};
pub use error::{DownloadError, EndCause, ResumeFailedCause};
pub use file::{FileOutputStreamFactory, OutputStream, OutputStreamFactory};
pub use speed::SpeedCalculator;
