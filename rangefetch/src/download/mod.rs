//! Task execution: the call orchestrator, per-block chains, the stage
//! pipelines, and the lifecycle listener surface.

pub mod cache;
pub mod call;
pub mod chain;
pub mod listener;
pub mod stages;
pub mod task;

pub use call::DownloadCall;
pub use chain::{ChainContext, ConnectStage, DownloadChain, FetchStage};
pub use listener::{DownloadListener, NoopListener};
pub use task::{DownloadTask, DownloadTaskBuilder};
