//! The ordered stage pipelines.
//!
//! Connect: retry → breakpoint → redirect → header → call-server.
//! Fetch (looped): retry → breakpoint → fetch-data.

pub mod breakpoint;
pub mod call_server;
pub mod fetch_data;
pub mod header;
pub mod redirect;
pub mod retry;

use std::sync::Arc;

use crate::download::chain::{ConnectStage, FetchStage};

pub(crate) fn connect_pipeline() -> Arc<[Arc<dyn ConnectStage>]> {
    Arc::from(vec![
        Arc::new(retry::RetryStage) as Arc<dyn ConnectStage>,
        Arc::new(breakpoint::BreakpointStage),
        Arc::new(redirect::RedirectStage),
        Arc::new(header::HeaderStage),
        Arc::new(call_server::CallServerStage),
    ])
}

pub(crate) fn fetch_pipeline() -> Arc<[Arc<dyn FetchStage>]> {
    Arc::from(vec![
        Arc::new(retry::RetryStage) as Arc<dyn FetchStage>,
        Arc::new(breakpoint::BreakpointStage),
        Arc::new(fetch_data::FetchDataStage),
    ])
}
