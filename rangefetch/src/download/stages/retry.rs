//! Outermost stage: retry-signal handling and error bookkeeping.

use tracing::debug;

use crate::connection::Connected;
use crate::download::chain::{ConnectStage, DownloadChain, FetchStage};
use crate::error::DownloadError;

/// On connect, re-runs the pipeline whenever a downstream stage signals a
/// recoverable negotiation failure; real errors are recorded on the task
/// cache (stopping sibling blocks) and propagated. On fetch, there is no
/// retry loop: it guarantees the block's unsynced bytes are flushed and
/// its handle closed on every exit path.
pub struct RetryStage;

impl ConnectStage for RetryStage {
    fn intercept_connect(
        &self,
        chain: &mut DownloadChain,
    ) -> Result<Box<dyn Connected>, DownloadError> {
        loop {
            if chain.ctx.cache.is_interrupted() {
                return Err(DownloadError::Interrupted);
            }
            match chain.process_connect() {
                Ok(connected) => return Ok(connected),
                Err(DownloadError::RetryConnect(reason)) => {
                    debug!(block_index = chain.block_index, reason, "retrying connect");
                    chain.reset_connect_for_retry();
                }
                Err(err) => {
                    chain.ctx.cache.record_error(&err);
                    chain.release_connection();
                    return Err(err);
                }
            }
        }
    }
}

impl FetchStage for RetryStage {
    fn intercept_fetch(&self, chain: &mut DownloadChain) -> Result<u64, DownloadError> {
        let result = chain.process_fetch();
        if let Err(err) = &result {
            chain.ctx.cache.record_error(err);
        }
        if let Some(output) = chain.ctx.cache.output_if_ready() {
            // Flush whatever made it into the buffers; on the error path
            // a failed flush must not mask the original error.
            match output.ensure_sync_complete(chain.block_index) {
                Ok(()) => {}
                Err(sync_err) if result.is_ok() => {
                    output.close(chain.block_index);
                    chain.release_connection();
                    return Err(sync_err);
                }
                Err(_) => {}
            }
            output.close(chain.block_index);
        }
        chain.release_connection();
        result
    }
}
