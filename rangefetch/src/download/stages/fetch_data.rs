//! Innermost fetch stage: one buffer from the wire to the file.

use crate::download::chain::{DownloadChain, FetchStage};
use crate::error::DownloadError;

/// Reads one buffer from the response body, writes it at the block's
/// absolute offset, and accumulates bytes toward the next throttled
/// progress callback. Returns zero when the body is exhausted.
pub struct FetchDataStage;

impl FetchStage for FetchDataStage {
    fn intercept_fetch(&self, chain: &mut DownloadChain) -> Result<u64, DownloadError> {
        if chain.ctx.cache.is_interrupted() {
            return Err(DownloadError::Interrupted);
        }
        chain.fetch_one()
    }
}
