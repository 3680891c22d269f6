//! Terminal connect stage: policy gate and the actual request.

use std::sync::Arc;

use crate::connection::Connected;
use crate::download::chain::{ConnectStage, DownloadChain};
use crate::error::DownloadError;

/// Checks the network policy, then executes the request that the header
/// stage assembled.
pub struct CallServerStage;

impl ConnectStage for CallServerStage {
    fn intercept_connect(
        &self,
        chain: &mut DownloadChain,
    ) -> Result<Box<dyn Connected>, DownloadError> {
        let ctx = Arc::clone(&chain.ctx);
        ctx.network_policy.check(&ctx.task)?;
        chain.connection()?.execute()
    }
}
