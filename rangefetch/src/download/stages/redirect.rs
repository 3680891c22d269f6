//! Bounded redirect following.

use tracing::debug;

use crate::connection::Connected;
use crate::download::chain::{ConnectStage, DownloadChain};
use crate::error::DownloadError;

/// Maximum redirect hops before the chain gives up.
pub const MAX_REDIRECT_HOPS: usize = 10;

/// Whether a status code redirects the request elsewhere.
pub fn is_redirect(code: u16) -> bool {
    matches!(code, 300 | 301 | 302 | 303 | 307 | 308)
}

/// Follows `Location` headers by replaying the downstream negotiation
/// (header + call-server) against each new URL, bounded at
/// [`MAX_REDIRECT_HOPS`]. A redirect without `Location` is a protocol
/// error.
pub struct RedirectStage;

impl ConnectStage for RedirectStage {
    fn intercept_connect(
        &self,
        chain: &mut DownloadChain,
    ) -> Result<Box<dyn Connected>, DownloadError> {
        let downstream = chain.connect_stage_index();
        let mut hops = 0usize;
        loop {
            let connected = chain.process_connect()?;
            let code = connected.response_code();
            if !is_redirect(code) {
                return Ok(connected);
            }

            hops += 1;
            if hops > MAX_REDIRECT_HOPS {
                return Err(DownloadError::Protocol(format!(
                    "redirect limit of {MAX_REDIRECT_HOPS} hops exceeded"
                )));
            }
            let location = connected.header("Location").ok_or_else(|| {
                DownloadError::Protocol(format!("redirect {code} without Location header"))
            })?;
            debug!(block_index = chain.block_index, hops, code, location, "following redirect");
            chain.redirect_to(location);
            chain.rewind_connect_to(downstream);
        }
    }
}
