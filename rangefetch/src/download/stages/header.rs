//! Request header assembly and response verdict interpretation.

use std::sync::Arc;

use tracing::debug;

use crate::connection::Connected;
use crate::download::chain::{ConnectStage, DownloadChain};
use crate::download::stages::redirect::is_redirect;
use crate::error::{DownloadError, ResumeFailedCause};
use crate::strategy;

/// Attaches user headers, the block's `Range`, and `If-Match` when a
/// validator is known; after the response arrives it interprets the
/// server's verdict (precondition failures, ignored ranges) and settles
/// the effective content length. Redirect responses pass through
/// untouched for the redirect stage above to handle.
pub struct HeaderStage;

impl ConnectStage for HeaderStage {
    fn intercept_connect(
        &self,
        chain: &mut DownloadChain,
    ) -> Result<Box<dyn Connected>, DownloadError> {
        let ctx = Arc::clone(&chain.ctx);
        let info = &ctx.info;
        let block_index = chain.block_index;
        let block = info
            .block(block_index)
            .ok_or_else(|| DownloadError::Protocol(format!("no block at index {block_index}")))?;

        let trial = block_index == 0 && ctx.cache.is_first_connect_pending();
        let range = if trial || block.is_chunked() {
            "bytes=0-".to_string()
        } else if info.is_last_block(block_index) {
            format!("bytes={}-", block.range_left())
        } else {
            format!("bytes={}-{}", block.range_left(), block.range_right())
        };
        let etag = info.etag();

        {
            let connection = chain.connection()?;
            for (name, value) in ctx.task.headers() {
                connection.add_header(name, value);
            }
            connection.add_header("Range", &range);
            if let Some(etag) = &etag {
                connection.add_header("If-Match", etag);
            }
        }
        debug!(block_index, %range, if_match = etag.as_deref(), "sending ranged request");

        let connected = chain.process_connect()?;
        let code = connected.response_code();
        if is_redirect(code) {
            return Ok(connected);
        }

        let response_etag = connected.header("ETag");
        if let Some(cause) = strategy::precondition_failed_cause(
            code,
            info.total_offset(),
            etag.as_deref(),
            response_etag.as_deref(),
        ) {
            if cause == ResumeFailedCause::ResponsePreconditionFailed && info.total_offset() == 0 {
                // Nothing to protect; drop the validator and renegotiate
                // unconditionally.
                info.set_etag(None);
                return Err(DownloadError::RetryConnect(
                    "precondition failed with no progress",
                ));
            }
            return Err(DownloadError::ResumeFailed(cause));
        }

        if strategy::is_server_canceled(code, block.current_offset() != 0) {
            return Err(DownloadError::ServerCanceled {
                code,
                offset: info.total_offset(),
            });
        }

        if info.etag().is_none() {
            if let Some(served) = response_etag {
                info.set_etag(Some(&served));
            }
        }

        let content_length = strategy::determine_content_length(
            connected.header("Content-Length").as_deref(),
            connected.header("Content-Range").as_deref(),
        );
        chain.set_response_content_length(content_length);
        Ok(connected)
    }
}
