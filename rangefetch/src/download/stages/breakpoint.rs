//! Split decision on connect; drain loop and completeness check on fetch.

use std::sync::Arc;

use tracing::{debug, info as log_info};

use crate::breakpoint::block::{BlockInfo, CHUNKED_CONTENT_LENGTH};
use crate::connection::Connected;
use crate::download::chain::{ConnectStage, DownloadChain, FetchStage};
use crate::error::DownloadError;
use crate::file::multi_point::MultiPointOutputStream;
use crate::strategy;

/// On connect, the first block's response settles the resource shape:
/// validator, filename, chunked-ness, and the final block split. All
/// other blocks only exist after that decision (the task thread parks on
/// the cache gate until it is made). On fetch, drains the block and
/// verifies it fetched exactly what the response declared.
pub struct BreakpointStage;

impl ConnectStage for BreakpointStage {
    fn intercept_connect(
        &self,
        chain: &mut DownloadChain,
    ) -> Result<Box<dyn Connected>, DownloadError> {
        let connected = chain.process_connect()?;
        if chain.block_index == 0 && chain.ctx.cache.is_first_connect_pending() {
            settle_resource_shape(chain, connected.as_ref())?;
        }
        Ok(connected)
    }
}

/// Applies the trial response: determines filename and split, persists
/// the record, publishes the output stream, and opens the gate. For a
/// splittable resource the trial connection is discarded and the first
/// block reconnects with its own bounded range.
fn settle_resource_shape(
    chain: &mut DownloadChain,
    connected: &dyn Connected,
) -> Result<(), DownloadError> {
    let ctx = Arc::clone(&chain.ctx);
    let info = &ctx.info;

    if let Some(etag) = connected.header("ETag") {
        info.set_etag(Some(&etag));
    }

    if info.filename().is_none() {
        let served = match connected.header("Content-Disposition") {
            Some(value) => strategy::parse_content_disposition(&value)?,
            None => None,
        };
        let filename = strategy::determine_filename(served.as_deref(), ctx.task.url())?;
        debug!(filename, "determined target filename from response");
        info.set_filename(&filename);
        ctx.task.set_filename(&filename);
    }

    // The path is only now final; another running task may already own it.
    if let Some(dispatcher) = ctx.dispatcher.upgrade() {
        if dispatcher.is_file_conflict_after_run(&ctx.task) {
            return Err(DownloadError::FileBusyAfterRun);
        }
    }

    let total_length = chain.response_content_length();
    let chunked = total_length == CHUNKED_CONTENT_LENGTH;
    let accept_range = connected.response_code() == 206
        || connected
            .header("Accept-Ranges")
            .map(|value| value.trim().eq_ignore_ascii_case("bytes"))
            .unwrap_or(false);

    info.set_chunked(chunked);
    let splittable = strategy::is_use_multi_block(accept_range, total_length)
        && ctx.output_factory.supports_seek();
    let block_count = if splittable {
        strategy::determine_block_count(total_length)
    } else {
        1
    };

    if chunked {
        info.reset_block_infos();
        info.add_block(BlockInfo::new(0, CHUNKED_CONTENT_LENGTH));
    } else {
        strategy::split_into_blocks(info, total_length, block_count);
    }
    ctx.store.update(info)?;
    log_info!(
        task_id = ctx.task.id(),
        total_length,
        block_count = info.block_count(),
        chunked,
        "resource shape settled"
    );

    let path = info
        .target_path()
        .ok_or_else(|| DownloadError::Protocol("no target path after filename".to_string()))?;
    // A fresh start owns the whole range; a stale leftover would surface
    // as trailing garbage past the new length.
    if path.is_file() {
        std::fs::remove_file(&path)?;
    }
    let output = MultiPointOutputStream::new(
        Arc::clone(info),
        Arc::clone(&ctx.store),
        Arc::clone(&ctx.output_factory),
        path,
        ctx.task.flush_buffer_size(),
        ctx.task.sync_buffer_size(),
        ctx.task.sync_buffer_interval(),
        ctx.pre_allocate,
    );
    ctx.cache.set_output(output);
    ctx.cache.finish_first_connect();
    ctx.cache.open_gate();

    if !chunked && block_count > 1 {
        // The trial response covers the whole resource; reconnect this
        // block with its final bounded range instead of over-reading.
        chain.release_connection();
        return Err(DownloadError::RetryConnect(
            "reconnect first block with final range",
        ));
    }
    Ok(())
}

impl FetchStage for BreakpointStage {
    fn intercept_fetch(&self, chain: &mut DownloadChain) -> Result<u64, DownloadError> {
        let mut total_fetched = 0u64;
        loop {
            if chain.ctx.cache.is_interrupted() {
                return Err(DownloadError::Interrupted);
            }
            let fetched = chain.loop_fetch()?;
            if fetched == 0 {
                break;
            }
            total_fetched += fetched;
        }

        let output = chain.ctx.cache.output()?;
        output.ensure_sync_complete(chain.block_index)?;
        output.inspect_complete(chain.block_index)?;

        let declared = chain.response_content_length();
        if declared != CHUNKED_CONTENT_LENGTH && total_fetched != declared {
            return Err(DownloadError::Protocol(format!(
                "block {} fetched {} bytes but response declared {}",
                chain.block_index, total_fetched, declared
            )));
        }
        Ok(total_fetched)
    }
}
