//! Serializes concurrent per-block writes into one target file.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::breakpoint::info::BreakpointInfo;
use crate::breakpoint::store::BreakpointStore;
use crate::error::DownloadError;
use crate::file::output::{OutputStream, OutputStreamFactory};

struct BlockState {
    stream: Box<dyn OutputStream>,
    /// Bytes written through this handle but not yet known durable.
    no_sync_length: u64,
}

struct State {
    blocks: HashMap<usize, BlockState>,
    all_no_sync_length: u64,
    pre_allocated: bool,
    shutdown: bool,
}

/// Durable writer shared by all blocks of one task.
///
/// Each block gets its own output handle positioned at its absolute
/// offset, so concurrent blocks never contend on a file position. The
/// shared bookkeeping (unsynced counters, handle table) lives under one
/// mutex; writes to distinct blocks only hold it long enough to update
/// counters and look up the handle.
///
/// Durability ordering is the load-bearing property: buffered bytes are
/// flushed and fsynced *before* the store's progress cursor advances
/// ([`BreakpointStore::on_sync_to_filesystem_success`]), so a crash can
/// leave the file ahead of the persisted cursor but never behind it.
pub struct MultiPointOutputStream {
    info: Arc<BreakpointInfo>,
    store: Arc<dyn BreakpointStore>,
    factory: Arc<dyn OutputStreamFactory>,
    path: PathBuf,
    flush_buffer_size: usize,
    sync_buffer_size: u64,
    sync_buffer_interval: Duration,
    pre_allocate: bool,
    state: Mutex<State>,
    shutdown_signal: Condvar,
    sync_thread_started: AtomicBool,
}

impl MultiPointOutputStream {
    pub fn new(
        info: Arc<BreakpointInfo>,
        store: Arc<dyn BreakpointStore>,
        factory: Arc<dyn OutputStreamFactory>,
        path: PathBuf,
        flush_buffer_size: usize,
        sync_buffer_size: u64,
        sync_buffer_interval: Duration,
        pre_allocate: bool,
    ) -> Arc<Self> {
        let pre_allocate = pre_allocate && factory_supports(&*factory);
        Arc::new(Self {
            info,
            store,
            factory,
            path,
            flush_buffer_size,
            sync_buffer_size,
            sync_buffer_interval,
            pre_allocate,
            state: Mutex::new(State {
                blocks: HashMap::new(),
                all_no_sync_length: 0,
                pre_allocated: false,
                shutdown: false,
            }),
            shutdown_signal: Condvar::new(),
            sync_thread_started: AtomicBool::new(false),
        })
    }

    /// Whether pre-allocation will be attempted on first open.
    pub fn is_pre_allocating(&self) -> bool {
        self.pre_allocate
    }

    /// Writes one buffer of `block_index`'s bytes at the block's current
    /// absolute offset. Safe to call concurrently for distinct blocks;
    /// the single fetch loop per block keeps same-block calls sequential.
    pub fn write(self: &Arc<Self>, block_index: usize, bytes: &[u8]) -> Result<(), DownloadError> {
        let trigger_sync = {
            let mut state = self.state.lock();
            if state.shutdown {
                return Err(DownloadError::Interrupted);
            }
            self.ensure_stream(&mut state, block_index)?;
            let block = state
                .blocks
                .get_mut(&block_index)
                .ok_or_else(|| DownloadError::Protocol(format!("no stream for block {block_index}")))?;
            block.stream.write(bytes)?;
            block.no_sync_length += bytes.len() as u64;
            state.all_no_sync_length += bytes.len() as u64;
            state.all_no_sync_length >= self.sync_buffer_size
        };

        if trigger_sync {
            self.sync_all()?;
        } else {
            self.start_sync_thread_once();
        }
        Ok(())
    }

    fn ensure_stream(&self, state: &mut State, block_index: usize) -> Result<(), DownloadError> {
        if state.blocks.contains_key(&block_index) {
            return Ok(());
        }
        let block = self
            .info
            .block(block_index)
            .ok_or_else(|| DownloadError::Protocol(format!("no block at index {block_index}")))?;

        let mut stream = self.factory.create(&self.path, self.flush_buffer_size)?;

        if self.pre_allocate && !state.pre_allocated && !self.info.is_chunked() {
            let total_length = self.info.total_length();
            if let Err(err) = stream.set_length(total_length) {
                return Err(match err {
                    DownloadError::Io(source) => DownloadError::PreAllocate {
                        requested: total_length,
                        source,
                    },
                    other => other,
                });
            }
            state.pre_allocated = true;
            debug!(path = %self.path.display(), total_length, "pre-allocated target file");
        }

        if self.factory.supports_seek() {
            stream.seek(block.range_left())?;
        }

        state.blocks.insert(
            block_index,
            BlockState {
                stream,
                no_sync_length: 0,
            },
        );
        Ok(())
    }

    /// Flushes and fsyncs every handle with unsynced bytes, then advances
    /// the store cursor by exactly those byte counts.
    pub fn sync_all(&self) -> Result<(), DownloadError> {
        let mut synced: Vec<(usize, u64)> = Vec::new();
        {
            let mut state = self.state.lock();
            for (&index, block) in state.blocks.iter_mut() {
                if block.no_sync_length == 0 {
                    continue;
                }
                block.stream.flush_and_sync()?;
                synced.push((index, block.no_sync_length));
                block.no_sync_length = 0;
            }
            state.all_no_sync_length = 0;
        }

        for (index, length) in synced {
            self.store
                .on_sync_to_filesystem_success(&self.info, index, length)?;
        }
        Ok(())
    }

    /// Flushes and fsyncs one block's handle and advances its cursor.
    /// Called at the end of the block's fetch loop, also on error paths.
    pub fn ensure_sync_complete(&self, block_index: usize) -> Result<(), DownloadError> {
        let synced_length = {
            let mut state = self.state.lock();
            match state.blocks.get_mut(&block_index) {
                Some(block) if block.no_sync_length > 0 => {
                    block.stream.flush_and_sync()?;
                    let length = block.no_sync_length;
                    block.no_sync_length = 0;
                    state.all_no_sync_length = state.all_no_sync_length.saturating_sub(length);
                    length
                }
                _ => return Ok(()),
            }
        };
        self.store
            .on_sync_to_filesystem_success(&self.info, block_index, synced_length)?;
        Ok(())
    }

    /// Verifies the block's persisted cursor reached its declared length.
    /// The first block of a multi-block resource is checked leniently
    /// (`>=`) since its response may cover an estimated range.
    pub fn inspect_complete(&self, block_index: usize) -> Result<(), DownloadError> {
        let block = self
            .info
            .block(block_index)
            .ok_or_else(|| DownloadError::Protocol(format!("no block at index {block_index}")))?;
        if block.is_chunked() {
            return Ok(());
        }
        let current = block.current_offset();
        let declared = block.content_length();
        let lenient = block_index == 0 && !self.info.is_single_block();
        let complete = if lenient {
            current >= declared
        } else {
            current == declared
        };
        if !complete {
            return Err(DownloadError::Protocol(format!(
                "block {block_index} incomplete: {current} of {declared} bytes"
            )));
        }
        Ok(())
    }

    /// Releases the block's handle. Idempotent; runs on error paths too.
    /// Never shuts the writer down: the handle table only holds blocks
    /// that have written, so an empty table says nothing about siblings
    /// still fetching. Shutdown is [`MultiPointOutputStream::cancel`]'s
    /// job, invoked once at task end after every chain has joined.
    pub fn close(&self, block_index: usize) {
        let mut state = self.state.lock();
        if let Some(block) = state.blocks.remove(&block_index) {
            if block.no_sync_length > 0 {
                // Unsynced tail is lost to the cursor; it will be
                // re-fetched on resume.
                warn!(
                    block_index,
                    unsynced = block.no_sync_length,
                    "closing block stream with unsynced bytes"
                );
                state.all_no_sync_length =
                    state.all_no_sync_length.saturating_sub(block.no_sync_length);
            }
        }
    }

    /// Syncs and releases everything; used on cancel and at task end.
    pub fn cancel(&self) {
        if let Err(err) = self.sync_all() {
            warn!(%err, "final sync failed while shutting down output");
        }
        let mut state = self.state.lock();
        state.blocks.clear();
        state.shutdown = true;
        self.shutdown_signal.notify_all();
    }

    fn start_sync_thread_once(self: &Arc<Self>) {
        if self.sync_thread_started.swap(true, Ordering::AcqRel) {
            return;
        }
        let this = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("rangefetch-sync-{}", self.info.id()))
            .spawn(move || this.run_sync_loop());
        if let Err(err) = spawned {
            warn!(%err, "failed to spawn sync thread; relying on threshold syncs");
            self.sync_thread_started.store(false, Ordering::Release);
        }
    }

    fn run_sync_loop(&self) {
        loop {
            {
                let mut state = self.state.lock();
                if state.shutdown {
                    return;
                }
                self.shutdown_signal
                    .wait_for(&mut state, self.sync_buffer_interval);
                if state.shutdown {
                    return;
                }
            }
            if let Err(err) = self.sync_all() {
                warn!(%err, "periodic sync failed");
            }
        }
    }
}

fn factory_supports(factory: &dyn OutputStreamFactory) -> bool {
    factory.supports_seek() && factory.supports_pre_allocate()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breakpoint::block::BlockInfo;
    use crate::breakpoint::memory::MemoryBreakpointStore;
    use crate::download::task::DownloadTask;
    use crate::file::output::FileOutputStreamFactory;
    use std::path::Path;

    fn setup(
        dir: &Path,
        blocks: &[(u64, u64)],
    ) -> (Arc<MultiPointOutputStream>, Arc<BreakpointInfo>, Arc<MemoryBreakpointStore>) {
        let store = Arc::new(MemoryBreakpointStore::new());
        let mut task = DownloadTask::builder("https://e.com/f", dir).filename("f.bin").build();
        task.id = store.find_or_create_id(&task).unwrap();
        let info = store.create_and_insert(&task).unwrap();
        for &(start, length) in blocks {
            info.add_block(BlockInfo::new(start, length));
        }
        let stream = MultiPointOutputStream::new(
            Arc::clone(&info),
            store.clone() as Arc<dyn BreakpointStore>,
            Arc::new(FileOutputStreamFactory),
            dir.join("f.bin"),
            8192,
            1 << 16,
            Duration::from_millis(2000),
            true,
        );
        (stream, info, store)
    }

    #[test]
    fn test_concurrent_blocks_land_at_their_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let (stream, info, _) = setup(dir.path(), &[(0, 4), (4, 4)]);

        stream.write(1, b"BBBB").unwrap();
        stream.write(0, b"AAAA").unwrap();
        stream.ensure_sync_complete(0).unwrap();
        stream.ensure_sync_complete(1).unwrap();
        stream.close(0);
        stream.close(1);
        stream.cancel();

        assert_eq!(std::fs::read(dir.path().join("f.bin")).unwrap(), b"AAAABBBB");
        assert_eq!(info.total_offset(), 8);
    }

    #[test]
    fn test_cursor_advances_only_after_sync() {
        let dir = tempfile::tempdir().unwrap();
        let (stream, info, _) = setup(dir.path(), &[(0, 8)]);

        stream.write(0, b"abcd").unwrap();
        // Written but not synced: the persisted cursor has not moved.
        assert_eq!(info.block(0).unwrap().current_offset(), 0);

        stream.ensure_sync_complete(0).unwrap();
        assert_eq!(info.block(0).unwrap().current_offset(), 4);

        // A second sync with nothing pending must not double-count.
        stream.ensure_sync_complete(0).unwrap();
        assert_eq!(info.block(0).unwrap().current_offset(), 4);
        stream.close(0);
        stream.cancel();
    }

    #[test]
    fn test_threshold_triggers_sync() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryBreakpointStore::new());
        let mut task = DownloadTask::builder("u", dir.path()).filename("f.bin").build();
        task.id = store.find_or_create_id(&task).unwrap();
        let info = store.create_and_insert(&task).unwrap();
        info.add_block(BlockInfo::new(0, 100));
        let stream = MultiPointOutputStream::new(
            Arc::clone(&info),
            store as Arc<dyn BreakpointStore>,
            Arc::new(FileOutputStreamFactory),
            dir.path().join("f.bin"),
            8192,
            4, // tiny threshold
            Duration::from_secs(3600),
            false,
        );

        stream.write(0, b"abcdef").unwrap();
        // 6 >= 4 forced a sync inline.
        assert_eq!(info.block(0).unwrap().current_offset(), 6);
        stream.close(0);
        stream.cancel();
    }

    #[test]
    fn test_pre_allocation_sets_final_length() {
        let dir = tempfile::tempdir().unwrap();
        let (stream, _, _) = setup(dir.path(), &[(0, 100), (100, 100)]);
        stream.write(0, b"x").unwrap();
        stream.ensure_sync_complete(0).unwrap();
        stream.close(0);
        stream.close(1);
        stream.cancel();
        assert_eq!(
            std::fs::metadata(dir.path().join("f.bin")).unwrap().len(),
            200
        );
    }

    #[test]
    fn test_inspect_complete_rules() {
        let dir = tempfile::tempdir().unwrap();
        let (stream, info, _) = setup(dir.path(), &[(0, 4), (4, 4)]);

        // Incomplete block is a hard error.
        assert!(stream.inspect_complete(1).is_err());

        info.block(1).unwrap().increase_current_offset(4);
        stream.inspect_complete(1).unwrap();

        // First block of a multi-block resource is lenient: overshoot ok.
        info.block(0).unwrap().increase_current_offset(5);
        stream.inspect_complete(0).unwrap();
        stream.cancel();
    }

    #[test]
    fn test_block_close_does_not_reject_sibling_writes() {
        let dir = tempfile::tempdir().unwrap();
        let (stream, info, _) = setup(dir.path(), &[(0, 4), (4, 4)]);

        // A fast block finishing and closing before a slower sibling's
        // first write must not shut the writer down under it.
        stream.write(0, b"AAAA").unwrap();
        stream.ensure_sync_complete(0).unwrap();
        stream.close(0);

        stream.write(1, b"BBBB").unwrap();
        stream.ensure_sync_complete(1).unwrap();
        stream.close(1);
        stream.cancel();

        assert_eq!(std::fs::read(dir.path().join("f.bin")).unwrap(), b"AAAABBBB");
        assert_eq!(info.total_offset(), 8);
    }

    #[test]
    fn test_store_failure_surfaces_from_ensure_sync_complete() {
        use crate::breakpoint::store::StoreError;

        struct SyncFailStore {
            inner: MemoryBreakpointStore,
        }

        impl BreakpointStore for SyncFailStore {
            fn find_or_create_id(&self, task: &DownloadTask) -> Result<u32, StoreError> {
                self.inner.find_or_create_id(task)
            }
            fn get(&self, id: u32) -> Option<Arc<BreakpointInfo>> {
                self.inner.get(id)
            }
            fn create_and_insert(
                &self,
                task: &DownloadTask,
            ) -> Result<Arc<BreakpointInfo>, StoreError> {
                self.inner.create_and_insert(task)
            }
            fn update(&self, info: &Arc<BreakpointInfo>) -> Result<bool, StoreError> {
                self.inner.update(info)
            }
            fn on_sync_to_filesystem_success(
                &self,
                _info: &Arc<BreakpointInfo>,
                _block_index: usize,
                _increase_length: u64,
            ) -> Result<(), StoreError> {
                Err(StoreError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "journal offline",
                )))
            }
            fn complete_download(&self, id: u32) -> Result<(), StoreError> {
                self.inner.complete_download(id)
            }
            fn discard(&self, id: u32) -> Result<(), StoreError> {
                self.inner.discard(id)
            }
            fn find_response_filename(&self, url: &str) -> Option<String> {
                self.inner.find_response_filename(url)
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SyncFailStore {
            inner: MemoryBreakpointStore::new(),
        });
        let mut task = DownloadTask::builder("https://e.com/f", dir.path())
            .filename("f.bin")
            .build();
        task.id = store.find_or_create_id(&task).unwrap();
        let info = store.create_and_insert(&task).unwrap();
        info.add_block(BlockInfo::new(0, 8));
        let stream = MultiPointOutputStream::new(
            Arc::clone(&info),
            store as Arc<dyn BreakpointStore>,
            Arc::new(FileOutputStreamFactory),
            dir.path().join("f.bin"),
            8192,
            1 << 16,
            Duration::from_millis(2000),
            false,
        );

        stream.write(0, b"abcd").unwrap();
        assert!(matches!(
            stream.ensure_sync_complete(0),
            Err(DownloadError::Store(_))
        ));
        stream.cancel();
    }

    #[test]
    fn test_close_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (stream, _, _) = setup(dir.path(), &[(0, 4)]);
        stream.write(0, b"ab").unwrap();
        stream.close(0);
        stream.close(0);
        stream.cancel();
    }
}
