//! Durable breakpoint store backed by a JSON journal file.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::breakpoint::info::{BreakpointInfo, BreakpointRecord};
use crate::breakpoint::memory::MemoryBreakpointStore;
use crate::breakpoint::store::{BreakpointStore, StoreError};
use crate::download::task::DownloadTask;

/// [`BreakpointStore`] that survives process restarts.
///
/// All reads and id allocation are served by an in-memory store; every
/// mutation writes the full record table back to a JSON journal file
/// (write to a sibling temp file, then rename, so a crash mid-write never
/// corrupts the journal). Progress cursors advanced by
/// `on_sync_to_filesystem_success` are journaled on the same call, which
/// keeps the persisted cursor at or behind the durable file content.
pub struct JournalBreakpointStore {
    cache: MemoryBreakpointStore,
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JournalBreakpointStore {
    /// Opens (or creates) the journal at `path` and loads all records
    /// into memory. A record whose target file no longer needs resuming
    /// is still loaded; staleness is judged at connect time.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let cache = MemoryBreakpointStore::new();

        match fs::read(&path) {
            Ok(bytes) => {
                let records: Vec<BreakpointRecord> = serde_json::from_slice(&bytes)
                    .map_err(|err| StoreError::Encode(err.to_string()))?;
                debug!(path = %path.display(), records = records.len(), "loaded breakpoint journal");
                for record in &records {
                    cache.insert_restored(BreakpointInfo::from(record));
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no breakpoint journal yet");
            }
            Err(err) => return Err(StoreError::Io(err)),
        }

        Ok(Self {
            cache,
            path,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All stored records, ordered by id.
    pub fn snapshot(&self) -> Vec<Arc<BreakpointInfo>> {
        let mut infos = self.cache.all_infos();
        infos.sort_by_key(|info| info.id());
        infos
    }

    fn persist(&self) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock();
        let mut records: Vec<BreakpointRecord> = self
            .cache
            .all_infos()
            .iter()
            .map(|info| BreakpointRecord::from(info.as_ref()))
            .collect();
        records.sort_by_key(|record| record.id);

        let bytes =
            serde_json::to_vec_pretty(&records).map_err(|err| StoreError::Encode(err.to_string()))?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

}

impl BreakpointStore for JournalBreakpointStore {
    fn find_or_create_id(&self, task: &DownloadTask) -> Result<u32, StoreError> {
        self.cache.find_or_create_id(task)
    }

    fn get(&self, id: u32) -> Option<Arc<BreakpointInfo>> {
        self.cache.get(id)
    }

    fn create_and_insert(&self, task: &DownloadTask) -> Result<Arc<BreakpointInfo>, StoreError> {
        let info = self.cache.create_and_insert(task)?;
        self.persist()?;
        Ok(info)
    }

    fn update(&self, info: &Arc<BreakpointInfo>) -> Result<bool, StoreError> {
        let exists = self.cache.update(info)?;
        if exists {
            self.persist()?;
        }
        Ok(exists)
    }

    fn on_sync_to_filesystem_success(
        &self,
        info: &Arc<BreakpointInfo>,
        block_index: usize,
        increase_length: u64,
    ) -> Result<(), StoreError> {
        self.cache
            .on_sync_to_filesystem_success(info, block_index, increase_length)?;
        self.persist()
    }

    fn complete_download(&self, id: u32) -> Result<(), StoreError> {
        self.cache.complete_download(id)?;
        self.persist()
    }

    fn discard(&self, id: u32) -> Result<(), StoreError> {
        self.cache.discard(id)?;
        self.persist()
    }

    fn find_response_filename(&self, url: &str) -> Option<String> {
        self.cache.find_response_filename(url)
    }
}
