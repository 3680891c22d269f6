//! Default cache-backed breakpoint store.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::breakpoint::info::BreakpointInfo;
use crate::breakpoint::store::{BreakpointStore, StoreError};
use crate::download::task::DownloadTask;

const FIRST_ID: u32 = 1;

/// Identity of a task that has an id assigned but no stored record yet
/// (the record is only created once the task actually starts).
#[derive(Debug, Clone, PartialEq, Eq)]
struct TaskIdentity {
    url: String,
    parent_path: PathBuf,
    filename: Option<String>,
}

impl TaskIdentity {
    fn of(task: &DownloadTask) -> Self {
        TaskIdentity {
            url: task.url().to_string(),
            parent_path: task.parent_path().to_path_buf(),
            filename: task.filename(),
        }
    }
}

#[derive(Default)]
struct Inner {
    infos: HashMap<u32, Arc<BreakpointInfo>>,
    response_filenames: HashMap<String, String>,
    unstored_tasks: HashMap<u32, TaskIdentity>,
    /// Occupied ids kept sorted ascending so the smallest free positive
    /// integer can be found in one pass.
    sorted_occupied_ids: Vec<u32>,
}

impl Inner {
    fn allocate_id(&mut self) -> u32 {
        let mut candidate = FIRST_ID;
        let mut insert_at = self.sorted_occupied_ids.len();
        for (index, &occupied) in self.sorted_occupied_ids.iter().enumerate() {
            if occupied != candidate {
                insert_at = index;
                break;
            }
            candidate = occupied + 1;
        }
        self.sorted_occupied_ids.insert(insert_at, candidate);
        candidate
    }

    fn release_id(&mut self, id: u32) {
        if self.unstored_tasks.contains_key(&id) {
            return;
        }
        if let Ok(index) = self.sorted_occupied_ids.binary_search(&id) {
            self.sorted_occupied_ids.remove(index);
        }
    }
}

/// In-memory [`BreakpointStore`]: the default when no durable backend is
/// configured. All guarantees of the contract hold; records simply do not
/// survive the process.
#[derive(Default)]
pub struct MemoryBreakpointStore {
    inner: Mutex<Inner>,
}

impl MemoryBreakpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a record restored from a durable layer. Used by durable
    /// store implementations at load time.
    pub(crate) fn insert_restored(&self, info: BreakpointInfo) {
        let mut inner = self.inner.lock();
        let id = info.id();
        if info.is_filename_provided_by_task() {
            // nothing to remember
        } else if let Some(filename) = info.filename() {
            inner
                .response_filenames
                .insert(info.url().to_string(), filename);
        }
        inner.infos.insert(id, Arc::new(info));
        if let Err(index) = inner.sorted_occupied_ids.binary_search(&id) {
            inner.sorted_occupied_ids.insert(index, id);
        }
    }

    /// Snapshot of all stored records, for durable layers that persist
    /// the whole table on mutation.
    pub(crate) fn all_infos(&self) -> Vec<Arc<BreakpointInfo>> {
        self.inner.lock().infos.values().cloned().collect()
    }
}

impl BreakpointStore for MemoryBreakpointStore {
    fn find_or_create_id(&self, task: &DownloadTask) -> Result<u32, StoreError> {
        let mut inner = self.inner.lock();

        for info in inner.infos.values() {
            if info.is_same_from(task) {
                return Ok(info.id());
            }
        }
        let identity = TaskIdentity::of(task);
        for (&id, pending) in &inner.unstored_tasks {
            if *pending == identity {
                return Ok(id);
            }
        }

        let id = inner.allocate_id();
        inner.unstored_tasks.insert(id, identity);
        Ok(id)
    }

    fn get(&self, id: u32) -> Option<Arc<BreakpointInfo>> {
        self.inner.lock().infos.get(&id).cloned()
    }

    fn create_and_insert(&self, task: &DownloadTask) -> Result<Arc<BreakpointInfo>, StoreError> {
        let mut inner = self.inner.lock();
        let id = task.id();
        let info = Arc::new(BreakpointInfo::new(
            id,
            task.url(),
            task.parent_path(),
            task.filename().as_deref(),
        ));
        inner.infos.insert(id, Arc::clone(&info));
        inner.unstored_tasks.remove(&id);
        if let Err(index) = inner.sorted_occupied_ids.binary_search(&id) {
            inner.sorted_occupied_ids.insert(index, id);
        }
        Ok(info)
    }

    fn update(&self, info: &Arc<BreakpointInfo>) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();

        if !info.is_filename_provided_by_task() {
            if let Some(filename) = info.filename() {
                inner
                    .response_filenames
                    .insert(info.url().to_string(), filename);
            }
        }

        match inner.infos.get(&info.id()) {
            None => Ok(false),
            Some(stored) if Arc::ptr_eq(stored, info) => Ok(true),
            Some(_) => {
                inner
                    .infos
                    .insert(info.id(), Arc::new(info.copy_sharing_blocks()));
                Ok(true)
            }
        }
    }

    fn on_sync_to_filesystem_success(
        &self,
        info: &Arc<BreakpointInfo>,
        block_index: usize,
        increase_length: u64,
    ) -> Result<(), StoreError> {
        let stored = self
            .get(info.id())
            .ok_or(StoreError::UnknownId(info.id()))?;
        let block = stored
            .block(block_index)
            .ok_or(StoreError::UnknownId(info.id()))?;
        block.increase_current_offset(increase_length);
        Ok(())
    }

    fn complete_download(&self, id: u32) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.infos.remove(&id);
        inner.release_id(id);
        Ok(())
    }

    fn discard(&self, id: u32) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.infos.remove(&id);
        inner.release_id(id);
        Ok(())
    }

    fn find_response_filename(&self, url: &str) -> Option<String> {
        self.inner.lock().response_filenames.get(url).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(url: &str, filename: Option<&str>) -> DownloadTask {
        let builder = DownloadTask::builder(url, "/tmp");
        let builder = match filename {
            Some(name) => builder.filename(name),
            None => builder,
        };
        builder.build()
    }

    fn submitted(store: &MemoryBreakpointStore, url: &str, filename: Option<&str>) -> DownloadTask {
        let mut t = task(url, filename);
        t.id = store.find_or_create_id(&t).unwrap();
        t
    }

    #[test]
    fn test_ids_are_compact_and_reused() {
        let store = MemoryBreakpointStore::new();
        let a = submitted(&store, "https://e.com/a", Some("a"));
        let b = submitted(&store, "https://e.com/b", Some("b"));
        let c = submitted(&store, "https://e.com/c", Some("c"));
        assert_eq!((a.id(), b.id(), c.id()), (1, 2, 3));

        store.create_and_insert(&b).unwrap();
        store.complete_download(b.id()).unwrap();

        // The freed id 2 is handed out again before 4.
        let d = submitted(&store, "https://e.com/d", Some("d"));
        assert_eq!(d.id(), 2);
        let e = submitted(&store, "https://e.com/e", Some("e"));
        assert_eq!(e.id(), 4);
    }

    #[test]
    fn test_same_identity_gets_same_id() {
        let store = MemoryBreakpointStore::new();
        let a = submitted(&store, "https://e.com/a", Some("a"));
        let again = submitted(&store, "https://e.com/a", Some("a"));
        assert_eq!(a.id(), again.id());

        // Also after the record is actually stored.
        store.create_and_insert(&a).unwrap();
        let third = submitted(&store, "https://e.com/a", Some("a"));
        assert_eq!(third.id(), a.id());
    }

    #[test]
    fn test_update_unknown_id_returns_false() {
        let store = MemoryBreakpointStore::new();
        let info = Arc::new(BreakpointInfo::new(
            99,
            "u",
            std::path::Path::new("/tmp"),
            Some("f"),
        ));
        assert!(!store.update(&info).unwrap());
    }

    #[test]
    fn test_offsets_visible_without_full_update() {
        let store = MemoryBreakpointStore::new();
        let t = submitted(&store, "https://e.com/a", Some("a"));
        let info = store.create_and_insert(&t).unwrap();
        info.add_block(crate::breakpoint::block::BlockInfo::new(0, 100));
        store.update(&info).unwrap();

        store.on_sync_to_filesystem_success(&info, 0, 40).unwrap();
        let fetched = store.get(t.id()).unwrap();
        assert_eq!(fetched.block(0).unwrap().current_offset(), 40);
        // The caller's handle observes it too (shared block handles).
        assert_eq!(info.block(0).unwrap().current_offset(), 40);
    }

    #[test]
    fn test_discard_removes_record() {
        let store = MemoryBreakpointStore::new();
        let t = submitted(&store, "https://e.com/a", Some("a"));
        store.create_and_insert(&t).unwrap();
        store.discard(t.id()).unwrap();
        assert!(store.get(t.id()).is_none());
    }

    #[test]
    fn test_response_filename_remembered_on_update() {
        let store = MemoryBreakpointStore::new();
        let t = submitted(&store, "https://e.com/x", None);
        let info = store.create_and_insert(&t).unwrap();
        info.set_filename("served.bin");
        store.update(&info).unwrap();
        assert_eq!(
            store.find_response_filename("https://e.com/x").as_deref(),
            Some("served.bin")
        );
    }
}
