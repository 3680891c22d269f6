//! Resume-state record for one download task.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::breakpoint::block::{BlockInfo, BlockRecord};
use crate::download::task::DownloadTask;

/// The persisted resume-state for a task: identity, validator, and the
/// ordered block list partitioning `[0, total_length)`.
///
/// A `BreakpointInfo` is owned by the breakpoint store; the execution
/// engine holds a shared handle per in-flight task. The block list is
/// mutated only at split/reset time (single-threaded moments of the task
/// lifecycle); per-block progress cursors are atomics advanced by the
/// sync-success path, so concurrent blocks never contend on this record.
#[derive(Debug)]
pub struct BreakpointInfo {
    id: u32,
    url: String,
    parent_path: PathBuf,
    filename: RwLock<Option<String>>,
    filename_provided_by_task: bool,
    etag: RwLock<Option<String>>,
    chunked: AtomicBool,
    blocks: RwLock<Vec<Arc<BlockInfo>>>,
}

impl BreakpointInfo {
    pub fn new(id: u32, url: &str, parent_path: &Path, filename: Option<&str>) -> Self {
        Self {
            id,
            url: url.to_string(),
            parent_path: parent_path.to_path_buf(),
            filename: RwLock::new(filename.map(str::to_string)),
            filename_provided_by_task: filename.is_some(),
            etag: RwLock::new(None),
            chunked: AtomicBool::new(false),
            blocks: RwLock::new(Vec::new()),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn parent_path(&self) -> &Path {
        &self.parent_path
    }

    pub fn filename(&self) -> Option<String> {
        self.filename.read().clone()
    }

    /// Sets the filename determined from the response. The filename is
    /// immutable once any block exists, so this only happens before the
    /// first split.
    pub fn set_filename(&self, filename: &str) {
        *self.filename.write() = Some(filename.to_string());
    }

    /// Whether the task supplied the filename up front, as opposed to it
    /// being determined from the response.
    pub fn is_filename_provided_by_task(&self) -> bool {
        self.filename_provided_by_task
    }

    pub fn etag(&self) -> Option<String> {
        self.etag.read().clone()
    }

    pub fn set_etag(&self, etag: Option<&str>) {
        *self.etag.write() = etag.map(str::to_string);
    }

    pub fn is_chunked(&self) -> bool {
        self.chunked.load(Ordering::Acquire)
    }

    pub fn set_chunked(&self, chunked: bool) {
        self.chunked.store(chunked, Ordering::Release);
    }

    /// Resolved target file path, available once the filename is known.
    pub fn target_path(&self) -> Option<PathBuf> {
        self.filename
            .read()
            .as_ref()
            .map(|name| self.parent_path.join(name))
    }

    pub fn add_block(&self, block: BlockInfo) {
        self.blocks.write().push(Arc::new(block));
    }

    pub fn block(&self, block_index: usize) -> Option<Arc<BlockInfo>> {
        self.blocks.read().get(block_index).cloned()
    }

    pub fn block_count(&self) -> usize {
        self.blocks.read().len()
    }

    /// Snapshot of the current block handles, in index order.
    pub fn blocks_snapshot(&self) -> Vec<Arc<BlockInfo>> {
        self.blocks.read().clone()
    }

    pub fn is_single_block(&self) -> bool {
        self.block_count() == 1
    }

    pub fn is_last_block(&self, block_index: usize) -> bool {
        block_index + 1 == self.block_count()
    }

    /// Clears the block list; used whenever a fresh connect determines a
    /// new split.
    pub fn reset_block_infos(&self) {
        self.blocks.write().clear();
    }

    /// Clears blocks and validator for a restart from the beginning.
    pub fn reset_info(&self) {
        self.blocks.write().clear();
        *self.etag.write() = None;
    }

    /// Sum of all blocks' progress cursors.
    pub fn total_offset(&self) -> u64 {
        self.blocks
            .read()
            .iter()
            .map(|block| block.current_offset())
            .sum()
    }

    /// Sum of all blocks' declared lengths. Meaningless when chunked, in
    /// which case the observed offset is reported instead.
    pub fn total_length(&self) -> u64 {
        if self.is_chunked() {
            return self.total_offset();
        }
        self.blocks
            .read()
            .iter()
            .map(|block| block.content_length())
            .sum()
    }

    /// Identity comparison against a task, ignoring the numeric id.
    /// Supports resuming after a process restart where ids may have been
    /// reassigned.
    pub fn is_same_from(&self, task: &DownloadTask) -> bool {
        if self.parent_path != task.parent_path() {
            return false;
        }
        if self.url != task.url() {
            return false;
        }

        let task_filename = task.filename();
        if let Some(task_filename) = &task_filename {
            if Some(task_filename.as_str()) == self.filename.read().as_deref() {
                return true;
            }
        }

        if !self.filename_provided_by_task {
            // Our filename came (or will come) from the response; the task
            // must be in the same situation for the records to match.
            if !task.is_filename_from_response() {
                return false;
            }
            return task_filename.is_none()
                || task_filename.as_deref() == self.filename.read().as_deref();
        }

        false
    }

    /// Deep copy: blocks are copied, not aliased.
    pub fn copy(&self) -> BreakpointInfo {
        self.copy_with_replace_id(self.id)
    }

    /// Copy that shares the live block handles. The store keeps its copy
    /// this way so progress cursors advanced through either handle stay
    /// visible through both.
    pub(crate) fn copy_sharing_blocks(&self) -> BreakpointInfo {
        BreakpointInfo {
            id: self.id,
            url: self.url.clone(),
            parent_path: self.parent_path.clone(),
            filename: RwLock::new(self.filename.read().clone()),
            filename_provided_by_task: self.filename_provided_by_task,
            etag: RwLock::new(self.etag.read().clone()),
            chunked: AtomicBool::new(self.is_chunked()),
            blocks: RwLock::new(self.blocks.read().clone()),
        }
    }

    pub fn copy_with_replace_id(&self, replace_id: u32) -> BreakpointInfo {
        let filename = self.filename.read().clone();
        let info = BreakpointInfo {
            id: replace_id,
            url: self.url.clone(),
            parent_path: self.parent_path.clone(),
            filename: RwLock::new(filename),
            filename_provided_by_task: self.filename_provided_by_task,
            etag: RwLock::new(self.etag.read().clone()),
            chunked: AtomicBool::new(self.is_chunked()),
            blocks: RwLock::new(Vec::new()),
        };
        {
            let mut blocks = info.blocks.write();
            for block in self.blocks.read().iter() {
                blocks.push(Arc::new(block.copy()));
            }
        }
        info
    }
}

impl std::fmt::Display for BreakpointInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "id[{}] url[{}] etag[{:?}] parent[{}] filename[{:?}] blocks[{}]",
            self.id,
            self.url,
            self.etag.read(),
            self.parent_path.display(),
            self.filename.read(),
            self.block_count()
        )
    }
}

/// Serializable snapshot of a breakpoint record and its block rows, used
/// by durable stores. Deleting a breakpoint record implicitly deletes its
/// block rows (they are embedded).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakpointRecord {
    pub id: u32,
    pub url: String,
    pub etag: Option<String>,
    pub parent_path: PathBuf,
    pub filename: Option<String>,
    pub filename_provided_by_task: bool,
    pub chunked: bool,
    pub blocks: Vec<BlockRecord>,
}

impl From<&BreakpointInfo> for BreakpointRecord {
    fn from(info: &BreakpointInfo) -> Self {
        BreakpointRecord {
            id: info.id(),
            url: info.url().to_string(),
            etag: info.etag(),
            parent_path: info.parent_path().to_path_buf(),
            filename: info.filename(),
            filename_provided_by_task: info.is_filename_provided_by_task(),
            chunked: info.is_chunked(),
            blocks: info
                .blocks_snapshot()
                .iter()
                .map(|block| BlockRecord::from(block.as_ref()))
                .collect(),
        }
    }
}

impl From<&BreakpointRecord> for BreakpointInfo {
    fn from(record: &BreakpointRecord) -> Self {
        let info = BreakpointInfo {
            id: record.id,
            url: record.url.clone(),
            parent_path: record.parent_path.clone(),
            filename: RwLock::new(record.filename.clone()),
            filename_provided_by_task: record.filename_provided_by_task,
            etag: RwLock::new(record.etag.clone()),
            chunked: AtomicBool::new(record.chunked),
            blocks: RwLock::new(Vec::new()),
        };
        for block in &record.blocks {
            info.add_block(BlockInfo::from(block));
        }
        info
    }
}
