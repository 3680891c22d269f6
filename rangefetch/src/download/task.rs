//! Download task description and builder.

use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::RwLock;

/// Default read-buffer size for one fetch iteration, in bytes.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 4096;
/// Default flush-buffer size handed to the output-stream factory.
pub const DEFAULT_FLUSH_BUFFER_SIZE: usize = 16384;
/// Default unsynced-byte threshold that triggers an early fsync.
pub const DEFAULT_SYNC_BUFFER_SIZE: u64 = 65536;
/// Default interval between periodic fsync passes.
pub const DEFAULT_SYNC_BUFFER_INTERVAL: Duration = Duration::from_millis(2000);
/// Default progress-callback granularity: minimum interval between
/// `fetch_progress` callbacks per block.
pub const DEFAULT_MIN_PROGRESS_INTERVAL: Duration = Duration::from_millis(300);

/// A download request: what to fetch and where to put it.
///
/// Task identity (used for conflict detection and for matching persisted
/// resume-state across process restarts) is the triple of url, parent
/// path, and filename; the numeric id is assigned by the breakpoint store
/// at submission and may differ between runs.
///
/// # Example
///
/// ```ignore
/// let task = DownloadTask::builder("https://example.com/big.iso", "/downloads")
///     .filename("big.iso")
///     .priority(10)
///     .build();
/// engine.enqueue(task, listener)?;
/// ```
#[derive(Debug)]
pub struct DownloadTask {
    pub(crate) id: u32,
    url: String,
    parent_path: PathBuf,
    filename: RwLock<Option<String>>,
    filename_from_response: bool,
    priority: i32,
    headers: Vec<(String, String)>,
    wifi_required: bool,
    read_buffer_size: usize,
    flush_buffer_size: usize,
    sync_buffer_size: u64,
    sync_buffer_interval: Duration,
    min_progress_interval: Duration,
}

impl DownloadTask {
    pub fn builder(url: impl Into<String>, parent_path: impl Into<PathBuf>) -> DownloadTaskBuilder {
        DownloadTaskBuilder {
            url: url.into(),
            parent_path: parent_path.into(),
            filename: None,
            priority: 0,
            headers: Vec::new(),
            wifi_required: false,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            flush_buffer_size: DEFAULT_FLUSH_BUFFER_SIZE,
            sync_buffer_size: DEFAULT_SYNC_BUFFER_SIZE,
            sync_buffer_interval: DEFAULT_SYNC_BUFFER_INTERVAL,
            min_progress_interval: DEFAULT_MIN_PROGRESS_INTERVAL,
        }
    }

    /// Store-assigned task id. Zero until the task has been submitted.
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

    /// Sets the filename once it has been determined from the response.
    pub(crate) fn set_filename(&self, filename: &str) {
        *self.filename.write() = Some(filename.to_string());
    }

    /// Whether the filename is left to be determined from the response.
    pub fn is_filename_from_response(&self) -> bool {
        self.filename_from_response
    }

    /// Resolved target file path, once the filename is known.
    pub fn file_path(&self) -> Option<PathBuf> {
        self.filename
            .read()
            .as_ref()
            .map(|name| self.parent_path.join(name))
    }

    /// Scheduling priority; higher runs first.
    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn is_wifi_required(&self) -> bool {
        self.wifi_required
    }

    pub fn read_buffer_size(&self) -> usize {
        self.read_buffer_size
    }

    pub fn flush_buffer_size(&self) -> usize {
        self.flush_buffer_size
    }

    pub fn sync_buffer_size(&self) -> u64 {
        self.sync_buffer_size
    }

    pub fn sync_buffer_interval(&self) -> Duration {
        self.sync_buffer_interval
    }

    pub fn min_progress_interval(&self) -> Duration {
        self.min_progress_interval
    }

    /// Identity comparison ignoring the numeric id.
    pub fn compare_ignore_id(&self, other: &DownloadTask) -> bool {
        self.url == other.url
            && self.parent_path == other.parent_path
            && *self.filename.read() == *other.filename.read()
    }
}

/// Builder for [`DownloadTask`].
#[derive(Debug)]
pub struct DownloadTaskBuilder {
    url: String,
    parent_path: PathBuf,
    filename: Option<String>,
    priority: i32,
    headers: Vec<(String, String)>,
    wifi_required: bool,
    read_buffer_size: usize,
    flush_buffer_size: usize,
    sync_buffer_size: u64,
    sync_buffer_interval: Duration,
    min_progress_interval: Duration,
}

impl DownloadTaskBuilder {
    /// Explicit target filename. When absent, the filename is determined
    /// from the response (Content-Disposition) or the URL.
    pub fn filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn wifi_required(mut self, wifi_required: bool) -> Self {
        self.wifi_required = wifi_required;
        self
    }

    pub fn read_buffer_size(mut self, bytes: usize) -> Self {
        self.read_buffer_size = bytes;
        self
    }

    pub fn flush_buffer_size(mut self, bytes: usize) -> Self {
        self.flush_buffer_size = bytes;
        self
    }

    pub fn sync_buffer_size(mut self, bytes: u64) -> Self {
        self.sync_buffer_size = bytes;
        self
    }

    pub fn sync_buffer_interval(mut self, interval: Duration) -> Self {
        self.sync_buffer_interval = interval;
        self
    }

    pub fn min_progress_interval(mut self, interval: Duration) -> Self {
        self.min_progress_interval = interval;
        self
    }

    pub fn build(self) -> DownloadTask {
        let filename_from_response = self.filename.is_none();
        DownloadTask {
            id: 0,
            url: self.url,
            parent_path: self.parent_path,
            filename: RwLock::new(self.filename),
            filename_from_response,
            priority: self.priority,
            headers: self.headers,
            wifi_required: self.wifi_required,
            read_buffer_size: self.read_buffer_size,
            flush_buffer_size: self.flush_buffer_size,
            sync_buffer_size: self.sync_buffer_size,
            sync_buffer_interval: self.sync_buffer_interval,
            min_progress_interval: self.min_progress_interval,
        }
    }
}
