//! End-to-end engine behavior against a scripted in-memory transport.

use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rangefetch::{
    BreakpointStore, Connected, Connection, ConnectionFactory, DownloadError, DownloadListener,
    DownloadTask, EndCause, Engine, MemoryBreakpointStore, NoopListener, ResumeFailedCause,
};

#[derive(Debug, Clone)]
struct RecordedRequest {
    url: String,
    headers: Vec<(String, String)>,
}

impl RecordedRequest {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Scripted origin server: one resource, optional redirects, range and
/// validator semantics like a plain HTTP file server.
struct MockServer {
    body: Mutex<Vec<u8>>,
    etag: Mutex<Option<String>>,
    accept_ranges: bool,
    chunked: bool,
    content_disposition: Option<String>,
    redirects: HashMap<String, String>,
    /// Per-request artificial latency, for scheduling tests.
    delay: Duration,
    /// Serve only this many body bytes on the next body response.
    truncate_next: Mutex<Option<usize>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl MockServer {
    fn new(body: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            body: Mutex::new(body),
            etag: Mutex::new(Some("\"v1\"".to_string())),
            accept_ranges: true,
            chunked: false,
            content_disposition: None,
            redirects: HashMap::new(),
            delay: Duration::ZERO,
            truncate_next: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn set_body(&self, body: Vec<u8>) {
        *self.body.lock().unwrap() = body;
    }

    fn set_etag(&self, etag: &str) {
        *self.etag.lock().unwrap() = Some(etag.to_string());
    }

    fn truncate_next(&self, bytes: usize) {
        *self.truncate_next.lock().unwrap() = Some(bytes);
    }
}

struct MockFactory {
    server: Arc<MockServer>,
}

impl ConnectionFactory for MockFactory {
    fn create(&self, url: &str) -> Result<Box<dyn Connection>, DownloadError> {
        Ok(Box::new(MockConnection {
            server: Arc::clone(&self.server),
            url: url.to_string(),
            headers: Vec::new(),
        }))
    }
}

struct MockConnection {
    server: Arc<MockServer>,
    url: String,
    headers: Vec<(String, String)>,
}

fn parse_range(value: &str) -> Option<(u64, Option<u64>)> {
    let rest = value.strip_prefix("bytes=")?;
    let (start, end) = rest.split_once('-')?;
    let start = start.parse::<u64>().ok()?;
    let end = if end.is_empty() {
        None
    } else {
        Some(end.parse::<u64>().ok()?)
    };
    Some((start, end))
}

impl Connection for MockConnection {
    fn add_header(&mut self, name: &str, value: &str) {
        self.headers.push((name.to_string(), value.to_string()));
    }

    fn execute(&mut self) -> Result<Box<dyn Connected>, DownloadError> {
        let server = &self.server;
        if !server.delay.is_zero() {
            std::thread::sleep(server.delay);
        }
        let request = RecordedRequest {
            url: self.url.clone(),
            headers: self.headers.clone(),
        };
        server.requests.lock().unwrap().push(request.clone());

        if let Some(target) = server.redirects.get(&self.url) {
            return Ok(Box::new(MockResponse {
                code: 302,
                headers: vec![("Location".to_string(), target.clone())],
                body: Cursor::new(Vec::new()),
            }));
        }

        let etag = server.etag.lock().unwrap().clone();
        if let (Some(expected), Some(current)) = (request.header("If-Match"), &etag) {
            if expected != current {
                return Ok(Box::new(MockResponse {
                    code: 412,
                    headers: Vec::new(),
                    body: Cursor::new(Vec::new()),
                }));
            }
        }

        let body = server.body.lock().unwrap().clone();
        let total = body.len() as u64;
        let mut headers = Vec::new();
        if let Some(etag) = &etag {
            headers.push(("ETag".to_string(), etag.clone()));
        }
        if server.accept_ranges {
            headers.push(("Accept-Ranges".to_string(), "bytes".to_string()));
        }
        if let Some(cd) = &server.content_disposition {
            headers.push(("Content-Disposition".to_string(), cd.clone()));
        }

        let range = request.header("Range").and_then(parse_range);
        let (code, slice) = match range {
            Some((start, end)) if server.accept_ranges && total > 0 => {
                let end = end.unwrap_or(total - 1).min(total - 1);
                headers.push((
                    "Content-Range".to_string(),
                    format!("bytes {start}-{end}/{total}"),
                ));
                (206, body[start as usize..=end as usize].to_vec())
            }
            _ => (200, body),
        };

        let slice = match server.truncate_next.lock().unwrap().take() {
            Some(keep) => slice[..keep.min(slice.len())].to_vec(),
            None => slice,
        };
        if !server.chunked {
            // Declared length is the full range; truncation simulates a
            // connection dropped mid-body.
            let declared = match code {
                206 => headers
                    .iter()
                    .find(|(n, _)| n == "Content-Range")
                    .and_then(|(_, v)| {
                        let (range, _) = v.strip_prefix("bytes ")?.split_once('/')?;
                        let (a, b) = range.split_once('-')?;
                        Some(b.parse::<u64>().ok()? - a.parse::<u64>().ok()? + 1)
                    })
                    .unwrap_or(slice.len() as u64),
                _ => total,
            };
            headers.push(("Content-Length".to_string(), declared.to_string()));
        }

        Ok(Box::new(MockResponse {
            code,
            headers,
            body: Cursor::new(slice),
        }))
    }
}

struct MockResponse {
    code: u16,
    headers: Vec<(String, String)>,
    body: Cursor<Vec<u8>>,
}

impl Connected for MockResponse {
    fn response_code(&self) -> u16 {
        self.code
    }

    fn header(&self, name: &str) -> Option<String> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.clone())
    }

    fn body(&mut self) -> &mut dyn Read {
        &mut self.body
    }
}

/// Listener recording lifecycle events for assertions.
#[derive(Default)]
struct RecordingListener {
    started: Mutex<Vec<String>>,
    from_beginning: Mutex<Vec<ResumeFailedCause>>,
    resumed_offsets: Mutex<Vec<u64>>,
    ends: Mutex<Vec<EndCause>>,
    done: Mutex<Option<mpsc::Sender<EndCause>>>,
}

impl RecordingListener {
    fn with_channel(tx: mpsc::Sender<EndCause>) -> Arc<Self> {
        let listener = Self::default();
        *listener.done.lock().unwrap() = Some(tx);
        Arc::new(listener)
    }
}

impl DownloadListener for RecordingListener {
    fn task_start(&self, task: &DownloadTask) {
        self.started.lock().unwrap().push(task.url().to_string());
    }

    fn download_from_beginning(&self, _task: &DownloadTask, cause: ResumeFailedCause) {
        self.from_beginning.lock().unwrap().push(cause);
    }

    fn download_from_breakpoint(&self, _task: &DownloadTask, info: &rangefetch::BreakpointInfo) {
        self.resumed_offsets.lock().unwrap().push(info.total_offset());
    }

    fn task_end(&self, _task: &DownloadTask, cause: EndCause, _error: Option<&DownloadError>) {
        self.ends.lock().unwrap().push(cause);
        if let Some(tx) = self.done.lock().unwrap().as_ref() {
            let _ = tx.send(cause);
        }
    }
}

fn engine_for(server: &Arc<MockServer>) -> Engine {
    Engine::builder()
        .store(Arc::new(MemoryBreakpointStore::new()))
        .connection_factory(Arc::new(MockFactory {
            server: Arc::clone(server),
        }))
        .build()
        .unwrap()
}

fn patterned_body(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[test]
fn test_fresh_small_download_uses_single_block() {
    let body = patterned_body(6666);
    let server = MockServer::new(body.clone());
    let engine = engine_for(&server);
    let dir = tempfile::tempdir().unwrap();

    let task = DownloadTask::builder("https://mock/file.bin", dir.path())
        .filename("file.bin")
        .build();
    let (cause, error) = engine.execute(task, Arc::new(NoopListener)).unwrap();

    assert_eq!(cause, EndCause::Completed, "error: {error:?}");
    assert_eq!(std::fs::read(dir.path().join("file.bin")).unwrap(), body);
    // Record purged on completion.
    assert!(engine.store().get(1).is_none());

    // Under 1 MiB: the trial connect is the only connection.
    let requests = server.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].header("Range"), Some("bytes=0-"));
}

#[test]
fn test_multi_block_download_splits_ranges() {
    let len = 1024 * 1024 + 512 * 1024; // 1.5 MiB: two blocks
    let body = patterned_body(len);
    let server = MockServer::new(body.clone());
    let engine = engine_for(&server);
    let dir = tempfile::tempdir().unwrap();

    let task = DownloadTask::builder("https://mock/big.bin", dir.path())
        .filename("big.bin")
        .build();
    let (cause, error) = engine.execute(task, Arc::new(NoopListener)).unwrap();
    assert_eq!(cause, EndCause::Completed, "error: {error:?}");
    assert_eq!(std::fs::read(dir.path().join("big.bin")).unwrap(), body);

    let half = (len / 2) as u64;
    let ranges: Vec<String> = server
        .requests()
        .iter()
        .filter_map(|req| req.header("Range").map(str::to_string))
        .collect();
    // Trial, then the first block reconnects bounded, then the last block
    // open-ended from its start.
    assert!(ranges.contains(&"bytes=0-".to_string()));
    assert!(ranges.contains(&format!("bytes=0-{}", half - 1)));
    assert!(ranges.contains(&format!("bytes={half}-")));
}

#[test]
fn test_truncated_download_resumes_from_persisted_offset() {
    let body = patterned_body(6666);
    let server = MockServer::new(body.clone());
    let engine = engine_for(&server);
    let dir = tempfile::tempdir().unwrap();

    // First attempt: connection drops after 5121 bytes.
    server.truncate_next(5121);
    let task = DownloadTask::builder("https://mock/file.bin", dir.path())
        .filename("file.bin")
        .build();
    let (cause, _) = engine.execute(task, Arc::new(NoopListener)).unwrap();
    assert_eq!(cause, EndCause::Error);

    // Progress survived in the store.
    let info = engine.store().get(1).expect("record kept after failure");
    assert_eq!(info.total_offset(), 5121);

    // Second attempt resumes exactly where the sync left off.
    let (tx, rx) = mpsc::channel();
    let listener = RecordingListener::with_channel(tx);
    let task = DownloadTask::builder("https://mock/file.bin", dir.path())
        .filename("file.bin")
        .build();
    let (cause, error) = engine.execute(task, listener.clone()).unwrap();
    assert_eq!(cause, EndCause::Completed, "error: {error:?}");
    assert_eq!(rx.recv().unwrap(), EndCause::Completed);
    assert_eq!(*listener.resumed_offsets.lock().unwrap(), vec![5121]);

    let resume_request = server.requests().last().cloned().unwrap();
    assert_eq!(resume_request.header("Range"), Some("bytes=5121-"));
    assert_eq!(resume_request.header("If-Match"), Some("\"v1\""));

    assert_eq!(std::fs::read(dir.path().join("file.bin")).unwrap(), body);
}

#[test]
fn test_etag_change_forces_restart_from_beginning() {
    let server = MockServer::new(patterned_body(6666));
    let engine = engine_for(&server);
    let dir = tempfile::tempdir().unwrap();

    server.truncate_next(4000);
    let task = DownloadTask::builder("https://mock/file.bin", dir.path())
        .filename("file.bin")
        .build();
    let (cause, _) = engine.execute(task, Arc::new(NoopListener)).unwrap();
    assert_eq!(cause, EndCause::Error);

    // Resource changed server-side between attempts.
    let new_body = patterned_body(5000);
    server.set_body(new_body.clone());
    server.set_etag("\"v2\"");

    let listener = Arc::new(RecordingListener::default());
    let task = DownloadTask::builder("https://mock/file.bin", dir.path())
        .filename("file.bin")
        .build();
    let (cause, error) = engine.execute(task, listener.clone()).unwrap();
    assert_eq!(cause, EndCause::Completed, "error: {error:?}");

    // The stale validator was rejected and the task restarted from zero.
    assert_eq!(
        *listener.from_beginning.lock().unwrap(),
        vec![ResumeFailedCause::ResponsePreconditionFailed]
    );
    assert_eq!(std::fs::read(dir.path().join("file.bin")).unwrap(), new_body);
}

#[test]
fn test_redirects_are_followed_up_to_the_bound() {
    let body = patterned_body(1000);
    let mut server = MockServer::new(body.clone());
    {
        let server = Arc::get_mut(&mut server).unwrap();
        for hop in 0..9 {
            server.redirects.insert(
                format!("https://mock/hop{hop}"),
                format!("https://mock/hop{}", hop + 1),
            );
        }
        server
            .redirects
            .insert("https://mock/hop9".to_string(), "https://mock/file.bin".to_string());
    }
    let engine = engine_for(&server);
    let dir = tempfile::tempdir().unwrap();

    // Ten hops: allowed.
    let task = DownloadTask::builder("https://mock/hop0", dir.path())
        .filename("file.bin")
        .build();
    let (cause, error) = engine.execute(task, Arc::new(NoopListener)).unwrap();
    assert_eq!(cause, EndCause::Completed, "error: {error:?}");
    assert_eq!(std::fs::read(dir.path().join("file.bin")).unwrap(), body);
}

#[test]
fn test_eleven_redirects_fail() {
    let mut server = MockServer::new(patterned_body(1000));
    {
        let server = Arc::get_mut(&mut server).unwrap();
        for hop in 0..10 {
            server.redirects.insert(
                format!("https://mock/hop{hop}"),
                format!("https://mock/hop{}", hop + 1),
            );
        }
        server
            .redirects
            .insert("https://mock/hop10".to_string(), "https://mock/file.bin".to_string());
    }
    let engine = engine_for(&server);
    let dir = tempfile::tempdir().unwrap();

    let task = DownloadTask::builder("https://mock/hop0", dir.path())
        .filename("file.bin")
        .build();
    let (cause, error) = engine.execute(task, Arc::new(NoopListener)).unwrap();
    assert_eq!(cause, EndCause::Error);
    assert!(matches!(error, Some(DownloadError::Protocol(_))));
}

#[test]
fn test_chunked_body_downloads_without_length() {
    let body = patterned_body(4321);
    let mut server = MockServer::new(body.clone());
    {
        let server = Arc::get_mut(&mut server).unwrap();
        server.chunked = true;
        server.accept_ranges = false;
    }
    let engine = engine_for(&server);
    let dir = tempfile::tempdir().unwrap();

    let task = DownloadTask::builder("https://mock/stream", dir.path())
        .filename("stream.bin")
        .build();
    let (cause, error) = engine.execute(task, Arc::new(NoopListener)).unwrap();
    assert_eq!(cause, EndCause::Completed, "error: {error:?}");
    assert_eq!(std::fs::read(dir.path().join("stream.bin")).unwrap(), body);
    assert!(engine.store().get(1).is_none());
}

#[test]
fn test_filename_determined_from_content_disposition() {
    let body = patterned_body(100);
    let mut server = MockServer::new(body.clone());
    {
        let server = Arc::get_mut(&mut server).unwrap();
        server.content_disposition =
            Some("attachment; filename=\"served name.bin\"".to_string());
    }
    let engine = engine_for(&server);
    let dir = tempfile::tempdir().unwrap();

    // No filename on the task: the response decides.
    let task = DownloadTask::builder("https://mock/download", dir.path()).build();
    let (cause, error) = engine.execute(task, Arc::new(NoopListener)).unwrap();
    assert_eq!(cause, EndCause::Completed, "error: {error:?}");
    assert_eq!(
        std::fs::read(dir.path().join("served name.bin")).unwrap(),
        body
    );
}

#[test]
fn test_duplicate_submission_is_rejected_busy() {
    let mut server = MockServer::new(patterned_body(2000));
    {
        let server = Arc::get_mut(&mut server).unwrap();
        server.delay = Duration::from_millis(150);
    }
    let engine = Arc::new(engine_for(&server));
    let dir = tempfile::tempdir().unwrap();

    let (tx, rx) = mpsc::channel();
    let first = RecordingListener::with_channel(tx.clone());
    let task = DownloadTask::builder("https://mock/file.bin", dir.path())
        .filename("file.bin")
        .build();
    engine.enqueue(task, first.clone()).unwrap();

    // Identical identity while the first is still running.
    let same = RecordingListener::with_channel(tx.clone());
    let task = DownloadTask::builder("https://mock/file.bin", dir.path())
        .filename("file.bin")
        .build();
    engine.enqueue(task, same.clone()).unwrap();

    // Different URL, same target path.
    let busy = RecordingListener::with_channel(tx);
    let task = DownloadTask::builder("https://mock/other", dir.path())
        .filename("file.bin")
        .build();
    engine.enqueue(task, busy.clone()).unwrap();

    let mut causes = vec![rx.recv().unwrap(), rx.recv().unwrap(), rx.recv().unwrap()];
    causes.sort_by_key(|cause| format!("{cause:?}"));
    assert_eq!(*same.ends.lock().unwrap(), vec![EndCause::SameTaskBusy]);
    assert_eq!(*busy.ends.lock().unwrap(), vec![EndCause::FileBusy]);
    assert!(causes.contains(&EndCause::Completed));
    // Rejected submissions never started.
    assert!(same.started.lock().unwrap().is_empty());
    assert!(busy.started.lock().unwrap().is_empty());
}

#[test]
fn test_ready_queue_runs_higher_priority_first() {
    let mut server = MockServer::new(patterned_body(500));
    {
        let server = Arc::get_mut(&mut server).unwrap();
        server.delay = Duration::from_millis(80);
    }
    let store = Arc::new(MemoryBreakpointStore::new());
    let engine = Engine::builder()
        .store(store)
        .connection_factory(Arc::new(MockFactory {
            server: Arc::clone(&server),
        }))
        .max_parallel_running(1)
        .build()
        .unwrap();
    let dir = tempfile::tempdir().unwrap();

    let (tx, rx) = mpsc::channel();
    let order = Arc::new(Mutex::new(Vec::new()));

    struct OrderListener {
        order: Arc<Mutex<Vec<String>>>,
        done: mpsc::Sender<EndCause>,
    }
    impl DownloadListener for OrderListener {
        fn task_start(&self, task: &DownloadTask) {
            self.order.lock().unwrap().push(task.url().to_string());
        }
        fn task_end(&self, _task: &DownloadTask, cause: EndCause, _: Option<&DownloadError>) {
            let _ = self.done.send(cause);
        }
    }
    let listener = |order: &Arc<Mutex<Vec<String>>>| {
        Arc::new(OrderListener {
            order: Arc::clone(order),
            done: tx.clone(),
        })
    };

    // Occupies the single running slot.
    let blocker = DownloadTask::builder("https://mock/a", dir.path())
        .filename("a.bin")
        .build();
    engine.enqueue(blocker, listener(&order)).unwrap();

    // Queued while busy: the higher priority must start first.
    let low = DownloadTask::builder("https://mock/b", dir.path())
        .filename("b.bin")
        .priority(1)
        .build();
    engine.enqueue(low, listener(&order)).unwrap();
    let high = DownloadTask::builder("https://mock/c", dir.path())
        .filename("c.bin")
        .priority(3)
        .build();
    engine.enqueue(high, listener(&order)).unwrap();

    for _ in 0..3 {
        assert_eq!(rx.recv_timeout(Duration::from_secs(10)).unwrap(), EndCause::Completed);
    }
    assert_eq!(
        *order.lock().unwrap(),
        vec![
            "https://mock/a".to_string(),
            "https://mock/c".to_string(),
            "https://mock/b".to_string(),
        ]
    );
}

#[test]
fn test_persisted_offset_never_exceeds_file_contents() {
    // Crash-consistency surrogate: after a failure mid-transfer, the
    // store cursor must not run ahead of what is actually on disk.
    let server = MockServer::new(patterned_body(6666));
    let engine = engine_for(&server);
    let dir = tempfile::tempdir().unwrap();

    server.truncate_next(3000);
    let task = DownloadTask::builder("https://mock/file.bin", dir.path())
        .filename("file.bin")
        .build();
    let (cause, _) = engine.execute(task, Arc::new(NoopListener)).unwrap();
    assert_eq!(cause, EndCause::Error);

    let info = engine.store().get(1).unwrap();
    let on_disk = std::fs::metadata(dir.path().join("file.bin")).unwrap().len();
    assert!(info.total_offset() <= on_disk);
    assert_eq!(info.total_offset(), 3000);
}

#[test]
fn test_cancel_running_task_reports_canceled() {
    let mut server = MockServer::new(patterned_body(100_000));
    {
        let server = Arc::get_mut(&mut server).unwrap();
        server.delay = Duration::from_millis(100);
        server.accept_ranges = false; // single block, slow connect
    }
    let engine = Arc::new(engine_for(&server));
    let dir = tempfile::tempdir().unwrap();

    let (tx, rx) = mpsc::channel();
    let listener = RecordingListener::with_channel(tx);
    let task = DownloadTask::builder("https://mock/file.bin", dir.path())
        .filename("file.bin")
        .build();
    let id = engine.enqueue(task, listener).unwrap();

    std::thread::sleep(Duration::from_millis(20));
    assert!(engine.cancel(id));
    assert_eq!(
        rx.recv_timeout(Duration::from_secs(10)).unwrap(),
        EndCause::Canceled
    );
}

#[test]
fn test_shutdown_returns_unstarted_tasks() {
    let mut server = MockServer::new(patterned_body(500));
    {
        let server = Arc::get_mut(&mut server).unwrap();
        server.delay = Duration::from_millis(150);
    }
    let engine = Engine::builder()
        .store(Arc::new(MemoryBreakpointStore::new()))
        .connection_factory(Arc::new(MockFactory {
            server: Arc::clone(&server),
        }))
        .max_parallel_running(1)
        .build()
        .unwrap();
    let dir = tempfile::tempdir().unwrap();

    let running = DownloadTask::builder("https://mock/a", dir.path())
        .filename("a.bin")
        .build();
    engine.enqueue(running, Arc::new(NoopListener)).unwrap();
    let queued = DownloadTask::builder("https://mock/b", dir.path())
        .filename("b.bin")
        .build();
    engine.enqueue(queued, Arc::new(NoopListener)).unwrap();

    let drained = engine.shutdown();
    assert_eq!(drained.len(), 1);
    assert_eq!(drained[0].url(), "https://mock/b");

    // Intake is closed now.
    let late = DownloadTask::builder("https://mock/c", dir.path())
        .filename("c.bin")
        .build();
    assert!(engine.enqueue(late, Arc::new(NoopListener)).is_err());
}

#[test]
fn test_progress_callbacks_cover_all_bytes() {
    let body = patterned_body(50_000);
    let server = MockServer::new(body.clone());
    let engine = engine_for(&server);
    let dir = tempfile::tempdir().unwrap();

    struct SummingListener {
        total: Arc<Mutex<u64>>,
        events: Arc<AtomicUsize>,
    }
    impl DownloadListener for SummingListener {
        fn fetch_progress(&self, _task: &DownloadTask, _block: usize, increase_bytes: u64) {
            *self.total.lock().unwrap() += increase_bytes;
            self.events.fetch_add(1, Ordering::Relaxed);
        }
    }

    let total = Arc::new(Mutex::new(0u64));
    let events = Arc::new(AtomicUsize::new(0));
    let task = DownloadTask::builder("https://mock/file.bin", dir.path())
        .filename("file.bin")
        .min_progress_interval(Duration::ZERO)
        .build();
    let (cause, _) = engine
        .execute(
            task,
            Arc::new(SummingListener {
                total: Arc::clone(&total),
                events: Arc::clone(&events),
            }),
        )
        .unwrap();
    assert_eq!(cause, EndCause::Completed);
    assert_eq!(*total.lock().unwrap(), body.len() as u64);
    assert!(events.load(Ordering::Relaxed) > 0);
}
