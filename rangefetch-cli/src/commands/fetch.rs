//! Fetch command - download one or more URLs with resumable progress.

use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;

use clap::Args;
use indicatif::{MultiProgress, ProgressBar};
use rangefetch::{
    DownloadError, DownloadListener, DownloadTask, EndCause, Engine, JournalBreakpointStore,
};

use crate::error::CliError;
use crate::progress::ProgressListener;

/// Arguments for the fetch command.
#[derive(Debug, Args)]
pub struct FetchArgs {
    /// URLs to download
    #[arg(required = true)]
    pub urls: Vec<String>,

    /// Directory to place downloads in
    #[arg(short = 'd', long, default_value = ".")]
    pub dir: PathBuf,

    /// Target filename (only valid with a single URL)
    #[arg(short = 'o', long)]
    pub output: Option<String>,

    /// Maximum tasks downloading at once
    #[arg(long, default_value_t = 4)]
    pub parallel: usize,

    /// Disable pre-allocating files to their final size
    #[arg(long)]
    pub no_pre_allocate: bool,

    /// Path of the resume journal
    #[arg(long)]
    pub journal: Option<PathBuf>,
}

/// Listener decorating the per-bar listener with a completion channel so
/// the command can wait for all tasks.
struct CompletionListener {
    inner: Arc<ProgressListener>,
    done: mpsc::Sender<(EndCause, Option<String>)>,
}

impl DownloadListener for CompletionListener {
    fn task_start(&self, task: &DownloadTask) {
        self.inner.task_start(task);
    }

    fn download_from_beginning(
        &self,
        task: &DownloadTask,
        cause: rangefetch::ResumeFailedCause,
    ) {
        self.inner.download_from_beginning(task, cause);
    }

    fn download_from_breakpoint(&self, task: &DownloadTask, info: &rangefetch::BreakpointInfo) {
        self.inner.download_from_breakpoint(task, info);
    }

    fn fetch_start(&self, task: &DownloadTask, block_index: usize, content_length: u64) {
        self.inner.fetch_start(task, block_index, content_length);
    }

    fn fetch_progress(&self, task: &DownloadTask, block_index: usize, increase_bytes: u64) {
        self.inner.fetch_progress(task, block_index, increase_bytes);
    }

    fn task_end(&self, task: &DownloadTask, cause: EndCause, error: Option<&DownloadError>) {
        self.inner.task_end(task, cause, error);
        let _ = self.done.send((cause, error.map(|err| err.to_string())));
    }
}

/// Run the fetch command.
pub fn run(args: FetchArgs) -> Result<(), CliError> {
    if args.output.is_some() && args.urls.len() > 1 {
        return Err(CliError::Config(
            "--output only applies to a single URL".to_string(),
        ));
    }

    let journal_path = args
        .journal
        .clone()
        .unwrap_or_else(|| args.dir.join(".rangefetch-journal.json"));
    let store = JournalBreakpointStore::open(&journal_path)
        .map_err(|err| CliError::Store(err.to_string()))?;
    tracing::debug!(journal = %journal_path.display(), "using resume journal");

    let engine = Engine::builder()
        .store(Arc::new(store))
        .pre_allocate(!args.no_pre_allocate)
        .max_parallel_running(args.parallel.max(1))
        .build()
        .map_err(|err| CliError::Config(err.to_string()))?;
    let engine = Arc::new(engine);

    let canceler = Arc::clone(&engine);
    ctrlc::set_handler(move || {
        tracing::info!("interrupt received, canceling downloads");
        eprintln!();
        eprintln!("Received interrupt, stopping downloads (progress is kept)...");
        canceler.cancel_all();
    })
    .map_err(|err| CliError::Config(format!("failed to set signal handler: {err}")))?;

    let bars = MultiProgress::new();
    let (done_tx, done_rx) = mpsc::channel();

    for url in &args.urls {
        let bar = bars.add(ProgressBar::new_spinner());
        let listener = Arc::new(CompletionListener {
            inner: ProgressListener::new(bar),
            done: done_tx.clone(),
        });

        let mut builder = DownloadTask::builder(url, &args.dir);
        if let Some(output) = &args.output {
            builder = builder.filename(output);
        }
        engine
            .enqueue(builder.build(), listener)
            .map_err(|err| CliError::Download(err.to_string()))?;
    }
    drop(done_tx);

    let mut failures = Vec::new();
    let mut canceled = false;
    for (cause, error) in done_rx.iter() {
        match cause {
            EndCause::Completed => {}
            EndCause::Canceled => canceled = true,
            other => failures.push(match error {
                Some(detail) => detail,
                None => format!("{other:?}"),
            }),
        }
    }

    if let Some(first) = failures.into_iter().next() {
        return Err(CliError::Download(first));
    }
    if canceled {
        return Err(CliError::Canceled);
    }
    Ok(())
}
