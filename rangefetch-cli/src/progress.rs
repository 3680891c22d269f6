//! Progress-bar listener bridging engine callbacks to indicatif.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::Mutex;

use indicatif::{ProgressBar, ProgressStyle};
use rangefetch::speed::humanize_rate;
use rangefetch::{
    BreakpointInfo, DownloadError, DownloadListener, DownloadTask, EndCause, ResumeFailedCause,
    SpeedCalculator,
};

/// Drives one progress bar per task from listener callbacks.
pub struct ProgressListener {
    bar: ProgressBar,
    speed: Mutex<SpeedCalculator>,
    /// Set when the length came from a breakpoint record; per-block
    /// lengths are only summed into the bar for fresh downloads.
    length_known: AtomicBool,
    expected_total: Mutex<u64>,
}

impl ProgressListener {
    pub fn new(bar: ProgressBar) -> Arc<Self> {
        bar.set_style(
            ProgressStyle::with_template(
                "{msg:20!} [{bar:30.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, eta {eta})",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        Arc::new(Self {
            bar,
            speed: Mutex::new(SpeedCalculator::new()),
            length_known: AtomicBool::new(false),
            expected_total: Mutex::new(0),
        })
    }

    fn average_rate(&self) -> u64 {
        match self.speed.lock() {
            Ok(speed) => speed.average_speed(),
            Err(_) => 0,
        }
    }
}

impl DownloadListener for ProgressListener {
    fn task_start(&self, task: &DownloadTask) {
        let label = task.filename().unwrap_or_else(|| task.url().to_string());
        self.bar.set_message(label);
    }

    fn download_from_beginning(&self, _task: &DownloadTask, cause: ResumeFailedCause) {
        self.length_known.store(false, Ordering::Release);
        if let Ok(mut expected) = self.expected_total.lock() {
            *expected = 0;
        }
        self.bar.unset_length();
        self.bar.set_position(0);
        self.bar.println(format!("starting from scratch ({cause})"));
    }

    fn download_from_breakpoint(&self, _task: &DownloadTask, info: &BreakpointInfo) {
        self.length_known.store(true, Ordering::Release);
        self.bar.set_length(info.total_length());
        self.bar.set_position(info.total_offset());
        self.bar.println(format!(
            "resuming at {} of {} bytes",
            info.total_offset(),
            info.total_length()
        ));
    }

    fn fetch_start(&self, task: &DownloadTask, _block_index: usize, content_length: u64) {
        // For fresh downloads the block lengths sum to the total.
        if !self.length_known.load(Ordering::Acquire) && content_length != u64::MAX {
            if let Ok(mut expected) = self.expected_total.lock() {
                *expected += content_length;
                self.bar.set_length(*expected);
            }
        }
        if let Some(name) = task.filename() {
            self.bar.set_message(name);
        }
    }

    fn fetch_progress(&self, _task: &DownloadTask, _block_index: usize, increase_bytes: u64) {
        if let Ok(mut speed) = self.speed.lock() {
            speed.downloading(increase_bytes);
        }
        self.bar.inc(increase_bytes);
    }

    fn task_end(&self, _task: &DownloadTask, cause: EndCause, error: Option<&DownloadError>) {
        match cause {
            EndCause::Completed => {
                self.bar
                    .finish_with_message(format!("done ({})", humanize_rate(self.average_rate())));
            }
            EndCause::Canceled => self.bar.abandon_with_message("canceled"),
            EndCause::SameTaskBusy => self.bar.abandon_with_message("already in flight"),
            EndCause::FileBusy => self.bar.abandon_with_message("target file busy"),
            EndCause::PreAllocateFailed => self.bar.abandon_with_message("pre-allocation failed"),
            EndCause::Error => {
                let detail = error
                    .map(|err| err.to_string())
                    .unwrap_or_else(|| "unknown error".to_string());
                self.bar.abandon_with_message(format!("failed: {detail}"));
            }
        }
    }
}
