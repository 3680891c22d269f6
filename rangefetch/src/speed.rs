//! Transfer-rate bookkeeping for progress reporting.

use std::time::{Duration, Instant};

/// Accumulates byte counts and turns them into instantaneous and average
/// rates. One calculator per task (or per block, if a caller wants
/// per-block rates); not thread-safe by itself, callers serialize access.
pub struct SpeedCalculator {
    begin: Instant,
    window_start: Instant,
    window_bytes: u64,
    all_bytes: u64,
    last_rate: u64,
}

impl SpeedCalculator {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            begin: now,
            window_start: now,
            window_bytes: 0,
            all_bytes: 0,
            last_rate: 0,
        }
    }

    /// Records bytes transferred since the previous call.
    pub fn downloading(&mut self, increase_bytes: u64) {
        self.window_bytes += increase_bytes;
        self.all_bytes += increase_bytes;
    }

    /// Instantaneous rate in bytes per second over the window since the
    /// last flush, then starts a new window. Returns the previous rate
    /// when the window is too short to measure.
    pub fn flush_speed(&mut self) -> u64 {
        let elapsed = self.window_start.elapsed();
        if elapsed < Duration::from_millis(1) {
            return self.last_rate;
        }
        let rate = per_second(self.window_bytes, elapsed);
        self.window_start = Instant::now();
        self.window_bytes = 0;
        self.last_rate = rate;
        rate
    }

    /// Average rate in bytes per second since construction.
    pub fn average_speed(&self) -> u64 {
        per_second(self.all_bytes, self.begin.elapsed())
    }

    pub fn total_bytes(&self) -> u64 {
        self.all_bytes
    }
}

impl Default for SpeedCalculator {
    fn default() -> Self {
        Self::new()
    }
}

fn per_second(bytes: u64, elapsed: Duration) -> u64 {
    let millis = elapsed.as_millis().max(1) as u64;
    bytes.saturating_mul(1000) / millis
}

/// Renders a byte rate like `3.2 MiB/s`.
pub fn humanize_rate(bytes_per_second: u64) -> String {
    const UNITS: [&str; 4] = ["B/s", "KiB/s", "MiB/s", "GiB/s"];
    let mut value = bytes_per_second as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes_per_second} {}", UNITS[0])
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
