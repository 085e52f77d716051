//! Byte-level progress reporting for transfer batches.
//!
//! Workers advance shared atomic counters; a reporter task samples them on a
//! fixed interval and hands a `TransferProgress` snapshot to a `ProgressSink`.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Interval between progress reports.
pub const REPORT_INTERVAL: Duration = Duration::from_secs(5);

/// Snapshot of a batch in flight
#[derive(Debug, Clone, PartialEq)]
pub struct TransferProgress {
    /// Label of the batch ("upload", "download", ...)
    pub operation: &'static str,

    /// Total bytes the batch may transfer
    pub total_bytes: u64,

    /// Bytes moved so far
    pub transferred_bytes: u64,

    /// Instantaneous speed in bytes/second
    pub bytes_per_second: u64,

    /// Estimated time remaining (seconds)
    pub eta_seconds: u64,

    /// Percentage complete (0-100)
    pub percent_complete: f64,

    /// Entries finished (transferred, freshened or failed)
    pub files_processed: usize,

    /// Entries in the batch
    pub total_files: usize,
}

impl TransferProgress {
    pub fn new(operation: &'static str, total_bytes: u64, total_files: usize) -> Self {
        Self {
            operation,
            total_bytes,
            transferred_bytes: 0,
            bytes_per_second: 0,
            eta_seconds: 0,
            percent_complete: 0.0,
            files_processed: 0,
            total_files,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.files_processed >= self.total_files
    }
}

/// Receiver of periodic progress snapshots.
pub trait ProgressSink: Send + Sync {
    fn report(&self, progress: &TransferProgress);
}

/// Sink that writes progress to the log.
#[derive(Debug, Default)]
pub struct LogProgressSink;

impl ProgressSink for LogProgressSink {
    fn report(&self, p: &TransferProgress) {
        if p.is_complete() {
            info!(
                "{}: {} files done, {} moved",
                p.operation,
                p.files_processed,
                human_bytes(p.transferred_bytes)
            );
            return;
        }
        info!(
            "{}: {:.1}% ({} of {}) at {}/s, {}/{} files, {} left",
            p.operation,
            p.percent_complete,
            human_bytes(p.transferred_bytes),
            human_bytes(p.total_bytes),
            human_bytes(p.bytes_per_second),
            p.files_processed,
            p.total_files,
            human_eta(p.eta_seconds),
        );
    }
}

/// Sink that discards every report.
#[derive(Debug, Default)]
pub struct NullProgressSink;

impl ProgressSink for NullProgressSink {
    fn report(&self, _progress: &TransferProgress) {}
}

/// Counters shared between workers and the reporter.
#[derive(Debug, Default)]
pub struct BatchCounters {
    pub bytes: Arc<AtomicU64>,
    pub files: AtomicUsize,
}

/// Turns successive counter samples into speed and ETA.
pub struct ProgressTracker {
    last_update_time: Instant,
    last_bytes: u64,
    progress: TransferProgress,
}

impl ProgressTracker {
    pub fn new(operation: &'static str, total_bytes: u64, total_files: usize) -> Self {
        Self {
            last_update_time: Instant::now(),
            last_bytes: 0,
            progress: TransferProgress::new(operation, total_bytes, total_files),
        }
    }

    pub fn update(&mut self, transferred_bytes: u64, files_processed: usize) -> &TransferProgress {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update_time).as_secs_f64();

        if elapsed > 0.0 {
            let bytes_diff = transferred_bytes.saturating_sub(self.last_bytes);
            self.progress.bytes_per_second = (bytes_diff as f64 / elapsed) as u64;
        }

        let remaining = self.progress.total_bytes.saturating_sub(transferred_bytes);
        self.progress.eta_seconds = if self.progress.bytes_per_second > 0 {
            remaining / self.progress.bytes_per_second
        } else {
            0
        };

        self.progress.transferred_bytes = transferred_bytes;
        self.progress.files_processed = files_processed;
        self.progress.percent_complete = if self.progress.total_bytes > 0 {
            ((transferred_bytes as f64 / self.progress.total_bytes as f64) * 100.0).min(100.0)
        } else if self.progress.total_files > 0 {
            (files_processed as f64 / self.progress.total_files as f64) * 100.0
        } else {
            100.0
        };

        self.last_update_time = now;
        self.last_bytes = transferred_bytes;
        &self.progress
    }
}

/// Spawn the reporter; it stops when `stop` is cancelled, after a final report.
pub fn spawn_reporter(
    mut tracker: ProgressTracker,
    counters: Arc<BatchCounters>,
    sink: Arc<dyn ProgressSink>,
    stop: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(REPORT_INTERVAL);
        interval.tick().await;

        loop {
            let stopped = tokio::select! {
                _ = interval.tick() => false,
                _ = stop.cancelled() => true,
            };

            let progress = tracker.update(
                counters.bytes.load(Ordering::Relaxed),
                counters.files.load(Ordering::Relaxed),
            );
            sink.report(progress);

            if stopped {
                break;
            }
        }
    })
}

/// Byte count in binary units, e.g. `1.5 GiB`.
fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["KiB", "MiB", "GiB", "TiB", "PiB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = UNITS[0];
    for next in UNITS.into_iter().skip(1) {
        if value < 1024.0 {
            break;
        }
        value /= 1024.0;
        unit = next;
    }
    format!("{value:.1} {unit}")
}

/// Remaining time as `1h02m`, `4m05s` or `12s`.
fn human_eta(seconds: u64) -> String {
    match (seconds / 3600, seconds % 3600 / 60, seconds % 60) {
        (0, 0, s) => format!("{s}s"),
        (0, m, s) => format!("{m}m{s:02}s"),
        (h, m, _) => format!("{h}h{m:02}m"),
    }
}
