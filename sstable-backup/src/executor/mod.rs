//! Transfer executor: bounded concurrent batches of manifest entries.
//!
//! Uploads ([`backup::Backuper`]) and downloads ([`restore::Restorer`]) share
//! one batch runner:
//! - a `Semaphore` sized to the configured concurrency bounds in-flight transfers
//! - every entry runs as its own task in a `JoinSet`
//! - the first failure cancels the batch; queued entries never start
//! - manifest entries wait for every data entry before taking a permit
//! - a reporter task samples shared counters for progress

pub mod backup;
pub mod commitlog;
pub mod manifest;
pub mod predicates;
pub mod restore;

use crate::transfer::progress::{spawn_reporter, BatchCounters, ProgressTracker};
use crate::transfer::ProgressSink;
use crate::utils::{BackupError, Result};
use manifest::{EntryKind, ManifestEntry};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default number of concurrent transfers.
pub const DEFAULT_CONCURRENCY: usize = 10;

/// Default freshen requests per second.
pub const DEFAULT_FRESHEN_RATE: u64 = 100;

/// How often a waiting batch logs that it is still alive.
const JOIN_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Knobs shared by upload and download batches.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferOptions {
    /// Maximum transfers in flight
    pub concurrency: usize,

    /// Explicit byte-rate cap (bytes/second)
    pub bandwidth: Option<u64>,

    /// Target duration; derives a byte rate from the batch size
    pub duration: Option<Duration>,

    /// Freshen requests per second, `None` for unlimited
    pub freshen_rate: Option<u64>,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            bandwidth: None,
            duration: None,
            freshen_rate: Some(DEFAULT_FRESHEN_RATE),
        }
    }
}

/// Run `task` for every entry with at most `concurrency` in flight.
///
/// `task` receives the entry and the batch byte counter it should advance.
/// Manifest-kind entries start only after every data entry has finished.
/// Returns the first failure once all spawned tasks have settled.
pub(crate) async fn run_batch<F, Fut>(
    operation: &'static str,
    entries: Vec<ManifestEntry>,
    concurrency: usize,
    sink: Arc<dyn ProgressSink>,
    task: F,
) -> Result<()>
where
    F: Fn(ManifestEntry, Arc<AtomicU64>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let total_files = entries.len();
    let total_bytes: u64 = entries.iter().map(|e| e.size).sum();
    let data_entries = entries.iter().filter(|e| e.kind == EntryKind::Data).count();

    info!(
        "Starting {} batch: {} entries, {} bytes, concurrency {}",
        operation, total_files, total_bytes, concurrency
    );

    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let cancel = CancellationToken::new();
    let (completed_tx, completed_rx) = watch::channel(0usize);
    let completed_tx = Arc::new(completed_tx);
    let counters = Arc::new(BatchCounters::default());
    let task = Arc::new(task);

    let reporter_stop = CancellationToken::new();
    let reporter = spawn_reporter(
        ProgressTracker::new(operation, total_bytes, total_files),
        Arc::clone(&counters),
        sink,
        reporter_stop.clone(),
    );

    let mut tasks = JoinSet::new();
    for entry in entries {
        let semaphore = Arc::clone(&semaphore);
        let cancel = cancel.clone();
        let completed_tx = Arc::clone(&completed_tx);
        let mut completed_rx = completed_rx.clone();
        let counters = Arc::clone(&counters);
        let task = Arc::clone(&task);

        tasks.spawn(async move {
            let kind = entry.kind;
            let key = entry.destination_key.clone();

            if kind == EntryKind::Manifest {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(BackupError::Cancelled),
                    waited = wait_for_completions(&mut completed_rx, data_entries) => waited?,
                }
                debug!("All data entries settled, writing {}", key);
            }

            let _permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(BackupError::Cancelled),
                permit = semaphore.acquire_owned() => {
                    permit.map_err(|_| BackupError::Cancelled)?
                }
            };
            if cancel.is_cancelled() {
                return Err(BackupError::Cancelled);
            }

            let result = task(entry, Arc::clone(&counters.bytes)).await;
            if let Err(e) = &result {
                warn!("{} of {} failed: {}", operation, key, e);
                cancel.cancel();
            }

            counters.files.fetch_add(1, Ordering::Relaxed);
            if kind == EntryKind::Data {
                completed_tx.send_modify(|done| *done += 1);
            }
            result
        });
    }

    let mut first_error: Option<BackupError> = None;
    let mut cancelled = false;
    loop {
        match tokio::time::timeout(JOIN_POLL_INTERVAL, tasks.join_next()).await {
            Ok(Some(Ok(Ok(())))) => {}
            Ok(Some(Ok(Err(BackupError::Cancelled)))) => cancelled = true,
            Ok(Some(Ok(Err(e)))) => {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
            Ok(Some(Err(join_error))) => {
                cancel.cancel();
                if first_error.is_none() {
                    first_error = Some(BackupError::transfer(operation, join_error));
                }
            }
            Ok(None) => break,
            Err(_) => info!(
                "{} batch still running: {} of {} entries outstanding",
                operation,
                tasks.len(),
                total_files
            ),
        }
    }

    reporter_stop.cancel();
    if let Err(e) = reporter.await {
        warn!("Progress reporter for {} ended abnormally: {}", operation, e);
    }

    match first_error {
        Some(e) => Err(e),
        None if cancelled => Err(BackupError::Cancelled),
        None => {
            info!("{} batch complete: {} entries", operation, total_files);
            Ok(())
        }
    }
}

async fn wait_for_completions(rx: &mut watch::Receiver<usize>, target: usize) -> Result<()> {
    loop {
        let done = *rx.borrow_and_update();
        if done >= target {
            return Ok(());
        }
        rx.changed().await.map_err(|_| BackupError::Cancelled)?;
    }
}
