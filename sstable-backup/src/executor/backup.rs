//! Upload side of the executor: freshen-or-upload over a manifest.

use super::manifest::{EntryKind, Manifest, ManifestEntry};
use super::{run_batch, TransferOptions};
use crate::storage::{FreshenResult, StorageBackend};
use crate::transfer::stream::open_file_stream;
use crate::transfer::{effective_rate, ProgressSink, RateLimiter};
use crate::utils::{BackupError, Result};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What an upload batch did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadSummary {
    pub uploaded_files: usize,
    pub uploaded_bytes: u64,
    pub freshened_files: usize,
}

#[derive(Default)]
struct UploadStats {
    uploaded_files: AtomicUsize,
    uploaded_bytes: AtomicU64,
    freshened_files: AtomicUsize,
}

pub struct Backuper {
    backend: Arc<dyn StorageBackend>,
}

impl Backuper {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    /// Freshen or upload every entry of `manifest`.
    ///
    /// Data entries already present remotely under their content-addressed
    /// key are only freshened. Manifest entries are always uploaded and
    /// complete after every data entry. The backend is cleaned up once at
    /// the end whatever the outcome.
    pub async fn upload_or_freshen(
        &self,
        manifest: Manifest,
        options: &TransferOptions,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<UploadSummary> {
        if manifest.is_empty() {
            info!("Nothing to upload");
            return Ok(UploadSummary::default());
        }

        let rate = effective_rate(manifest.total_bytes(), options.duration, options.bandwidth);
        match rate {
            Some(rate) => info!("Upload rate limited to {} bytes/s", rate),
            None => debug!("Upload rate unlimited"),
        }
        let limiter = Arc::new(RateLimiter::from_rate(rate));
        let freshen_limiter = Arc::new(RateLimiter::from_rate(options.freshen_rate));
        let stats = Arc::new(UploadStats::default());

        let backend = Arc::clone(&self.backend);
        let task_stats = Arc::clone(&stats);
        let result = run_batch(
            "upload",
            manifest.entries,
            options.concurrency,
            sink,
            move |entry, transferred| {
                let backend = Arc::clone(&backend);
                let limiter = Arc::clone(&limiter);
                let freshen_limiter = Arc::clone(&freshen_limiter);
                let stats = Arc::clone(&task_stats);
                async move {
                    upload_entry(backend, entry, limiter, freshen_limiter, transferred, stats).await
                }
            },
        )
        .await;

        if let Err(e) = self.backend.cleanup().await {
            warn!("{}", BackupError::Cleanup(e.to_string()));
        }

        result?;
        Ok(UploadSummary {
            uploaded_files: stats.uploaded_files.load(Ordering::Relaxed),
            uploaded_bytes: stats.uploaded_bytes.load(Ordering::Relaxed),
            freshened_files: stats.freshened_files.load(Ordering::Relaxed),
        })
    }
}

async fn upload_entry(
    backend: Arc<dyn StorageBackend>,
    entry: ManifestEntry,
    limiter: Arc<RateLimiter>,
    freshen_limiter: Arc<RateLimiter>,
    transferred: Arc<AtomicU64>,
    stats: Arc<UploadStats>,
) -> Result<()> {
    let reference = backend.object_key_to_remote_reference(&entry.destination_key)?;

    if entry.kind == EntryKind::Data {
        freshen_limiter.acquire(1).await;
        match backend.freshen_remote_object(&reference).await {
            Ok(FreshenResult::Freshened) => {
                debug!("Freshened {}", reference.canonical_path);
                transferred.fetch_add(entry.size, Ordering::Relaxed);
                stats.freshened_files.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
            Ok(FreshenResult::UploadRequired) => {}
            Err(e) => {
                let failure = BackupError::FreshenCheck {
                    key: entry.destination_key.clone(),
                    reason: e.to_string(),
                };
                warn!("{}; uploading instead", failure);
            }
        }
    }

    let stream = open_file_stream(&entry.local_path, limiter, transferred)
        .await
        .map_err(|e| BackupError::transfer(&entry.destination_key, e))?;
    backend
        .upload_file(entry.size, stream, &reference)
        .await
        .map_err(|e| match e {
            BackupError::Transfer { .. } => e,
            other => BackupError::transfer(&entry.destination_key, other),
        })?;

    debug!("Uploaded {} ({} bytes)", reference.canonical_path, entry.size);
    stats.uploaded_files.fetch_add(1, Ordering::Relaxed);
    stats.uploaded_bytes.fetch_add(entry.size, Ordering::Relaxed);
    Ok(())
}
