//! Restore side of the executor: diff a remote manifest against local state.
//!
//! A restore downloads `manifests/<tag>`, works out which local SSTables
//! already match (kept), which must be fetched and which are stale (deleted),
//! then downloads the fetch set through the batch runner. Every key in the
//! manifest looks like `data/<ks>/<tableDir>/[.<index>/]<hash>/<file>`; the
//! local target is the key with the leading `data/` replaced by the data
//! root and the hash segment removed.

use super::manifest::{parse_manifest, ManifestEntry, ManifestLine};
use super::predicates::{KeyspaceTable, RestorePredicate, Subset};
use super::{run_batch, TransferOptions};
use crate::fs::walker::{local_sstables, LocalSSTable};
use crate::sstable::hash::generation_hash;
use crate::sstable::SSTableName;
use crate::storage::{validate_object_key, StorageBackend};
use crate::transfer::{effective_rate, ProgressSink, RateLimiter};
use crate::utils::{BackupError, Result};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Key prefix of manifest files.
pub const MANIFESTS_PREFIX: &str = "manifests";

/// What to restore.
#[derive(Debug, Clone, Default)]
pub struct RestoreRequest {
    pub snapshot_tag: String,
    pub subset: Subset,
    pub restore_system_keyspace: bool,
    pub is_existing_cluster: bool,
}

/// Outcome of diffing a manifest against local files.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestorePlan {
    /// Local files whose content already matches the manifest
    pub keep: Vec<PathBuf>,

    /// Entries to download
    pub fetch: Vec<ManifestEntry>,

    /// Local candidates absent from (or superseded in) the manifest
    pub delete: Vec<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreSummary {
    pub kept_files: usize,
    pub downloaded_files: usize,
    pub downloaded_bytes: u64,
    pub deleted_files: usize,
}

pub struct Restorer {
    backend: Arc<dyn StorageBackend>,

    /// `<dataDir>/data`
    data_root: PathBuf,

    /// Where the downloaded manifest is kept
    staging_dir: PathBuf,
}

impl Restorer {
    pub fn new(backend: Arc<dyn StorageBackend>, data_root: PathBuf, staging_dir: PathBuf) -> Self {
        Self {
            backend,
            data_root,
            staging_dir,
        }
    }

    /// Download and parse `manifests/<tag>`.
    pub async fn fetch_manifest(&self, snapshot_tag: &str) -> Result<Vec<ManifestLine>> {
        let key = format!("{MANIFESTS_PREFIX}/{snapshot_tag}");
        let reference = self.backend.object_key_to_remote_reference(&key)?;
        let staged = self.staging_dir.join(MANIFESTS_PREFIX).join(snapshot_tag);

        self.backend
            .download_file(
                &staged,
                &reference,
                Arc::new(RateLimiter::unlimited()),
                Arc::new(AtomicU64::new(0)),
            )
            .await
            .map_err(|e| {
                BackupError::Manifest(format!("cannot download {}: {}", reference.canonical_path, e))
            })?;

        let text = tokio::fs::read_to_string(&staged).await?;
        let lines = parse_manifest(&text);
        info!("Manifest {} lists {} files", snapshot_tag, lines.len());
        Ok(lines)
    }

    /// Restore the snapshot named in `request`.
    ///
    /// Local files matching the manifest are left alone, stale local files
    /// are deleted and everything else is downloaded. Any single download
    /// failure aborts the restore.
    pub async fn restore(
        &self,
        request: &RestoreRequest,
        options: &TransferOptions,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<RestoreSummary> {
        let lines = self.fetch_manifest(&request.snapshot_tag).await?;

        let data_root = self.data_root.clone();
        let subset = request.subset.clone();
        let candidates = tokio::task::spawn_blocking(move || -> std::io::Result<Vec<LocalSSTable>> {
            let all = local_sstables(&data_root)?;
            Ok(all
                .into_iter()
                .filter(|c| subset.is_empty() || subset.contains(&c.table))
                .collect())
        })
        .await
        .map_err(|e| BackupError::Io(std::io::Error::other(e)))??;

        let existing_cluster = request.is_existing_cluster || !candidates.is_empty();
        let predicate = RestorePredicate::new(
            request.subset.clone(),
            existing_cluster,
            request.restore_system_keyspace,
        );
        info!(
            "Restoring {} as {:?} ({} local candidates)",
            request.snapshot_tag,
            predicate.scenario(),
            candidates.len()
        );

        let data_root = self.data_root.clone();
        let plan = tokio::task::spawn_blocking(move || {
            plan_restore(&data_root, &lines, &predicate, candidates)
        })
        .await
        .map_err(|e| BackupError::Io(std::io::Error::other(e)))??;

        info!(
            "Restore plan: keep {}, download {}, delete {}",
            plan.keep.len(),
            plan.fetch.len(),
            plan.delete.len()
        );

        for stale in &plan.delete {
            match tokio::fs::remove_file(stale).await {
                Ok(()) => debug!("Deleted stale {}", stale.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        let downloaded_bytes = self.download(plan.fetch.clone(), options, sink).await?;

        Ok(RestoreSummary {
            kept_files: plan.keep.len(),
            downloaded_files: plan.fetch.len(),
            downloaded_bytes,
            deleted_files: plan.delete.len(),
        })
    }

    /// Download `entries` to their local paths through the batch runner.
    ///
    /// Entries with a non-zero size are verified against the bytes written.
    pub async fn download(
        &self,
        entries: Vec<ManifestEntry>,
        options: &TransferOptions,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<u64> {
        if entries.is_empty() {
            info!("Nothing to download");
            return Ok(0);
        }

        let total: u64 = entries.iter().map(|e| e.size).sum();
        let limiter = Arc::new(RateLimiter::from_rate(effective_rate(
            total,
            options.duration,
            options.bandwidth,
        )));
        let written_total = Arc::new(AtomicU64::new(0));

        let backend = Arc::clone(&self.backend);
        let task_total = Arc::clone(&written_total);
        let result = run_batch("download", entries, options.concurrency, sink, move |entry, transferred| {
            let backend = Arc::clone(&backend);
            let limiter = Arc::clone(&limiter);
            let written_total = Arc::clone(&task_total);
            async move {
                let reference = backend.object_key_to_remote_reference(&entry.destination_key)?;
                let written = backend
                    .download_file(&entry.local_path, &reference, limiter, transferred)
                    .await
                    .map_err(|e| match e {
                        BackupError::Transfer { .. } => e,
                        other => BackupError::transfer(&entry.destination_key, other),
                    })?;

                if entry.size > 0 && written != entry.size {
                    return Err(BackupError::transfer(
                        &entry.destination_key,
                        format!("expected {} bytes, received {}", entry.size, written),
                    ));
                }
                written_total.fetch_add(written, Ordering::Relaxed);
                debug!("Downloaded {} to {}", reference.canonical_path, entry.local_path.display());
                Ok(())
            }
        })
        .await;

        if let Err(e) = self.backend.cleanup().await {
            warn!("{}", BackupError::Cleanup(e.to_string()));
        }
        result?;
        Ok(written_total.load(Ordering::Relaxed))
    }
}

/// Where a manifest key lands locally, and the hash segment it carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreTarget {
    /// Path relative to the data root, slash separated
    pub relative: String,
    pub hash: String,
    pub table: KeyspaceTable,
}

impl RestoreTarget {
    /// Split a `data/...` key. The hash is the segment just above the file
    /// name, which also holds for keys carrying a secondary index directory.
    ///
    /// Returns `None` for keys outside `data/` and for keys with anything
    /// other than plain-name segments.
    pub fn from_key(key: &str) -> Option<Self> {
        validate_object_key(key).ok()?;
        let segments: Vec<&str> = key.split('/').collect();
        if segments.len() < 5 || segments[0] != "data" {
            return None;
        }
        let hash_index = segments.len() - 2;
        let relative = segments[1..hash_index]
            .iter()
            .chain(std::iter::once(&segments[hash_index + 1]))
            .copied()
            .collect::<Vec<_>>()
            .join("/");

        Some(Self {
            relative,
            hash: segments[hash_index].to_string(),
            table: KeyspaceTable::from_table_dir(segments[1], segments[2]),
        })
    }
}

/// Compute keep, fetch and delete sets.
///
/// Candidates outside `predicate` are never deleted. Hashes are computed
/// once per local generation. A manifest key that could resolve outside
/// `data_root` fails the whole plan.
pub fn plan_restore(
    data_root: &Path,
    lines: &[ManifestLine],
    predicate: &RestorePredicate,
    candidates: Vec<LocalSSTable>,
) -> Result<RestorePlan> {
    let mut plan = RestorePlan::default();
    let mut hashes: HashMap<(PathBuf, u64), Option<String>> = HashMap::new();
    let mut matched: HashSet<String> = HashSet::new();

    for line in lines {
        validate_object_key(&line.destination_key)
            .map_err(|e| BackupError::Manifest(e.to_string()))?;
        let Some(target) = RestoreTarget::from_key(&line.destination_key) else {
            debug!("Skipping non-table manifest entry {}", line.destination_key);
            continue;
        };
        if !predicate.includes(&target.table) {
            continue;
        }

        let local_path = data_root.join(&target.relative);
        let unchanged = local_path.is_file()
            && local_hash(&local_path, &mut hashes).as_deref() == Some(target.hash.as_str());
        if unchanged {
            matched.insert(target.relative);
            plan.keep.push(local_path);
            continue;
        }

        matched.insert(target.relative);
        plan.fetch.push(ManifestEntry::data(
            line.destination_key.clone(),
            local_path,
            line.size,
        ));
    }

    let fetched: HashSet<&Path> = plan.fetch.iter().map(|e| e.local_path.as_path()).collect();
    let mut delete = Vec::new();
    for candidate in candidates {
        if !predicate.includes(&candidate.table) {
            continue;
        }
        let superseded = fetched.contains(candidate.path.as_path());
        if !matched.contains(&candidate.relative) || superseded {
            delete.push(candidate.path);
        }
    }
    plan.delete = delete;
    Ok(plan)
}

fn local_hash(path: &Path, cache: &mut HashMap<(PathBuf, u64), Option<String>>) -> Option<String> {
    let name = SSTableName::from_path(path).ok()?;
    let dir = path.parent()?.to_path_buf();
    cache
        .entry((dir, name.generation))
        .or_insert_with(|| match generation_hash(path) {
            Ok(hash) => Some(hash),
            Err(e) => {
                warn!("Cannot hash {}: {}", path.display(), e);
                None
            }
        })
        .clone()
}
