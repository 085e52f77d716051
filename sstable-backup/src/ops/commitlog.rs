//! Commit-log archiving and point-in-time restore.

use super::OperationContext;
use crate::executor::backup::{Backuper, UploadSummary};
use crate::executor::commitlog::{
    is_segment_file, segment_key, select_segments, RemoteSegment, COMMITLOG_PREFIX,
};
use crate::executor::manifest::{Manifest, ManifestEntry};
use crate::executor::restore::Restorer;
use crate::storage::RemoteObjectReference;
use crate::utils::{BackupError, Result};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use filetime::FileTime;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Properties file the node reads to replay archived segments.
pub const ARCHIVING_PROPERTIES: &str = "commitlog_archiving.properties";

const RESTORE_COMMAND: &str = "cp -f %from %to";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitlogBackupSummary {
    pub segments: usize,
    pub upload: UploadSummary,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitlogRestoreSummary {
    pub segments: usize,
    pub bytes: u64,

    /// Where live segments were moved, if there were any
    pub moved_aside: Option<PathBuf>,

    pub properties: Option<PathBuf>,
}

/// Upload every live segment keyed by its modification time, draining the
/// node first when asked.
pub async fn commitlog_backup(ctx: &OperationContext, drain: bool) -> Result<CommitlogBackupSummary> {
    let _lock = ctx.lock().await?;
    if drain {
        info!("Draining node before commit-log backup");
        ctx.node.drain().await?;
    }

    let segments = local_segments(&ctx.config.commitlog_dir()).await?;
    let mut manifest = Manifest::default();
    for (path, size, millis) in segments {
        let name = file_name(&path);
        manifest.push(ManifestEntry::data(segment_key(&name, millis), path, size));
    }
    let count = manifest.len();
    info!("Backing up {} commit-log segments", count);

    let options = ctx.config.transfer_options()?;
    let upload = Backuper::new(Arc::clone(&ctx.backend))
        .upload_or_freshen(manifest, &options, Arc::clone(&ctx.sink))
        .await?;
    Ok(CommitlogBackupSummary {
        segments: count,
        upload,
    })
}

/// Fetch the segments covering `[start, end]` (epoch milliseconds) into the
/// restore directory and write the archiving properties for replay.
pub async fn commitlog_restore(
    ctx: &OperationContext,
    start: u64,
    end: u64,
) -> Result<CommitlogRestoreSummary> {
    if start > end {
        return Err(BackupError::Config(format!(
            "restore window start {start} is after end {end}"
        )));
    }
    let _lock = ctx.lock().await?;

    let prefix = ctx.backend.object_key_to_remote_reference(COMMITLOG_PREFIX)?;
    let mut remote = Vec::new();
    ctx.backend
        .consume_files(&prefix, &mut |reference: RemoteObjectReference| {
            if let Some(segment) = RemoteSegment::from_key(&reference.object_key) {
                remote.push(segment);
            }
        })
        .await?;

    let selected = select_segments(remote, start, end);
    if selected.is_empty() {
        warn!("No commit-log segments cover {}..{}", start, end);
        return Ok(CommitlogRestoreSummary::default());
    }
    info!(
        "Restoring {} commit-log segments ({}..{})",
        selected.len(),
        selected.first().map_or(0, |s| s.timestamp),
        selected.last().map_or(0, |s| s.timestamp)
    );

    let moved_aside = move_live_segments_aside(&ctx.config.commitlog_dir()).await?;

    let restore_dir = ctx.config.commitlog_restore_dir();
    tokio::fs::create_dir_all(&restore_dir).await?;
    let entries: Vec<ManifestEntry> = selected
        .iter()
        .map(|s| ManifestEntry::data(s.key.clone(), restore_dir.join(&s.file_name), 0))
        .collect();

    let options = ctx.config.transfer_options()?;
    let restorer = Restorer::new(
        Arc::clone(&ctx.backend),
        ctx.config.data_root(),
        ctx.config.staging_dir(),
    );
    let bytes = restorer
        .download(entries, &options, Arc::clone(&ctx.sink))
        .await?;

    let properties = ctx.config.node.config_dir.join(ARCHIVING_PROPERTIES);
    write_archiving_properties(&properties, &restore_dir, end).await?;

    Ok(CommitlogRestoreSummary {
        segments: selected.len(),
        bytes,
        moved_aside,
        properties: Some(properties),
    })
}

/// `(path, size, mtime millis)` of each segment in `dir`, sorted by name.
async fn local_segments(dir: &Path) -> Result<Vec<(PathBuf, u64, u64)>> {
    let mut segments = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!("Commit-log directory {} does not exist", dir.display());
            return Ok(segments);
        }
        Err(e) => return Err(e.into()),
    };

    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().to_string();
        if !is_segment_file(&name) {
            continue;
        }
        let metadata = entry.metadata().await?;
        if !metadata.is_file() {
            continue;
        }
        let mtime = FileTime::from_last_modification_time(&metadata);
        let millis = u64::try_from(mtime.unix_seconds()).unwrap_or(0) * 1000
            + u64::from(mtime.nanoseconds() / 1_000_000);
        segments.push((entry.path(), metadata.len(), millis));
    }
    segments.sort();
    Ok(segments)
}

/// Move live segments into `<parent>/commitlog_backup_<yyyyMMddHHmmss>`.
async fn move_live_segments_aside(commitlog_dir: &Path) -> Result<Option<PathBuf>> {
    let live = local_segments(commitlog_dir).await?;
    if live.is_empty() {
        return Ok(None);
    }

    let parent = commitlog_dir.parent().unwrap_or(commitlog_dir);
    let aside = parent.join(format!(
        "commitlog_backup_{}",
        Utc::now().format("%Y%m%d%H%M%S")
    ));
    tokio::fs::create_dir_all(&aside).await?;
    for (path, _, _) in &live {
        tokio::fs::rename(path, aside.join(file_name(path))).await?;
    }
    info!("Moved {} live segments to {}", live.len(), aside.display());
    Ok(Some(aside))
}

async fn write_archiving_properties(path: &Path, restore_dir: &Path, end: u64) -> Result<()> {
    let point_in_time = DateTime::<Utc>::from_timestamp_millis(end as i64)
        .ok_or_else(|| BackupError::Config(format!("timestamp {end} is out of range")))?;
    let content = format!(
        "restore_command={}\nrestore_directories={}\nrestore_point_in_time={}\n",
        RESTORE_COMMAND,
        restore_dir.display(),
        point_in_time.format("%Y:%m:%d %H:%M:%S")
    );
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, content).await?;
    info!("Wrote {}", path.display());
    Ok(())
}

/// Parse a restore window bound: RFC 3339, `YYYY-MM-DD HH:MM:SS` (UTC) or
/// epoch milliseconds.
pub fn parse_timestamp(value: &str) -> Result<u64> {
    let value = value.trim();
    if let Ok(millis) = value.parse::<u64>() {
        return Ok(millis);
    }
    let parsed = DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .or_else(|_| {
            NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S")
                .map(|t| Utc.from_utc_datetime(&t))
        })
        .map_err(|_| BackupError::Config(format!("cannot parse timestamp '{value}'")))?;
    u64::try_from(parsed.timestamp_millis())
        .map_err(|_| BackupError::Config(format!("timestamp '{value}' is before the epoch")))
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}
