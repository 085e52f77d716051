//! Snapshot backup.

use super::OperationContext;
use crate::executor::backup::{Backuper, UploadSummary};
use crate::executor::manifest::{build_table_manifest, Manifest, ManifestEntry};
use crate::executor::restore::MANIFESTS_PREFIX;
use crate::fs::walker::{table_directories, TableDir};
use crate::node::tokens::{render_token_file, token_key};
use crate::node::NodeControl;
use crate::utils::{BackupError, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Default)]
pub struct BackupRequest {
    pub snapshot_tag: String,

    /// Keyspaces to snapshot; all when empty
    pub keyspaces: Vec<String>,

    /// Limit the snapshot to one table of the keyspaces
    pub table: Option<String>,
}

impl BackupRequest {
    /// A table filter only makes sense within a single keyspace.
    pub fn validate(&self) -> Result<()> {
        match &self.table {
            Some(table) if self.keyspaces.len() != 1 => Err(BackupError::Config(format!(
                "--table {table} requires exactly one keyspace"
            ))),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackupSummary {
    pub tables: usize,
    pub data_files: usize,
    pub upload: UploadSummary,
}

/// Clears the snapshot at most once.
struct SnapshotGuard {
    node: Arc<dyn NodeControl>,
    tag: Option<String>,
}

impl SnapshotGuard {
    fn new(node: Arc<dyn NodeControl>, tag: &str) -> Self {
        Self {
            node,
            tag: Some(tag.to_string()),
        }
    }

    async fn clear(&mut self) {
        let Some(tag) = self.tag.take() else {
            return;
        };
        match self.node.clear_snapshot(&tag).await {
            Ok(()) => info!("Cleared snapshot {}", tag),
            Err(e) => warn!("Failed to clear snapshot {}: {}", tag, e),
        }
    }
}

impl Drop for SnapshotGuard {
    fn drop(&mut self) {
        if let Some(tag) = &self.tag {
            warn!("Snapshot {} was not cleared; remove it with `nodetool clearsnapshot -t {}`", tag, tag);
        }
    }
}

/// Snapshot the node, upload the token file, then upload every snapshot
/// file followed by the manifest. The snapshot is cleared afterwards
/// whether or not the upload succeeded.
pub async fn backup(ctx: &OperationContext, request: &BackupRequest) -> Result<BackupSummary> {
    request.validate()?;
    let _lock = ctx.lock().await?;

    info!(
        "Taking snapshot {} for {}",
        request.snapshot_tag,
        ctx.backend.location()
    );
    ctx.node
        .take_snapshot(&request.keyspaces, &request.snapshot_tag, request.table.as_deref())
        .await?;

    let mut guard = SnapshotGuard::new(Arc::clone(&ctx.node), &request.snapshot_tag);
    let result = upload_snapshot(ctx, request).await;
    guard.clear().await;
    result
}

async fn upload_snapshot(ctx: &OperationContext, request: &BackupRequest) -> Result<BackupSummary> {
    let options = ctx.config.transfer_options()?;
    let staging = ctx.config.staging_dir();
    let tag = request.snapshot_tag.clone();

    let data_root = ctx.config.data_root();
    let selection = request.clone();
    let (tables, mut manifest) = tokio::task::spawn_blocking(move || {
        build_snapshot_manifest(&data_root, &selection)
    })
    .await
    .map_err(|e| BackupError::Io(std::io::Error::other(e)))??;

    let data_files = manifest.data_file_count();
    if data_files == 0 {
        return Err(BackupError::NoDataCaptured);
    }
    info!(
        "Snapshot {} covers {} tables, {} data files, {} bytes",
        tag,
        tables,
        data_files,
        manifest.total_bytes()
    );

    let backuper = Backuper::new(Arc::clone(&ctx.backend));

    let tokens = ctx.node.get_tokens().await?;
    let token_path = staging.join("tokens").join(format!("{tag}-tokens.yaml"));
    let token_entry = stage_file(&token_path, &token_key(&tag), &render_token_file(&tokens, &tag)).await?;
    backuper
        .upload_or_freshen(Manifest::new(vec![token_entry]), &options, Arc::clone(&ctx.sink))
        .await?;

    let manifest_path = staging.join(MANIFESTS_PREFIX).join(&tag);
    let manifest_key = format!("{MANIFESTS_PREFIX}/{tag}");
    let manifest_entry = stage_file(&manifest_path, &manifest_key, &manifest.to_text()).await?;
    manifest.push(manifest_entry);

    let upload = backuper
        .upload_or_freshen(manifest, &options, Arc::clone(&ctx.sink))
        .await?;
    info!(
        "Backup {} complete: {} uploaded ({} bytes), {} already present",
        tag, upload.uploaded_files, upload.uploaded_bytes, upload.freshened_files
    );

    Ok(BackupSummary {
        tables,
        data_files,
        upload,
    })
}

/// Manifest over every selected table's snapshot directory.
fn build_snapshot_manifest(data_root: &Path, request: &BackupRequest) -> Result<(usize, Manifest)> {
    let mut manifest = Manifest::default();
    let mut tables = 0;
    for table in table_directories(data_root)? {
        if !is_selected(&table, request) {
            continue;
        }
        let snapshot_dir = table.snapshot_dir(&request.snapshot_tag);
        let table_manifest = build_table_manifest(&snapshot_dir, &table.backup_root())?;
        if !table_manifest.is_empty() {
            tables += 1;
            manifest.extend(table_manifest);
        }
    }
    Ok((tables, manifest))
}

fn is_selected(table: &TableDir, request: &BackupRequest) -> bool {
    let name = table.keyspace_table();
    let keyspace_ok = request.keyspaces.is_empty() || request.keyspaces.contains(&name.keyspace);
    let table_ok = request.table.as_ref().is_none_or(|t| *t == name.table);
    keyspace_ok && table_ok
}

/// Write `content` to `path` and describe it as an always-uploaded entry.
async fn stage_file(path: &Path, key: &str, content: &str) -> Result<ManifestEntry> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, content).await?;
    Ok(ManifestEntry::manifest(
        key.to_string(),
        path.to_path_buf(),
        content.len() as u64,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::node::testing::RecordingNode;
    use crate::storage::memory::MemoryBackend;
    use crate::transfer::NullProgressSink;
    use std::fs;
    use tempfile::TempDir;

    fn context(dir: &TempDir, node: Arc<RecordingNode>) -> (OperationContext, Arc<MemoryBackend>) {
        let mut config = Config::default();
        config.node.data_dir = dir.path().to_path_buf();
        config.transfer.freshen_rate = 0;
        let backend = Arc::new(MemoryBackend::new());
        let ctx = OperationContext {
            config,
            backend: backend.clone(),
            node,
            sink: Arc::new(NullProgressSink),
        };
        (ctx, backend)
    }

    fn clear_count(node: &RecordingNode) -> usize {
        node.calls()
            .iter()
            .filter(|c| c.starts_with("clearsnapshot"))
            .count()
    }

    fn seed_snapshot(data_dir: &Path, table: &str, tag: &str) {
        let snapshot = data_dir.join("data").join(table).join("snapshots").join(tag);
        fs::create_dir_all(&snapshot).unwrap();
        fs::write(snapshot.join("mc-1-big-Data.db"), b"rows").unwrap();
        fs::write(snapshot.join("mc-1-big-Digest.crc32"), b"77").unwrap();
    }

    #[tokio::test]
    async fn test_backup_uploads_tokens_data_and_manifest() {
        let dir = TempDir::new().unwrap();
        seed_snapshot(dir.path(), "shop/orders-a1", "snap-1");
        seed_snapshot(dir.path(), "inventory/items-b2", "snap-1");
        let node = Arc::new(RecordingNode {
            tokens: vec!["42".to_string()],
            ..RecordingNode::default()
        });
        let (ctx, backend) = context(&dir, node.clone());

        let request = BackupRequest {
            snapshot_tag: "snap-1".to_string(),
            keyspaces: vec!["shop".to_string()],
            table: None,
        };
        let summary = backup(&ctx, &request).await.unwrap();

        assert_eq!(summary.tables, 1);
        assert_eq!(summary.data_files, 1);
        assert_eq!(
            backend.keys(),
            vec![
                "data/shop/orders-a1/1-77/mc-1-big-Data.db",
                "data/shop/orders-a1/1-77/mc-1-big-Digest.crc32",
                "manifests/snap-1",
                "tokens/snap-1-tokens.yaml",
            ]
        );
        let manifest = String::from_utf8(backend.get("manifests/snap-1").unwrap()).unwrap();
        assert!(manifest.contains("4 data/shop/orders-a1/1-77/mc-1-big-Data.db\n"));
        let tokens = String::from_utf8(backend.get("tokens/snap-1-tokens.yaml").unwrap()).unwrap();
        assert!(tokens.contains("initial_token: 42\n"));
        assert_eq!(
            node.calls(),
            vec!["snapshot snap-1 shop", "tokens", "clearsnapshot snap-1"]
        );
    }

    #[tokio::test]
    async fn test_empty_snapshot_is_fatal_and_still_cleared() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("data/shop/orders-a1")).unwrap();
        let node = Arc::new(RecordingNode::default());
        let (ctx, backend) = context(&dir, node.clone());

        let request = BackupRequest {
            snapshot_tag: "snap-2".to_string(),
            ..BackupRequest::default()
        };
        let result = backup(&ctx, &request).await;

        assert!(matches!(result, Err(BackupError::NoDataCaptured)));
        assert!(backend.keys().is_empty());
        assert_eq!(clear_count(&node), 1);
    }

    #[tokio::test]
    async fn test_failed_upload_still_clears_snapshot() {
        let dir = TempDir::new().unwrap();
        seed_snapshot(dir.path(), "shop/orders-a1", "snap-3");
        let node = Arc::new(RecordingNode::default());
        let (ctx, backend) = context(&dir, node.clone());
        backend.fail_uploads_of("data/shop/orders-a1/1-77/mc-1-big-Data.db");

        let request = BackupRequest {
            snapshot_tag: "snap-3".to_string(),
            ..BackupRequest::default()
        };
        let result = backup(&ctx, &request).await;

        assert!(matches!(result, Err(BackupError::Transfer { .. })));
        assert!(backend.get("manifests/snap-3").is_none());
        assert_eq!(clear_count(&node), 1);
    }

    #[tokio::test]
    async fn test_refused_snapshot_is_not_cleared() {
        let dir = TempDir::new().unwrap();
        let node = Arc::new(RecordingNode {
            fail_snapshot: true,
            ..RecordingNode::default()
        });
        let (ctx, _backend) = context(&dir, node.clone());

        let request = BackupRequest {
            snapshot_tag: "snap-4".to_string(),
            ..BackupRequest::default()
        };
        let result = backup(&ctx, &request).await;

        assert!(matches!(result, Err(BackupError::ControlChannel(_))));
        assert_eq!(clear_count(&node), 0);
    }

    #[tokio::test]
    async fn test_table_filter_across_keyspaces_is_refused() {
        let dir = TempDir::new().unwrap();
        let node = Arc::new(RecordingNode::default());
        let (ctx, _backend) = context(&dir, node.clone());

        let request = BackupRequest {
            snapshot_tag: "snap-5".to_string(),
            keyspaces: vec!["shop".to_string(), "inventory".to_string()],
            table: Some("orders".to_string()),
        };
        let result = backup(&ctx, &request).await;

        assert!(matches!(result, Err(BackupError::Config(_))));
        assert!(node.calls().is_empty());
    }
}
