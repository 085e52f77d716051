//! Snapshot restore.

use super::OperationContext;
use crate::executor::restore::{RestoreRequest, RestoreSummary, Restorer};
use crate::node::tokens::{token_key, write_restore_artifacts, TOKENS_PREFIX};
use crate::transfer::RateLimiter;
use crate::utils::{BackupError, Result};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use tracing::info;

/// Restore SSTables from `request.snapshot_tag`, then install the node's
/// tokens and disable auto bootstrap in the config directory.
pub async fn restore(ctx: &OperationContext, request: &RestoreRequest) -> Result<RestoreSummary> {
    let _lock = ctx.lock().await?;
    let options = ctx.config.transfer_options()?;

    let restorer = Restorer::new(
        Arc::clone(&ctx.backend),
        ctx.config.data_root(),
        ctx.config.staging_dir(),
    );
    let summary = restorer
        .restore(request, &options, Arc::clone(&ctx.sink))
        .await?;
    info!(
        "Restored {}: {} kept, {} downloaded ({} bytes), {} deleted",
        request.snapshot_tag,
        summary.kept_files,
        summary.downloaded_files,
        summary.downloaded_bytes,
        summary.deleted_files
    );

    let token_file = fetch_token_file(ctx, &request.snapshot_tag).await?;
    write_restore_artifacts(&ctx.config.node.config_dir, &token_file).await?;
    Ok(summary)
}

async fn fetch_token_file(ctx: &OperationContext, snapshot_tag: &str) -> Result<String> {
    let reference = ctx.backend.object_key_to_remote_reference(&token_key(snapshot_tag))?;
    let staged = ctx
        .config
        .staging_dir()
        .join(TOKENS_PREFIX)
        .join(format!("{snapshot_tag}-tokens.yaml"));

    ctx.backend
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
    Ok(tokio::fs::read_to_string(&staged).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::executor::predicates::Subset;
    use crate::node::testing::RecordingNode;
    use crate::node::tokens::render_token_file;
    use crate::storage::memory::MemoryBackend;
    use crate::transfer::NullProgressSink;
    use std::fs;
    use tempfile::TempDir;

    fn context(dir: &TempDir, backend: Arc<MemoryBackend>) -> OperationContext {
        let mut config = Config::default();
        config.node.data_dir = dir.path().join("db");
        config.node.config_dir = dir.path().join("conf.d");
        OperationContext {
            config,
            backend,
            node: Arc::new(RecordingNode::default()),
            sink: Arc::new(NullProgressSink),
        }
    }

    fn seed_backup(backend: &MemoryBackend) {
        let files: [(&str, &[u8]); 3] = [
            ("data/shop/orders-a1/1-111/mc-1-big-Data.db", b"orders"),
            ("data/shop/orders-a1/1-111/mc-1-big-Digest.crc32", b"111"),
            ("data/inventory/items-b2/3-333/mc-3-big-Data.db", b"items"),
        ];
        let mut manifest = String::new();
        for (key, data) in files {
            backend.insert(key, data);
            manifest.push_str(&format!("{} {}\n", data.len(), key));
        }
        backend.insert("manifests/snap-1", manifest.as_bytes());
        backend.insert(
            "tokens/snap-1-tokens.yaml",
            render_token_file(&["7".to_string(), "99".to_string()], "snap-1").as_bytes(),
        );
    }

    #[tokio::test]
    async fn test_restore_writes_tables_and_config_fragments() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(MemoryBackend::new());
        seed_backup(&backend);
        let ctx = context(&dir, backend);

        let request = RestoreRequest {
            snapshot_tag: "snap-1".to_string(),
            ..RestoreRequest::default()
        };
        let summary = restore(&ctx, &request).await.unwrap();

        assert_eq!(summary.downloaded_files, 3);
        let data = dir.path().join("db/data");
        assert_eq!(fs::read(data.join("shop/orders-a1/mc-1-big-Data.db")).unwrap(), b"orders");
        assert_eq!(fs::read(data.join("inventory/items-b2/mc-3-big-Data.db")).unwrap(), b"items");

        let tokens = fs::read_to_string(dir.path().join("conf.d/tokens.yaml")).unwrap();
        assert!(tokens.contains("initial_token: 7,99"));
        assert_eq!(
            fs::read_to_string(dir.path().join("conf.d/auto-bootstrap.yaml")).unwrap(),
            "auto_bootstrap: false\n"
        );
    }

    #[tokio::test]
    async fn test_subset_restore_skips_other_keyspaces() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(MemoryBackend::new());
        seed_backup(&backend);
        let ctx = context(&dir, backend);

        let request = RestoreRequest {
            snapshot_tag: "snap-1".to_string(),
            subset: "inventory".parse::<Subset>().unwrap(),
            ..RestoreRequest::default()
        };
        let summary = restore(&ctx, &request).await.unwrap();

        assert_eq!(summary.downloaded_files, 1);
        let data = dir.path().join("db/data");
        assert!(data.join("inventory/items-b2/mc-3-big-Data.db").is_file());
        assert!(!data.join("shop").exists());
    }

    #[tokio::test]
    async fn test_missing_token_file_fails_after_data_restore() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(MemoryBackend::new());
        backend.insert("data/shop/orders-a1/1-111/mc-1-big-Data.db", b"orders");
        backend.insert("manifests/snap-1", b"6 data/shop/orders-a1/1-111/mc-1-big-Data.db\n");
        let ctx = context(&dir, backend);

        let request = RestoreRequest {
            snapshot_tag: "snap-1".to_string(),
            ..RestoreRequest::default()
        };
        let result = restore(&ctx, &request).await;

        assert!(matches!(result, Err(BackupError::Manifest(_))));
        assert!(!dir.path().join("conf.d/tokens.yaml").exists());
    }
}
