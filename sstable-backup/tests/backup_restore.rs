//! Snapshot backup and restore through the `file` provider.

use async_trait::async_trait;
use sstable_backup::executor::restore::RestoreRequest;
use sstable_backup::node::NodeControl;
use sstable_backup::ops::backup::{backup, BackupRequest};
use sstable_backup::ops::restore::restore;
use sstable_backup::ops::OperationContext;
use sstable_backup::storage::{open_backend, StorageLocation};
use sstable_backup::transfer::NullProgressSink;
use sstable_backup::{BackupError, Config, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// Node that snapshots by copying the live SSTables of every table.
struct ScriptedNode {
    data_root: PathBuf,
    tokens: Vec<String>,
    cleared: Mutex<Vec<String>>,
}

impl ScriptedNode {
    fn new(data_root: PathBuf) -> Self {
        Self {
            data_root,
            tokens: vec!["-4611686018427387904".to_string(), "4611686018427387904".to_string()],
            cleared: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl NodeControl for ScriptedNode {
    async fn take_snapshot(&self, _keyspaces: &[String], tag: &str, _table: Option<&str>) -> Result<()> {
        for keyspace in fs::read_dir(&self.data_root)? {
            for table in fs::read_dir(keyspace?.path())? {
                let table = table?.path();
                let snapshot = table.join("snapshots").join(tag);
                copy_files(&table, &snapshot)?;
                for entry in fs::read_dir(&table)? {
                    let entry = entry?;
                    let name = entry.file_name();
                    if entry.file_type()?.is_dir() && name.to_string_lossy().starts_with('.') {
                        copy_files(&entry.path(), &snapshot.join(&name))?;
                    }
                }
            }
        }
        Ok(())
    }

    async fn clear_snapshot(&self, tag: &str) -> Result<()> {
        self.cleared.lock().unwrap().push(tag.to_string());
        Ok(())
    }

    async fn drain(&self) -> Result<()> {
        Ok(())
    }

    async fn get_tokens(&self) -> Result<Vec<String>> {
        Ok(self.tokens.clone())
    }
}

fn copy_files(from: &Path, to: &Path) -> std::io::Result<()> {
    fs::create_dir_all(to)?;
    for file in fs::read_dir(from)? {
        let file = file?;
        if file.file_type()?.is_file() {
            fs::copy(file.path(), to.join(file.file_name()))?;
        }
    }
    Ok(())
}

fn write(path: &Path, content: &[u8]) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

fn seed_node(data_dir: &Path) {
    let data = data_dir.join("data");
    write(&data.join("shop/orders-a1/mc-1-big-Data.db"), b"order rows, generation one");
    write(&data.join("shop/orders-a1/mc-1-big-Index.db"), b"order index");
    write(&data.join("shop/orders-a1/mc-1-big-Digest.crc32"), b"3141592653");
    write(&data.join("shop/orders-a1/mc-2-big-Data.db"), b"order rows, generation two");
    write(&data.join("shop/orders-a1/mc-2-big-Digest.crc32"), b"2718281828");
    write(&data.join("shop/orders-a1/.orders_status_idx/mc-1-big-Data.db"), b"index rows");
    write(&data.join("shop/orders-a1/.orders_status_idx/mc-1-big-Digest.crc32"), b"1414213562");
    write(&data.join("system/local-c3/mc-5-big-Data.db"), b"node local state");
    write(&data.join("system/local-c3/mc-5-big-Digest.crc32"), b"1732050807");
}

fn context(data_dir: &Path, location: &str, node: Arc<dyn NodeControl>) -> OperationContext {
    let mut config = Config::default();
    config.node.data_dir = data_dir.to_path_buf();
    config.node.config_dir = data_dir.join("conf.d");
    config.transfer.concurrency = 3;
    let location = StorageLocation::parse(location).unwrap();
    OperationContext {
        config,
        backend: open_backend(&location).unwrap(),
        node,
        sink: Arc::new(NullProgressSink),
    }
}

#[tokio::test]
async fn test_backup_then_restore_on_fresh_node() {
    let remote = TempDir::new().unwrap();
    let location = format!("file://{}/backups/prod/node-1", remote.path().display());

    let source = TempDir::new().unwrap();
    seed_node(source.path());
    let node = Arc::new(ScriptedNode::new(source.path().join("data")));
    let ctx = context(source.path(), &location, node.clone());

    let request = BackupRequest {
        snapshot_tag: "nightly".to_string(),
        ..BackupRequest::default()
    };
    let summary = backup(&ctx, &request).await.unwrap();
    assert_eq!(summary.tables, 2);
    assert_eq!(summary.data_files, 4);
    assert_eq!(*node.cleared.lock().unwrap(), vec!["nightly"]);

    let node_root = remote.path().join("backups/prod/node-1");
    assert!(node_root.join("manifests/nightly").is_file());
    assert!(node_root.join("tokens/nightly-tokens.yaml").is_file());
    assert!(node_root
        .join("data/shop/orders-a1/1-3141592653/mc-1-big-Data.db")
        .is_file());
    assert!(node_root
        .join("data/shop/orders-a1/.orders_status_idx/1-1414213562/mc-1-big-Data.db")
        .is_file());

    let target = TempDir::new().unwrap();
    let ctx = context(
        target.path(),
        &location,
        Arc::new(ScriptedNode::new(target.path().join("data"))),
    );
    let request = RestoreRequest {
        snapshot_tag: "nightly".to_string(),
        ..RestoreRequest::default()
    };
    let restored = restore(&ctx, &request).await.unwrap();
    assert_eq!(restored.downloaded_files, 7);
    assert_eq!(restored.deleted_files, 0);

    for relative in [
        "shop/orders-a1/mc-1-big-Data.db",
        "shop/orders-a1/mc-1-big-Index.db",
        "shop/orders-a1/mc-2-big-Data.db",
        "shop/orders-a1/.orders_status_idx/mc-1-big-Data.db",
    ] {
        assert_eq!(
            fs::read(target.path().join("data").join(relative)).unwrap(),
            fs::read(source.path().join("data").join(relative)).unwrap(),
            "{relative}"
        );
    }
    assert!(!target.path().join("data/system").exists());

    let tokens = fs::read_to_string(target.path().join("conf.d/tokens.yaml")).unwrap();
    assert!(tokens.contains("initial_token: -4611686018427387904,4611686018427387904"));
    assert_eq!(
        fs::read_to_string(target.path().join("conf.d/auto-bootstrap.yaml")).unwrap(),
        "auto_bootstrap: false\n"
    );
}

#[tokio::test]
async fn test_second_backup_only_uploads_new_generations() {
    let remote = TempDir::new().unwrap();
    let location = format!("file://{}/backups/prod/node-1", remote.path().display());
    let source = TempDir::new().unwrap();
    seed_node(source.path());
    let node = Arc::new(ScriptedNode::new(source.path().join("data")));
    let ctx = context(source.path(), &location, node);

    let first = BackupRequest {
        snapshot_tag: "monday".to_string(),
        keyspaces: vec!["shop".to_string()],
        table: None,
    };
    backup(&ctx, &first).await.unwrap();

    write(
        &source.path().join("data/shop/orders-a1/mc-3-big-Data.db"),
        b"order rows, generation three",
    );
    write(
        &source.path().join("data/shop/orders-a1/mc-3-big-Digest.crc32"),
        b"5772156649",
    );
    let second = BackupRequest {
        snapshot_tag: "tuesday".to_string(),
        ..first.clone()
    };
    let summary = backup(&ctx, &second).await.unwrap();

    // Two new data files plus the manifest; everything else already exists.
    assert_eq!(summary.upload.uploaded_files, 3);
    assert_eq!(summary.upload.freshened_files, 7);
}

#[tokio::test]
async fn test_restore_into_existing_node_keeps_deletes_and_fetches() {
    let remote = TempDir::new().unwrap();
    let location = format!("file://{}/backups/prod/node-1", remote.path().display());
    let source = TempDir::new().unwrap();
    seed_node(source.path());
    let ctx = context(
        source.path(),
        &location,
        Arc::new(ScriptedNode::new(source.path().join("data"))),
    );
    let request = BackupRequest {
        snapshot_tag: "nightly".to_string(),
        ..BackupRequest::default()
    };
    backup(&ctx, &request).await.unwrap();

    // Generation 1 already matches, generation 4 is unknown to the backup,
    // generation 2 and the index table are missing.
    let target = TempDir::new().unwrap();
    let data = target.path().join("data");
    write(&data.join("shop/orders-a1/mc-1-big-Data.db"), b"order rows, generation one");
    write(&data.join("shop/orders-a1/mc-1-big-Index.db"), b"order index");
    write(&data.join("shop/orders-a1/mc-1-big-Digest.crc32"), b"3141592653");
    write(&data.join("shop/orders-a1/mc-4-big-Data.db"), b"rows written after the backup");
    write(&data.join("shop/orders-a1/mc-4-big-Digest.crc32"), b"1618033988");
    write(&data.join("system/local-c3/mc-9-big-Data.db"), b"this node's local state");
    write(&data.join("system/local-c3/mc-9-big-Digest.crc32"), b"2236067977");
    let kept_before = fs::metadata(data.join("shop/orders-a1/mc-1-big-Data.db"))
        .unwrap()
        .modified()
        .unwrap();

    let ctx = context(
        target.path(),
        &location,
        Arc::new(ScriptedNode::new(data.clone())),
    );
    let request = RestoreRequest {
        snapshot_tag: "nightly".to_string(),
        ..RestoreRequest::default()
    };
    let restored = restore(&ctx, &request).await.unwrap();

    assert_eq!(restored.kept_files, 3);
    assert_eq!(restored.deleted_files, 2);
    assert_eq!(restored.downloaded_files, 4);

    assert_eq!(
        fs::metadata(data.join("shop/orders-a1/mc-1-big-Data.db"))
            .unwrap()
            .modified()
            .unwrap(),
        kept_before
    );
    assert!(!data.join("shop/orders-a1/mc-4-big-Data.db").exists());
    assert!(!data.join("shop/orders-a1/mc-4-big-Digest.crc32").exists());
    for relative in [
        "shop/orders-a1/mc-2-big-Data.db",
        "shop/orders-a1/mc-2-big-Digest.crc32",
        "shop/orders-a1/.orders_status_idx/mc-1-big-Data.db",
        "shop/orders-a1/.orders_status_idx/mc-1-big-Digest.crc32",
    ] {
        assert_eq!(
            fs::read(data.join(relative)).unwrap(),
            fs::read(source.path().join("data").join(relative)).unwrap(),
            "{relative}"
        );
    }

    // The system keyspace is outside an existing-node restore and stays put.
    assert_eq!(
        fs::read(data.join("system/local-c3/mc-9-big-Data.db")).unwrap(),
        b"this node's local state"
    );
    assert!(!data.join("system/local-c3/mc-5-big-Data.db").exists());
}

#[tokio::test]
async fn test_restore_of_unknown_tag_fails() {
    let remote = TempDir::new().unwrap();
    let location = format!("file://{}/backups/prod/node-1", remote.path().display());
    let target = TempDir::new().unwrap();
    let ctx = context(
        target.path(),
        &location,
        Arc::new(ScriptedNode::new(target.path().join("data"))),
    );

    let request = RestoreRequest {
        snapshot_tag: "missing".to_string(),
        ..RestoreRequest::default()
    };
    let result = restore(&ctx, &request).await;
    assert!(matches!(result, Err(BackupError::Manifest(_))));
}
