//! Local filesystem backend (`file://` locations).
//!
//! Objects live under `<localRoot>/<bucket>/<clusterId>/<nodeId>/<key>`.

use super::{
    validate_object_key, FreshenResult, ObjectHandle, RemoteObjectReference, StorageBackend,
    StorageLocation,
};
use crate::transfer::stream::{write_stream_atomically, PARTIAL_SUFFIX, STREAM_CHUNK_BYTES};
use crate::transfer::ByteStream;
use crate::utils::{BackupError, Result};
use async_trait::async_trait;
use filetime::FileTime;
use futures_util::StreamExt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio_util::io::ReaderStream;
use tracing::{debug, info};
use walkdir::WalkDir;

/// Incomplete uploads older than this are removed by `cleanup`.
const STALE_PARTIAL_AGE: Duration = Duration::from_secs(24 * 60 * 60);

pub struct LocalBackend {
    location: StorageLocation,
    root: PathBuf,
}

impl LocalBackend {
    pub fn new(location: StorageLocation) -> Result<Self> {
        let local_root = location.local_root.clone().ok_or_else(|| {
            BackupError::Config(format!("location {} has no local root", location.raw))
        })?;
        let root = local_root
            .join(&location.bucket)
            .join(&location.cluster_id)
            .join(&location.node_id);
        Ok(Self { location, root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of<'a>(&self, reference: &'a RemoteObjectReference) -> Result<&'a Path> {
        match &reference.handle {
            ObjectHandle::File(path) => Ok(path.as_path()),
            other => Err(BackupError::Config(format!(
                "reference {other:?} does not belong to the file backend"
            ))),
        }
    }

    fn key_of(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().to_string())
            .collect();
        Some(parts.join("/"))
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn location(&self) -> &StorageLocation {
        &self.location
    }

    fn object_key_to_remote_reference(&self, object_key: &str) -> Result<RemoteObjectReference> {
        validate_object_key(object_key)?;
        let path = object_key
            .split('/')
            .fold(self.root.clone(), |acc, segment| acc.join(segment));
        Ok(RemoteObjectReference {
            object_key: object_key.to_string(),
            canonical_path: path.display().to_string(),
            handle: ObjectHandle::File(path),
        })
    }

    async fn freshen_remote_object(
        &self,
        reference: &RemoteObjectReference,
    ) -> Result<FreshenResult> {
        let path = self.path_of(reference)?;
        match filetime::set_file_mtime(path, FileTime::now()) {
            Ok(()) => Ok(FreshenResult::Freshened),
            Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::PermissionDenied) => {
                Ok(FreshenResult::UploadRequired)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn upload_file(
        &self,
        size: u64,
        stream: ByteStream,
        reference: &RemoteObjectReference,
    ) -> Result<()> {
        let path = self.path_of(reference)?;
        let written = write_stream_atomically(stream, path, Some(size))
            .await
            .map_err(|e| BackupError::transfer(&reference.object_key, e))?;
        debug!("Stored {} bytes at {}", written, reference.canonical_path);
        Ok(())
    }

    async fn open_remote_object(&self, reference: &RemoteObjectReference) -> Result<ByteStream> {
        let path = self.path_of(reference)?;
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|e| BackupError::transfer(&reference.object_key, e))?;
        Ok(ReaderStream::with_capacity(file, STREAM_CHUNK_BYTES).boxed())
    }

    async fn consume_files(
        &self,
        prefix: &RemoteObjectReference,
        visitor: &mut (dyn FnMut(RemoteObjectReference) + Send),
    ) -> Result<()> {
        let dir = self.path_of(prefix)?.to_path_buf();
        if !dir.is_dir() {
            return Ok(());
        }

        let files = tokio::task::spawn_blocking(move || -> std::io::Result<Vec<PathBuf>> {
            let mut files = Vec::new();
            for entry in WalkDir::new(&dir).sort_by_file_name() {
                let entry = entry?;
                let is_partial = entry.file_name().to_string_lossy().ends_with(PARTIAL_SUFFIX);
                if entry.file_type().is_file() && !is_partial {
                    files.push(entry.into_path());
                }
            }
            Ok(files)
        })
        .await
        .map_err(|e| BackupError::Io(std::io::Error::other(e)))??;

        for path in files {
            if let Some(key) = self.key_of(&path) {
                visitor(self.object_key_to_remote_reference(&key)?);
            }
        }
        Ok(())
    }

    async fn cleanup(&self) -> Result<()> {
        if !self.root.is_dir() {
            return Ok(());
        }
        let root = self.root.clone();

        let removed = tokio::task::spawn_blocking(move || -> std::io::Result<usize> {
            let now = SystemTime::now();
            let mut removed = 0;
            for entry in WalkDir::new(&root) {
                let entry = entry?;
                if !entry.file_type().is_file()
                    || !entry.file_name().to_string_lossy().ends_with(PARTIAL_SUFFIX)
                {
                    continue;
                }
                let modified = entry.metadata().map_err(std::io::Error::other)?.modified()?;
                let age = now.duration_since(modified).unwrap_or_default();
                if age > STALE_PARTIAL_AGE {
                    std::fs::remove_file(entry.path())?;
                    removed += 1;
                }
            }
            Ok(removed)
        })
        .await
        .map_err(|e| BackupError::Cleanup(e.to_string()))?
        .map_err(|e| BackupError::Cleanup(e.to_string()))?;

        if removed > 0 {
            info!("Removed {} stale partial uploads under {}", removed, self.root.display());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::stream::open_file_stream;
    use crate::transfer::RateLimiter;
    use std::sync::atomic::AtomicU64;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn backend(dir: &TempDir) -> LocalBackend {
        let raw = format!("file://{}/bucket/cluster/node", dir.path().display());
        LocalBackend::new(StorageLocation::parse(&raw).unwrap()).unwrap()
    }

    async fn upload(backend: &LocalBackend, key: &str, source: &Path) -> Result<()> {
        let size = std::fs::metadata(source)?.len();
        let stream = open_file_stream(
            source,
            Arc::new(RateLimiter::unlimited()),
            Arc::new(AtomicU64::new(0)),
        )
        .await?;
        let reference = backend.object_key_to_remote_reference(key)?;
        backend.upload_file(size, stream, &reference).await
    }

    #[tokio::test]
    async fn test_freshen_missing_then_present() -> Result<()> {
        let dir = TempDir::new()?;
        let backend = backend(&dir);
        let source = dir.path().join("mc-1-big-Data.db");
        std::fs::write(&source, b"rows")?;

        let reference = backend.object_key_to_remote_reference("data/ks/t/1-7/mc-1-big-Data.db")?;
        assert_eq!(
            backend.freshen_remote_object(&reference).await?,
            FreshenResult::UploadRequired
        );

        upload(&backend, "data/ks/t/1-7/mc-1-big-Data.db", &source).await?;
        assert_eq!(
            backend.freshen_remote_object(&reference).await?,
            FreshenResult::Freshened
        );
        assert_eq!(
            std::fs::read(backend.root().join("data/ks/t/1-7/mc-1-big-Data.db"))?,
            b"rows"
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_short_upload_is_refused_and_not_promoted() -> Result<()> {
        let dir = TempDir::new()?;
        let backend = backend(&dir);
        let source = dir.path().join("mc-1-big-Data.db");
        std::fs::write(&source, b"rows")?;

        let stream = open_file_stream(
            &source,
            Arc::new(RateLimiter::unlimited()),
            Arc::new(AtomicU64::new(0)),
        )
        .await?;
        let reference = backend.object_key_to_remote_reference("data/ks/t/1-7/mc-1-big-Data.db")?;
        let result = backend.upload_file(10, stream, &reference).await;

        assert!(matches!(result, Err(BackupError::Transfer { .. })));
        let table_dir = backend.root().join("data/ks/t/1-7");
        assert!(!table_dir.join("mc-1-big-Data.db").exists());
        assert_eq!(std::fs::read_dir(&table_dir)?.count(), 0);
        Ok(())
    }

    #[test]
    fn test_reference_rejects_escaping_keys() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir);
        for key in ["data/../../../etc/cron.d/x", "/etc/passwd", "data/ks//t"] {
            let err = backend.object_key_to_remote_reference(key).unwrap_err();
            assert!(matches!(err, BackupError::InvalidObjectKey { .. }), "{key}");
        }
    }

    #[tokio::test]
    async fn test_consume_files_lists_keys_under_prefix() -> Result<()> {
        let dir = TempDir::new()?;
        let backend = backend(&dir);
        let source = dir.path().join("segment");
        std::fs::write(&source, b"log")?;

        upload(&backend, "commitlog/CommitLog-7-1.log.100", &source).await?;
        upload(&backend, "commitlog/CommitLog-7-2.log.200", &source).await?;
        upload(&backend, "manifests/snap", &source).await?;
        std::fs::write(backend.root().join("commitlog/.x.partial"), b"junk")?;

        let mut keys = Vec::new();
        let prefix = backend.object_key_to_remote_reference("commitlog")?;
        backend
            .consume_files(&prefix, &mut |r: RemoteObjectReference| keys.push(r.object_key))
            .await?;

        assert_eq!(
            keys,
            vec!["commitlog/CommitLog-7-1.log.100", "commitlog/CommitLog-7-2.log.200"]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_cleanup_removes_only_stale_partials() -> Result<()> {
        let dir = TempDir::new()?;
        let backend = backend(&dir);
        let data = backend.root().join("data");
        std::fs::create_dir_all(&data)?;

        let stale = data.join(".old.partial");
        let fresh = data.join(".new.partial");
        std::fs::write(&stale, b"a")?;
        std::fs::write(&fresh, b"b")?;
        let two_days_ago = FileTime::from_unix_time(FileTime::now().unix_seconds() - 2 * 86_400, 0);
        filetime::set_file_mtime(&stale, two_days_ago)?;

        backend.cleanup().await?;
        backend.cleanup().await?;

        assert!(!stale.exists());
        assert!(fresh.exists());
        Ok(())
    }
}
