//! Remote storage abstraction.
//!
//! Every provider implements [`StorageBackend`]. Object keys are
//! slash-separated paths relative to the node root described by a
//! [`StorageLocation`]; a backend resolves them into a
//! [`RemoteObjectReference`] carrying its native handle.

pub mod cloud;
pub mod local;
pub mod location;
#[cfg(test)]
pub mod memory;

pub use location::{Provider, StorageLocation};

use crate::transfer::stream::{throttle, write_stream_atomically};
use crate::transfer::{ByteStream, RateLimiter};
use crate::utils::{BackupError, Result};
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

/// Outcome of refreshing an object that may already exist remotely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreshenResult {
    /// The object exists under its content-addressed key; no transfer needed.
    Freshened,
    /// The object is missing (or not visible to us) and must be uploaded.
    UploadRequired,
}

/// Backend-native handle of a remote object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectHandle {
    File(PathBuf),
    Store(object_store::path::Path),
    #[cfg(test)]
    Memory(String),
}

/// Resolved remote object. Created on demand, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObjectReference {
    /// Key relative to the node root.
    pub object_key: String,
    /// Provider-specific full path, for logs and diagnostics.
    pub canonical_path: String,
    pub handle: ObjectHandle,
}

#[async_trait]
pub trait StorageBackend: Send + Sync {
    fn location(&self) -> &StorageLocation;

    /// Resolve `object_key` against the node root.
    ///
    /// Fails with `InvalidObjectKey` for keys rejected by
    /// [`validate_object_key`].
    fn object_key_to_remote_reference(&self, object_key: &str) -> Result<RemoteObjectReference>;

    /// Refresh an existing object in place.
    ///
    /// Returns `UploadRequired` for not-found and access-denied responses;
    /// every other failure is returned as an error.
    async fn freshen_remote_object(&self, reference: &RemoteObjectReference)
        -> Result<FreshenResult>;

    async fn upload_file(
        &self,
        size: u64,
        stream: ByteStream,
        reference: &RemoteObjectReference,
    ) -> Result<()>;

    async fn open_remote_object(&self, reference: &RemoteObjectReference) -> Result<ByteStream>;

    /// Download `reference` to `local_path`, metered by `limiter`.
    ///
    /// The target is replaced atomically. Returns the bytes written.
    async fn download_file(
        &self,
        local_path: &Path,
        reference: &RemoteObjectReference,
        limiter: Arc<RateLimiter>,
        transferred: Arc<AtomicU64>,
    ) -> Result<u64> {
        let stream = self.open_remote_object(reference).await?;
        let written = write_stream_atomically(throttle(stream, limiter, transferred), local_path, None)
            .await
            .map_err(|e| BackupError::transfer(&reference.object_key, e))?;
        Ok(written)
    }

    /// Visit every object under `prefix`; pagination is handled internally.
    async fn consume_files(
        &self,
        prefix: &RemoteObjectReference,
        visitor: &mut (dyn FnMut(RemoteObjectReference) + Send),
    ) -> Result<()>;

    /// Discard stale incomplete uploads. Idempotent and best-effort.
    async fn cleanup(&self) -> Result<()>;
}

/// Construct the backend registered for the location's provider.
pub fn open_backend(location: &StorageLocation) -> Result<Arc<dyn StorageBackend>> {
    location.validate()?;
    match location.backend_provider() {
        Ok(Provider::File) => Ok(Arc::new(local::LocalBackend::new(location.clone())?)),
        Ok(provider) => Ok(Arc::new(cloud::ObjectStoreBackend::new(location.clone(), provider)?)),
        Err(()) => Err(BackupError::Config(format!(
            "no backend registered for provider '{}'",
            location.provider
        ))),
    }
}

/// Check that every slash-separated segment of `key` is a plain name.
///
/// Empty, `.` and `..` segments are refused, as is a leading slash.
pub fn validate_object_key(key: &str) -> Result<()> {
    let invalid = |reason: &'static str| BackupError::InvalidObjectKey {
        key: key.to_string(),
        reason,
    };
    if key.is_empty() {
        return Err(invalid("key is empty"));
    }
    if key.starts_with('/') {
        return Err(invalid("absolute keys are not allowed"));
    }
    for segment in key.split('/') {
        let mut components = Path::new(segment).components();
        let plain = matches!(components.next(), Some(Component::Normal(_)))
            && components.next().is_none();
        if !plain {
            return Err(invalid("segments must be plain names"));
        }
    }
    Ok(())
}

/// Join a key prefix and a relative key with a single slash.
pub(crate) fn join_key(prefix: &str, key: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    let key = key.trim_start_matches('/');
    match (prefix.is_empty(), key.is_empty()) {
        (true, _) => key.to_string(),
        (_, true) => prefix.to_string(),
        _ => format!("{prefix}/{key}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_key() {
        assert_eq!(join_key("c1/n1", "data/ks/t"), "c1/n1/data/ks/t");
        assert_eq!(join_key("c1/n1/", "/manifests/tag"), "c1/n1/manifests/tag");
        assert_eq!(join_key("", "commitlog"), "commitlog");
        assert_eq!(join_key("c1/n1", ""), "c1/n1");
    }

    #[test]
    fn test_validate_object_key() {
        assert!(validate_object_key("data/ks/t-1/1-42/mc-1-big-Data.db").is_ok());
        assert!(validate_object_key("data/ks/t-1/.t_idx/1-42/mc-1-big-Data.db").is_ok());

        for key in [
            "",
            "/etc/passwd",
            "data/../../../tmp/1-1/mc-1-big-Data.db",
            "data/ks/./t/1-1/mc-1-big-Data.db",
            "data//ks/t/1-1/mc-1-big-Data.db",
            "manifests/",
            "..",
        ] {
            let err = validate_object_key(key).unwrap_err();
            assert!(matches!(err, BackupError::InvalidObjectKey { .. }), "{key}: {err}");
        }
    }

    #[test]
    fn test_open_backend_for_file_location() {
        let dir = tempfile::TempDir::new().unwrap();
        let raw = format!("file://{}/bucket/c1/n1", dir.path().display());
        let location = StorageLocation::parse(&raw).unwrap();

        let backend = open_backend(&location).unwrap();
        let reference = backend.object_key_to_remote_reference("manifests/snap").unwrap();
        assert_eq!(reference.object_key, "manifests/snap");
        assert_eq!(
            reference.handle,
            ObjectHandle::File(dir.path().join("bucket/c1/n1/manifests/snap"))
        );
    }
}
