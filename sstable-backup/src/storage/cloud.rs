//! Object store backends (`s3://`, `gcp://`, `azure://`).
//!
//! All three providers share one implementation over the `object_store`
//! crate; only the builder differs. Credentials and endpoints come from the
//! provider's standard environment variables.

use super::{
    join_key, validate_object_key, FreshenResult, ObjectHandle, Provider, RemoteObjectReference,
    StorageBackend, StorageLocation,
};
use crate::transfer::ByteStream;
use crate::utils::{BackupError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::azure::MicrosoftAzureBuilder;
use object_store::gcp::GoogleCloudStorageBuilder;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload, WriteMultipart};
use std::sync::Arc;
use tracing::{debug, warn};

/// Uploads at or above this size use multipart writes.
const MULTIPART_THRESHOLD: u64 = 8 * 1024 * 1024;

/// Size of each multipart part.
const PART_SIZE: usize = 8 * 1024 * 1024;

/// Parts allowed in flight per upload.
const MAX_PARTS_IN_FLIGHT: usize = 4;

pub struct ObjectStoreBackend {
    location: StorageLocation,
    provider: Provider,
    store: Arc<dyn ObjectStore>,
}

impl ObjectStoreBackend {
    pub fn new(location: StorageLocation, provider: Provider) -> Result<Self> {
        let store: Arc<dyn ObjectStore> = match provider {
            Provider::S3 => Arc::new(
                AmazonS3Builder::from_env()
                    .with_bucket_name(&location.bucket)
                    .build()?,
            ),
            Provider::Gcp => Arc::new(
                GoogleCloudStorageBuilder::from_env()
                    .with_bucket_name(&location.bucket)
                    .build()?,
            ),
            Provider::Azure => Arc::new(
                MicrosoftAzureBuilder::from_env()
                    .with_container_name(&location.bucket)
                    .build()?,
            ),
            Provider::File => {
                return Err(BackupError::Config(
                    "file locations are served by the local backend".to_string(),
                ))
            }
        };
        Ok(Self::with_store(location, provider, store))
    }

    /// Wrap an already constructed store.
    pub fn with_store(
        location: StorageLocation,
        provider: Provider,
        store: Arc<dyn ObjectStore>,
    ) -> Self {
        Self {
            location,
            provider,
            store,
        }
    }

    fn path_of<'a>(&self, reference: &'a RemoteObjectReference) -> Result<&'a ObjectPath> {
        match &reference.handle {
            ObjectHandle::Store(path) => Ok(path),
            other => Err(BackupError::Config(format!(
                "reference {other:?} does not belong to the {} backend",
                self.provider
            ))),
        }
    }

    async fn put_multipart(
        &self,
        path: &ObjectPath,
        mut stream: ByteStream,
        reference: &RemoteObjectReference,
    ) -> Result<()> {
        let upload = self.store.put_multipart(path).await?;
        let mut writer = WriteMultipart::new_with_chunk_size(upload, PART_SIZE);

        let streamed = async {
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(|e| BackupError::transfer(&reference.object_key, e))?;
                writer.wait_for_capacity(MAX_PARTS_IN_FLIGHT).await?;
                writer.write(&chunk);
            }
            Ok::<(), BackupError>(())
        }
        .await;

        match streamed {
            Ok(()) => {
                writer.finish().await?;
                Ok(())
            }
            Err(e) => {
                if let Err(abort_err) = writer.abort().await {
                    warn!(
                        "Failed to abort multipart upload {}: {}",
                        reference.canonical_path, abort_err
                    );
                }
                Err(e)
            }
        }
    }
}

#[async_trait]
impl StorageBackend for ObjectStoreBackend {
    fn location(&self) -> &StorageLocation {
        &self.location
    }

    fn object_key_to_remote_reference(&self, object_key: &str) -> Result<RemoteObjectReference> {
        validate_object_key(object_key)?;
        let full = join_key(&self.location.node_prefix(), object_key);
        let path = ObjectPath::from(full.as_str());
        Ok(RemoteObjectReference {
            object_key: object_key.to_string(),
            canonical_path: format!("{}://{}/{}", self.provider, self.location.bucket, path),
            handle: ObjectHandle::Store(path),
        })
    }

    async fn freshen_remote_object(
        &self,
        reference: &RemoteObjectReference,
    ) -> Result<FreshenResult> {
        let path = self.path_of(reference)?;
        let touched = match self.store.copy(path, path).await {
            Err(e) if !is_missing(&e) => {
                // Some providers refuse a copy onto itself.
                debug!("In-place copy of {} refused: {}", reference.canonical_path, e);
                let scratch = ObjectPath::from(format!("{path}.freshen-{}", uuid::Uuid::new_v4()));
                match self.store.copy(path, &scratch).await {
                    Ok(()) => self.store.rename(&scratch, path).await,
                    Err(e) => Err(e),
                }
            }
            other => other,
        };

        match touched {
            Ok(()) => {
                debug!("Refreshed {}", reference.canonical_path);
                Ok(FreshenResult::Freshened)
            }
            Err(e) if is_missing(&e) => Ok(FreshenResult::UploadRequired),
            Err(e) => Err(e.into()),
        }
    }

    async fn upload_file(
        &self,
        size: u64,
        mut stream: ByteStream,
        reference: &RemoteObjectReference,
    ) -> Result<()> {
        let path = self.path_of(reference)?;

        if size >= MULTIPART_THRESHOLD {
            return self.put_multipart(path, stream, reference).await;
        }

        let mut chunks: Vec<Bytes> = Vec::new();
        while let Some(chunk) = stream.next().await {
            chunks.push(chunk.map_err(|e| BackupError::transfer(&reference.object_key, e))?);
        }
        let payload: PutPayload = chunks.into_iter().collect();
        self.store.put(path, payload).await?;
        Ok(())
    }

    async fn open_remote_object(&self, reference: &RemoteObjectReference) -> Result<ByteStream> {
        let path = self.path_of(reference)?;
        let result = self.store.get(path).await?;
        Ok(result
            .into_stream()
            .map(|chunk| chunk.map_err(std::io::Error::other))
            .boxed())
    }

    async fn consume_files(
        &self,
        prefix: &RemoteObjectReference,
        visitor: &mut (dyn FnMut(RemoteObjectReference) + Send),
    ) -> Result<()> {
        let prefix_path = self.path_of(prefix)?;
        let node_prefix = format!("{}/", self.location.node_prefix());

        let mut listing = self.store.list(Some(prefix_path));
        while let Some(meta) = listing.next().await {
            let meta = meta?;
            let full = meta.location.as_ref();
            let Some(key) = full.strip_prefix(&node_prefix) else {
                continue;
            };
            match self.object_key_to_remote_reference(key) {
                Ok(reference) => visitor(reference),
                Err(e) => warn!("Skipping listed object: {}", e),
            }
        }
        Ok(())
    }

    async fn cleanup(&self) -> Result<()> {
        // object_store offers no listing of abandoned multipart uploads;
        // provider lifecycle rules handle them.
        debug!("No multipart cleanup available for {}", self.provider);
        Ok(())
    }
}

/// Not-found and access-denied responses both mean the object must be uploaded.
fn is_missing(error: &object_store::Error) -> bool {
    matches!(
        error,
        object_store::Error::NotFound { .. }
            | object_store::Error::PermissionDenied { .. }
            | object_store::Error::Unauthenticated { .. }
    )
}
