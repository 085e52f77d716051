//! In-memory backend used by unit tests to observe transfer behaviour.

use super::{
    validate_object_key, FreshenResult, ObjectHandle, RemoteObjectReference, StorageBackend,
    StorageLocation,
};
use crate::transfer::ByteStream;
use crate::utils::{BackupError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// One completed upload: sequence numbers taken when it started and finished.
#[derive(Debug, Clone)]
pub struct UploadRecord {
    pub key: String,
    pub started: u64,
    pub finished: u64,
}

pub struct MemoryBackend {
    location: StorageLocation,
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    uploads: Mutex<Vec<UploadRecord>>,
    failing_keys: Mutex<HashSet<String>>,
    clock: AtomicU64,
    pub upload_delay: Duration,
    pub freshen_calls: AtomicUsize,
    pub cleanup_calls: AtomicUsize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            location: StorageLocation::parse("s3://bucket/cluster/node")
                .expect("static location is valid"),
            objects: Mutex::new(BTreeMap::new()),
            uploads: Mutex::new(Vec::new()),
            failing_keys: Mutex::new(HashSet::new()),
            clock: AtomicU64::new(0),
            upload_delay: Duration::ZERO,
            freshen_calls: AtomicUsize::new(0),
            cleanup_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_upload_delay(mut self, delay: Duration) -> Self {
        self.upload_delay = delay;
        self
    }

    pub fn fail_uploads_of(&self, key: &str) {
        self.failing_keys.lock().unwrap().insert(key.to_string());
    }

    pub fn insert(&self, key: &str, data: &[u8]) {
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), data.to_vec());
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    pub fn uploads(&self) -> Vec<UploadRecord> {
        self.uploads.lock().unwrap().clone()
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::SeqCst)
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn location(&self) -> &StorageLocation {
        &self.location
    }

    fn object_key_to_remote_reference(&self, object_key: &str) -> Result<RemoteObjectReference> {
        validate_object_key(object_key)?;
        Ok(RemoteObjectReference {
            object_key: object_key.to_string(),
            canonical_path: format!("memory://{object_key}"),
            handle: ObjectHandle::Memory(object_key.to_string()),
        })
    }

    async fn freshen_remote_object(
        &self,
        reference: &RemoteObjectReference,
    ) -> Result<FreshenResult> {
        self.freshen_calls.fetch_add(1, Ordering::SeqCst);
        if self.objects.lock().unwrap().contains_key(&reference.object_key) {
            Ok(FreshenResult::Freshened)
        } else {
            Ok(FreshenResult::UploadRequired)
        }
    }

    async fn upload_file(
        &self,
        _size: u64,
        mut stream: ByteStream,
        reference: &RemoteObjectReference,
    ) -> Result<()> {
        let started = self.tick();
        let mut data = Vec::new();
        while let Some(chunk) = stream.next().await {
            data.extend_from_slice(&chunk?);
        }
        if !self.upload_delay.is_zero() {
            tokio::time::sleep(self.upload_delay).await;
        }
        if self.failing_keys.lock().unwrap().contains(&reference.object_key) {
            return Err(BackupError::transfer(&reference.object_key, "injected failure"));
        }

        self.insert(&reference.object_key, &data);
        let finished = self.tick();
        self.uploads.lock().unwrap().push(UploadRecord {
            key: reference.object_key.clone(),
            started,
            finished,
        });
        Ok(())
    }

    async fn open_remote_object(&self, reference: &RemoteObjectReference) -> Result<ByteStream> {
        let data = self
            .get(&reference.object_key)
            .ok_or_else(|| BackupError::transfer(&reference.object_key, "not found"))?;
        Ok(futures_util::stream::iter(vec![Ok(Bytes::from(data))]).boxed())
    }

    async fn consume_files(
        &self,
        prefix: &RemoteObjectReference,
        visitor: &mut (dyn FnMut(RemoteObjectReference) + Send),
    ) -> Result<()> {
        let prefix = format!("{}/", prefix.object_key.trim_end_matches('/'));
        for key in self.keys() {
            if key.starts_with(&prefix) {
                visitor(self.object_key_to_remote_reference(&key)?);
            }
        }
        Ok(())
    }

    async fn cleanup(&self) -> Result<()> {
        self.cleanup_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
