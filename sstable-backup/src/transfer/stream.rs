//! Rate-limited byte streams between local files and storage backends.

use super::rate_limiter::RateLimiter;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

/// Chunk size for file reads; each chunk acquires its length from the limiter.
pub const STREAM_CHUNK_BYTES: usize = 64 * 1024;

/// Suffix of in-progress writes; see `write_stream_atomically`.
pub const PARTIAL_SUFFIX: &str = ".partial";

/// Owned stream of file contents.
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

/// Open `path` as a stream of chunks metered by `limiter`.
///
/// `transferred` is advanced as chunks are handed to the consumer.
pub async fn open_file_stream(
    path: &Path,
    limiter: Arc<RateLimiter>,
    transferred: Arc<AtomicU64>,
) -> io::Result<ByteStream> {
    let file = tokio::fs::File::open(path).await?;
    let stream = ReaderStream::with_capacity(file, STREAM_CHUNK_BYTES).boxed();
    Ok(throttle(stream, limiter, transferred))
}

/// Meter an existing stream through `limiter`.
pub fn throttle(
    stream: ByteStream,
    limiter: Arc<RateLimiter>,
    transferred: Arc<AtomicU64>,
) -> ByteStream {
    stream
        .then(move |chunk| {
            let limiter = Arc::clone(&limiter);
            let transferred = Arc::clone(&transferred);
            async move {
                if let Ok(bytes) = &chunk {
                    limiter.acquire(bytes.len() as u64).await;
                    transferred.fetch_add(bytes.len() as u64, Ordering::Relaxed);
                }
                chunk
            }
        })
        .boxed()
}

/// Drain `stream` into `target`.
///
/// Data lands in a uniquely named `*.partial` sibling first and is renamed
/// over `target` only once fully written, so readers never see a torn file.
/// When `expected` is given, a stream of any other length is discarded with
/// `InvalidData` and `target` is left untouched. Returns the number of bytes
/// written.
pub async fn write_stream_atomically(
    mut stream: ByteStream,
    target: &Path,
    expected: Option<u64>,
) -> io::Result<u64> {
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let partial = partial_path(target);

    let result = async {
        let mut file = tokio::fs::File::create(&partial).await?;
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        if let Some(expected) = expected.filter(|&n| n != written) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("expected {expected} bytes, received {written}"),
            ));
        }
        file.sync_all().await?;
        Ok::<u64, io::Error>(written)
    }
    .await;

    match result {
        Ok(written) => {
            tokio::fs::rename(&partial, target).await?;
            Ok(written)
        }
        Err(e) => {
            let _ = tokio::fs::remove_file(&partial).await;
            Err(e)
        }
    }
}

fn partial_path(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    target.with_file_name(format!(".{}.{}{}", name, uuid::Uuid::new_v4(), PARTIAL_SUFFIX))
}
