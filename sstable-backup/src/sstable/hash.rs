//! Content addressing of SSTable generations.
//!
//! A generation is identified remotely by `<generation>-<checksum>`. The
//! checksum comes from the generation's digest component when one exists;
//! older formats without a digest fall back to a CRC32 over the tail of the
//! `Data.db` file.

use super::{sibling_path, SSTableName, DATA_COMPONENT};
use crate::utils::{BackupError, Result};
use regex::Regex;
use std::fs::File;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::LazyLock;

/// Digest component extensions, in lookup order.
pub const DIGEST_EXTENSIONS: [&str; 3] = ["crc32", "adler32", "sha1"];

/// Bytes read from the end of `Data.db` for the fallback checksum.
pub const FALLBACK_TAIL_BYTES: u64 = 10 * 1024 * 1024;

const READ_CHUNK_BYTES: usize = 64 * 1024;

static DIGEST_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([A-Za-z0-9]+)(?:\s.*)?$").expect("digest pattern is valid"));

/// Compute the content identifier of the generation `file` belongs to.
pub fn generation_hash(file: &Path) -> Result<String> {
    let name = SSTableName::from_path(file)?;
    let checksum = generation_checksum(file, &name)?;
    Ok(format!("{}-{}", name.generation, checksum))
}

fn generation_checksum(file: &Path, name: &SSTableName) -> Result<String> {
    for ext in DIGEST_EXTENSIONS {
        let digest = sibling_path(file, name, &format!("Digest.{ext}"));
        if digest.is_file() {
            return read_digest_token(&digest);
        }
    }

    let data = sibling_path(file, name, DATA_COMPONENT);
    if !data.is_file() {
        return Err(BackupError::malformed(
            file,
            format!("no digest component and no {} counterpart", DATA_COMPONENT),
        ));
    }
    Ok(tail_checksum(&data)?.to_string())
}

/// Leading alphanumeric token of the first line of a digest file.
fn read_digest_token(path: &Path) -> Result<String> {
    let mut first_line = String::new();
    BufReader::new(File::open(path)?).read_line(&mut first_line)?;

    DIGEST_TOKEN
        .captures(first_line.trim_end())
        .map(|caps| caps[1].to_string())
        .ok_or_else(|| BackupError::malformed(path, "digest file does not start with a checksum"))
}

/// CRC32 over the last `FALLBACK_TAIL_BYTES` of `path` (the whole file when smaller).
pub fn tail_checksum(path: &Path) -> std::io::Result<u32> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    let start = len.saturating_sub(FALLBACK_TAIL_BYTES);
    file.seek(SeekFrom::Start(start))?;

    let mut hasher = crc32fast::Hasher::new();
    let mut buffer = vec![0u8; READ_CHUNK_BYTES];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(hasher.finalize())
}
