//! Backup manifests.
//!
//! A manifest lists every file of one snapshot with its size and its
//! content-addressed destination key. It is stored remotely as plain text,
//! one `<size> <destinationKey>` line per file, and parsed back on restore.

use crate::sstable::hash::generation_hash;
use crate::sstable::{is_data_file, SSTableName};
use crate::utils::{BackupError, Result};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Data,
    Manifest,
}

/// One file to transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    /// Key relative to the node root, slash separated.
    pub destination_key: String,
    pub local_path: PathBuf,
    /// Zero when unknown (restore entries parsed without a size).
    pub size: u64,
    pub kind: EntryKind,
}

impl ManifestEntry {
    pub fn data(destination_key: String, local_path: PathBuf, size: u64) -> Self {
        Self {
            destination_key,
            local_path,
            size,
            kind: EntryKind::Data,
        }
    }

    pub fn manifest(destination_key: String, local_path: PathBuf, size: u64) -> Self {
        Self {
            destination_key,
            local_path,
            size,
            kind: EntryKind::Manifest,
        }
    }
}

/// Ordered list of entries making up one transfer batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    pub entries: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn new(entries: Vec<ManifestEntry>) -> Self {
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn total_bytes(&self) -> u64 {
        self.entries.iter().map(|e| e.size).sum()
    }

    pub fn push(&mut self, entry: ManifestEntry) {
        self.entries.push(entry);
    }

    pub fn extend(&mut self, other: Manifest) {
        self.entries.extend(other.entries);
    }

    /// Number of entries whose key names a `Data.db` component.
    pub fn data_file_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.kind == EntryKind::Data)
            .filter(|e| {
                e.destination_key
                    .rsplit('/')
                    .next()
                    .is_some_and(is_data_file)
            })
            .count()
    }

    /// Render the text form stored remotely. Manifest-kind entries are not listed.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        for entry in self.entries.iter().filter(|e| e.kind == EntryKind::Data) {
            let _ = writeln!(out, "{} {}", entry.size, entry.destination_key);
        }
        out
    }
}

/// One parsed line of a remote manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestLine {
    pub size: u64,
    pub destination_key: String,
}

/// Parse a remote manifest. Malformed lines are skipped with a warning.
pub fn parse_manifest(text: &str) -> Vec<ManifestLine> {
    let mut lines = Vec::new();
    for (number, raw) in text.lines().enumerate() {
        let raw = raw.trim_end_matches('\r');
        if raw.trim().is_empty() {
            continue;
        }
        match parse_line(raw) {
            Some(line) => lines.push(line),
            None => warn!("Skipping malformed manifest line {}: {:?}", number + 1, raw),
        }
    }
    lines
}

fn parse_line(raw: &str) -> Option<ManifestLine> {
    let (size, key) = raw.split_once(' ')?;
    let size = size.parse().ok()?;
    if key.is_empty() || key.contains('\n') {
        return None;
    }
    Some(ManifestLine {
        size,
        destination_key: key.to_string(),
    })
}

/// Build the manifest for one table snapshot directory.
///
/// Files are grouped by generation; each group is addressed by the hash of
/// one representative file and every file in the group lands under
/// `<table_backup_root>/[<index dir>/]<hash>/<file name>`. Secondary index
/// directories (names starting with `.`) are descended one level.
///
/// A missing or empty directory yields an empty manifest. A group whose hash
/// cannot be derived is logged and skipped.
pub fn build_table_manifest(snapshot_dir: &Path, table_backup_root: &str) -> Result<Manifest> {
    if !snapshot_dir.is_dir() {
        return Ok(Manifest::default());
    }

    // (relative parent, generation) -> files
    let mut groups: BTreeMap<(String, u64), Vec<PathBuf>> = BTreeMap::new();
    collect_generations(snapshot_dir, "", &mut groups)?;
    for entry in std::fs::read_dir(snapshot_dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if entry.file_type()?.is_dir() && name.starts_with('.') {
            collect_generations(&entry.path(), &name, &mut groups)?;
        }
    }

    let mut manifest = Manifest::default();
    for ((parent, generation), files) in groups {
        let hash = match files.first().map(|f| generation_hash(f)) {
            Some(Ok(hash)) => hash,
            Some(Err(e)) => {
                warn!("Skipping generation {} in {}: {}", generation, snapshot_dir.display(), e);
                continue;
            }
            None => continue,
        };

        for file in files {
            let file_name = file
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            let size = std::fs::metadata(&file)?.len();
            let key = [table_backup_root, &parent, &hash, &file_name]
                .iter()
                .filter(|s| !s.is_empty())
                .copied()
                .collect::<Vec<_>>()
                .join("/");
            manifest.push(ManifestEntry::data(key, file, size));
        }
    }

    debug!(
        "Built manifest for {}: {} entries",
        snapshot_dir.display(),
        manifest.len()
    );
    Ok(manifest)
}

fn collect_generations(
    dir: &Path,
    parent: &str,
    groups: &mut BTreeMap<(String, u64), Vec<PathBuf>>,
) -> Result<()> {
    let mut files: Vec<PathBuf> = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();

    for file in files {
        match SSTableName::from_path(&file) {
            Ok(name) => groups
                .entry((parent.to_string(), name.generation))
                .or_default()
                .push(file),
            Err(BackupError::MalformedSSTable { path, reason }) => {
                debug!("Ignoring {}: {}", path.display(), reason);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
