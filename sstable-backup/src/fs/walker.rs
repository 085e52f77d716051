//! Data directory traversal.
//!
//! The node stores tables as `<dataRoot>/<keyspace>/<tableDir>/`, with
//! snapshots under `<tableDir>/snapshots/<tag>/`, incremental backups under
//! `<tableDir>/backups/` and secondary indexes in `.`-prefixed subdirectories.

use crate::executor::predicates::KeyspaceTable;
use crate::sstable::SSTableName;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub const SNAPSHOTS_DIR: &str = "snapshots";

/// One table directory of the data root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDir {
    pub keyspace: String,

    /// Directory name, usually `<table>-<id>`
    pub name: String,

    pub path: PathBuf,
}

impl TableDir {
    pub fn keyspace_table(&self) -> KeyspaceTable {
        KeyspaceTable::from_table_dir(&self.keyspace, &self.name)
    }

    pub fn snapshot_dir(&self, tag: &str) -> PathBuf {
        self.path.join(SNAPSHOTS_DIR).join(tag)
    }

    /// Backup key prefix for this table: `data/<keyspace>/<tableDir>`.
    pub fn backup_root(&self) -> String {
        format!("data/{}/{}", self.keyspace, self.name)
    }
}

/// A live SSTable component found in a table directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalSSTable {
    pub path: PathBuf,

    /// Path relative to the data root, slash separated
    pub relative: String,

    pub table: KeyspaceTable,
}

/// List every `<keyspace>/<tableDir>` below `data_root`, sorted.
///
/// A missing data root has no tables.
pub fn table_directories(data_root: &Path) -> std::io::Result<Vec<TableDir>> {
    if !data_root.is_dir() {
        return Ok(Vec::new());
    }

    let mut tables = Vec::new();
    for entry in WalkDir::new(data_root)
        .min_depth(2)
        .max_depth(2)
        .sort_by_file_name()
    {
        let entry = entry?;
        if !entry.file_type().is_dir() {
            continue;
        }
        let keyspace = entry
            .path()
            .parent()
            .and_then(Path::file_name)
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        tables.push(TableDir {
            keyspace,
            name: entry.file_name().to_string_lossy().to_string(),
            path: entry.into_path(),
        });
    }
    Ok(tables)
}

/// Live SSTable components under `data_root`.
///
/// Snapshot and backup directories are skipped; secondary index
/// directories are descended. Files that are not SSTable components are
/// ignored.
pub fn local_sstables(data_root: &Path) -> std::io::Result<Vec<LocalSSTable>> {
    let mut found = Vec::new();
    for table in table_directories(data_root)? {
        let walker = WalkDir::new(&table.path)
            .min_depth(1)
            .max_depth(2)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| {
                if e.depth() == 1 && e.file_type().is_dir() {
                    let name = e.file_name().to_string_lossy();
                    return name.starts_with('.');
                }
                true
            });

        for entry in walker {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if SSTableName::parse(&name).is_none() {
                continue;
            }
            let relative = relative_key(data_root, entry.path());
            found.push(LocalSSTable {
                path: entry.into_path(),
                relative,
                table: table.keyspace_table(),
            });
        }
    }
    Ok(found)
}

/// Slash-separated path of `path` relative to `root`.
pub fn relative_key(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect::<Vec<_>>()
        .join("/")
}
