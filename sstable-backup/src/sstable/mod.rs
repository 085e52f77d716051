//! SSTable file naming.
//!
//! Every on-disk table file is named
//! `[<keyspace>-<table>-]<format>-<generation>[-big]-<component>`, for example
//! `mc-12-big-Data.db` or `ks-users-ka-3-Index.db`. All files sharing the same
//! prefix up to the component belong to one generation.

pub mod hash;

use crate::utils::{BackupError, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

static SSTABLE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:(?P<keyspace>[^-]+)-(?P<table>[^-]+)-)?(?P<format>[a-z]{2})-(?P<generation>\d+)(?:-big)?-(?P<component>.+)$",
    )
    .expect("SSTable name pattern is valid")
});

/// Component suffix of the primary data file of a generation.
pub const DATA_COMPONENT: &str = "Data.db";

/// A parsed SSTable file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SSTableName {
    pub keyspace: Option<String>,
    pub table: Option<String>,
    pub format: String,
    pub generation: u64,
    pub component: String,
    /// Everything up to (and including) the dash before the component.
    prefix: String,
}

impl SSTableName {
    pub fn parse(file_name: &str) -> Option<Self> {
        let caps = SSTABLE_NAME.captures(file_name)?;
        let generation = caps["generation"].parse().ok()?;
        let component = caps["component"].to_string();
        let prefix = file_name[..file_name.len() - component.len()].to_string();

        Some(Self {
            keyspace: caps.name("keyspace").map(|m| m.as_str().to_string()),
            table: caps.name("table").map(|m| m.as_str().to_string()),
            format: caps["format"].to_string(),
            generation,
            component,
            prefix,
        })
    }

    /// Parse the file name of `path`, failing with `MalformedSSTable`.
    pub fn from_path(path: &Path) -> Result<Self> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| BackupError::malformed(path, "file name is not valid UTF-8"))?;

        Self::parse(file_name).ok_or_else(|| {
            BackupError::malformed(path, "name does not match the SSTable naming convention")
        })
    }

    /// File name of another component in the same generation.
    pub fn sibling(&self, component: &str) -> String {
        format!("{}{}", self.prefix, component)
    }

    pub fn is_data(&self) -> bool {
        self.component == DATA_COMPONENT
    }
}

/// Path of `component` next to `path`, in the same generation.
pub fn sibling_path(path: &Path, name: &SSTableName, component: &str) -> PathBuf {
    path.with_file_name(name.sibling(component))
}

/// Whether a file name denotes a generation's `Data.db` component.
pub fn is_data_file(file_name: &str) -> bool {
    file_name.ends_with(&format!("-{DATA_COMPONENT}"))
}
