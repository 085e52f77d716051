//! Parsed storage location descriptors.
//!
//! Two forms are accepted:
//! - `<provider>://<bucket>/<clusterId>/<nodeId>` for object stores
//! - `file://<localRoot>/<bucket>/<clusterId>/<nodeId>` for a local tree

use crate::utils::{BackupError, Result};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

pub const CLOUD_GRAMMAR: &str = "<provider>://<bucket>/<clusterId>/<nodeId>";
pub const FILE_GRAMMAR: &str = "file://<localRoot>/<bucket>/<clusterId>/<nodeId>";

/// Registered backend identifiers, matched case-sensitively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Provider {
    File,
    S3,
    Gcp,
    Azure,
}

impl Provider {
    pub const ALL: [Provider; 4] = [Provider::File, Provider::S3, Provider::Gcp, Provider::Azure];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::File => "file",
            Provider::S3 => "s3",
            Provider::Gcp => "gcp",
            Provider::Azure => "azure",
        }
    }
}

impl FromStr for Provider {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Provider::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or(())
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed location. Equality ignores `raw`, so spellings that differ only
/// in trailing slashes compare equal.
#[derive(Debug, Clone)]
pub struct StorageLocation {
    pub raw: String,
    pub provider: String,
    pub bucket: String,
    pub cluster_id: String,
    pub node_id: String,
    pub local_root: Option<PathBuf>,
}

impl StorageLocation {
    /// Parse a location string and validate it.
    pub fn parse(raw: &str) -> Result<Self> {
        let (provider, rest) = raw
            .split_once("://")
            .ok_or_else(|| invalid(raw, "missing '://' separator", CLOUD_GRAMMAR))?;

        let location = if provider == Provider::File.as_str() {
            // The local root may itself contain slashes; the last three
            // segments are always bucket, cluster and node.
            let trimmed = rest.trim_end_matches('/');
            let mut parts = trimmed.rsplitn(4, '/');
            let node_id = parts.next().unwrap_or_default();
            let cluster_id = parts.next().unwrap_or_default();
            let bucket = parts.next().unwrap_or_default();
            let local_root = parts.next().unwrap_or_default();
            if local_root.is_empty() {
                return Err(invalid(raw, "missing local root directory", FILE_GRAMMAR));
            }
            Self {
                raw: raw.to_string(),
                provider: provider.to_string(),
                bucket: bucket.to_string(),
                cluster_id: cluster_id.to_string(),
                node_id: node_id.to_string(),
                local_root: Some(PathBuf::from(local_root)),
            }
        } else {
            let parts: Vec<&str> = rest.trim_end_matches('/').split('/').collect();
            if parts.len() != 3 {
                return Err(invalid(
                    raw,
                    &format!("expected 3 path segments, found {}", parts.len()),
                    CLOUD_GRAMMAR,
                ));
            }
            Self {
                raw: raw.to_string(),
                provider: provider.to_string(),
                bucket: parts[0].to_string(),
                cluster_id: parts[1].to_string(),
                node_id: parts[2].to_string(),
                local_root: None,
            }
        };

        location.validate()?;
        Ok(location)
    }

    /// Check required fields and the provider registry.
    pub fn validate(&self) -> Result<()> {
        let grammar = self.grammar();

        for (field, value) in [
            ("provider", &self.provider),
            ("bucket", &self.bucket),
            ("cluster id", &self.cluster_id),
            ("node id", &self.node_id),
        ] {
            if value.is_empty() {
                return Err(invalid(&self.raw, &format!("missing {field}"), grammar));
            }
        }

        let provider = self.backend_provider().map_err(|_| {
            let known: Vec<&str> = Provider::ALL.iter().map(|p| p.as_str()).collect();
            invalid(
                &self.raw,
                &format!(
                    "unknown provider '{}' (registered: {})",
                    self.provider,
                    known.join(", ")
                ),
                grammar,
            )
        })?;

        if provider == Provider::File
            && self
                .local_root
                .as_ref()
                .is_none_or(|root| root.as_os_str().is_empty())
        {
            return Err(invalid(&self.raw, "missing local root directory", FILE_GRAMMAR));
        }

        Ok(())
    }

    pub fn backend_provider(&self) -> std::result::Result<Provider, ()> {
        self.provider.parse()
    }

    /// Key prefix shared by every object belonging to this node.
    pub fn node_prefix(&self) -> String {
        format!("{}/{}", self.cluster_id, self.node_id)
    }

    fn grammar(&self) -> &'static str {
        if self.provider == Provider::File.as_str() {
            FILE_GRAMMAR
        } else {
            CLOUD_GRAMMAR
        }
    }
}

impl PartialEq for StorageLocation {
    fn eq(&self, other: &Self) -> bool {
        self.provider == other.provider
            && self.bucket == other.bucket
            && self.cluster_id == other.cluster_id
            && self.node_id == other.node_id
            && self.local_root == other.local_root
    }
}

impl Eq for StorageLocation {}

impl FromStr for StorageLocation {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for StorageLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

fn invalid(raw: &str, reason: &str, expected: &'static str) -> BackupError {
    BackupError::InvalidStorageLocation {
        location: raw.to_string(),
        reason: reason.to_string(),
        expected,
    }
}
