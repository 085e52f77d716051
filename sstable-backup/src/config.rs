//! Configuration management for sstable-backup.
//!
//! Loads configuration from a TOML file; every field has a default and the
//! command line overrides individual fields.

use crate::executor::{TransferOptions, DEFAULT_CONCURRENCY, DEFAULT_FRESHEN_RATE};
use crate::transfer::rate_limiter::parse_bandwidth;
use crate::utils::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub transfer: TransferConfig,

    #[serde(default)]
    pub lock: LockConfig,

    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Database data directory (holds `data/` and, by default, `commitlog/`)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Live commit-log directory (default: `<data_dir>/commitlog`)
    #[serde(default)]
    pub commitlog_dir: Option<PathBuf>,

    /// Where restored segments are placed for replay
    /// (default: `<data_dir>/commitlog_restore`)
    #[serde(default)]
    pub commitlog_restore_dir: Option<PathBuf>,

    /// Directory receiving post-restore config fragments and
    /// `commitlog_archiving.properties`
    #[serde(default = "default_config_dir")]
    pub config_dir: PathBuf,

    /// nodetool executable
    #[serde(default = "default_nodetool")]
    pub nodetool: PathBuf,

    /// JMX host passed to nodetool
    #[serde(default)]
    pub jmx_host: Option<String>,

    /// JMX port passed to nodetool
    #[serde(default)]
    pub jmx_port: Option<u16>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Remote location, `<provider>://<bucket>/<clusterId>/<nodeId>`
    #[serde(default)]
    pub location: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Concurrent transfers per batch
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Byte-rate cap such as "50MB" (per second)
    #[serde(default)]
    pub bandwidth: Option<String>,

    /// Target duration of a batch in seconds
    #[serde(default)]
    pub duration_secs: Option<u64>,

    /// Freshen requests per second (0 = unlimited)
    #[serde(default = "default_freshen_rate")]
    pub freshen_rate: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LockConfig {
    /// Lock file (default: `<data_dir>/.sstable-backup.lock`)
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Wait for a running operation instead of failing
    #[serde(default)]
    pub wait: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/cassandra")
}

fn default_config_dir() -> PathBuf {
    PathBuf::from("/etc/cassandra/cassandra.yaml.d")
}

fn default_nodetool() -> PathBuf {
    PathBuf::from("nodetool")
}

fn default_concurrency() -> usize {
    DEFAULT_CONCURRENCY
}

fn default_freshen_rate() -> u64 {
    DEFAULT_FRESHEN_RATE
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            commitlog_dir: None,
            commitlog_restore_dir: None,
            config_dir: default_config_dir(),
            nodetool: default_nodetool(),
            jmx_host: None,
            jmx_port: None,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            bandwidth: None,
            duration_secs: None,
            freshen_rate: default_freshen_rate(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// `<data_dir>/data`, the root of the keyspace directories.
    pub fn data_root(&self) -> PathBuf {
        self.node.data_dir.join("data")
    }

    pub fn commitlog_dir(&self) -> PathBuf {
        self.node
            .commitlog_dir
            .clone()
            .unwrap_or_else(|| self.node.data_dir.join("commitlog"))
    }

    pub fn commitlog_restore_dir(&self) -> PathBuf {
        self.node
            .commitlog_restore_dir
            .clone()
            .unwrap_or_else(|| self.node.data_dir.join("commitlog_restore"))
    }

    pub fn lock_path(&self) -> PathBuf {
        self.lock
            .path
            .clone()
            .unwrap_or_else(|| self.node.data_dir.join(".sstable-backup.lock"))
    }

    /// Scratch space for downloaded manifests and token files.
    pub fn staging_dir(&self) -> PathBuf {
        self.node.data_dir.join(".sstable-backup")
    }

    pub fn transfer_options(&self) -> Result<TransferOptions> {
        let bandwidth = self
            .transfer
            .bandwidth
            .as_deref()
            .map(parse_bandwidth)
            .transpose()?;

        Ok(TransferOptions {
            concurrency: self.transfer.concurrency.max(1),
            bandwidth,
            duration: self.transfer.duration_secs.map(Duration::from_secs),
            freshen_rate: (self.transfer.freshen_rate > 0).then_some(self.transfer.freshen_rate),
        })
    }
}
