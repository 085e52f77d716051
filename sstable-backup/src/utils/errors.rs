//! Error types for backup and restore operations.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    /// A file name did not match the SSTable naming convention, or a
    /// generation has nothing to derive a checksum from.
    #[error("Malformed SSTable {path}: {reason}")]
    MalformedSSTable { path: PathBuf, reason: String },

    #[error("No data captured: the backup manifest contains no Data.db entries")]
    NoDataCaptured,

    #[error("Invalid storage location '{location}': {reason}; expected {expected}")]
    InvalidStorageLocation {
        location: String,
        reason: String,
        expected: &'static str,
    },

    /// An object key that would resolve outside the node root.
    #[error("Invalid object key '{key}': {reason}")]
    InvalidObjectKey { key: String, reason: &'static str },

    #[error("Transfer of '{key}' failed: {reason}")]
    Transfer { key: String, reason: String },

    #[error("Freshen check for '{key}' failed: {reason}")]
    FreshenCheck { key: String, reason: String },

    #[error("Lock {path} is held by another backup or restore")]
    LockContention { path: PathBuf },

    #[error("Backend cleanup failed: {0}")]
    Cleanup(String),

    #[error("Manifest error: {0}")]
    Manifest(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Node control error: {0}")]
    ControlChannel(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Interrupted by signal")]
    Interrupted,
}

impl BackupError {
    pub fn malformed(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        BackupError::MalformedSSTable {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn transfer(key: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        BackupError::Transfer {
            key: key.into(),
            reason: reason.to_string(),
        }
    }

    /// Process exit code expected by callers of the binary.
    pub fn exit_code(&self) -> i32 {
        match self {
            BackupError::LockContention { .. } => 3,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
