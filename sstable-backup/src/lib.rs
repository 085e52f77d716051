//! SSTable Backup Library
//!
//! Content-addressed backup and restore of SSTables and commit-log segments
//! to object storage.

pub mod config;
pub mod daemon;
pub mod executor;
pub mod fs;
pub mod node;
pub mod ops;
pub mod sstable;
pub mod storage;
pub mod transfer;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use utils::errors::BackupError;
pub use utils::errors::Result;
