//! Control channel to the running database node.

pub mod nodetool;
pub mod tokens;

use crate::utils::Result;
use async_trait::async_trait;

pub use nodetool::Nodetool;

/// Operations the backup and restore flows need from the live node.
#[async_trait]
pub trait NodeControl: Send + Sync {
    /// Snapshot `keyspaces` (all keyspaces when empty) under `tag`,
    /// optionally limited to one table.
    async fn take_snapshot(&self, keyspaces: &[String], tag: &str, table: Option<&str>)
        -> Result<()>;

    async fn clear_snapshot(&self, tag: &str) -> Result<()>;

    /// Flush memtables and stop accepting writes.
    async fn drain(&self) -> Result<()>;

    /// Tokens owned by this node.
    async fn get_tokens(&self) -> Result<Vec<String>>;
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use crate::utils::BackupError;
    use std::sync::Mutex;

    /// Records calls and optionally runs a hook when a snapshot is taken.
    #[derive(Default)]
    pub struct RecordingNode {
        pub calls: Mutex<Vec<String>>,
        pub tokens: Vec<String>,
        pub on_snapshot: Option<Box<dyn Fn(&str) + Send + Sync>>,
        pub fail_snapshot: bool,
    }

    impl RecordingNode {
        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    #[async_trait]
    impl NodeControl for RecordingNode {
        async fn take_snapshot(
            &self,
            keyspaces: &[String],
            tag: &str,
            _table: Option<&str>,
        ) -> Result<()> {
            self.record(format!("snapshot {} {}", tag, keyspaces.join(",")));
            if self.fail_snapshot {
                return Err(BackupError::ControlChannel("snapshot refused".to_string()));
            }
            if let Some(hook) = &self.on_snapshot {
                hook(tag);
            }
            Ok(())
        }

        async fn clear_snapshot(&self, tag: &str) -> Result<()> {
            self.record(format!("clearsnapshot {tag}"));
            Ok(())
        }

        async fn drain(&self) -> Result<()> {
            self.record("drain".to_string());
            Ok(())
        }

        async fn get_tokens(&self) -> Result<Vec<String>> {
            self.record("tokens".to_string());
            Ok(self.tokens.clone())
        }
    }
}
