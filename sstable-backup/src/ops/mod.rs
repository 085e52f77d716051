//! End-to-end operations composed from the executor, the storage backend
//! and the node control channel. Each runs under the operation lock.

pub mod backup;
pub mod commitlog;
pub mod restore;

use crate::config::Config;
use crate::daemon::OperationLock;
use crate::node::NodeControl;
use crate::storage::StorageBackend;
use crate::transfer::ProgressSink;
use crate::utils::Result;
use std::sync::Arc;

/// Everything an operation needs.
pub struct OperationContext {
    pub config: Config,
    pub backend: Arc<dyn StorageBackend>,
    pub node: Arc<dyn NodeControl>,
    pub sink: Arc<dyn ProgressSink>,
}

impl OperationContext {
    pub async fn lock(&self) -> Result<OperationLock> {
        OperationLock::acquire(&self.config.lock_path(), self.config.lock.wait).await
    }
}
