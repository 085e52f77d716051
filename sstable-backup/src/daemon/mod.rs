//! Process-level guards: the operation lock and signal handling.

pub mod lock;
pub mod shutdown;

pub use lock::OperationLock;
