//! Advisory lock held for the duration of one backup or restore.
//!
//! Uses `flock(2)`, so the kernel releases the lock if the process dies.

use crate::utils::{BackupError, Result};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info};

const POLL_INTERVAL: Duration = Duration::from_secs(1);
const WAIT_LOG_INTERVAL: Duration = Duration::from_secs(30);

/// Exclusive hold on the lock file; released on drop.
pub struct OperationLock {
    path: PathBuf,
    _lock: Flock<File>,
}

impl OperationLock {
    /// Take the lock or fail with `LockContention`.
    pub fn try_acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => {
                lock.set_len(0)?;
                writeln!(&*lock, "{}", std::process::id())?;
                debug!("Acquired lock {}", path.display());
                Ok(Self {
                    path: path.to_path_buf(),
                    _lock: lock,
                })
            }
            Err((_, Errno::EWOULDBLOCK)) => Err(BackupError::LockContention {
                path: path.to_path_buf(),
            }),
            Err((_, errno)) => Err(BackupError::Io(errno.into())),
        }
    }

    /// Take the lock, polling every second while another process holds it
    /// when `wait` is set.
    pub async fn acquire(path: &Path, wait: bool) -> Result<Self> {
        let started = Instant::now();
        let mut last_log = started;
        loop {
            match Self::try_acquire(path) {
                Err(BackupError::LockContention { .. }) if wait => {
                    if last_log.elapsed() >= WAIT_LOG_INTERVAL {
                        info!(
                            "Still waiting for lock {} after {}s",
                            path.display(),
                            started.elapsed().as_secs()
                        );
                        last_log = Instant::now();
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
                other => return other,
            }
        }
    }
}

impl Drop for OperationLock {
    fn drop(&mut self) {
        debug!("Released lock {}", self.path.display());
    }
}
