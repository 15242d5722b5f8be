#![forbid(unsafe_code)]

//! Advisory lock around the record store.
//!
//! The lock lives on a dedicated `*.lock` file rather than on the store file itself:
//! the store is replaced by rename on every write, so a lock held on the old inode
//! would not exclude a process that opened the new one.

use std::fs::{File, OpenOptions, TryLockError};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::error::TaskqError;

const RETRY_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// Held lock; released when dropped (including on early `?` returns).
#[derive(Debug)]
pub struct StoreLock {
    file: File,
    mode: LockMode,
}

impl StoreLock {
    /// Poll for the lock until `timeout` elapses.
    pub fn acquire(path: &Path, mode: LockMode, timeout: Duration) -> Result<Self, TaskqError> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| TaskqError::io(path, e))?;

        let start = Instant::now();
        loop {
            let attempt = match mode {
                LockMode::Shared => file.try_lock_shared(),
                LockMode::Exclusive => file.try_lock(),
            };
            match attempt {
                Ok(()) => return Ok(Self { file, mode }),
                Err(TryLockError::WouldBlock) => {}
                Err(TryLockError::Error(e)) => return Err(TaskqError::io(path, e)),
            }
            let waited = start.elapsed();
            if waited >= timeout {
                return Err(TaskqError::LockTimeout {
                    path: PathBuf::from(path),
                    waited,
                });
            }
            std::thread::sleep(RETRY_INTERVAL.min(timeout - waited));
        }
    }

    #[must_use]
    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}
