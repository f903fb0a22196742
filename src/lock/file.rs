use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::PathBuf;

use async_trait::async_trait;
use fs4::FileExt;

use crate::error::LockError;
use crate::lock::{HeldLock, LockFactory, LockId};

/// Lock factory backed by advisory `flock`s on files in a directory.
///
/// Works across processes on the same host. The lock file is left behind on
/// release; only the lock on it is dropped.
#[derive(Debug, Clone)]
pub struct FileLockFactory {
    dir: PathBuf,
}

impl FileLockFactory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn lock_path(&self, id: &LockId) -> PathBuf {
        self.dir.join(format!("{}.lock", id.key()))
    }

    fn try_lock(&self, id: &LockId) -> Result<Option<File>, LockError> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.lock_path(id);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)?;

        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(file)),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(LockError::AcquireFailed {
                key: id.key(),
                reason: e.to_string(),
            }),
        }
    }
}

#[async_trait]
impl LockFactory for FileLockFactory {
    async fn acquire(&self, id: &LockId) -> Result<Option<HeldLock>, LockError> {
        let factory = self.clone();
        let lock_id = id.clone();
        let file = tokio::task::spawn_blocking(move || factory.try_lock(&lock_id))
            .await
            .map_err(|e| LockError::AcquireFailed {
                key: id.key(),
                reason: e.to_string(),
            })??;

        Ok(file.map(|file| {
            // Closing the descriptor drops the flock.
            HeldLock::new(id.clone(), move || drop(file))
        }))
    }
}
