//! Advisory, non-blocking locks.
//!
//! A lock is either won immediately or not at all; callers that lose are
//! expected to come back later. The winner holds a [`HeldLock`] guard that
//! releases the lock when dropped, so every exit path (including errors,
//! cancellation and unwinding) gives the lock back.

mod file;
mod memory;

use std::fmt;

use async_trait::async_trait;

pub use self::file::FileLockFactory;
pub use self::memory::InMemoryLockFactory;

use crate::error::LockError;

/// Identifies what a lock protects.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LockId {
    /// Creation of the runtime container for a container record.
    ContainerCreating(i64),
}

impl LockId {
    /// Stable string key, safe to use as a file name.
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ContainerCreating(id) => write!(f, "container-creating-{id}"),
        }
    }
}

/// A won lock. Released on drop.
pub struct HeldLock {
    id: LockId,
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl HeldLock {
    pub fn new(id: LockId, release: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            id,
            release: Some(Box::new(release)),
        }
    }

    pub fn id(&self) -> &LockId {
        &self.id
    }

    /// Release now instead of at end of scope.
    pub fn release(mut self) {
        self.run_release();
    }

    fn run_release(&mut self) {
        if let Some(release) = self.release.take() {
            release();
            tracing::trace!(lock = %self.id, "Released lock");
        }
    }
}

impl fmt::Debug for HeldLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeldLock").field("id", &self.id).finish()
    }
}

impl Drop for HeldLock {
    fn drop(&mut self) {
        self.run_release();
    }
}

/// Hands out advisory locks.
#[async_trait]
pub trait LockFactory: Send + Sync {
    /// Try to take the lock without waiting. `Ok(None)` means someone else
    /// holds it.
    async fn acquire(&self, id: &LockId) -> Result<Option<HeldLock>, LockError>;
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn key_is_file_name_safe() {
        let key = LockId::ContainerCreating(42).key();
        assert_eq!(key, "container-creating-42");
        assert!(!key.contains('/'));
    }

    #[test]
    fn release_runs_exactly_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let lock = HeldLock::new(LockId::ContainerCreating(1), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        lock.release();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drop_releases() {
        let count = Arc::new(AtomicUsize::new(0));
        {
            let counter = Arc::clone(&count);
            let _lock = HeldLock::new(LockId::ContainerCreating(1), move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unwinding_releases() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let result = std::panic::catch_unwind(move || {
            let _lock = HeldLock::new(LockId::ContainerCreating(1), move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
            panic!("boom");
        });
        assert!(result.is_err());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
