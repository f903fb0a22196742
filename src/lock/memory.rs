use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::LockError;
use crate::lock::{HeldLock, LockFactory, LockId};

/// Process-local lock factory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLockFactory {
    held: Arc<Mutex<HashSet<LockId>>>,
}

impl InMemoryLockFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the lock is currently held by anyone.
    pub fn is_held(&self, id: &LockId) -> bool {
        self.held
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(id)
    }
}

#[async_trait]
impl LockFactory for InMemoryLockFactory {
    async fn acquire(&self, id: &LockId) -> Result<Option<HeldLock>, LockError> {
        let mut held = self
            .held
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !held.insert(id.clone()) {
            return Ok(None);
        }

        let registry = Arc::clone(&self.held);
        let key = id.clone();
        Ok(Some(HeldLock::new(id.clone(), move || {
            registry
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .remove(&key);
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_acquire_loses_until_release() {
        let locks = InMemoryLockFactory::new();
        let id = LockId::ContainerCreating(7);

        let held = locks.acquire(&id).await.unwrap();
        assert!(held.is_some());
        assert!(locks.is_held(&id));
        assert!(locks.acquire(&id).await.unwrap().is_none());

        drop(held);
        assert!(!locks.is_held(&id));
        assert!(locks.acquire(&id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn distinct_ids_do_not_contend() {
        let locks = InMemoryLockFactory::new();
        let a = locks.acquire(&LockId::ContainerCreating(1)).await.unwrap();
        let b = locks.acquire(&LockId::ContainerCreating(2)).await.unwrap();
        assert!(a.is_some());
        assert!(b.is_some());
    }
}
