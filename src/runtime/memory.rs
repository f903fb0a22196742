use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::RuntimeError;
use crate::runtime::{ContainerRuntime, RuntimeContainer, RuntimeSpec};

/// Runtime that only remembers what it was asked to create.
///
/// Used for tests and dry runs.
#[derive(Default)]
pub struct InMemoryRuntime {
    containers: RwLock<HashMap<String, RuntimeSpec>>,
}

impl InMemoryRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Specs of all live containers.
    pub async fn specs(&self) -> Vec<RuntimeSpec> {
        self.containers.read().await.values().cloned().collect()
    }

    pub async fn spec(&self, handle: &str) -> Option<RuntimeSpec> {
        self.containers.read().await.get(handle).cloned()
    }

    pub async fn len(&self) -> usize {
        self.containers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.containers.read().await.is_empty()
    }

    /// Drop a container behind the provisioner's back.
    pub async fn forget(&self, handle: &str) {
        self.containers.write().await.remove(handle);
    }
}

#[async_trait]
impl ContainerRuntime for InMemoryRuntime {
    async fn lookup(&self, handle: &str) -> Result<RuntimeContainer, RuntimeError> {
        self.containers
            .read()
            .await
            .get(handle)
            .map(|spec| RuntimeContainer {
                handle: spec.handle.clone(),
                properties: spec.properties.clone(),
            })
            .ok_or_else(|| RuntimeError::NotFound {
                handle: handle.to_string(),
            })
    }

    async fn create(&self, spec: RuntimeSpec) -> Result<RuntimeContainer, RuntimeError> {
        let mut containers = self.containers.write().await;
        if containers.contains_key(&spec.handle) {
            return Err(RuntimeError::AlreadyExists {
                handle: spec.handle.clone(),
            });
        }

        let container = RuntimeContainer {
            handle: spec.handle.clone(),
            properties: spec.properties.clone(),
        };
        containers.insert(spec.handle.clone(), spec);
        Ok(container)
    }

    async fn destroy(&self, handle: &str) -> Result<(), RuntimeError> {
        self.containers.write().await.remove(handle);
        Ok(())
    }
}
