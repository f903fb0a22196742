//! In-process record store.
//!
//! Holds all records behind one `RwLock`, so every operation is atomic with
//! respect to the others. Suitable for single-process deployments and tests.

use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::db::{
    ContainerMetadata, ContainerOwner, ContainerRecord, ContainerState, ContainerStore,
    VolumeStore,
};
use crate::error::DatabaseError;
use crate::volume::{Volume, VolumeBinding};

#[derive(Default)]
struct State {
    next_id: i64,
    containers: Vec<ContainerRecord>,
    volumes: Vec<Volume>,
}

/// Record store that keeps everything in memory.
#[derive(Default)]
pub struct InMemoryDatabase {
    state: RwLock<State>,
}

impl InMemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every container record, including failed ones.
    pub async fn containers(&self) -> Vec<ContainerRecord> {
        self.state.read().await.containers.clone()
    }

    /// Snapshot of every registered volume.
    pub async fn volumes(&self) -> Vec<Volume> {
        self.state.read().await.volumes.clone()
    }

    async fn transition(
        &self,
        container: &ContainerRecord,
        to: ContainerState,
    ) -> Result<ContainerRecord, DatabaseError> {
        let mut state = self.state.write().await;
        let record = state
            .containers
            .iter_mut()
            .find(|c| c.id == container.id)
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "container".to_string(),
                id: container.handle.clone(),
            })?;

        match (record.state, to) {
            (ContainerState::Creating, _) => record.state = to,
            (from, to) if from == to => {}
            (from, to) => {
                return Err(DatabaseError::InvalidTransition {
                    handle: record.handle.clone(),
                    from: from.to_string(),
                    to: to.to_string(),
                });
            }
        }

        Ok(record.clone())
    }
}

#[async_trait]
impl ContainerStore for InMemoryDatabase {
    async fn find_container_on_worker(
        &self,
        worker_name: &str,
        owner: &ContainerOwner,
    ) -> Result<Option<ContainerRecord>, DatabaseError> {
        let state = self.state.read().await;
        Ok(state
            .containers
            .iter()
            .find(|c| {
                c.worker_name == worker_name
                    && &c.owner == owner
                    && c.state != ContainerState::Failed
            })
            .cloned())
    }

    async fn count_build_containers(&self, worker_name: &str) -> Result<usize, DatabaseError> {
        let state = self.state.read().await;
        Ok(state
            .containers
            .iter()
            .filter(|c| {
                c.worker_name == worker_name
                    && matches!(c.owner, ContainerOwner::BuildStep { .. })
                    && c.state != ContainerState::Failed
            })
            .count())
    }

    async fn create_container(
        &self,
        worker_name: &str,
        owner: &ContainerOwner,
        metadata: &ContainerMetadata,
        team_id: i32,
    ) -> Result<ContainerRecord, DatabaseError> {
        let mut state = self.state.write().await;

        if let Some(existing) = state.containers.iter().find(|c| {
            c.worker_name == worker_name && &c.owner == owner && c.state != ContainerState::Failed
        }) {
            return Ok(existing.clone());
        }

        state.next_id += 1;
        let record = ContainerRecord {
            id: state.next_id,
            handle: Uuid::new_v4().to_string(),
            worker_name: worker_name.to_string(),
            owner: owner.clone(),
            metadata: metadata.clone(),
            team_id,
            state: ContainerState::Creating,
            created_at: Utc::now(),
        };
        state.containers.push(record.clone());
        Ok(record)
    }

    async fn mark_created(
        &self,
        container: &ContainerRecord,
    ) -> Result<ContainerRecord, DatabaseError> {
        self.transition(container, ContainerState::Created).await
    }

    async fn mark_failed(
        &self,
        container: &ContainerRecord,
    ) -> Result<ContainerRecord, DatabaseError> {
        self.transition(container, ContainerState::Failed).await
    }

    async fn find_created_container_by_handle(
        &self,
        team_id: i32,
        handle: &str,
    ) -> Result<Option<ContainerRecord>, DatabaseError> {
        let state = self.state.read().await;
        Ok(state
            .containers
            .iter()
            .find(|c| c.handle == handle && c.team_id == team_id && c.is_created())
            .cloned())
    }
}

#[async_trait]
impl VolumeStore for InMemoryDatabase {
    async fn insert_volume(&self, volume: Volume) -> Result<Volume, DatabaseError> {
        let mut state = self.state.write().await;

        if state.volumes.iter().any(|v| v.handle == volume.handle) {
            return Err(DatabaseError::Query(format!(
                "duplicate volume handle {}",
                volume.handle
            )));
        }

        if let Some(existing) = state
            .volumes
            .iter()
            .find(|v| v.worker_name == volume.worker_name && v.binding == volume.binding)
        {
            return Ok(existing.clone());
        }

        state.volumes.push(volume.clone());
        Ok(volume)
    }

    async fn find_volume(&self, handle: &str) -> Result<Option<Volume>, DatabaseError> {
        let state = self.state.read().await;
        Ok(state.volumes.iter().find(|v| v.handle == handle).cloned())
    }

    async fn find_container_volume(
        &self,
        container_handle: &str,
        mount_path: &Path,
    ) -> Result<Option<Volume>, DatabaseError> {
        let state = self.state.read().await;
        Ok(state
            .volumes
            .iter()
            .find(|v| match &v.binding {
                VolumeBinding::Container { handle, mount_path: path } => {
                    handle == container_handle && path == mount_path
                }
                _ => false,
            })
            .cloned())
    }

    async fn find_volumes_for_container(
        &self,
        container: &ContainerRecord,
    ) -> Result<Vec<Volume>, DatabaseError> {
        let state = self.state.read().await;
        Ok(state
            .volumes
            .iter()
            .filter(|v| {
                matches!(&v.binding, VolumeBinding::Container { handle, .. } if *handle == container.handle)
            })
            .cloned()
            .collect())
    }

    async fn find_resource_cache_volume(
        &self,
        worker_name: &str,
        cache_id: i64,
    ) -> Result<Option<Volume>, DatabaseError> {
        let state = self.state.read().await;
        Ok(state
            .volumes
            .iter()
            .find(|v| {
                v.worker_name == worker_name
                    && v.binding == VolumeBinding::ResourceCache { cache_id }
            })
            .cloned())
    }

    async fn find_task_cache_volume(
        &self,
        worker_name: &str,
        team_id: i32,
        job_id: i64,
        step_name: &str,
        path: &str,
    ) -> Result<Option<Volume>, DatabaseError> {
        let state = self.state.read().await;
        Ok(state
            .volumes
            .iter()
            .find(|v| {
                v.worker_name == worker_name
                    && matches!(
                        &v.binding,
                        VolumeBinding::TaskCache {
                            team_id: t,
                            job_id: j,
                            step_name: s,
                            path: p,
                        } if *t == team_id && *j == job_id && s == step_name && p == path
                    )
            })
            .cloned())
    }

    async fn find_certs_volume(&self, worker_name: &str) -> Result<Option<Volume>, DatabaseError> {
        let state = self.state.read().await;
        Ok(state
            .volumes
            .iter()
            .find(|v| v.worker_name == worker_name && v.binding == VolumeBinding::ResourceCerts)
            .cloned())
    }
}
