//! Record store abstraction.
//!
//! Containers are tracked as a single tagged-state [`ContainerRecord`] keyed
//! by `(worker, owner)`. State changes go through [`ContainerStore`] as
//! compare-and-swap transitions; nothing mutates a record in place.
//!
//! Volumes created by the volume client are registered through
//! [`VolumeStore`] so a container's mounts can be reassembled later.

mod memory;

use std::fmt;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use self::memory::InMemoryDatabase;

use crate::error::DatabaseError;
use crate::volume::Volume;

/// Why a container exists. Used as the idempotency key for lookups.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContainerOwner {
    /// A step of a running build.
    BuildStep {
        build_id: i64,
        plan_id: String,
        team_id: i32,
    },
    /// A periodic version check of a resource configuration.
    ResourceCheck { resource_config_id: i64, team_id: i32 },
    /// Populating a task cache ahead of a build.
    TaskCacheWarmup {
        job_id: i64,
        step_name: String,
        path: String,
    },
}

impl fmt::Display for ContainerOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BuildStep {
                build_id, plan_id, ..
            } => write!(f, "build {build_id} plan {plan_id}"),
            Self::ResourceCheck {
                resource_config_id, ..
            } => write!(f, "check of resource config {resource_config_id}"),
            Self::TaskCacheWarmup {
                job_id,
                step_name,
                path,
            } => write!(f, "task cache {path} of job {job_id} step {step_name}"),
        }
    }
}

/// The kind of step a container serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerType {
    Check,
    Get,
    Put,
    Task,
}

impl ContainerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Check => "check",
            Self::Get => "get",
            Self::Put => "put",
            Self::Task => "task",
        }
    }
}

/// Descriptive attributes stored alongside a container record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_type: Option<ContainerType>,
    #[serde(default)]
    pub step_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

/// Lifecycle state of a container record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    /// Intent recorded; the runtime container may or may not exist yet.
    Creating,
    /// Both the record store and the runtime agree the container exists.
    Created,
    /// Terminal failure. Never reused.
    Failed,
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Creating => write!(f, "creating"),
            Self::Created => write!(f, "created"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Durable record of a container, shared by the record store and runtime
/// through its `handle`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerRecord {
    pub id: i64,
    pub handle: String,
    pub worker_name: String,
    pub owner: ContainerOwner,
    pub metadata: ContainerMetadata,
    pub team_id: i32,
    pub state: ContainerState,
    pub created_at: DateTime<Utc>,
}

impl ContainerRecord {
    pub fn is_created(&self) -> bool {
        self.state == ContainerState::Created
    }
}

/// Container record operations.
#[async_trait]
pub trait ContainerStore: Send + Sync {
    /// Find the live (creating or created) record for an owner on a worker.
    /// Failed records are ignored.
    async fn find_container_on_worker(
        &self,
        worker_name: &str,
        owner: &ContainerOwner,
    ) -> Result<Option<ContainerRecord>, DatabaseError>;

    /// Create a `Creating` record for an owner, or return the live record
    /// that already exists. Concurrent callers converge on one record.
    async fn create_container(
        &self,
        worker_name: &str,
        owner: &ContainerOwner,
        metadata: &ContainerMetadata,
        team_id: i32,
    ) -> Result<ContainerRecord, DatabaseError>;

    /// Transition `Creating` to `Created`. Already-created records are
    /// returned unchanged; failed records are rejected.
    async fn mark_created(
        &self,
        container: &ContainerRecord,
    ) -> Result<ContainerRecord, DatabaseError>;

    /// Transition `Creating` to `Failed`. Created records are rejected.
    async fn mark_failed(
        &self,
        container: &ContainerRecord,
    ) -> Result<ContainerRecord, DatabaseError>;

    /// Number of live (creating or created) build step containers on a
    /// worker.
    async fn count_build_containers(&self, worker_name: &str) -> Result<usize, DatabaseError>;

    /// Find a created container of a team by handle.
    async fn find_created_container_by_handle(
        &self,
        team_id: i32,
        handle: &str,
    ) -> Result<Option<ContainerRecord>, DatabaseError>;
}

/// Volume registration operations.
#[async_trait]
pub trait VolumeStore: Send + Sync {
    /// Register a volume. When a volume with the same binding already exists
    /// on the same worker, that volume is returned instead.
    async fn insert_volume(&self, volume: Volume) -> Result<Volume, DatabaseError>;

    async fn find_volume(&self, handle: &str) -> Result<Option<Volume>, DatabaseError>;

    async fn find_container_volume(
        &self,
        container_handle: &str,
        mount_path: &Path,
    ) -> Result<Option<Volume>, DatabaseError>;

    async fn find_volumes_for_container(
        &self,
        container: &ContainerRecord,
    ) -> Result<Vec<Volume>, DatabaseError>;

    async fn find_resource_cache_volume(
        &self,
        worker_name: &str,
        cache_id: i64,
    ) -> Result<Option<Volume>, DatabaseError>;

    async fn find_task_cache_volume(
        &self,
        worker_name: &str,
        team_id: i32,
        job_id: i64,
        step_name: &str,
        path: &str,
    ) -> Result<Option<Volume>, DatabaseError>;

    async fn find_certs_volume(&self, worker_name: &str) -> Result<Option<Volume>, DatabaseError>;
}

/// Everything the provisioner needs from the record store.
pub trait Database: ContainerStore + VolumeStore {}

impl<T: ContainerStore + VolumeStore> Database for T {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_display_names_the_step() {
        let owner = ContainerOwner::BuildStep {
            build_id: 42,
            plan_id: "abc".to_string(),
            team_id: 1,
        };
        assert_eq!(owner.to_string(), "build 42 plan abc");
    }

    #[test]
    fn owner_serializes_with_kind_tag() {
        let owner = ContainerOwner::ResourceCheck {
            resource_config_id: 7,
            team_id: 2,
        };
        let json = serde_json::to_value(&owner).unwrap();
        assert_eq!(json["kind"], "resource_check");
        let back: ContainerOwner = serde_json::from_value(json).unwrap();
        assert_eq!(back, owner);
    }

    #[test]
    fn state_display() {
        assert_eq!(ContainerState::Creating.to_string(), "creating");
        assert_eq!(ContainerState::Created.to_string(), "created");
        assert_eq!(ContainerState::Failed.to_string(), "failed");
    }
}
