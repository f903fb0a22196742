//! Volume service abstraction.
//!
//! Volumes are host directories that get bind-mounted into containers. A
//! volume is either empty or a copy-on-write child of another volume, and is
//! bound to whatever keeps it alive: a container mount, a resource cache, a
//! task cache, or the worker's certificate bundle.

pub mod artifact;
mod local;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;

pub use self::artifact::{ArtifactSource, DirectoryArtifactSource, VolumeArtifactSource};
pub use self::local::LocalVolumeClient;

use crate::db::ContainerRecord;
use crate::error::VolumeError;

/// A tar stream of volume contents.
pub type ArtifactStream = Box<dyn AsyncRead + Send + Unpin>;

/// How a volume's initial contents are produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VolumeStrategy {
    Empty,
    CopyOnWrite { parent: String },
}

/// What a volume belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VolumeBinding {
    /// Mounted into a container at `mount_path`.
    Container { handle: String, mount_path: PathBuf },
    /// Holds a fetched resource version.
    ResourceCache { cache_id: i64 },
    /// Persists a task cache path between builds of a job.
    TaskCache {
        team_id: i32,
        job_id: i64,
        step_name: String,
        path: String,
    },
    /// The worker's CA certificate bundle.
    ResourceCerts,
}

/// A volume living on one worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Volume {
    pub handle: String,
    /// Host path of the volume's contents.
    pub path: PathBuf,
    pub worker_name: String,
    pub team_id: i32,
    pub privileged: bool,
    pub strategy: VolumeStrategy,
    pub binding: VolumeBinding,
}

impl Volume {
    /// Where the volume is mounted, when it is bound to a container.
    pub fn mount_path(&self) -> Option<&Path> {
        match &self.binding {
            VolumeBinding::Container { mount_path, .. } => Some(mount_path),
            _ => None,
        }
    }

    /// Handle of the container the volume is mounted into, if any.
    pub fn container_handle(&self) -> Option<&str> {
        match &self.binding {
            VolumeBinding::Container { handle, .. } => Some(handle),
            _ => None,
        }
    }
}

/// Client for one worker's volume service.
#[async_trait]
pub trait VolumeClient: Send + Sync {
    /// Find the volume mounted at `mount_path` in a container, or create an
    /// empty one.
    async fn find_or_create_volume_for_container(
        &self,
        container: &ContainerRecord,
        mount_path: &Path,
        privileged: bool,
    ) -> Result<Volume, VolumeError>;

    /// Find the volume mounted at `mount_path` in a container, or create a
    /// copy-on-write child of `parent`.
    async fn find_or_create_cow_volume_for_container(
        &self,
        container: &ContainerRecord,
        parent: &Volume,
        mount_path: &Path,
        privileged: bool,
    ) -> Result<Volume, VolumeError>;

    /// Unpack a tar stream into a volume.
    async fn stream_into(&self, volume: &Volume, stream: ArtifactStream)
    -> Result<(), VolumeError>;

    /// Produce a tar stream of a volume's contents.
    async fn stream_out(&self, volume: &Volume) -> Result<ArtifactStream, VolumeError>;

    async fn lookup_volume(&self, handle: &str) -> Result<Option<Volume>, VolumeError>;

    async fn find_volume_for_resource_cache(
        &self,
        cache_id: i64,
    ) -> Result<Option<Volume>, VolumeError>;

    async fn find_volume_for_task_cache(
        &self,
        team_id: i32,
        job_id: i64,
        step_name: &str,
        path: &str,
    ) -> Result<Option<Volume>, VolumeError>;

    /// The worker's certificate volume. `None` when the worker has no
    /// certificates to offer.
    async fn find_or_create_volume_for_resource_certs(
        &self,
    ) -> Result<Option<Volume>, VolumeError>;
}
