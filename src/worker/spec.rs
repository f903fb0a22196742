//! What a step asks of a worker and of the container it gets.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::VolumeError;
use crate::image::ImageSpec;
use crate::runtime::{BindMount, BindMountMode};
use crate::volume::{ArtifactSource, VolumeClient};

pub use crate::runtime::ContainerLimits;

/// Where the worker's certificates are mounted.
pub const CERTS_MOUNT_PATH: &str = "/etc/ssl/certs";

/// Constraints a worker has to meet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub team_id: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,
}

/// A pipeline-defined resource type, built on top of another type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedResourceType {
    pub name: String,
    /// The type this one is built from.
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(default)]
    pub source: serde_json::Value,
    #[serde(default)]
    pub privileged: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<BTreeMap<String, String>>,
}

/// The resource type catalog of a pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionedResourceTypes(Vec<VersionedResourceType>);

impl VersionedResourceTypes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, name: &str) -> Option<&VersionedResourceType> {
        self.0.iter().find(|t| t.name == name)
    }

    /// The catalog without the type called `name`.
    pub fn without(&self, name: &str) -> Self {
        Self(self.0.iter().filter(|t| t.name != name).cloned().collect())
    }

    pub fn iter(&self) -> impl Iterator<Item = &VersionedResourceType> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<VersionedResourceType>> for VersionedResourceTypes {
    fn from(types: Vec<VersionedResourceType>) -> Self {
        Self(types)
    }
}

/// A step input and where it should appear in the container.
#[derive(Clone)]
pub struct InputSource {
    pub source: Arc<dyn ArtifactSource>,
    pub destination: String,
}

impl InputSource {
    pub fn new(source: Arc<dyn ArtifactSource>, destination: impl Into<String>) -> Self {
        Self {
            source,
            destination: destination.into(),
        }
    }
}

impl fmt::Debug for InputSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputSource")
            .field("source", &self.source.description())
            .field("destination", &self.destination)
            .finish()
    }
}

/// Output name to destination path.
pub type OutputPaths = BTreeMap<String, String>;

/// Something that contributes a host bind mount on some workers.
#[async_trait]
pub trait BindMountSource: Send + Sync {
    /// The mount to add on `worker_name`, or `None` if this source has
    /// nothing for that worker.
    async fn bind_mount_on(
        &self,
        worker_name: &str,
        client: &dyn VolumeClient,
    ) -> Result<Option<BindMount>, VolumeError>;
}

/// Mounts the worker's certificate volume read-only.
#[derive(Debug, Clone, Copy, Default)]
pub struct CertsBindMount;

#[async_trait]
impl BindMountSource for CertsBindMount {
    async fn bind_mount_on(
        &self,
        _worker_name: &str,
        client: &dyn VolumeClient,
    ) -> Result<Option<BindMount>, VolumeError> {
        Ok(client
            .find_or_create_volume_for_resource_certs()
            .await?
            .map(|volume| BindMount {
                src_path: volume.path,
                dst_path: PathBuf::from(CERTS_MOUNT_PATH),
                mode: BindMountMode::ReadOnly,
            }))
    }
}

/// Everything needed to build one container.
#[derive(Clone, Default)]
pub struct ContainerSpec {
    pub image_spec: ImageSpec,
    pub team_id: i32,
    pub inputs: Vec<InputSource>,
    pub outputs: OutputPaths,
    pub bind_mounts: Vec<Arc<dyn BindMountSource>>,
    pub limits: ContainerLimits,
    /// `KEY=VALUE` strings.
    pub env: Vec<String>,
    pub user: Option<String>,
    /// Working directory.
    pub dir: Option<String>,
}

impl fmt::Debug for ContainerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContainerSpec")
            .field("image_spec", &self.image_spec)
            .field("team_id", &self.team_id)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("bind_mounts", &self.bind_mounts.len())
            .field("limits", &self.limits)
            .field("env", &self.env)
            .field("user", &self.user)
            .field("dir", &self.dir)
            .finish()
    }
}
