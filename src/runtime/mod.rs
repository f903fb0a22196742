//! Container runtime abstraction.
//!
//! The runtime knows containers only by handle. It never sees container
//! records; the provisioner keeps the two in step.

mod docker;
mod memory;

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use self::docker::DockerRuntime;
pub use self::memory::InMemoryRuntime;

use crate::error::RuntimeError;

/// Access mode of a bind mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindMountMode {
    ReadOnly,
    ReadWrite,
}

impl BindMountMode {
    pub fn as_docker_flag(&self) -> &'static str {
        match self {
            Self::ReadOnly => "ro",
            Self::ReadWrite => "rw",
        }
    }
}

/// A host path mounted into a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindMount {
    pub src_path: PathBuf,
    pub dst_path: PathBuf,
    pub mode: BindMountMode,
}

impl fmt::Display for BindMount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.src_path.display(),
            self.dst_path.display(),
            self.mode.as_docker_flag()
        )
    }
}

/// Resource limits applied to a container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerLimits {
    /// Relative CPU weight.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<u64>,
    /// Memory limit in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<u64>,
}

/// Everything the runtime needs to create a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeSpec {
    pub handle: String,
    pub rootfs_url: String,
    pub privileged: bool,
    pub bind_mounts: Vec<BindMount>,
    pub limits: ContainerLimits,
    /// `KEY=VALUE` strings.
    pub env: Vec<String>,
    pub properties: BTreeMap<String, String>,
}

/// A container as the runtime reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeContainer {
    pub handle: String,
    pub properties: BTreeMap<String, String>,
}

/// Client for a worker's container runtime.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Look a container up by handle. Fails with
    /// [`RuntimeError::NotFound`] when it does not exist.
    async fn lookup(&self, handle: &str) -> Result<RuntimeContainer, RuntimeError>;

    /// Create (and start) a container named `spec.handle`.
    async fn create(&self, spec: RuntimeSpec) -> Result<RuntimeContainer, RuntimeError>;

    /// Destroy a container. Destroying a missing container is not an error.
    async fn destroy(&self, handle: &str) -> Result<(), RuntimeError>;
}
