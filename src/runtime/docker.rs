//! Docker-backed container runtime.
//!
//! Containers are named after their handle, carry their properties as
//! labels, and idle on a keepalive command until the step executor runs
//! processes in them.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, RemoveContainerOptions,
};
use bollard::models::HostConfig;
use tokio::sync::RwLock;
use url::Url;

use crate::config::DockerConfig;
use crate::error::RuntimeError;
use crate::runtime::{ContainerRuntime, RuntimeContainer, RuntimeSpec};

/// Container runtime talking to the local Docker daemon.
pub struct DockerRuntime {
    config: DockerConfig,
    docker: Arc<RwLock<Option<Docker>>>,
}

impl DockerRuntime {
    /// Create a runtime. The daemon connection is opened on first use.
    pub fn new(config: DockerConfig) -> Self {
        Self {
            config,
            docker: Arc::new(RwLock::new(None)),
        }
    }

    /// Get or create the Docker connection.
    async fn docker(&self) -> Result<Docker, RuntimeError> {
        {
            let guard = self.docker.read().await;
            if let Some(ref d) = *guard {
                return Ok(d.clone());
            }
        }
        let docker = Docker::connect_with_local_defaults().map_err(|e| RuntimeError::Docker {
            reason: e.to_string(),
        })?;
        *self.docker.write().await = Some(docker.clone());
        Ok(docker)
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn lookup(&self, handle: &str) -> Result<RuntimeContainer, RuntimeError> {
        let docker = self.docker().await?;
        let response = docker
            .inspect_container(handle, None::<InspectContainerOptions>)
            .await
            .map_err(|e| map_docker_error(handle, e))?;

        let properties = response
            .config
            .and_then(|c| c.labels)
            .unwrap_or_default()
            .into_iter()
            .collect::<BTreeMap<_, _>>();

        Ok(RuntimeContainer {
            handle: handle.to_string(),
            properties,
        })
    }

    async fn create(&self, spec: RuntimeSpec) -> Result<RuntimeContainer, RuntimeError> {
        let image = image_reference(&spec.rootfs_url).map_err(|reason| {
            RuntimeError::InvalidSpec {
                handle: spec.handle.clone(),
                reason,
            }
        })?;

        let binds: Vec<String> = spec.bind_mounts.iter().map(ToString::to_string).collect();
        let host_config = HostConfig {
            binds: if binds.is_empty() { None } else { Some(binds) },
            privileged: Some(spec.privileged),
            memory: spec.limits.memory.map(|m| m as i64),
            cpu_shares: spec.limits.cpu.map(|c| c as i64),
            ..Default::default()
        };

        let labels: HashMap<String, String> = spec
            .properties
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let container_config = Config {
            image: Some(image),
            cmd: Some(self.config.keepalive_command.clone()),
            env: if spec.env.is_empty() {
                None
            } else {
                Some(spec.env.clone())
            },
            labels: Some(labels),
            host_config: Some(host_config),
            user: spec.properties.get("user").cloned(),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.handle.clone(),
            ..Default::default()
        };

        let docker = self.docker().await?;
        docker
            .create_container(Some(options), container_config)
            .await
            .map_err(|e| match map_docker_error(&spec.handle, e) {
                RuntimeError::Docker { reason } => RuntimeError::CreateFailed {
                    handle: spec.handle.clone(),
                    reason,
                },
                other => other,
            })?;

        if let Err(e) = docker.start_container::<String>(&spec.handle, None).await {
            if let Err(cleanup) = docker
                .remove_container(
                    &spec.handle,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await
            {
                tracing::warn!(
                    handle = %spec.handle,
                    error = %cleanup,
                    "Failed to remove container that did not start"
                );
            }
            return Err(RuntimeError::CreateFailed {
                handle: spec.handle.clone(),
                reason: format!("failed to start container: {e}"),
            });
        }

        tracing::debug!(handle = %spec.handle, "Started docker container");

        Ok(RuntimeContainer {
            handle: spec.handle,
            properties: spec.properties,
        })
    }

    async fn destroy(&self, handle: &str) -> Result<(), RuntimeError> {
        let docker = self.docker().await?;
        match docker
            .remove_container(
                handle,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(e) => match map_docker_error(handle, e) {
                RuntimeError::NotFound { .. } => Ok(()),
                other => Err(other),
            },
        }
    }
}

fn map_docker_error(handle: &str, err: bollard::errors::Error) -> RuntimeError {
    match err {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        } => RuntimeError::NotFound {
            handle: handle.to_string(),
        },
        bollard::errors::Error::DockerResponseServerError {
            status_code: 409, ..
        } => RuntimeError::AlreadyExists {
            handle: handle.to_string(),
        },
        other => RuntimeError::Docker {
            reason: other.to_string(),
        },
    }
}

/// Turn a rootfs URL into a Docker image reference.
///
/// `docker:///repo#tag` becomes `repo:tag`; `docker://registry/repo` keeps
/// the registry host. Strings without a scheme are taken as references
/// already.
fn image_reference(rootfs_url: &str) -> Result<String, String> {
    if !rootfs_url.contains("://") {
        return Ok(rootfs_url.to_string());
    }
    let url = Url::parse(rootfs_url)
        .map_err(|e| format!("invalid rootfs url '{rootfs_url}': {e}"))?;

    if url.scheme() != "docker" {
        return Err(format!(
            "unsupported rootfs scheme '{}' (only docker:// images can be run)",
            url.scheme()
        ));
    }

    let repo = url.path().trim_start_matches('/');
    if repo.is_empty() {
        return Err(format!("rootfs url '{rootfs_url}' names no repository"));
    }

    let mut reference = match url.host_str() {
        Some(host) if !host.is_empty() => match url.port() {
            Some(port) => format!("{host}:{port}/{repo}"),
            None => format!("{host}/{repo}"),
        },
        _ => repo.to_string(),
    };
    if let Some(tag) = url.fragment().filter(|t| !t.is_empty()) {
        reference.push(':');
        reference.push_str(tag);
    }
    Ok(reference)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn docker_url_with_tag() {
        assert_eq!(
            image_reference("docker:///ci/git-resource#1.14").unwrap(),
            "ci/git-resource:1.14"
        );
    }

    #[test]
    fn docker_url_without_tag() {
        assert_eq!(image_reference("docker:///busybox").unwrap(), "busybox");
    }

    #[test]
    fn docker_url_with_registry() {
        assert_eq!(
            image_reference("docker://registry.local:5000/team/app#v2").unwrap(),
            "registry.local:5000/team/app:v2"
        );
    }

    #[test]
    fn bare_reference_passes_through() {
        assert_eq!(image_reference("alpine").unwrap(), "alpine");
        assert_eq!(image_reference("alpine:3.20").unwrap(), "alpine:3.20");
    }

    #[test]
    fn raw_rootfs_is_rejected() {
        let err = image_reference("raw:///var/lib/resource-types/git/rootfs").unwrap_err();
        assert!(err.contains("raw"), "{err}");
    }

    #[test]
    fn not_found_and_conflict_are_mapped() {
        let err = map_docker_error(
            "h",
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                message: "No such container".to_string(),
            },
        );
        assert!(err.is_not_found());

        let err = map_docker_error(
            "h",
            bollard::errors::Error::DockerResponseServerError {
                status_code: 409,
                message: "Conflict".to_string(),
            },
        );
        assert!(matches!(err, RuntimeError::AlreadyExists { .. }));
    }
}
