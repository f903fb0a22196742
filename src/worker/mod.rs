//! Workers: fleet nodes that run containers.
//!
//! [`WorkerInfo`] is what a worker advertises about itself. [`Worker`] binds
//! that to the services needed to provision containers on it, and retries
//! find-or-create while another caller is busy creating the same container.

pub mod compat;
pub mod container;
pub mod mounts;
pub mod provider;
pub mod spec;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

pub use self::container::WorkerContainer;
pub use self::provider::{ContainerProvider, Provision};
pub use self::spec::{
    BindMountSource, CertsBindMount, ContainerLimits, ContainerSpec, InputSource, OutputPaths,
    VersionedResourceType, VersionedResourceTypes, WorkerSpec,
};

use crate::config::{Config, ProvisionerConfig};
use crate::db::{ContainerMetadata, ContainerOwner, Database, VolumeStore};
use crate::error::{DatabaseError, ProvisionError, VolumeError, WorkerSelectionError};
use crate::image::ImageFactory;
use crate::lock::{FileLockFactory, LockFactory};
use crate::observability::{Observer, create_observer};
use crate::runtime::{ContainerRuntime, DockerRuntime};
use crate::volume::{LocalVolumeClient, Volume, VolumeClient};

/// A resource type a worker provides out of the box.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerResourceType {
    #[serde(rename = "type")]
    pub type_: String,
    /// Path of the type's root filesystem on the worker.
    pub image: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub privileged: bool,
}

/// What a worker advertises about itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub name: String,
    pub platform: String,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Owning team. 0 means the worker is shared by all teams.
    #[serde(default)]
    pub team_id: i32,
    #[serde(default)]
    pub resource_types: Vec<WorkerResourceType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Unix seconds.
    #[serde(default)]
    pub start_time: i64,
    #[serde(default)]
    pub ephemeral: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_proxy_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub https_proxy_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no_proxy: Option<String>,
    #[serde(default)]
    pub active_containers: u32,
    #[serde(default)]
    pub active_volumes: u32,
}

impl WorkerInfo {
    /// The worker itself if it satisfies `spec`, otherwise the first rule it
    /// breaks.
    pub fn satisfying(
        &self,
        spec: &WorkerSpec,
        resource_types: &VersionedResourceTypes,
    ) -> Result<&Self, WorkerSelectionError> {
        compat::check(self, spec, resource_types).map(|()| self)
    }

    pub fn is_version_compatible(&self, required: &Version) -> bool {
        compat::is_version_compatible(self.version.as_deref(), required)
    }

    /// e.g. `platform 'linux', tag 'gpu'`.
    pub fn description(&self) -> String {
        std::iter::once(format!("platform '{}'", self.platform))
            .chain(self.tags.iter().map(|tag| format!("tag '{tag}'")))
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn is_owned_by_team(&self) -> bool {
        self.team_id != 0
    }

    /// Time since the worker started, as of `now`. Zero if the start time
    /// lies in the future.
    pub fn uptime_at(&self, now: DateTime<Utc>) -> Duration {
        let started = DateTime::from_timestamp(self.start_time, 0).unwrap_or(now);
        (now - started).to_std().unwrap_or_default()
    }

    pub fn uptime(&self) -> Duration {
        self.uptime_at(Utc::now())
    }

    /// The native resource type whose rootfs lives at `path`.
    pub fn find_resource_type_by_path(&self, path: &str) -> Option<&WorkerResourceType> {
        self.resource_types.iter().find(|rt| rt.image == path)
    }
}

impl AsRef<WorkerInfo> for WorkerInfo {
    fn as_ref(&self) -> &WorkerInfo {
        self
    }
}

/// The collaborators a worker provisions containers with.
#[derive(Clone)]
pub struct WorkerServices {
    pub db: Arc<dyn Database>,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub volumes: Arc<dyn VolumeClient>,
    pub locks: Arc<dyn LockFactory>,
    pub images: Arc<dyn ImageFactory>,
    pub observer: Arc<dyn Observer>,
}

impl WorkerServices {
    /// Wire the configured local adapters for the worker named
    /// `worker_name`: on-disk volumes, lock files, the Docker runtime and the
    /// configured observer backend.
    pub fn from_config(
        config: &Config,
        worker_name: &str,
        db: Arc<dyn Database>,
        images: Arc<dyn ImageFactory>,
    ) -> Self {
        let store: Arc<dyn VolumeStore> = db.clone();
        let mut volumes =
            LocalVolumeClient::new(worker_name, config.volumes.base_dir.clone(), store);
        if let Some(certs_dir) = &config.volumes.certs_dir {
            volumes = volumes.with_certs_dir(certs_dir.clone());
        }

        Self {
            db,
            runtime: Arc::new(DockerRuntime::new(config.docker.clone())),
            volumes: Arc::new(volumes),
            locks: Arc::new(FileLockFactory::new(config.locks.lock_dir.clone())),
            images,
            observer: create_observer(&config.observability),
        }
    }
}

/// A worker with everything needed to provision containers on it.
#[derive(Clone)]
pub struct Worker {
    info: Arc<WorkerInfo>,
    services: WorkerServices,
    provider: ContainerProvider,
    config: ProvisionerConfig,
}

impl Worker {
    pub fn new(info: WorkerInfo, services: WorkerServices, config: ProvisionerConfig) -> Self {
        let info = Arc::new(info);
        let provider = ContainerProvider::new(Arc::clone(&info), services.clone());
        Self {
            info,
            services,
            provider,
            config,
        }
    }

    pub fn info(&self) -> &WorkerInfo {
        &self.info
    }

    pub fn provider(&self) -> &ContainerProvider {
        &self.provider
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn description(&self) -> String {
        self.info.description()
    }

    pub fn is_owned_by_team(&self) -> bool {
        self.info.is_owned_by_team()
    }

    pub fn uptime(&self) -> Duration {
        self.info.uptime()
    }

    pub fn ephemeral(&self) -> bool {
        self.info.ephemeral
    }

    pub fn tags(&self) -> &[String] {
        &self.info.tags
    }

    pub fn resource_types(&self) -> &[WorkerResourceType] {
        &self.info.resource_types
    }

    pub fn active_containers(&self) -> u32 {
        self.info.active_containers
    }

    pub fn active_volumes(&self) -> u32 {
        self.info.active_volumes
    }

    /// Build step containers currently recorded on this worker.
    pub async fn build_containers(&self) -> Result<usize, DatabaseError> {
        self.services
            .db
            .count_build_containers(&self.info.name)
            .await
    }

    pub fn find_resource_type_by_path(&self, path: &str) -> Option<&WorkerResourceType> {
        self.info.find_resource_type_by_path(path)
    }

    /// This worker if it satisfies `spec`.
    pub fn satisfying(
        &self,
        spec: &WorkerSpec,
        resource_types: &VersionedResourceTypes,
    ) -> Result<&Self, WorkerSelectionError> {
        self.info.satisfying(spec, resource_types).map(|_| self)
    }

    pub fn is_version_compatible(&self, required: &Version) -> bool {
        self.info.is_version_compatible(required)
    }

    pub async fn find_volume_for_resource_cache(
        &self,
        cache_id: i64,
    ) -> Result<Option<Volume>, VolumeError> {
        self.services
            .volumes
            .find_volume_for_resource_cache(cache_id)
            .await
    }

    pub async fn find_volume_for_task_cache(
        &self,
        team_id: i32,
        job_id: i64,
        step_name: &str,
        path: &str,
    ) -> Result<Option<Volume>, VolumeError> {
        self.services
            .volumes
            .find_volume_for_task_cache(team_id, job_id, step_name, path)
            .await
    }

    pub async fn certs_volume(&self) -> Result<Option<Volume>, VolumeError> {
        self.services
            .volumes
            .find_or_create_volume_for_resource_certs()
            .await
    }

    pub async fn lookup_volume(&self, handle: &str) -> Result<Option<Volume>, VolumeError> {
        self.services.volumes.lookup_volume(handle).await
    }

    pub async fn find_container_by_handle(
        &self,
        cancel: &CancellationToken,
        team_id: i32,
        handle: &str,
    ) -> Result<Option<WorkerContainer>, ProvisionError> {
        self.provider
            .find_created_container_by_handle(cancel, handle, team_id)
            .await
    }

    /// Find or create the container for `owner`, polling while another
    /// caller holds the creating lock.
    ///
    /// Polls every `creating_retry_delay` for at most `max_create_attempts`
    /// attempts, then gives up with [`ProvisionError::RetriesExhausted`].
    pub async fn find_or_create_container(
        &self,
        cancel: &CancellationToken,
        owner: &ContainerOwner,
        metadata: &ContainerMetadata,
        spec: &ContainerSpec,
        resource_types: &VersionedResourceTypes,
    ) -> Result<WorkerContainer, ProvisionError> {
        let image =
            self.services
                .images
                .get_image(&self.info, &spec.image_spec, spec.team_id, resource_types)?;

        let attempts = self.config.max_create_attempts.max(1);
        for attempt in 1..=attempts {
            match self
                .provider
                .find_or_create_container(cancel, owner, metadata, spec, image.as_ref())
                .await?
            {
                Provision::Ready(container) => return Ok(container),
                Provision::Deferred if attempt < attempts => {
                    tracing::debug!(
                        worker = %self.info.name,
                        owner = %owner,
                        attempt,
                        "Container creation deferred, retrying"
                    );
                    cancellable(cancel, async {
                        tokio::time::sleep(self.config.creating_retry_delay).await;
                        Ok::<_, ProvisionError>(())
                    })
                    .await?;
                }
                Provision::Deferred => {}
            }
        }

        tracing::warn!(
            worker = %self.info.name,
            owner = %owner,
            attempts,
            "Gave up waiting for container to be created"
        );
        Err(ProvisionError::RetriesExhausted {
            owner: owner.clone(),
            attempts,
        })
    }
}

impl AsRef<WorkerInfo> for Worker {
    fn as_ref(&self) -> &WorkerInfo {
        &self.info
    }
}

/// The workers of a fleet that satisfy `spec`, in fleet order. Rejections
/// are logged at debug level.
pub fn select_workers<'a, W: AsRef<WorkerInfo>>(
    fleet: &'a [W],
    spec: &WorkerSpec,
    resource_types: &VersionedResourceTypes,
) -> Vec<&'a W> {
    fleet
        .iter()
        .filter(|worker| match worker.as_ref().satisfying(spec, resource_types) {
            Ok(_) => true,
            Err(reason) => {
                tracing::debug!(worker = %worker.as_ref().name, %reason, "Worker rejected");
                false
            }
        })
        .collect()
}

/// Run a collaborator call unless `cancel` fires first.
pub(crate) async fn cancellable<T, E, F>(
    cancel: &CancellationToken,
    fut: F,
) -> Result<T, ProvisionError>
where
    F: Future<Output = Result<T, E>>,
    E: Into<ProvisionError>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ProvisionError::Cancelled),
        result = fut => result.map_err(Into::into),
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn info() -> WorkerInfo {
        WorkerInfo {
            name: "w1".to_string(),
            platform: "linux".to_string(),
            tags: vec!["gpu".to_string(), "fast".to_string()],
            team_id: 0,
            resource_types: vec![WorkerResourceType {
                type_: "git".to_string(),
                image: "/rt/git".to_string(),
                version: "1.0".to_string(),
                privileged: false,
            }],
            version: Some("2.4.1".to_string()),
            start_time: 1_700_000_000,
            ..WorkerInfo::default()
        }
    }

    #[test]
    fn description_lists_platform_and_tags() {
        assert_eq!(
            info().description(),
            "platform 'linux', tag 'gpu', tag 'fast'"
        );

        let untagged = WorkerInfo {
            tags: vec![],
            ..info()
        };
        assert_eq!(untagged.description(), "platform 'linux'");
    }

    #[test]
    fn team_ownership() {
        assert!(!info().is_owned_by_team());
        assert!(
            WorkerInfo {
                team_id: 3,
                ..info()
            }
            .is_owned_by_team()
        );
    }

    #[test]
    fn uptime_counts_from_start_time() {
        let now = Utc.timestamp_opt(1_700_000_090, 0).unwrap();
        assert_eq!(info().uptime_at(now), Duration::from_secs(90));

        let before_start = Utc.timestamp_opt(1_600_000_000, 0).unwrap();
        assert_eq!(info().uptime_at(before_start), Duration::ZERO);
    }

    #[test]
    fn resource_type_by_path() {
        assert_eq!(
            info().find_resource_type_by_path("/rt/git").map(|rt| rt.type_.as_str()),
            Some("git")
        );
        assert!(info().find_resource_type_by_path("/rt/s3").is_none());
    }

    #[test]
    fn select_keeps_fleet_order() {
        let fleet = vec![
            WorkerInfo {
                name: "a".to_string(),
                ..info()
            },
            WorkerInfo {
                name: "b".to_string(),
                platform: "windows".to_string(),
                ..info()
            },
            WorkerInfo {
                name: "c".to_string(),
                ..info()
            },
        ];
        let spec = WorkerSpec {
            platform: Some("linux".to_string()),
            ..WorkerSpec::default()
        };

        let names: Vec<&str> = select_workers(&fleet, &spec, &VersionedResourceTypes::default())
            .into_iter()
            .map(|w| w.name.as_str())
            .collect();
        assert_eq!(names, vec!["a", "c"]);
    }

    #[test]
    fn version_check_delegates_to_policy() {
        assert!(info().is_version_compatible(&Version::new(2, 4, 0)));
        assert!(!info().is_version_compatible(&Version::new(3, 0, 0)));
    }

    #[test]
    fn worker_info_reads_fleet_json() {
        let json = r#"{
            "name": "w9",
            "platform": "linux",
            "resource_types": [{"type": "git", "image": "/rt/git"}],
            "version": "2.1"
        }"#;
        let parsed: WorkerInfo = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.resource_types[0].type_, "git");
        assert_eq!(parsed.team_id, 0);
        assert!(parsed.tags.is_empty());
    }

    #[tokio::test]
    async fn services_from_config_use_configured_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let certs = dir.path().join("certs");
        std::fs::create_dir_all(&certs).unwrap();
        std::fs::write(certs.join("ca.pem"), "cert").unwrap();

        let mut config = Config::default();
        config.volumes.base_dir = dir.path().join("volumes");
        config.volumes.certs_dir = Some(certs);
        config.locks.lock_dir = dir.path().join("locks");
        config.observability.backend = "log".to_string();

        let services = WorkerServices::from_config(
            &config,
            "w1",
            Arc::new(crate::db::InMemoryDatabase::new()),
            Arc::new(crate::image::WorkerImageFactory::new()),
        );
        assert_eq!(services.observer.name(), "log");

        let certs_volume = services
            .volumes
            .find_or_create_volume_for_resource_certs()
            .await
            .unwrap()
            .unwrap();
        assert!(certs_volume.path.starts_with(dir.path().join("volumes")));
        assert!(certs_volume.path.join("ca.pem").exists());

        let lock = services
            .locks
            .acquire(&crate::lock::LockId::ContainerCreating(1))
            .await
            .unwrap();
        assert!(lock.is_some());
        assert!(dir.path().join("locks/container-creating-1.lock").exists());
    }

    #[tokio::test]
    async fn cancellable_prefers_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = cancellable(&cancel, async { Ok::<_, ProvisionError>(1) }).await;
        assert!(matches!(result, Err(ProvisionError::Cancelled)));

        let live = CancellationToken::new();
        let result = cancellable(&live, async { Ok::<_, ProvisionError>(2) }).await;
        assert_eq!(result.unwrap(), 2);
    }
}
