//! Volume client that keeps volumes as directories on the local host.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::db::{ContainerRecord, VolumeStore};
use crate::error::VolumeError;
use crate::volume::artifact::{tar_directory, unpack_into};
use crate::volume::{ArtifactStream, Volume, VolumeBinding, VolumeClient, VolumeStrategy};

/// Volume client for a single worker whose volumes live under `base_dir`.
///
/// Each volume is `base_dir/<handle>`. Copy-on-write children are realised
/// as full recursive copies of the parent directory.
pub struct LocalVolumeClient {
    worker_name: String,
    base_dir: PathBuf,
    store: Arc<dyn VolumeStore>,
    certs_dir: Option<PathBuf>,
}

impl LocalVolumeClient {
    pub fn new(
        worker_name: impl Into<String>,
        base_dir: impl Into<PathBuf>,
        store: Arc<dyn VolumeStore>,
    ) -> Self {
        Self {
            worker_name: worker_name.into(),
            base_dir: base_dir.into(),
            store,
            certs_dir: None,
        }
    }

    /// Offer the contents of `dir` as the worker's certificate volume.
    pub fn with_certs_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.certs_dir = Some(dir.into());
        self
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    async fn create_volume(
        &self,
        team_id: i32,
        privileged: bool,
        strategy: VolumeStrategy,
        binding: VolumeBinding,
        seed: Option<&Path>,
    ) -> Result<Volume, VolumeError> {
        let handle = Uuid::new_v4().to_string();
        let path = self.base_dir.join(&handle);
        let mount_path = match &binding {
            VolumeBinding::Container { mount_path, .. } => mount_path.clone(),
            _ => path.clone(),
        };

        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|e| VolumeError::CreateFailed {
                mount_path: mount_path.clone(),
                reason: e.to_string(),
            })?;

        if let Some(seed) = seed {
            if let Err(e) = copy_dir_all(seed, &path).await {
                let _ = tokio::fs::remove_dir_all(&path).await;
                return Err(VolumeError::CreateFailed {
                    mount_path,
                    reason: format!("failed to copy {}: {e}", seed.display()),
                });
            }
        }

        let volume = Volume {
            handle,
            path,
            worker_name: self.worker_name.clone(),
            team_id,
            privileged,
            strategy,
            binding,
        };

        let stored = match self.store.insert_volume(volume.clone()).await {
            Ok(stored) => stored,
            Err(e) => {
                let _ = tokio::fs::remove_dir_all(&volume.path).await;
                return Err(e.into());
            }
        };

        if stored.handle != volume.handle {
            // Lost a race with a concurrent creator of the same binding.
            tracing::debug!(
                worker = %self.worker_name,
                handle = %stored.handle,
                "Volume already registered, discarding duplicate"
            );
            let _ = tokio::fs::remove_dir_all(&volume.path).await;
        } else {
            tracing::debug!(
                worker = %self.worker_name,
                handle = %stored.handle,
                path = %stored.path.display(),
                "Created volume"
            );
        }

        Ok(stored)
    }
}

#[async_trait]
impl VolumeClient for LocalVolumeClient {
    async fn find_or_create_volume_for_container(
        &self,
        container: &ContainerRecord,
        mount_path: &Path,
        privileged: bool,
    ) -> Result<Volume, VolumeError> {
        if let Some(existing) = self
            .store
            .find_container_volume(&container.handle, mount_path)
            .await?
        {
            return Ok(existing);
        }

        self.create_volume(
            container.team_id,
            privileged,
            VolumeStrategy::Empty,
            VolumeBinding::Container {
                handle: container.handle.clone(),
                mount_path: mount_path.to_path_buf(),
            },
            None,
        )
        .await
    }

    async fn find_or_create_cow_volume_for_container(
        &self,
        container: &ContainerRecord,
        parent: &Volume,
        mount_path: &Path,
        privileged: bool,
    ) -> Result<Volume, VolumeError> {
        if let Some(existing) = self
            .store
            .find_container_volume(&container.handle, mount_path)
            .await?
        {
            return Ok(existing);
        }

        if parent.worker_name != self.worker_name {
            return Err(VolumeError::CreateFailed {
                mount_path: mount_path.to_path_buf(),
                reason: format!(
                    "parent volume {} lives on {}, not {}",
                    parent.handle, parent.worker_name, self.worker_name
                ),
            });
        }

        self.create_volume(
            container.team_id,
            privileged,
            VolumeStrategy::CopyOnWrite {
                parent: parent.handle.clone(),
            },
            VolumeBinding::Container {
                handle: container.handle.clone(),
                mount_path: mount_path.to_path_buf(),
            },
            Some(&parent.path),
        )
        .await
    }

    async fn stream_into(
        &self,
        volume: &Volume,
        stream: ArtifactStream,
    ) -> Result<(), VolumeError> {
        unpack_into(stream, &volume.path, &volume.handle).await
    }

    async fn stream_out(&self, volume: &Volume) -> Result<ArtifactStream, VolumeError> {
        tar_directory(&volume.path).map_err(|_| VolumeError::NotFound {
            handle: volume.handle.clone(),
        })
    }

    async fn lookup_volume(&self, handle: &str) -> Result<Option<Volume>, VolumeError> {
        Ok(self
            .store
            .find_volume(handle)
            .await?
            .filter(|v| v.worker_name == self.worker_name))
    }

    async fn find_volume_for_resource_cache(
        &self,
        cache_id: i64,
    ) -> Result<Option<Volume>, VolumeError> {
        Ok(self
            .store
            .find_resource_cache_volume(&self.worker_name, cache_id)
            .await?)
    }

    async fn find_volume_for_task_cache(
        &self,
        team_id: i32,
        job_id: i64,
        step_name: &str,
        path: &str,
    ) -> Result<Option<Volume>, VolumeError> {
        Ok(self
            .store
            .find_task_cache_volume(&self.worker_name, team_id, job_id, step_name, path)
            .await?)
    }

    async fn find_or_create_volume_for_resource_certs(
        &self,
    ) -> Result<Option<Volume>, VolumeError> {
        if let Some(existing) = self.store.find_certs_volume(&self.worker_name).await? {
            return Ok(Some(existing));
        }

        let Some(certs_dir) = &self.certs_dir else {
            return Ok(None);
        };

        let volume = self
            .create_volume(
                0,
                false,
                VolumeStrategy::Empty,
                VolumeBinding::ResourceCerts,
                Some(certs_dir),
            )
            .await?;
        Ok(Some(volume))
    }
}

/// Recursively copy `src` into the existing directory `dst`.
async fn copy_dir_all(src: &Path, dst: &Path) -> std::io::Result<()> {
    let mut pending = vec![(src.to_path_buf(), dst.to_path_buf())];

    while let Some((from, to)) = pending.pop() {
        tokio::fs::create_dir_all(&to).await?;
        let mut entries = tokio::fs::read_dir(&from).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            let target = to.join(entry.file_name());
            if file_type.is_dir() {
                pending.push((entry.path(), target));
            } else if file_type.is_symlink() {
                let link = tokio::fs::read_link(entry.path()).await?;
                #[cfg(unix)]
                tokio::fs::symlink(&link, &target).await?;
                #[cfg(not(unix))]
                tracing::warn!(link = %link.display(), "Skipping symlink on this platform");
            } else {
                tokio::fs::copy(entry.path(), &target).await?;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use tempfile::tempdir;

    use super::*;
    use crate::db::{ContainerMetadata, ContainerOwner, ContainerState, InMemoryDatabase};

    fn record(handle: &str) -> ContainerRecord {
        ContainerRecord {
            id: 1,
            handle: handle.to_string(),
            worker_name: "w1".to_string(),
            owner: ContainerOwner::ResourceCheck {
                resource_config_id: 1,
                team_id: 1,
            },
            metadata: ContainerMetadata::default(),
            team_id: 1,
            state: ContainerState::Creating,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn creates_empty_volume_once_per_mount() {
        let dir = tempdir().unwrap();
        let db = Arc::new(InMemoryDatabase::new());
        let client = LocalVolumeClient::new("w1", dir.path(), db.clone());
        let container = record("c1");

        let first = client
            .find_or_create_volume_for_container(&container, Path::new("/scratch"), false)
            .await
            .unwrap();
        let again = client
            .find_or_create_volume_for_container(&container, Path::new("/scratch"), false)
            .await
            .unwrap();

        assert_eq!(first.handle, again.handle);
        assert!(first.path.is_dir());
        assert_eq!(first.strategy, VolumeStrategy::Empty);
        assert_eq!(db.volumes().await.len(), 1);
    }

    #[tokio::test]
    async fn cow_volume_copies_parent_contents() {
        let dir = tempdir().unwrap();
        let db = Arc::new(InMemoryDatabase::new());
        let client = LocalVolumeClient::new("w1", dir.path(), db);

        let parent = client
            .find_or_create_volume_for_container(&record("c0"), Path::new("/out"), false)
            .await
            .unwrap();
        std::fs::create_dir_all(parent.path.join("sub")).unwrap();
        std::fs::write(parent.path.join("sub/file"), "data").unwrap();

        let child = client
            .find_or_create_cow_volume_for_container(
                &record("c1"),
                &parent,
                Path::new("/in"),
                false,
            )
            .await
            .unwrap();

        assert_eq!(
            child.strategy,
            VolumeStrategy::CopyOnWrite {
                parent: parent.handle.clone()
            }
        );
        assert_eq!(
            std::fs::read_to_string(child.path.join("sub/file")).unwrap(),
            "data"
        );

        // Writes to the child do not leak into the parent.
        std::fs::write(child.path.join("sub/file"), "changed").unwrap();
        assert_eq!(
            std::fs::read_to_string(parent.path.join("sub/file")).unwrap(),
            "data"
        );
    }

    #[tokio::test]
    async fn cow_rejects_parent_from_another_worker() {
        let dir = tempdir().unwrap();
        let db = Arc::new(InMemoryDatabase::new());
        let other = LocalVolumeClient::new("w2", dir.path().join("w2"), db.clone());
        let client = LocalVolumeClient::new("w1", dir.path().join("w1"), db);

        let parent = other
            .find_or_create_volume_for_container(&record("c0"), Path::new("/out"), false)
            .await
            .unwrap();
        let result = client
            .find_or_create_cow_volume_for_container(&record("c1"), &parent, Path::new("/in"), false)
            .await;
        assert!(matches!(result, Err(VolumeError::CreateFailed { .. })));
    }

    #[tokio::test]
    async fn stream_out_then_in_copies_contents() {
        let dir = tempdir().unwrap();
        let db = Arc::new(InMemoryDatabase::new());
        let client = LocalVolumeClient::new("w1", dir.path(), db);

        let src = client
            .find_or_create_volume_for_container(&record("c0"), Path::new("/a"), false)
            .await
            .unwrap();
        std::fs::write(src.path.join("hello.txt"), "hi").unwrap();
        let dst = client
            .find_or_create_volume_for_container(&record("c1"), Path::new("/b"), false)
            .await
            .unwrap();

        let stream = client.stream_out(&src).await.unwrap();
        client.stream_into(&dst, stream).await.unwrap();

        assert_eq!(
            std::fs::read_to_string(dst.path.join("hello.txt")).unwrap(),
            "hi"
        );
    }

    #[tokio::test]
    async fn lookup_is_scoped_to_worker() {
        let dir = tempdir().unwrap();
        let db = Arc::new(InMemoryDatabase::new());
        let w1 = LocalVolumeClient::new("w1", dir.path().join("w1"), db.clone());
        let w2 = LocalVolumeClient::new("w2", dir.path().join("w2"), db);

        let volume = w1
            .find_or_create_volume_for_container(&record("c0"), Path::new("/a"), false)
            .await
            .unwrap();

        assert!(w1.lookup_volume(&volume.handle).await.unwrap().is_some());
        assert!(w2.lookup_volume(&volume.handle).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn certs_volume_requires_a_source() {
        let dir = tempdir().unwrap();
        let db = Arc::new(InMemoryDatabase::new());
        let bare = LocalVolumeClient::new("w1", dir.path().join("vols"), db.clone());
        assert!(
            bare.find_or_create_volume_for_resource_certs()
                .await
                .unwrap()
                .is_none()
        );

        let certs = dir.path().join("certs");
        std::fs::create_dir_all(&certs).unwrap();
        std::fs::write(certs.join("ca.pem"), "PEM").unwrap();
        let client =
            LocalVolumeClient::new("w1", dir.path().join("vols"), db).with_certs_dir(&certs);

        let first = client
            .find_or_create_volume_for_resource_certs()
            .await
            .unwrap()
            .unwrap();
        let second = client
            .find_or_create_volume_for_resource_certs()
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.handle, second.handle);
        assert_eq!(first.binding, VolumeBinding::ResourceCerts);
        assert!(first.path.join("ca.pem").is_file());
    }
}
