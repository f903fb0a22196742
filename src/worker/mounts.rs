//! Mount planning: which volumes a container gets and where.
//!
//! Every container gets an empty scratch volume at `/scratch`, an empty
//! working directory volume unless an input or output already lives there,
//! one volume per input (a copy-on-write child when the input is already on
//! this worker, otherwise a fresh volume the input is streamed into) and one
//! empty volume per output that does not coincide with an input.

use std::collections::HashSet;
use std::path::{Component, PathBuf};

use tokio_util::sync::CancellationToken;

use crate::db::ContainerRecord;
use crate::error::{ProvisionError, VolumeError};
use crate::runtime::{BindMount, BindMountMode};
use crate::volume::{Volume, VolumeClient};
use crate::worker::cancellable;
use crate::worker::spec::ContainerSpec;

pub const SCRATCH_MOUNT_PATH: &str = "/scratch";

/// A volume and where it is mounted.
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeMount {
    pub volume: Volume,
    pub mount_path: PathBuf,
}

/// The result of planning a container's mounts.
#[derive(Debug, Clone, Default)]
pub struct MountPlan {
    /// Scratch, then working directory, then inputs and outputs ordered by
    /// mount path.
    pub volume_mounts: Vec<VolumeMount>,
    /// Extra bind mounts followed by one read-write mount per volume mount.
    pub bind_mounts: Vec<BindMount>,
}

/// Lexically normalize a container path. Relative paths are taken relative
/// to `workdir`, or to `/` when there is none. Never touches the
/// filesystem.
pub fn clean_path(path: &str, workdir: Option<&str>) -> PathBuf {
    let joined = if path.starts_with('/') {
        PathBuf::from(path)
    } else {
        let base = match workdir {
            Some(dir) => clean_path(dir, None),
            None => PathBuf::from("/"),
        };
        base.join(path)
    };

    let mut cleaned = PathBuf::from("/");
    for component in joined.components() {
        match component {
            Component::Normal(part) => cleaned.push(part),
            Component::ParentDir => {
                cleaned.pop();
            }
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
        }
    }
    cleaned
}

/// Allocate the volumes for a container and translate them into bind
/// mounts.
///
/// Any failure aborts the whole plan; volumes already allocated stay
/// registered against the container record and are found again on retry.
pub async fn plan_mounts(
    cancel: &CancellationToken,
    container: &ContainerRecord,
    spec: &ContainerSpec,
    privileged: bool,
    worker_name: &str,
    volumes: &dyn VolumeClient,
) -> Result<MountPlan, ProvisionError> {
    let workdir = spec.dir.as_deref().filter(|d| !d.is_empty());
    let mut volume_mounts = Vec::new();

    let scratch_path = PathBuf::from(SCRATCH_MOUNT_PATH);
    let scratch = cancellable(
        cancel,
        volumes.find_or_create_volume_for_container(container, &scratch_path, privileged),
    )
    .await?;
    volume_mounts.push(VolumeMount {
        volume: scratch,
        mount_path: scratch_path.clone(),
    });

    if let Some(dir) = workdir {
        let dir_path = clean_path(dir, None);
        let claimed = spec
            .inputs
            .iter()
            .map(|i| clean_path(&i.destination, workdir))
            .chain(spec.outputs.values().map(|o| clean_path(o, workdir)))
            .any(|p| p == dir_path);

        if !claimed && dir_path != scratch_path {
            let volume = cancellable(
                cancel,
                volumes.find_or_create_volume_for_container(container, &dir_path, privileged),
            )
            .await?;
            volume_mounts.push(VolumeMount {
                volume,
                mount_path: dir_path,
            });
        }
    }

    let mut claimed: HashSet<PathBuf> = volume_mounts
        .iter()
        .map(|m| m.mount_path.clone())
        .collect();
    let mut io_mounts = Vec::new();

    for input in &spec.inputs {
        let mount_path = clean_path(&input.destination, workdir);
        if !claimed.insert(mount_path.clone()) {
            return Err(VolumeError::CreateFailed {
                mount_path,
                reason: format!(
                    "mount path is already taken; cannot mount {}",
                    input.source.description()
                ),
            }
            .into());
        }

        let resident = cancellable(cancel, input.source.volume_on(worker_name, volumes)).await?;
        let volume = match resident {
            Some(parent) => {
                tracing::debug!(
                    handle = %container.handle,
                    parent = %parent.handle,
                    path = %mount_path.display(),
                    "Mounting copy-on-write input"
                );
                cancellable(
                    cancel,
                    volumes.find_or_create_cow_volume_for_container(
                        container,
                        &parent,
                        &mount_path,
                        privileged,
                    ),
                )
                .await?
            }
            None => {
                let volume = cancellable(
                    cancel,
                    volumes.find_or_create_volume_for_container(container, &mount_path, privileged),
                )
                .await?;
                tracing::debug!(
                    handle = %container.handle,
                    volume = %volume.handle,
                    source = %input.source.description(),
                    "Streaming input into volume"
                );
                let stream = cancellable(cancel, input.source.open_stream()).await?;
                cancellable(cancel, volumes.stream_into(&volume, stream)).await?;
                volume
            }
        };

        io_mounts.push(VolumeMount { volume, mount_path });
    }

    for output in spec.outputs.values() {
        let mount_path = clean_path(output, workdir);
        if !claimed.insert(mount_path.clone()) {
            continue;
        }

        let volume = cancellable(
            cancel,
            volumes.find_or_create_volume_for_container(container, &mount_path, privileged),
        )
        .await?;
        io_mounts.push(VolumeMount { volume, mount_path });
    }

    io_mounts.sort_by(|a, b| a.mount_path.cmp(&b.mount_path));
    volume_mounts.extend(io_mounts);

    let mut bind_mounts = Vec::new();
    for source in &spec.bind_mounts {
        if let Some(mount) = cancellable(cancel, source.bind_mount_on(worker_name, volumes)).await? {
            bind_mounts.push(mount);
        }
    }
    bind_mounts.extend(volume_mounts.iter().map(|m| BindMount {
        src_path: m.volume.path.clone(),
        dst_path: m.mount_path.clone(),
        mode: BindMountMode::ReadWrite,
    }));

    Ok(MountPlan {
        volume_mounts,
        bind_mounts,
    })
}
