//! End-to-end provisioning against the in-memory record store and runtime,
//! with real volumes on disk and file-backed creating locks.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tempfile::{TempDir, tempdir};
use tokio_util::sync::CancellationToken;

use berth::config::ProvisionerConfig;
use berth::db::{ContainerMetadata, ContainerOwner, ContainerState, InMemoryDatabase};
use berth::image::{ImageSpec, WorkerImageFactory};
use berth::lock::FileLockFactory;
use berth::observability::NoopObserver;
use berth::runtime::{BindMountMode, InMemoryRuntime};
use berth::volume::{LocalVolumeClient, VolumeArtifactSource, VolumeStrategy};
use berth::worker::{
    CertsBindMount, ContainerSpec, InputSource, VersionedResourceTypes, Worker, WorkerInfo,
    WorkerServices,
};

struct Cluster {
    dir: TempDir,
    db: Arc<InMemoryDatabase>,
    runtime: Arc<InMemoryRuntime>,
}

impl Cluster {
    fn new() -> Self {
        Self {
            dir: tempdir().unwrap(),
            db: Arc::new(InMemoryDatabase::new()),
            runtime: Arc::new(InMemoryRuntime::new()),
        }
    }

    /// A worker handle as a separate process would build it: its own lock
    /// factory and volume client over the shared state.
    fn worker(&self) -> Worker {
        let certs = self.dir.path().join("certs");
        std::fs::create_dir_all(&certs).unwrap();
        std::fs::write(certs.join("ca.pem"), "-----BEGIN CERTIFICATE-----").unwrap();

        let volumes = LocalVolumeClient::new(
            "worker-1",
            self.dir.path().join("volumes"),
            self.db.clone(),
        )
        .with_certs_dir(certs);

        let services = WorkerServices {
            db: self.db.clone(),
            runtime: self.runtime.clone(),
            volumes: Arc::new(volumes),
            locks: Arc::new(FileLockFactory::new(self.dir.path().join("locks"))),
            images: Arc::new(WorkerImageFactory::new()),
            observer: Arc::new(NoopObserver),
        };
        let info = WorkerInfo {
            name: "worker-1".to_string(),
            platform: "linux".to_string(),
            ..WorkerInfo::default()
        };
        Worker::new(
            info,
            services,
            ProvisionerConfig {
                creating_retry_delay: Duration::from_millis(10),
                max_create_attempts: 500,
            },
        )
    }
}

fn build_step(plan_id: &str) -> ContainerOwner {
    ContainerOwner::BuildStep {
        build_id: 7,
        plan_id: plan_id.to_string(),
        team_id: 1,
    }
}

fn task_spec() -> ContainerSpec {
    ContainerSpec {
        image_spec: ImageSpec {
            image_url: Some("docker:///alpine#3.20".to_string()),
            ..ImageSpec::default()
        },
        team_id: 1,
        dir: Some("/tmp/build/7".to_string()),
        ..ContainerSpec::default()
    }
}

#[tokio::test]
async fn concurrent_workers_converge_on_one_container() {
    let cluster = Cluster::new();
    let owner = build_step("compile");

    let mut tasks = Vec::new();
    for _ in 0..5 {
        let worker = cluster.worker();
        let owner = owner.clone();
        tasks.push(tokio::spawn(async move {
            worker
                .find_or_create_container(
                    &CancellationToken::new(),
                    &owner,
                    &ContainerMetadata::default(),
                    &task_spec(),
                    &VersionedResourceTypes::new(),
                )
                .await
        }));
    }

    let mut handles = Vec::new();
    for task in tasks {
        handles.push(task.await.unwrap().unwrap().handle().to_string());
    }
    handles.dedup();

    assert_eq!(handles.len(), 1);
    assert_eq!(cluster.runtime.len().await, 1);

    let records = cluster.db.containers().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].state, ContainerState::Created);
}

#[tokio::test]
async fn outputs_feed_the_next_step_copy_on_write() {
    let cluster = Cluster::new();
    let worker = cluster.worker();
    let cancel = CancellationToken::new();

    let build = ContainerSpec {
        outputs: [("binary".to_string(), "out".to_string())].into(),
        ..task_spec()
    };
    let builder = worker
        .find_or_create_container(
            &cancel,
            &build_step("build"),
            &ContainerMetadata::default(),
            &build,
            &VersionedResourceTypes::new(),
        )
        .await
        .unwrap();
    let output = builder
        .volume_at(Path::new("/tmp/build/7/out"))
        .cloned()
        .unwrap();
    std::fs::write(output.path.join("app"), "v1").unwrap();

    let test = ContainerSpec {
        inputs: vec![InputSource::new(
            Arc::new(VolumeArtifactSource::new(output.clone())),
            "bin",
        )],
        ..task_spec()
    };
    let tester = worker
        .find_or_create_container(
            &cancel,
            &build_step("test"),
            &ContainerMetadata::default(),
            &test,
            &VersionedResourceTypes::new(),
        )
        .await
        .unwrap();

    let input = tester.volume_at(Path::new("/tmp/build/7/bin")).unwrap();
    assert_eq!(
        input.strategy,
        VolumeStrategy::CopyOnWrite {
            parent: output.handle.clone()
        }
    );
    assert_eq!(
        std::fs::read_to_string(input.path.join("app")).unwrap(),
        "v1"
    );

    std::fs::write(input.path.join("app"), "patched").unwrap();
    assert_eq!(
        std::fs::read_to_string(output.path.join("app")).unwrap(),
        "v1"
    );
}

#[tokio::test]
async fn certs_are_mounted_read_only_before_volumes() {
    let cluster = Cluster::new();
    let worker = cluster.worker();

    let spec = ContainerSpec {
        bind_mounts: vec![Arc::new(CertsBindMount)],
        ..task_spec()
    };
    let container = worker
        .find_or_create_container(
            &CancellationToken::new(),
            &build_step("certs"),
            &ContainerMetadata::default(),
            &spec,
            &VersionedResourceTypes::new(),
        )
        .await
        .unwrap();

    let created = cluster.runtime.spec(container.handle()).await.unwrap();
    let first = &created.bind_mounts[0];
    assert_eq!(first.dst_path, Path::new("/etc/ssl/certs"));
    assert_eq!(first.mode, BindMountMode::ReadOnly);
    assert!(first.src_path.join("ca.pem").exists());
    assert!(
        created.bind_mounts[1..]
            .iter()
            .all(|m| m.mode == BindMountMode::ReadWrite)
    );
}

#[tokio::test]
async fn containers_are_found_by_handle_per_team() {
    let cluster = Cluster::new();
    let worker = cluster.worker();
    let cancel = CancellationToken::new();

    let container = worker
        .find_or_create_container(
            &cancel,
            &build_step("lookup"),
            &ContainerMetadata::default(),
            &task_spec(),
            &VersionedResourceTypes::new(),
        )
        .await
        .unwrap();

    let found = worker
        .find_container_by_handle(&cancel, 1, container.handle())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.record().id, container.record().id);

    assert!(
        worker
            .find_container_by_handle(&cancel, 2, container.handle())
            .await
            .unwrap()
            .is_none()
    );
}
