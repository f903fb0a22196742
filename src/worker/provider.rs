//! Find-or-create for containers on one worker.
//!
//! A container goes through `no record -> creating (no runtime container)
//! -> creating (runtime container exists) -> created`, or ends up failed.
//! Records are the source of truth for intent, the runtime for existence;
//! an advisory lock per record keeps concurrent callers from creating the
//! same runtime container twice. A caller that loses the lock gets
//! [`Provision::Deferred`] and is expected to try again later.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::db::{ContainerMetadata, ContainerOwner, ContainerRecord};
use crate::error::ProvisionError;
use crate::image::{FetchedImage, Image};
use crate::lock::LockId;
use crate::observability::{ObserverEvent, ObserverMetric};
use crate::runtime::{RuntimeContainer, RuntimeSpec};
use crate::worker::container::{USER_PROPERTY, WorkerContainer};
use crate::worker::mounts::plan_mounts;
use crate::worker::spec::ContainerSpec;
use crate::worker::{WorkerInfo, WorkerServices, cancellable};


/// Outcome of one find-or-create attempt.
#[derive(Debug)]
pub enum Provision {
    /// The container exists and is recorded as created.
    Ready(WorkerContainer),
    /// Another caller is creating this container right now. Try again.
    Deferred,
}

impl Provision {
    pub fn is_deferred(&self) -> bool {
        matches!(self, Provision::Deferred)
    }

    pub fn into_container(self) -> Option<WorkerContainer> {
        match self {
            Provision::Ready(container) => Some(container),
            Provision::Deferred => None,
        }
    }
}

/// Provisions containers on a single worker.
#[derive(Clone)]
pub struct ContainerProvider {
    worker: Arc<WorkerInfo>,
    services: WorkerServices,
}

impl ContainerProvider {
    pub fn new(worker: Arc<WorkerInfo>, services: WorkerServices) -> Self {
        Self { worker, services }
    }

    pub fn worker_name(&self) -> &str {
        &self.worker.name
    }

    /// Run one find-or-create attempt for `owner`.
    ///
    /// Returns `Ready` once a created container exists, `Deferred` if another
    /// caller holds the creating lock, and an error for anything fatal. A
    /// created record whose runtime container has vanished is reported as
    /// [`ProvisionError::MissingRuntimeContainer`].
    pub async fn find_or_create_container(
        &self,
        cancel: &CancellationToken,
        owner: &ContainerOwner,
        metadata: &ContainerMetadata,
        spec: &ContainerSpec,
        image: &dyn Image,
    ) -> Result<Provision, ProvisionError> {
        let db = &self.services.db;
        let runtime = &self.services.runtime;
        let worker_name = self.worker.name.as_str();

        let existing = cancellable(cancel, db.find_container_on_worker(worker_name, owner))
            .await
            .inspect_err(|e| {
                tracing::error!(worker = worker_name, owner = %owner, error = %e, "Failed to find container in db");
            })?;

        if let Some(record) = existing.as_ref().filter(|r| r.is_created()) {
            tracing::debug!(worker = worker_name, handle = %record.handle, "Found created container in db");

            let runtime_container = match cancellable(cancel, runtime.lookup(&record.handle)).await
            {
                Ok(container) => container,
                Err(ProvisionError::Runtime(e)) if e.is_not_found() => {
                    tracing::error!(
                        worker = worker_name,
                        handle = %record.handle,
                        "Created container is missing from the runtime"
                    );
                    self.services.observer.record_event(&ObserverEvent::Error {
                        component: "provisioner".to_string(),
                        message: format!("container {} missing from runtime", record.handle),
                    });
                    return Err(ProvisionError::MissingRuntimeContainer {
                        handle: record.handle.clone(),
                    });
                }
                Err(e) => return Err(e),
            };

            return self
                .wrap(cancel, record.clone(), runtime_container)
                .await
                .map(Provision::Ready);
        }

        let record = match existing {
            Some(record) => {
                tracing::debug!(worker = worker_name, handle = %record.handle, "Found creating container in db");
                record
            }
            None => {
                tracing::debug!(worker = worker_name, owner = %owner, "Creating container in db");
                let record = cancellable(
                    cancel,
                    db.create_container(worker_name, owner, metadata, spec.team_id),
                )
                .await
                .inspect_err(|e| {
                    tracing::error!(worker = worker_name, owner = %owner, error = %e, "Failed to create container in db");
                })?;
                tracing::debug!(worker = worker_name, handle = %record.handle, "Created creating container in db");
                record
            }
        };

        // Held until the record is committed.
        let mut creating_lock = None;
        let runtime_container = match self.lookup_in_runtime(cancel, &record).await? {
            Some(container) => {
                tracing::debug!(worker = worker_name, handle = %record.handle, "Found container in runtime");
                container
            }
            None => {
                let Some(lock) = cancellable(
                    cancel,
                    self.services
                        .locks
                        .acquire(&LockId::ContainerCreating(record.id)),
                )
                .await
                .inspect_err(|e| {
                    tracing::error!(worker = worker_name, handle = %record.handle, error = %e, "Failed to acquire container creating lock");
                })?
                else {
                    tracing::debug!(worker = worker_name, handle = %record.handle, "Container is being created elsewhere, deferring");
                    self.services
                        .observer
                        .record_event(&ObserverEvent::CreationDeferred {
                            worker: worker_name.to_string(),
                            handle: record.handle.clone(),
                        });
                    return Ok(Provision::Deferred);
                };
                creating_lock = Some(lock);

                // The previous holder may have finished, or failed, between our
                // lookups and winning the lock.
                let current =
                    cancellable(cancel, db.find_container_on_worker(worker_name, owner)).await?;
                if current.map(|r| r.id) != Some(record.id) {
                    tracing::debug!(worker = worker_name, handle = %record.handle, "Container record was replaced, deferring");
                    return Ok(Provision::Deferred);
                }

                match self.lookup_in_runtime(cancel, &record).await? {
                    Some(container) => {
                        tracing::debug!(worker = worker_name, handle = %record.handle, "Container appeared in runtime before lock was won");
                        container
                    }
                    None => self.create_in_runtime(cancel, &record, spec, image).await?,
                }
            }
        };

        let created = match cancellable(cancel, db.mark_created(&record)).await {
            Ok(created) => created,
            Err(e) => {
                tracing::error!(worker = worker_name, handle = %record.handle, error = %e, "Failed to mark container as created");
                if let Err(destroy_err) = runtime.destroy(&record.handle).await {
                    tracing::warn!(
                        worker = worker_name,
                        handle = %record.handle,
                        error = %destroy_err,
                        "Failed to destroy runtime container after failed commit"
                    );
                }
                return Err(e);
            }
        };
        tracing::debug!(worker = worker_name, handle = %created.handle, "Created container in db");
        drop(creating_lock);

        self.wrap(cancel, created, runtime_container)
            .await
            .map(Provision::Ready)
    }

    /// Find a created container of `team_id` by handle. `None` when either
    /// the runtime or the record store does not know it.
    pub async fn find_created_container_by_handle(
        &self,
        cancel: &CancellationToken,
        handle: &str,
        team_id: i32,
    ) -> Result<Option<WorkerContainer>, ProvisionError> {
        let runtime_container =
            match cancellable(cancel, self.services.runtime.lookup(handle)).await {
                Ok(container) => container,
                Err(ProvisionError::Runtime(e)) if e.is_not_found() => {
                    tracing::info!(worker = %self.worker.name, handle, "Container not found");
                    return Ok(None);
                }
                Err(e) => {
                    tracing::error!(worker = %self.worker.name, handle, error = %e, "Failed to look up container in runtime");
                    return Err(e);
                }
            };

        let Some(record) = cancellable(
            cancel,
            self.services
                .db
                .find_created_container_by_handle(team_id, handle),
        )
        .await?
        else {
            return Ok(None);
        };

        self.wrap(cancel, record, runtime_container).await.map(Some)
    }

    async fn lookup_in_runtime(
        &self,
        cancel: &CancellationToken,
        record: &ContainerRecord,
    ) -> Result<Option<RuntimeContainer>, ProvisionError> {
        match cancellable(cancel, self.services.runtime.lookup(&record.handle)).await {
            Ok(container) => Ok(Some(container)),
            Err(ProvisionError::Runtime(e)) if e.is_not_found() => Ok(None),
            Err(e) => {
                tracing::error!(
                    worker = %self.worker.name,
                    handle = %record.handle,
                    error = %e,
                    "Failed to look up creating container in runtime"
                );
                Err(e)
            }
        }
    }

    /// Fetch the image, plan mounts and create the runtime container. Any
    /// failure marks the record failed before it is returned.
    async fn create_in_runtime(
        &self,
        cancel: &CancellationToken,
        record: &ContainerRecord,
        spec: &ContainerSpec,
        image: &dyn Image,
    ) -> Result<RuntimeContainer, ProvisionError> {
        let worker_name = self.worker.name.as_str();

        tracing::debug!(worker = worker_name, handle = %record.handle, "Fetching image");
        let fetched = match cancellable(cancel, image.fetch_for_container(record)).await {
            Ok(fetched) => fetched,
            Err(e) => {
                tracing::error!(worker = worker_name, handle = %record.handle, error = %e, "Failed to fetch image for container");
                self.mark_failed(record).await;
                return Err(e);
            }
        };

        tracing::debug!(worker = worker_name, handle = %record.handle, "Creating container in runtime");
        let started = Instant::now();
        match self.build_and_create(cancel, record, spec, &fetched).await {
            Ok(container) => {
                let elapsed = started.elapsed();
                self.services
                    .observer
                    .record_metric(&ObserverMetric::ContainersCreated(1));
                self.services
                    .observer
                    .record_metric(&ObserverMetric::CreateLatency(elapsed));
                self.services
                    .observer
                    .record_event(&ObserverEvent::ContainerCreated {
                        worker: worker_name.to_string(),
                        handle: record.handle.clone(),
                        duration: elapsed,
                    });
                tracing::debug!(worker = worker_name, handle = %record.handle, "Created container in runtime");
                Ok(container)
            }
            Err(e) => {
                self.mark_failed(record).await;
                self.services
                    .observer
                    .record_metric(&ObserverMetric::FailedContainers(1));
                self.services
                    .observer
                    .record_event(&ObserverEvent::ContainerFailed {
                        worker: worker_name.to_string(),
                        handle: record.handle.clone(),
                        error_message: e.to_string(),
                    });
                tracing::error!(worker = worker_name, handle = %record.handle, error = %e, "Failed to create container in runtime");
                Err(e)
            }
        }
    }

    async fn build_and_create(
        &self,
        cancel: &CancellationToken,
        record: &ContainerRecord,
        spec: &ContainerSpec,
        image: &FetchedImage,
    ) -> Result<RuntimeContainer, ProvisionError> {
        let plan = plan_mounts(
            cancel,
            record,
            spec,
            image.privileged,
            &self.worker.name,
            self.services.volumes.as_ref(),
        )
        .await?;

        let runtime_spec = RuntimeSpec {
            handle: record.handle.clone(),
            rootfs_url: image.url.clone(),
            privileged: image.privileged,
            bind_mounts: plan.bind_mounts,
            limits: spec.limits,
            env: self.container_env(spec, image),
            properties: container_properties(spec, image),
        };

        cancellable(cancel, self.services.runtime.create(runtime_spec)).await
    }

    /// Image env, then spec env, then the worker's proxy settings.
    fn container_env(&self, spec: &ContainerSpec, image: &FetchedImage) -> Vec<String> {
        let mut env = image.metadata.env.clone();
        env.extend(spec.env.iter().cloned());

        let proxies = [
            ("http_proxy", &self.worker.http_proxy_url),
            ("https_proxy", &self.worker.https_proxy_url),
            ("no_proxy", &self.worker.no_proxy),
        ];
        for (key, value) in proxies {
            if let Some(value) = value.as_deref().filter(|v| !v.is_empty()) {
                env.push(format!("{key}={value}"));
            }
        }
        env
    }

    /// Best-effort transition to failed. Never masks the caller's error.
    async fn mark_failed(&self, record: &ContainerRecord) {
        if let Err(e) = self.services.db.mark_failed(record).await {
            tracing::error!(
                worker = %self.worker.name,
                handle = %record.handle,
                error = %e,
                "Failed to mark container as failed"
            );
        }
    }

    async fn wrap(
        &self,
        cancel: &CancellationToken,
        record: ContainerRecord,
        runtime_container: RuntimeContainer,
    ) -> Result<WorkerContainer, ProvisionError> {
        let volumes = cancellable(cancel, self.services.db.find_volumes_for_container(&record))
            .await
            .inspect_err(|e| {
                tracing::error!(worker = %self.worker.name, handle = %record.handle, error = %e, "Failed to find container volumes");
            })?;
        Ok(WorkerContainer::new(record, runtime_container, volumes))
    }
}

fn container_properties(spec: &ContainerSpec, image: &FetchedImage) -> BTreeMap<String, String> {
    let user = spec
        .user
        .as_deref()
        .filter(|u| !u.is_empty())
        .or(image.metadata.user.as_deref())
        .unwrap_or_default();
    BTreeMap::from([(USER_PROPERTY.to_string(), user.to_string())])
}
