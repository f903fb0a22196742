use std::path::Path;

use crate::db::ContainerRecord;
use crate::runtime::RuntimeContainer;
use crate::volume::Volume;

/// Property under which the runtime records the container's user.
pub const USER_PROPERTY: &str = "user";

/// A provisioned container: its record, the runtime's view of it and the
/// volumes mounted into it.
#[derive(Debug, Clone)]
pub struct WorkerContainer {
    record: ContainerRecord,
    runtime: RuntimeContainer,
    volumes: Vec<Volume>,
}

impl WorkerContainer {
    pub fn new(record: ContainerRecord, runtime: RuntimeContainer, volumes: Vec<Volume>) -> Self {
        Self {
            record,
            runtime,
            volumes,
        }
    }

    pub fn handle(&self) -> &str {
        &self.record.handle
    }

    pub fn worker_name(&self) -> &str {
        &self.record.worker_name
    }

    pub fn record(&self) -> &ContainerRecord {
        &self.record
    }

    pub fn runtime_container(&self) -> &RuntimeContainer {
        &self.runtime
    }

    pub fn volumes(&self) -> &[Volume] {
        &self.volumes
    }

    /// The volume mounted at `path`, if any.
    pub fn volume_at(&self, path: &Path) -> Option<&Volume> {
        self.volumes.iter().find(|v| v.mount_path() == Some(path))
    }

    /// The user processes run as, as recorded by the runtime.
    pub fn user(&self) -> Option<&str> {
        self.runtime
            .properties
            .get(USER_PROPERTY)
            .map(String::as_str)
            .filter(|u| !u.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    use chrono::Utc;

    use super::*;
    use crate::db::{ContainerMetadata, ContainerOwner, ContainerState};
    use crate::volume::{VolumeBinding, VolumeStrategy};

    #[test]
    fn exposes_user_and_volumes() {
        let record = ContainerRecord {
            id: 1,
            handle: "h".to_string(),
            worker_name: "w1".to_string(),
            owner: ContainerOwner::ResourceCheck {
                resource_config_id: 1,
                team_id: 1,
            },
            metadata: ContainerMetadata::default(),
            team_id: 1,
            state: ContainerState::Created,
            created_at: Utc::now(),
        };
        let runtime = RuntimeContainer {
            handle: "h".to_string(),
            properties: BTreeMap::from([(USER_PROPERTY.to_string(), "builder".to_string())]),
        };
        let volume = Volume {
            handle: "v".to_string(),
            path: PathBuf::from("/vols/v"),
            worker_name: "w1".to_string(),
            team_id: 1,
            privileged: false,
            strategy: VolumeStrategy::Empty,
            binding: VolumeBinding::Container {
                handle: "h".to_string(),
                mount_path: PathBuf::from("/scratch"),
            },
        };

        let container = WorkerContainer::new(record, runtime, vec![volume]);
        assert_eq!(container.handle(), "h");
        assert_eq!(container.worker_name(), "w1");
        assert_eq!(container.user(), Some("builder"));
        assert!(container.volume_at(Path::new("/scratch")).is_some());
        assert!(container.volume_at(Path::new("/tmp")).is_none());
    }
}
