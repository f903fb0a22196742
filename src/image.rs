//! Image resolution.
//!
//! Turning an image spec into a root filesystem is an external concern; the
//! provisioner only needs the resulting URL, privilege flag and image
//! metadata. [`WorkerImageFactory`] resolves images that a worker can serve
//! by itself (its built-in resource types) or that are named directly.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::db::ContainerRecord;
use crate::error::ImageError;
use crate::worker::WorkerInfo;
use crate::worker::spec::VersionedResourceTypes;

/// What image a container should run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSpec {
    /// Run the image of this resource type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,
    /// Run this image URL (e.g. `docker:///busybox#1.36`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default)]
    pub privileged: bool,
}

/// Metadata shipped with an image.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageMetadata {
    /// `KEY=VALUE` strings.
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

/// A root filesystem ready to be used by the runtime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchedImage {
    pub url: String,
    pub privileged: bool,
    pub metadata: ImageMetadata,
}

/// An image that can be fetched for a particular container.
#[async_trait]
pub trait Image: Send + Sync {
    async fn fetch_for_container(
        &self,
        container: &ContainerRecord,
    ) -> Result<FetchedImage, ImageError>;
}

/// Resolves image specs into [`Image`]s for a worker.
pub trait ImageFactory: Send + Sync {
    fn get_image(
        &self,
        worker: &WorkerInfo,
        spec: &ImageSpec,
        team_id: i32,
        resource_types: &VersionedResourceTypes,
    ) -> Result<Arc<dyn Image>, ImageError>;
}

/// An image whose fetch result is known up front.
#[derive(Debug, Clone)]
pub struct StaticImage {
    image: FetchedImage,
}

impl StaticImage {
    pub fn new(image: FetchedImage) -> Self {
        Self { image }
    }
}

#[async_trait]
impl Image for StaticImage {
    async fn fetch_for_container(
        &self,
        _container: &ContainerRecord,
    ) -> Result<FetchedImage, ImageError> {
        Ok(self.image.clone())
    }
}

/// Image factory for images a worker can serve without fetching anything.
///
/// - A resource type the worker provides natively runs the worker's own
///   rootfs for that type (`raw://<image>`).
/// - A custom resource type whose source names a `repository` runs that
///   repository's image (`docker:///<repository>#<tag>`).
/// - An explicit image URL is used as-is.
#[derive(Debug, Clone, Default)]
pub struct WorkerImageFactory;

impl WorkerImageFactory {
    pub fn new() -> Self {
        Self
    }
}

impl ImageFactory for WorkerImageFactory {
    fn get_image(
        &self,
        worker: &WorkerInfo,
        spec: &ImageSpec,
        _team_id: i32,
        resource_types: &VersionedResourceTypes,
    ) -> Result<Arc<dyn Image>, ImageError> {
        if let Some(type_name) = &spec.resource_type {
            if let Some(custom) = resource_types.lookup(type_name) {
                let repository = custom
                    .source
                    .get("repository")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| ImageError::UnsupportedResourceType {
                        worker: worker.name.clone(),
                        resource_type: type_name.clone(),
                    })?;
                let mut url = format!("docker:///{repository}");
                if let Some(tag) = custom.source.get("tag").and_then(|v| v.as_str()) {
                    url.push('#');
                    url.push_str(tag);
                }
                return Ok(Arc::new(StaticImage::new(FetchedImage {
                    url,
                    privileged: custom.privileged,
                    metadata: ImageMetadata::default(),
                })));
            }

            let native = worker
                .resource_types
                .iter()
                .find(|rt| &rt.type_ == type_name)
                .ok_or_else(|| ImageError::UnsupportedResourceType {
                    worker: worker.name.clone(),
                    resource_type: type_name.clone(),
                })?;
            return Ok(Arc::new(StaticImage::new(FetchedImage {
                url: format!("raw://{}", native.image),
                privileged: native.privileged,
                metadata: ImageMetadata::default(),
            })));
        }

        if let Some(url) = &spec.image_url {
            return Ok(Arc::new(StaticImage::new(FetchedImage {
                url: url.clone(),
                privileged: spec.privileged,
                metadata: ImageMetadata::default(),
            })));
        }

        Err(ImageError::Unspecified)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use super::*;
    use crate::db::{ContainerMetadata, ContainerOwner, ContainerState};
    use crate::worker::WorkerResourceType;
    use crate::worker::spec::VersionedResourceType;

    fn worker() -> WorkerInfo {
        WorkerInfo {
            name: "w1".to_string(),
            platform: "linux".to_string(),
            resource_types: vec![WorkerResourceType {
                type_: "git".to_string(),
                image: "/opt/resource-types/git/rootfs".to_string(),
                version: "1.0".to_string(),
                privileged: true,
            }],
            ..WorkerInfo::default()
        }
    }

    fn record() -> ContainerRecord {
        ContainerRecord {
            id: 1,
            handle: "h".to_string(),
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

    async fn fetch(spec: &ImageSpec, types: &VersionedResourceTypes) -> Result<FetchedImage, ImageError> {
        let image = WorkerImageFactory::new().get_image(&worker(), spec, 1, types)?;
        image.fetch_for_container(&record()).await
    }

    #[tokio::test]
    async fn native_resource_type_uses_worker_rootfs() {
        let spec = ImageSpec {
            resource_type: Some("git".to_string()),
            ..ImageSpec::default()
        };
        let fetched = fetch(&spec, &VersionedResourceTypes::default()).await.unwrap();
        assert_eq!(fetched.url, "raw:///opt/resource-types/git/rootfs");
        assert!(fetched.privileged);
    }

    #[tokio::test]
    async fn custom_resource_type_uses_its_repository() {
        let types = VersionedResourceTypes::from(vec![VersionedResourceType {
            name: "slack".to_string(),
            type_: "registry-image".to_string(),
            source: json!({"repository": "cfcommunity/slack-notification-resource", "tag": "v1"}),
            privileged: false,
            version: None,
        }]);
        let spec = ImageSpec {
            resource_type: Some("slack".to_string()),
            ..ImageSpec::default()
        };
        let fetched = fetch(&spec, &types).await.unwrap();
        assert_eq!(
            fetched.url,
            "docker:///cfcommunity/slack-notification-resource#v1"
        );
    }

    #[tokio::test]
    async fn unknown_resource_type_is_unsupported() {
        let spec = ImageSpec {
            resource_type: Some("s3".to_string()),
            ..ImageSpec::default()
        };
        let err = fetch(&spec, &VersionedResourceTypes::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ImageError::UnsupportedResourceType { .. }));
    }

    #[tokio::test]
    async fn image_url_is_used_as_is() {
        let spec = ImageSpec {
            image_url: Some("docker:///busybox".to_string()),
            privileged: true,
            ..ImageSpec::default()
        };
        let fetched = fetch(&spec, &VersionedResourceTypes::default()).await.unwrap();
        assert_eq!(fetched.url, "docker:///busybox");
        assert!(fetched.privileged);
    }

    #[tokio::test]
    async fn empty_spec_is_rejected() {
        let err = fetch(&ImageSpec::default(), &VersionedResourceTypes::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ImageError::Unspecified));
    }
}
