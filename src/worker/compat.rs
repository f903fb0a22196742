//! Worker compatibility rules.
//!
//! Pure functions of a worker's advertised info, a worker spec and a
//! resource type catalog. No I/O.

use std::collections::HashMap;

use semver::Version;

use crate::error::WorkerSelectionError;
use crate::worker::WorkerInfo;
use crate::worker::spec::{VersionedResourceTypes, WorkerSpec};

/// Check a worker against a spec. Checks run in a fixed order and the first
/// violation wins: team, resource type, platform, tags.
pub fn check(
    worker: &WorkerInfo,
    spec: &WorkerSpec,
    resource_types: &VersionedResourceTypes,
) -> Result<(), WorkerSelectionError> {
    if spec.team_id != worker.team_id && worker.team_id != 0 {
        return Err(WorkerSelectionError::TeamMismatch);
    }

    if let Some(resource_type) = spec.resource_type.as_deref().filter(|t| !t.is_empty()) {
        let base = underlying_type_name(resource_type, resource_types);
        if !worker.resource_types.iter().any(|t| t.type_ == base) {
            return Err(WorkerSelectionError::UnsupportedResourceType);
        }
    }

    if let Some(platform) = spec.platform.as_deref().filter(|p| !p.is_empty()) {
        if platform != worker.platform {
            return Err(WorkerSelectionError::IncompatiblePlatform);
        }
    }

    if !tags_match(&worker.tags, &spec.tags) {
        return Err(WorkerSelectionError::MismatchedTags);
    }

    Ok(())
}

/// Follow a type through the catalog down to the base type it is built from.
///
/// Each catalog entry is consumed once, so a cyclic catalog terminates at
/// whichever name closes the cycle.
pub fn underlying_type_name(type_name: &str, resource_types: &VersionedResourceTypes) -> String {
    let mut catalog: HashMap<&str, &str> = resource_types
        .iter()
        .map(|t| (t.name.as_str(), t.type_.as_str()))
        .collect();

    let mut name = type_name;
    while let Some(base) = catalog.remove(name) {
        name = base;
    }
    name.to_string()
}

/// A tagged worker only takes specs whose tags it carries. An untagged
/// worker takes anything.
pub fn tags_match(worker_tags: &[String], spec_tags: &[String]) -> bool {
    if worker_tags.is_empty() {
        return true;
    }
    spec_tags.iter().all(|tag| worker_tags.contains(tag))
}

/// Parse a worker's advertised version. `MAJOR.MINOR` is accepted as
/// `MAJOR.MINOR.0`.
pub fn parse_worker_version(raw: &str) -> Option<Version> {
    let raw = raw.trim().trim_start_matches('v');
    if let Ok(version) = Version::parse(raw) {
        return Some(version);
    }
    if raw.matches('.').count() == 1 {
        return Version::parse(&format!("{raw}.0")).ok();
    }
    None
}

/// Whether a worker running `worker_version` can serve a caller expecting
/// `required`.
///
/// Only release components count. A worker ahead of the required version
/// is accepted as long as the major component matches, even when its minor
/// differs.
pub fn is_version_compatible(worker_version: Option<&str>, required: &Version) -> bool {
    let Some(raw) = worker_version else {
        tracing::info!(want = %required, "Worker reports no version");
        return false;
    };

    let Some(have) = parse_worker_version(raw) else {
        tracing::warn!(want = %required, have = raw, "Failed to parse worker version");
        return false;
    };

    let have_release = (have.major, have.minor, have.patch);
    let want_release = (required.major, required.minor, required.patch);

    match have_release.cmp(&want_release) {
        std::cmp::Ordering::Equal => true,
        std::cmp::Ordering::Less => false,
        std::cmp::Ordering::Greater => have.major == required.major,
    }
}
