//! Error types for berth.

use std::path::PathBuf;

use crate::db::ContainerOwner;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("Volume error: {0}")]
    Volume(#[from] VolumeError),

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Image error: {0}")]
    Image(#[from] ImageError),

    #[error("Worker selection error: {0}")]
    Selection(#[from] WorkerSelectionError),

    #[error("Provisioning error: {0}")]
    Provision(#[from] ProvisionError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Record store errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Container {handle} cannot move from {from} to {to}")]
    InvalidTransition {
        handle: String,
        from: String,
        to: String,
    },
}

/// Container runtime errors.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("Container not found: {handle}")]
    NotFound { handle: String },

    #[error("Container already exists: {handle}")]
    AlreadyExists { handle: String },

    #[error("Container creation failed for {handle}: {reason}")]
    CreateFailed { handle: String, reason: String },

    #[error("Invalid container spec for {handle}: {reason}")]
    InvalidSpec { handle: String, reason: String },

    #[error("Docker error: {reason}")]
    Docker { reason: String },
}

impl RuntimeError {
    /// Whether the runtime reported that the container does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, RuntimeError::NotFound { .. })
    }
}

/// Volume service errors.
#[derive(Debug, thiserror::Error)]
pub enum VolumeError {
    #[error("Volume not found: {handle}")]
    NotFound { handle: String },

    #[error("Failed to create volume for {mount_path}: {reason}")]
    CreateFailed { mount_path: PathBuf, reason: String },

    #[error("Failed to stream into volume {handle}: {reason}")]
    StreamFailed { handle: String, reason: String },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Lock service errors. Failing to win a lock is not an error.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("Failed to acquire lock {key}: {reason}")]
    AcquireFailed { key: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Image resolution errors.
#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    #[error("Failed to fetch image: {reason}")]
    FetchFailed { reason: String },

    #[error("Worker {worker} has no image for resource type {resource_type}")]
    UnsupportedResourceType {
        worker: String,
        resource_type: String,
    },

    #[error("No image specified")]
    Unspecified,
}

/// Reasons a worker does not satisfy a worker spec.
///
/// Pure selection errors: the caller should try another worker rather than
/// retry this one with the same spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WorkerSelectionError {
    #[error("mismatched team")]
    TeamMismatch,

    #[error("unsupported resource type")]
    UnsupportedResourceType,

    #[error("incompatible platform")]
    IncompatiblePlatform,

    #[error("mismatched tags")]
    MismatchedTags,
}

/// Errors from a find-or-create attempt.
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Volume(#[from] VolumeError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Image(#[from] ImageError),

    /// A created record exists but the runtime has no matching container.
    #[error("Container {handle} is recorded as created but missing from the runtime")]
    MissingRuntimeContainer { handle: String },

    #[error("Provisioning cancelled")]
    Cancelled,

    #[error("Container for {owner} still being created after {attempts} attempts")]
    RetriesExhausted { owner: ContainerOwner, attempts: u32 },
}

/// Result type alias for berth.
pub type Result<T> = std::result::Result<T, Error>;
