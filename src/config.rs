//! Configuration for berth.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;
use crate::observability::ObservabilityConfig;

/// Main configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub provisioner: ProvisionerConfig,
    pub volumes: VolumesConfig,
    pub locks: LocksConfig,
    pub docker: DockerConfig,
    pub logging: LoggingConfig,
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        Ok(Self {
            provisioner: ProvisionerConfig::from_env()?,
            volumes: VolumesConfig::from_env()?,
            locks: LocksConfig::from_env()?,
            docker: DockerConfig::from_env()?,
            logging: LoggingConfig::from_env()?,
            observability: ObservabilityConfig::from_env()?,
        })
    }
}

/// Polling behavior while another caller holds the creating lock.
#[derive(Debug, Clone)]
pub struct ProvisionerConfig {
    /// Delay between find-or-create polls when creation was deferred.
    pub creating_retry_delay: Duration,
    /// Polls before giving up on a container that never finishes creating.
    pub max_create_attempts: u32,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            creating_retry_delay: Duration::from_secs(1),
            max_create_attempts: 60,
        }
    }
}

impl ProvisionerConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let delay_ms = parse_optional_env(
            "BERTH_CREATING_RETRY_DELAY_MS",
            defaults.creating_retry_delay.as_millis() as u64,
        )?;
        let max_create_attempts =
            parse_optional_env("BERTH_MAX_CREATE_ATTEMPTS", defaults.max_create_attempts)?;

        if max_create_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "BERTH_MAX_CREATE_ATTEMPTS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        Ok(Self {
            creating_retry_delay: Duration::from_millis(delay_ms),
            max_create_attempts,
        })
    }
}

/// Where the local volume client keeps volume directories.
#[derive(Debug, Clone)]
pub struct VolumesConfig {
    pub base_dir: PathBuf,
    /// Directory whose contents become the worker's certificate volume.
    pub certs_dir: Option<PathBuf>,
}

impl Default for VolumesConfig {
    fn default() -> Self {
        let base = dirs::data_local_dir().unwrap_or_else(std::env::temp_dir);
        Self {
            base_dir: base.join("berth").join("volumes"),
            certs_dir: None,
        }
    }
}

impl VolumesConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            base_dir: optional_env("BERTH_VOLUMES_DIR")?
                .map(PathBuf::from)
                .unwrap_or(defaults.base_dir),
            certs_dir: optional_env("BERTH_CERTS_DIR")?.map(PathBuf::from),
        })
    }
}

/// Where the file lock factory keeps its lock files.
#[derive(Debug, Clone)]
pub struct LocksConfig {
    pub lock_dir: PathBuf,
}

impl Default for LocksConfig {
    fn default() -> Self {
        let base = dirs::runtime_dir().unwrap_or_else(std::env::temp_dir);
        Self {
            lock_dir: base.join("berth-locks"),
        }
    }
}

impl LocksConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(match optional_env("BERTH_LOCK_DIR")? {
            Some(dir) => Self {
                lock_dir: PathBuf::from(dir),
            },
            None => Self::default(),
        })
    }
}

/// Docker runtime adapter settings.
#[derive(Debug, Clone)]
pub struct DockerConfig {
    /// Command containers idle on until the step executor runs processes.
    pub keepalive_command: Vec<String>,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            keepalive_command: vec!["sleep".to_string(), "infinity".to_string()],
        }
    }
}

impl DockerConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(match optional_env("BERTH_KEEPALIVE_COMMAND")? {
            Some(cmd) => Self {
                keepalive_command: cmd.split_whitespace().map(String::from).collect(),
            },
            None => Self::default(),
        })
    }
}

/// Log output settings.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is unset.
    pub default_filter: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            default_filter: "berth=info".to_string(),
            json: false,
        }
    }
}

impl LoggingConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            json: parse_bool_env("BERTH_LOG_JSON", false)?,
            ..Self::default()
        })
    }
}

// Helper functions

pub(crate) fn optional_env(key: &str) -> Result<Option<String>, ConfigError> {
    match std::env::var(key) {
        Ok(val) if val.is_empty() => Ok(None),
        Ok(val) => Ok(Some(val)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(ConfigError::ParseError(format!(
            "failed to read {key}: {e}"
        ))),
    }
}

pub(crate) fn parse_optional_env<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    optional_env(key)?
        .map(|s| {
            s.parse().map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{e}"),
            })
        })
        .transpose()
        .map(|opt| opt.unwrap_or(default))
}

pub(crate) fn parse_bool_env(key: &str, default: bool) -> Result<bool, ConfigError> {
    match optional_env(key)? {
        None => Ok(default),
        Some(val) => match val.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("expected a boolean, got '{other}'"),
            }),
        },
    }
}
