//! Observability subsystem: trait-based event and metric recording plus
//! tracing setup.
//!
//! | Backend | Description |
//! |---------|-------------|
//! | `noop`  | Zero overhead, discards everything (default) |
//! | `log`   | Emits structured events via `tracing` |
//!
//! The [`create_observer`] factory builds the right backend from
//! [`ObservabilityConfig`].

mod log;
mod noop;
pub mod recording;
pub mod traits;

use std::sync::Arc;

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

pub use self::log::LogObserver;
pub use self::noop::NoopObserver;
pub use self::recording::RecordingObserver;
pub use self::traits::{Observer, ObserverEvent, ObserverMetric};

use crate::config::LoggingConfig;
use crate::error::ConfigError;

/// Configuration for the observability backend.
#[derive(Debug, Clone)]
pub struct ObservabilityConfig {
    /// Backend name: "none", "noop", or "log".
    pub backend: String,
}

impl ObservabilityConfig {
    /// Build from the `OBSERVABILITY_BACKEND` environment variable.
    pub fn from_env() -> Result<Self, ConfigError> {
        use crate::config::optional_env;

        Ok(Self {
            backend: optional_env("OBSERVABILITY_BACKEND")?.unwrap_or_else(|| "none".into()),
        })
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            backend: "none".into(),
        }
    }
}

/// Create an observer from configuration.
///
/// Returns a [`LogObserver`] for "log" and a [`NoopObserver`] for
/// "none"/"noop" or unknown values.
pub fn create_observer(config: &ObservabilityConfig) -> Arc<dyn Observer> {
    match config.backend.as_str() {
        "log" => Arc::new(LogObserver),
        "none" | "noop" => Arc::new(NoopObserver),
        other => {
            tracing::warn!(backend = other, "Unknown observability backend, using noop");
            Arc::new(NoopObserver)
        }
    }
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over the configured default filter.
pub fn init_tracing(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_filter));

    if config.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_target(false))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init();
    }
}
