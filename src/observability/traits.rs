//! Core observer trait and event/metric types.

use std::time::Duration;

/// Sink for provisioning lifecycle events and counters.
///
/// Recording is fire-and-forget: implementations must not block and never
/// report failures back to the provisioner.
///
/// Thread-safe and cheaply cloneable behind `Arc<dyn Observer>`.
pub trait Observer: Send + Sync {
    /// Record a discrete lifecycle event.
    fn record_event(&self, event: &ObserverEvent);

    /// Record a numeric metric sample.
    fn record_metric(&self, metric: &ObserverMetric);

    /// Flush any buffered data. No-op by default.
    fn flush(&self) {}

    /// Human-readable backend name (e.g. "noop", "log").
    fn name(&self) -> &str;
}

/// Discrete lifecycle events emitted by the container provider.
#[derive(Debug, Clone, PartialEq)]
pub enum ObserverEvent {
    /// A runtime container was created and its record committed.
    ContainerCreated {
        worker: String,
        handle: String,
        duration: Duration,
    },

    /// Provisioning failed after the creating lock was won.
    ContainerFailed {
        worker: String,
        handle: String,
        error_message: String,
    },

    /// Another caller holds the creating lock; the caller should poll again.
    CreationDeferred { worker: String, handle: String },

    /// An error occurred in a component outside the main flow.
    Error { component: String, message: String },
}

/// Numeric metric samples.
#[derive(Debug, Clone, PartialEq)]
pub enum ObserverMetric {
    /// Counter increment: containers created in the runtime.
    ContainersCreated(u64),
    /// Counter increment: containers that failed to be created.
    FailedContainers(u64),
    /// Time spent planning mounts and creating the runtime container.
    CreateLatency(Duration),
}
