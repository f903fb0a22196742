//! Tracing-based observer that emits structured log events.
//!
//! Uses the existing `tracing` infrastructure so events appear alongside
//! normal application logs, with no extra dependencies.

use crate::observability::traits::{Observer, ObserverEvent, ObserverMetric};

/// Observer that logs events and metrics via `tracing`.
pub struct LogObserver;

impl Observer for LogObserver {
    fn record_event(&self, event: &ObserverEvent) {
        match event {
            ObserverEvent::ContainerCreated {
                worker,
                handle,
                duration,
            } => {
                tracing::info!(
                    worker,
                    handle,
                    duration_ms = duration.as_millis() as u64,
                    "observer: container.created"
                );
            }
            ObserverEvent::ContainerFailed {
                worker,
                handle,
                error_message,
            } => {
                tracing::warn!(
                    worker,
                    handle,
                    error = error_message.as_str(),
                    "observer: container.failed"
                );
            }
            ObserverEvent::CreationDeferred { worker, handle } => {
                tracing::debug!(worker, handle, "observer: container.deferred");
            }
            ObserverEvent::Error { component, message } => {
                tracing::warn!(component, message, "observer: error");
            }
        }
    }

    fn record_metric(&self, metric: &ObserverMetric) {
        match metric {
            ObserverMetric::ContainersCreated(n) => {
                tracing::debug!(containers_created = n, "observer: metric");
            }
            ObserverMetric::FailedContainers(n) => {
                tracing::debug!(failed_containers = n, "observer: metric");
            }
            ObserverMetric::CreateLatency(d) => {
                tracing::debug!(
                    create_latency_ms = d.as_millis() as u64,
                    "observer: metric"
                );
            }
        }
    }

    fn name(&self) -> &str {
        "log"
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn handles_every_event_without_panicking() {
        let obs = LogObserver;
        obs.record_event(&ObserverEvent::ContainerCreated {
            worker: "w".into(),
            handle: "h".into(),
            duration: Duration::from_millis(3),
        });
        obs.record_event(&ObserverEvent::ContainerFailed {
            worker: "w".into(),
            handle: "h".into(),
            error_message: "nope".into(),
        });
        obs.record_event(&ObserverEvent::CreationDeferred {
            worker: "w".into(),
            handle: "h".into(),
        });
        obs.record_metric(&ObserverMetric::ContainersCreated(1));
        obs.record_metric(&ObserverMetric::CreateLatency(Duration::from_secs(1)));
        assert_eq!(obs.name(), "log");
    }
}
