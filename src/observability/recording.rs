//! Observer that captures all events into shared vectors.
//!
//! Used by tests to assert which events and counters the provisioner
//! emitted. Public so integration tests can use it too.

use std::sync::{Arc, Mutex};

use crate::observability::traits::{Observer, ObserverEvent, ObserverMetric};

pub type RecordedEvents = Arc<Mutex<Vec<ObserverEvent>>>;
pub type RecordedMetrics = Arc<Mutex<Vec<ObserverMetric>>>;

/// Observer that records all events for test assertions.
pub struct RecordingObserver {
    events: RecordedEvents,
    metrics: RecordedMetrics,
}

impl RecordingObserver {
    /// Create a new recording observer and return handles to the captured data.
    pub fn new() -> (Self, RecordedEvents, RecordedMetrics) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let metrics = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                events: Arc::clone(&events),
                metrics: Arc::clone(&metrics),
            },
            events,
            metrics,
        )
    }
}

/// Sum of `ContainersCreated` increments in a recording.
pub fn containers_created(metrics: &RecordedMetrics) -> u64 {
    metrics
        .lock()
        .map(|m| {
            m.iter()
                .map(|metric| match metric {
                    ObserverMetric::ContainersCreated(n) => *n,
                    _ => 0,
                })
                .sum()
        })
        .unwrap_or(0)
}

/// Sum of `FailedContainers` increments in a recording.
pub fn failed_containers(metrics: &RecordedMetrics) -> u64 {
    metrics
        .lock()
        .map(|m| {
            m.iter()
                .map(|metric| match metric {
                    ObserverMetric::FailedContainers(n) => *n,
                    _ => 0,
                })
                .sum()
        })
        .unwrap_or(0)
}

impl Observer for RecordingObserver {
    fn record_event(&self, event: &ObserverEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }

    fn record_metric(&self, metric: &ObserverMetric) {
        if let Ok(mut metrics) = self.metrics.lock() {
            metrics.push(metric.clone());
        }
    }

    fn name(&self) -> &str {
        "recording"
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn captures_events() {
        let (obs, events, _) = RecordingObserver::new();

        obs.record_event(&ObserverEvent::CreationDeferred {
            worker: "w".into(),
            handle: "h".into(),
        });
        obs.record_event(&ObserverEvent::Error {
            component: "runtime".into(),
            message: "gone".into(),
        });

        let captured = events.lock().unwrap();
        assert_eq!(captured.len(), 2);
        assert!(matches!(captured[0], ObserverEvent::CreationDeferred { .. }));
        assert!(matches!(captured[1], ObserverEvent::Error { .. }));
    }

    #[test]
    fn sums_counters() {
        let (obs, _, metrics) = RecordingObserver::new();

        obs.record_metric(&ObserverMetric::ContainersCreated(1));
        obs.record_metric(&ObserverMetric::CreateLatency(Duration::from_millis(10)));
        obs.record_metric(&ObserverMetric::ContainersCreated(1));
        obs.record_metric(&ObserverMetric::FailedContainers(1));

        assert_eq!(containers_created(&metrics), 2);
        assert_eq!(failed_containers(&metrics), 1);
    }
}
