use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Staleness clock for one loader. Starts unhealthy; the first successful
/// load flips it. `is_healthy` holds while the last success is no older
/// than the configured staleness bound.
#[derive(Debug)]
pub struct HealthTracker {
    name: String,
    /// Epoch millis of the last successful load; 0 means never.
    last_success: AtomicI64,
    max_staleness: Duration,
}

impl HealthTracker {
    pub fn new(name: &str, max_staleness: Duration) -> Self {
        HealthTracker {
            name: name.to_string(),
            last_success: AtomicI64::new(0),
            max_staleness,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn record_success(&self) {
        self.last_success
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn last_success_millis(&self) -> Option<i64> {
        match self.last_success.load(Ordering::Relaxed) {
            0 => None,
            millis => Some(millis),
        }
    }

    pub fn is_healthy(&self) -> bool {
        match self.last_success_millis() {
            None => false,
            Some(last) => {
                let age = Utc::now().timestamp_millis().saturating_sub(last);
                age <= self.max_staleness.as_millis() as i64
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub healthy: bool,
    pub last_success_epoch_ms: Option<i64>,
}

/// Aggregates the trackers of every loader for the syncer gate and the
/// readiness probe.
#[derive(Debug, Default)]
pub struct HealthRegistry {
    trackers: Vec<Arc<HealthTracker>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        HealthRegistry::default()
    }

    pub fn register(&mut self, tracker: Arc<HealthTracker>) {
        self.trackers.push(tracker);
    }

    pub fn all_healthy(&self) -> bool {
        self.trackers.iter().all(|tracker| tracker.is_healthy())
    }

    pub fn snapshot(&self) -> BTreeMap<String, HealthStatus> {
        self.trackers
            .iter()
            .map(|tracker| {
                (
                    tracker.name().to_string(),
                    HealthStatus {
                        healthy: tracker.is_healthy(),
                        last_success_epoch_ms: tracker.last_success_millis(),
                    },
                )
            })
            .collect()
    }
}
