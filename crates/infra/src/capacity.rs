//! Read-only capacity and health snapshot.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use conductor_core::job::sub_std;

use crate::breaker::{CircuitBreakerRegistry, CircuitState};
use crate::dead_letter::DeadLetterStore;
use crate::queue::JobQueue;
use crate::worker::{PoolHealth, PoolMonitor, PoolStats};

/// Point-in-time summary for health checks and dashboards.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CapacitySnapshot {
    /// `queued + retry_scheduled`
    pub waiting: usize,
    pub active: usize,
    pub max_capacity: usize,
    /// `(waiting + active) / max_capacity * 100`
    pub utilization_percent: f64,
    pub breakers: BTreeMap<String, CircuitState>,
    /// Dead letters captured within the report window (24h by default)
    pub dead_letter_count_24h: u64,
    pub workers: PoolStats,
    pub health: PoolHealth,
    /// Set when the store could not be read for this snapshot; the depth and
    /// dead-letter figures are then zero rather than real.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_error: Option<String>,
    pub taken_at: DateTime<Utc>,
}

impl CapacitySnapshot {
    /// Healthy when the pool is not halted and the store answered.
    pub fn is_healthy(&self) -> bool {
        self.store_error.is_none() && !matches!(self.health, PoolHealth::Halted { .. })
    }
}

/// Builds [`CapacitySnapshot`]s. Never mutates queue or breaker state.
#[derive(Debug, Clone)]
pub struct CapacityReporter {
    queue: JobQueue,
    breakers: Arc<CircuitBreakerRegistry>,
    dead_letters: DeadLetterStore,
    monitor: PoolMonitor,
    window: Duration,
}

impl CapacityReporter {
    pub fn new(
        queue: JobQueue,
        breakers: Arc<CircuitBreakerRegistry>,
        dead_letters: DeadLetterStore,
        monitor: PoolMonitor,
    ) -> Self {
        Self {
            queue,
            breakers,
            dead_letters,
            monitor,
            window: Duration::from_secs(24 * 60 * 60),
        }
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub async fn snapshot(&self) -> CapacitySnapshot {
        let now = Utc::now();
        let max_capacity = self.queue.max_capacity();
        let mut store_error = None;

        let depth = match self.queue.depth().await {
            Ok(depth) => depth,
            Err(e) => {
                warn!(error = %e, "capacity snapshot could not read queue depth");
                store_error = Some(e.to_string());
                Default::default()
            }
        };

        let dead_letter_count_24h = match self.dead_letters.count_since(sub_std(now, self.window)).await {
            Ok(count) => count,
            Err(e) => {
                warn!(error = %e, "capacity snapshot could not count dead letters");
                store_error.get_or_insert_with(|| e.to_string());
                0
            }
        };

        let waiting = depth.waiting();
        let utilization_percent = if max_capacity == 0 {
            0.0
        } else {
            (waiting + depth.active) as f64 / max_capacity as f64 * 100.0
        };

        CapacitySnapshot {
            waiting,
            active: depth.active,
            max_capacity,
            utilization_percent,
            breakers: self.breakers.states(),
            dead_letter_count_24h,
            workers: self.monitor.stats(),
            health: self.monitor.health(),
            store_error,
            taken_at: now,
        }
    }
}
