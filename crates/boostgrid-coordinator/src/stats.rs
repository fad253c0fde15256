//! Coordinator statistics and the combined system status.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use boostgrid_core::time::incremental_mean;
use boostgrid_pool::PoolStats;
use boostgrid_recovery::ErrorStats;

/// Task lifecycle counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorStats {
    pub total_tasks: u64,
    pub succeeded: u64,
    /// Includes evicted tasks.
    pub failed: u64,
    pub rerouted: u64,
    pub fallback_executions: u64,
    pub evicted: u64,
    /// Mean over every finished task.
    pub avg_duration_ms: f64,
}

impl CoordinatorStats {
    pub(crate) fn record_success(&mut self, duration: Duration) {
        self.succeeded += 1;
        self.record_duration(duration);
    }

    pub(crate) fn record_failure(&mut self, duration: Duration) {
        self.failed += 1;
        self.record_duration(duration);
    }

    fn record_duration(&mut self, duration: Duration) {
        self.avg_duration_ms = incremental_mean(
            self.avg_duration_ms,
            duration.as_secs_f64() * 1000.0,
            self.succeeded + self.failed,
        );
    }

    pub fn finished(&self) -> u64 {
        self.succeeded + self.failed
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorStatus {
    pub active_tasks: usize,
    pub max_concurrent_tasks: usize,
    pub stats: CoordinatorStats,
}

/// Combined coordinator, pool, and error-handler statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemStatus {
    pub coordinator: CoordinatorStatus,
    pub pool: PoolStats,
    pub errors: ErrorStats,
    /// Epoch milliseconds.
    pub timestamp: u64,
}
