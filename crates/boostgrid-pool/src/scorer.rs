//! Instance scoring for acquisition.
//!
//! Each eligible instance gets a weighted score built from:
//! - **Base**: flat credit for being available
//! - **Performance**: success rate and rolling execution time
//! - **Load**: spare concurrency
//! - **Specialization**: bonus when the instance is tuned for the file type
//! - **Recency**: bonus for instances used in the last five minutes
//!
//! The highest score wins; ties go to the earliest-created instance.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use boostgrid_core::{Priority, Task};

use crate::instance::Instance;

const BASE_SCORE: f64 = 10.0;
const SUCCESS_WEIGHT: f64 = 20.0;
const SPEED_WEIGHT: f64 = 10.0;
const LOAD_WEIGHT: f64 = 10.0;
const SPECIALIZATION_BONUS: f64 = 15.0;
const RECENCY_BONUS: f64 = 5.0;
const RECENCY_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Task-derived hints used to pick an instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquireRequirements {
    pub file_type: Option<String>,
    pub operation_kind: Option<String>,
    pub priority: Priority,
}

impl AcquireRequirements {
    pub fn from_task(task: &Task) -> Self {
        Self {
            file_type: task.file_type(),
            operation_kind: task.operation_kind().map(str::to_string),
            priority: task.priority,
        }
    }
}

/// Individual score components for debugging.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreBreakdown {
    pub base: f64,
    pub performance: f64,
    pub load: f64,
    pub specialization: f64,
    pub recency: f64,
}

impl ScoreBreakdown {
    pub fn total(&self) -> f64 {
        self.base + self.performance + self.load + self.specialization + self.recency
    }
}

/// Score a single instance. Callers filter for eligibility first.
pub fn score_instance(instance: &Instance, req: &AcquireRequirements, now: Instant) -> ScoreBreakdown {
    let perf = &instance.performance;
    // 1s average execution halves the speed credit.
    let speed = SPEED_WEIGHT / (1.0 + perf.avg_exec_time_ms / 1000.0);
    let performance = perf.success_rate * SUCCESS_WEIGHT + speed;

    let capacity = f64::from(instance.max_concurrent_tasks.max(1));
    let load = (1.0 - f64::from(instance.current_tasks()) / capacity).max(0.0) * LOAD_WEIGHT;

    let specialization = match &req.file_type {
        Some(ft) if instance.specializations.contains(ft) => SPECIALIZATION_BONUS,
        _ => 0.0,
    };

    let recency = if now.saturating_duration_since(instance.last_used) <= RECENCY_WINDOW {
        RECENCY_BONUS
    } else {
        0.0
    };

    ScoreBreakdown {
        base: BASE_SCORE,
        performance,
        load,
        specialization,
        recency,
    }
}

/// Index of the best eligible instance, if any.
pub fn select_candidate(instances: &[Instance], req: &AcquireRequirements, now: Instant) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (idx, instance) in instances.iter().enumerate() {
        if !instance.is_eligible() {
            continue;
        }
        let score = score_instance(instance, req, now).total();
        // Strict comparison keeps the earlier instance on ties.
        if best.is_none_or(|(_, top)| score > top) {
            best = Some((idx, score));
        }
    }
    best.map(|(idx, _)| idx)
}
