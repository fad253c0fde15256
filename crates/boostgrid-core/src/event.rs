//! Events published on the coordination channels.
//!
//! Components publish while still holding the lock that guards the state
//! change being reported, so subscribers see events in state-change order.

use serde::{Deserialize, Serialize};

use crate::types::{ErrorKind, InstanceId, Priority, Severity, Target, TargetKind, TaskId};

/// Lifecycle, pool, and recovery events.
pub const EVENTS_CHANNEL: &str = "boostgrid:events";

/// Fallback target selections, for whoever resubmits work.
pub const FALLBACK_CHANNEL: &str = "boostgrid:fallback";

/// Instance-facing recovery signals consumed by the pool.
pub const RECOVERY_CHANNEL: &str = "boostgrid:recovery";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BoostEvent {
    TaskStarted {
        task_id: TaskId,
        operation: String,
        priority: Priority,
    },
    TaskCompleted {
        task_id: TaskId,
        duration_ms: u64,
        target: TargetKind,
        fallback: bool,
    },
    TaskFailed {
        task_id: TaskId,
        error: String,
        duration_ms: u64,
        evicted: bool,
    },
    InstanceInitialized {
        instance_id: InstanceId,
        essential: bool,
    },
    PoolScaledUp {
        instance_id: InstanceId,
        pool_size: usize,
        utilization: f64,
    },
    PoolScaledDown {
        instance_id: InstanceId,
        pool_size: usize,
        utilization: f64,
    },
    InstanceUnhealthy {
        instance_id: InstanceId,
    },
    InstanceRecovered {
        instance_id: InstanceId,
    },
    InstanceReset {
        instance_id: InstanceId,
        busy_for_ms: u64,
    },
    InstanceRestarted {
        instance_id: InstanceId,
        restarts: u32,
    },
    InstanceEvicted {
        instance_id: InstanceId,
    },
    ErrorHandled {
        error_id: String,
        error_type: ErrorKind,
        severity: Severity,
        instance_id: Option<InstanceId>,
    },
    RecoveryAction {
        error_id: String,
        action: String,
        instance_id: Option<InstanceId>,
        success: bool,
    },
    RecoverySuccess {
        error_id: String,
        attempts: u32,
        duration_ms: u64,
    },
    RecoveryFailed {
        error_id: String,
        attempts: u32,
    },
    FallbackActivated {
        error_id: String,
        target: Target,
        reason: String,
    },
    MonitoringUpdate {
        status: serde_json::Value,
    },
}

impl BoostEvent {
    /// The snake_case event name, as it appears in the `event` tag.
    pub fn name(&self) -> &'static str {
        match self {
            Self::TaskStarted { .. } => "task_started",
            Self::TaskCompleted { .. } => "task_completed",
            Self::TaskFailed { .. } => "task_failed",
            Self::InstanceInitialized { .. } => "instance_initialized",
            Self::PoolScaledUp { .. } => "pool_scaled_up",
            Self::PoolScaledDown { .. } => "pool_scaled_down",
            Self::InstanceUnhealthy { .. } => "instance_unhealthy",
            Self::InstanceRecovered { .. } => "instance_recovered",
            Self::InstanceReset { .. } => "instance_reset",
            Self::InstanceRestarted { .. } => "instance_restarted",
            Self::InstanceEvicted { .. } => "instance_evicted",
            Self::ErrorHandled { .. } => "error_handled",
            Self::RecoveryAction { .. } => "recovery_action",
            Self::RecoverySuccess { .. } => "recovery_success",
            Self::RecoveryFailed { .. } => "recovery_failed",
            Self::FallbackActivated { .. } => "fallback_activated",
            Self::MonitoringUpdate { .. } => "monitoring_update",
        }
    }
}

/// An instance-scoped request emitted by a recovery action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoverySignal {
    pub action: String,
    pub instance_id: InstanceId,
    pub error_id: String,
}
