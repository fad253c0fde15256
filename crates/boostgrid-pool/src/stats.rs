//! Pool statistics and the persisted snapshot.

use serde::{Deserialize, Serialize};

use boostgrid_core::InstanceId;

use crate::instance::InstanceRecord;
use crate::scorer::AcquireRequirements;

/// Scaling events retained in the pool's log.
pub const SCALING_LOG_LIMIT: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingDirection {
    Up,
    Down,
}

/// A single scaling action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingEvent {
    pub direction: ScalingDirection,
    pub instance_id: InstanceId,
    /// Pool size after the action.
    pub pool_size: usize,
    /// Utilization when the action was taken.
    pub utilization: f64,
    /// Epoch milliseconds.
    pub at: u64,
    /// Milliseconds since the pool was created, on the pool's clock.
    pub pool_clock_ms: u64,
}

/// Aggregate pool statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolStats {
    pub pool_size: usize,
    pub min_pool_size: usize,
    pub max_pool_size: usize,
    pub utilization: f64,
    pub healthy: usize,
    pub busy: usize,
    pub available: usize,
    pub pending_requests: usize,
    pub created_total: u64,
    pub destroyed_total: u64,
    /// Most recent scaling actions, oldest first.
    pub scaling_events: Vec<ScalingEvent>,
}

/// A queued acquisition, as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingRecord {
    pub id: u64,
    pub requirements: AcquireRequirements,
    pub waited_ms: u64,
}

/// Best-effort pool state written to the coordination store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub instances: Vec<InstanceRecord>,
    pub pending: Vec<PendingRecord>,
    pub stats: PoolStats,
    /// Epoch milliseconds.
    pub saved_at: u64,
}
