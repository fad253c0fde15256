//! Booster instance records.
//!
//! ```text
//! initializing → available ⇄ busy          (busy = at max_concurrent_tasks)
//! available → unhealthy → available      (probe recovery)
//! busy → available                       (zombie reset, leases dropped)
//! available → removed                    (scale-down / eviction)
//! ```

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use boostgrid_core::time::{incremental_mean, millis};
use boostgrid_core::{InstanceHandle, InstanceId, InstanceProfile};

/// Lifecycle status of a booster instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Initializing,
    Available,
    Busy,
    Unhealthy,
    Removed,
}

/// One observed execution, reported on release.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PerformanceSample {
    pub exec_time: Duration,
    pub success: bool,
}

impl PerformanceSample {
    pub fn success(exec_time: Duration) -> Self {
        Self {
            exec_time,
            success: true,
        }
    }

    pub fn failure(exec_time: Duration) -> Self {
        Self {
            exec_time,
            success: false,
        }
    }
}

/// Rolling execution statistics for an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceStats {
    pub avg_exec_time_ms: f64,
    /// Fraction of executions that succeeded (1.0 before any work).
    pub success_rate: f64,
    pub total_tasks: u64,
    pub failed_tasks: u64,
}

impl Default for PerformanceStats {
    fn default() -> Self {
        Self {
            avg_exec_time_ms: 0.0,
            success_rate: 1.0,
            total_tasks: 0,
            failed_tasks: 0,
        }
    }
}

impl PerformanceStats {
    pub fn record(&mut self, sample: PerformanceSample) {
        self.total_tasks += 1;
        if !sample.success {
            self.failed_tasks += 1;
        }
        self.avg_exec_time_ms = incremental_mean(
            self.avg_exec_time_ms,
            sample.exec_time.as_secs_f64() * 1000.0,
            self.total_tasks,
        );
        self.success_rate =
            (self.total_tasks - self.failed_tasks) as f64 / self.total_tasks as f64;
    }
}

/// A task bound to an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binding {
    pub lease_id: u64,
    pub bound_at: Instant,
}

/// A pooled booster instance. Owned and mutated only by the pool.
#[derive(Debug, Clone)]
pub struct Instance {
    pub id: InstanceId,
    pub status: InstanceStatus,
    pub healthy: bool,
    /// Tasks currently bound, oldest first.
    pub leases: Vec<Binding>,
    pub max_concurrent_tasks: u32,
    pub specializations: BTreeSet<String>,
    pub performance: PerformanceStats,
    pub created_at: Instant,
    pub last_used: Instant,
    /// Created to satisfy `min_pool_size`; never scaled down.
    pub essential: bool,
    pub restarts: u32,
}

impl Instance {
    /// A freshly reserved slot, not yet launched.
    pub fn reserved(id: InstanceId, essential: bool, max_concurrent_tasks: u32, now: Instant) -> Self {
        Self {
            id,
            status: InstanceStatus::Initializing,
            healthy: true,
            leases: Vec::new(),
            max_concurrent_tasks,
            specializations: BTreeSet::new(),
            performance: PerformanceStats::default(),
            created_at: now,
            last_used: now,
            essential,
            restarts: 0,
        }
    }

    /// Apply the launch profile and open the instance for work.
    pub fn mark_launched(&mut self, profile: InstanceProfile, now: Instant) {
        self.specializations = profile.specializations;
        if let Some(max) = profile.max_concurrent_tasks.filter(|m| *m > 0) {
            self.max_concurrent_tasks = max;
        }
        self.last_used = now;
        self.settle();
    }

    pub fn current_tasks(&self) -> u32 {
        self.leases.len() as u32
    }

    pub fn capacity(&self) -> u32 {
        self.max_concurrent_tasks.max(1)
    }

    /// Healthy with a free task slot.
    pub fn is_eligible(&self) -> bool {
        self.status == InstanceStatus::Available
            && self.healthy
            && self.current_tasks() < self.capacity()
    }

    /// When the longest-running bound task was bound.
    pub fn oldest_binding(&self) -> Option<Instant> {
        self.leases.iter().map(|b| b.bound_at).min()
    }

    /// Counts toward utilization (launched and not removed).
    pub fn is_active(&self) -> bool {
        !matches!(
            self.status,
            InstanceStatus::Initializing | InstanceStatus::Removed
        )
    }

    /// Bind a lease. The instance turns busy once it reaches capacity.
    pub fn bind(&mut self, lease_id: u64, now: Instant) {
        self.leases.push(Binding {
            lease_id,
            bound_at: now,
        });
        self.last_used = now;
        self.settle();
    }

    /// Drop a lease. Returns false if the lease was not bound (e.g. after a reset).
    pub fn unbind(&mut self, lease_id: u64, now: Instant) -> bool {
        let Some(pos) = self.leases.iter().position(|b| b.lease_id == lease_id) else {
            return false;
        };
        self.leases.remove(pos);
        self.last_used = now;
        self.settle();
        true
    }

    /// Force-clear all bindings (zombie recovery).
    pub fn reset(&mut self, now: Instant) {
        self.leases.clear();
        self.last_used = now;
        self.settle();
    }

    /// Recompute status from load and health.
    ///
    /// A full instance stays busy even when unhealthy; it settles to
    /// unhealthy as its leases drain.
    pub fn settle(&mut self) {
        self.status = if self.current_tasks() >= self.capacity() {
            InstanceStatus::Busy
        } else if self.healthy {
            InstanceStatus::Available
        } else {
            InstanceStatus::Unhealthy
        };
    }

    pub fn handle(&self) -> InstanceHandle {
        InstanceHandle {
            id: self.id.clone(),
            specializations: self.specializations.clone(),
        }
    }

    /// Serializable view for stats and persistence.
    pub fn record(&self, now: Instant) -> InstanceRecord {
        InstanceRecord {
            id: self.id.clone(),
            status: self.status,
            healthy: self.healthy,
            current_tasks: self.current_tasks(),
            max_concurrent_tasks: self.max_concurrent_tasks,
            specializations: self.specializations.clone(),
            performance: self.performance.clone(),
            essential: self.essential,
            restarts: self.restarts,
            age_ms: millis(now.saturating_duration_since(self.created_at)),
            idle_ms: millis(now.saturating_duration_since(self.last_used)),
        }
    }
}

/// Point-in-time view of an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub id: InstanceId,
    pub status: InstanceStatus,
    pub healthy: bool,
    pub current_tasks: u32,
    pub max_concurrent_tasks: u32,
    pub specializations: BTreeSet<String>,
    pub performance: PerformanceStats,
    pub essential: bool,
    pub restarts: u32,
    pub age_ms: u64,
    /// Time since the instance was last acquired or released.
    pub idle_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn launched(now: Instant) -> Instance {
        let mut inst = Instance::reserved("booster-0001".into(), false, 1, now);
        inst.mark_launched(InstanceProfile::with_specializations(["rs"]), now);
        inst
    }

    #[test]
    fn performance_tracks_mean_and_success_rate() {
        let mut perf = PerformanceStats::default();
        perf.record(PerformanceSample::success(Duration::from_millis(100)));
        perf.record(PerformanceSample::failure(Duration::from_millis(300)));
        assert_eq!(perf.total_tasks, 2);
        assert_eq!(perf.failed_tasks, 1);
        assert!((perf.avg_exec_time_ms - 200.0).abs() < 1e-9);
        assert!((perf.success_rate - 0.5).abs() < 1e-9);
    }

    #[test]
    fn launch_opens_instance() {
        let now = Instant::now();
        let inst = launched(now);
        assert!(inst.is_eligible());
        assert!(inst.specializations.contains("rs"));
        assert_eq!(inst.handle().id, "booster-0001");
    }

    #[test]
    fn bind_and_unbind_cycle_status() {
        let now = Instant::now();
        let mut inst = launched(now);
        inst.bind(7, now);
        assert_eq!(inst.status, InstanceStatus::Busy);
        assert_eq!(inst.current_tasks(), 1);
        assert!(!inst.is_eligible());

        assert!(!inst.unbind(8, now));
        assert!(inst.unbind(7, now));
        assert_eq!(inst.status, InstanceStatus::Available);
        assert_eq!(inst.current_tasks(), 0);
    }

    #[test]
    fn instance_accepts_work_up_to_capacity() {
        let now = Instant::now();
        let mut inst = Instance::reserved("booster-0003".into(), false, 1, now);
        inst.mark_launched(
            InstanceProfile {
                specializations: BTreeSet::new(),
                max_concurrent_tasks: Some(2),
            },
            now,
        );

        inst.bind(1, now);
        assert_eq!(inst.status, InstanceStatus::Available);
        assert!(inst.is_eligible());

        let later = now + Duration::from_secs(10);
        inst.bind(2, later);
        assert_eq!(inst.status, InstanceStatus::Busy);
        assert!(!inst.is_eligible());
        assert_eq!(inst.oldest_binding(), Some(now));

        assert!(inst.unbind(1, later));
        assert_eq!(inst.status, InstanceStatus::Available);
        assert_eq!(inst.oldest_binding(), Some(later));
    }

    #[test]
    fn unhealthy_instance_settles_unhealthy() {
        let now = Instant::now();
        let mut inst = launched(now);
        inst.bind(1, now);
        inst.healthy = false;
        inst.unbind(1, now);
        assert_eq!(inst.status, InstanceStatus::Unhealthy);
    }

    #[test]
    fn reset_drops_all_leases() {
        let now = Instant::now();
        let mut inst = launched(now);
        inst.bind(1, now);
        inst.reset(now);
        assert_eq!(inst.status, InstanceStatus::Available);
        assert_eq!(inst.current_tasks(), 0);
        assert!(!inst.unbind(1, now));
    }

    #[test]
    fn profile_concurrency_overrides_default() {
        let now = Instant::now();
        let mut inst = Instance::reserved("booster-0002".into(), true, 1, now);
        assert!(!inst.is_active());
        inst.mark_launched(
            InstanceProfile {
                specializations: BTreeSet::new(),
                max_concurrent_tasks: Some(4),
            },
            now,
        );
        assert_eq!(inst.max_concurrent_tasks, 4);
        assert!(inst.is_active());
    }
}
