//! Periodic health checks for booster instances.
//!
//! Each check probes every launched instance, flips health flags, resets
//! zombies (instances holding a task longer than `instance_timeout`), and
//! then evaluates scaling. Probes run concurrently without the pool lock.

use futures_util::future::join_all;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use boostgrid_core::time::millis;
use boostgrid_core::{BoostEvent, InstanceId};

use crate::pool::{InstancePool, PoolState};

/// Result of a single health check pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthReport {
    pub probed: usize,
    pub became_unhealthy: Vec<InstanceId>,
    pub recovered: Vec<InstanceId>,
    pub zombies_reset: Vec<InstanceId>,
}

impl HealthReport {
    pub fn is_quiet(&self) -> bool {
        self.became_unhealthy.is_empty() && self.recovered.is_empty() && self.zombies_reset.is_empty()
    }
}

impl InstancePool {
    /// Run one health check pass.
    pub async fn run_health_check(&self) -> HealthReport {
        let ids: Vec<InstanceId> = {
            let state = self.inner.state.lock().await;
            state
                .instances
                .iter()
                .filter(|i| i.is_active())
                .map(|i| i.id.clone())
                .collect()
        };

        let driver = &self.inner.driver;
        let probes: Vec<(InstanceId, bool)> = join_all(
            ids.into_iter()
                .map(|id| async move { (id.clone(), driver.probe(&id).await) }),
        )
        .await;

        let now = Instant::now();
        let mut report = HealthReport {
            probed: probes.len(),
            ..HealthReport::default()
        };

        let (up, down) = {
            let mut state = self.inner.state.lock().await;
            for (id, healthy) in probes {
                // Removed while we were probing.
                let Some(idx) = state.position(&id) else {
                    continue;
                };
                self.apply_probe(&mut state, idx, healthy, now, &mut report);
            }
            self.reset_zombies(&mut state, now, &mut report);

            let up = self.reserve_scale_up(&mut state, now, true);
            let down = if up.is_none() {
                self.take_scale_down(&mut state, now)
            } else {
                None
            };
            (up, down)
        };
        self.apply_scaling(up, down).await;

        if !report.is_quiet() {
            info!(
                probed = report.probed,
                unhealthy = report.became_unhealthy.len(),
                recovered = report.recovered.len(),
                zombies = report.zombies_reset.len(),
                "health check completed"
            );
        }
        report
    }

    /// Run health checks on `health_check_interval` until shutdown.
    pub async fn run_health_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let interval = self.inner.config.health_check_interval();
        info!(interval_ms = millis(interval), "pool health monitor started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    let report = self.run_health_check().await;
                    debug!(probed = report.probed, "health tick");
                }
                _ = shutdown.changed() => {
                    info!("pool health monitor shutting down");
                    break;
                }
            }
        }
    }

    fn apply_probe(
        &self,
        state: &mut PoolState,
        idx: usize,
        healthy: bool,
        now: Instant,
        report: &mut HealthReport,
    ) {
        let instance = &mut state.instances[idx];
        if instance.healthy == healthy {
            return;
        }
        instance.healthy = healthy;
        instance.settle();
        let instance_id = instance.id.clone();

        if healthy {
            info!(%instance_id, "instance recovered");
            self.emit(BoostEvent::InstanceRecovered {
                instance_id: instance_id.clone(),
            });
            report.recovered.push(instance_id);
            self.serve_pending(state, idx, now);
        } else {
            warn!(%instance_id, "instance failed health probe");
            self.emit(BoostEvent::InstanceUnhealthy {
                instance_id: instance_id.clone(),
            });
            report.became_unhealthy.push(instance_id);
        }
    }

    fn reset_zombies(&self, state: &mut PoolState, now: Instant, report: &mut HealthReport) {
        let timeout = self.inner.config.instance_timeout();
        for idx in 0..state.instances.len() {
            let instance = &mut state.instances[idx];
            let Some(bound_at) = instance.oldest_binding() else {
                continue;
            };
            let busy_for = now.saturating_duration_since(bound_at);
            if busy_for <= timeout {
                continue;
            }

            let dropped = instance.leases.len();
            instance.reset(now);
            let instance_id = instance.id.clone();
            warn!(
                %instance_id,
                busy_for_ms = millis(busy_for),
                dropped_leases = dropped,
                "zombie instance reset"
            );
            self.emit(BoostEvent::InstanceReset {
                instance_id: instance_id.clone(),
                busy_for_ms: millis(busy_for),
            });
            report.zombies_reset.push(instance_id);
            self.serve_pending(state, idx, now);
        }
    }
}
