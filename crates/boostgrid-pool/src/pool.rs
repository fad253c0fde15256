//! Instance pool — owns booster instances for the accelerator.
//!
//! All instance mutation happens under a single `Mutex<PoolState>`, so each
//! compound read-modify-write (score → bind, release → serve queue → scale)
//! is atomic. Driver calls (`launch`, `probe`, `terminate`) run with the lock
//! released; a scale-up reserves its slot in `Initializing` state first so
//! the pool size bound holds while the launch is in flight.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use boostgrid_core::time::{epoch_millis, millis};
use boostgrid_core::{
    BackgroundTasks, BoostEvent, InstanceDriver, InstanceHandle, InstanceId, PoolConfig,
    EVENTS_CHANNEL,
};
use boostgrid_store::StateStore;

use crate::error::{PoolError, PoolResult};
use crate::instance::{Instance, InstanceRecord, InstanceStatus, PerformanceSample};
use crate::scorer::{select_candidate, AcquireRequirements};
use crate::stats::{
    PendingRecord, PoolSnapshot, PoolStats, ScalingDirection, ScalingEvent, SCALING_LOG_LIMIT,
};

/// Store key of the persisted pool snapshot.
pub const POOL_STATE_KEY: &str = "boostgrid:pool:state";

/// Store key of the set of live instance ids.
pub const INSTANCE_INDEX_KEY: &str = "boostgrid:pool:instances";

/// Proof of an acquired instance, handed back on release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceLease {
    pub instance: InstanceHandle,
    pub lease_id: u64,
}

impl InstanceLease {
    pub fn instance_id(&self) -> &str {
        &self.instance.id
    }
}

/// A queued acquisition. Resolves when a released instance is handed over.
#[derive(Debug)]
pub struct PendingTicket {
    request_id: u64,
    rx: oneshot::Receiver<InstanceLease>,
}

impl PendingTicket {
    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    /// The lease, if the request has already been served.
    pub fn try_served(&mut self) -> Option<InstanceLease> {
        self.rx.try_recv().ok()
    }
}

/// Outcome of [`InstancePool::acquire`].
#[derive(Debug)]
pub enum Acquisition {
    Granted(InstanceLease),
    /// Nothing was free and the pool could not grow. No instance is reserved.
    Queued(PendingTicket),
}

impl Acquisition {
    pub fn is_queued(&self) -> bool {
        matches!(self, Self::Queued(_))
    }

    pub fn granted(self) -> Option<InstanceLease> {
        match self {
            Self::Granted(lease) => Some(lease),
            Self::Queued(_) => None,
        }
    }
}

/// Outcome of one [`InstancePool::wait_for`] round.
#[derive(Debug)]
pub enum TicketWait {
    Served(InstanceLease),
    /// Not served yet; the request keeps its place in the queue.
    Pending,
    /// The request left the queue without being served.
    Dropped,
}

pub(crate) struct PendingRequest {
    id: u64,
    requirements: AcquireRequirements,
    timestamp: Instant,
    responder: oneshot::Sender<InstanceLease>,
}

pub(crate) struct PoolState {
    /// Creation order; score ties resolve to the earlier entry.
    pub(crate) instances: Vec<Instance>,
    pub(crate) pending: VecDeque<PendingRequest>,
    /// Shared by scale-up and scale-down.
    pub(crate) last_scaling: Option<Instant>,
    next_instance_seq: u64,
    next_request_seq: u64,
    next_lease_id: u64,
    created_total: u64,
    destroyed_total: u64,
    scaling_events: VecDeque<ScalingEvent>,
}

impl PoolState {
    fn new() -> Self {
        Self {
            instances: Vec::new(),
            pending: VecDeque::new(),
            last_scaling: None,
            next_instance_seq: 0,
            next_request_seq: 0,
            next_lease_id: 0,
            created_total: 0,
            destroyed_total: 0,
            scaling_events: VecDeque::new(),
        }
    }

    pub(crate) fn position(&self, instance_id: &str) -> Option<usize> {
        self.instances.iter().position(|i| i.id == instance_id)
    }

    /// Bound tasks over total capacity of launched instances.
    pub(crate) fn utilization(&self) -> f64 {
        let (load, capacity) = self
            .instances
            .iter()
            .filter(|i| i.is_active())
            .fold((0u64, 0u64), |(load, cap), i| {
                (
                    load + u64::from(i.current_tasks()),
                    cap + u64::from(i.capacity()),
                )
            });
        if capacity == 0 {
            0.0
        } else {
            load as f64 / capacity as f64
        }
    }

    fn cooldown_elapsed(&self, now: Instant, cooldown: Duration) -> bool {
        self.last_scaling
            .is_none_or(|last| now.saturating_duration_since(last) >= cooldown)
    }

    fn essential_count(&self) -> usize {
        self.instances.iter().filter(|i| i.essential).count()
    }

    fn push_scaling_event(&mut self, event: ScalingEvent) {
        self.scaling_events.push_back(event);
        while self.scaling_events.len() > SCALING_LOG_LIMIT {
            self.scaling_events.pop_front();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LaunchKind {
    WarmUp,
    ScaleUp,
}

pub(crate) struct PoolInner {
    pub(crate) config: PoolConfig,
    pub(crate) driver: Arc<dyn InstanceDriver>,
    store: StateStore,
    pub(crate) state: Mutex<PoolState>,
    /// Origin for `ScalingEvent::pool_clock_ms`.
    clock_origin: Instant,
}

/// The booster instance pool.
///
/// Cheap to clone; clones share the same instances.
#[derive(Clone)]
pub struct InstancePool {
    pub(crate) inner: Arc<PoolInner>,
}

impl InstancePool {
    /// Create an empty pool. Call [`InstancePool::warm_up`] to reach `min_pool_size`.
    pub fn new(config: PoolConfig, driver: Arc<dyn InstanceDriver>, store: StateStore) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                config,
                driver,
                store,
                state: Mutex::new(PoolState::new()),
                clock_origin: Instant::now(),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Launch essential instances until `min_pool_size` is reached.
    ///
    /// Warm-up launches do not consume the scaling cooldown.
    pub async fn warm_up(&self) -> PoolResult<usize> {
        let mut created = 0;
        loop {
            let id = {
                let mut state = self.inner.state.lock().await;
                if state.essential_count() >= self.inner.config.min_pool_size
                    || state.instances.len() >= self.inner.config.max_pool_size
                {
                    break;
                }
                self.reserve_slot(&mut state, Instant::now())
            };
            self.complete_launch(&id, LaunchKind::WarmUp, false).await?;
            created += 1;
        }
        info!(
            min = self.inner.config.min_pool_size,
            warmed = created,
            "instance pool warmed"
        );
        Ok(created)
    }

    /// Acquire the best available instance for the given requirements.
    ///
    /// When nothing qualifies the pool tries to scale up; if that is not
    /// possible the request joins the FIFO queue and a ticket is returned.
    pub async fn acquire(&self, requirements: &AcquireRequirements) -> PoolResult<Acquisition> {
        enum Plan {
            Granted(InstanceLease, Option<InstanceId>),
            Launch(InstanceId),
        }

        let now = Instant::now();
        let plan = {
            let mut state = self.inner.state.lock().await;
            if let Some(idx) = select_candidate(&state.instances, requirements, now) {
                let lease = self.assign(&mut state, idx, now);
                let scale_up = self.reserve_scale_up(&mut state, now, true);
                Plan::Granted(lease, scale_up)
            } else if let Some(id) = self.reserve_scale_up(&mut state, now, false) {
                Plan::Launch(id)
            } else {
                return Ok(Acquisition::Queued(self.enqueue(&mut state, requirements, now)));
            }
        };

        match plan {
            Plan::Granted(lease, scale_up) => {
                if let Some(id) = scale_up
                    && let Err(e) = self.complete_launch(&id, LaunchKind::ScaleUp, false).await
                {
                    warn!(error = %e, "proactive scale-up failed");
                }
                Ok(Acquisition::Granted(lease))
            }
            Plan::Launch(id) => match self.complete_launch(&id, LaunchKind::ScaleUp, true).await? {
                Some(lease) => Ok(Acquisition::Granted(lease)),
                None => Err(PoolError::LaunchFailed {
                    instance_id: id,
                    reason: "launched instance could not be claimed".to_string(),
                }),
            },
        }
    }

    /// Wait up to `timeout` for a queued request to be served.
    ///
    /// An unserved request stays queued in its original position, so the
    /// caller can wait again on the same ticket.
    pub async fn wait_for(&self, ticket: &mut PendingTicket, timeout: Duration) -> TicketWait {
        match tokio::time::timeout(timeout, &mut ticket.rx).await {
            Ok(Ok(lease)) => TicketWait::Served(lease),
            Ok(Err(_)) => {
                warn!(request_id = ticket.request_id, "queued request dropped unserved");
                TicketWait::Dropped
            }
            Err(_) => TicketWait::Pending,
        }
    }

    /// Give up a queued request.
    ///
    /// If it was served in the meantime the lease goes straight back to
    /// the pool without a performance sample.
    pub async fn withdraw(&self, mut ticket: PendingTicket) {
        let now = Instant::now();
        let mut state = self.inner.state.lock().await;
        if let Some(pos) = state.pending.iter().position(|r| r.id == ticket.request_id) {
            state.pending.remove(pos);
            debug!(request_id = ticket.request_id, "queued request withdrawn");
            return;
        }
        // Serving happens under this lock, so a served lease is already in the channel.
        let Some(lease) = ticket.try_served() else {
            return;
        };
        if let Some(idx) = state.position(lease.instance_id())
            && state.instances[idx].unbind(lease.lease_id, now)
        {
            debug!(
                request_id = ticket.request_id,
                instance_id = %lease.instance_id(),
                "served lease handed back on withdrawal"
            );
            self.serve_pending(&mut state, idx, now);
        }
    }

    /// Return an instance with the observed performance sample.
    ///
    /// Serves the head of the pending queue if the instance is free again,
    /// then evaluates scale-down. Unknown instances are logged and ignored.
    ///
    /// Returns false when the lease was no longer bound, i.e. the instance
    /// was reset as a zombie while the task ran.
    pub async fn release(&self, lease: &InstanceLease, sample: PerformanceSample) -> bool {
        let now = Instant::now();
        let (bound, removed) = {
            let mut state = self.inner.state.lock().await;
            let Some(idx) = state.position(lease.instance_id()) else {
                warn!(
                    instance_id = %lease.instance_id(),
                    "release for unknown instance ignored"
                );
                return false;
            };

            let instance = &mut state.instances[idx];
            instance.performance.record(sample);
            let bound = instance.unbind(lease.lease_id, now);
            if !bound {
                warn!(
                    instance_id = %lease.instance_id(),
                    lease_id = lease.lease_id,
                    "stale lease released, binding already cleared"
                );
            }

            self.serve_pending(&mut state, idx, now);
            (bound, self.take_scale_down(&mut state, now))
        };

        if let Some(id) = removed {
            self.inner.driver.terminate(&id).await;
        }
        bound
    }

    /// Apply one scaling decision (up or down) based on current utilization.
    pub async fn evaluate_scaling(&self) -> Option<ScalingDirection> {
        let now = Instant::now();
        let (up, down) = {
            let mut state = self.inner.state.lock().await;
            let up = self.reserve_scale_up(&mut state, now, true);
            let down = if up.is_none() {
                self.take_scale_down(&mut state, now)
            } else {
                None
            };
            (up, down)
        };
        let direction = match (&up, &down) {
            (Some(_), _) => Some(ScalingDirection::Up),
            (None, Some(_)) => Some(ScalingDirection::Down),
            (None, None) => None,
        };
        self.apply_scaling(up, down).await;
        direction
    }

    /// Remove an idle instance on request.
    ///
    /// Busy or initializing instances are refused, as is any removal that
    /// would take the pool below `min_pool_size`.
    pub async fn evict(&self, instance_id: &str) -> PoolResult<()> {
        {
            let mut state = self.inner.state.lock().await;
            let idx = state
                .position(instance_id)
                .ok_or_else(|| PoolError::UnknownInstance(instance_id.to_string()))?;
            let instance = &state.instances[idx];
            if !instance.leases.is_empty()
                || matches!(
                    instance.status,
                    InstanceStatus::Busy | InstanceStatus::Initializing
                )
            {
                return Err(PoolError::InstanceBusy(instance_id.to_string()));
            }
            if state.instances.len() <= self.inner.config.min_pool_size {
                return Err(PoolError::BelowMinimum {
                    min: self.inner.config.min_pool_size,
                });
            }
            let mut removed = state.instances.remove(idx);
            removed.status = InstanceStatus::Removed;
            state.destroyed_total += 1;
            info!(%instance_id, essential = removed.essential, "instance evicted");
            self.emit(BoostEvent::InstanceEvicted {
                instance_id: instance_id.to_string(),
            });
        }
        self.inner.driver.terminate(instance_id).await;
        Ok(())
    }

    /// Apply a restart signal from recovery.
    ///
    /// Marks the instance healthy and refreshes `last_used` so a long
    /// recovery is not mistaken for a zombie. Returns false for unknown ids.
    pub async fn restart_instance(&self, instance_id: &str) -> bool {
        let now = Instant::now();
        let mut state = self.inner.state.lock().await;
        let Some(idx) = state.position(instance_id) else {
            warn!(%instance_id, "restart requested for unknown instance");
            return false;
        };
        let instance = &mut state.instances[idx];
        instance.restarts += 1;
        instance.healthy = true;
        instance.last_used = now;
        instance.settle();
        let restarts = instance.restarts;
        info!(%instance_id, restarts, "instance restarted");
        self.emit(BoostEvent::InstanceRestarted {
            instance_id: instance_id.to_string(),
            restarts,
        });
        self.serve_pending(&mut state, idx, now);
        true
    }

    // ── Read-only views ────────────────────────────────────────────

    pub async fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock().await;
        self.stats_locked(&state)
    }

    pub async fn instances(&self) -> Vec<InstanceRecord> {
        let now = Instant::now();
        let state = self.inner.state.lock().await;
        state.instances.iter().map(|i| i.record(now)).collect()
    }

    pub async fn instance(&self, instance_id: &str) -> Option<InstanceRecord> {
        let now = Instant::now();
        let state = self.inner.state.lock().await;
        state
            .instances
            .iter()
            .find(|i| i.id == instance_id)
            .map(|i| i.record(now))
    }

    pub async fn size(&self) -> usize {
        self.inner.state.lock().await.instances.len()
    }

    pub async fn pending_len(&self) -> usize {
        self.inner.state.lock().await.pending.len()
    }

    pub async fn utilization(&self) -> f64 {
        self.inner.state.lock().await.utilization()
    }

    // ── Persistence ────────────────────────────────────────────────

    /// Write a best-effort snapshot to the store with the configured TTL.
    pub async fn persist(&self) -> PoolResult<()> {
        let now = Instant::now();
        let snapshot = {
            let state = self.inner.state.lock().await;
            PoolSnapshot {
                instances: state.instances.iter().map(|i| i.record(now)).collect(),
                pending: state
                    .pending
                    .iter()
                    .map(|r| PendingRecord {
                        id: r.id,
                        requirements: r.requirements.clone(),
                        waited_ms: millis(now.saturating_duration_since(r.timestamp)),
                    })
                    .collect(),
                stats: self.stats_locked(&state),
                saved_at: epoch_millis(),
            }
        };
        let ids: Vec<InstanceId> = snapshot.instances.iter().map(|i| i.id.clone()).collect();
        let store = &self.inner.store;
        store.put(POOL_STATE_KEY, &snapshot, Some(self.inner.config.state_ttl()))?;
        store.set_replace(INSTANCE_INDEX_KEY, ids)?;
        debug!(instances = snapshot.instances.len(), "pool snapshot persisted");
        Ok(())
    }

    /// Restore lifetime counters and the scaling log from the last snapshot.
    ///
    /// Instances are not resurrected; call before [`InstancePool::warm_up`].
    pub async fn restore_snapshot(&self) -> PoolResult<Option<PoolSnapshot>> {
        let Some(snapshot) = self.inner.store.get::<PoolSnapshot>(POOL_STATE_KEY)? else {
            debug!("no pool snapshot to restore");
            return Ok(None);
        };

        let mut state = self.inner.state.lock().await;
        state.created_total += snapshot.stats.created_total;
        state.destroyed_total += snapshot.stats.destroyed_total;
        let restored: Vec<ScalingEvent> = snapshot.stats.scaling_events.clone();
        for event in restored.into_iter().rev() {
            state.scaling_events.push_front(event);
        }
        while state.scaling_events.len() > SCALING_LOG_LIMIT {
            state.scaling_events.pop_front();
        }
        let last_seq = snapshot
            .instances
            .iter()
            .filter_map(|i| i.id.strip_prefix("booster-")?.parse::<u64>().ok())
            .max()
            .unwrap_or(0);
        state.next_instance_seq = state.next_instance_seq.max(last_seq);

        info!(
            instances = snapshot.instances.len(),
            created_total = state.created_total,
            destroyed_total = state.destroyed_total,
            "pool counters restored from snapshot"
        );
        Ok(Some(snapshot))
    }

    // ── Background loops ───────────────────────────────────────────

    /// Spawn the health-check and persistence loops.
    pub fn start(&self, tasks: &mut BackgroundTasks) {
        let pool = self.clone();
        let shutdown = tasks.shutdown_signal();
        tasks.push(
            "pool-health",
            tokio::spawn(async move { pool.run_health_loop(shutdown).await }),
        );

        let pool = self.clone();
        let shutdown = tasks.shutdown_signal();
        tasks.push(
            "pool-persistence",
            tokio::spawn(async move { pool.run_persistence_loop(shutdown).await }),
        );
    }

    /// Persist periodically, and once more on shutdown.
    pub async fn run_persistence_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let interval = self.inner.config.persist_interval();
        info!(interval_ms = millis(interval), "pool persistence started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.persist().await {
                        error!(error = %e, "pool snapshot persistence failed");
                    }
                }
                _ = shutdown.changed() => {
                    if let Err(e) = self.persist().await {
                        error!(error = %e, "final pool snapshot failed");
                    }
                    info!("pool persistence shutting down");
                    break;
                }
            }
        }
    }

    // ── Internal helpers ───────────────────────────────────────────

    pub(crate) fn emit(&self, event: BoostEvent) {
        if let Err(e) = self.inner.store.publish(EVENTS_CHANNEL, &event) {
            warn!(event = event.name(), error = %e, "failed to publish pool event");
        }
    }

    fn stats_locked(&self, state: &PoolState) -> PoolStats {
        let config = &self.inner.config;
        PoolStats {
            pool_size: state.instances.len(),
            min_pool_size: config.min_pool_size,
            max_pool_size: config.max_pool_size,
            utilization: state.utilization(),
            healthy: state
                .instances
                .iter()
                .filter(|i| i.healthy && i.is_active())
                .count(),
            busy: state
                .instances
                .iter()
                .filter(|i| !i.leases.is_empty())
                .count(),
            available: state.instances.iter().filter(|i| i.is_eligible()).count(),
            pending_requests: state.pending.len(),
            created_total: state.created_total,
            destroyed_total: state.destroyed_total,
            scaling_events: state.scaling_events.iter().cloned().collect(),
        }
    }

    fn reserve_slot(&self, state: &mut PoolState, now: Instant) -> InstanceId {
        state.next_instance_seq += 1;
        let id = format!("booster-{:04}", state.next_instance_seq);
        let essential = state.essential_count() < self.inner.config.min_pool_size;
        state.instances.push(Instance::reserved(
            id.clone(),
            essential,
            self.inner.config.instance_max_concurrent_tasks,
            now,
        ));
        debug!(instance_id = %id, essential, "instance slot reserved");
        id
    }

    /// Reserve a scale-up slot if size, pressure, and cooldown allow it.
    ///
    /// `require_pressure` gates on the utilization threshold; acquisitions
    /// that found nothing available skip that check.
    pub(crate) fn reserve_scale_up(
        &self,
        state: &mut PoolState,
        now: Instant,
        require_pressure: bool,
    ) -> Option<InstanceId> {
        let config = &self.inner.config;
        if state.instances.len() >= config.max_pool_size {
            return None;
        }
        if require_pressure && state.utilization() <= config.scale_up_threshold {
            return None;
        }
        if !state.cooldown_elapsed(now, config.scaling_cooldown()) {
            debug!("scale-up suppressed by cooldown");
            return None;
        }
        state.last_scaling = Some(now);
        Some(self.reserve_slot(state, now))
    }

    /// Remove the least-recently-used idle instance if scale-down applies.
    pub(crate) fn take_scale_down(&self, state: &mut PoolState, now: Instant) -> Option<InstanceId> {
        let config = &self.inner.config;
        if state.instances.len() <= config.min_pool_size {
            return None;
        }
        let utilization = state.utilization();
        if utilization >= config.scale_down_threshold {
            return None;
        }
        if !state.cooldown_elapsed(now, config.scaling_cooldown()) {
            return None;
        }

        let idle_timeout = config.idle_timeout();
        let idx = state
            .instances
            .iter()
            .enumerate()
            .filter(|(_, i)| {
                !i.essential
                    && i.status == InstanceStatus::Available
                    && i.leases.is_empty()
                    && now.saturating_duration_since(i.last_used) > idle_timeout
            })
            .min_by_key(|(_, i)| i.last_used)
            .map(|(idx, _)| idx)?;

        let mut removed = state.instances.remove(idx);
        removed.status = InstanceStatus::Removed;
        state.destroyed_total += 1;
        state.last_scaling = Some(now);
        let pool_size = state.instances.len();
        state.push_scaling_event(ScalingEvent {
            direction: ScalingDirection::Down,
            instance_id: removed.id.clone(),
            pool_size,
            utilization,
            at: epoch_millis(),
            pool_clock_ms: millis(now.saturating_duration_since(self.inner.clock_origin)),
        });
        info!(instance_id = %removed.id, pool_size, utilization, "pool scaled down");
        self.emit(BoostEvent::PoolScaledDown {
            instance_id: removed.id.clone(),
            pool_size,
            utilization,
        });
        Some(removed.id)
    }

    pub(crate) async fn apply_scaling(&self, up: Option<InstanceId>, down: Option<InstanceId>) {
        if let Some(id) = up
            && let Err(e) = self.complete_launch(&id, LaunchKind::ScaleUp, false).await
        {
            warn!(error = %e, "scale-up failed");
        }
        if let Some(id) = down {
            self.inner.driver.terminate(&id).await;
        }
    }

    /// Launch a reserved slot and open it for work.
    ///
    /// With `claim`, the fresh instance is bound to the caller in the same
    /// critical section that makes it available.
    async fn complete_launch(
        &self,
        instance_id: &str,
        kind: LaunchKind,
        claim: bool,
    ) -> PoolResult<Option<InstanceLease>> {
        let result = self.inner.driver.launch(instance_id).await;
        let now = Instant::now();
        let mut state = self.inner.state.lock().await;
        let Some(idx) = state.position(instance_id) else {
            return Err(PoolError::UnknownInstance(instance_id.to_string()));
        };

        let profile = match result {
            Ok(profile) => profile,
            Err(reason) => {
                state.instances.remove(idx);
                warn!(%instance_id, %reason, "instance launch failed");
                return Err(PoolError::LaunchFailed {
                    instance_id: instance_id.to_string(),
                    reason,
                });
            }
        };

        let instance = &mut state.instances[idx];
        instance.mark_launched(profile, now);
        let essential = instance.essential;
        state.created_total += 1;
        debug!(%instance_id, essential, "instance initialized");
        self.emit(BoostEvent::InstanceInitialized {
            instance_id: instance_id.to_string(),
            essential,
        });

        if kind == LaunchKind::ScaleUp {
            let utilization = state.utilization();
            let pool_size = state.instances.len();
            state.push_scaling_event(ScalingEvent {
                direction: ScalingDirection::Up,
                instance_id: instance_id.to_string(),
                pool_size,
                utilization,
                at: epoch_millis(),
                pool_clock_ms: millis(now.saturating_duration_since(self.inner.clock_origin)),
            });
            info!(%instance_id, pool_size, utilization, "pool scaled up");
            self.emit(BoostEvent::PoolScaledUp {
                instance_id: instance_id.to_string(),
                pool_size,
                utilization,
            });
        }

        if claim {
            return Ok(Some(self.assign(&mut state, idx, now)));
        }
        self.serve_pending(&mut state, idx, now);
        Ok(None)
    }

    fn assign(&self, state: &mut PoolState, idx: usize, now: Instant) -> InstanceLease {
        state.next_lease_id += 1;
        let lease_id = state.next_lease_id;
        let instance = &mut state.instances[idx];
        instance.bind(lease_id, now);
        debug!(instance_id = %instance.id, lease_id, "instance acquired");
        InstanceLease {
            instance: instance.handle(),
            lease_id,
        }
    }

    fn enqueue(
        &self,
        state: &mut PoolState,
        requirements: &AcquireRequirements,
        now: Instant,
    ) -> PendingTicket {
        state.next_request_seq += 1;
        let request_id = state.next_request_seq;
        let (tx, rx) = oneshot::channel();
        state.pending.push_back(PendingRequest {
            id: request_id,
            requirements: requirements.clone(),
            timestamp: now,
            responder: tx,
        });
        debug!(request_id, queue_len = state.pending.len(), "acquisition queued");
        PendingTicket { request_id, rx }
    }

    /// Hand a free instance to queued requests, oldest first.
    ///
    /// Requests whose waiter has gone away are skipped.
    pub(crate) fn serve_pending(&self, state: &mut PoolState, idx: usize, now: Instant) {
        while state.instances[idx].is_eligible() {
            let Some(request) = state.pending.pop_front() else {
                break;
            };
            let request_id = request.id;
            let waited_ms = millis(now.saturating_duration_since(request.timestamp));
            let lease = self.assign(state, idx, now);
            match request.responder.send(lease) {
                Ok(()) => {
                    debug!(
                        request_id,
                        instance_id = %state.instances[idx].id,
                        waited_ms,
                        "queued request served"
                    );
                }
                Err(lease) => {
                    state.instances[idx].unbind(lease.lease_id, now);
                    debug!(request_id, "queued request abandoned by waiter");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{events, MockDriver};
    use boostgrid_core::{InstanceProfile, Task};

    fn config(min: usize, max: usize) -> PoolConfig {
        PoolConfig {
            min_pool_size: min,
            max_pool_size: max,
            ..PoolConfig::default()
        }
    }

    fn pool_with(config: PoolConfig, driver: Arc<MockDriver>) -> (InstancePool, StateStore) {
        let store = StateStore::open_in_memory().unwrap();
        (InstancePool::new(config, driver, store.clone()), store)
    }

    fn any() -> AcquireRequirements {
        AcquireRequirements::default()
    }

    fn sample() -> PerformanceSample {
        PerformanceSample::success(Duration::from_millis(20))
    }

    #[tokio::test(start_paused = true)]
    async fn warm_up_creates_essential_instances() {
        let (pool, store) = pool_with(config(2, 5), MockDriver::new());
        let mut rx = store.subscribe(EVENTS_CHANNEL);

        assert_eq!(pool.warm_up().await.unwrap(), 2);
        let instances = pool.instances().await;
        assert_eq!(instances.len(), 2);
        assert!(instances.iter().all(|i| i.essential));
        assert!(instances.iter().all(|i| i.status == InstanceStatus::Available));

        let names: Vec<_> = events(&mut rx).iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["instance_initialized", "instance_initialized"]);

        // Idempotent once the minimum is met.
        assert_eq!(pool.warm_up().await.unwrap(), 0);
        assert_eq!(pool.stats().await.scaling_events.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_prefers_matching_specialization() {
        let driver = MockDriver::with_profiles(vec![
            InstanceProfile::with_specializations(["py"]),
            InstanceProfile::with_specializations(["rs", "ts"]),
        ]);
        let (pool, _) = pool_with(config(2, 2), driver);
        pool.warm_up().await.unwrap();

        let req = AcquireRequirements::from_task(&Task::new("refactor").with_file_path("a.rs"));
        let lease = pool.acquire(&req).await.unwrap().granted().unwrap();
        assert_eq!(lease.instance_id(), "booster-0002");
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_marks_instance_busy() {
        let (pool, _) = pool_with(config(2, 2), MockDriver::new());
        pool.warm_up().await.unwrap();

        let before = pool.instance("booster-0001").await.unwrap();
        assert_eq!(before.status, InstanceStatus::Available);

        let lease = pool.acquire(&any()).await.unwrap().granted().unwrap();
        assert_eq!(lease.instance_id(), "booster-0001");
        let after = pool.instance("booster-0001").await.unwrap();
        assert_eq!(after.status, InstanceStatus::Busy);
        assert_eq!(after.current_tasks, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn release_unknown_instance_is_a_noop() {
        let (pool, _) = pool_with(config(1, 1), MockDriver::new());
        pool.warm_up().await.unwrap();
        let before = pool.stats().await;

        let bogus = InstanceLease {
            instance: InstanceHandle {
                id: "booster-9999".into(),
                specializations: Default::default(),
            },
            lease_id: 42,
        };
        assert!(!pool.release(&bogus, sample()).await);
        assert_eq!(pool.stats().await, before);
    }

    #[tokio::test(start_paused = true)]
    async fn release_records_performance_and_frees_instance() {
        let (pool, _) = pool_with(config(1, 1), MockDriver::new());
        pool.warm_up().await.unwrap();

        let lease = pool.acquire(&any()).await.unwrap().granted().unwrap();
        pool.release(&lease, PerformanceSample::failure(Duration::from_millis(400)))
            .await;

        let record = pool.instance(lease.instance_id()).await.unwrap();
        assert_eq!(record.status, InstanceStatus::Available);
        assert_eq!(record.current_tasks, 0);
        assert_eq!(record.performance.total_tasks, 1);
        assert_eq!(record.performance.failed_tasks, 1);
        assert!((record.performance.avg_exec_time_ms - 400.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn saturated_pool_queues_overflow_and_serves_fifo() {
        let mut cfg = config(20, 20);
        cfg.scaling_cooldown_ms = 0;
        let (pool, _) = pool_with(cfg, MockDriver::new());
        pool.warm_up().await.unwrap();

        let mut leases = Vec::new();
        let mut tickets = Vec::new();
        for _ in 0..25 {
            match pool.acquire(&any()).await.unwrap() {
                Acquisition::Granted(lease) => leases.push(lease),
                Acquisition::Queued(ticket) => tickets.push(ticket),
            }
        }
        assert_eq!(leases.len(), 20);
        assert_eq!(tickets.len(), 5);
        assert_eq!(pool.pending_len().await, 5);
        assert_eq!(pool.size().await, 20);

        let ids: Vec<u64> = tickets.iter().map(|t| t.request_id()).collect();
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        assert_eq!(ids, sorted);

        for (i, lease) in leases.iter().take(5).enumerate() {
            pool.release(lease, sample()).await;
            // Exactly the i-th ticket is served, later ones still wait.
            let served = tickets[i].try_served().expect("head of queue served");
            assert_eq!(served.instance_id(), lease.instance_id());
            for later in tickets.iter_mut().skip(i + 1) {
                assert!(later.try_served().is_none());
            }
            assert_eq!(pool.pending_len().await, 4 - i);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_ticket_is_skipped() {
        let (pool, _) = pool_with(config(1, 1), MockDriver::new());
        pool.warm_up().await.unwrap();

        let lease = pool.acquire(&any()).await.unwrap().granted().unwrap();
        let Acquisition::Queued(abandoned) = pool.acquire(&any()).await.unwrap() else {
            panic!("expected queue");
        };
        let Acquisition::Queued(mut waiting) = pool.acquire(&any()).await.unwrap() else {
            panic!("expected queue");
        };
        drop(abandoned);

        pool.release(&lease, sample()).await;
        let served = waiting.try_served().unwrap();
        assert_eq!(served.instance_id(), "booster-0001");
        assert_eq!(pool.pending_len().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unserved_ticket_keeps_its_place_until_withdrawn() {
        let (pool, _) = pool_with(config(1, 1), MockDriver::new());
        pool.warm_up().await.unwrap();
        let held = pool.acquire(&any()).await.unwrap().granted().unwrap();

        let Acquisition::Queued(mut first) = pool.acquire(&any()).await.unwrap() else {
            panic!("expected queue");
        };
        assert!(matches!(
            pool.wait_for(&mut first, Duration::from_secs(5)).await,
            TicketWait::Pending
        ));
        let Acquisition::Queued(mut second) = pool.acquire(&any()).await.unwrap() else {
            panic!("expected queue");
        };
        assert_eq!(pool.pending_len().await, 2);

        // The earlier request is still ahead after its wait timed out.
        pool.release(&held, sample()).await;
        assert!(first.try_served().is_some());
        assert!(second.try_served().is_none());

        pool.withdraw(second).await;
        assert_eq!(pool.pending_len().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_returns_lease_when_served() {
        let (pool, _) = pool_with(config(1, 1), MockDriver::new());
        pool.warm_up().await.unwrap();
        let held = pool.acquire(&any()).await.unwrap().granted().unwrap();

        let Acquisition::Queued(mut ticket) = pool.acquire(&any()).await.unwrap() else {
            panic!("expected queue");
        };
        let releaser = pool.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            releaser.release(&held, sample()).await;
        });

        let TicketWait::Served(lease) = pool.wait_for(&mut ticket, Duration::from_secs(5)).await
        else {
            panic!("expected the ticket to be served");
        };
        assert_eq!(lease.instance_id(), "booster-0001");
    }

    #[tokio::test(start_paused = true)]
    async fn withdrawing_a_served_ticket_returns_the_instance() {
        let (pool, _) = pool_with(config(1, 1), MockDriver::new());
        pool.warm_up().await.unwrap();
        let held = pool.acquire(&any()).await.unwrap().granted().unwrap();
        let Acquisition::Queued(ticket) = pool.acquire(&any()).await.unwrap() else {
            panic!("expected queue");
        };

        pool.release(&held, sample()).await;
        assert_eq!(
            pool.instance("booster-0001").await.unwrap().status,
            InstanceStatus::Busy
        );

        pool.withdraw(ticket).await;
        let record = pool.instance("booster-0001").await.unwrap();
        assert_eq!(record.status, InstanceStatus::Available);
        assert_eq!(record.current_tasks, 0);
        assert_eq!(record.performance.total_tasks, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn instance_with_spare_capacity_takes_second_task() {
        let driver = MockDriver::with_profiles(vec![InstanceProfile {
            specializations: Default::default(),
            max_concurrent_tasks: Some(2),
        }]);
        let (pool, _) = pool_with(config(1, 1), driver);
        pool.warm_up().await.unwrap();

        let first = pool.acquire(&any()).await.unwrap().granted().unwrap();
        assert_eq!(pool.utilization().await, 0.5);
        let second = pool.acquire(&any()).await.unwrap().granted().unwrap();
        assert_eq!(first.instance_id(), second.instance_id());
        assert_eq!(pool.utilization().await, 1.0);

        let record = pool.instance("booster-0001").await.unwrap();
        assert_eq!(record.status, InstanceStatus::Busy);
        assert_eq!(record.current_tasks, 2);
        assert!(pool.acquire(&any()).await.unwrap().is_queued());

        assert!(pool.release(&first, sample()).await);
        let record = pool.instance("booster-0001").await.unwrap();
        assert_eq!(record.status, InstanceStatus::Available);
        assert_eq!(record.current_tasks, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn partially_loaded_instance_triggers_scale_up_under_pressure() {
        let mut cfg = config(1, 2);
        cfg.instance_max_concurrent_tasks = 4;
        let (pool, _) = pool_with(cfg, MockDriver::new());
        pool.warm_up().await.unwrap();

        // 4 of 4 slots bound: utilization 1.0 > 0.8 on the last grant.
        for _ in 0..4 {
            assert!(!pool.acquire(&any()).await.unwrap().is_queued());
        }
        assert_eq!(pool.size().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn scale_up_respects_shared_cooldown() {
        let (pool, store) = pool_with(config(1, 3), MockDriver::new());
        let mut rx = store.subscribe(EVENTS_CHANNEL);
        pool.warm_up().await.unwrap();

        // Full utilization triggers a proactive scale-up.
        let _a = pool.acquire(&any()).await.unwrap().granted().unwrap();
        assert_eq!(pool.size().await, 2);

        // Inside the cooldown: no growth, overflow queues.
        let _b = pool.acquire(&any()).await.unwrap().granted().unwrap();
        assert_eq!(pool.size().await, 2);
        assert!(pool.acquire(&any()).await.unwrap().is_queued());

        tokio::time::advance(Duration::from_secs(60)).await;
        let c = pool.acquire(&any()).await.unwrap().granted().unwrap();
        assert_eq!(c.instance_id(), "booster-0003");
        assert_eq!(pool.size().await, 3);

        // At the ceiling.
        assert!(pool.acquire(&any()).await.unwrap().is_queued());
        assert_eq!(pool.size().await, 3);

        let stats = pool.stats().await;
        assert_eq!(stats.scaling_events.len(), 2);
        let gap = stats.scaling_events[1].pool_clock_ms - stats.scaling_events[0].pool_clock_ms;
        assert!(gap >= 60_000);

        let scaled: Vec<_> = events(&mut rx)
            .into_iter()
            .filter(|e| e.name() == "pool_scaled_up")
            .collect();
        assert_eq!(scaled.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn scale_down_removes_lru_idle_and_keeps_essential() {
        let mut cfg = config(1, 3);
        cfg.scaling_cooldown_ms = 0;
        let driver = MockDriver::new();
        let (pool, _) = pool_with(cfg, driver.clone());
        pool.warm_up().await.unwrap();

        let a = pool.acquire(&any()).await.unwrap().granted().unwrap();
        let b = pool.acquire(&any()).await.unwrap().granted().unwrap();
        assert_eq!(pool.size().await, 3);

        tokio::time::advance(Duration::from_secs(1)).await;
        pool.release(&a, sample()).await;
        tokio::time::advance(Duration::from_secs(1)).await;
        pool.release(&b, sample()).await;
        // Nothing has been idle long enough yet.
        assert_eq!(pool.size().await, 3);

        tokio::time::advance(Duration::from_secs(6 * 60)).await;
        assert_eq!(pool.evaluate_scaling().await, Some(ScalingDirection::Down));
        // booster-0003 was never used after launch, so it is the LRU.
        assert_eq!(driver.terminated(), vec!["booster-0003".to_string()]);
        assert_eq!(pool.evaluate_scaling().await, Some(ScalingDirection::Down));
        assert_eq!(pool.evaluate_scaling().await, None);

        let remaining = pool.instances().await;
        assert_eq!(remaining.len(), 1);
        assert!(remaining[0].essential);
        assert_eq!(pool.stats().await.destroyed_total, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn pool_size_stays_within_bounds() {
        let mut cfg = config(2, 4);
        cfg.scaling_cooldown_ms = 0;
        cfg.idle_timeout_ms = 0;
        let (pool, _) = pool_with(cfg, MockDriver::new());
        pool.warm_up().await.unwrap();

        let mut leases = Vec::new();
        for _ in 0..10 {
            if let Acquisition::Granted(lease) = pool.acquire(&any()).await.unwrap() {
                leases.push(lease);
            }
            let size = pool.size().await;
            assert!((2..=4).contains(&size), "size {size} out of bounds");
        }
        for lease in &leases {
            tokio::time::advance(Duration::from_millis(10)).await;
            pool.release(lease, sample()).await;
            let size = pool.size().await;
            assert!((2..=4).contains(&size), "size {size} out of bounds");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn launch_failure_on_empty_pool_is_an_error() {
        let driver = MockDriver::new();
        let (pool, _) = pool_with(config(0, 2), driver.clone());
        driver.fail_launches(true);

        let err = pool.acquire(&any()).await.unwrap_err();
        assert!(matches!(err, PoolError::LaunchFailed { .. }));
        assert_eq!(pool.size().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn evict_enforces_rules() {
        let (pool, store) = pool_with(config(1, 3), MockDriver::new());
        pool.warm_up().await.unwrap();
        let mut rx = store.subscribe(EVENTS_CHANNEL);

        assert!(matches!(
            pool.evict("booster-0001").await,
            Err(PoolError::BelowMinimum { min: 1 })
        ));
        assert!(matches!(
            pool.evict("nope").await,
            Err(PoolError::UnknownInstance(_))
        ));

        // Pressure grows the pool to two.
        let lease = pool.acquire(&any()).await.unwrap().granted().unwrap();
        assert!(matches!(
            pool.evict(lease.instance_id()).await,
            Err(PoolError::InstanceBusy(_))
        ));
        pool.evict("booster-0002").await.unwrap();
        assert_eq!(pool.size().await, 1);
        assert!(events(&mut rx).iter().any(|e| e.name() == "instance_evicted"));
    }

    #[tokio::test(start_paused = true)]
    async fn restart_refreshes_instance() {
        let (pool, _) = pool_with(config(1, 1), MockDriver::new());
        pool.warm_up().await.unwrap();

        assert!(pool.restart_instance("booster-0001").await);
        assert!(!pool.restart_instance("booster-0404").await);
        let record = pool.instance("booster-0001").await.unwrap();
        assert_eq!(record.restarts, 1);
        assert!(record.healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn persist_and_restore_counters() {
        let store = StateStore::open_in_memory().unwrap();
        let mut cfg = config(1, 2);
        cfg.scaling_cooldown_ms = 0;
        let pool = InstancePool::new(cfg.clone(), MockDriver::new(), store.clone());
        pool.warm_up().await.unwrap();
        let _lease = pool.acquire(&any()).await.unwrap().granted().unwrap();
        pool.persist().await.unwrap();

        assert_eq!(
            store.set_members(INSTANCE_INDEX_KEY).unwrap(),
            vec!["booster-0001", "booster-0002"]
        );

        let fresh = InstancePool::new(cfg, MockDriver::new(), store);
        let snapshot = fresh.restore_snapshot().await.unwrap().unwrap();
        assert_eq!(snapshot.instances.len(), 2);
        let stats = fresh.stats().await;
        assert_eq!(stats.created_total, 2);
        assert_eq!(stats.scaling_events.len(), 1);

        // Ids continue after the restored ones.
        fresh.warm_up().await.unwrap();
        assert_eq!(fresh.instances().await[0].id, "booster-0003");
    }

    #[tokio::test(start_paused = true)]
    async fn restore_without_snapshot_returns_none() {
        let (pool, _) = pool_with(config(1, 1), MockDriver::new());
        assert!(pool.restore_snapshot().await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn background_loops_stop_on_shutdown() {
        let (pool, store) = pool_with(config(1, 1), MockDriver::new());
        pool.warm_up().await.unwrap();

        let mut tasks = BackgroundTasks::new();
        pool.start(&mut tasks);
        assert_eq!(tasks.names(), vec!["pool-health", "pool-persistence"]);
        tasks.shutdown().await;

        // Final snapshot written on the way out.
        assert!(store.get::<PoolSnapshot>(POOL_STATE_KEY).unwrap().is_some());
    }
}
