//! The routing coordinator.
//!
//! Owns the active-execution table. Every registered task reaches exactly
//! one terminal outcome: completion, failure, or eviction by the stuck-task
//! sweep, whichever removes it from the table first.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{watch, Mutex};
use tokio::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use boostgrid_core::time::{epoch_millis, millis};
use boostgrid_core::{
    BackgroundTasks, BoostConfig, BoostEvent, BoosterProvider, CoordinatorConfig, ErrorKind,
    ExecutionError, ExecutionOutput, GeneralProvider, InstanceDriver, Priority, RecoverySignal,
    Target, TargetKind, Task, TaskId, TaskRouter, EVENTS_CHANNEL, RECOVERY_CHANNEL,
};
use boostgrid_pool::{
    AcquireRequirements, Acquisition, InstanceLease, InstancePool, PerformanceSample, PoolResult,
    TicketWait,
};
use boostgrid_recovery::{ErrorHandler, RecoveryContext, FALLBACK_DEFAULT};
use boostgrid_store::StateStore;

use crate::error::{CoordinatorError, CoordinatorResult};
use crate::stats::{CoordinatorStats, CoordinatorStatus, SystemStatus};

/// External collaborators.
#[derive(Clone)]
pub struct Providers {
    pub router: Arc<dyn TaskRouter>,
    pub booster: Arc<dyn BoosterProvider>,
    pub general: Arc<dyn GeneralProvider>,
}

/// Result of [`Coordinator::execute`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub success: bool,
    pub task_id: TaskId,
    pub result: Option<ExecutionOutput>,
    pub error: Option<String>,
    pub duration: Duration,
    /// Path that produced the result.
    pub target: Option<TargetKind>,
    /// The result came from a fallback dispatch.
    pub fallback: bool,
}

/// A registered, not-yet-finished execution.
#[derive(Debug, Clone)]
struct ActiveExecution {
    operation: String,
    priority: Priority,
    started: Instant,
}

/// Snapshot of one active execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveTask {
    pub task_id: TaskId,
    pub operation: String,
    pub priority: Priority,
    pub running_ms: u64,
}

#[derive(Debug)]
struct Completion {
    output: ExecutionOutput,
    target: TargetKind,
    fallback: bool,
}

struct CoordinatorState {
    active: HashMap<TaskId, ActiveExecution>,
    stats: CoordinatorStats,
}

struct CoordinatorInner {
    config: CoordinatorConfig,
    providers: Providers,
    pool: InstancePool,
    recovery: Arc<ErrorHandler>,
    store: StateStore,
    state: Mutex<CoordinatorState>,
}

/// Orchestrates validate → route → execute → recover → report.
///
/// Cheap to clone; clones share the same active-execution table.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<CoordinatorInner>,
}

impl Coordinator {
    /// Build a coordinator with its own pool and error handler.
    ///
    /// The pool and the handler each get their own store handle.
    pub fn new(
        config: BoostConfig,
        providers: Providers,
        driver: Arc<dyn InstanceDriver>,
        store: StateStore,
    ) -> Self {
        let pool = InstancePool::new(config.pool, driver, store.clone());
        let recovery = Arc::new(ErrorHandler::new(config.recovery, store.clone()));
        Self::from_parts(config.coordinator, providers, pool, recovery, store)
    }

    pub fn from_parts(
        config: CoordinatorConfig,
        providers: Providers,
        pool: InstancePool,
        recovery: Arc<ErrorHandler>,
        store: StateStore,
    ) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                config,
                providers,
                pool,
                recovery,
                store,
                state: Mutex::new(CoordinatorState {
                    active: HashMap::new(),
                    stats: CoordinatorStats::default(),
                }),
            }),
        }
    }

    pub fn pool(&self) -> &InstancePool {
        &self.inner.pool
    }

    pub fn error_handler(&self) -> &ErrorHandler {
        &self.inner.recovery
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    /// Restore pool counters from the last snapshot and warm the pool.
    pub async fn initialize(&self) -> CoordinatorResult<()> {
        self.inner.pool.restore_snapshot().await?;
        let warmed = self.inner.pool.warm_up().await?;
        info!(warmed, "coordinator initialized");
        Ok(())
    }

    /// Run a task to a terminal outcome.
    ///
    /// Returns `Err` only for pre-flight rejections (validation, capacity),
    /// before any state is touched.
    pub async fn execute(&self, task: Task) -> CoordinatorResult<TaskOutcome> {
        let Some(operation) = task.operation_kind().map(str::to_string) else {
            return Err(CoordinatorError::Validation(
                "task must carry a kind or operation".to_string(),
            ));
        };

        let task_id: TaskId = Uuid::new_v4().to_string();
        let started = Instant::now();
        {
            let mut state = self.inner.state.lock().await;
            let limit = self.inner.config.max_concurrent_tasks;
            let active = state.active.len();
            if active >= limit {
                return Err(CoordinatorError::AtCapacity { active, limit });
            }
            state.active.insert(
                task_id.clone(),
                ActiveExecution {
                    operation: operation.clone(),
                    priority: task.priority,
                    started,
                },
            );
            state.stats.total_tasks += 1;
            info!(%task_id, %operation, priority = ?task.priority, "task started");
            self.emit(BoostEvent::TaskStarted {
                task_id: task_id.clone(),
                operation,
                priority: task.priority,
            });
        }

        let result = self.run(&task_id, &task).await;
        Ok(self.finish(task_id, started, result).await)
    }

    async fn run(&self, task_id: &str, task: &Task) -> Result<Completion, String> {
        let target = self.route(task_id, task).await?;
        match target.kind {
            TargetKind::Booster => self.run_booster(task_id, task).await,
            TargetKind::General => {
                let output = self.run_general(task_id, task, &target).await?;
                Ok(Completion {
                    output,
                    target: TargetKind::General,
                    fallback: false,
                })
            }
        }
    }

    /// Route with up to `max_routing_retries` reroutes.
    async fn route(&self, task_id: &str, task: &Task) -> Result<Target, String> {
        let retries = self.inner.config.max_routing_retries;
        let mut last_error = String::new();
        for attempt in 0..=retries {
            match self.inner.providers.router.route(task).await {
                Ok(target) => {
                    debug!(%task_id, kind = ?target.kind, target = %target.id, "task routed");
                    return Ok(target);
                }
                Err(e) => {
                    warn!(%task_id, attempt, error = %e, "routing failed");
                    last_error = e;
                    if attempt < retries {
                        self.inner.state.lock().await.stats.rerouted += 1;
                    }
                }
            }
        }
        Err(format!(
            "routing failed after {} attempts: {last_error}",
            retries + 1
        ))
    }

    async fn run_booster(&self, task_id: &str, task: &Task) -> Result<Completion, String> {
        let requirements = AcquireRequirements::from_task(task);
        let lease = match self.acquire(task_id, &requirements).await {
            Ok(Some(lease)) => lease,
            Ok(None) => return Err("task evicted while waiting for an instance".to_string()),
            Err(e) => {
                warn!(%task_id, error = %e, "booster acquisition failed, using general path");
                let err = ExecutionError::new(ErrorKind::ResourceError, e.to_string());
                let ctx = RecoveryContext::new().with_task(task_id, task.clone());
                self.inner.recovery.record_only(&err, &ctx).await;
                return self
                    .run_fallback(task_id, task, &Target::general(FALLBACK_DEFAULT))
                    .await;
            }
        };

        let booster = &self.inner.providers.booster;
        let exec_started = Instant::now();
        let err = match booster.run_in_instance(&lease.instance, task).await {
            Ok(output) => {
                let bound = self
                    .inner
                    .pool
                    .release(&lease, PerformanceSample::success(output.exec_time))
                    .await;
                if !bound {
                    return Err(self.binding_lost(task_id, task, &lease).await);
                }
                return Ok(Completion {
                    output,
                    target: TargetKind::Booster,
                    fallback: false,
                });
            }
            Err(err) => err,
        };

        debug!(%task_id, instance_id = %lease.instance_id(), error = %err, "booster execution failed");
        let outcome = self
            .inner
            .recovery
            .handle(&err, self.recovery_context(task_id, task, &lease))
            .await;

        let sample = match &outcome.output {
            Some(output) => PerformanceSample::success(output.exec_time),
            None => PerformanceSample::failure(exec_started.elapsed()),
        };
        let bound = self.inner.pool.release(&lease, sample).await;

        match (outcome.output, outcome.fallback) {
            (Some(_), _) if !bound => Err(self.binding_lost(task_id, task, &lease).await),
            (Some(output), _) => Ok(Completion {
                output,
                target: TargetKind::Booster,
                fallback: false,
            }),
            (None, Some(fallback)) => self.run_fallback(task_id, task, &fallback.target).await,
            (None, None) => Err(err.message),
        }
    }

    /// Acquire an instance, waiting `acquire_backoff` per queued round.
    ///
    /// A queued request keeps its ticket, and so its place in the queue,
    /// across rounds. `Ok(None)` means the task was evicted while waiting.
    async fn acquire(
        &self,
        task_id: &str,
        requirements: &AcquireRequirements,
    ) -> PoolResult<Option<InstanceLease>> {
        let pool = &self.inner.pool;
        let backoff = self.inner.config.acquire_backoff();
        loop {
            let mut ticket = match pool.acquire(requirements).await? {
                Acquisition::Granted(lease) => return Ok(Some(lease)),
                Acquisition::Queued(ticket) => ticket,
            };
            debug!(%task_id, request_id = ticket.request_id(), "acquisition queued");

            loop {
                match pool.wait_for(&mut ticket, backoff).await {
                    TicketWait::Served(lease) => return Ok(Some(lease)),
                    TicketWait::Dropped => break,
                    TicketWait::Pending => {}
                }
                if !self.is_active(task_id).await {
                    pool.withdraw(ticket).await;
                    return Ok(None);
                }
                debug!(%task_id, request_id = ticket.request_id(), "still queued after backoff");
                // A scale-up serves the head of the queue.
                pool.evaluate_scaling().await;
            }
        }
    }

    /// Record a result that arrived after its instance was reset.
    ///
    /// The instance may already be running another task, so the output is
    /// discarded and the task fails.
    async fn binding_lost(&self, task_id: &str, task: &Task, lease: &InstanceLease) -> String {
        let err = ExecutionError::new(
            ErrorKind::Timeout,
            format!(
                "instance {} was reset while the task was bound to it",
                lease.instance_id()
            ),
        );
        warn!(%task_id, instance_id = %lease.instance_id(), "task lost its instance binding");
        let ctx = RecoveryContext::new()
            .for_instance(lease.instance_id())
            .with_task(task_id, task.clone());
        self.inner.recovery.record_only(&err, &ctx).await;
        err.message
    }

    fn recovery_context(&self, task_id: &str, task: &Task, lease: &InstanceLease) -> RecoveryContext {
        let booster = Arc::clone(&self.inner.providers.booster);
        let instance = lease.instance.clone();
        let retry_task = task.clone();
        RecoveryContext::new()
            .for_instance(lease.instance_id())
            .with_task(task_id, task.clone())
            .with_retry(move || {
                let booster = Arc::clone(&booster);
                let instance = instance.clone();
                let task = retry_task.clone();
                async move { booster.run_in_instance(&instance, &task).await }
            })
    }

    async fn run_fallback(
        &self,
        task_id: &str,
        task: &Task,
        target: &Target,
    ) -> Result<Completion, String> {
        self.inner.state.lock().await.stats.fallback_executions += 1;
        info!(%task_id, target = %target.id, "dispatching through fallback path");
        let output = self.run_general(task_id, task, target).await?;
        Ok(Completion {
            output,
            target: TargetKind::General,
            fallback: true,
        })
    }

    /// General-path failures are recorded and become hard failures.
    async fn run_general(
        &self,
        task_id: &str,
        task: &Task,
        target: &Target,
    ) -> Result<ExecutionOutput, String> {
        match self.inner.providers.general.run(task, target).await {
            Ok(output) => Ok(output),
            Err(err) => {
                let ctx = RecoveryContext::new().with_task(task_id, task.clone());
                self.inner.recovery.record_only(&err, &ctx).await;
                Err(err.message)
            }
        }
    }

    async fn finish(
        &self,
        task_id: TaskId,
        started: Instant,
        result: Result<Completion, String>,
    ) -> TaskOutcome {
        let duration = started.elapsed();
        let mut state = self.inner.state.lock().await;
        if state.active.remove(&task_id).is_none() {
            // The sweep already recorded the terminal outcome.
            debug!(%task_id, "late result for evicted task discarded");
            return TaskOutcome {
                success: false,
                task_id,
                result: None,
                error: Some("task evicted after exceeding the task timeout".to_string()),
                duration,
                target: None,
                fallback: false,
            };
        }

        match result {
            Ok(completion) => {
                state.stats.record_success(duration);
                info!(
                    %task_id,
                    duration_ms = millis(duration),
                    target = ?completion.target,
                    fallback = completion.fallback,
                    "task completed"
                );
                self.emit(BoostEvent::TaskCompleted {
                    task_id: task_id.clone(),
                    duration_ms: millis(duration),
                    target: completion.target,
                    fallback: completion.fallback,
                });
                TaskOutcome {
                    success: true,
                    task_id,
                    result: Some(completion.output),
                    error: None,
                    duration,
                    target: Some(completion.target),
                    fallback: completion.fallback,
                }
            }
            Err(error) => {
                state.stats.record_failure(duration);
                warn!(%task_id, duration_ms = millis(duration), %error, "task failed");
                self.emit(BoostEvent::TaskFailed {
                    task_id: task_id.clone(),
                    error: error.clone(),
                    duration_ms: millis(duration),
                    evicted: false,
                });
                TaskOutcome {
                    success: false,
                    task_id,
                    result: None,
                    error: Some(error),
                    duration,
                    target: None,
                    fallback: false,
                }
            }
        }
    }

    async fn is_active(&self, task_id: &str) -> bool {
        self.inner.state.lock().await.active.contains_key(task_id)
    }

    /// Evict executions running longer than `task_timeout`.
    ///
    /// Advisory: the in-flight work is not interrupted, but its late result
    /// is discarded.
    pub async fn sweep_stuck_tasks(&self) -> Vec<TaskId> {
        let now = Instant::now();
        let timeout = self.inner.config.task_timeout();
        let mut state = self.inner.state.lock().await;
        let stuck: Vec<TaskId> = state
            .active
            .iter()
            .filter(|(_, exec)| now.saturating_duration_since(exec.started) > timeout)
            .map(|(id, _)| id.clone())
            .collect();

        for task_id in &stuck {
            let Some(exec) = state.active.remove(task_id) else {
                continue;
            };
            let running = now.saturating_duration_since(exec.started);
            state.stats.record_failure(running);
            state.stats.evicted += 1;
            warn!(%task_id, operation = %exec.operation, running_ms = millis(running), "stuck task evicted");
            self.emit(BoostEvent::TaskFailed {
                task_id: task_id.clone(),
                error: "execution exceeded the task timeout".to_string(),
                duration_ms: millis(running),
                evicted: true,
            });
        }
        stuck
    }

    pub async fn active_tasks(&self) -> Vec<ActiveTask> {
        let now = Instant::now();
        let state = self.inner.state.lock().await;
        let mut tasks: Vec<ActiveTask> = state
            .active
            .iter()
            .map(|(id, exec)| ActiveTask {
                task_id: id.clone(),
                operation: exec.operation.clone(),
                priority: exec.priority,
                running_ms: millis(now.saturating_duration_since(exec.started)),
            })
            .collect();
        tasks.sort_by(|a, b| b.running_ms.cmp(&a.running_ms));
        tasks
    }

    pub async fn stats(&self) -> CoordinatorStats {
        self.inner.state.lock().await.stats.clone()
    }

    /// Combined coordinator, pool, and error-handler statistics.
    pub async fn system_status(&self) -> SystemStatus {
        let coordinator = {
            let state = self.inner.state.lock().await;
            CoordinatorStatus {
                active_tasks: state.active.len(),
                max_concurrent_tasks: self.inner.config.max_concurrent_tasks,
                stats: state.stats.clone(),
            }
        };
        SystemStatus {
            coordinator,
            pool: self.inner.pool.stats().await,
            errors: self.inner.recovery.stats().await,
            timestamp: epoch_millis(),
        }
    }

    pub async fn publish_monitoring_update(&self) {
        let status = self.system_status().await;
        match serde_json::to_value(&status) {
            Ok(status) => self.emit(BoostEvent::MonitoringUpdate { status }),
            Err(e) => error!(error = %e, "failed to serialize system status"),
        }
    }

    // ── Background loops ───────────────────────────────────────────

    /// Spawn the pool loops, the stuck-task sweep, the monitoring loop, and
    /// the recovery-signal forwarder.
    pub fn start(&self) -> BackgroundTasks {
        let mut tasks = BackgroundTasks::new();
        self.inner.pool.start(&mut tasks);

        let coordinator = self.clone();
        let shutdown = tasks.shutdown_signal();
        tasks.push(
            "stuck-task-sweep",
            tokio::spawn(async move { coordinator.run_sweep_loop(shutdown).await }),
        );

        let coordinator = self.clone();
        let shutdown = tasks.shutdown_signal();
        tasks.push(
            "monitoring",
            tokio::spawn(async move { coordinator.run_monitoring_loop(shutdown).await }),
        );

        // Subscribe before spawning so no signal published after start is missed.
        let signals = self.inner.store.subscribe(RECOVERY_CHANNEL);
        let coordinator = self.clone();
        let shutdown = tasks.shutdown_signal();
        tasks.push(
            "recovery-signals",
            tokio::spawn(async move { coordinator.run_signal_forwarder(signals, shutdown).await }),
        );

        tasks
    }

    pub async fn run_sweep_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let interval = self.inner.config.stuck_sweep_interval();
        info!(interval_ms = millis(interval), "stuck-task sweep started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    let evicted = self.sweep_stuck_tasks().await;
                    if !evicted.is_empty() {
                        info!(count = evicted.len(), "stuck tasks evicted");
                    }
                }
                _ = shutdown.changed() => {
                    info!("stuck-task sweep shutting down");
                    break;
                }
            }
        }
    }

    pub async fn run_monitoring_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let interval = self.inner.config.monitoring_interval();
        info!(interval_ms = millis(interval), "monitoring started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    self.publish_monitoring_update().await;
                }
                _ = shutdown.changed() => {
                    info!("monitoring shutting down");
                    break;
                }
            }
        }
    }

    /// Apply recovery signals that have a pool-side effect.
    pub async fn run_signal_forwarder(
        &self,
        mut signals: tokio::sync::broadcast::Receiver<serde_json::Value>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                message = signals.recv() => match message {
                    Ok(value) => self.apply_signal(value).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "recovery signal subscriber lagged");
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = shutdown.changed() => {
                    debug!("recovery signal forwarder shutting down");
                    break;
                }
            }
        }
    }

    async fn apply_signal(&self, value: serde_json::Value) {
        let signal: RecoverySignal = match serde_json::from_value(value) {
            Ok(signal) => signal,
            Err(e) => {
                warn!(error = %e, "malformed recovery signal");
                return;
            }
        };
        match signal.action.as_str() {
            "restart_instance" => {
                self.inner.pool.restart_instance(&signal.instance_id).await;
            }
            other => {
                debug!(action = other, instance_id = %signal.instance_id, "signal has no pool-side effect");
            }
        }
    }

    fn emit(&self, event: BoostEvent) {
        if let Err(e) = self.inner.store.publish(EVENTS_CHANNEL, &event) {
            warn!(event = event.name(), error = %e, "failed to publish coordinator event");
        }
    }
}
