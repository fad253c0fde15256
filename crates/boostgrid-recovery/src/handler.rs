//! The error handler.
//!
//! `handle` classifies and records an error, then either runs the selected
//! strategy's bounded retry loop or escalates straight to fallback. Fallback
//! is activated exactly once per handled error that does not recover.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use boostgrid_core::time::{epoch_millis, millis};
use boostgrid_core::{
    BoostEvent, ErrorKind, ExecutionError, ExecutionOutput, InstanceId, Priority, RecoveryConfig,
    Target, EVENTS_CHANNEL, FALLBACK_CHANNEL,
};
use boostgrid_store::StateStore;

use crate::action::{ActionResult, Adjustments};
use crate::classify::{classify_kind, Classification, ErrorProfile};
use crate::context::RecoveryContext;
use crate::history::{ErrorHistory, ErrorRecord, ErrorStats};
use crate::strategy::{select_strategy, RecoveryStrategy};

/// Store list holding the most recent error records, newest first.
pub const ERRORS_LIST_KEY: &str = "boostgrid:errors";

const ERROR_KEY_PREFIX: &str = "boostgrid:error:";
const ERROR_RECORD_TTL: Duration = Duration::from_secs(24 * 60 * 60);

pub const FALLBACK_FAST: &str = "general-fast";
pub const FALLBACK_MEMORY_EFFICIENT: &str = "general-memory-efficient";
pub const FALLBACK_DEFAULT: &str = "general-default";

/// A fallback target chosen for a failed error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackSelection {
    pub error_id: String,
    pub target: Target,
    pub reason: String,
}

/// Result of [`ErrorHandler::handle`].
#[derive(Debug, Clone)]
pub struct RecoveryOutcome {
    pub error_id: String,
    pub classification: Classification,
    /// `None` when retries were skipped.
    pub strategy: Option<&'static str>,
    pub success: bool,
    pub attempts: u32,
    pub actions_executed: Vec<ActionResult>,
    pub fallback: Option<FallbackSelection>,
    pub duration: Duration,
    /// Output of the successful retry.
    pub output: Option<ExecutionOutput>,
}

pub(crate) struct HandlerState {
    history: ErrorHistory,
    stats: ErrorStats,
    pub(crate) adjustments: HashMap<InstanceId, Adjustments>,
}

/// Deterministic fallback target for a classified error.
pub fn select_fallback_target(classification: &Classification, priority: Priority) -> Target {
    if priority == Priority::Urgent {
        return Target::general(FALLBACK_FAST);
    }
    match classification.error_type {
        ErrorKind::MemoryError | ErrorKind::StackOverflow => {
            Target::general(FALLBACK_MEMORY_EFFICIENT)
        }
        _ => Target::general(FALLBACK_DEFAULT),
    }
}

/// Classifies failures, runs recovery strategies, and activates fallback.
pub struct ErrorHandler {
    config: RecoveryConfig,
    store: StateStore,
    state: Mutex<HandlerState>,
}

impl ErrorHandler {
    pub fn new(config: RecoveryConfig, store: StateStore) -> Self {
        let history = ErrorHistory::new(config.history_limit);
        Self {
            config,
            store,
            state: Mutex::new(HandlerState {
                history,
                stats: ErrorStats::default(),
                adjustments: HashMap::new(),
            }),
        }
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    /// Classify without recording. The error itself counts toward the pattern.
    pub async fn classify(&self, error: &ExecutionError, instance_id: Option<&str>) -> Classification {
        let state = self.state.lock().await;
        self.classify_locked(&state, classify_kind(error), instance_id, Instant::now())
    }

    /// Record an error and try to recover from it.
    ///
    /// Non-recoverable errors and errors that hit the repeated-failure
    /// threshold skip retries and go straight to fallback.
    pub async fn handle(&self, error: &ExecutionError, ctx: RecoveryContext) -> RecoveryOutcome {
        let started = Instant::now();
        let record = self.record_error(error, &ctx).await;
        let classification = record.classification.clone();

        if !classification.recoverable || classification.requires_fallback {
            let reason = if classification.recoverable {
                format!("repeated {} on instance", classification.error_type)
            } else {
                format!("{} is not recoverable", classification.error_type)
            };
            info!(error_id = %record.id, %reason, "skipping retries");
            let fallback = self.activate_fallback(&record, &ctx, &reason).await;
            return RecoveryOutcome {
                error_id: record.id,
                classification,
                strategy: None,
                success: false,
                attempts: 0,
                actions_executed: Vec::new(),
                fallback: Some(fallback),
                duration: started.elapsed(),
                output: None,
            };
        }

        let strategy = select_strategy(&classification, ctx.priority(), &self.config);
        debug!(
            error_id = %record.id,
            strategy = strategy.name,
            max_retries = strategy.max_retries,
            "recovery strategy selected"
        );
        self.recover(&strategy, &record, &ctx).await
    }

    /// Run a strategy's bounded retry loop for a recorded error.
    pub async fn recover(
        &self,
        strategy: &RecoveryStrategy,
        record: &ErrorRecord,
        ctx: &RecoveryContext,
    ) -> RecoveryOutcome {
        let started = Instant::now();
        let mut actions_executed = Vec::new();
        let mut attempts = 0;

        for attempt in 0..strategy.max_retries {
            let delay = strategy.delay_for(attempt, &self.config);
            if !delay.is_zero() {
                debug!(error_id = %record.id, attempt, delay_ms = millis(delay), "backing off");
                tokio::time::sleep(delay).await;
            }
            attempts = attempt + 1;

            {
                let mut state = self.state.lock().await;
                for action in &strategy.actions {
                    let success = self.execute_action(&mut state, action, record, ctx);
                    actions_executed.push(ActionResult {
                        action: action.name().to_string(),
                        success,
                    });
                }
            }

            let Some(retry) = ctx.retry.as_ref() else {
                debug!(error_id = %record.id, "no retry callback, escalating");
                break;
            };
            match retry().await {
                Ok(output) => {
                    let duration = started.elapsed();
                    let mut state = self.state.lock().await;
                    state.stats.record_recovery(duration);
                    info!(
                        error_id = %record.id,
                        attempts,
                        duration_ms = millis(duration),
                        "recovered"
                    );
                    self.emit(BoostEvent::RecoverySuccess {
                        error_id: record.id.clone(),
                        attempts,
                        duration_ms: millis(duration),
                    });
                    return RecoveryOutcome {
                        error_id: record.id.clone(),
                        classification: record.classification.clone(),
                        strategy: Some(strategy.name),
                        success: true,
                        attempts,
                        actions_executed,
                        fallback: None,
                        duration,
                        output: Some(output),
                    };
                }
                Err(e) => {
                    warn!(error_id = %record.id, attempt = attempts, error = %e, "retry failed");
                }
            }
        }

        warn!(error_id = %record.id, strategy = strategy.name, attempts, "recovery exhausted");
        self.emit(BoostEvent::RecoveryFailed {
            error_id: record.id.clone(),
            attempts,
        });
        let reason = format!("{} exhausted after {attempts} attempts", strategy.name);
        let fallback = self.activate_fallback(record, ctx, &reason).await;

        RecoveryOutcome {
            error_id: record.id.clone(),
            classification: record.classification.clone(),
            strategy: Some(strategy.name),
            success: false,
            attempts,
            actions_executed,
            fallback: Some(fallback),
            duration: started.elapsed(),
            output: None,
        }
    }

    /// Select a fallback target and announce it. Does not run the task.
    pub async fn activate_fallback(
        &self,
        record: &ErrorRecord,
        ctx: &RecoveryContext,
        reason: &str,
    ) -> FallbackSelection {
        let selection = FallbackSelection {
            error_id: record.id.clone(),
            target: select_fallback_target(&record.classification, ctx.priority()),
            reason: reason.to_string(),
        };

        let mut state = self.state.lock().await;
        state.stats.fallback_activations += 1;
        if let Err(e) = self.store.publish(FALLBACK_CHANNEL, &selection) {
            warn!(error_id = %record.id, error = %e, "failed to publish fallback selection");
        }
        info!(
            error_id = %record.id,
            target = %selection.target.id,
            reason,
            "fallback activated"
        );
        self.emit(BoostEvent::FallbackActivated {
            error_id: selection.error_id.clone(),
            target: selection.target.clone(),
            reason: selection.reason.clone(),
        });
        selection
    }

    /// Record an error without attempting recovery.
    pub async fn record_only(&self, error: &ExecutionError, ctx: &RecoveryContext) -> ErrorRecord {
        self.record_error(error, ctx).await
    }

    pub async fn stats(&self) -> ErrorStats {
        self.state.lock().await.stats.clone()
    }

    /// Most recent error records, newest first.
    pub async fn recent_errors(&self, limit: usize) -> Vec<ErrorRecord> {
        self.state.lock().await.history.recent(limit)
    }

    /// Tuning accumulated for an instance by recovery actions.
    pub async fn adjustments_for(&self, instance_id: &str) -> Option<Adjustments> {
        self.state.lock().await.adjustments.get(instance_id).cloned()
    }

    pub(crate) fn store(&self) -> &StateStore {
        &self.store
    }

    pub(crate) fn emit(&self, event: BoostEvent) {
        if let Err(e) = self.store.publish(EVENTS_CHANNEL, &event) {
            warn!(event = event.name(), error = %e, "failed to publish recovery event");
        }
    }

    fn classify_locked(
        &self,
        state: &HandlerState,
        kind: ErrorKind,
        instance_id: Option<&str>,
        now: Instant,
    ) -> Classification {
        let threshold = usize::try_from(self.config.panic_threshold).unwrap_or(usize::MAX);
        let requires_fallback = instance_id.is_some_and(|id| {
            let prior = state
                .history
                .count_recent(id, kind, now, self.config.pattern_window());
            prior + 1 >= threshold
        });
        ErrorProfile::for_kind(kind).classification(kind, requires_fallback)
    }

    async fn record_error(&self, error: &ExecutionError, ctx: &RecoveryContext) -> ErrorRecord {
        let kind = classify_kind(error);
        let now = Instant::now();
        let mut state = self.state.lock().await;
        let classification = self.classify_locked(&state, kind, ctx.instance_id.as_deref(), now);
        let record = ErrorRecord {
            id: Uuid::new_v4().to_string(),
            message: error.message.clone(),
            classification,
            task_id: ctx.task_id.clone(),
            instance_id: ctx.instance_id.clone(),
            timestamp: epoch_millis(),
        };

        state.history.push(record.clone(), now);
        state.stats.record_error(kind, ctx.instance_id.as_deref());
        self.persist_record(&record);

        warn!(
            error_id = %record.id,
            error_type = %kind,
            severity = ?record.classification.severity,
            instance_id = ?record.instance_id,
            requires_fallback = record.classification.requires_fallback,
            message = %record.message,
            "execution error recorded"
        );
        self.emit(BoostEvent::ErrorHandled {
            error_id: record.id.clone(),
            error_type: kind,
            severity: record.classification.severity,
            instance_id: record.instance_id.clone(),
        });
        record
    }

    fn persist_record(&self, record: &ErrorRecord) {
        let key = format!("{ERROR_KEY_PREFIX}{}", record.id);
        let result = self
            .store
            .put(&key, record, Some(ERROR_RECORD_TTL))
            .and_then(|()| {
                self.store
                    .list_push_bounded(ERRORS_LIST_KEY, record, self.config.history_limit)
            });
        if let Err(e) = result {
            warn!(error_id = %record.id, error = %e, "failed to persist error record");
        }
    }
}
