//! Recovery strategies and retry backoff.

use std::time::Duration;

use serde::Serialize;

use boostgrid_core::{ErrorKind, Priority, RecoveryConfig};

use crate::action::RecoveryAction;
use crate::classify::Classification;

/// A named, ordered action list with its retry budget.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecoveryStrategy {
    pub name: &'static str,
    pub actions: Vec<RecoveryAction>,
    pub max_retries: u32,
    /// Base delay for the backoff schedule.
    pub retry_delay: Duration,
}

impl RecoveryStrategy {
    /// Sleep before `attempt` (zero-based). Attempt 0 runs immediately.
    pub fn delay_for(&self, attempt: u32, config: &RecoveryConfig) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        backoff_delay(
            self.retry_delay,
            config.backoff_multiplier,
            attempt,
            config.max_retry_delay(),
        )
    }
}

/// `min(base × multiplier^attempt, max)`.
pub fn backoff_delay(base: Duration, multiplier: f64, attempt: u32, max: Duration) -> Duration {
    let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
    let scaled = base.as_secs_f64() * multiplier.powi(exponent);
    if !scaled.is_finite() || scaled >= max.as_secs_f64() {
        return max;
    }
    Duration::from_secs_f64(scaled)
}

/// Pick the strategy for a classified error.
///
/// Urgent tasks get half the retry budget (at least one) and half the delay.
pub fn select_strategy(
    classification: &Classification,
    priority: Priority,
    config: &RecoveryConfig,
) -> RecoveryStrategy {
    use RecoveryAction as A;

    let default_budget = config.max_retries;
    let (name, actions, max_retries) = match classification.error_type {
        ErrorKind::Panic => (
            "panic_recovery",
            vec![A::RestartInstance, A::ClearMemory, A::ValidateState],
            default_budget,
        ),
        ErrorKind::MemoryError => (
            "memory_recovery",
            vec![A::IncreaseMemory, A::CleanupCache, A::RestartInstance],
            default_budget,
        ),
        ErrorKind::StackOverflow => (
            "stack_overflow_recovery",
            vec![A::ClearMemory, A::IncreaseMemory, A::RestartInstance],
            default_budget,
        ),
        ErrorKind::Timeout => (
            "timeout_recovery",
            vec![
                A::ExtendTimeout,
                A::OptimizeExecution,
                A::Unrecognized("retry_with_adjustments".to_string()),
            ],
            default_budget.saturating_sub(1).max(1),
        ),
        ErrorKind::CompilationError => (
            "compilation_recovery",
            vec![A::ValidateInput, A::FallbackToInterpreter],
            1,
        ),
        ErrorKind::TypeError | ErrorKind::ReferenceError | ErrorKind::RangeError => (
            "runtime_recovery",
            vec![A::ValidateInput, A::ValidateState, A::EnableSafeMode],
            default_budget,
        ),
        ErrorKind::ConnectionError => (
            "connection_recovery",
            vec![A::Reconnect, A::ValidateEndpoint],
            default_budget,
        ),
        ErrorKind::ResourceError => (
            "resource_recovery",
            vec![A::CleanupCache, A::ClearMemory],
            default_budget,
        ),
        ErrorKind::Unknown => (
            "default_recovery",
            vec![A::ValidateState, A::EnableSafeMode],
            default_budget,
        ),
    };

    let mut strategy = RecoveryStrategy {
        name,
        actions,
        max_retries,
        retry_delay: config.retry_delay(),
    };
    if priority == Priority::Urgent {
        strategy.max_retries = (strategy.max_retries / 2).max(1);
        strategy.retry_delay /= 2;
    }
    strategy
}
