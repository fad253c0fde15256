//! Recovery action catalogue.
//!
//! Every action is independently fallible. A failed action is logged and
//! reported, but never aborts the strategy. `restart_instance`,
//! `clear_memory` and `reconnect` are published as [`RecoverySignal`]s; the
//! pool is the only writer of instance state.

use std::fmt;

use serde::{Serialize, Serializer};
use tracing::{debug, warn};

use boostgrid_core::{BoostEvent, RecoverySignal, RECOVERY_CHANNEL};

use crate::handler::{ErrorHandler, HandlerState};
use crate::history::ErrorRecord;
use crate::RecoveryContext;

/// Allocation and timeout adjustments are capped at this multiple.
const MAX_ADJUSTMENT: f64 = 4.0;
const ADJUSTMENT_STEP: f64 = 1.5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    RestartInstance,
    ClearMemory,
    ValidateState,
    IncreaseMemory,
    CleanupCache,
    ExtendTimeout,
    OptimizeExecution,
    ValidateInput,
    FallbackToInterpreter,
    Reconnect,
    ValidateEndpoint,
    EnableSafeMode,
    /// A name not in the catalogue. Always fails.
    Unrecognized(String),
}

impl RecoveryAction {
    pub fn from_name(name: &str) -> Self {
        match name {
            "restart_instance" => Self::RestartInstance,
            "clear_memory" => Self::ClearMemory,
            "validate_state" => Self::ValidateState,
            "increase_memory" => Self::IncreaseMemory,
            "cleanup_cache" => Self::CleanupCache,
            "extend_timeout" => Self::ExtendTimeout,
            "optimize_execution" => Self::OptimizeExecution,
            "validate_input" => Self::ValidateInput,
            "fallback_to_interpreter" => Self::FallbackToInterpreter,
            "reconnect" => Self::Reconnect,
            "validate_endpoint" => Self::ValidateEndpoint,
            "enable_safe_mode" => Self::EnableSafeMode,
            other => Self::Unrecognized(other.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::RestartInstance => "restart_instance",
            Self::ClearMemory => "clear_memory",
            Self::ValidateState => "validate_state",
            Self::IncreaseMemory => "increase_memory",
            Self::CleanupCache => "cleanup_cache",
            Self::ExtendTimeout => "extend_timeout",
            Self::OptimizeExecution => "optimize_execution",
            Self::ValidateInput => "validate_input",
            Self::FallbackToInterpreter => "fallback_to_interpreter",
            Self::Reconnect => "reconnect",
            Self::ValidateEndpoint => "validate_endpoint",
            Self::EnableSafeMode => "enable_safe_mode",
            Self::Unrecognized(name) => name,
        }
    }
}

impl fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Serialize for RecoveryAction {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

/// Per-instance tuning accumulated by recovery actions.
///
/// Read by execution providers through [`ErrorHandler::adjustments_for`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Adjustments {
    pub memory_multiplier: f64,
    pub timeout_multiplier: f64,
    pub cache_clears: u32,
    pub optimized: bool,
    pub interpreter: bool,
    pub safe_mode: bool,
}

impl Default for Adjustments {
    fn default() -> Self {
        Self {
            memory_multiplier: 1.0,
            timeout_multiplier: 1.0,
            cache_clears: 0,
            optimized: false,
            interpreter: false,
            safe_mode: false,
        }
    }
}

/// Outcome of one executed action.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionResult {
    pub action: String,
    pub success: bool,
}

impl ErrorHandler {
    /// Run one action. Returns whether it succeeded.
    pub(crate) fn execute_action(
        &self,
        state: &mut HandlerState,
        action: &RecoveryAction,
        record: &ErrorRecord,
        ctx: &RecoveryContext,
    ) -> bool {
        let instance_id = ctx.instance_id.as_deref();
        let success = match (action, instance_id) {
            (RecoveryAction::Unrecognized(name), _) => {
                warn!(action = %name, error_id = %record.id, "unrecognized recovery action");
                false
            }
            (
                a @ (RecoveryAction::RestartInstance
                | RecoveryAction::ClearMemory
                | RecoveryAction::Reconnect),
                Some(id),
            ) => {
                let signal = RecoverySignal {
                    action: a.name().to_string(),
                    instance_id: id.to_string(),
                    error_id: record.id.clone(),
                };
                match self.store().publish(RECOVERY_CHANNEL, &signal) {
                    Ok(_) => true,
                    Err(e) => {
                        warn!(action = %a, instance_id = %id, error = %e, "failed to publish recovery signal");
                        false
                    }
                }
            }
            (RecoveryAction::IncreaseMemory, Some(id)) => {
                let adj = state.adjustments.entry(id.to_string()).or_default();
                adj.memory_multiplier = (adj.memory_multiplier * ADJUSTMENT_STEP).min(MAX_ADJUSTMENT);
                true
            }
            (RecoveryAction::ExtendTimeout, Some(id)) => {
                let adj = state.adjustments.entry(id.to_string()).or_default();
                adj.timeout_multiplier = (adj.timeout_multiplier * ADJUSTMENT_STEP).min(MAX_ADJUSTMENT);
                true
            }
            (RecoveryAction::CleanupCache, Some(id)) => {
                state.adjustments.entry(id.to_string()).or_default().cache_clears += 1;
                true
            }
            (RecoveryAction::OptimizeExecution, Some(id)) => {
                state.adjustments.entry(id.to_string()).or_default().optimized = true;
                true
            }
            (RecoveryAction::FallbackToInterpreter, Some(id)) => {
                state.adjustments.entry(id.to_string()).or_default().interpreter = true;
                true
            }
            (RecoveryAction::EnableSafeMode, Some(id)) => {
                state.adjustments.entry(id.to_string()).or_default().safe_mode = true;
                true
            }
            (RecoveryAction::ValidateInput, _) => ctx
                .task
                .as_ref()
                .is_some_and(|task| task.operation_kind().is_some()),
            (RecoveryAction::ValidateState, _) => !record.classification.requires_fallback,
            (RecoveryAction::ValidateEndpoint, id) => id.is_some(),
            (a, None) => {
                debug!(action = %a, "action needs an instance, none in context");
                false
            }
        };

        debug!(action = %action, error_id = %record.id, success, "recovery action executed");
        self.emit(BoostEvent::RecoveryAction {
            error_id: record.id.clone(),
            action: action.name().to_string(),
            instance_id: ctx.instance_id.clone(),
            success,
        });
        success
    }
}
