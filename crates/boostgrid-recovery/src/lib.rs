//! boostgrid-recovery — error classification, recovery, and fallback.
//!
//! # Flow
//!
//! ```text
//! handle(error, ctx)
//!   ├── classify (typed kind, message shim, repeated-failure pattern)
//!   ├── record (bounded history, stats, store list, error_handled event)
//!   ├── non-recoverable or pattern hit ─────────────────┐
//!   └── select_strategy → recover                        │
//!         for attempt in 0..budget:                      │
//!           sleep(min(base × mult^attempt, max))         │
//!           run actions (each fallible, never fatal)     │
//!           retry() → Ok ⇒ recovery_success              │
//!         exhausted ⇒ recovery_failed ───────────────────┤
//!                                                        ▼
//!                                             activate_fallback (once)
//! ```
//!
//! The handler never mutates instance state. Instance-facing actions are
//! published as recovery signals for the pool to apply.

pub mod action;
pub mod classify;
pub mod context;
pub mod handler;
pub mod history;
pub mod strategy;

pub use action::{ActionResult, Adjustments, RecoveryAction};
pub use classify::{classify_kind, Classification, ErrorCategory, ErrorProfile};
pub use context::{RecoveryContext, RetryFn};
pub use handler::{
    select_fallback_target, ErrorHandler, FallbackSelection, RecoveryOutcome, ERRORS_LIST_KEY,
    FALLBACK_DEFAULT, FALLBACK_FAST, FALLBACK_MEMORY_EFFICIENT,
};
pub use history::{ErrorRecord, ErrorStats};
pub use strategy::{backoff_delay, select_strategy, RecoveryStrategy};
