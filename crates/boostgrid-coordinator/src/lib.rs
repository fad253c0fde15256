//! boostgrid-coordinator — the task routing coordinator.
//!
//! Composes the external router and execution providers with the instance
//! pool and the error handler:
//!
//! ```text
//! execute(task)
//!   validate ─ capacity gate ─ register (task_started)
//!   route (≤ max_routing_retries reroutes)
//!   ├── general ─ run ─────────────────────────────────┐
//!   └── booster ─ acquire (queue → wait → retry)        │
//!                 run in instance                       │
//!                 on error: ErrorHandler::handle        │
//!                 release(sample)                       │
//!                 fallback ⇒ general path ──────────────┤
//!                                                       ▼
//!                             task_completed | task_failed
//! ```
//!
//! Background loops: stuck-task sweep, monitoring updates, recovery-signal
//! forwarding, plus the pool's health and persistence loops.

pub mod coordinator;
pub mod error;
pub mod stats;

pub use coordinator::{ActiveTask, Coordinator, Providers, TaskOutcome};
pub use error::{CoordinatorError, CoordinatorResult};
pub use stats::{CoordinatorStats, CoordinatorStatus, SystemStatus};
