//! boostgrid-pool — the booster instance pool.
//!
//! Owns every booster instance and is the only writer of instance status
//! and counters. The pool:
//!
//! - Scores available instances against task-derived requirements
//! - Queues requests FIFO when nothing is free and scale-up is not possible
//! - Scales up above 80% utilization and down below 30%, with one shared
//!   cooldown for both directions
//! - Probes instance health and resets zombies that hold a task past
//!   `instance_timeout`
//! - Periodically persists a best-effort snapshot to the coordination store
//!
//! # Architecture
//!
//! ```text
//! InstancePool (Clone — Arc<PoolInner>)
//!   ├── InstanceDriver (launch / probe / terminate)
//!   ├── StateStore (snapshot persistence, event publishing)
//!   └── Mutex<PoolState>
//!       ├── Vec<Instance> (creation order, used for score ties)
//!       ├── VecDeque<PendingRequest> (oneshot responders)
//!       └── last_scaling (shared cooldown timestamp)
//! ```

pub mod error;
pub mod health;
pub mod instance;
pub mod pool;
pub mod scorer;
pub mod stats;

#[cfg(test)]
mod testing;

pub use error::{PoolError, PoolResult};
pub use health::HealthReport;
pub use instance::{Binding, Instance, InstanceRecord, InstanceStatus, PerformanceSample, PerformanceStats};
pub use pool::{
    Acquisition, InstanceLease, InstancePool, PendingTicket, TicketWait, INSTANCE_INDEX_KEY,
    POOL_STATE_KEY,
};
pub use scorer::{AcquireRequirements, ScoreBreakdown};
pub use stats::{PoolSnapshot, PoolStats, ScalingDirection, ScalingEvent};
