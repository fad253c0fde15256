//! boostgrid-core — shared vocabulary for the BoostGrid task accelerator.
//!
//! Everything the pool, the recovery handler, and the coordinator need to
//! agree on lives here:
//!
//! - **Types**: `Task`, `Target`, `ExecutionOutput`, `ExecutionError`
//! - **Events**: the `BoostEvent` enum published on the coordination channel
//! - **Configuration**: `BoostConfig`, loadable from TOML
//! - **Collaborators**: the router, execution providers, and instance driver
//!   traits implemented outside the core
//! - **Background tasks**: a shutdown-aware handle for periodic loops

pub mod config;
pub mod event;
pub mod provider;
pub mod tasks;
pub mod time;
pub mod types;

pub use config::{BoostConfig, ConfigError, CoordinatorConfig, PoolConfig, RecoveryConfig};
pub use event::{BoostEvent, RecoverySignal, EVENTS_CHANNEL, FALLBACK_CHANNEL, RECOVERY_CHANNEL};
pub use provider::{BoosterProvider, BoxFuture, GeneralProvider, InstanceDriver, TaskRouter};
pub use tasks::BackgroundTasks;
pub use types::*;
