//! Coordinator error types.
//!
//! Only pre-flight rejections are errors. Anything that goes wrong after a
//! task is registered is reported through `TaskOutcome`.

use thiserror::Error;

use boostgrid_pool::PoolError;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("invalid task: {0}")]
    Validation(String),

    #[error("at capacity: {active} active executions (limit {limit})")]
    AtCapacity { active: usize, limit: usize },

    #[error("pool error: {0}")]
    Pool(#[from] PoolError),
}

pub type CoordinatorResult<T> = Result<T, CoordinatorError>;
