//! Pool error types.

use thiserror::Error;

use boostgrid_core::InstanceId;

/// Errors that can occur during pool operations.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("failed to launch instance {instance_id}: {reason}")]
    LaunchFailed {
        instance_id: InstanceId,
        reason: String,
    },

    #[error("unknown instance: {0}")]
    UnknownInstance(InstanceId),

    #[error("instance is busy: {0}")]
    InstanceBusy(InstanceId),

    #[error("pool cannot shrink below {min} instances")]
    BelowMinimum { min: usize },

    #[error("state store error: {0}")]
    Store(#[from] boostgrid_store::StoreError),
}

pub type PoolResult<T> = Result<T, PoolError>;
