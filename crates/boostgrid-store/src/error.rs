//! Errors raised by the coordination store.

use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

/// Failure opening the backing database or moving data in and out of it.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cannot open coordination store: {0}")]
    Open(String),

    #[error("store transaction failed: {0}")]
    Transaction(String),

    #[error("store table unavailable: {0}")]
    Table(String),

    #[error("store access failed: {0}")]
    Storage(String),

    #[error("cannot encode value: {0}")]
    Encode(String),

    #[error("cannot decode stored value: {0}")]
    Decode(String),
}
