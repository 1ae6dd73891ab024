//! Error types for the replicated store.

use syncbus_mom::{CodecError, DispatchError};
use thiserror::Error;

/// Errors raised by a [`crate::engine::DocumentEngine`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Malformed update: {0}")]
    Decode(String),

    #[error("Failed to apply update: {0}")]
    Apply(String),

    #[error("Failed to merge updates: {0}")]
    Merge(String),

    #[error("Transaction did not run")]
    Aborted,
}

/// Errors surfaced by a [`crate::SyncStore`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Cannot modify readonly store {0}")]
    ReadonlyState(String),

    #[error("Cannot acquire mutex {lock} in store {store}")]
    Mutex { store: String, lock: String },

    #[error("Store {0} is not initialized")]
    NotInitialized(String),

    #[error("Store {0} is destroyed")]
    Destroyed(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),
}

impl From<CodecError> for StoreError {
    fn from(err: CodecError) -> Self {
        StoreError::Dispatch(DispatchError::Codec(err))
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
