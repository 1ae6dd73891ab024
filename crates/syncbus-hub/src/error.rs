//! Error types for the coordination hub.

use syncbus_mom::{CodecError, DispatchError};
use syncbus_store::StoreError;
use thiserror::Error;

/// Errors raised by a [`crate::PersistenceAdapter`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PersistenceError {
    #[error("State {0} not found in storage")]
    NotFound(String),

    #[error("State has no _id")]
    MissingId,

    #[error("Storage I/O failed: {0}")]
    Io(String),

    #[error("Invalid stored state: {0}")]
    Json(String),
}

impl From<std::io::Error> for PersistenceError {
    fn from(err: std::io::Error) -> Self {
        PersistenceError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for PersistenceError {
    fn from(err: serde_json::Error) -> Self {
        PersistenceError::Json(err.to_string())
    }
}

/// Errors surfaced by a [`crate::SyncHub`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HubError {
    #[error("No state factory registered for type {0}")]
    UnknownType(String),

    #[error("Leader election gave up after {0} rounds")]
    ElectionExhausted(usize),

    #[error("Hub is destroyed")]
    Destroyed,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),
}

impl From<CodecError> for HubError {
    fn from(err: CodecError) -> Self {
        HubError::Dispatch(DispatchError::Codec(err))
    }
}

pub type Result<T> = std::result::Result<T, HubError>;
