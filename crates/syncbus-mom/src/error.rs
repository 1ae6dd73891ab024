//! Error types for the dispatch layer.

use thiserror::Error;

/// Errors raised by a [`crate::transport::Transport`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Publish failed on {topic}: {reason}")]
    PublishFailed { topic: String, reason: String },

    #[error("Subscribe failed on {topic}: {reason}")]
    SubscribeFailed { topic: String, reason: String },
}

/// Errors raised while encoding or decoding wire messages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Unknown content type: {0}")]
    UnknownContentType(String),

    #[error("Invalid header {key}: {value}")]
    InvalidHeader { key: String, value: String },

    #[error("Missing header: {0}")]
    MissingHeader(&'static str),

    #[error("Invalid utf-8 payload")]
    InvalidUtf8,

    #[error("Decompression failed: {0}")]
    Decompression(String),

    #[error("Body of {size} bytes exceeds the {max} byte limit")]
    TooLarge { size: usize, max: usize },

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for CodecError {
    fn from(err: serde_json::Error) -> Self {
        CodecError::Serialization(err.to_string())
    }
}

/// Errors surfaced by the [`crate::Dispatcher`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("Already subscribed to {0}")]
    AlreadySubscribed(String),

    #[error("Echo requested on {0} but the topic is not subscribed with echo allowed")]
    EchoNotSubscribed(String),

    #[error("Response requested but reply topic {0} is not subscribed")]
    ReplyToNotSubscribed(String),

    #[error("Response requested without a reply topic")]
    MissingReplyTo,

    #[error("Timed out waiting for {kind} to message {message_id} on {topic}")]
    CallbackTimeout {
        kind: CallbackKind,
        message_id: String,
        topic: String,
    },

    #[error("Pending {kind} for message {message_id} was cancelled")]
    Cancelled {
        kind: CallbackKind,
        message_id: String,
    },

    #[error("Dispatcher is destroyed")]
    Destroyed,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

impl DispatchError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, DispatchError::CallbackTimeout { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, DispatchError::Cancelled { .. })
    }
}

/// Which correlation registry a pending callback lives in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CallbackKind {
    Echo,
    Response,
}

impl std::fmt::Display for CallbackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallbackKind::Echo => write!(f, "echo"),
            CallbackKind::Response => write!(f, "response"),
        }
    }
}

pub type Result<T> = std::result::Result<T, DispatchError>;
