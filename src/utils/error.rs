//! The `error` module defines the error types used within the `relaymq` application.
//!
//! Each layer gets its own enum so callers can tell a transient broker outage
//! (`QueueError::Connection`, `QueueError::Closed`) apart from a poison payload
//! (`DecodeError`) or a protocol misuse reported by the broker (`BrokerError`).

use thiserror::Error;

/// Errors raised by the queue client while talking to the broker.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The broker could not be reached or the WebSocket handshake failed.
    #[error("broker connection failed: {0}")]
    Connection(String),

    /// The broker rejected the configured credentials.
    #[error("broker rejected credentials: {0}")]
    Auth(String),

    /// The broker answered a request with an `error` frame.
    #[error("broker error: {0}")]
    Broker(String),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// The connection was closed while a request or subscription was active.
    #[error("broker connection closed")]
    Closed,

    #[error("client already has an active subscription")]
    AlreadyConsuming,

    /// A frame could not be encoded, or the broker sent something unexpected.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl QueueError {
    /// Whether the error means the connection is unusable and must be reopened.
    pub fn is_connection_level(&self) -> bool {
        matches!(
            self,
            QueueError::Connection(_) | QueueError::Closed | QueueError::Timeout(_)
        )
    }
}

/// Errors produced when a payload cannot be turned back into a `Message`.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed message payload: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("message content is blank")]
    BlankContent,
}

/// Errors reported by the broker engine for a single session request.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BrokerError {
    #[error("queue '{0}' is not declared")]
    UnknownQueue(String),

    #[error("unknown delivery tag {0}")]
    UnknownDeliveryTag(u64),

    #[error("session '{0}' is not registered")]
    UnknownSession(String),

    #[error("session is already consuming from '{0}'")]
    AlreadyConsuming(String),

    #[error("connection limit of {0} reached")]
    TooManyConnections(usize),
}

/// Errors from the dead-letter store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
