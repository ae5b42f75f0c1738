//! Error types shared across the bridge.
//!
//! Store failures are kept separate from the higher level [`BridgeError`] so
//! periodic tasks can match on them and skip a cycle without caring about the
//! rest of the taxonomy.

use std::time::Duration;

/// Failures talking to the shared store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    #[error("Store operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("Unexpected store reply: {0}")]
    Protocol(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
            StoreError::Unavailable(err.to_string())
        } else if err.is_timeout() {
            StoreError::Timeout(Duration::ZERO)
        } else {
            StoreError::Protocol(err.to_string())
        }
    }
}

/// Top level error for registry, bus and runtime operations.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Malformed message on {channel}: {reason}")]
    MalformedMessage { channel: String, reason: String },
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Subscription gave up after {attempts} failed attempts: {last_error}")]
    SubscriptionExhausted { attempts: u32, last_error: String },
    #[error("Proxy error: {0}")]
    Proxy(#[from] ProxyError),
}

impl BridgeError {
    /// Shorthand for [`BridgeError::MalformedMessage`].
    pub fn malformed(channel: impl Into<String>, reason: impl Into<String>) -> Self {
        BridgeError::MalformedMessage {
            channel: channel.into(),
            reason: reason.into(),
        }
    }
}

/// Returned by the proxy collaborator when it cannot carry out a request.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("Unknown backend: {0}")]
    UnknownBackend(String),
    #[error("Player not connected: {0}")]
    NotConnected(String),
    #[error("Proxy operation failed: {0}")]
    Failed(String),
}

/// Error a bus handler reports back to the dispatcher.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("Handler rejected payload: {0}")]
    InvalidPayload(String),
    #[error("Handler failed: {0}")]
    Failed(String),
}
