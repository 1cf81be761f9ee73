//! Error taxonomy for the Home Assistant core
//!
//! Every failure the core can produce is a distinct variant so the
//! orchestrator can map it to its own protocol codes.

use std::time::Duration;
use thiserror::Error;

/// Core result alias
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors surfaced by the connection, cache and resilience layers
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoreError {
    #[error("Authentication timed out after {0:?}")]
    AuthTimeout(Duration),

    #[error("Authentication rejected: {0}")]
    AuthInvalid(String),

    #[error("Connection lost")]
    ConnectionLost,

    #[error("Not connected")]
    NotConnected,

    #[error("Permanently disconnected after {0} reconnection attempts")]
    PermanentlyDisconnected(u32),

    #[error("Request {id} timed out after {after:?}")]
    Timeout { id: u64, after: Duration },

    #[error("Command failed ({code}): {message}")]
    CommandFailed { code: String, message: String },

    #[error("Circuit breaker is open - retry after {retry_after:?}")]
    CircuitOpen { retry_after: Duration },

    #[error("Command queue is full ({capacity} entries)")]
    QueueFull { capacity: usize },

    #[error("Command expired in queue after {age:?}")]
    Expired { age: Duration },

    #[error("Command queue cleared")]
    QueueCleared,

    #[error("Rate limit exceeded for '{identifier}' - retry after {retry_after:?}")]
    LocalLimitExceeded {
        identifier: String,
        retry_after: Duration,
    },

    #[error("Global rate limit exceeded - retry after {retry_after:?}")]
    GlobalLimitExceeded { retry_after: Duration },

    #[error("Entity cache is stale")]
    CacheStale,

    #[error("Invalid entity id: {0}")]
    InvalidEntityId(String),

    #[error("Service domain '{0}' is blocked")]
    ServiceBlocked(String),

    #[error("Invalid service name: {0}")]
    InvalidServiceName(String),

    #[error("Unknown subscription: {0}")]
    UnknownSubscription(u64),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl CoreError {
    /// Whether the caller may retry the same operation later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionLost
                | Self::NotConnected
                | Self::Timeout { .. }
                | Self::CircuitOpen { .. }
                | Self::LocalLimitExceeded { .. }
                | Self::GlobalLimitExceeded { .. }
                | Self::CacheStale
                | Self::Transport(_)
        )
    }

    /// Whether this failure says the remote is unhealthy.
    ///
    /// Remote rejections (`CommandFailed`) prove the remote answered and do
    /// not count against the circuit breaker.
    pub fn trips_breaker(&self) -> bool {
        matches!(
            self,
            Self::ConnectionLost
                | Self::NotConnected
                | Self::PermanentlyDisconnected(_)
                | Self::Timeout { .. }
                | Self::Transport(_)
        )
    }

    /// Suggested wait before retrying, when the error carries one
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::CircuitOpen { retry_after }
            | Self::LocalLimitExceeded { retry_after, .. }
            | Self::GlobalLimitExceeded { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Protocol(e.to_string())
    }
}
