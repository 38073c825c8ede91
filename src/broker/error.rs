//! Broker Error Types

use crate::broker::circuit_breaker::{CircuitOpenError, TripsBreaker};
use crate::core::error_handling::ContextualError;
use crate::process::ProcessError;
use crate::queue::QueueError;

/// Failures reported by backend clients
///
/// Every variant is a transport/backend failure, so all of them trip the
/// circuit breaker when they surface through a driver.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Backend operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Backend rejected the request: {0}")]
    Rejected(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal backend error: {0}")]
    Internal(String),
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Driver '{driver}' is not connected")]
    NotConnected { driver: String },

    #[error("Publish to channel '{channel}' failed: {reason}")]
    PublishFailed { channel: String, reason: String },

    #[error("Connection to {endpoint} failed: {reason}")]
    ConnectionFailed { endpoint: String, reason: String },

    #[error("Subscribe to channel '{channel}' failed: {reason}")]
    SubscribeFailed { channel: String, reason: String },

    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),

    #[error("Invalid configuration: {message}")]
    InvalidConfiguration { message: String },

    #[error("Malformed message: {reason}")]
    MessageFormat { reason: String },

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Process(#[from] ProcessError),
}

impl BrokerError {
    pub fn invalid_config(message: impl Into<String>) -> Self {
        BrokerError::InvalidConfiguration {
            message: message.into(),
        }
    }

    pub fn publish_failed(channel: &str, reason: impl std::fmt::Display) -> Self {
        BrokerError::PublishFailed {
            channel: channel.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Transport/backend failures, the only class that trips the breaker and
    /// that callers may retry
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            BrokerError::PublishFailed { .. }
                | BrokerError::ConnectionFailed { .. }
                | BrokerError::SubscribeFailed { .. }
                | BrokerError::Backend(_)
        )
    }

    /// Whether the caller may retry the same operation later
    pub fn is_retryable(&self) -> bool {
        self.is_transport() || matches!(self, BrokerError::CircuitOpen(_))
    }
}

impl TripsBreaker for BrokerError {
    fn trips_breaker(&self) -> bool {
        self.is_transport()
    }
}

impl TripsBreaker for BackendError {
    fn trips_breaker(&self) -> bool {
        true
    }
}

impl From<CircuitOpenError> for BackendError {
    fn from(err: CircuitOpenError) -> Self {
        BackendError::Unavailable(err.to_string())
    }
}

impl ContextualError for BrokerError {
    fn is_user_actionable(&self) -> bool {
        matches!(self, BrokerError::InvalidConfiguration { .. })
    }

    fn user_message(&self) -> Option<&str> {
        match self {
            BrokerError::InvalidConfiguration { message } => Some(message),
            _ => None,
        }
    }
}

pub type BrokerResult<T> = Result<T, BrokerError>;
