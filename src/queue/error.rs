//! Queue Error Types

use crate::core::error_handling::ContextualError;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Queue is full (capacity: {capacity})")]
    QueueFull { capacity: usize },

    #[error("Queue is draining; new messages are rejected")]
    Draining,

    #[error("Invalid queue capacity {capacity}: {reason}")]
    InvalidCapacity { capacity: usize, reason: String },

    #[error("Payload of {size} bytes exceeds slot size {max}")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Shared queue segment {path}: {reason}")]
    Segment { path: String, reason: String },

    #[error("Operation failed: {message}")]
    OperationFailed { message: String },
}

impl QueueError {
    pub fn segment(path: &std::path::Path, reason: impl std::fmt::Display) -> Self {
        QueueError::Segment {
            path: path.display().to_string(),
            reason: reason.to_string(),
        }
    }
}

impl ContextualError for QueueError {
    fn is_user_actionable(&self) -> bool {
        matches!(
            self,
            QueueError::InvalidCapacity { .. } | QueueError::Segment { .. }
        )
    }

    fn user_message(&self) -> Option<&str> {
        match self {
            QueueError::InvalidCapacity { reason, .. } => Some(reason),
            QueueError::Segment { reason, .. } => Some(reason),
            _ => None,
        }
    }
}

/// Result type for queue operations
pub type QueueResult<T> = Result<T, QueueError>;
