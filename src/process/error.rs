//! Process registry and supervision errors

use crate::core::error_handling::ContextualError;
use crate::process::record::ProcessStatus;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Process registry I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt process record {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("Process '{id}' is not registered")]
    NotRegistered { id: String },

    #[error("Process '{id}' cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: ProcessStatus,
        to: ProcessStatus,
    },

    #[error("Failed to spawn consumer process: {0}")]
    Spawn(String),

    #[error("Restart budget exhausted: {restarts} restarts within {window_secs}s")]
    RestartBudgetExhausted { restarts: u32, window_secs: u64 },

    #[error("Process registry lock poisoned: {0}")]
    Lock(String),
}

impl ProcessError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ProcessError::Io {
            path: path.into(),
            source,
        }
    }
}

impl ContextualError for ProcessError {
    fn is_user_actionable(&self) -> bool {
        matches!(self, ProcessError::Spawn(_))
    }

    fn user_message(&self) -> Option<&str> {
        match self {
            ProcessError::Spawn(message) => Some(message),
            _ => None,
        }
    }
}

pub type ProcessResult<T> = Result<T, ProcessError>;
