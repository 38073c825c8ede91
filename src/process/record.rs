//! Consumer process records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Lifecycle of a consumer process
///
/// `Starting → Running → Stopping → Stopped | Failed`; any live state may
/// jump straight to `Failed`. `Stopped` and `Failed` are terminal.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ProcessStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl ProcessStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ProcessStatus::Stopped | ProcessStatus::Failed)
    }

    /// Whether `next` is a legal successor; re-asserting the current live state is allowed
    pub fn can_transition_to(self, next: ProcessStatus) -> bool {
        use ProcessStatus::*;
        match (self, next) {
            (from, to) if from == to => !from.is_terminal(),
            (Starting, Running | Stopping | Failed) => true,
            (Running, Stopping | Failed) => true,
            (Stopping, Stopped | Failed) => true,
            _ => false,
        }
    }
}

/// Registry entry for one consumer process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerProcessRecord {
    pub id: String,
    pub pid: u32,
    pub host: String,
    pub driver: String,
    pub handler: String,
    pub channels: Vec<String>,
    pub status: ProcessStatus,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    #[serde(default)]
    pub messages_processed: u64,
    #[serde(default)]
    pub messages_failed: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<DateTime<Utc>>,
}

impl ConsumerProcessRecord {
    /// Time since the last persisted heartbeat (zero if it lies in the future)
    pub fn heartbeat_age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_heartbeat).to_std().unwrap_or_default()
    }

    /// A live record that has been silent longer than `liveness_timeout`
    ///
    /// Advisory only: the process may simply be stuck in a long handler.
    pub fn is_suspect(&self, now: DateTime<Utc>, liveness_timeout: Duration) -> bool {
        !self.status.is_terminal() && self.heartbeat_age(now) > liveness_timeout
    }

    /// Status as shown by listings: `dead?` for suspect records
    pub fn display_status(&self, now: DateTime<Utc>, liveness_timeout: Duration) -> String {
        if self.is_suspect(now, liveness_timeout) {
            "dead?".to_string()
        } else {
            self.status.to_string()
        }
    }
}
