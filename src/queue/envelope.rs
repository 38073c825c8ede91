//! Queued publish record

use crate::core::time::epoch_millis;
use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// A publish waiting in a producer queue
///
/// Owned by the queue until the flush path takes it out; never mutated in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedEnvelope {
    pub topic: String,
    pub payload: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<u32>,
    /// Unix epoch millis at enqueue time
    pub enqueued_at_ms: u64,
}

impl QueuedEnvelope {
    pub fn new(
        topic: impl Into<String>,
        payload: impl Into<String>,
        key: Option<String>,
        partition: Option<u32>,
    ) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            key,
            partition,
            enqueued_at_ms: epoch_millis(SystemTime::now()),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        // Plain strings and integers cannot fail to serialise
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        serde_json::from_slice(bytes).ok()
    }

    /// Time spent queued, relative to `now_ms`
    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.enqueued_at_ms)
    }
}
