//! Message envelope
//!
//! The envelope every driver publishes and consumes. It is immutable once
//! built; the wire form is the compact JSON object
//! `{"id","channel","event","data","timestamp"}`.

use crate::broker::error::{BrokerError, BrokerResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Application message
///
/// # Example
///
/// ```rust
/// use relaybus::broker::Message;
/// use serde_json::json;
///
/// let message = Message::new("orders.created", "order_created", json!({"order_id": 17}));
/// let wire = message.to_json().unwrap();
/// let decoded = Message::from_json(&wire).unwrap();
/// assert_eq!(decoded, message);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    id: String,
    channel: String,
    event: String,
    #[serde(default)]
    data: Value,
    timestamp: DateTime<Utc>,
}

impl Message {
    /// Build a message with a fresh id and the current timestamp
    pub fn new(channel: impl Into<String>, event: impl Into<String>, data: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            channel: channel.into(),
            event: event.into(),
            data,
            timestamp: Utc::now(),
        }
    }

    /// Rebuild a message from known parts (replay, tests)
    pub fn from_parts(
        id: impl Into<String>,
        channel: impl Into<String>,
        event: impl Into<String>,
        data: Value,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            channel: channel.into(),
            event: event.into(),
            data,
            timestamp,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn event(&self) -> &str {
        &self.event
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Copy of this message addressed to another logical channel
    pub fn with_channel(&self, channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            ..self.clone()
        }
    }

    /// Serialise to the compact JSON wire form
    pub fn to_json(&self) -> BrokerResult<String> {
        serde_json::to_string(self).map_err(|e| BrokerError::MessageFormat {
            reason: e.to_string(),
        })
    }

    /// Parse the JSON wire form
    pub fn from_json(payload: &str) -> BrokerResult<Self> {
        let message: Message =
            serde_json::from_str(payload).map_err(|e| BrokerError::MessageFormat {
                reason: e.to_string(),
            })?;
        if message.id.is_empty() {
            return Err(BrokerError::MessageFormat {
                reason: "message id is empty".to_string(),
            });
        }
        Ok(message)
    }
}
