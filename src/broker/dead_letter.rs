//! Dead letter queue
//!
//! Messages whose handler kept failing are written to a shadow destination
//! named `{prefix}.{original_topic}`, together with the error detail and retry
//! bookkeeping. Writing is best effort: a failed dead-letter write is logged and
//! counted, never returned to the consumer loop.
//!
//! Reading a record back and re-publishing it is an explicit operation
//! ([`DeadLetterQueue::replay`]); nothing replays automatically.

use crate::broker::error::{BrokerError, BrokerResult};
use crate::broker::message::Message;
use crate::broker::traits::{BrokerInterface, HandlerError, RawPublisher};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Upper bound for any computed retry delay
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

const JITTER_RATIO: f64 = 0.1;

#[derive(Debug, Clone)]
pub struct DeadLetterConfig {
    pub enabled: bool,
    pub prefix: String,
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            prefix: "dlq".to_string(),
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterError {
    pub message: String,
    #[serde(default)]
    pub code: Option<String>,
    pub class: String,
    #[serde(default)]
    pub trace: Option<String>,
}

impl From<&HandlerError> for DeadLetterError {
    fn from(err: &HandlerError) -> Self {
        Self {
            message: err.message.clone(),
            code: err.code.clone(),
            class: err.class.clone(),
            trace: err.trace.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DlqMetadata {
    pub retry_count: u32,
    pub max_retries: u32,
    pub can_retry: bool,
    pub failed_at: DateTime<Utc>,
    /// `host:pid` of the consumer that gave up
    pub consumer_id: String,
}

/// Dead-letter wire payload
///
/// The original envelope fields sit at the top level, next to `error` and
/// `dlq_metadata`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    #[serde(flatten)]
    pub message: Message,
    pub original_topic: String,
    pub error: DeadLetterError,
    pub dlq_metadata: DlqMetadata,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

impl DeadLetterRecord {
    pub fn to_json(&self) -> BrokerResult<String> {
        serde_json::to_string(self).map_err(|e| BrokerError::MessageFormat {
            reason: e.to_string(),
        })
    }

    pub fn from_json(payload: &str) -> BrokerResult<Self> {
        serde_json::from_str(payload).map_err(|e| BrokerError::MessageFormat {
            reason: format!("not a dead-letter record: {}", e),
        })
    }

    /// Rebuild the original message for a retry
    pub fn into_retry_message(self) -> Message {
        self.message
    }
}

/// Retry delay without jitter: `base * 2^retry_count`, capped at 60s
pub fn base_retry_delay(retry_count: u32, base_delay: Duration) -> Duration {
    let factor = 2u64.saturating_pow(retry_count.min(32));
    let millis = (base_delay.as_millis() as u64).saturating_mul(factor);
    Duration::from_millis(millis).min(MAX_RETRY_DELAY)
}

/// Retry delay with ±10% jitter, never above 60s
pub fn retry_delay(retry_count: u32, base_delay: Duration) -> Duration {
    let base = base_retry_delay(retry_count, base_delay).as_millis() as f64;
    let jitter = rand::thread_rng().gen_range(-JITTER_RATIO..=JITTER_RATIO);
    let millis = (base * (1.0 + jitter)).max(0.0) as u64;
    Duration::from_millis(millis).min(MAX_RETRY_DELAY)
}

pub struct DeadLetterQueue {
    config: DeadLetterConfig,
    publisher: Arc<dyn RawPublisher>,
    consumer_id: String,
    sent: AtomicU64,
    failed: AtomicU64,
}

impl std::fmt::Debug for DeadLetterQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadLetterQueue")
            .field("prefix", &self.config.prefix)
            .field("max_retries", &self.config.max_retries)
            .field("sent", &self.sent_count())
            .field("failed", &self.failed_count())
            .finish()
    }
}

impl DeadLetterQueue {
    pub fn new(config: DeadLetterConfig, publisher: Arc<dyn RawPublisher>) -> Self {
        let host = sysinfo::System::host_name().unwrap_or_else(|| "unknown".to_string());
        Self {
            config,
            publisher,
            consumer_id: format!("{}:{}", host, std::process::id()),
            sent: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &DeadLetterConfig {
        &self.config
    }

    /// Destination for dead letters of `original_topic`
    pub fn dlq_topic(&self, original_topic: &str) -> String {
        format!("{}.{}", self.config.prefix, original_topic)
    }

    /// Write a dead letter; returns `false` when the write failed
    pub async fn send(
        &self,
        original_topic: &str,
        message: &Message,
        error: &HandlerError,
        retry_count: u32,
        metadata: BTreeMap<String, Value>,
    ) -> bool {
        let record = DeadLetterRecord {
            message: message.clone(),
            original_topic: original_topic.to_string(),
            error: DeadLetterError::from(error),
            dlq_metadata: DlqMetadata {
                retry_count,
                max_retries: self.config.max_retries,
                can_retry: self.should_retry(retry_count),
                failed_at: Utc::now(),
                consumer_id: self.consumer_id.clone(),
            },
            metadata,
        };
        let destination = self.dlq_topic(original_topic);

        let payload = match record.to_json() {
            Ok(payload) => payload,
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                log::error!("Could not encode dead letter for {}: {}", message.id(), e);
                return false;
            }
        };

        match self
            .publisher
            .publish_raw(&destination, Some(message.id()), &payload)
            .await
        {
            Ok(_) => {
                self.sent.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "Message {} dead-lettered to '{}' after {} retries: {}",
                    message.id(),
                    destination,
                    retry_count,
                    error
                );
                true
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                log::error!(
                    "Dead-letter write of message {} to '{}' failed: {}",
                    message.id(),
                    destination,
                    e
                );
                false
            }
        }
    }

    pub fn should_retry(&self, retry_count: u32) -> bool {
        retry_count < self.config.max_retries
    }

    pub fn get_retry_delay(&self, retry_count: u32, base_delay: Duration) -> Duration {
        retry_delay(retry_count, base_delay)
    }

    /// Re-publish a dead-lettered message to its original channel
    pub async fn replay(
        &self,
        record: DeadLetterRecord,
        broker: &dyn BrokerInterface,
    ) -> BrokerResult<()> {
        let message = record.into_retry_message();
        let channel = message.channel().to_string();
        log::info!("Replaying dead-lettered message {} to '{}'", message.id(), channel);
        broker.publish(&channel, message).await
    }

    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn failed_count(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}
