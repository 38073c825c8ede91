//! Backend client seams
//!
//! Drivers only talk to their backend through these traits. Each trait mirrors
//! the delivery model of one backend family:
//!
//! - [`StreamLogClient`]: append-only streams with consumer groups, a pending
//!   entries list and explicit acknowledgement
//! - [`PubSubClient`]: partitioned topics, group membership with partition
//!   assignment and committed offsets
//! - [`AmqpClient`]: exchanges, bound queues, prefetch-bounded deliveries with
//!   ack/nack
//!
//! The in-process implementations model those semantics closely enough for the
//! drivers to run unchanged against them; network clients plug in by
//! implementing the same traits.

pub mod memory_amqp;
pub mod memory_pubsub;
pub mod memory_stream;

use crate::broker::error::BackendError;
use crate::broker::traits::RawPublisher;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

pub use memory_amqp::MemoryAmqpBroker;
pub use memory_pubsub::MemoryPubSubCluster;
pub use memory_stream::MemoryStreamLog;

pub type BackendResult<T> = Result<T, BackendError>;

/// Where a new stream consumer group starts reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupStart {
    /// Only entries appended after creation (`$`)
    Latest,
    /// Every retained entry (`0`)
    Earliest,
    /// Entries appended at or after this epoch-millisecond instant
    Since(u64),
}

/// One entry of a stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: String,
    pub fields: BTreeMap<String, String>,
}

impl StreamEntry {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// An entry delivered to a group consumer but not yet acknowledged
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub id: String,
    pub consumer: String,
    pub idle: Duration,
    pub deliveries: u32,
}

#[async_trait]
pub trait StreamLogClient: RawPublisher {
    async fn ping(&self) -> BackendResult<()>;

    /// Append an entry, trimming the stream to `max_len` when given
    async fn append(
        &self,
        stream: &str,
        fields: BTreeMap<String, String>,
        max_len: Option<usize>,
    ) -> BackendResult<String>;

    /// Append many entries in one round trip; each item succeeds or fails alone
    async fn append_pipeline(
        &self,
        entries: Vec<(String, BTreeMap<String, String>)>,
        max_len: Option<usize>,
    ) -> BackendResult<Vec<BackendResult<String>>>;

    /// Create a consumer group (and the stream if missing); existing groups are left as is
    async fn create_group(&self, stream: &str, group: &str, start: GroupStart) -> BackendResult<()>;

    /// Read new entries for `consumer`, waiting up to `block` when none are ready
    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        streams: &[String],
        count: usize,
        block: Duration,
    ) -> BackendResult<Vec<(String, StreamEntry)>>;

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> BackendResult<usize>;

    async fn pending(&self, stream: &str, group: &str) -> BackendResult<Vec<PendingEntry>>;

    /// Transfer pending entries idle for at least `min_idle` to `consumer`
    async fn claim_idle(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> BackendResult<Vec<StreamEntry>>;

    async fn len(&self, stream: &str) -> BackendResult<usize>;

    async fn streams(&self) -> BackendResult<Vec<String>>;
}

/// A record fetched from a partitioned topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubSubRecord {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
    pub key: Option<String>,
    pub payload: String,
}

#[async_trait]
pub trait PubSubClient: RawPublisher {
    async fn ping(&self) -> BackendResult<()>;

    /// Create a topic with `partitions` partitions if it does not exist
    async fn ensure_topic(&self, topic: &str, partitions: u32) -> BackendResult<()>;

    /// Produce a record; returns `(partition, offset)`
    async fn produce(
        &self,
        topic: &str,
        key: Option<&str>,
        partition: Option<u32>,
        payload: &str,
    ) -> BackendResult<(u32, u64)>;

    /// Wait for outstanding produce requests
    async fn flush(&self, timeout: Duration) -> BackendResult<()>;

    async fn list_topics(&self) -> BackendResult<Vec<String>>;

    /// Join `group`, triggering a rebalance across its members
    async fn join_group(&self, group: &str, member: &str, topics: &[String]) -> BackendResult<()>;

    async fn leave_group(&self, group: &str, member: &str) -> BackendResult<()>;

    /// Partitions currently assigned to `member`
    async fn assignment(&self, group: &str, member: &str) -> BackendResult<Vec<(String, u32)>>;

    /// Fetch up to `max` records from the member's partitions, waiting up to `timeout`
    async fn poll(
        &self,
        group: &str,
        member: &str,
        max: usize,
        timeout: Duration,
    ) -> BackendResult<Vec<PubSubRecord>>;

    /// Commit the next offset to read for each `(topic, partition)`
    async fn commit(&self, group: &str, offsets: &[(String, u32, u64)]) -> BackendResult<()>;

    async fn committed(&self, group: &str, topic: &str, partition: u32) -> BackendResult<Option<u64>>;
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    serde::Deserialize,
    serde::Serialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ExchangeKind {
    Direct,
    #[default]
    Topic,
    Fanout,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AmqpProperties {
    pub message_id: Option<String>,
    pub persistent: bool,
    pub content_type: Option<String>,
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub payload: String,
    pub properties: AmqpProperties,
}

#[async_trait]
pub trait AmqpClient: RawPublisher {
    async fn ping(&self) -> BackendResult<()>;

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind, durable: bool) -> BackendResult<()>;

    async fn declare_queue(&self, name: &str, durable: bool) -> BackendResult<()>;

    async fn bind_queue(&self, queue: &str, exchange: &str, binding_key: &str) -> BackendResult<()>;

    async fn unbind_queue(&self, queue: &str, exchange: &str, binding_key: &str) -> BackendResult<()>;

    /// Publish to an exchange; the empty exchange routes straight to the queue
    /// named by `routing_key`
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &str,
        properties: AmqpProperties,
    ) -> BackendResult<()>;

    /// Start a consumer on `queue` with at most `prefetch` unacked deliveries
    async fn consume(&self, queue: &str, consumer_tag: &str, prefetch: u16) -> BackendResult<()>;

    /// Deliveries for `consumer_tag`, waiting up to `timeout` when none are ready
    async fn next_deliveries(
        &self,
        consumer_tag: &str,
        max: usize,
        timeout: Duration,
    ) -> BackendResult<Vec<Delivery>>;

    async fn ack(&self, consumer_tag: &str, delivery_tag: u64) -> BackendResult<()>;

    async fn nack(&self, consumer_tag: &str, delivery_tag: u64, requeue: bool) -> BackendResult<()>;

    /// Stop a consumer; its unacked deliveries are requeued
    async fn cancel(&self, consumer_tag: &str) -> BackendResult<()>;

    async fn queue_len(&self, queue: &str) -> BackendResult<usize>;
}

/// Outage switch shared by the in-process backends
#[derive(Debug)]
pub(crate) struct Availability {
    available: AtomicBool,
    name: &'static str,
}

impl Availability {
    pub(crate) fn new(name: &'static str) -> Self {
        Self {
            available: AtomicBool::new(true),
            name,
        }
    }

    pub(crate) fn set(&self, available: bool) {
        self.available.store(available, Ordering::Release);
        log::debug!(
            "In-process {} backend marked {}",
            self.name,
            if available { "available" } else { "unavailable" }
        );
    }

    pub(crate) fn check(&self) -> BackendResult<()> {
        if self.available.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(BackendError::Unavailable(format!(
                "{} backend is unreachable",
                self.name
            )))
        }
    }
}
