//! Partitioned pub/sub driver
//!
//! Consumers join a group and the cluster assigns them partitions. Offsets are
//! committed manually after dispatch, only up to the last settled record of
//! each partition, so a crash redelivers whatever was not yet handled.

use super::common::{ConsumeSource, DriverCore, Fetched, Settlement, SubscriptionTarget};
use crate::broker::backends::PubSubClient;
use crate::broker::error::{BackendError, BrokerError, BrokerResult};
use crate::broker::health::HealthCheckResult;
use crate::broker::message::Message;
use crate::broker::metrics::BrokerMetricsSnapshot;
use crate::broker::traits::{BrokerInterface, LoopObserver, MessageHandler, RawPublisher};
use crate::config::BrokerConfig;
use crate::core::retry::sleep_unless_shutdown;
use crate::core::shutdown::ShutdownCoordinator;
use crate::queue::{QueueSink, QueuedEnvelope};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

struct PubSubSink {
    client: Arc<dyn PubSubClient>,
    flush_timeout: Duration,
}

#[async_trait]
impl QueueSink for PubSubSink {
    async fn send(&self, envelope: &QueuedEnvelope) -> Result<(), BackendError> {
        self.client
            .produce(
                &envelope.topic,
                envelope.key.as_deref(),
                envelope.partition,
                &envelope.payload,
            )
            .await
            .map(|_| ())
    }

    async fn flush_batch(&self) -> Result<(), BackendError> {
        self.client.flush(self.flush_timeout).await
    }
}

/// Position of one fetched record
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RecordPosition {
    topic: String,
    partition: u32,
    offset: u64,
}

/// Offsets to commit: for each partition, one past the end of the leading run
/// of settled records
///
/// Records of a partition arrive in offset order. A requeued record stops the
/// run for its partition so it is redelivered after the next rebalance.
fn committable(settled: &[(RecordPosition, Settlement)]) -> Vec<(String, u32, u64)> {
    let mut next: BTreeMap<(String, u32), u64> = BTreeMap::new();
    let mut blocked: BTreeSet<(String, u32)> = BTreeSet::new();
    for (position, settlement) in settled {
        let partition = (position.topic.clone(), position.partition);
        if blocked.contains(&partition) {
            continue;
        }
        if *settlement == Settlement::Requeue {
            blocked.insert(partition);
            continue;
        }
        next.insert(partition, position.offset + 1);
    }
    next.into_iter()
        .map(|((topic, partition), offset)| (topic, partition, offset))
        .collect()
}

pub struct PubSubDriver {
    core: DriverCore,
    client: Arc<dyn PubSubClient>,
    publisher: Arc<dyn RawPublisher>,
    group: String,
    partitions: u32,
    topics: RwLock<Vec<String>>,
    joined: AtomicBool,
}

impl PubSubDriver {
    pub fn new<C>(config: &BrokerConfig, client: Arc<C>, shutdown: ShutdownCoordinator) -> BrokerResult<Self>
    where
        C: PubSubClient + 'static,
    {
        let publisher: Arc<dyn RawPublisher> = client.clone();
        let client: Arc<dyn PubSubClient> = client;
        let sink = Arc::new(PubSubSink {
            client: Arc::clone(&client),
            flush_timeout: Duration::from_millis(config.pubsub.flush_timeout_ms),
        });
        let core = DriverCore::new("pubsub", config, shutdown, Arc::clone(&publisher), sink)?;

        // Broadcast mode gives every consumer a private group
        let group = if config.pubsub.broadcast {
            format!("{}-{}", core.consumer_group, core.consumer_name)
        } else {
            core.consumer_group.clone()
        };

        Ok(Self {
            core,
            client,
            publisher,
            group,
            partitions: config.pubsub.partitions.max(1),
            topics: RwLock::new(Vec::new()),
            joined: AtomicBool::new(false),
        })
    }

    /// Effective consumer group id
    pub fn group(&self) -> &str {
        &self.group
    }

    fn current_topics(&self) -> Vec<String> {
        self.topics.read().map(|t| t.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ConsumeSource for PubSubDriver {
    type Receipt = RecordPosition;

    async fn prepare(&self, targets: &[SubscriptionTarget]) -> BrokerResult<()> {
        let known = self.client.list_topics().await?;
        let topics = self.core.expand_targets(targets, &known);

        if topics.is_empty() {
            if self.joined.swap(false, Ordering::AcqRel) {
                self.client.leave_group(&self.group, &self.core.consumer_name).await?;
            }
        } else {
            for topic in &topics {
                self.client.ensure_topic(topic, self.partitions).await?;
            }
            self.client
                .join_group(&self.group, &self.core.consumer_name, &topics)
                .await?;
            self.joined.store(true, Ordering::Release);
            let assignment = self
                .client
                .assignment(&self.group, &self.core.consumer_name)
                .await?;
            log::debug!(
                "Pub/sub consumer '{}' in group '{}' assigned {} partition(s) over {:?}",
                self.core.consumer_name,
                self.group,
                assignment.len(),
                topics
            );
        }

        if let Ok(mut current) = self.topics.write() {
            *current = topics;
        }
        Ok(())
    }

    async fn fetch(&self, timeout: Duration, max: usize) -> BrokerResult<Vec<Fetched<Self::Receipt>>> {
        if !self.joined.load(Ordering::Acquire) {
            sleep_unless_shutdown(timeout, &self.core.shutdown).await;
            return Ok(Vec::new());
        }
        let records = self
            .client
            .poll(&self.group, &self.core.consumer_name, max, timeout)
            .await?;
        Ok(records
            .into_iter()
            .map(|record| Fetched {
                receipt: RecordPosition {
                    topic: record.topic.clone(),
                    partition: record.partition,
                    offset: record.offset,
                },
                topic: record.topic,
                key: record.key,
                payload: record.payload,
            })
            .collect())
    }

    async fn settle(&self, settled: Vec<(Self::Receipt, Settlement)>) -> BrokerResult<()> {
        let offsets = committable(&settled);
        if offsets.is_empty() {
            return Ok(());
        }
        self.client.commit(&self.group, &offsets).await?;
        Ok(())
    }

    async fn release(&self) {
        if self.joined.swap(false, Ordering::AcqRel) {
            if let Err(e) = self.client.leave_group(&self.group, &self.core.consumer_name).await {
                log::warn!("Failed to leave group '{}': {}", self.group, e);
            }
        }
    }
}

#[async_trait]
impl BrokerInterface for PubSubDriver {
    fn driver_name(&self) -> &'static str {
        self.core.driver
    }

    async fn connect(&self) -> BrokerResult<()> {
        self.core
            .connect(|| async { self.client.ping().await.map_err(BrokerError::from) })
            .await
    }

    async fn publish(&self, channel: &str, message: Message) -> BrokerResult<()> {
        self.core.publish(channel, message).await
    }

    async fn subscribe(&self, channel: &str, handler: Arc<dyn MessageHandler>) -> BrokerResult<()> {
        self.core.subscribe(channel, handler)
    }

    async fn unsubscribe(&self, channel: &str) -> BrokerResult<()> {
        self.core.unsubscribe(channel)
    }

    async fn consume(&self, poll_timeout: Duration, batch_size: usize) -> BrokerResult<()> {
        self.core.run_consume_loop(self, poll_timeout, batch_size).await
    }

    fn stop_consuming(&self) {
        self.core.stop_consuming();
    }

    fn is_connected(&self) -> bool {
        self.core.is_connected()
    }

    async fn flush(&self, timeout: Duration) -> BrokerResult<usize> {
        let drained = self.core.producer.drain(timeout).await;
        self.client.flush(timeout).await?;
        Ok(drained)
    }

    async fn disconnect(&self) -> BrokerResult<()> {
        self.core.disconnect().await;
        Ok(())
    }

    async fn health_check(&self) -> HealthCheckResult {
        self.core
            .health(|| async { self.client.ping().await.map_err(BrokerError::from) })
            .await
            .with_detail("group", self.group.clone())
            .with_detail("subscribed_topics", self.current_topics().len() as u64)
    }

    fn topic_prefix(&self) -> &str {
        self.core.strategy.prefix()
    }

    fn raw_publisher(&self) -> Arc<dyn RawPublisher> {
        Arc::clone(&self.publisher)
    }

    fn metrics(&self) -> BrokerMetricsSnapshot {
        self.core.metrics.snapshot()
    }

    fn set_loop_observer(&self, observer: Arc<dyn LoopObserver>) {
        self.core.set_observer(observer);
    }
}
