//! Stream-log driver
//!
//! One stream per physical topic. Consumers read through a consumer group, so
//! every entry is delivered to one member and stays in the group's pending
//! list until acknowledged. Entries left pending by a crashed consumer are
//! claimed back once idle for `claim_idle_ms`.

use super::common::{ConsumeSource, DriverCore, Fetched, Settlement, SubscriptionTarget};
use crate::broker::backends::{GroupStart, StreamLogClient};
use crate::broker::error::{BackendError, BrokerError, BrokerResult};
use crate::broker::health::HealthCheckResult;
use crate::broker::message::Message;
use crate::broker::metrics::BrokerMetricsSnapshot;
use crate::broker::traits::{
    BatchItemResult, BatchPublishResult, BrokerInterface, LoopObserver, MessageHandler, RawPublisher,
};
use crate::config::BrokerConfig;
use crate::core::retry::sleep_unless_shutdown;
use crate::core::shutdown::ShutdownCoordinator;
use crate::queue::{QueueSink, QueuedEnvelope};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

const PAYLOAD_FIELD: &str = "payload";
const KEY_FIELD: &str = "key";

fn entry_fields(payload: &str, key: Option<&str>) -> BTreeMap<String, String> {
    let mut fields = BTreeMap::new();
    fields.insert(PAYLOAD_FIELD.to_string(), payload.to_string());
    if let Some(key) = key {
        fields.insert(KEY_FIELD.to_string(), key.to_string());
    }
    fields
}

struct StreamSink {
    client: Arc<dyn StreamLogClient>,
    max_len: Option<usize>,
}

#[async_trait]
impl QueueSink for StreamSink {
    async fn send(&self, envelope: &QueuedEnvelope) -> Result<(), BackendError> {
        self.client
            .append(
                &envelope.topic,
                entry_fields(&envelope.payload, envelope.key.as_deref()),
                self.max_len,
            )
            .await
            .map(|_| ())
    }

    async fn flush_batch(&self) -> Result<(), BackendError> {
        Ok(())
    }
}

pub struct StreamDriver {
    core: DriverCore,
    client: Arc<dyn StreamLogClient>,
    publisher: Arc<dyn RawPublisher>,
    max_len: Option<usize>,
    claim_idle: Duration,
    streams: RwLock<Vec<String>>,
}

impl StreamDriver {
    pub fn new<C>(config: &BrokerConfig, client: Arc<C>, shutdown: ShutdownCoordinator) -> BrokerResult<Self>
    where
        C: StreamLogClient + 'static,
    {
        let publisher: Arc<dyn RawPublisher> = client.clone();
        let client: Arc<dyn StreamLogClient> = client;
        let sink = Arc::new(StreamSink {
            client: Arc::clone(&client),
            max_len: config.stream.max_len,
        });
        let core = DriverCore::new("stream", config, shutdown, Arc::clone(&publisher), sink)?;

        Ok(Self {
            core,
            client,
            publisher,
            max_len: config.stream.max_len,
            claim_idle: Duration::from_millis(config.stream.claim_idle_ms),
            streams: RwLock::new(Vec::new()),
        })
    }

    /// Groups start at the subscribe instant of the covering subscription
    fn group_start(&self, stream: &str) -> GroupStart {
        self.core
            .subscribed_since(stream)
            .map(GroupStart::Since)
            .unwrap_or(GroupStart::Latest)
    }

    fn current_streams(&self) -> Vec<String> {
        self.streams.read().map(|s| s.clone()).unwrap_or_default()
    }

    fn to_fetched(stream: String, entry: crate::broker::backends::StreamEntry) -> Fetched<(String, String)> {
        Fetched {
            key: entry.field(KEY_FIELD).map(str::to_string),
            payload: entry.field(PAYLOAD_FIELD).unwrap_or_default().to_string(),
            topic: stream.clone(),
            receipt: (stream, entry.id),
        }
    }
}

#[async_trait]
impl ConsumeSource for StreamDriver {
    /// `(stream, entry id)`
    type Receipt = (String, String);

    async fn prepare(&self, targets: &[SubscriptionTarget]) -> BrokerResult<()> {
        let known = self.client.streams().await?;
        let streams = self.core.expand_targets(targets, &known);
        for stream in &streams {
            self.client
                .create_group(stream, &self.core.consumer_group, self.group_start(stream))
                .await?;
        }
        log::debug!("Stream consumer reading {:?}", streams);
        if let Ok(mut current) = self.streams.write() {
            *current = streams;
        }
        Ok(())
    }

    async fn fetch(&self, timeout: Duration, max: usize) -> BrokerResult<Vec<Fetched<Self::Receipt>>> {
        let streams = self.current_streams();
        if streams.is_empty() {
            sleep_unless_shutdown(timeout, &self.core.shutdown).await;
            return Ok(Vec::new());
        }

        let mut fetched = Vec::new();
        for stream in &streams {
            let claimed = self
                .client
                .claim_idle(
                    stream,
                    &self.core.consumer_group,
                    &self.core.consumer_name,
                    self.claim_idle,
                    max - fetched.len(),
                )
                .await?;
            if !claimed.is_empty() {
                log::info!("Claimed {} idle entries on '{}'", claimed.len(), stream);
            }
            fetched.extend(claimed.into_iter().map(|e| Self::to_fetched(stream.clone(), e)));
            if fetched.len() >= max {
                return Ok(fetched);
            }
        }
        if !fetched.is_empty() {
            return Ok(fetched);
        }

        let entries = self
            .client
            .read_group(
                &self.core.consumer_group,
                &self.core.consumer_name,
                &streams,
                max,
                timeout,
            )
            .await?;
        Ok(entries
            .into_iter()
            .map(|(stream, entry)| Self::to_fetched(stream, entry))
            .collect())
    }

    async fn settle(&self, settled: Vec<(Self::Receipt, Settlement)>) -> BrokerResult<()> {
        // Requeued entries stay pending and are reclaimed once idle
        let mut acks: HashMap<String, Vec<String>> = HashMap::new();
        for ((stream, id), settlement) in settled {
            if settlement != Settlement::Requeue {
                acks.entry(stream).or_default().push(id);
            }
        }
        for (stream, ids) in acks {
            self.client
                .ack(&stream, &self.core.consumer_group, &ids)
                .await?;
        }
        Ok(())
    }

    async fn release(&self) {
        if let Ok(mut current) = self.streams.write() {
            current.clear();
        }
    }
}

#[async_trait]
impl BrokerInterface for StreamDriver {
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

    /// One pipelined append; every item reports its own entry id or error
    async fn publish_batch(&self, channel: &str, messages: Vec<Message>) -> BrokerResult<BatchPublishResult> {
        self.core.ensure_connected()?;
        let route = self.core.strategy.resolve(channel);

        let mut items = Vec::with_capacity(messages.len());
        let mut entries = Vec::new();
        let mut slots = Vec::new();
        for (index, message) in messages.into_iter().enumerate() {
            let message = if message.channel() == channel {
                message
            } else {
                message.with_channel(channel)
            };
            let message_id = message.id().to_string();
            match message.to_json() {
                Ok(payload) => {
                    entries.push((
                        route.topic.clone(),
                        entry_fields(&payload, Some(&route.message_key)),
                    ));
                    slots.push(items.len());
                    items.push(BatchItemResult {
                        index,
                        message_id,
                        backend_id: None,
                        error: None,
                    });
                }
                Err(e) => items.push(BatchItemResult {
                    index,
                    message_id,
                    backend_id: None,
                    error: Some(e.to_string()),
                }),
            }
        }
        if entries.is_empty() {
            return Ok(BatchPublishResult { items });
        }

        let started = Instant::now();
        let results = self
            .core
            .breaker
            .call(|| async {
                self.client
                    .append_pipeline(entries, self.max_len)
                    .await
                    .map_err(BrokerError::from)
            })
            .await
            .map_err(|e| match e {
                BrokerError::Backend(reason) => BrokerError::publish_failed(channel, reason),
                other => other,
            })?;

        let elapsed = started.elapsed();
        for (slot, result) in slots.into_iter().zip(results) {
            let item = &mut items[slot];
            self.core
                .metrics
                .record_publish(self.core.driver, channel, result.is_ok(), elapsed);
            match result {
                Ok(id) => item.backend_id = Some(id),
                Err(e) => item.error = Some(e.to_string()),
            }
        }
        Ok(BatchPublishResult { items })
    }

    async fn subscribe(&self, channel: &str, handler: Arc<dyn MessageHandler>) -> BrokerResult<()> {
        self.core.subscribe(channel, handler)?;
        if let (true, Some(stream)) = (
            self.core.is_connected(),
            self.core.strategy.subscription_topic(channel),
        ) {
            self.client
                .create_group(&stream, &self.core.consumer_group, self.group_start(&stream))
                .await
                .map_err(|e| BrokerError::SubscribeFailed {
                    channel: channel.to_string(),
                    reason: e.to_string(),
                })?;
        }
        Ok(())
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
        Ok(self.core.producer.drain(timeout).await)
    }

    async fn disconnect(&self) -> BrokerResult<()> {
        self.core.disconnect().await;
        Ok(())
    }

    async fn health_check(&self) -> HealthCheckResult {
        let result = self
            .core
            .health(|| async { self.client.ping().await.map_err(BrokerError::from) })
            .await;
        let streams = self.current_streams();
        result.with_detail("consuming_streams", streams.len() as u64)
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::backends::MemoryStreamLog;
    use crate::broker::health::HealthStatus;
    use super::super::testing::StopAfter;
    use crate::broker::traits::{handler_fn, HandlerError};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config() -> BrokerConfig {
        let mut config = BrokerConfig::default();
        config.dead_letter.max_retries = 1;
        config.dead_letter.base_delay_ms = 1;
        config.retry.max_attempts = 1;
        config
    }

    async fn driver(log: &MemoryStreamLog, config: &BrokerConfig) -> StreamDriver {
        let driver =
            StreamDriver::new(config, Arc::new(log.clone()), ShutdownCoordinator::detached()).unwrap();
        driver.connect().await.unwrap();
        driver
    }

    #[tokio::test]
    async fn test_publish_then_consume_acknowledges() {
        let log = MemoryStreamLog::new();
        let driver = driver(&log, &config()).await;
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        driver
            .subscribe(
                "orders.created",
                handler_fn("count", move |_m: Message| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
            )
            .await
            .unwrap();

        for i in 0..3 {
            driver
                .publish("orders.created", Message::new("orders.created", "created", json!({"n": i})))
                .await
                .unwrap();
        }
        assert_eq!(log.len("app.orders.created").await.unwrap(), 3);

        driver.set_loop_observer(Arc::new(StopAfter(3)));
        driver.consume(Duration::from_millis(20), 10).await.unwrap();

        assert_eq!(seen.load(Ordering::SeqCst), 3);
        let pending = log.pending("app.orders.created", "relaybus").await.unwrap();
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_failing_handler_dead_letters_and_acks() {
        let log = MemoryStreamLog::new();
        let driver = driver(&log, &config()).await;
        driver
            .subscribe(
                "payments",
                handler_fn("fail", |_m: Message| async {
                    Err(HandlerError::new("card declined"))
                }),
            )
            .await
            .unwrap();
        driver
            .publish("payments", Message::new("payments", "charge", json!({})))
            .await
            .unwrap();

        driver.set_loop_observer(Arc::new(StopAfter(1)));
        driver.consume(Duration::from_millis(20), 10).await.unwrap();

        assert_eq!(log.len("dlq.app.payments").await.unwrap(), 1);
        assert!(log.pending("app.payments", "relaybus").await.unwrap().is_empty());
        assert_eq!(driver.metrics().dead_lettered, 1);
    }

    #[tokio::test]
    async fn test_pattern_subscription_discovers_streams() {
        let log = MemoryStreamLog::new();
        let driver = driver(&log, &config()).await;
        // Neither stream exists when the wildcard subscription is made

        let channels = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = channels.clone();
        driver
            .subscribe(
                "users.*",
                handler_fn("collect", move |m: Message| {
                    let sink = sink.clone();
                    async move {
                        sink.lock().unwrap().push(m.channel().to_string());
                        Ok(())
                    }
                }),
            )
            .await
            .unwrap();
        driver
            .publish("users.signup", Message::new("users.signup", "e", json!(1)))
            .await
            .unwrap();
        driver
            .publish("users.login", Message::new("users.login", "e", json!(2)))
            .await
            .unwrap();

        driver.set_loop_observer(Arc::new(StopAfter(2)));
        driver.consume(Duration::from_millis(20), 10).await.unwrap();

        let mut seen = channels.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, vec!["users.login", "users.signup"]);
    }

    #[tokio::test]
    async fn test_pattern_picks_up_stream_created_while_consuming() {
        let log = MemoryStreamLog::new();
        let mut config = config();
        config.topics.refresh_ms = 10;
        let driver = driver(&log, &config).await;

        // Entries from before the subscription are history, not deliveries
        driver
            .publish("users.signup", Message::new("users.signup", "old", json!(0)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let events = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = events.clone();
        driver
            .subscribe(
                "users.*",
                handler_fn("collect", move |m: Message| {
                    let sink = sink.clone();
                    async move {
                        sink.lock().unwrap().push(m.event().to_string());
                        Ok(())
                    }
                }),
            )
            .await
            .unwrap();
        driver
            .publish("users.signup", Message::new("users.signup", "signup", json!(1)))
            .await
            .unwrap();

        driver.set_loop_observer(Arc::new(StopAfter(2)));
        let publish_later = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            driver
                .publish("users.deleted", Message::new("users.deleted", "deleted", json!(2)))
                .await
                .unwrap();
        };
        let consume = tokio::time::timeout(
            Duration::from_secs(5),
            driver.consume(Duration::from_millis(20), 10),
        );
        let (consumed, ()) = tokio::join!(consume, publish_later);
        consumed.unwrap().unwrap();

        let mut seen = events.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, vec!["deleted", "signup"]);
    }

    #[tokio::test]
    async fn test_publish_batch_reports_entry_ids() {
        let log = MemoryStreamLog::new();
        let driver = driver(&log, &config()).await;
        let messages = (0..4)
            .map(|i| Message::new("metrics", "tick", json!(i)))
            .collect();

        let result = driver.publish_batch("metrics", messages).await.unwrap();
        assert_eq!(result.succeeded(), 4);
        assert_eq!(result.backend_ids().len(), 4);
        assert_eq!(log.len("app.metrics").await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_publish_requires_connection() {
        let log = MemoryStreamLog::new();
        let driver =
            StreamDriver::new(&config(), Arc::new(log), ShutdownCoordinator::detached()).unwrap();
        let err = driver
            .publish("orders", Message::new("orders", "e", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::NotConnected { .. }));
    }

    #[tokio::test]
    async fn test_outage_fails_connect_and_degrades_health() {
        let log = MemoryStreamLog::new();
        log.set_available(false);
        let driver =
            StreamDriver::new(&config(), Arc::new(log.clone()), ShutdownCoordinator::detached()).unwrap();
        let err = driver.connect().await.unwrap_err();
        assert!(matches!(err, BrokerError::ConnectionFailed { .. }));

        log.set_available(true);
        driver.connect().await.unwrap();
        assert_eq!(driver.health_check().await.status, HealthStatus::Healthy);

        log.set_available(false);
        assert_eq!(driver.health_check().await.status, HealthStatus::Unhealthy);
    }
}
