//! AMQP driver
//!
//! Publishes go to one exchange with the physical topic as routing key. Each
//! consumer group shares one queue bound to the subscribed topics (wildcard
//! channels become topic-exchange binding patterns). Deliveries are
//! prefetch-bounded and settled with ack, nack or nack-with-requeue.

use super::common::{ConsumeSource, DriverCore, Fetched, Settlement, SubscriptionTarget};
use crate::broker::backends::{AmqpClient, AmqpProperties, ExchangeKind};
use crate::broker::error::{BackendError, BrokerError, BrokerResult};
use crate::broker::health::HealthCheckResult;
use crate::broker::message::Message;
use crate::broker::metrics::BrokerMetricsSnapshot;
use crate::broker::topic::ChannelPattern;
use crate::broker::traits::{BrokerInterface, LoopObserver, MessageHandler, RawPublisher};
use crate::config::BrokerConfig;
use crate::core::shutdown::ShutdownCoordinator;
use crate::queue::{QueueSink, QueuedEnvelope};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const KEY_HEADER: &str = "key";

struct AmqpSink {
    client: Arc<dyn AmqpClient>,
    exchange: String,
    persistent: bool,
}

#[async_trait]
impl QueueSink for AmqpSink {
    async fn send(&self, envelope: &QueuedEnvelope) -> Result<(), BackendError> {
        let mut properties = AmqpProperties {
            persistent: self.persistent,
            content_type: Some("application/json".to_string()),
            ..AmqpProperties::default()
        };
        if let Some(key) = &envelope.key {
            properties.headers.insert(KEY_HEADER.to_string(), key.clone());
        }
        self.client
            .publish(&self.exchange, &envelope.topic, &envelope.payload, properties)
            .await
    }

    async fn flush_batch(&self) -> Result<(), BackendError> {
        Ok(())
    }
}

pub struct AmqpDriver {
    core: DriverCore,
    client: Arc<dyn AmqpClient>,
    publisher: Arc<dyn RawPublisher>,
    exchange: String,
    exchange_kind: ExchangeKind,
    durable: bool,
    prefetch: u16,
    queue: String,
    bindings: Mutex<BTreeSet<String>>,
    consuming: AtomicBool,
}

impl AmqpDriver {
    pub fn new<C>(config: &BrokerConfig, client: Arc<C>, shutdown: ShutdownCoordinator) -> BrokerResult<Self>
    where
        C: AmqpClient + 'static,
    {
        let publisher: Arc<dyn RawPublisher> = client.clone();
        let client: Arc<dyn AmqpClient> = client;
        let settings = &config.amqp;
        let sink = Arc::new(AmqpSink {
            client: Arc::clone(&client),
            exchange: settings.exchange.clone(),
            persistent: settings.durable,
        });
        let core = DriverCore::new("amqp", config, shutdown, Arc::clone(&publisher), sink)?;
        let queue = match core.strategy.prefix() {
            "" => core.consumer_group.clone(),
            prefix => format!("{}.{}", prefix, core.consumer_group),
        };

        Ok(Self {
            core,
            client,
            publisher,
            exchange: settings.exchange.clone(),
            exchange_kind: settings.exchange_kind,
            durable: settings.durable,
            prefetch: settings.prefetch,
            queue,
            bindings: Mutex::new(BTreeSet::new()),
            consuming: AtomicBool::new(false),
        })
    }

    /// Queue shared by this consumer group
    pub fn queue_name(&self) -> &str {
        &self.queue
    }

    fn pattern_binding(&self, pattern: &ChannelPattern) -> String {
        match self.core.strategy.prefix() {
            "" => pattern.to_amqp_binding(),
            prefix => format!("{}.{}", prefix, pattern.to_amqp_binding()),
        }
    }

    fn binding_keys(&self, targets: &[SubscriptionTarget]) -> BTreeSet<String> {
        targets
            .iter()
            .filter_map(|target| match target {
                SubscriptionTarget::Topic(topic) => Some(topic.clone()),
                SubscriptionTarget::Pattern(pattern) => match self.exchange_kind {
                    ExchangeKind::Topic => Some(self.pattern_binding(pattern)),
                    _ => {
                        log::warn!(
                            "Wildcard channel '{}' needs a topic exchange; '{}' is {}",
                            pattern.as_str(),
                            self.exchange,
                            self.exchange_kind
                        );
                        None
                    }
                },
            })
            .collect()
    }

    fn current_bindings(&self) -> BTreeSet<String> {
        self.bindings.lock().map(|b| b.clone()).unwrap_or_default()
    }

    /// Bring the group queue's bindings in line with `wanted`
    async fn sync_bindings(&self, wanted: BTreeSet<String>) -> BrokerResult<()> {
        self.client.declare_queue(&self.queue, self.durable).await?;
        let current = self.current_bindings();
        for stale in current.difference(&wanted) {
            self.client.unbind_queue(&self.queue, &self.exchange, stale).await?;
        }
        for added in wanted.difference(&current) {
            self.client.bind_queue(&self.queue, &self.exchange, added).await?;
        }
        if let Ok(mut bindings) = self.bindings.lock() {
            *bindings = wanted;
        }
        Ok(())
    }
}

#[async_trait]
impl ConsumeSource for AmqpDriver {
    type Receipt = u64;

    async fn prepare(&self, targets: &[SubscriptionTarget]) -> BrokerResult<()> {
        self.sync_bindings(self.binding_keys(targets)).await?;
        if !self.consuming.load(Ordering::Acquire) {
            self.client
                .consume(&self.queue, &self.core.consumer_name, self.prefetch)
                .await?;
            self.consuming.store(true, Ordering::Release);
            log::debug!(
                "AMQP consumer '{}' on queue '{}' (prefetch {})",
                self.core.consumer_name,
                self.queue,
                self.prefetch
            );
        }
        Ok(())
    }

    async fn fetch(&self, timeout: Duration, max: usize) -> BrokerResult<Vec<Fetched<Self::Receipt>>> {
        let deliveries = self
            .client
            .next_deliveries(&self.core.consumer_name, max, timeout)
            .await?;
        Ok(deliveries
            .into_iter()
            .map(|delivery| {
                if delivery.redelivered {
                    log::debug!("Redelivery of tag {} on '{}'", delivery.delivery_tag, delivery.routing_key);
                }
                Fetched {
                    key: delivery.properties.headers.get(KEY_HEADER).cloned(),
                    topic: delivery.routing_key,
                    payload: delivery.payload,
                    receipt: delivery.delivery_tag,
                }
            })
            .collect())
    }

    async fn settle(&self, settled: Vec<(Self::Receipt, Settlement)>) -> BrokerResult<()> {
        let tag = &self.core.consumer_name;
        for (delivery_tag, settlement) in settled {
            match settlement {
                Settlement::Ack => self.client.ack(tag, delivery_tag).await?,
                Settlement::Reject => self.client.nack(tag, delivery_tag, false).await?,
                Settlement::Requeue => self.client.nack(tag, delivery_tag, true).await?,
            }
        }
        Ok(())
    }

    async fn release(&self) {
        if self.consuming.swap(false, Ordering::AcqRel) {
            if let Err(e) = self.client.cancel(&self.core.consumer_name).await {
                log::warn!("Failed to cancel AMQP consumer '{}': {}", self.core.consumer_name, e);
            }
        }
    }
}

#[async_trait]
impl BrokerInterface for AmqpDriver {
    fn driver_name(&self) -> &'static str {
        self.core.driver
    }

    async fn connect(&self) -> BrokerResult<()> {
        self.core
            .connect(|| async {
                self.client.ping().await?;
                self.client
                    .declare_exchange(&self.exchange, self.exchange_kind, self.durable)
                    .await?;
                Ok::<(), BrokerError>(())
            })
            .await
    }

    async fn publish(&self, channel: &str, message: Message) -> BrokerResult<()> {
        self.core.publish(channel, message).await
    }

    /// Bind right away when connected; the exchange drops unroutable messages
    async fn subscribe(&self, channel: &str, handler: Arc<dyn MessageHandler>) -> BrokerResult<()> {
        self.core.subscribe(channel, handler)?;
        if self.core.is_connected() {
            let targets = self.core.targets()?;
            self.sync_bindings(self.binding_keys(&targets))
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
            .await
            .with_detail("exchange", self.exchange.clone())
            .with_detail("queue", self.queue.clone());
        match self.client.queue_len(&self.queue).await {
            Ok(depth) => result.with_detail("queue_depth", depth as u64),
            Err(_) => result,
        }
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
    use crate::broker::backends::MemoryAmqpBroker;
    use super::super::testing::StopAfter;
    use crate::broker::traits::{handler_fn, HandlerError};
    use crate::config::DriverKind;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn config() -> BrokerConfig {
        let mut config = BrokerConfig::default();
        config.driver = DriverKind::Amqp;
        config.dead_letter.max_retries = 0;
        config
    }

    async fn driver(broker: &MemoryAmqpBroker) -> AmqpDriver {
        let driver =
            AmqpDriver::new(&config(), Arc::new(broker.clone()), ShutdownCoordinator::detached()).unwrap();
        driver.connect().await.unwrap();
        driver
    }

    #[tokio::test]
    async fn test_subscribe_binds_group_queue() {
        let broker = MemoryAmqpBroker::new();
        let driver = driver(&broker).await;
        assert_eq!(driver.queue_name(), "app.relaybus");

        driver
            .subscribe("orders.created", handler_fn("noop", |_m: Message| async { Ok(()) }))
            .await
            .unwrap();
        driver
            .subscribe("users.**", handler_fn("noop", |_m: Message| async { Ok(()) }))
            .await
            .unwrap();

        for channel in ["orders.created", "users.eu.signup", "billing"] {
            driver
                .publish(channel, Message::new(channel, "e", json!({})))
                .await
                .unwrap();
        }
        assert_eq!(broker.queue_len("app.relaybus").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_consume_acks_and_rejects() {
        let broker = MemoryAmqpBroker::new();
        let driver = driver(&broker).await;
        let handled = Arc::new(AtomicUsize::new(0));
        let counter = handled.clone();
        driver
            .subscribe(
                "jobs.*",
                handler_fn("jobs", move |m: Message| {
                    let counter = counter.clone();
                    async move {
                        if m.channel() == "jobs.bad" {
                            return Err(HandlerError::new("cannot process"));
                        }
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
            )
            .await
            .unwrap();
        for channel in ["jobs.good", "jobs.bad", "jobs.good"] {
            driver
                .publish(channel, Message::new(channel, "run", json!({})))
                .await
                .unwrap();
        }

        driver.set_loop_observer(Arc::new(StopAfter(3)));
        driver.consume(Duration::from_millis(20), 10).await.unwrap();

        assert_eq!(handled.load(Ordering::SeqCst), 2);
        assert_eq!(broker.queue_len("app.relaybus").await.unwrap(), 0);
        assert_eq!(broker.queue_len("dlq.app.jobs.bad").await.unwrap(), 1);
        assert_eq!(broker.unacked(&driver.core.consumer_name), 0);
    }

    #[tokio::test]
    async fn test_connect_rejects_mismatched_exchange() {
        let broker = MemoryAmqpBroker::new();
        broker
            .declare_exchange("relaybus", ExchangeKind::Fanout, true)
            .await
            .unwrap();
        let mut config = config();
        config.retry.max_attempts = 1;
        let driver =
            AmqpDriver::new(&config, Arc::new(broker), ShutdownCoordinator::detached()).unwrap();
        assert!(driver.connect().await.is_err());
        assert!(!driver.is_connected());
    }
}
