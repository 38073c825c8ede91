//! State and control flow shared by every driver
//!
//! [`DriverCore`] owns what the three drivers have in common: the breaker,
//! topic strategy, memory manager, metrics, subscriptions, the producer path
//! and the consume loop. A driver contributes its backend specifics through a
//! [`QueueSink`](crate::queue::QueueSink) for publishing and a
//! [`ConsumeSource`] for fetching and settling deliveries.

use super::producer::ProducerPath;
use crate::broker::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::broker::dead_letter::DeadLetterQueue;
use crate::broker::dispatch::{DispatchOutcome, HandlerInvoker};
use crate::broker::error::{BrokerError, BrokerResult};
use crate::broker::health::HealthCheckResult;
use crate::broker::memory_manager::{MemoryManager, MemoryStatus};
use crate::broker::message::Message;
use crate::broker::metrics::BrokerMetrics;
use crate::broker::topic::{ChannelPattern, TopicStrategy};
use crate::broker::traits::{LoopControl, LoopObserver, LoopReport, MessageHandler, RawPublisher};
use crate::config::BrokerConfig;
use crate::core::retry::{retry_async, sleep_unless_shutdown, RetryPolicy};
use crate::core::shutdown::ShutdownCoordinator;
use crate::core::sync::Poisoned;
use crate::core::time::epoch_millis;
use crate::queue::{QueueSink, QueuedEnvelope};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant, SystemTime};

/// How a driver settles one delivery after dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Settlement {
    /// Done with it: handled, dead-lettered, or nothing to do
    Ack,
    /// Give it back for another attempt later
    Requeue,
    /// Drop it; the dead-letter write failed or the payload is unreadable
    Reject,
}

impl From<&DispatchOutcome> for Settlement {
    fn from(outcome: &DispatchOutcome) -> Self {
        match outcome {
            DispatchOutcome::Handled { .. } => Settlement::Ack,
            DispatchOutcome::DeadLettered { written: true, .. } => Settlement::Ack,
            DispatchOutcome::DeadLettered { written: false, .. } => Settlement::Reject,
            DispatchOutcome::Abandoned { .. } => Settlement::Requeue,
        }
    }
}

/// A delivery fetched from the backend, not yet settled
pub(crate) struct Fetched<R> {
    pub topic: String,
    pub key: Option<String>,
    pub payload: String,
    pub receipt: R,
}

/// What a subscription asks the backend for
#[derive(Debug, Clone)]
pub(crate) enum SubscriptionTarget {
    Topic(String),
    Pattern(ChannelPattern),
}

/// Backend half of the consume loop
#[async_trait]
pub(crate) trait ConsumeSource: Send + Sync {
    type Receipt: Send + Sync + 'static;

    /// (Re)establish consumer state for the current subscriptions
    async fn prepare(&self, targets: &[SubscriptionTarget]) -> BrokerResult<()>;

    /// Next deliveries, waiting at most `timeout`
    async fn fetch(&self, timeout: Duration, max: usize) -> BrokerResult<Vec<Fetched<Self::Receipt>>>;

    /// Settle a batch in delivery order
    async fn settle(&self, settled: Vec<(Self::Receipt, Settlement)>) -> BrokerResult<()>;

    /// Give up consumer state when the loop exits
    async fn release(&self);
}

struct Subscription {
    pattern: ChannelPattern,
    handler: Arc<dyn MessageHandler>,
    /// Wall-clock epoch millis when the channel was subscribed
    since_ms: u64,
}

#[derive(Default)]
struct LoopCounters {
    processed: AtomicU64,
    failed: AtomicU64,
    dead_lettered: AtomicU64,
}

impl LoopCounters {
    fn record(&self, outcome: &DispatchOutcome) {
        match outcome {
            DispatchOutcome::Handled { .. } => {
                self.processed.fetch_add(1, Ordering::Relaxed);
            }
            DispatchOutcome::DeadLettered { .. } => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                self.dead_lettered.fetch_add(1, Ordering::Relaxed);
            }
            DispatchOutcome::Abandoned { .. } => {}
        }
    }

    fn report(&self) -> LoopReport {
        LoopReport {
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
        }
    }
}

/// Unique consumer identity: `host-pid-random`
pub(crate) fn consumer_name() -> String {
    let host = sysinfo::System::host_name().unwrap_or_else(|| "localhost".to_string());
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}-{}", host, std::process::id(), &suffix[..8])
}

pub(crate) struct DriverCore {
    pub(crate) driver: &'static str,
    pub(crate) endpoint: String,
    pub(crate) consumer_group: String,
    pub(crate) consumer_name: String,
    pub(crate) strategy: TopicStrategy,
    pub(crate) breaker: Arc<CircuitBreaker>,
    pub(crate) metrics: Arc<BrokerMetrics>,
    pub(crate) shutdown: ShutdownCoordinator,
    pub(crate) producer: ProducerPath,
    memory: MemoryManager,
    invoker: HandlerInvoker,
    retry: RetryPolicy,
    pattern_refresh: Duration,
    subscriptions: RwLock<BTreeMap<String, Subscription>>,
    generation: AtomicU64,
    connected: AtomicBool,
    running: AtomicBool,
    stop_requested: AtomicBool,
    observer: RwLock<Option<Arc<dyn LoopObserver>>>,
    counters: LoopCounters,
}

impl DriverCore {
    pub(crate) fn new(
        driver: &'static str,
        config: &BrokerConfig,
        shutdown: ShutdownCoordinator,
        publisher: Arc<dyn RawPublisher>,
        sink: Arc<dyn QueueSink>,
    ) -> BrokerResult<Self> {
        let strategy = TopicStrategy::new(config.topic_strategy_config())?;
        let breaker = Arc::new(CircuitBreaker::new(
            format!("{}:{}", driver, config.endpoint()),
            config.circuit_breaker_config(),
        ));
        let metrics = Arc::new(BrokerMetrics::new());
        let dead_letter_config = config.dead_letter_config();
        let dead_letter = dead_letter_config
            .enabled
            .then(|| Arc::new(DeadLetterQueue::new(dead_letter_config.clone(), publisher)));
        let invoker = HandlerInvoker::new(
            driver,
            dead_letter_config.max_retries,
            dead_letter_config.base_delay,
            dead_letter,
            Arc::clone(&metrics),
            shutdown.clone(),
        );
        let producer = ProducerPath::new(
            driver,
            config,
            sink,
            Arc::clone(&breaker),
            Arc::clone(&metrics),
        )?;

        Ok(Self {
            driver,
            endpoint: config.endpoint(),
            consumer_group: config.consumer_group.clone(),
            consumer_name: consumer_name(),
            strategy,
            breaker,
            metrics,
            shutdown,
            producer,
            memory: MemoryManager::new(config.memory_config()),
            invoker,
            retry: config.retry_policy(),
            pattern_refresh: Duration::from_millis(config.topics.refresh_ms.max(1)),
            subscriptions: RwLock::new(BTreeMap::new()),
            generation: AtomicU64::new(0),
            connected: AtomicBool::new(false),
            running: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            observer: RwLock::new(None),
            counters: LoopCounters::default(),
        })
    }

    pub(crate) fn dead_letter(&self) -> Option<&Arc<DeadLetterQueue>> {
        self.invoker.dead_letter()
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub(crate) fn ensure_connected(&self) -> BrokerResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(BrokerError::NotConnected {
                driver: self.driver.to_string(),
            })
        }
    }

    /// Connect with retries; `handshake` is the backend greeting
    pub(crate) async fn connect<F, Fut>(&self, handshake: F) -> BrokerResult<()>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = BrokerResult<()>>,
    {
        if self.is_connected() {
            return Ok(());
        }
        retry_async(
            &format!("{} connect", self.driver),
            self.retry.clone(),
            || self.breaker.call(&handshake),
        )
        .await
        .map_err(|e| match e {
            BrokerError::Backend(reason) => BrokerError::ConnectionFailed {
                endpoint: self.endpoint.clone(),
                reason: reason.to_string(),
            },
            other => other,
        })?;

        self.connected.store(true, Ordering::Release);
        self.producer.start_workers(&self.shutdown);
        log::info!("{} driver connected to {}", self.driver, self.endpoint);
        Ok(())
    }

    /// Drain producers, then mark disconnected
    pub(crate) async fn disconnect(&self) -> usize {
        self.stop_consuming();
        let drained = self.producer.drain(self.producer.drain_timeout()).await;
        self.producer.stop_workers();
        self.connected.store(false, Ordering::Release);
        log::info!(
            "{} driver disconnected from {} ({} queued messages flushed)",
            self.driver,
            self.endpoint,
            drained
        );
        drained
    }

    /// Resolve and submit one publish
    pub(crate) async fn publish(&self, channel: &str, message: Message) -> BrokerResult<()> {
        self.ensure_connected()?;
        let message = if message.channel() == channel {
            message
        } else {
            message.with_channel(channel)
        };
        let payload = message.to_json()?;
        let route = self.strategy.resolve(channel);
        let envelope = QueuedEnvelope::new(
            route.topic,
            payload,
            Some(route.message_key),
            route.partition,
        );
        self.producer.submit(envelope, channel).await
    }

    pub(crate) fn subscribe(&self, channel: &str, handler: Arc<dyn MessageHandler>) -> BrokerResult<()> {
        let pattern = ChannelPattern::new(channel).map_err(|e| BrokerError::SubscribeFailed {
            channel: channel.to_string(),
            reason: e.to_string(),
        })?;
        let mut subscriptions = self
            .subscriptions
            .write()
            .or_backend("subscription table")
            .map_err(|e| BrokerError::SubscribeFailed {
                channel: channel.to_string(),
                reason: e.to_string(),
            })?;
        log::debug!(
            "{} driver: handler '{}' subscribed to '{}'",
            self.driver,
            handler.name(),
            channel
        );
        let since_ms = subscriptions
            .get(channel)
            .map(|existing| existing.since_ms)
            .unwrap_or_else(|| epoch_millis(SystemTime::now()));
        subscriptions.insert(
            channel.to_string(),
            Subscription {
                pattern,
                handler,
                since_ms,
            },
        );
        self.generation.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    pub(crate) fn unsubscribe(&self, channel: &str) -> BrokerResult<()> {
        let mut subscriptions = self
            .subscriptions
            .write()
            .or_backend("subscription table")
            .map_err(|e| BrokerError::SubscribeFailed {
                channel: channel.to_string(),
                reason: e.to_string(),
            })?;
        if subscriptions.remove(channel).is_some() {
            self.generation.fetch_add(1, Ordering::AcqRel);
        }
        Ok(())
    }

    pub(crate) fn stop_consuming(&self) {
        self.stop_requested.store(true, Ordering::Release);
    }

    pub(crate) fn set_observer(&self, observer: Arc<dyn LoopObserver>) {
        if let Ok(mut slot) = self.observer.write() {
            *slot = Some(observer);
        }
    }

    /// Current subscriptions as backend targets
    pub(crate) fn targets(&self) -> BrokerResult<Vec<SubscriptionTarget>> {
        let subscriptions = self
            .subscriptions
            .read()
            .or_backend("subscription table")
            .map_err(|e| BrokerError::SubscribeFailed {
                channel: "*".to_string(),
                reason: e.to_string(),
            })?;
        Ok(subscriptions
            .iter()
            .map(|(channel, subscription)| match self.strategy.subscription_topic(channel) {
                Some(topic) => SubscriptionTarget::Topic(topic),
                None => SubscriptionTarget::Pattern(subscription.pattern.clone()),
            })
            .collect())
    }

    /// Expand targets into concrete topics, matching patterns against `known`
    pub(crate) fn expand_targets(&self, targets: &[SubscriptionTarget], known: &[String]) -> Vec<String> {
        let mut topics: Vec<String> = Vec::new();
        for target in targets {
            match target {
                SubscriptionTarget::Topic(topic) => topics.push(topic.clone()),
                SubscriptionTarget::Pattern(pattern) => topics.extend(
                    known
                        .iter()
                        .filter(|topic| !self.is_dead_letter_topic(topic))
                        .filter(|topic| pattern.matches(&self.strategy.recover_channel(topic, None)))
                        .cloned(),
                ),
            }
        }
        topics.sort();
        topics.dedup();
        topics
    }

    /// Earliest subscribe instant among the subscriptions that cover `topic`
    ///
    /// Consumer state created for a topic discovered later starts here, so
    /// nothing published after the subscription is skipped.
    pub(crate) fn subscribed_since(&self, topic: &str) -> Option<u64> {
        let subscriptions = self.subscriptions.read().ok()?;
        let channel = self.strategy.recover_channel(topic, None);
        subscriptions
            .iter()
            .filter(|(name, subscription)| {
                self.strategy.subscription_topic(name).as_deref() == Some(topic)
                    || subscription.pattern.matches(&channel)
            })
            .map(|(_, subscription)| subscription.since_ms)
            .min()
    }

    fn is_dead_letter_topic(&self, topic: &str) -> bool {
        self.dead_letter()
            .map(|dlq| topic.starts_with(&format!("{}.", dlq.config().prefix)))
            .unwrap_or(false)
    }

    fn handler_for(&self, channel: &str) -> Option<Arc<dyn MessageHandler>> {
        let subscriptions = self.subscriptions.read().ok()?;
        if let Some(exact) = subscriptions.get(channel) {
            return Some(Arc::clone(&exact.handler));
        }
        subscriptions
            .values()
            .find(|s| s.pattern.matches(channel))
            .map(|s| Arc::clone(&s.handler))
    }

    fn has_patterns(&self) -> bool {
        self.subscriptions
            .read()
            .map(|s| s.keys().any(|c| ChannelPattern::is_pattern(c)))
            .unwrap_or(false)
    }

    /// Decode and dispatch one delivery
    async fn handle_delivery(&self, topic: &str, key: Option<&str>, payload: &str) -> Settlement {
        let message = match Message::from_json(payload) {
            Ok(message) => message,
            Err(e) => {
                log::error!("Dropping unreadable message on '{}': {}", topic, e);
                self.metrics.record_consume(self.driver, topic, false);
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                return Settlement::Reject;
            }
        };
        let channel = self.strategy.recover_channel(topic, key);
        let Some(handler) = self.handler_for(&channel) else {
            log::debug!(
                "No handler for channel '{}' (topic '{}'), acknowledging message {}",
                channel,
                topic,
                message.id()
            );
            return Settlement::Ack;
        };

        let outcome = self.invoker.dispatch(handler.as_ref(), topic, &message).await;
        self.counters.record(&outcome);
        Settlement::from(&outcome)
    }

    /// The consume loop shared by every driver
    ///
    /// Each iteration: refresh subscriptions if they changed, fetch with a
    /// bounded wait, dispatch every delivery in order, settle the batch, tick
    /// the memory manager and report to the loop observer. Exits on
    /// `stop_consuming`, shutdown, memory ceiling, an observer asking to stop,
    /// or a non-transport error.
    pub(crate) async fn run_consume_loop<S: ConsumeSource>(
        &self,
        source: &S,
        poll_timeout: Duration,
        batch_size: usize,
    ) -> BrokerResult<()> {
        self.ensure_connected()?;
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(BrokerError::invalid_config(format!(
                "{} driver is already consuming",
                self.driver
            )));
        }
        self.stop_requested.store(false, Ordering::Release);

        let result = self.consume_iterations(source, poll_timeout, batch_size.max(1)).await;
        source.release().await;
        self.running.store(false, Ordering::Release);
        result
    }

    async fn consume_iterations<S: ConsumeSource>(
        &self,
        source: &S,
        poll_timeout: Duration,
        batch_size: usize,
    ) -> BrokerResult<()> {
        let mut prepared_generation = None;
        let mut last_prepare = Instant::now();
        let mut iteration: u64 = 0;

        log::info!(
            "{} driver consuming as '{}' in group '{}'",
            self.driver,
            self.consumer_name,
            self.consumer_group
        );

        loop {
            if self.stop_requested.load(Ordering::Acquire) {
                log::info!("{} consume loop stopped on request", self.driver);
                return Ok(());
            }
            if self.shutdown.is_shutdown_requested() {
                log::info!("{} consume loop stopped by shutdown", self.driver);
                return Ok(());
            }

            let generation = self.generation.load(Ordering::Acquire);
            let refresh_due = self.has_patterns() && last_prepare.elapsed() >= self.pattern_refresh;
            if prepared_generation != Some(generation) || refresh_due {
                let targets = self.targets()?;
                match self.breaker.call(|| source.prepare(&targets)).await {
                    Ok(()) => {
                        prepared_generation = Some(generation);
                        last_prepare = Instant::now();
                    }
                    Err(e) if e.is_retryable() => {
                        log::warn!("{} driver could not prepare consumer: {}", self.driver, e);
                        self.backoff(poll_timeout).await;
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }

            let fetched = match self.breaker.call(|| source.fetch(poll_timeout, batch_size)).await {
                Ok(fetched) => fetched,
                Err(e) if e.is_retryable() => {
                    log::warn!("{} driver fetch failed: {}", self.driver, e);
                    self.backoff(poll_timeout).await;
                    continue;
                }
                Err(e) => return Err(e),
            };

            if !fetched.is_empty() {
                let mut settled = Vec::with_capacity(fetched.len());
                for delivery in fetched {
                    // Leave the rest of the batch unsettled once shutdown starts
                    let settlement = if self.shutdown.is_shutdown_requested() {
                        Settlement::Requeue
                    } else {
                        self.handle_delivery(&delivery.topic, delivery.key.as_deref(), &delivery.payload)
                            .await
                    };
                    settled.push((delivery.receipt, settlement));
                }
                if let Err(e) = self.breaker.call(|| source.settle(settled)).await {
                    log::warn!("{} driver failed to settle deliveries: {}", self.driver, e);
                }
            }

            iteration += 1;
            if let MemoryStatus::LimitExceeded {
                used_bytes,
                limit_bytes,
            } = self.memory.tick()
            {
                log::warn!(
                    "{} consume loop stopping after {} iterations: memory {} bytes over limit {} bytes",
                    self.driver,
                    iteration,
                    used_bytes,
                    limit_bytes
                );
                return Ok(());
            }

            let observer = self.observer.read().ok().and_then(|o| o.clone());
            if let Some(observer) = observer {
                if observer.on_iteration(self.counters.report()).await == LoopControl::Stop {
                    log::info!("{} consume loop stopped by observer", self.driver);
                    return Ok(());
                }
            }
        }
    }

    async fn backoff(&self, poll_timeout: Duration) {
        let delay = match self.breaker.state() {
            CircuitState::Open => self.breaker.snapshot().open_timeout.min(poll_timeout.max(Duration::from_millis(100))),
            _ => poll_timeout.max(Duration::from_millis(10)),
        };
        sleep_unless_shutdown(delay, &self.shutdown).await;
    }

    pub(crate) fn loop_report(&self) -> LoopReport {
        self.counters.report()
    }

    /// Health from a timed backend ping plus local breaker and queue state
    pub(crate) async fn health<F, Fut>(&self, ping: F) -> HealthCheckResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = BrokerResult<()>>,
    {
        let started = Instant::now();
        let breaker = self.breaker.snapshot();
        let ping_result = if self.is_connected() {
            Some(ping().await)
        } else {
            None
        };
        let latency = started.elapsed();

        let mut result = match (&ping_result, breaker.state) {
            (None, _) => HealthCheckResult::unhealthy(format!("{} driver is not connected", self.driver)),
            (Some(Err(e)), _) => HealthCheckResult::unhealthy(format!("{} backend unreachable: {}", self.driver, e)),
            (Some(Ok(())), CircuitState::Closed) => {
                HealthCheckResult::healthy(format!("{} backend reachable", self.driver))
            }
            (Some(Ok(())), state) => HealthCheckResult::degraded(format!(
                "{} backend reachable but circuit is {}",
                self.driver, state
            )),
        };

        if let Some(stats) = self.producer.async_stats() {
            let nearly_full = stats.size * 10 >= stats.capacity * 9;
            if nearly_full && result.is_healthy() {
                result = HealthCheckResult::degraded(format!(
                    "{} producer queue at {}/{}",
                    self.driver, stats.size, stats.capacity
                ));
            }
            result = result
                .with_detail("async_queue_size", stats.size as u64)
                .with_detail("async_queue_capacity", stats.capacity as u64);
        }
        if let Some(stats) = self.producer.shared_stats() {
            result = result.with_detail("shared_queue_size", stats.size as u64);
        }

        let metrics = self.metrics.snapshot();
        result
            .with_detail("driver", self.driver)
            .with_detail("endpoint", self.endpoint.clone())
            .with_detail("circuit_state", breaker.state.to_string())
            .with_detail("consecutive_failures", breaker.consecutive_failures)
            .with_detail("publish_ok", metrics.publish_ok)
            .with_detail("publish_failed", metrics.publish_failed)
            .with_detail("consume_ok", metrics.consume_ok)
            .with_detail("dead_lettered", metrics.dead_lettered)
            .with_latency(latency)
    }
}
