//! In-process AMQP-style broker
//!
//! Exchanges route to bound queues (direct, topic or fanout); consumers take
//! deliveries from a queue up to their prefetch limit and settle each one with
//! ack or nack. Cancelling a consumer, or nacking with requeue, puts its
//! unacknowledged deliveries back at the head of the queue flagged as
//! redelivered.

use super::{AmqpClient, AmqpProperties, Availability, BackendResult, Delivery, ExchangeKind};
use crate::broker::error::BackendError;
use crate::broker::topic::ChannelPattern;
use crate::broker::traits::RawPublisher;
use crate::core::sync::Poisoned;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Debug, Clone)]
struct Binding {
    queue: String,
    key: String,
    pattern: Option<ChannelPattern>,
}

#[derive(Debug)]
struct Exchange {
    kind: ExchangeKind,
    bindings: Vec<Binding>,
}

impl Exchange {
    fn routes(&self, routing_key: &str) -> Vec<String> {
        let mut queues: Vec<String> = self
            .bindings
            .iter()
            .filter(|b| match self.kind {
                ExchangeKind::Fanout => true,
                ExchangeKind::Direct => b.key == routing_key,
                ExchangeKind::Topic => b
                    .pattern
                    .as_ref()
                    .map_or(b.key == routing_key, |p| p.matches(routing_key)),
            })
            .map(|b| b.queue.clone())
            .collect();
        // A queue bound twice still receives one copy
        queues.sort();
        queues.dedup();
        queues
    }
}

#[derive(Debug, Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    payload: String,
    properties: AmqpProperties,
    redelivered: bool,
}

#[derive(Debug, Default)]
struct Queue {
    ready: VecDeque<StoredMessage>,
}

#[derive(Debug)]
struct Consumer {
    queue: String,
    prefetch: u16,
    unacked: BTreeMap<u64, StoredMessage>,
}

impl Consumer {
    fn credit(&self) -> usize {
        if self.prefetch == 0 {
            usize::MAX
        } else {
            (self.prefetch as usize).saturating_sub(self.unacked.len())
        }
    }
}

#[derive(Debug, Default)]
struct BrokerState {
    exchanges: HashMap<String, Exchange>,
    queues: HashMap<String, Queue>,
    consumers: HashMap<String, Consumer>,
    next_delivery_tag: u64,
}

impl BrokerState {
    fn requeue(&mut self, queue: &str, messages: impl DoubleEndedIterator<Item = StoredMessage>) {
        if let Some(queue) = self.queues.get_mut(queue) {
            for mut message in messages.rev() {
                message.redelivered = true;
                queue.ready.push_front(message);
            }
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: Mutex<BrokerState>,
    ready: Notify,
    availability: Availability,
}

/// Shared in-process broker; clones address the same exchanges and queues
#[derive(Debug, Clone)]
pub struct MemoryAmqpBroker {
    inner: Arc<Inner>,
}

impl Default for MemoryAmqpBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryAmqpBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(BrokerState::default()),
                ready: Notify::new(),
                availability: Availability::new("amqp"),
            }),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.inner.availability.set(available);
    }

    /// Unacknowledged deliveries held by a consumer
    pub fn unacked(&self, consumer_tag: &str) -> usize {
        self.state()
            .ok()
            .and_then(|s| s.consumers.get(consumer_tag).map(|c| c.unacked.len()))
            .unwrap_or(0)
    }

    fn state(&self) -> BackendResult<MutexGuard<'_, BrokerState>> {
        self.inner.state.lock().or_backend("exchange state")
    }

    fn take_deliveries(&self, consumer_tag: &str, max: usize) -> BackendResult<Vec<Delivery>> {
        let mut guard = self.state()?;
        let BrokerState {
            queues,
            consumers,
            next_delivery_tag,
            ..
        } = &mut *guard;
        let consumer = consumers
            .get_mut(consumer_tag)
            .ok_or_else(|| BackendError::NotFound(format!("unknown consumer '{}'", consumer_tag)))?;
        let queue = queues.get_mut(&consumer.queue).ok_or_else(|| {
            BackendError::NotFound(format!("queue '{}' was deleted", consumer.queue))
        })?;

        let take = max.min(consumer.credit());
        let mut deliveries = Vec::new();
        while deliveries.len() < take {
            let Some(message) = queue.ready.pop_front() else {
                break;
            };
            *next_delivery_tag += 1;
            let tag = *next_delivery_tag;
            deliveries.push(Delivery {
                delivery_tag: tag,
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                redelivered: message.redelivered,
                payload: message.payload.clone(),
                properties: message.properties.clone(),
            });
            consumer.unacked.insert(tag, message);
        }
        Ok(deliveries)
    }

    fn settle(&self, consumer_tag: &str, delivery_tag: u64) -> BackendResult<(String, StoredMessage)> {
        let mut state = self.state()?;
        let consumer = state
            .consumers
            .get_mut(consumer_tag)
            .ok_or_else(|| BackendError::NotFound(format!("unknown consumer '{}'", consumer_tag)))?;
        let message = consumer.unacked.remove(&delivery_tag).ok_or_else(|| {
            BackendError::Rejected(format!(
                "PRECONDITION_FAILED unknown delivery tag {}",
                delivery_tag
            ))
        })?;
        Ok((consumer.queue.clone(), message))
    }
}

#[async_trait]
impl RawPublisher for MemoryAmqpBroker {
    /// Publish straight to a durable queue named `destination`
    async fn publish_raw(
        &self,
        destination: &str,
        _key: Option<&str>,
        payload: &str,
    ) -> Result<String, BackendError> {
        self.declare_queue(destination, true).await?;
        self.publish(
            "",
            destination,
            payload,
            AmqpProperties {
                persistent: true,
                content_type: Some("application/json".into()),
                ..AmqpProperties::default()
            },
        )
        .await?;
        Ok(destination.to_string())
    }
}

#[async_trait]
impl AmqpClient for MemoryAmqpBroker {
    async fn ping(&self) -> BackendResult<()> {
        self.inner.availability.check()
    }

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind, _durable: bool) -> BackendResult<()> {
        self.inner.availability.check()?;
        if name.is_empty() {
            return Err(BackendError::Rejected(
                "ACCESS_REFUSED the default exchange cannot be redeclared".into(),
            ));
        }
        let mut state = self.state()?;
        match state.exchanges.get(name) {
            Some(existing) if existing.kind != kind => Err(BackendError::Rejected(format!(
                "PRECONDITION_FAILED exchange '{}' already declared as {}",
                name, existing.kind
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(
                    name.to_string(),
                    Exchange {
                        kind,
                        bindings: Vec::new(),
                    },
                );
                Ok(())
            }
        }
    }

    /// Durability is accepted for interface parity; nothing outlives the process
    async fn declare_queue(&self, name: &str, _durable: bool) -> BackendResult<()> {
        self.inner.availability.check()?;
        let mut state = self.state()?;
        state.queues.entry(name.to_string()).or_default();
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, binding_key: &str) -> BackendResult<()> {
        self.inner.availability.check()?;
        let mut state = self.state()?;
        if !state.queues.contains_key(queue) {
            return Err(BackendError::NotFound(format!("no queue '{}'", queue)));
        }
        let target = state
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| BackendError::NotFound(format!("no exchange '{}'", exchange)))?;
        if target
            .bindings
            .iter()
            .any(|b| b.queue == queue && b.key == binding_key)
        {
            return Ok(());
        }
        let pattern = match target.kind {
            ExchangeKind::Topic => Some(
                ChannelPattern::from_amqp_binding(binding_key)
                    .map_err(|e| BackendError::Rejected(e.to_string()))?,
            ),
            _ => None,
        };
        target.bindings.push(Binding {
            queue: queue.to_string(),
            key: binding_key.to_string(),
            pattern,
        });
        Ok(())
    }

    async fn unbind_queue(&self, queue: &str, exchange: &str, binding_key: &str) -> BackendResult<()> {
        self.inner.availability.check()?;
        let mut state = self.state()?;
        if let Some(target) = state.exchanges.get_mut(exchange) {
            target
                .bindings
                .retain(|b| !(b.queue == queue && b.key == binding_key));
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &str,
        properties: AmqpProperties,
    ) -> BackendResult<()> {
        self.inner.availability.check()?;
        let routed = {
            let mut state = self.state()?;
            let targets = if exchange.is_empty() {
                vec![routing_key.to_string()]
            } else {
                state
                    .exchanges
                    .get(exchange)
                    .ok_or_else(|| BackendError::NotFound(format!("no exchange '{}'", exchange)))?
                    .routes(routing_key)
            };

            let mut routed = 0;
            for name in targets {
                if let Some(queue) = state.queues.get_mut(&name) {
                    queue.ready.push_back(StoredMessage {
                        exchange: exchange.to_string(),
                        routing_key: routing_key.to_string(),
                        payload: payload.to_string(),
                        properties: properties.clone(),
                        redelivered: false,
                    });
                    routed += 1;
                }
            }
            routed
        };
        if routed == 0 {
            log::debug!(
                "Message to exchange '{}' with key '{}' was unroutable",
                exchange,
                routing_key
            );
        } else {
            self.inner.ready.notify_waiters();
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str, prefetch: u16) -> BackendResult<()> {
        self.inner.availability.check()?;
        let mut state = self.state()?;
        if !state.queues.contains_key(queue) {
            return Err(BackendError::NotFound(format!("no queue '{}'", queue)));
        }
        if state.consumers.contains_key(consumer_tag) {
            return Err(BackendError::Rejected(format!(
                "NOT_ALLOWED consumer tag '{}' already in use",
                consumer_tag
            )));
        }
        state.consumers.insert(
            consumer_tag.to_string(),
            Consumer {
                queue: queue.to_string(),
                prefetch,
                unacked: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn next_deliveries(
        &self,
        consumer_tag: &str,
        max: usize,
        timeout: Duration,
    ) -> BackendResult<Vec<Delivery>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            self.inner.availability.check()?;
            let ready = self.inner.ready.notified();
            tokio::pin!(ready);
            ready.as_mut().enable();

            let deliveries = self.take_deliveries(consumer_tag, max.max(1))?;
            if !deliveries.is_empty() {
                return Ok(deliveries);
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let _ = tokio::time::timeout(deadline - now, ready).await;
        }
    }

    async fn ack(&self, consumer_tag: &str, delivery_tag: u64) -> BackendResult<()> {
        self.inner.availability.check()?;
        self.settle(consumer_tag, delivery_tag)?;
        // Freed prefetch credit may unblock this consumer
        self.inner.ready.notify_waiters();
        Ok(())
    }

    async fn nack(&self, consumer_tag: &str, delivery_tag: u64, requeue: bool) -> BackendResult<()> {
        self.inner.availability.check()?;
        let (queue, message) = self.settle(consumer_tag, delivery_tag)?;
        if requeue {
            self.state()?.requeue(&queue, std::iter::once(message));
        }
        self.inner.ready.notify_waiters();
        Ok(())
    }

    async fn cancel(&self, consumer_tag: &str) -> BackendResult<()> {
        self.inner.availability.check()?;
        {
            let mut state = self.state()?;
            if let Some(consumer) = state.consumers.remove(consumer_tag) {
                let unacked: Vec<StoredMessage> = consumer.unacked.into_values().collect();
                log::debug!(
                    "Consumer '{}' cancelled, requeueing {} unacked deliveries",
                    consumer_tag,
                    unacked.len()
                );
                state.requeue(&consumer.queue, unacked.into_iter());
            }
        }
        self.inner.ready.notify_waiters();
        Ok(())
    }

    async fn queue_len(&self, queue: &str) -> BackendResult<usize> {
        self.inner.availability.check()?;
        let state = self.state()?;
        state
            .queues
            .get(queue)
            .map(|q| q.ready.len())
            .ok_or_else(|| BackendError::NotFound(format!("no queue '{}'", queue)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup(broker: &MemoryAmqpBroker, kind: ExchangeKind, bindings: &[(&str, &str)]) {
        broker.declare_exchange("events", kind, true).await.unwrap();
        for (queue, key) in bindings {
            broker.declare_queue(queue, true).await.unwrap();
            broker.bind_queue(queue, "events", key).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_topic_exchange_routes_by_pattern() {
        let broker = MemoryAmqpBroker::new();
        setup(
            &broker,
            ExchangeKind::Topic,
            &[("all", "#"), ("orders", "orders.*"), ("exact", "users.created")],
        )
        .await;
        let props = AmqpProperties::default();
        broker.publish("events", "orders.created", "1", props.clone()).await.unwrap();
        broker.publish("events", "users.created", "2", props).await.unwrap();

        assert_eq!(broker.queue_len("all").await.unwrap(), 2);
        assert_eq!(broker.queue_len("orders").await.unwrap(), 1);
        assert_eq!(broker.queue_len("exact").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_fanout_and_direct() {
        let broker = MemoryAmqpBroker::new();
        setup(&broker, ExchangeKind::Fanout, &[("a", "ignored"), ("b", "")]).await;
        broker
            .publish("events", "anything", "x", AmqpProperties::default())
            .await
            .unwrap();
        assert_eq!(broker.queue_len("a").await.unwrap(), 1);
        assert_eq!(broker.queue_len("b").await.unwrap(), 1);

        broker.declare_exchange("direct", ExchangeKind::Direct, true).await.unwrap();
        broker.bind_queue("a", "direct", "k").await.unwrap();
        broker.publish("direct", "other", "y", AmqpProperties::default()).await.unwrap();
        assert_eq!(broker.queue_len("a").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_redeclaring_with_other_kind_fails() {
        let broker = MemoryAmqpBroker::new();
        broker.declare_exchange("x", ExchangeKind::Topic, true).await.unwrap();
        assert!(broker.declare_exchange("x", ExchangeKind::Topic, true).await.is_ok());
        assert!(broker.declare_exchange("x", ExchangeKind::Fanout, true).await.is_err());
    }

    #[tokio::test]
    async fn test_prefetch_limits_unacked() {
        let broker = MemoryAmqpBroker::new();
        broker.declare_queue("q", true).await.unwrap();
        for i in 0..5 {
            broker
                .publish("", "q", &i.to_string(), AmqpProperties::default())
                .await
                .unwrap();
        }
        broker.consume("q", "c", 2).await.unwrap();

        let first = broker.next_deliveries("c", 10, Duration::ZERO).await.unwrap();
        assert_eq!(first.len(), 2);
        let blocked = broker.next_deliveries("c", 10, Duration::ZERO).await.unwrap();
        assert!(blocked.is_empty());

        broker.ack("c", first[0].delivery_tag).await.unwrap();
        let next = broker.next_deliveries("c", 10, Duration::ZERO).await.unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].payload, "2");
    }

    #[tokio::test]
    async fn test_nack_requeue_marks_redelivered() {
        let broker = MemoryAmqpBroker::new();
        broker.declare_queue("q", true).await.unwrap();
        broker.publish("", "q", "x", AmqpProperties::default()).await.unwrap();
        broker.consume("q", "c", 10).await.unwrap();

        let delivery = broker.next_deliveries("c", 1, Duration::ZERO).await.unwrap();
        assert!(!delivery[0].redelivered);
        broker.nack("c", delivery[0].delivery_tag, true).await.unwrap();

        let again = broker.next_deliveries("c", 1, Duration::ZERO).await.unwrap();
        assert!(again[0].redelivered);
        broker.nack("c", again[0].delivery_tag, false).await.unwrap();
        assert_eq!(broker.queue_len("q").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_double_ack_is_rejected() {
        let broker = MemoryAmqpBroker::new();
        broker.declare_queue("q", true).await.unwrap();
        broker.publish("", "q", "x", AmqpProperties::default()).await.unwrap();
        broker.consume("q", "c", 0).await.unwrap();
        let delivery = broker.next_deliveries("c", 1, Duration::ZERO).await.unwrap();
        broker.ack("c", delivery[0].delivery_tag).await.unwrap();
        assert!(matches!(
            broker.ack("c", delivery[0].delivery_tag).await,
            Err(BackendError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_requeues_in_order() {
        let broker = MemoryAmqpBroker::new();
        broker.declare_queue("q", true).await.unwrap();
        for payload in ["a", "b", "c"] {
            broker.publish("", "q", payload, AmqpProperties::default()).await.unwrap();
        }
        broker.consume("q", "c1", 0).await.unwrap();
        broker.next_deliveries("c1", 2, Duration::ZERO).await.unwrap();
        broker.cancel("c1").await.unwrap();

        broker.consume("q", "c2", 0).await.unwrap();
        let all = broker.next_deliveries("c2", 10, Duration::ZERO).await.unwrap();
        let payloads: Vec<&str> = all.iter().map(|d| d.payload.as_str()).collect();
        assert_eq!(payloads, vec!["a", "b", "c"]);
        assert!(all[0].redelivered && all[1].redelivered && !all[2].redelivered);
    }

    #[tokio::test]
    async fn test_publish_raw_creates_durable_queue() {
        let broker = MemoryAmqpBroker::new();
        broker.publish_raw("dlq.app.orders", None, "{}").await.unwrap();
        assert_eq!(broker.queue_len("dlq.app.orders").await.unwrap(), 1);
    }
}
