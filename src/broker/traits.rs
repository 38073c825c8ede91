//! Traits for the broker layer
//!
//! [`BrokerInterface`] is the one contract every driver implements. Callers
//! hold an `Arc<dyn BrokerInterface>` built once by the factory and never
//! branch on which backend sits behind it.

use crate::broker::error::{BackendError, BrokerResult};
use crate::broker::health::HealthCheckResult;
use crate::broker::message::Message;
use crate::broker::metrics::BrokerMetricsSnapshot;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Failure reported by a message handler
///
/// Carries the detail that ends up in a dead-letter record.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{class}: {message}")]
pub struct HandlerError {
    pub message: String,
    pub code: Option<String>,
    pub class: String,
    pub trace: Option<String>,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            class: "HandlerError".to_string(),
            trace: None,
        }
    }

    pub fn with_class(mut self, class: impl Into<String>) -> Self {
        self.class = class.into();
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = Some(trace.into());
        self
    }
}

impl From<crate::broker::error::BrokerError> for HandlerError {
    fn from(err: crate::broker::error::BrokerError) -> Self {
        HandlerError::new(err.to_string()).with_class("BrokerError")
    }
}

/// Application callback invoked for each consumed message
#[async_trait]
pub trait MessageHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(&self, message: &Message) -> Result<(), HandlerError>;
}

/// Closure-backed handler
pub struct FnHandler<F> {
    name: String,
    handler: F,
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, message: &Message) -> Result<(), HandlerError> {
        (self.handler)(message.clone()).await
    }
}

/// Wrap an async closure as a shared handler
///
/// ```rust
/// use relaybus::broker::{handler_fn, HandlerError, Message, MessageHandler};
///
/// let handler = handler_fn("audit", |message: Message| async move {
///     if message.event().is_empty() {
///         return Err(HandlerError::new("event tag missing"));
///     }
///     Ok(())
/// });
/// assert_eq!(handler.name(), "audit");
/// ```
pub fn handler_fn<F, Fut>(name: impl Into<String>, handler: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler {
        name: name.into(),
        handler,
    })
}

/// Direct access to a backend's publish path, bypassing channel resolution
///
/// Used by the dead letter queue and by administrative tools that address
/// physical destinations.
#[async_trait]
pub trait RawPublisher: Send + Sync {
    /// Publish `payload` to a physical destination, returning the backend id
    async fn publish_raw(
        &self,
        destination: &str,
        key: Option<&str>,
        payload: &str,
    ) -> Result<String, BackendError>;

    /// Flush any client-side buffering
    async fn flush_raw(&self) -> Result<(), BackendError> {
        Ok(())
    }
}

/// What the consume loop should do after an observer callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopControl {
    Continue,
    Stop,
}

/// Cumulative counters reported at each consume-loop iteration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopReport {
    pub processed: u64,
    pub failed: u64,
    pub dead_lettered: u64,
}

/// Hook run at every consume-loop iteration boundary (heartbeats, supervision)
#[async_trait]
pub trait LoopObserver: Send + Sync {
    async fn on_iteration(&self, report: LoopReport) -> LoopControl;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchItemResult {
    pub index: usize,
    pub message_id: String,
    /// Backend-assigned id (stream entry id, offset, delivery tag)
    pub backend_id: Option<String>,
    pub error: Option<String>,
}

impl BatchItemResult {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Per-item outcome of a batch publish
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchPublishResult {
    pub items: Vec<BatchItemResult>,
}

impl BatchPublishResult {
    pub fn succeeded(&self) -> usize {
        self.items.iter().filter(|i| i.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.items.len() - self.succeeded()
    }

    pub fn backend_ids(&self) -> Vec<&str> {
        self.items
            .iter()
            .filter_map(|i| i.backend_id.as_deref())
            .collect()
    }
}

/// Publish/subscribe contract shared by every driver
#[async_trait]
pub trait BrokerInterface: Send + Sync {
    /// Stable driver identifier (`stream`, `pubsub`, `amqp`)
    fn driver_name(&self) -> &'static str;

    /// Establish the backend connection (retried with backoff)
    async fn connect(&self) -> BrokerResult<()>;

    /// Publish one message to a logical channel
    async fn publish(&self, channel: &str, message: Message) -> BrokerResult<()>;

    /// Publish several messages, reporting each outcome independently
    async fn publish_batch(
        &self,
        channel: &str,
        messages: Vec<Message>,
    ) -> BrokerResult<BatchPublishResult> {
        let mut result = BatchPublishResult::default();
        for (index, message) in messages.into_iter().enumerate() {
            let message_id = message.id().to_string();
            let error = self.publish(channel, message).await.err().map(|e| e.to_string());
            result.items.push(BatchItemResult {
                index,
                message_id,
                backend_id: None,
                error,
            });
        }
        Ok(result)
    }

    /// Register a handler for a channel or wildcard pattern; does not start consuming
    async fn subscribe(&self, channel: &str, handler: Arc<dyn MessageHandler>) -> BrokerResult<()>;

    async fn unsubscribe(&self, channel: &str) -> BrokerResult<()>;

    /// Run the consume loop until `stop_consuming` or a fatal error
    ///
    /// Each poll waits at most `poll_timeout`, so the loop regains control
    /// regularly even when idle.
    async fn consume(&self, poll_timeout: Duration, batch_size: usize) -> BrokerResult<()>;

    /// Ask the consume loop to exit after its current poll; idempotent
    fn stop_consuming(&self);

    fn is_connected(&self) -> bool;

    /// Drain producer queues, waiting at most `timeout`; returns messages flushed
    async fn flush(&self, timeout: Duration) -> BrokerResult<usize>;

    async fn disconnect(&self) -> BrokerResult<()>;

    async fn health_check(&self) -> HealthCheckResult;

    /// Prefix applied to every physical destination
    fn topic_prefix(&self) -> &str;

    /// The driver's client, for raw publishes
    fn raw_publisher(&self) -> Arc<dyn RawPublisher>;

    fn metrics(&self) -> BrokerMetricsSnapshot;

    /// Install a hook called at every consume-loop iteration
    fn set_loop_observer(&self, observer: Arc<dyn LoopObserver>);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_handler_fn_invokes_closure() {
        let handler = handler_fn("reject-empty", |message: Message| async move {
            if message.data().is_null() {
                Err(HandlerError::new("empty payload").with_class("ValidationError"))
            } else {
                Ok(())
            }
        });

        let ok = Message::new("a", "e", json!({"x": 1}));
        let bad = Message::new("a", "e", serde_json::Value::Null);

        assert!(handler.handle(&ok).await.is_ok());
        let err = handler.handle(&bad).await.unwrap_err();
        assert_eq!(err.class, "ValidationError");
        assert_eq!(err.to_string(), "ValidationError: empty payload");
    }

    #[test]
    fn test_batch_result_counts() {
        let result = BatchPublishResult {
            items: vec![
                BatchItemResult {
                    index: 0,
                    message_id: "a".into(),
                    backend_id: Some("1-0".into()),
                    error: None,
                },
                BatchItemResult {
                    index: 1,
                    message_id: "b".into(),
                    backend_id: None,
                    error: Some("rejected".into()),
                },
            ],
        };
        assert_eq!(result.succeeded(), 1);
        assert_eq!(result.failed(), 1);
        assert_eq!(result.backend_ids(), vec!["1-0"]);
    }
}
