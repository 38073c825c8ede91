//! Handler invocation with retry and dead-lettering
//!
//! Every driver's consume loop hands each message to [`HandlerInvoker::dispatch`].
//! A failing handler is retried with exponential backoff until the retry budget
//! is spent, then the message goes to the dead letter queue. One message's
//! outcome never affects the rest of its batch.

use crate::broker::dead_letter::{retry_delay, DeadLetterQueue};
use crate::broker::message::Message;
use crate::broker::metrics::BrokerMetrics;
use crate::broker::traits::{HandlerError, MessageHandler};
use crate::core::retry::sleep_unless_shutdown;
use crate::core::shutdown::ShutdownCoordinator;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Handled { attempts: u32 },
    /// Retries exhausted; `written` tells whether the dead-letter write succeeded
    DeadLettered { attempts: u32, written: bool },
    /// Shutdown interrupted the retry backoff; the message was not settled
    Abandoned { attempts: u32 },
}

impl DispatchOutcome {
    /// Whether the backend delivery can be acknowledged
    pub fn is_settled(&self) -> bool {
        !matches!(self, DispatchOutcome::Abandoned { .. })
    }
}

pub struct HandlerInvoker {
    driver: &'static str,
    max_retries: u32,
    base_delay: Duration,
    dead_letter: Option<Arc<DeadLetterQueue>>,
    metrics: Arc<BrokerMetrics>,
    shutdown: ShutdownCoordinator,
}

impl HandlerInvoker {
    pub fn new(
        driver: &'static str,
        max_retries: u32,
        base_delay: Duration,
        dead_letter: Option<Arc<DeadLetterQueue>>,
        metrics: Arc<BrokerMetrics>,
        shutdown: ShutdownCoordinator,
    ) -> Self {
        Self {
            driver,
            max_retries,
            base_delay,
            dead_letter,
            metrics,
            shutdown,
        }
    }

    pub fn dead_letter(&self) -> Option<&Arc<DeadLetterQueue>> {
        self.dead_letter.as_ref()
    }

    /// Run `handler` for `message`, retrying and dead-lettering as needed
    pub async fn dispatch(
        &self,
        handler: &dyn MessageHandler,
        topic: &str,
        message: &Message,
    ) -> DispatchOutcome {
        let mut attempt: u32 = 0;
        let last_error: HandlerError = loop {
            attempt += 1;
            match handler.handle(message).await {
                Ok(()) => {
                    self.metrics.record_consume(self.driver, message.channel(), true);
                    return DispatchOutcome::Handled { attempts: attempt };
                }
                Err(error) => {
                    self.metrics.record_consume(self.driver, message.channel(), false);
                    let retries_done = attempt - 1;
                    if retries_done >= self.max_retries {
                        break error;
                    }
                    let delay = retry_delay(retries_done, self.base_delay);
                    log::debug!(
                        "Handler '{}' failed on message {} (attempt {}), retrying in {:?}: {}",
                        handler.name(),
                        message.id(),
                        attempt,
                        delay,
                        error
                    );
                    if !sleep_unless_shutdown(delay, &self.shutdown).await {
                        log::info!(
                            "Shutdown during retry of message {}; leaving it unsettled",
                            message.id()
                        );
                        return DispatchOutcome::Abandoned { attempts: attempt };
                    }
                }
            }
        };

        let retry_count = attempt - 1;
        let Some(dead_letter) = &self.dead_letter else {
            log::error!(
                "Handler '{}' gave up on message {} after {} retries and no dead letter queue is configured: {}",
                handler.name(),
                message.id(),
                retry_count,
                last_error
            );
            return DispatchOutcome::DeadLettered {
                attempts: attempt,
                written: false,
            };
        };

        let mut metadata = BTreeMap::new();
        metadata.insert("handler".to_string(), Value::from(handler.name()));
        metadata.insert("driver".to_string(), Value::from(self.driver));

        let written = dead_letter
            .send(topic, message, &last_error, retry_count, metadata)
            .await;
        if written {
            self.metrics.record_dead_lettered();
        }
        DispatchOutcome::DeadLettered {
            attempts: attempt,
            written,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::dead_letter::DeadLetterConfig;
    use crate::broker::error::BackendError;
    use crate::broker::traits::{handler_fn, RawPublisher};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        payloads: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl RawPublisher for Recorder {
        async fn publish_raw(
            &self,
            _destination: &str,
            _key: Option<&str>,
            payload: &str,
        ) -> Result<String, BackendError> {
            self.payloads.lock().unwrap().push(payload.to_string());
            Ok("0".into())
        }
    }

    fn invoker(max_retries: u32, recorder: Arc<Recorder>) -> HandlerInvoker {
        let dlq = DeadLetterQueue::new(
            DeadLetterConfig {
                max_retries,
                ..DeadLetterConfig::default()
            },
            recorder,
        );
        HandlerInvoker::new(
            "stream",
            max_retries,
            Duration::from_millis(1),
            Some(Arc::new(dlq)),
            Arc::new(BrokerMetrics::new()),
            ShutdownCoordinator::detached(),
        )
    }

    #[tokio::test]
    async fn test_always_failing_handler_is_dead_lettered_once() {
        let recorder = Arc::new(Recorder::default());
        let invoker = invoker(3, recorder.clone());
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let handler = handler_fn("flaky", move |_m: Message| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(HandlerError::new("always fails"))
            }
        });
        let message = Message::new("orders", "created", json!({}));

        let outcome = invoker.dispatch(handler.as_ref(), "app.orders", &message).await;

        assert_eq!(
            outcome,
            DispatchOutcome::DeadLettered {
                attempts: 4,
                written: true
            }
        );
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        let payloads = recorder.payloads.lock().unwrap();
        assert_eq!(payloads.len(), 1);
        let record: Value = serde_json::from_str(&payloads[0]).unwrap();
        assert_eq!(record["dlq_metadata"]["retry_count"], 3);
        assert_eq!(record["metadata"]["handler"], "flaky");
    }

    #[tokio::test]
    async fn test_recovering_handler_is_not_dead_lettered() {
        let recorder = Arc::new(Recorder::default());
        let invoker = invoker(3, recorder.clone());
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let handler = handler_fn("recovers", move |_m: Message| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(HandlerError::new("transient"))
                } else {
                    Ok(())
                }
            }
        });
        let message = Message::new("orders", "created", json!({}));

        let outcome = invoker.dispatch(handler.as_ref(), "app.orders", &message).await;

        assert_eq!(outcome, DispatchOutcome::Handled { attempts: 3 });
        assert!(recorder.payloads.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_abandons_retry() {
        let (shutdown, _rx) = ShutdownCoordinator::new();
        shutdown.trigger_shutdown();
        let invoker = HandlerInvoker::new(
            "amqp",
            5,
            Duration::from_secs(10),
            None,
            Arc::new(BrokerMetrics::new()),
            shutdown,
        );
        let handler = handler_fn("fails", |_m: Message| async { Err(HandlerError::new("x")) });
        let message = Message::new("a", "b", json!({}));

        let outcome = invoker.dispatch(handler.as_ref(), "a", &message).await;

        assert_eq!(outcome, DispatchOutcome::Abandoned { attempts: 1 });
        assert!(!outcome.is_settled());
    }

    #[tokio::test]
    async fn test_zero_retries_dead_letters_first_failure() {
        let recorder = Arc::new(Recorder::default());
        let invoker = invoker(0, recorder.clone());
        let handler = handler_fn("fails", |_m: Message| async { Err(HandlerError::new("x")) });
        let message = Message::new("a", "b", json!({}));

        let outcome = invoker.dispatch(handler.as_ref(), "a", &message).await;

        assert_eq!(
            outcome,
            DispatchOutcome::DeadLettered {
                attempts: 1,
                written: true
            }
        );
    }
}
