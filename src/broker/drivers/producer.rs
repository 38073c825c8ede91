//! Producer side of a driver
//!
//! A publish goes to the shared queue when one is configured, otherwise to the
//! in-process async queue, otherwise straight to the backend. When a queue
//! pushes back the publish either falls back to a direct send or fails with
//! `QueueFull`, depending on configuration.

use crate::broker::circuit_breaker::CircuitBreaker;
use crate::broker::error::{BackendError, BrokerError, BrokerResult};
use crate::broker::metrics::BrokerMetrics;
use crate::config::BrokerConfig;
use crate::core::shutdown::ShutdownCoordinator;
use crate::queue::{
    AsyncProducerQueue, QueueError, QueueSink, QueueStats, QueuedEnvelope, SharedQueue,
    SharedQueueStats,
};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// Sink used by the queue flush paths: every send goes through the breaker
/// and is counted like a direct publish
pub(crate) struct GuardedSink {
    driver: &'static str,
    inner: Arc<dyn QueueSink>,
    breaker: Arc<CircuitBreaker>,
    metrics: Arc<BrokerMetrics>,
}

#[async_trait]
impl QueueSink for GuardedSink {
    async fn send(&self, envelope: &QueuedEnvelope) -> Result<(), BackendError> {
        let started = Instant::now();
        let result = self.breaker.call(|| self.inner.send(envelope)).await;
        self.metrics
            .record_publish(self.driver, &envelope.topic, result.is_ok(), started.elapsed());
        result
    }

    async fn flush_batch(&self) -> Result<(), BackendError> {
        self.inner.flush_batch().await
    }
}

struct SharedPath {
    queue: Arc<SharedQueue>,
    flush_batch: usize,
    flush_interval: Duration,
    run_worker: bool,
}

pub(crate) struct ProducerPath {
    driver: &'static str,
    sink: Arc<dyn QueueSink>,
    guarded: Arc<GuardedSink>,
    breaker: Arc<CircuitBreaker>,
    metrics: Arc<BrokerMetrics>,
    async_queue: Option<Arc<AsyncProducerQueue>>,
    shared: Option<SharedPath>,
    fallback_direct: bool,
    drain_timeout: Duration,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ProducerPath {
    pub(crate) fn new(
        driver: &'static str,
        config: &BrokerConfig,
        sink: Arc<dyn QueueSink>,
        breaker: Arc<CircuitBreaker>,
        metrics: Arc<BrokerMetrics>,
    ) -> BrokerResult<Self> {
        let async_queue = if config.async_queue.enabled {
            Some(Arc::new(AsyncProducerQueue::new(config.async_queue_config())?))
        } else {
            None
        };
        let shared = if config.shared_queue.enabled {
            let queue = SharedQueue::open(config.shared_queue_config())?;
            log::debug!("Shared producer queue at {}", queue.path().display());
            Some(SharedPath {
                queue: Arc::new(queue),
                flush_batch: config.shared_queue.flush_batch.max(1),
                flush_interval: Duration::from_millis(config.shared_queue.flush_interval_ms),
                run_worker: config.shared_queue.flush_worker,
            })
        } else {
            None
        };

        Ok(Self {
            driver,
            guarded: Arc::new(GuardedSink {
                driver,
                inner: Arc::clone(&sink),
                breaker: Arc::clone(&breaker),
                metrics: Arc::clone(&metrics),
            }),
            sink,
            breaker,
            metrics,
            async_queue,
            shared,
            fallback_direct: config.async_queue.fallback_direct,
            drain_timeout: Duration::from_millis(config.async_queue.drain_timeout_ms),
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Hand one envelope to the configured path
    pub(crate) async fn submit(&self, envelope: QueuedEnvelope, channel: &str) -> BrokerResult<()> {
        let mut envelope = envelope;

        if let Some(shared) = &self.shared {
            match shared.queue.enqueue(&envelope) {
                Ok(true) => {
                    self.metrics.record_queued();
                    return Ok(());
                }
                Ok(false) => {
                    if !self.fallback_direct {
                        return Err(QueueError::QueueFull {
                            capacity: shared.queue.capacity(),
                        }
                        .into());
                    }
                    log::debug!("Shared queue full, publishing to '{}' directly", channel);
                    return self.send_direct(&envelope, channel).await;
                }
                Err(QueueError::PayloadTooLarge { size, max }) => {
                    log::debug!(
                        "Payload of {} bytes exceeds the {} byte shared slot, publishing directly",
                        size,
                        max
                    );
                    return self.send_direct(&envelope, channel).await;
                }
                Err(e) => return Err(e.into()),
            }
        }

        if let Some(queue) = &self.async_queue {
            match queue.try_enqueue(envelope) {
                Ok(()) => {
                    self.metrics.record_queued();
                    return Ok(());
                }
                Err(rejected) => {
                    if !self.fallback_direct {
                        return Err(QueueError::QueueFull {
                            capacity: queue.capacity(),
                        }
                        .into());
                    }
                    log::debug!("Producer queue full, publishing to '{}' directly", channel);
                    envelope = rejected;
                }
            }
        }

        self.send_direct(&envelope, channel).await
    }

    /// Publish synchronously through the breaker
    pub(crate) async fn send_direct(&self, envelope: &QueuedEnvelope, channel: &str) -> BrokerResult<()> {
        let started = Instant::now();
        let result = self
            .breaker
            .call(|| async { self.sink.send(envelope).await.map_err(BrokerError::from) })
            .await;

        match result {
            Ok(()) => {
                self.metrics
                    .record_publish(self.driver, channel, true, started.elapsed());
                Ok(())
            }
            Err(BrokerError::CircuitOpen(open)) => {
                self.metrics.record_circuit_rejection();
                Err(BrokerError::CircuitOpen(open))
            }
            Err(BrokerError::Backend(e)) => {
                self.metrics
                    .record_publish(self.driver, channel, false, started.elapsed());
                Err(BrokerError::publish_failed(channel, e))
            }
            Err(other) => {
                self.metrics
                    .record_publish(self.driver, channel, false, started.elapsed());
                Err(other)
            }
        }
    }

    /// Start background flush workers; no-op when already running
    pub(crate) fn start_workers(&self, shutdown: &ShutdownCoordinator) {
        let Ok(mut workers) = self.workers.lock() else {
            return;
        };
        if !workers.is_empty() {
            return;
        }
        let sink: Arc<dyn QueueSink> = self.guarded.clone();
        if let Some(queue) = &self.async_queue {
            workers.push(queue.spawn_flush_worker(
                Arc::clone(&sink),
                shutdown.clone(),
                self.drain_timeout,
            ));
        }
        if let Some(shared) = self.shared.as_ref().filter(|s| s.run_worker) {
            workers.push(shared.queue.spawn_flush_worker(
                Arc::clone(&sink),
                shared.flush_batch,
                shared.flush_interval,
                shutdown.clone(),
            ));
        }
        if !workers.is_empty() {
            log::debug!("Started {} flush worker(s) for {} driver", workers.len(), self.driver);
        }
    }

    /// Drain queued publishes into the backend, waiting at most `timeout`
    pub(crate) async fn drain(&self, timeout: Duration) -> usize {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut total = 0;
        if let Some(queue) = &self.async_queue {
            total += queue.drain(self.guarded.as_ref(), timeout).await;
        }
        if let Some(shared) = self.shared.as_ref().filter(|s| s.run_worker) {
            while tokio::time::Instant::now() < deadline {
                let flushed = shared
                    .queue
                    .flush_to(self.guarded.as_ref(), shared.flush_batch)
                    .await;
                if flushed == 0 {
                    break;
                }
                total += flushed;
            }
        }
        total
    }

    pub(crate) fn drain_timeout(&self) -> Duration {
        self.drain_timeout
    }

    pub(crate) fn stop_workers(&self) {
        if let Ok(mut workers) = self.workers.lock() {
            for worker in workers.drain(..) {
                worker.abort();
            }
        }
    }

    pub(crate) fn async_stats(&self) -> Option<QueueStats> {
        self.async_queue.as_ref().map(|q| q.stats())
    }

    pub(crate) fn shared_stats(&self) -> Option<SharedQueueStats> {
        self.shared.as_ref().map(|s| s.queue.stats())
    }
}
