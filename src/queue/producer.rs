//! Asynchronous producer queue
//!
//! Decouples the publishing caller from the network send. `enqueue` is a
//! single ring-buffer push; a flush path (the background worker, or an
//! explicit `flush`/`drain`) moves batches into a [`QueueSink`].
//!
//! Flushing uses a dual trigger: a batch is flushed as soon as `batch_size`
//! entries are waiting, or when `flush_interval` has passed since the previous
//! flush and anything is waiting.

use crate::broker::error::BackendError;
use crate::core::shutdown::ShutdownCoordinator;
use crate::core::time::{system_clock, TimeProvider};
use crate::queue::envelope::QueuedEnvelope;
use crate::queue::error::{QueueError, QueueResult};
use crate::queue::ring_buffer::RingBuffer;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

/// Destination the flush path publishes into
#[async_trait]
pub trait QueueSink: Send + Sync {
    /// Publish one queued envelope
    async fn send(&self, envelope: &QueuedEnvelope) -> Result<(), BackendError>;

    /// Client-level flush/commit, issued once per batch
    async fn flush_batch(&self) -> Result<(), BackendError>;
}

#[derive(Debug, Clone)]
pub struct AsyncQueueConfig {
    pub capacity: usize,
    pub batch_size: usize,
    pub flush_interval: Duration,
    /// Grow/shrink the batch target with load, bounded by `[min_batch, max_batch]`
    pub adaptive: bool,
    pub min_batch: usize,
    pub max_batch: usize,
}

impl Default for AsyncQueueConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            batch_size: 100,
            flush_interval: Duration::from_millis(50),
            adaptive: false,
            min_batch: 10,
            max_batch: 1_000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueStats {
    pub size: usize,
    pub capacity: usize,
    pub enqueued: u64,
    pub rejected: u64,
    pub flushed: u64,
    pub failed: u64,
    pub flush_count: u64,
    pub batch_target: usize,
    pub draining: bool,
}

pub struct AsyncProducerQueue {
    ring: RingBuffer<QueuedEnvelope>,
    config: AsyncQueueConfig,
    batch_target: AtomicUsize,
    last_flush_ms: AtomicU64,
    draining: AtomicBool,
    enqueued: AtomicU64,
    rejected: AtomicU64,
    flushed: AtomicU64,
    failed: AtomicU64,
    flush_count: AtomicU64,
    /// Serialises flushers and keeps the batch buffer warm between flushes
    batch: Mutex<Vec<QueuedEnvelope>>,
    batch_ready: Notify,
    epoch: Instant,
    clock: Arc<dyn TimeProvider>,
}

impl std::fmt::Debug for AsyncProducerQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncProducerQueue")
            .field("stats", &self.stats())
            .finish()
    }
}

impl AsyncProducerQueue {
    pub fn new(config: AsyncQueueConfig) -> QueueResult<Self> {
        Self::with_clock(config, system_clock())
    }

    pub fn with_clock(config: AsyncQueueConfig, clock: Arc<dyn TimeProvider>) -> QueueResult<Self> {
        if config.batch_size == 0 {
            return Err(QueueError::InvalidCapacity {
                capacity: config.batch_size,
                reason: "batch size must be greater than 0".to_string(),
            });
        }
        if config.adaptive && (config.min_batch == 0 || config.min_batch > config.max_batch) {
            return Err(QueueError::InvalidCapacity {
                capacity: config.min_batch,
                reason: format!(
                    "adaptive batch bounds [{}, {}] are invalid",
                    config.min_batch, config.max_batch
                ),
            });
        }

        let ring = RingBuffer::new(config.capacity)?;
        let max_batch = if config.adaptive {
            config.max_batch
        } else {
            config.batch_size
        };
        let epoch = clock.now();

        Ok(Self {
            ring,
            batch_target: AtomicUsize::new(config.batch_size),
            last_flush_ms: AtomicU64::new(0),
            draining: AtomicBool::new(false),
            enqueued: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            flushed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            flush_count: AtomicU64::new(0),
            batch: Mutex::new(Vec::with_capacity(max_batch)),
            batch_ready: Notify::new(),
            epoch,
            clock,
            config,
        })
    }

    /// Queue a publish; `false` signals backpressure (full or draining)
    pub fn enqueue(
        &self,
        topic: impl Into<String>,
        payload: impl Into<String>,
        key: Option<String>,
        partition: Option<u32>,
    ) -> bool {
        self.enqueue_envelope(QueuedEnvelope::new(topic, payload, key, partition))
    }

    pub fn enqueue_envelope(&self, envelope: QueuedEnvelope) -> bool {
        self.try_enqueue(envelope).is_ok()
    }

    /// Queue a publish, handing the envelope back on backpressure so the
    /// caller can fall back to a direct send
    pub fn try_enqueue(&self, envelope: QueuedEnvelope) -> Result<(), QueuedEnvelope> {
        if self.draining.load(Ordering::Acquire) {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(envelope);
        }
        match self.ring.push(envelope) {
            Ok(()) => {
                self.enqueued.fetch_add(1, Ordering::Relaxed);
                if self.ring.len() >= self.batch_target.load(Ordering::Relaxed) {
                    self.batch_ready.notify_one();
                }
                Ok(())
            }
            Err(envelope) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                Err(envelope)
            }
        }
    }

    pub fn size(&self) -> usize {
        self.ring.len()
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    pub fn batch_target(&self) -> usize {
        self.batch_target.load(Ordering::Relaxed)
    }

    /// Whether the size or time trigger has fired
    pub fn should_flush(&self) -> bool {
        let size = self.ring.len();
        if size == 0 {
            return false;
        }
        if size >= self.batch_target.load(Ordering::Relaxed) {
            return true;
        }
        let since_last = self
            .now_ms()
            .saturating_sub(self.last_flush_ms.load(Ordering::Relaxed));
        since_last >= self.config.flush_interval.as_millis() as u64
    }

    /// Flush one batch into `sink`
    ///
    /// Without `force` this is a no-op unless a trigger fired. Per-message send
    /// failures are logged and counted; the rest of the batch still goes out.
    /// Returns the number of envelopes sent successfully.
    pub async fn flush(&self, sink: &dyn QueueSink, force: bool) -> usize {
        if !force && !self.should_flush() {
            return 0;
        }

        let mut batch = self.batch.lock().await;
        let target = self.batch_target.load(Ordering::Relaxed);
        batch.clear();
        let taken = self.ring.pop_into(&mut batch, target);
        if taken == 0 {
            self.mark_flushed();
            return 0;
        }

        let mut sent = 0;
        for envelope in batch.iter() {
            match sink.send(envelope).await {
                Ok(()) => sent += 1,
                Err(e) => {
                    self.failed.fetch_add(1, Ordering::Relaxed);
                    log::warn!("Queued publish to '{}' failed: {}", envelope.topic, e);
                }
            }
        }
        batch.clear();

        if let Err(e) = sink.flush_batch().await {
            log::warn!("Batch flush of {} messages failed: {}", taken, e);
        }

        self.flushed.fetch_add(sent as u64, Ordering::Relaxed);
        self.flush_count.fetch_add(1, Ordering::Relaxed);
        self.mark_flushed();
        self.adapt_batch_target(taken, target);

        log::debug!(
            "Flushed {}/{} queued messages ({} remaining)",
            sent,
            taken,
            self.ring.len()
        );
        sent
    }

    /// Flush repeatedly until empty or `timeout` elapses
    ///
    /// New enqueues are rejected while draining.
    pub async fn drain(&self, sink: &dyn QueueSink, timeout: Duration) -> usize {
        self.draining.store(true, Ordering::Release);
        let deadline = tokio::time::Instant::now() + timeout;
        let mut total = 0;

        while !self.ring.is_empty() {
            if tokio::time::Instant::now() >= deadline {
                log::warn!(
                    "Drain timed out after {:?} with {} messages still queued",
                    timeout,
                    self.ring.len()
                );
                break;
            }
            total += self.flush(sink, true).await;
            tokio::task::yield_now().await;
        }

        self.draining.store(false, Ordering::Release);
        total
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            size: self.ring.len(),
            capacity: self.ring.capacity(),
            enqueued: self.enqueued.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            flushed: self.flushed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            flush_count: self.flush_count.load(Ordering::Relaxed),
            batch_target: self.batch_target.load(Ordering::Relaxed),
            draining: self.is_draining(),
        }
    }

    /// Run the flush path in the background until shutdown
    ///
    /// Wakes when a full batch is waiting or at the flush interval, whichever
    /// comes first. Remaining entries are drained on shutdown.
    pub fn spawn_flush_worker(
        self: &Arc<Self>,
        sink: Arc<dyn QueueSink>,
        shutdown: ShutdownCoordinator,
        drain_timeout: Duration,
    ) -> JoinHandle<()> {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            let mut shutdown_rx = shutdown.subscribe();
            let tick = queue.config.flush_interval.max(Duration::from_millis(1));
            while !shutdown.is_shutdown_requested() {
                tokio::select! {
                    _ = queue.batch_ready.notified() => {}
                    _ = tokio::time::sleep(tick) => {}
                    _ = shutdown_rx.recv() => break,
                }
                while queue.should_flush() {
                    if queue.flush(sink.as_ref(), false).await == 0 && queue.size() == 0 {
                        break;
                    }
                }
            }
            let drained = queue.drain(sink.as_ref(), drain_timeout).await;
            log::debug!("Flush worker stopped, drained {} messages", drained);
        })
    }

    fn now_ms(&self) -> u64 {
        self.clock.now().saturating_duration_since(self.epoch).as_millis() as u64
    }

    fn mark_flushed(&self) {
        self.last_flush_ms.store(self.now_ms(), Ordering::Relaxed);
    }

    fn adapt_batch_target(&self, taken: usize, target: usize) {
        if !self.config.adaptive {
            return;
        }
        let next = if taken >= target && self.ring.len() >= target {
            (target * 2).min(self.config.max_batch)
        } else if taken < target / 4 {
            (target / 2).max(self.config.min_batch)
        } else {
            target
        };
        if next != target {
            self.batch_target.store(next, Ordering::Relaxed);
            log::debug!("Adaptive batch target {} -> {}", target, next);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::time::MockTimeProvider;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingSink {
        sent: StdMutex<Vec<String>>,
        flushes: AtomicUsize,
        fail_topic: Option<String>,
    }

    #[async_trait]
    impl QueueSink for RecordingSink {
        async fn send(&self, envelope: &QueuedEnvelope) -> Result<(), BackendError> {
            if self.fail_topic.as_deref() == Some(envelope.topic.as_str()) {
                return Err(BackendError::Rejected("poisoned topic".into()));
            }
            self.sent.lock().unwrap().push(envelope.payload.clone());
            Ok(())
        }

        async fn flush_batch(&self) -> Result<(), BackendError> {
            self.flushes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn queue(capacity: usize, batch_size: usize) -> AsyncProducerQueue {
        AsyncProducerQueue::new(AsyncQueueConfig {
            capacity,
            batch_size,
            flush_interval: Duration::from_secs(3600),
            ..AsyncQueueConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_enqueue_until_full() {
        let queue = queue(5, 10);
        for i in 0..5 {
            assert!(queue.enqueue("t", format!("m{}", i), None, None));
        }
        assert_eq!(queue.size(), 5);
        assert!(!queue.enqueue("t", "overflow", None, None));
        assert_eq!(queue.size(), 5);
        assert_eq!(queue.stats().rejected, 1);
    }

    #[tokio::test]
    async fn test_flush_respects_triggers() {
        let clock = MockTimeProvider::new();
        let queue = AsyncProducerQueue::with_clock(
            AsyncQueueConfig {
                capacity: 100,
                batch_size: 10,
                flush_interval: Duration::from_millis(50),
                ..AsyncQueueConfig::default()
            },
            Arc::new(clock.clone()),
        )
        .unwrap();
        let sink = RecordingSink::default();

        clock.advance_time(Duration::from_millis(10));
        queue.enqueue("t", "a", None, None);
        assert_eq!(queue.flush(&sink, false).await, 0);

        clock.advance_time(Duration::from_millis(60));
        assert_eq!(queue.flush(&sink, false).await, 1);
        assert_eq!(sink.flushes.load(Ordering::SeqCst), 1);

        for i in 0..10 {
            queue.enqueue("t", format!("{}", i), None, None);
        }
        assert_eq!(queue.flush(&sink, false).await, 10);
    }

    #[tokio::test]
    async fn test_failed_sends_do_not_abort_batch() {
        let queue = queue(10, 10);
        let sink = RecordingSink {
            fail_topic: Some("bad".into()),
            ..RecordingSink::default()
        };

        queue.enqueue("good", "1", None, None);
        queue.enqueue("bad", "2", None, None);
        queue.enqueue("good", "3", None, None);

        assert_eq!(queue.flush(&sink, true).await, 2);
        assert_eq!(*sink.sent.lock().unwrap(), vec!["1", "3"]);
        assert_eq!(sink.flushes.load(Ordering::SeqCst), 1);
        let stats = queue.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.flushed, 2);
        assert_eq!(stats.size, 0);
    }

    #[tokio::test]
    async fn test_drain_empties_queue_and_rejects_during_drain() {
        let queue = Arc::new(queue(1000, 7));
        for i in 0..50 {
            queue.enqueue("t", format!("{}", i), None, None);
        }

        struct CheckingSink {
            queue: Arc<AsyncProducerQueue>,
            rejected_during_drain: AtomicBool,
        }

        #[async_trait]
        impl QueueSink for CheckingSink {
            async fn send(&self, _: &QueuedEnvelope) -> Result<(), BackendError> {
                if !self.queue.enqueue("t", "late", None, None) {
                    self.rejected_during_drain.store(true, Ordering::SeqCst);
                }
                Ok(())
            }
            async fn flush_batch(&self) -> Result<(), BackendError> {
                Ok(())
            }
        }

        let sink = CheckingSink {
            queue: queue.clone(),
            rejected_during_drain: AtomicBool::new(false),
        };
        let drained = queue.drain(&sink, Duration::from_secs(5)).await;

        assert_eq!(drained, 50);
        assert_eq!(queue.size(), 0);
        assert!(sink.rejected_during_drain.load(Ordering::SeqCst));
        assert!(!queue.is_draining());
        assert_eq!(queue.stats().flush_count, 8);
    }

    #[tokio::test]
    async fn test_adaptive_batch_grows_and_shrinks() {
        let queue = AsyncProducerQueue::new(AsyncQueueConfig {
            capacity: 1000,
            batch_size: 10,
            flush_interval: Duration::from_secs(3600),
            adaptive: true,
            min_batch: 5,
            max_batch: 40,
        })
        .unwrap();
        let sink = RecordingSink::default();

        for i in 0..200 {
            queue.enqueue("t", format!("{}", i), None, None);
        }
        queue.flush(&sink, true).await;
        assert_eq!(queue.batch_target(), 20);
        queue.flush(&sink, true).await;
        assert_eq!(queue.batch_target(), 40);
        queue.flush(&sink, true).await;
        assert_eq!(queue.batch_target(), 40);

        queue.drain(&sink, Duration::from_secs(1)).await;
        queue.enqueue("t", "lonely", None, None);
        queue.flush(&sink, true).await;
        assert_eq!(queue.batch_target(), 20);
    }

    #[tokio::test]
    async fn test_invalid_config() {
        assert!(AsyncProducerQueue::new(AsyncQueueConfig {
            batch_size: 0,
            ..AsyncQueueConfig::default()
        })
        .is_err());
        assert!(AsyncProducerQueue::new(AsyncQueueConfig {
            adaptive: true,
            min_batch: 50,
            max_batch: 10,
            ..AsyncQueueConfig::default()
        })
        .is_err());
    }
}
