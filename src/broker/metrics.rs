//! Per-driver publish/consume counters

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Lock-free counters updated on every publish and consume attempt
#[derive(Debug, Default)]
pub struct BrokerMetrics {
    publish_ok: AtomicU64,
    publish_failed: AtomicU64,
    consume_ok: AtomicU64,
    consume_failed: AtomicU64,
    dead_lettered: AtomicU64,
    circuit_rejections: AtomicU64,
    queued: AtomicU64,
    publish_latency_us_total: AtomicU64,
    publish_latency_us_max: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BrokerMetricsSnapshot {
    pub publish_ok: u64,
    pub publish_failed: u64,
    pub consume_ok: u64,
    pub consume_failed: u64,
    pub dead_lettered: u64,
    pub circuit_rejections: u64,
    /// Publishes handed to a producer queue instead of sent directly
    pub queued: u64,
    pub avg_publish_latency_us: u64,
    pub max_publish_latency_us: u64,
}

impl BrokerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_publish(&self, driver: &str, channel: &str, ok: bool, latency: Duration) {
        let micros = latency.as_micros() as u64;
        if ok {
            self.publish_ok.fetch_add(1, Ordering::Relaxed);
        } else {
            self.publish_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.publish_latency_us_total
            .fetch_add(micros, Ordering::Relaxed);
        self.publish_latency_us_max
            .fetch_max(micros, Ordering::Relaxed);
        log::debug!(
            "metric publish driver={} channel={} ok={} latency_us={}",
            driver,
            channel,
            ok,
            micros
        );
    }

    pub fn record_queued(&self) {
        self.queued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_consume(&self, driver: &str, channel: &str, ok: bool) {
        if ok {
            self.consume_ok.fetch_add(1, Ordering::Relaxed);
        } else {
            self.consume_failed.fetch_add(1, Ordering::Relaxed);
        }
        log::debug!(
            "metric consume driver={} channel={} ok={}",
            driver,
            channel,
            ok
        );
    }

    pub fn record_dead_lettered(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_circuit_rejection(&self) {
        self.circuit_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> BrokerMetricsSnapshot {
        let publish_ok = self.publish_ok.load(Ordering::Relaxed);
        let publish_failed = self.publish_failed.load(Ordering::Relaxed);
        let attempts = publish_ok + publish_failed;
        let total_latency = self.publish_latency_us_total.load(Ordering::Relaxed);

        BrokerMetricsSnapshot {
            publish_ok,
            publish_failed,
            consume_ok: self.consume_ok.load(Ordering::Relaxed),
            consume_failed: self.consume_failed.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            circuit_rejections: self.circuit_rejections.load(Ordering::Relaxed),
            queued: self.queued.load(Ordering::Relaxed),
            avg_publish_latency_us: if attempts == 0 {
                0
            } else {
                total_latency / attempts
            },
            max_publish_latency_us: self.publish_latency_us_max.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_aggregates() {
        let metrics = BrokerMetrics::new();
        metrics.record_publish("stream", "a", true, Duration::from_micros(100));
        metrics.record_publish("stream", "a", false, Duration::from_micros(300));
        metrics.record_consume("stream", "a", true);
        metrics.record_dead_lettered();
        metrics.record_circuit_rejection();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.publish_ok, 1);
        assert_eq!(snapshot.publish_failed, 1);
        assert_eq!(snapshot.avg_publish_latency_us, 200);
        assert_eq!(snapshot.max_publish_latency_us, 300);
        assert_eq!(snapshot.consume_ok, 1);
        assert_eq!(snapshot.dead_lettered, 1);
        assert_eq!(snapshot.circuit_rejections, 1);
    }
}
