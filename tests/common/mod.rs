//! Shared helpers for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use relaybus::broker::{
    handler_fn, BrokerContext, HandlerError, LoopControl, LoopObserver, LoopReport, Message,
    MessageHandler,
};
use relaybus::config::{BrokerConfig, DriverKind};
use relaybus::core::shutdown::ShutdownCoordinator;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const ALL_DRIVERS: [DriverKind; 3] = [DriverKind::Stream, DriverKind::PubSub, DriverKind::Amqp];

pub fn context() -> BrokerContext {
    BrokerContext::new(ShutdownCoordinator::detached())
}

/// Configuration with fast retries so failure paths finish quickly
pub fn fast_config(driver: DriverKind) -> BrokerConfig {
    let mut config = BrokerConfig::default();
    config.driver = driver;
    config.retry.max_attempts = 1;
    config.dead_letter.base_delay_ms = 1;
    config
}

/// Stops the consume loop once `n` messages are settled
pub struct StopAfter(pub u64);

#[async_trait]
impl LoopObserver for StopAfter {
    async fn on_iteration(&self, report: LoopReport) -> LoopControl {
        if report.processed + report.dead_lettered >= self.0 {
            LoopControl::Stop
        } else {
            LoopControl::Continue
        }
    }
}

/// Handler that records every message it sees
pub fn collecting_handler(name: &str) -> (Arc<dyn MessageHandler>, Arc<Mutex<Vec<Message>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let handler = handler_fn(name.to_string(), move |message: Message| {
        let sink = sink.clone();
        async move {
            sink.lock().unwrap().push(message);
            Ok(())
        }
    });
    (handler, seen)
}

/// Handler that always fails, counting attempts
pub fn failing_handler(name: &str) -> (Arc<dyn MessageHandler>, Arc<AtomicUsize>) {
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    let handler = handler_fn(name.to_string(), move |_message: Message| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(HandlerError::new("downstream rejected").with_class("DownstreamError"))
        }
    });
    (handler, attempts)
}

/// Run `future` with a generous ceiling so a hung loop fails the test instead of the suite
pub async fn bounded<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(10), future)
        .await
        .expect("operation did not finish in time")
}
