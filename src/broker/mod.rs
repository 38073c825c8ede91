//! Broker Abstraction
//!
//! One publish/subscribe contract over three backend families, with the
//! resilience pieces every driver shares.
//!
//! # Overview
//!
//! - **BrokerInterface**: connect, publish, subscribe, consume, health
//! - **BrokerFactory**: picks the driver from configuration, once
//! - **TopicStrategy**: channel to topic/partition mapping and wildcard matching
//! - **CircuitBreaker**: fails fast while a backend is down
//! - **DeadLetterQueue**: parks messages whose handler kept failing
//! - **MemoryManager**: bounds consumer memory, runs cleanup hooks
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐ publish ┌──────────────┐  breaker  ┌──────────────┐
//! │   caller     │ ──────► │    driver    │ ────────► │ backend      │
//! └──────────────┘         │ (stream,     │           │ client trait │
//!                          │  pubsub,     │ ◄──────── │              │
//! ┌──────────────┐ handle  │  amqp)       │  fetch    └──────────────┘
//! │   handler    │ ◄────── │              │
//! └──────────────┘         └──────┬───────┘
//!                                 │ exhausted retries
//!                                 ▼
//!                          ┌──────────────┐
//!                          │ dead letters │
//!                          └──────────────┘
//! ```
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use relaybus::broker::{BrokerContext, BrokerFactory, Message};
//! use relaybus::config::BrokerConfig;
//! use relaybus::core::shutdown::ShutdownCoordinator;
//! use serde_json::json;
//!
//! # async fn example() -> relaybus::broker::BrokerResult<()> {
//! let context = BrokerContext::new(ShutdownCoordinator::detached());
//! let broker = BrokerFactory::connect(&BrokerConfig::default(), &context).await?;
//! broker
//!     .publish("orders.created", Message::new("orders.created", "created", json!({"id": 7})))
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod backends;
pub mod drivers;

pub(crate) mod circuit_breaker;
pub(crate) mod dead_letter;
pub(crate) mod dispatch;
pub(crate) mod error;
pub(crate) mod factory;
pub(crate) mod health;
pub(crate) mod memory_manager;
pub(crate) mod message;
pub(crate) mod metrics;
pub(crate) mod topic;
pub(crate) mod traits;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerSnapshot, CircuitOpenError, CircuitState,
    TripsBreaker,
};
pub use dead_letter::{
    base_retry_delay, retry_delay, DeadLetterConfig, DeadLetterError, DeadLetterQueue,
    DeadLetterRecord, DlqMetadata,
};
pub use dispatch::{DispatchOutcome, HandlerInvoker};
pub use error::{BackendError, BrokerError, BrokerResult};
pub use factory::{BrokerContext, BrokerFactory};
pub use health::{HealthCheckResult, HealthStatus};
pub use memory_manager::{
    MemoryManager, MemoryManagerConfig, MemorySampler, MemoryStatus, SysinfoSampler,
};
pub use message::Message;
pub use metrics::{BrokerMetrics, BrokerMetricsSnapshot};
pub use topic::{
    hash_partition, ChannelPattern, PartitionMode, TopicGroup, TopicRoute, TopicStrategy,
    TopicStrategyConfig,
};
pub use traits::{
    handler_fn, BatchItemResult, BatchPublishResult, BrokerInterface, FnHandler, HandlerError,
    LoopControl, LoopObserver, LoopReport, MessageHandler, RawPublisher,
};
