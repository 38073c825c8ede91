//! Public API for the broker layer
//!
//! External modules should import from here rather than directly from internal modules.

// Contract and construction
pub use crate::broker::factory::{BrokerContext, BrokerFactory};
pub use crate::broker::traits::{
    handler_fn, BatchPublishResult, BrokerInterface, HandlerError, LoopControl, LoopObserver,
    LoopReport, MessageHandler, RawPublisher,
};

// Messages and routing
pub use crate::broker::message::Message;
pub use crate::broker::topic::{ChannelPattern, TopicStrategy};

// Resilience
pub use crate::broker::circuit_breaker::{CircuitBreaker, CircuitState};
pub use crate::broker::dead_letter::{DeadLetterQueue, DeadLetterRecord};
pub use crate::broker::memory_manager::{MemoryManager, MemoryStatus};

// Observability and errors
pub use crate::broker::error::{BackendError, BrokerError, BrokerResult};
pub use crate::broker::health::{HealthCheckResult, HealthStatus};
pub use crate::broker::metrics::BrokerMetricsSnapshot;
