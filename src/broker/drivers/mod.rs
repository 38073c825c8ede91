//! Broker drivers
//!
//! Each driver adapts one backend family to [`BrokerInterface`](crate::broker::BrokerInterface).
//! Breaker, topic strategy, dispatch and producer queues live in the shared
//! core; a driver only supplies its publish sink and its consume source.

mod common;
mod producer;

pub mod amqp;
pub mod pubsub;
pub mod stream;

pub use amqp::AmqpDriver;
pub use pubsub::PubSubDriver;
pub use stream::StreamDriver;

#[cfg(test)]
pub(crate) mod testing {
    use crate::broker::traits::{LoopControl, LoopObserver, LoopReport};
    use async_trait::async_trait;

    /// Stops the consume loop once `n` messages are settled
    pub(crate) struct StopAfter(pub u64);

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
}
