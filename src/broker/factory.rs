//! Driver selection
//!
//! The factory is the only place that looks at [`DriverKind`]. It validates
//! the configuration, picks the backend client from the [`BrokerContext`] and
//! hands back an `Arc<dyn BrokerInterface>`; nothing downstream branches on
//! the driver again.

use crate::broker::backends::{MemoryAmqpBroker, MemoryPubSubCluster, MemoryStreamLog};
use crate::broker::drivers::{AmqpDriver, PubSubDriver, StreamDriver};
use crate::broker::error::BrokerResult;
use crate::broker::traits::BrokerInterface;
use crate::config::{BrokerConfig, DriverKind};
use crate::core::shutdown::ShutdownCoordinator;
use crate::core::sync::Poisoned;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct Backends {
    streams: HashMap<String, MemoryStreamLog>,
    clusters: HashMap<String, MemoryPubSubCluster>,
    amqp: HashMap<String, MemoryAmqpBroker>,
}

/// Backends and cancellation shared by every broker built from one context
///
/// Two brokers configured with the same endpoint talk to the same backend
/// instance, so a publisher and a consumer built separately still meet.
/// Cloning shares state.
#[derive(Clone)]
pub struct BrokerContext {
    backends: Arc<Mutex<Backends>>,
    shutdown: ShutdownCoordinator,
}

impl BrokerContext {
    pub fn new(shutdown: ShutdownCoordinator) -> Self {
        Self {
            backends: Arc::new(Mutex::new(Backends::default())),
            shutdown,
        }
    }

    pub fn shutdown(&self) -> &ShutdownCoordinator {
        &self.shutdown
    }

    fn lock(&self) -> BrokerResult<std::sync::MutexGuard<'_, Backends>> {
        Ok(self.backends.lock().or_backend("backend registry")?)
    }

    /// Stream log for `endpoint`, created on first use
    pub fn stream_log(&self, endpoint: &str) -> BrokerResult<MemoryStreamLog> {
        Ok(self
            .lock()?
            .streams
            .entry(endpoint.to_string())
            .or_default()
            .clone())
    }

    /// Pub/sub cluster for `endpoint`, created on first use with `partitions`
    pub fn pubsub_cluster(&self, endpoint: &str, partitions: u32) -> BrokerResult<MemoryPubSubCluster> {
        Ok(self
            .lock()?
            .clusters
            .entry(endpoint.to_string())
            .or_insert_with(|| MemoryPubSubCluster::new(partitions))
            .clone())
    }

    pub fn amqp_broker(&self, endpoint: &str) -> BrokerResult<MemoryAmqpBroker> {
        Ok(self
            .lock()?
            .amqp
            .entry(endpoint.to_string())
            .or_default()
            .clone())
    }
}

impl std::fmt::Debug for BrokerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerContext")
            .field("shutdown_requested", &self.shutdown.is_shutdown_requested())
            .finish()
    }
}

pub struct BrokerFactory;

impl BrokerFactory {
    /// Validate `config` and build the driver it names
    ///
    /// The broker is returned unconnected; call
    /// [`connect`](BrokerInterface::connect) before publishing.
    pub fn create(config: &BrokerConfig, context: &BrokerContext) -> BrokerResult<Arc<dyn BrokerInterface>> {
        config.validate()?;
        let endpoint = config.endpoint();
        let shutdown = context.shutdown().clone();

        let broker: Arc<dyn BrokerInterface> = match config.driver {
            DriverKind::Stream => {
                let client = context.stream_log(&endpoint)?;
                Arc::new(StreamDriver::new(config, Arc::new(client), shutdown)?)
            }
            DriverKind::PubSub => {
                let client = context.pubsub_cluster(&endpoint, config.pubsub.partitions)?;
                Arc::new(PubSubDriver::new(config, Arc::new(client), shutdown)?)
            }
            DriverKind::Amqp => {
                let client = context.amqp_broker(&endpoint)?;
                Arc::new(AmqpDriver::new(config, Arc::new(client), shutdown)?)
            }
        };

        log::debug!("Created {} driver for {}", config.driver, endpoint);
        Ok(broker)
    }

    /// Build and connect in one step
    pub async fn connect(config: &BrokerConfig, context: &BrokerContext) -> BrokerResult<Arc<dyn BrokerInterface>> {
        let broker = Self::create(config, context)?;
        broker.connect().await?;
        Ok(broker)
    }
}
