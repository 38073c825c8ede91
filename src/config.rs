//! Broker configuration
//!
//! One TOML document describes the driver, its backend endpoint, and the
//! resilience and queueing knobs wrapped around it. Every section has defaults,
//! so an empty document is a valid stream-driver configuration.
//!
//! ```toml
//! driver = "pubsub"
//! topic_prefix = "shop"
//! consumer_group = "billing"
//!
//! [pubsub]
//! brokers = ["10.0.0.1:9092", "10.0.0.2:9092"]
//!
//! [async_queue]
//! enabled = true
//! batch_size = 200
//! ```
//!
//! [`BrokerConfig::validate`] runs before any backend is touched.

use crate::broker::backends::ExchangeKind;
use crate::broker::circuit_breaker::CircuitBreakerConfig;
use crate::broker::dead_letter::DeadLetterConfig;
use crate::broker::error::{BrokerError, BrokerResult};
use crate::broker::memory_manager::MemoryManagerConfig;
use crate::broker::topic::{PartitionMode, TopicGroup, TopicStrategyConfig};
use crate::core::error_handling::ContextualError;
use crate::core::retry::RetryPolicy;
use crate::core::validation::{
    validate_broker_list, validate_host, validate_identifier, validate_port, validate_positive,
    validate_ratio,
};
use crate::queue::{default_segment_path, AsyncQueueConfig, SharedQueueConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Cannot read configuration file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot parse configuration: {0}")]
    Parse(String),
}

impl ContextualError for ConfigError {
    fn is_user_actionable(&self) -> bool {
        matches!(self, ConfigError::Parse(_))
    }

    fn user_message(&self) -> Option<&str> {
        match self {
            ConfigError::Parse(message) => Some(message),
            ConfigError::Read { .. } => None,
        }
    }
}

impl From<ConfigError> for BrokerError {
    fn from(err: ConfigError) -> Self {
        BrokerError::invalid_config(err.to_string())
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DriverKind {
    #[default]
    Stream,
    PubSub,
    Amqp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StreamSettings {
    pub host: String,
    pub port: u32,
    pub database: u32,
    /// Trim streams to roughly this many entries on append
    pub max_len: Option<usize>,
    /// Pending entries idle this long are claimed from crashed consumers
    pub claim_idle_ms: u64,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            database: 0,
            max_len: None,
            claim_idle_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PubSubSettings {
    pub brokers: Vec<String>,
    /// Partitions for topics created by this client
    pub partitions: u32,
    pub flush_timeout_ms: u64,
    /// Every consumer gets its own group, so each one sees every message
    pub broadcast: bool,
}

impl Default for PubSubSettings {
    fn default() -> Self {
        Self {
            brokers: vec!["127.0.0.1:9092".to_string()],
            partitions: 3,
            flush_timeout_ms: 5_000,
            broadcast: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AmqpSettings {
    pub host: String,
    pub port: u32,
    pub vhost: String,
    pub username: String,
    pub password: String,
    pub exchange: String,
    pub exchange_kind: ExchangeKind,
    pub durable: bool,
    /// Unacknowledged deliveries per consumer; 0 is unlimited
    pub prefetch: u16,
}

impl Default for AmqpSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5672,
            vhost: "/".to_string(),
            username: "guest".to_string(),
            password: "guest".to_string(),
            exchange: "relaybus".to_string(),
            exchange_kind: ExchangeKind::Topic,
            durable: true,
            prefetch: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CircuitBreakerSettings {
    pub failure_threshold: u32,
    pub open_timeout_ms: u64,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout_ms: 30_000,
        }
    }
}

/// Connection retry schedule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySettings {
    pub max_attempts: usize,
    pub delay_ms: u64,
    pub backoff_factor: u32,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay_ms: 200,
            backoff_factor: 2,
            max_delay_ms: 5_000,
        }
    }
}

/// Dead-lettering and the handler retry budget that precedes it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeadLetterSettings {
    pub enabled: bool,
    pub prefix: String,
    pub max_retries: u32,
    pub base_delay_ms: u64,
}

impl Default for DeadLetterSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            prefix: "dlq".to_string(),
            max_retries: 3,
            base_delay_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AsyncQueueSettings {
    pub enabled: bool,
    pub capacity: usize,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub adaptive: bool,
    pub min_batch: usize,
    pub max_batch: usize,
    pub drain_timeout_ms: u64,
    /// Publish directly when the queue is full instead of failing
    pub fallback_direct: bool,
}

impl Default for AsyncQueueSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            capacity: 10_000,
            batch_size: 100,
            flush_interval_ms: 50,
            adaptive: false,
            min_batch: 10,
            max_batch: 1_000,
            drain_timeout_ms: 5_000,
            fallback_direct: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SharedQueueSettings {
    pub enabled: bool,
    /// Segment name; ignored when `path` is set
    pub name: String,
    pub path: Option<PathBuf>,
    pub capacity: usize,
    pub max_size: usize,
    pub slot_size: usize,
    pub ttl_secs: u64,
    pub flush_batch: usize,
    pub flush_interval_ms: u64,
    /// Run the flush worker in this process
    pub flush_worker: bool,
}

impl Default for SharedQueueSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            name: "relaybus".to_string(),
            path: None,
            capacity: 4_096,
            max_size: 4_096,
            slot_size: 4_096,
            ttl_secs: 300,
            flush_batch: 100,
            flush_interval_ms: 100,
            flush_worker: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MemorySettings {
    /// 0 disables the ceiling
    pub limit_mb: u64,
    pub warning_ratio: f64,
    pub check_every: u64,
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            limit_mb: 512,
            warning_ratio: 0.8,
            check_every: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TopicSettings {
    pub groups: Vec<TopicGroup>,
    pub partition_mode: PartitionMode,
    pub partitions: Option<u32>,
    /// How often wildcard subscriptions look for new matching topics
    pub refresh_ms: u64,
}

impl Default for TopicSettings {
    fn default() -> Self {
        Self {
            groups: Vec::new(),
            partition_mode: PartitionMode::default(),
            partitions: None,
            refresh_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProcessSettings {
    /// Directory holding one record per consumer process
    pub registry_dir: Option<PathBuf>,
    pub heartbeat_interval_secs: u64,
    /// Silence after which listings flag a process as possibly dead
    pub liveness_timeout_secs: u64,
    /// Silence after which `reap` removes a record
    pub reap_timeout_secs: u64,
    pub max_restarts: u32,
    pub restart_window_secs: u64,
    pub grace_period_secs: u64,
}

impl Default for ProcessSettings {
    fn default() -> Self {
        Self {
            registry_dir: None,
            heartbeat_interval_secs: 10,
            liveness_timeout_secs: 60,
            reap_timeout_secs: 300,
            max_restarts: 5,
            restart_window_secs: 60,
            grace_period_secs: 10,
        }
    }
}

impl ProcessSettings {
    pub fn registry_dir(&self) -> PathBuf {
        self.registry_dir.clone().unwrap_or_else(|| {
            dirs::runtime_dir()
                .or_else(dirs::cache_dir)
                .unwrap_or_else(std::env::temp_dir)
                .join("relaybus")
                .join("processes")
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BrokerConfig {
    pub driver: DriverKind,
    pub topic_prefix: String,
    pub consumer_group: String,
    pub stream: StreamSettings,
    pub pubsub: PubSubSettings,
    pub amqp: AmqpSettings,
    pub circuit_breaker: CircuitBreakerSettings,
    pub retry: RetrySettings,
    pub dead_letter: DeadLetterSettings,
    pub async_queue: AsyncQueueSettings,
    pub shared_queue: SharedQueueSettings,
    pub memory: MemorySettings,
    pub topics: TopicSettings,
    pub process: ProcessSettings,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            driver: DriverKind::default(),
            topic_prefix: "app".to_string(),
            consumer_group: "relaybus".to_string(),
            stream: StreamSettings::default(),
            pubsub: PubSubSettings::default(),
            amqp: AmqpSettings::default(),
            circuit_breaker: CircuitBreakerSettings::default(),
            retry: RetrySettings::default(),
            dead_letter: DeadLetterSettings::default(),
            async_queue: AsyncQueueSettings::default(),
            shared_queue: SharedQueueSettings::default(),
            memory: MemorySettings::default(),
            topics: TopicSettings::default(),
            process: ProcessSettings::default(),
        }
    }
}

impl BrokerConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Build from an already-parsed configuration table
    pub fn from_table(table: &toml::Table) -> Result<Self, ConfigError> {
        toml::Value::Table(table.clone())
            .try_into::<Self>()
            .map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&contents)?;
        log::debug!("Loaded broker configuration from {}", path.display());
        Ok(config)
    }

    /// Default configuration file location, if one exists
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir()
            .map(|d| d.join("relaybus").join("relaybus.toml"))
            .filter(|p| p.exists())
    }

    /// Check every constraint that would otherwise surface as a late backend failure
    pub fn validate(&self) -> BrokerResult<()> {
        validate_identifier("topic_prefix", &self.topic_prefix).map_err(invalid)?;
        validate_identifier("consumer_group", &self.consumer_group).map_err(invalid)?;

        match self.driver {
            DriverKind::Stream => {
                validate_host(&self.stream.host).map_err(invalid)?;
                validate_port(self.stream.port).map_err(invalid)?;
                if let Some(max_len) = self.stream.max_len {
                    validate_positive("stream.max_len", max_len as u64).map_err(invalid)?;
                }
            }
            DriverKind::PubSub => {
                validate_broker_list(&self.pubsub.brokers).map_err(invalid)?;
                validate_positive("pubsub.partitions", self.pubsub.partitions as u64)
                    .map_err(invalid)?;
            }
            DriverKind::Amqp => {
                validate_host(&self.amqp.host).map_err(invalid)?;
                validate_port(self.amqp.port).map_err(invalid)?;
                validate_identifier("amqp.exchange", &self.amqp.exchange).map_err(invalid)?;
            }
        }

        validate_positive(
            "circuit_breaker.failure_threshold",
            self.circuit_breaker.failure_threshold as u64,
        )
        .map_err(invalid)?;
        validate_positive("retry.max_attempts", self.retry.max_attempts as u64).map_err(invalid)?;
        validate_identifier("dead_letter.prefix", &self.dead_letter.prefix).map_err(invalid)?;

        if self.async_queue.enabled {
            let q = &self.async_queue;
            validate_positive("async_queue.capacity", q.capacity as u64).map_err(invalid)?;
            validate_positive("async_queue.batch_size", q.batch_size as u64).map_err(invalid)?;
            validate_positive("async_queue.min_batch", q.min_batch as u64).map_err(invalid)?;
            if q.min_batch > q.max_batch {
                return Err(invalid(format!(
                    "async_queue.min_batch ({}) exceeds async_queue.max_batch ({})",
                    q.min_batch, q.max_batch
                )));
            }
        }

        if self.shared_queue.enabled {
            let q = &self.shared_queue;
            validate_positive("shared_queue.capacity", q.capacity as u64).map_err(invalid)?;
            validate_positive("shared_queue.max_size", q.max_size as u64).map_err(invalid)?;
            validate_positive("shared_queue.slot_size", q.slot_size as u64).map_err(invalid)?;
            validate_positive("shared_queue.ttl_secs", q.ttl_secs).map_err(invalid)?;
            validate_identifier("shared_queue.name", &q.name).map_err(invalid)?;
            if q.max_size > q.capacity {
                return Err(invalid(format!(
                    "shared_queue.max_size ({}) exceeds shared_queue.capacity ({})",
                    q.max_size, q.capacity
                )));
            }
        }

        validate_ratio("memory.warning_ratio", self.memory.warning_ratio).map_err(invalid)?;
        validate_positive(
            "process.heartbeat_interval_secs",
            self.process.heartbeat_interval_secs,
        )
        .map_err(invalid)?;
        if self.process.liveness_timeout_secs <= self.process.heartbeat_interval_secs {
            return Err(invalid(format!(
                "process.liveness_timeout_secs ({}) must exceed the heartbeat interval ({})",
                self.process.liveness_timeout_secs, self.process.heartbeat_interval_secs
            )));
        }

        // Builds the strategy once to surface pattern and partition errors
        crate::broker::topic::TopicStrategy::new(self.topic_strategy_config())?;
        Ok(())
    }

    pub fn circuit_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.circuit_breaker.failure_threshold,
            open_timeout: Duration::from_millis(self.circuit_breaker.open_timeout_ms),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            delay: Duration::from_millis(self.retry.delay_ms),
            backoff_factor: self.retry.backoff_factor,
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
        }
    }

    pub fn dead_letter_config(&self) -> DeadLetterConfig {
        DeadLetterConfig {
            enabled: self.dead_letter.enabled,
            prefix: self.dead_letter.prefix.clone(),
            max_retries: self.dead_letter.max_retries,
            base_delay: Duration::from_millis(self.dead_letter.base_delay_ms),
        }
    }

    pub fn async_queue_config(&self) -> AsyncQueueConfig {
        let q = &self.async_queue;
        AsyncQueueConfig {
            capacity: q.capacity,
            batch_size: q.batch_size,
            flush_interval: Duration::from_millis(q.flush_interval_ms),
            adaptive: q.adaptive,
            min_batch: q.min_batch,
            max_batch: q.max_batch,
        }
    }

    pub fn shared_queue_config(&self) -> SharedQueueConfig {
        let q = &self.shared_queue;
        SharedQueueConfig {
            path: q
                .path
                .clone()
                .unwrap_or_else(|| default_segment_path(&q.name)),
            capacity: q.capacity,
            max_size: q.max_size,
            slot_size: q.slot_size,
            ttl: Duration::from_secs(q.ttl_secs),
        }
    }

    pub fn memory_config(&self) -> MemoryManagerConfig {
        MemoryManagerConfig {
            limit_bytes: self.memory.limit_mb * 1024 * 1024,
            warning_ratio: self.memory.warning_ratio,
            check_every: self.memory.check_every,
        }
    }

    pub fn topic_strategy_config(&self) -> TopicStrategyConfig {
        TopicStrategyConfig {
            prefix: self.topic_prefix.clone(),
            groups: self.topics.groups.clone(),
            partition_mode: self.topics.partition_mode,
            partitions: self.topics.partitions,
        }
    }

    /// Endpoint of the selected driver, as used for logs and context sharing
    pub fn endpoint(&self) -> String {
        match self.driver {
            DriverKind::Stream => format!(
                "stream://{}:{}/{}",
                self.stream.host, self.stream.port, self.stream.database
            ),
            DriverKind::PubSub => format!("pubsub://{}", self.pubsub.brokers.join(",")),
            DriverKind::Amqp => format!(
                "amqp://{}:{}{}",
                self.amqp.host, self.amqp.port, self.amqp.vhost
            ),
        }
    }
}

fn invalid(message: String) -> BrokerError {
    BrokerError::invalid_config(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = BrokerConfig::from_toml_str("").unwrap();
        assert_eq!(config, BrokerConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_sections_parse() {
        let config = BrokerConfig::from_toml_str(
            r#"
            driver = "amqp"
            topic_prefix = "shop"

            [amqp]
            host = "rabbit.internal"
            exchange_kind = "fanout"
            prefetch = 50

            [async_queue]
            enabled = true
            batch_size = 250

            [[topics.groups]]
            topic = "commerce"
            channels = ["orders.*", "payments.**"]
            "#,
        )
        .unwrap();

        assert_eq!(config.driver, DriverKind::Amqp);
        assert_eq!(config.amqp.exchange_kind, ExchangeKind::Fanout);
        assert_eq!(config.amqp.prefetch, 50);
        assert_eq!(config.async_queue_config().batch_size, 250);
        assert_eq!(config.topics.groups[0].channels.len(), 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        let result = BrokerConfig::from_toml_str("[stream]\nhostname = \"x\"\n");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_invalid_port_fails_validation() {
        let mut config = BrokerConfig::default();
        config.stream.port = 70_000;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, BrokerError::InvalidConfiguration { .. }));
        assert!(err.to_string().contains("70000"));
    }

    #[test]
    fn test_invalid_broker_list_fails_validation() {
        let mut config = BrokerConfig::default();
        config.driver = DriverKind::PubSub;
        config.pubsub.brokers = vec!["kafka-1:9092".into(), "kafka-2".into()];
        assert!(config.validate().is_err());

        config.pubsub.brokers.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_inactive_driver_sections_are_not_validated() {
        let mut config = BrokerConfig::default();
        config.amqp.port = 0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_shared_queue_bounds() {
        let mut config = BrokerConfig::default();
        config.shared_queue.enabled = true;
        config.shared_queue.max_size = config.shared_queue.capacity + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_hash_partitioning_requires_partitions() {
        let mut config = BrokerConfig::default();
        config.topics.partition_mode = PartitionMode::Hash;
        assert!(config.validate().is_err());
        config.topics.partitions = Some(8);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_table_matches_from_str() {
        let text = "driver = \"pubsub\"\n[pubsub]\npartitions = 6\n";
        let table: toml::Table = toml::from_str(text).unwrap();
        let config = BrokerConfig::from_table(&table).unwrap();
        assert_eq!(config, BrokerConfig::from_toml_str(text).unwrap());
        assert_eq!(config.pubsub.partitions, 6);
    }

    #[test]
    fn test_load_reports_missing_file() {
        let result = BrokerConfig::load(Path::new("/nonexistent/relaybus.toml"));
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }
}
