//! Channel to backend destination mapping
//!
//! A [`TopicStrategy`] turns a logical channel name into the physical
//! destination a driver writes to. Resolution is a pure function of the channel
//! (and of the key for partitioned backends); the only stateful mode is the
//! opt-in round-robin partitioner.

use crate::broker::error::{BrokerError, BrokerResult};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU32, Ordering};

const SEPARATOR: char = '.';

/// How an explicit partition is chosen for partitioned backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionMode {
    /// Leave partition selection to the backend (key hashing there)
    #[default]
    Backend,
    /// Hash the partition key into `[0, partitions)`
    Hash,
    /// Rotate through partitions, ignoring the key
    RoundRobin,
}

/// Several logical channels sharing one physical topic
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct TopicGroup {
    /// Physical topic name, without prefix
    pub topic: String,
    /// Channel patterns routed onto this topic
    pub channels: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct TopicStrategyConfig {
    pub prefix: String,
    pub groups: Vec<TopicGroup>,
    pub partition_mode: PartitionMode,
    /// Partition count used by `Hash` and `RoundRobin` modes
    pub partitions: Option<u32>,
}

/// Resolved destination for one publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicRoute {
    /// Physical topic / stream / routing key
    pub topic: String,
    /// Key used by the backend to keep per-channel ordering
    pub partition_key: Option<String>,
    pub partition: Option<u32>,
    /// Logical channel, carried as message key so consumers can recover it
    pub message_key: String,
}

#[derive(Debug)]
pub struct TopicStrategy {
    prefix: String,
    groups: Vec<(String, Vec<ChannelPattern>)>,
    partition_mode: PartitionMode,
    partitions: Option<u32>,
    next_partition: AtomicU32,
}

impl TopicStrategy {
    pub fn new(config: TopicStrategyConfig) -> BrokerResult<Self> {
        if matches!(config.partition_mode, PartitionMode::Hash | PartitionMode::RoundRobin)
            && config.partitions.unwrap_or(0) == 0
        {
            return Err(BrokerError::invalid_config(format!(
                "partition mode {:?} requires a positive partition count",
                config.partition_mode
            )));
        }

        let mut groups = Vec::with_capacity(config.groups.len());
        for group in config.groups {
            if group.topic.trim().is_empty() {
                return Err(BrokerError::invalid_config("topic group with empty topic name"));
            }
            let patterns = group
                .channels
                .iter()
                .map(|c| ChannelPattern::new(c))
                .collect::<BrokerResult<Vec<_>>>()?;
            groups.push((sanitize(&group.topic), patterns));
        }

        Ok(Self {
            prefix: config.prefix.trim_end_matches(SEPARATOR).to_string(),
            groups,
            partition_mode: config.partition_mode,
            partitions: config.partitions,
            next_partition: AtomicU32::new(0),
        })
    }

    /// Strategy with a prefix and no grouping or explicit partitioning
    pub fn with_prefix(prefix: &str) -> Self {
        Self {
            prefix: prefix.trim_end_matches(SEPARATOR).to_string(),
            groups: Vec::new(),
            partition_mode: PartitionMode::Backend,
            partitions: None,
            next_partition: AtomicU32::new(0),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Resolve a logical channel into its backend destination
    pub fn resolve(&self, channel: &str) -> TopicRoute {
        self.resolve_with_key(channel, None)
    }

    /// Resolve with an explicit partition key (defaults to the channel)
    pub fn resolve_with_key(&self, channel: &str, key: Option<&str>) -> TopicRoute {
        let topic = self.topic_name(channel);
        let partition_key = key.unwrap_or(channel).to_string();
        let partition = self.partition_for(&partition_key);

        TopicRoute {
            topic,
            partition_key: Some(partition_key),
            partition,
            message_key: channel.to_string(),
        }
    }

    /// Physical topic name for a channel, honouring topic groups
    pub fn topic_name(&self, channel: &str) -> String {
        let base = self
            .groups
            .iter()
            .find(|(_, patterns)| patterns.iter().any(|p| p.matches(channel)))
            .map(|(topic, _)| topic.clone())
            .unwrap_or_else(|| sanitize(channel));
        self.prefixed(&base)
    }

    /// Physical topics a subscription must cover
    ///
    /// A grouped channel maps to its group topic; a plain channel to its own
    /// topic. Wildcard channels cannot be resolved statically and return `None`;
    /// drivers match them against the backend's topic listing instead.
    pub fn subscription_topic(&self, channel: &str) -> Option<String> {
        if ChannelPattern::is_pattern(channel) {
            return None;
        }
        Some(self.topic_name(channel))
    }

    /// Recover the logical channel of an inbound record
    ///
    /// The message key wins when present; otherwise the channel is inferred by
    /// stripping the prefix from the topic name.
    pub fn recover_channel(&self, topic: &str, message_key: Option<&str>) -> String {
        if let Some(key) = message_key.filter(|k| !k.is_empty()) {
            return key.to_string();
        }
        if self.prefix.is_empty() {
            return topic.to_string();
        }
        topic
            .strip_prefix(&self.prefix)
            .and_then(|rest| rest.strip_prefix(SEPARATOR))
            .unwrap_or(topic)
            .to_string()
    }

    fn prefixed(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}{}{}", self.prefix, SEPARATOR, name)
        }
    }

    fn partition_for(&self, key: &str) -> Option<u32> {
        let partitions = self.partitions.filter(|p| *p > 0)?;
        match self.partition_mode {
            PartitionMode::Backend => None,
            PartitionMode::Hash => Some(hash_partition(key, partitions)),
            PartitionMode::RoundRobin => {
                Some(self.next_partition.fetch_add(1, Ordering::Relaxed) % partitions)
            }
        }
    }
}

/// Deterministic partition for a key
pub fn hash_partition(key: &str, partitions: u32) -> u32 {
    let digest = Sha256::digest(key.as_bytes());
    let word = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    word % partitions.max(1)
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    One,
    Any,
}

/// Compiled wildcard channel pattern
///
/// `*` matches exactly one dot-separated segment, `**` matches any number of
/// segments including none.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelPattern {
    raw: String,
    segments: Vec<Segment>,
}

impl ChannelPattern {
    pub fn new(pattern: &str) -> BrokerResult<Self> {
        if pattern.is_empty() {
            return Err(BrokerError::invalid_config("channel pattern is empty"));
        }
        let mut segments = Vec::new();
        for part in pattern.split(SEPARATOR) {
            let segment = match part {
                "" => {
                    return Err(BrokerError::invalid_config(format!(
                        "channel pattern '{}' has an empty segment",
                        pattern
                    )))
                }
                "*" => Segment::One,
                "**" => Segment::Any,
                literal if literal.contains('*') => {
                    return Err(BrokerError::invalid_config(format!(
                        "channel pattern '{}' mixes wildcards with text in '{}'",
                        pattern, literal
                    )))
                }
                literal => Segment::Literal(literal.to_string()),
            };
            // Consecutive `**` collapse into one
            if segment == Segment::Any && segments.last() == Some(&Segment::Any) {
                continue;
            }
            segments.push(segment);
        }
        Ok(Self {
            raw: pattern.to_string(),
            segments,
        })
    }

    /// Parse an AMQP binding key (`#` is zero or more words)
    pub fn from_amqp_binding(binding: &str) -> BrokerResult<Self> {
        let translated = binding
            .split(SEPARATOR)
            .map(|part| if part == "#" { "**" } else { part })
            .collect::<Vec<_>>()
            .join(".");
        Self::new(&translated)
    }

    pub fn is_pattern(channel: &str) -> bool {
        channel.contains('*')
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// AMQP binding key equivalent of this pattern
    pub fn to_amqp_binding(&self) -> String {
        self.segments
            .iter()
            .map(|s| match s {
                Segment::Literal(l) => l.as_str(),
                Segment::One => "*",
                Segment::Any => "#",
            })
            .collect::<Vec<_>>()
            .join(".")
    }

    pub fn matches(&self, channel: &str) -> bool {
        let parts: Vec<&str> = channel.split(SEPARATOR).collect();
        match_segments(&self.segments, &parts)
    }
}

fn match_segments(segments: &[Segment], parts: &[&str]) -> bool {
    match segments.split_first() {
        None => parts.is_empty(),
        Some((Segment::Any, rest)) => {
            (0..=parts.len()).any(|skip| match_segments(rest, &parts[skip..]))
        }
        Some((segment, rest)) => match parts.split_first() {
            None => false,
            Some((part, remaining)) => {
                let head_matches = match segment {
                    Segment::Literal(literal) => literal == part,
                    _ => !part.is_empty(),
                };
                head_matches && match_segments(rest, remaining)
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_is_deterministic() {
        let strategy = TopicStrategy::new(TopicStrategyConfig {
            prefix: "app".into(),
            partition_mode: PartitionMode::Hash,
            partitions: Some(12),
            ..Default::default()
        })
        .unwrap();

        let first = strategy.resolve("orders.created");
        let second = strategy.resolve("orders.created");

        assert_eq!(first, second);
        assert_eq!(first.topic, "app.orders.created");
        assert_eq!(first.message_key, "orders.created");
        assert!(first.partition.unwrap() < 12);
    }

    #[test]
    fn test_backend_mode_has_no_explicit_partition() {
        let strategy = TopicStrategy::with_prefix("app.");
        let route = strategy.resolve("users");
        assert_eq!(route.topic, "app.users");
        assert_eq!(route.partition, None);
        assert_eq!(route.partition_key.as_deref(), Some("users"));
    }

    #[test]
    fn test_round_robin_rotates() {
        let strategy = TopicStrategy::new(TopicStrategyConfig {
            partition_mode: PartitionMode::RoundRobin,
            partitions: Some(3),
            ..Default::default()
        })
        .unwrap();

        let partitions: Vec<u32> = (0..6)
            .map(|_| strategy.resolve("a").partition.unwrap())
            .collect();
        assert_eq!(partitions, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_partition_mode_requires_count() {
        let result = TopicStrategy::new(TopicStrategyConfig {
            partition_mode: PartitionMode::Hash,
            ..Default::default()
        });
        assert!(matches!(
            result,
            Err(BrokerError::InvalidConfiguration { .. })
        ));
    }

    #[test]
    fn test_grouped_channels_share_a_topic() {
        let strategy = TopicStrategy::new(TopicStrategyConfig {
            prefix: "app".into(),
            groups: vec![TopicGroup {
                topic: "notifications".into(),
                channels: vec!["email.*".into(), "sms.**".into()],
            }],
            ..Default::default()
        })
        .unwrap();

        assert_eq!(strategy.topic_name("email.welcome"), "app.notifications");
        assert_eq!(strategy.topic_name("sms.eu.reminder"), "app.notifications");
        assert_eq!(strategy.topic_name("orders"), "app.orders");

        let route = strategy.resolve("email.welcome");
        assert_eq!(
            strategy.recover_channel(&route.topic, Some(&route.message_key)),
            "email.welcome"
        );
    }

    #[test]
    fn test_recover_channel_prefers_message_key() {
        let strategy = TopicStrategy::with_prefix("app");
        assert_eq!(strategy.recover_channel("app.orders", Some("billing")), "billing");
        assert_eq!(strategy.recover_channel("app.orders", None), "orders");
        assert_eq!(strategy.recover_channel("app.orders", Some("")), "orders");
        assert_eq!(strategy.recover_channel("other.orders", None), "other.orders");
    }

    #[test]
    fn test_sanitizes_topic_names() {
        let strategy = TopicStrategy::with_prefix("");
        assert_eq!(strategy.topic_name("user:42/events"), "user_42_events");
    }

    #[test]
    fn test_single_segment_wildcard() {
        let pattern = ChannelPattern::new("orders.*").unwrap();
        assert!(pattern.matches("orders.created"));
        assert!(!pattern.matches("orders"));
        assert!(!pattern.matches("orders.eu.created"));
        assert!(!pattern.matches("users.created"));
    }

    #[test]
    fn test_any_depth_wildcard() {
        let pattern = ChannelPattern::new("orders.**").unwrap();
        assert!(pattern.matches("orders"));
        assert!(pattern.matches("orders.created"));
        assert!(pattern.matches("orders.eu.created"));
        assert!(!pattern.matches("users.created"));

        let middle = ChannelPattern::new("a.**.z").unwrap();
        assert!(middle.matches("a.z"));
        assert!(middle.matches("a.b.c.z"));
        assert!(!middle.matches("a.b.c"));
    }

    #[test]
    fn test_invalid_patterns() {
        assert!(ChannelPattern::new("").is_err());
        assert!(ChannelPattern::new("orders..created").is_err());
        assert!(ChannelPattern::new("orders.cre*").is_err());
    }

    #[test]
    fn test_amqp_binding_translation() {
        let pattern = ChannelPattern::new("orders.*.**").unwrap();
        assert_eq!(pattern.to_amqp_binding(), "orders.*.#");

        let binding = ChannelPattern::from_amqp_binding("logs.#").unwrap();
        assert!(binding.matches("logs"));
        assert!(binding.matches("logs.app.error"));
    }

    #[test]
    fn test_hash_partition_is_stable() {
        assert_eq!(hash_partition("key-1", 8), hash_partition("key-1", 8));
        assert!(hash_partition("key-2", 8) < 8);
        assert_eq!(hash_partition("anything", 1), 0);
    }
}
