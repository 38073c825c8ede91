//! In-process partitioned pub/sub cluster
//!
//! Topics are split into append-only partitions. Consumer groups split the
//! partitions of their subscribed topics across members (range assignment,
//! recomputed whenever a member joins or leaves) and track committed offsets.
//! After a rebalance every partition resumes from its committed offset, so
//! records fetched but never committed are delivered again. Groups with no
//! committed offset start from the beginning of each partition.

use super::{Availability, BackendResult, PubSubClient, PubSubRecord};
use crate::broker::error::BackendError;
use crate::broker::topic::hash_partition;
use crate::broker::traits::RawPublisher;
use crate::core::sync::Poisoned;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;

pub const DEFAULT_PARTITIONS: u32 = 3;

type PartitionKey = (String, u32);

#[derive(Debug, Clone)]
struct StoredRecord {
    key: Option<String>,
    payload: String,
}

#[derive(Debug, Default)]
struct Topic {
    partitions: Vec<Vec<StoredRecord>>,
    /// Partition used for keyless records until the next sticky switch
    sticky: u32,
}

#[derive(Debug, Default)]
struct Member {
    topics: BTreeSet<String>,
    assignment: Vec<PartitionKey>,
}

#[derive(Debug, Default)]
struct Group {
    members: BTreeMap<String, Member>,
    committed: HashMap<PartitionKey, u64>,
    positions: HashMap<PartitionKey, u64>,
    generation: u64,
}

#[derive(Debug, Default)]
struct ClusterState {
    topics: BTreeMap<String, Topic>,
    groups: HashMap<String, Group>,
}

impl ClusterState {
    fn ensure_topic(&mut self, name: &str, partitions: u32) -> &mut Topic {
        self.topics.entry(name.to_string()).or_insert_with(|| Topic {
            partitions: vec![Vec::new(); partitions.max(1) as usize],
            sticky: 0,
        })
    }

    fn rebalance(&mut self, group_name: &str) {
        let Some(group) = self.groups.get_mut(group_name) else {
            return;
        };
        group.generation += 1;
        for member in group.members.values_mut() {
            member.assignment.clear();
        }

        let subscribed: BTreeSet<String> = group
            .members
            .values()
            .flat_map(|m| m.topics.iter().cloned())
            .collect();

        for topic in subscribed {
            let partition_count = self
                .topics
                .get(&topic)
                .map_or(0, |t| t.partitions.len() as u32);
            let members: Vec<String> = group
                .members
                .iter()
                .filter(|(_, m)| m.topics.contains(&topic))
                .map(|(name, _)| name.clone())
                .collect();
            if members.is_empty() {
                continue;
            }
            let per_member = partition_count / members.len() as u32;
            let extra = partition_count % members.len() as u32;
            let mut next = 0;
            for (index, name) in members.iter().enumerate() {
                let take = per_member + u32::from((index as u32) < extra);
                if let Some(member) = group.members.get_mut(name) {
                    member
                        .assignment
                        .extend((next..next + take).map(|p| (topic.clone(), p)));
                }
                next += take;
            }
        }

        // Uncommitted progress is discarded; the new owners resume from commits
        group.positions = group.committed.clone();
        log::debug!(
            "Group '{}' rebalanced to generation {} across {} member(s)",
            group_name,
            group.generation,
            group.members.len()
        );
    }
}

#[derive(Debug)]
struct Inner {
    state: Mutex<ClusterState>,
    produced: Notify,
    availability: Availability,
    default_partitions: u32,
}

/// Shared in-process cluster; clones address the same topics and groups
#[derive(Debug, Clone)]
pub struct MemoryPubSubCluster {
    inner: Arc<Inner>,
}

impl Default for MemoryPubSubCluster {
    fn default() -> Self {
        Self::new(DEFAULT_PARTITIONS)
    }
}

impl MemoryPubSubCluster {
    /// Topics created implicitly get `default_partitions` partitions
    pub fn new(default_partitions: u32) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(ClusterState::default()),
                produced: Notify::new(),
                availability: Availability::new("pubsub"),
                default_partitions: default_partitions.max(1),
            }),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.inner.availability.set(available);
    }

    /// Number of records stored in one partition
    pub fn partition_len(&self, topic: &str, partition: u32) -> usize {
        self.state()
            .ok()
            .and_then(|state| {
                state
                    .topics
                    .get(topic)
                    .and_then(|t| t.partitions.get(partition as usize))
                    .map(Vec::len)
            })
            .unwrap_or(0)
    }

    fn state(&self) -> BackendResult<MutexGuard<'_, ClusterState>> {
        self.inner.state.lock().or_backend("partitioned log")
    }

    fn fetch(&self, group: &str, member: &str, max: usize) -> BackendResult<Vec<PubSubRecord>> {
        let mut guard = self.state()?;
        let ClusterState { topics, groups } = &mut *guard;
        let group_state = groups
            .get_mut(group)
            .ok_or_else(|| BackendError::NotFound(format!("unknown group '{}'", group)))?;
        let assignment = group_state
            .members
            .get(member)
            .ok_or_else(|| {
                BackendError::Rejected(format!("'{}' is not a member of group '{}'", member, group))
            })?
            .assignment
            .clone();

        let mut records = Vec::new();
        for (topic, partition) in assignment {
            if records.len() >= max {
                break;
            }
            let Some(log) = topics
                .get(&topic)
                .and_then(|t| t.partitions.get(partition as usize))
            else {
                continue;
            };
            let position = group_state
                .positions
                .entry((topic.clone(), partition))
                .or_insert(0);
            while (*position as usize) < log.len() && records.len() < max {
                let stored = &log[*position as usize];
                records.push(PubSubRecord {
                    topic: topic.clone(),
                    partition,
                    offset: *position,
                    key: stored.key.clone(),
                    payload: stored.payload.clone(),
                });
                *position += 1;
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl RawPublisher for MemoryPubSubCluster {
    async fn publish_raw(
        &self,
        destination: &str,
        key: Option<&str>,
        payload: &str,
    ) -> Result<String, BackendError> {
        let (partition, offset) = self.produce(destination, key, None, payload).await?;
        Ok(format!("{}:{}", partition, offset))
    }

    async fn flush_raw(&self) -> Result<(), BackendError> {
        self.flush(Duration::ZERO).await
    }
}

#[async_trait]
impl PubSubClient for MemoryPubSubCluster {
    async fn ping(&self) -> BackendResult<()> {
        self.inner.availability.check()
    }

    async fn ensure_topic(&self, topic: &str, partitions: u32) -> BackendResult<()> {
        self.inner.availability.check()?;
        self.state()?.ensure_topic(topic, partitions);
        Ok(())
    }

    async fn produce(
        &self,
        topic: &str,
        key: Option<&str>,
        partition: Option<u32>,
        payload: &str,
    ) -> BackendResult<(u32, u64)> {
        self.inner.availability.check()?;
        if topic.is_empty() {
            return Err(BackendError::Rejected("empty topic name".into()));
        }
        let located = {
            let mut state = self.state()?;
            let default_partitions = self.inner.default_partitions;
            let entry = state.ensure_topic(topic, default_partitions);
            let count = entry.partitions.len() as u32;
            let target = match (partition, key) {
                (Some(p), _) if p < count => p,
                (Some(p), _) => {
                    return Err(BackendError::Rejected(format!(
                        "partition {} out of range for '{}' ({} partitions)",
                        p, topic, count
                    )))
                }
                (None, Some(key)) => hash_partition(key, count),
                (None, None) => {
                    let target = entry.sticky % count;
                    entry.sticky = entry.sticky.wrapping_add(1);
                    target
                }
            };
            let log = &mut entry.partitions[target as usize];
            log.push(StoredRecord {
                key: key.map(str::to_string),
                payload: payload.to_string(),
            });
            (target, log.len() as u64 - 1)
        };
        self.inner.produced.notify_waiters();
        Ok(located)
    }

    async fn flush(&self, _timeout: Duration) -> BackendResult<()> {
        self.inner.availability.check()
    }

    async fn list_topics(&self) -> BackendResult<Vec<String>> {
        self.inner.availability.check()?;
        Ok(self.state()?.topics.keys().cloned().collect())
    }

    async fn join_group(&self, group: &str, member: &str, topics: &[String]) -> BackendResult<()> {
        self.inner.availability.check()?;
        let mut state = self.state()?;
        let default_partitions = self.inner.default_partitions;
        for topic in topics {
            state.ensure_topic(topic, default_partitions);
        }
        let entry = state.groups.entry(group.to_string()).or_default();
        let subscription: BTreeSet<String> = topics.iter().cloned().collect();
        let changed = entry
            .members
            .get(member)
            .map_or(true, |existing| existing.topics != subscription);
        if changed {
            entry.members.insert(
                member.to_string(),
                Member {
                    topics: subscription,
                    assignment: Vec::new(),
                },
            );
            state.rebalance(group);
        }
        Ok(())
    }

    async fn leave_group(&self, group: &str, member: &str) -> BackendResult<()> {
        self.inner.availability.check()?;
        let mut state = self.state()?;
        let removed = state
            .groups
            .get_mut(group)
            .and_then(|g| g.members.remove(member))
            .is_some();
        if removed {
            state.rebalance(group);
        }
        Ok(())
    }

    async fn assignment(&self, group: &str, member: &str) -> BackendResult<Vec<(String, u32)>> {
        self.inner.availability.check()?;
        let state = self.state()?;
        Ok(state
            .groups
            .get(group)
            .and_then(|g| g.members.get(member))
            .map(|m| m.assignment.clone())
            .unwrap_or_default())
    }

    async fn poll(
        &self,
        group: &str,
        member: &str,
        max: usize,
        timeout: Duration,
    ) -> BackendResult<Vec<PubSubRecord>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            self.inner.availability.check()?;
            let produced = self.inner.produced.notified();
            tokio::pin!(produced);
            produced.as_mut().enable();

            let records = self.fetch(group, member, max.max(1))?;
            if !records.is_empty() {
                return Ok(records);
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let _ = tokio::time::timeout(deadline - now, produced).await;
        }
    }

    async fn commit(&self, group: &str, offsets: &[(String, u32, u64)]) -> BackendResult<()> {
        self.inner.availability.check()?;
        let mut state = self.state()?;
        let group_state = state
            .groups
            .get_mut(group)
            .ok_or_else(|| BackendError::NotFound(format!("unknown group '{}'", group)))?;
        for (topic, partition, next) in offsets {
            let committed = group_state
                .committed
                .entry((topic.clone(), *partition))
                .or_insert(0);
            *committed = (*committed).max(*next);
        }
        Ok(())
    }

    async fn committed(&self, group: &str, topic: &str, partition: u32) -> BackendResult<Option<u64>> {
        self.inner.availability.check()?;
        let state = self.state()?;
        Ok(state
            .groups
            .get(group)
            .and_then(|g| g.committed.get(&(topic.to_string(), partition)))
            .copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topics(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_keyed_records_stay_on_one_partition() {
        let cluster = MemoryPubSubCluster::new(4);
        let (first, _) = cluster.produce("t", Some("user-1"), None, "a").await.unwrap();
        let (second, offset) = cluster.produce("t", Some("user-1"), None, "b").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(offset, 1);
        assert_eq!(first, hash_partition("user-1", 4));
    }

    #[tokio::test]
    async fn test_explicit_partition_out_of_range_is_rejected() {
        let cluster = MemoryPubSubCluster::new(2);
        let result = cluster.produce("t", None, Some(5), "a").await;
        assert!(matches!(result, Err(BackendError::Rejected(_))));
    }

    #[tokio::test]
    async fn test_group_members_split_partitions() {
        let cluster = MemoryPubSubCluster::new(4);
        cluster.join_group("g", "m1", &topics(&["t"])).await.unwrap();
        assert_eq!(cluster.assignment("g", "m1").await.unwrap().len(), 4);

        cluster.join_group("g", "m2", &topics(&["t"])).await.unwrap();
        let first = cluster.assignment("g", "m1").await.unwrap();
        let second = cluster.assignment("g", "m2").await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 2);
        assert!(first.iter().all(|p| !second.contains(p)));

        cluster.leave_group("g", "m2").await.unwrap();
        assert_eq!(cluster.assignment("g", "m1").await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_separate_groups_each_receive_every_record() {
        let cluster = MemoryPubSubCluster::new(1);
        cluster.join_group("g1", "a", &topics(&["t"])).await.unwrap();
        cluster.join_group("g2", "b", &topics(&["t"])).await.unwrap();
        cluster.produce("t", None, None, "x").await.unwrap();

        let one = cluster.poll("g1", "a", 10, Duration::from_millis(1)).await.unwrap();
        let two = cluster.poll("g2", "b", 10, Duration::from_millis(1)).await.unwrap();
        assert_eq!(one.len(), 1);
        assert_eq!(two.len(), 1);
    }

    #[tokio::test]
    async fn test_uncommitted_records_return_after_rebalance() {
        let cluster = MemoryPubSubCluster::new(1);
        cluster.join_group("g", "a", &topics(&["t"])).await.unwrap();
        cluster.produce("t", None, None, "1").await.unwrap();
        cluster.produce("t", None, None, "2").await.unwrap();

        let batch = cluster.poll("g", "a", 1, Duration::ZERO).await.unwrap();
        cluster.commit("g", &[("t".into(), 0, batch[0].offset + 1)]).await.unwrap();
        let uncommitted = cluster.poll("g", "a", 1, Duration::ZERO).await.unwrap();
        assert_eq!(uncommitted[0].payload, "2");

        cluster.leave_group("g", "a").await.unwrap();
        cluster.join_group("g", "b", &topics(&["t"])).await.unwrap();
        let redelivered = cluster.poll("g", "b", 10, Duration::ZERO).await.unwrap();
        assert_eq!(redelivered.len(), 1);
        assert_eq!(redelivered[0].payload, "2");
        assert_eq!(cluster.committed("g", "t", 0).await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_poll_waits_for_produce() {
        let cluster = MemoryPubSubCluster::new(1);
        cluster.join_group("g", "a", &topics(&["t"])).await.unwrap();
        let producer = cluster.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.produce("t", None, None, "late").await.unwrap();
        });
        let records = cluster.poll("g", "a", 1, Duration::from_secs(5)).await.unwrap();
        assert_eq!(records[0].payload, "late");
    }

    #[tokio::test]
    async fn test_poll_by_non_member_is_rejected() {
        let cluster = MemoryPubSubCluster::new(1);
        cluster.join_group("g", "a", &topics(&["t"])).await.unwrap();
        let result = cluster.poll("g", "stranger", 1, Duration::ZERO).await;
        assert!(matches!(result, Err(BackendError::Rejected(_))));
    }
}
