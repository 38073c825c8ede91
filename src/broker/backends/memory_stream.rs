//! In-process stream log
//!
//! Streams of `ms-seq` identified entries, consumer groups tracking the last
//! delivered id, and a pending entries list per group until acknowledgement.

use super::{Availability, BackendResult, GroupStart, PendingEntry, StreamEntry, StreamLogClient};
use crate::broker::error::BackendError;
use crate::broker::traits::RawPublisher;
use crate::core::sync::Poisoned;
use crate::core::time::epoch_millis;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
struct StreamId {
    millis: u64,
    seq: u64,
}

impl StreamId {
    fn parse(id: &str) -> Option<Self> {
        let (millis, seq) = id.split_once('-')?;
        Some(Self {
            millis: millis.parse().ok()?,
            seq: seq.parse().ok()?,
        })
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.millis, self.seq)
    }
}

#[derive(Debug)]
struct PendingInfo {
    consumer: String,
    delivered_at: Instant,
    deliveries: u32,
}

#[derive(Debug, Default)]
struct Group {
    last_delivered: StreamId,
    pending: BTreeMap<StreamId, PendingInfo>,
}

#[derive(Debug, Default)]
struct Stream {
    entries: VecDeque<(StreamId, BTreeMap<String, String>)>,
    last_id: StreamId,
    groups: HashMap<String, Group>,
}

impl Stream {
    fn next_id(&mut self) -> StreamId {
        let now = epoch_millis(SystemTime::now());
        let id = if now > self.last_id.millis {
            StreamId { millis: now, seq: 0 }
        } else {
            StreamId {
                millis: self.last_id.millis,
                seq: self.last_id.seq + 1,
            }
        };
        self.last_id = id;
        id
    }

    fn append(&mut self, fields: BTreeMap<String, String>, max_len: Option<usize>) -> StreamId {
        let id = self.next_id();
        self.entries.push_back((id, fields));
        if let Some(max_len) = max_len {
            while self.entries.len() > max_len {
                self.entries.pop_front();
            }
        }
        id
    }

}

fn find_entry(
    entries: &VecDeque<(StreamId, BTreeMap<String, String>)>,
    id: StreamId,
) -> Option<StreamEntry> {
    entries
        .binary_search_by(|(entry_id, _)| entry_id.cmp(&id))
        .ok()
        .map(|index| {
            let (id, fields) = &entries[index];
            StreamEntry {
                id: id.to_string(),
                fields: fields.clone(),
            }
        })
}

#[derive(Debug)]
struct Inner {
    streams: Mutex<HashMap<String, Stream>>,
    appended: Notify,
    availability: Availability,
}

/// Shared in-process stream log; clones address the same data
#[derive(Debug, Clone)]
pub struct MemoryStreamLog {
    inner: Arc<Inner>,
}

impl Default for MemoryStreamLog {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStreamLog {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                streams: Mutex::new(HashMap::new()),
                appended: Notify::new(),
                availability: Availability::new("stream"),
            }),
        }
    }

    /// Simulate an outage (`false`) or recovery (`true`)
    pub fn set_available(&self, available: bool) {
        self.inner.availability.set(available);
    }

    fn lock_streams(&self) -> BackendResult<std::sync::MutexGuard<'_, HashMap<String, Stream>>> {
        self.inner.streams.lock().or_backend("stream log")
    }

    fn take_new_entries(
        &self,
        group: &str,
        consumer: &str,
        streams: &[String],
        count: usize,
    ) -> BackendResult<Vec<(String, StreamEntry)>> {
        let mut all = self.lock_streams()?;
        let mut delivered = Vec::new();
        for name in streams {
            let stream = all
                .get_mut(name)
                .ok_or_else(|| BackendError::NotFound(format!("NOGROUP no stream '{}'", name)))?;
            let Stream {
                entries, groups, ..
            } = stream;
            let state = groups.get_mut(group).ok_or_else(|| {
                BackendError::NotFound(format!("NOGROUP no group '{}' on '{}'", group, name))
            })?;

            for (id, fields) in entries.iter() {
                if delivered.len() >= count {
                    break;
                }
                if *id <= state.last_delivered {
                    continue;
                }
                state.last_delivered = *id;
                state.pending.insert(
                    *id,
                    PendingInfo {
                        consumer: consumer.to_string(),
                        delivered_at: Instant::now(),
                        deliveries: 1,
                    },
                );
                delivered.push((
                    name.clone(),
                    StreamEntry {
                        id: id.to_string(),
                        fields: fields.clone(),
                    },
                ));
            }
        }
        Ok(delivered)
    }
}

#[async_trait]
impl RawPublisher for MemoryStreamLog {
    async fn publish_raw(
        &self,
        destination: &str,
        key: Option<&str>,
        payload: &str,
    ) -> Result<String, BackendError> {
        let mut fields = BTreeMap::new();
        fields.insert("payload".to_string(), payload.to_string());
        if let Some(key) = key {
            fields.insert("key".to_string(), key.to_string());
        }
        self.append(destination, fields, None).await
    }
}

#[async_trait]
impl StreamLogClient for MemoryStreamLog {
    async fn ping(&self) -> BackendResult<()> {
        self.inner.availability.check()
    }

    async fn append(
        &self,
        stream: &str,
        fields: BTreeMap<String, String>,
        max_len: Option<usize>,
    ) -> BackendResult<String> {
        self.inner.availability.check()?;
        let id = {
            let mut all = self.lock_streams()?;
            all.entry(stream.to_string())
                .or_default()
                .append(fields, max_len)
        };
        self.inner.appended.notify_waiters();
        Ok(id.to_string())
    }

    async fn append_pipeline(
        &self,
        entries: Vec<(String, BTreeMap<String, String>)>,
        max_len: Option<usize>,
    ) -> BackendResult<Vec<BackendResult<String>>> {
        self.inner.availability.check()?;
        let results = {
            let mut all = self.lock_streams()?;
            entries
                .into_iter()
                .map(|(stream, fields)| {
                    if stream.is_empty() {
                        return Err(BackendError::Rejected("empty stream name".into()));
                    }
                    let id = all.entry(stream).or_default().append(fields, max_len);
                    Ok(id.to_string())
                })
                .collect()
        };
        self.inner.appended.notify_waiters();
        Ok(results)
    }

    async fn create_group(&self, stream: &str, group: &str, start: GroupStart) -> BackendResult<()> {
        self.inner.availability.check()?;
        let mut all = self.lock_streams()?;
        let stream = all.entry(stream.to_string()).or_default();
        // Entries with ids above `last_delivered` are new to the group
        let last_delivered = match start {
            GroupStart::Latest => stream.last_id,
            GroupStart::Earliest | GroupStart::Since(0) => StreamId::default(),
            GroupStart::Since(millis) => StreamId {
                millis: millis - 1,
                seq: u64::MAX,
            },
        };
        stream.groups.entry(group.to_string()).or_insert_with(|| Group {
            last_delivered,
            pending: BTreeMap::new(),
        });
        Ok(())
    }

    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        streams: &[String],
        count: usize,
        block: Duration,
    ) -> BackendResult<Vec<(String, StreamEntry)>> {
        let deadline = tokio::time::Instant::now() + block;
        loop {
            self.inner.availability.check()?;
            let appended = self.inner.appended.notified();
            tokio::pin!(appended);
            appended.as_mut().enable();

            let delivered = self.take_new_entries(group, consumer, streams, count.max(1))?;
            if !delivered.is_empty() {
                return Ok(delivered);
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let _ = tokio::time::timeout(deadline - now, appended).await;
        }
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> BackendResult<usize> {
        self.inner.availability.check()?;
        let mut all = self.lock_streams()?;
        let Some(state) = all.get_mut(stream).and_then(|s| s.groups.get_mut(group)) else {
            return Ok(0);
        };
        Ok(ids
            .iter()
            .filter_map(|id| StreamId::parse(id))
            .filter(|id| state.pending.remove(id).is_some())
            .count())
    }

    async fn pending(&self, stream: &str, group: &str) -> BackendResult<Vec<PendingEntry>> {
        self.inner.availability.check()?;
        let all = self.lock_streams()?;
        let Some(state) = all.get(stream).and_then(|s| s.groups.get(group)) else {
            return Ok(Vec::new());
        };
        Ok(state
            .pending
            .iter()
            .map(|(id, info)| PendingEntry {
                id: id.to_string(),
                consumer: info.consumer.clone(),
                idle: info.delivered_at.elapsed(),
                deliveries: info.deliveries,
            })
            .collect())
    }

    async fn claim_idle(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> BackendResult<Vec<StreamEntry>> {
        self.inner.availability.check()?;
        let mut all = self.lock_streams()?;
        let Some(stream) = all.get_mut(stream) else {
            return Ok(Vec::new());
        };
        let Stream {
            entries, groups, ..
        } = stream;
        let Some(state) = groups.get_mut(group) else {
            return Ok(Vec::new());
        };

        let mut claimed = Vec::new();
        let mut trimmed = Vec::new();
        for (id, info) in state.pending.iter_mut() {
            if claimed.len() >= count {
                break;
            }
            if info.delivered_at.elapsed() < min_idle {
                continue;
            }
            match find_entry(entries, *id) {
                Some(entry) => {
                    info.consumer = consumer.to_string();
                    info.delivered_at = Instant::now();
                    info.deliveries += 1;
                    claimed.push(entry);
                }
                None => trimmed.push(*id),
            }
        }
        // Entries trimmed away can never be delivered again
        for id in trimmed {
            state.pending.remove(&id);
        }
        Ok(claimed)
    }

    async fn len(&self, stream: &str) -> BackendResult<usize> {
        self.inner.availability.check()?;
        Ok(self.lock_streams()?.get(stream).map_or(0, |s| s.entries.len()))
    }

    async fn streams(&self) -> BackendResult<Vec<String>> {
        self.inner.availability.check()?;
        let mut names: Vec<String> = self.lock_streams()?.keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(payload: &str) -> BTreeMap<String, String> {
        let mut fields = BTreeMap::new();
        fields.insert("payload".to_string(), payload.to_string());
        fields
    }

    #[tokio::test]
    async fn test_group_read_and_ack() {
        let log = MemoryStreamLog::new();
        log.create_group("s", "g", GroupStart::Latest).await.unwrap();
        log.append("s", fields("a"), None).await.unwrap();
        log.append("s", fields("b"), None).await.unwrap();

        let streams = vec!["s".to_string()];
        let batch = log
            .read_group("g", "c1", &streams, 10, Duration::from_millis(1))
            .await
            .unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].1.field("payload"), Some("a"));

        // Delivered entries are not handed out again
        let again = log
            .read_group("g", "c2", &streams, 10, Duration::from_millis(1))
            .await
            .unwrap();
        assert!(again.is_empty());

        assert_eq!(log.pending("s", "g").await.unwrap().len(), 2);
        let ids: Vec<String> = batch.iter().map(|(_, e)| e.id.clone()).collect();
        assert_eq!(log.ack("s", "g", &ids).await.unwrap(), 2);
        assert!(log.pending("s", "g").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_new_group_starts_at_tail() {
        let log = MemoryStreamLog::new();
        log.append("s", fields("old"), None).await.unwrap();
        log.create_group("s", "g", GroupStart::Latest).await.unwrap();
        log.append("s", fields("new"), None).await.unwrap();

        let batch = log
            .read_group("g", "c", &["s".to_string()], 10, Duration::from_millis(1))
            .await
            .unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].1.field("payload"), Some("new"));
    }

    #[tokio::test]
    async fn test_group_start_positions() {
        let log = MemoryStreamLog::new();
        log.append("s", fields("before"), None).await.unwrap();
        let cutoff = epoch_millis(SystemTime::now()) + 1;
        tokio::time::sleep(Duration::from_millis(5)).await;
        log.append("s", fields("after"), None).await.unwrap();

        log.create_group("s", "all", GroupStart::Earliest).await.unwrap();
        log.create_group("s", "recent", GroupStart::Since(cutoff)).await.unwrap();
        let streams = vec!["s".to_string()];

        let all = log
            .read_group("all", "c", &streams, 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(all.len(), 2);

        let recent = log
            .read_group("recent", "c", &streams, 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].1.field("payload"), Some("after"));
    }

    #[tokio::test]
    async fn test_blocking_read_wakes_on_append() {
        let log = MemoryStreamLog::new();
        log.create_group("s", "g", GroupStart::Latest).await.unwrap();

        let writer = log.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.append("s", fields("late"), None).await.unwrap();
        });

        let started = Instant::now();
        let batch = log
            .read_group("g", "c", &["s".to_string()], 1, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(batch.len(), 1);
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_missing_group_is_not_found() {
        let log = MemoryStreamLog::new();
        log.append("s", fields("a"), None).await.unwrap();
        let result = log
            .read_group("nope", "c", &["s".to_string()], 1, Duration::ZERO)
            .await;
        assert!(matches!(result, Err(BackendError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_max_len_trims_oldest() {
        let log = MemoryStreamLog::new();
        for i in 0..5 {
            log.append("s", fields(&i.to_string()), Some(3)).await.unwrap();
        }
        assert_eq!(log.len("s").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_claim_idle_moves_ownership() {
        let log = MemoryStreamLog::new();
        log.create_group("s", "g", GroupStart::Latest).await.unwrap();
        log.append("s", fields("a"), None).await.unwrap();
        log.read_group("g", "crashed", &["s".to_string()], 1, Duration::ZERO)
            .await
            .unwrap();

        let none = log
            .claim_idle("s", "g", "rescuer", Duration::from_secs(60), 10)
            .await
            .unwrap();
        assert!(none.is_empty());

        let claimed = log
            .claim_idle("s", "g", "rescuer", Duration::ZERO, 10)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        let pending = log.pending("s", "g").await.unwrap();
        assert_eq!(pending[0].consumer, "rescuer");
        assert_eq!(pending[0].deliveries, 2);
    }

    #[tokio::test]
    async fn test_pipeline_reports_each_item() {
        let log = MemoryStreamLog::new();
        let results = log
            .append_pipeline(
                vec![
                    ("s".to_string(), fields("a")),
                    (String::new(), fields("b")),
                    ("s".to_string(), fields("c")),
                ],
                None,
            )
            .await
            .unwrap();
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
        assert!(results[2].is_ok());
        assert_eq!(log.len("s").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_outage_fails_every_call() {
        let log = MemoryStreamLog::new();
        log.set_available(false);
        assert!(matches!(log.ping().await, Err(BackendError::Unavailable(_))));
        assert!(log.append("s", fields("a"), None).await.is_err());
        log.set_available(true);
        assert!(log.ping().await.is_ok());
    }
}
