//! Consumer process registry
//!
//! Each consumer process registers itself, reports heartbeats while it runs and
//! moves through [`ProcessStatus`] by explicit calls. Liveness is inferred from
//! heartbeat age for listings only; the manager never terminates anything on
//! that basis.

use crate::config::ProcessSettings;
use crate::core::sync::Poisoned;
use crate::core::time::{system_clock, TimeProvider};
use crate::process::error::{ProcessError, ProcessResult};
use crate::process::record::{ConsumerProcessRecord, ProcessStatus};
use crate::process::store::{FileProcessStore, ProcessStore};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// What a process announces about itself when registering
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRegistration {
    pub driver: String,
    pub handler: String,
    pub channels: Vec<String>,
    /// Defaults to the calling process
    pub pid: Option<u32>,
}

/// Counters carried by a heartbeat
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeartbeatStats {
    pub messages_processed: u64,
    pub messages_failed: u64,
}

/// A record as shown by listings, with advisory liveness
#[derive(Debug, Clone, Serialize)]
pub struct ProcessView {
    #[serde(flatten)]
    pub record: ConsumerProcessRecord,
    pub display_status: String,
    pub heartbeat_age_secs: u64,
}

/// Aggregate view over every registered process
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessStatistics {
    pub total: usize,
    pub by_status: BTreeMap<String, usize>,
    pub by_driver: BTreeMap<String, usize>,
    pub by_handler: BTreeMap<String, usize>,
    pub messages_processed: u64,
    pub messages_failed: u64,
    pub suspected_dead: usize,
}

pub struct ConsumerProcessManager {
    store: Arc<dyn ProcessStore>,
    clock: Arc<dyn TimeProvider>,
    heartbeat_interval: Duration,
    liveness_timeout: Duration,
    last_persisted: Mutex<HashMap<String, Instant>>,
}

impl ConsumerProcessManager {
    pub fn new(
        store: Arc<dyn ProcessStore>,
        heartbeat_interval: Duration,
        liveness_timeout: Duration,
    ) -> Self {
        Self {
            store,
            clock: system_clock(),
            heartbeat_interval,
            liveness_timeout,
            last_persisted: Mutex::new(HashMap::new()),
        }
    }

    /// File-backed manager using the configured registry directory
    pub fn from_settings(settings: &ProcessSettings) -> Self {
        let store = Arc::new(FileProcessStore::new(settings.registry_dir()));
        Self::new(
            store,
            Duration::from_secs(settings.heartbeat_interval_secs),
            Duration::from_secs(settings.liveness_timeout_secs),
        )
    }

    pub fn with_clock(mut self, clock: Arc<dyn TimeProvider>) -> Self {
        self.clock = clock;
        self
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    pub fn liveness_timeout(&self) -> Duration {
        self.liveness_timeout
    }

    fn now(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from(self.clock.system_time())
    }

    fn persisted(&self) -> ProcessResult<std::sync::MutexGuard<'_, HashMap<String, Instant>>> {
        self.last_persisted.lock().or_process("heartbeat schedule")
    }

    async fn require(&self, id: &str) -> ProcessResult<ConsumerProcessRecord> {
        self.store
            .load(id)
            .await?
            .ok_or_else(|| ProcessError::NotRegistered { id: id.to_string() })
    }

    /// Create a `Starting` record and return it
    pub async fn register(&self, registration: ProcessRegistration) -> ProcessResult<ConsumerProcessRecord> {
        let pid = registration.pid.unwrap_or_else(std::process::id);
        let host = sysinfo::System::host_name().unwrap_or_else(|| "localhost".to_string());
        let now = self.now();
        let record = ConsumerProcessRecord {
            id: process_id(&host, pid),
            pid,
            host,
            driver: registration.driver,
            handler: registration.handler,
            channels: registration.channels,
            status: ProcessStatus::Starting,
            started_at: now,
            last_heartbeat: now,
            messages_processed: 0,
            messages_failed: 0,
            error: None,
            stopped_at: None,
        };
        self.store.save(&record).await?;

        log::info!(
            "Registered consumer process {} (driver {}, handler {})",
            record.id,
            record.driver,
            record.handler
        );
        Ok(record)
    }

    /// Move a process to `status`, recording `error` when given
    pub async fn update_status(
        &self,
        id: &str,
        status: ProcessStatus,
        error: Option<String>,
    ) -> ProcessResult<ConsumerProcessRecord> {
        let mut record = self.require(id).await?;
        if !record.status.can_transition_to(status) {
            return Err(ProcessError::InvalidTransition {
                id: id.to_string(),
                from: record.status,
                to: status,
            });
        }

        let now = self.now();
        log::debug!("Process {}: {} -> {}", id, record.status, status);
        record.status = status;
        record.last_heartbeat = now;
        if error.is_some() {
            record.error = error;
        }
        if status.is_terminal() {
            record.stopped_at = Some(now);
        }
        self.store.save(&record).await?;
        Ok(record)
    }

    /// Report liveness and counters; persisted at most once per heartbeat interval
    ///
    /// Returns whether this heartbeat was written.
    pub async fn heartbeat(&self, id: &str, stats: HeartbeatStats) -> ProcessResult<bool> {
        let due = match self.persisted()?.get(id) {
            Some(last) => self.clock.now().saturating_duration_since(*last) >= self.heartbeat_interval,
            None => true,
        };
        if !due {
            return Ok(false);
        }
        self.write_heartbeat(id, stats).await?;
        Ok(true)
    }

    /// Persist a heartbeat regardless of the rate limit (final counters on exit)
    pub async fn force_heartbeat(&self, id: &str, stats: HeartbeatStats) -> ProcessResult<()> {
        self.write_heartbeat(id, stats).await
    }

    async fn write_heartbeat(&self, id: &str, stats: HeartbeatStats) -> ProcessResult<()> {
        let mut record = self.require(id).await?;
        record.last_heartbeat = self.now();
        record.messages_processed = stats.messages_processed;
        record.messages_failed = stats.messages_failed;
        self.store.save(&record).await?;
        self.persisted()?.insert(id.to_string(), self.clock.now());
        log::trace!(
            "Heartbeat for {}: {} processed, {} failed",
            id,
            stats.messages_processed,
            stats.messages_failed
        );
        Ok(())
    }

    pub async fn mark_failed(&self, id: &str, error: impl Into<String>) -> ProcessResult<ConsumerProcessRecord> {
        let error = error.into();
        log::warn!("Consumer process {} failed: {}", id, error);
        self.update_status(id, ProcessStatus::Failed, Some(error)).await
    }

    /// Remove a record; `false` if it was already gone
    pub async fn unregister(&self, id: &str) -> ProcessResult<bool> {
        self.persisted()?.remove(id);
        let removed = self.store.remove(id).await?;
        if removed {
            log::info!("Unregistered consumer process {}", id);
        }
        Ok(removed)
    }

    pub async fn get(&self, id: &str) -> ProcessResult<Option<ConsumerProcessRecord>> {
        self.store.load(id).await
    }

    /// Every record with its advisory liveness
    pub async fn list(&self) -> ProcessResult<Vec<ProcessView>> {
        let now = self.now();
        Ok(self
            .store
            .list()
            .await?
            .into_iter()
            .map(|record| ProcessView {
                display_status: record.display_status(now, self.liveness_timeout),
                heartbeat_age_secs: record.heartbeat_age(now).as_secs(),
                record,
            })
            .collect())
    }

    /// Remove records whose last heartbeat is older than `timeout`
    ///
    /// Terminal records are removed on the same basis, so stopped processes
    /// that never unregistered do not accumulate.
    pub async fn reap_stale(&self, timeout: Duration) -> ProcessResult<Vec<String>> {
        let now = self.now();
        let mut reaped = Vec::new();
        for record in self.store.list().await? {
            if record.heartbeat_age(now) > timeout && self.store.remove(&record.id).await? {
                log::info!(
                    "Reaped process {} ({}, silent for {}s)",
                    record.id,
                    record.status,
                    record.heartbeat_age(now).as_secs()
                );
                reaped.push(record.id);
            }
        }
        let mut persisted = self.persisted()?;
        for id in &reaped {
            persisted.remove(id);
        }
        Ok(reaped)
    }

    pub async fn statistics(&self) -> ProcessResult<ProcessStatistics> {
        let now = self.now();
        let mut stats = ProcessStatistics::default();
        for record in self.store.list().await? {
            stats.total += 1;
            *stats.by_status.entry(record.status.to_string()).or_default() += 1;
            *stats.by_driver.entry(record.driver.clone()).or_default() += 1;
            *stats.by_handler.entry(record.handler.clone()).or_default() += 1;
            stats.messages_processed += record.messages_processed;
            stats.messages_failed += record.messages_failed;
            if record.is_suspect(now, self.liveness_timeout) {
                stats.suspected_dead += 1;
            }
        }
        Ok(stats)
    }
}

/// `host-pid-xxxxxxxx`, restricted to characters safe in a file name
fn process_id(host: &str, pid: u32) -> String {
    let host: String = host
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}-{}", host, pid, &suffix[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::time::MockTimeProvider;
    use crate::process::store::MemoryProcessStore;

    fn manager() -> (ConsumerProcessManager, MockTimeProvider) {
        let clock = MockTimeProvider::new();
        let manager = ConsumerProcessManager::new(
            Arc::new(MemoryProcessStore::new()),
            Duration::from_secs(10),
            Duration::from_secs(60),
        )
        .with_clock(Arc::new(clock.clone()));
        (manager, clock)
    }

    fn registration(driver: &str, handler: &str) -> ProcessRegistration {
        ProcessRegistration {
            driver: driver.into(),
            handler: handler.into(),
            channels: vec!["orders".into()],
            pid: Some(4242),
        }
    }

    #[test]
    fn test_process_id_is_file_safe() {
        let id = process_id("build box.local", 7);
        assert!(id.starts_with("build-box-local-7-"));
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-'));
    }

    #[tokio::test]
    async fn test_lifecycle_transitions() {
        let (manager, _) = manager();
        let record = manager.register(registration("stream", "audit")).await.unwrap();
        assert_eq!(record.status, ProcessStatus::Starting);
        assert_eq!(record.pid, 4242);

        manager
            .update_status(&record.id, ProcessStatus::Running, None)
            .await
            .unwrap();
        let err = manager
            .update_status(&record.id, ProcessStatus::Stopped, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::InvalidTransition { .. }));

        manager
            .update_status(&record.id, ProcessStatus::Stopping, None)
            .await
            .unwrap();
        let stopped = manager
            .update_status(&record.id, ProcessStatus::Stopped, None)
            .await
            .unwrap();
        assert!(stopped.stopped_at.is_some());

        assert!(manager.unregister(&record.id).await.unwrap());
        assert!(!manager.unregister(&record.id).await.unwrap());
        assert!(matches!(
            manager.heartbeat(&record.id, HeartbeatStats::default()).await,
            Err(ProcessError::NotRegistered { .. })
        ));
    }

    #[tokio::test]
    async fn test_heartbeat_is_rate_limited() {
        let (manager, clock) = manager();
        let id = manager.register(registration("amqp", "jobs")).await.unwrap().id;

        let stats = HeartbeatStats {
            messages_processed: 5,
            messages_failed: 1,
        };
        assert!(manager.heartbeat(&id, stats).await.unwrap());
        clock.advance_time(Duration::from_secs(3));
        assert!(!manager
            .heartbeat(
                &id,
                HeartbeatStats {
                    messages_processed: 6,
                    messages_failed: 1
                }
            )
            .await
            .unwrap());

        let record = manager.get(&id).await.unwrap().unwrap();
        assert_eq!(record.messages_processed, 5);

        clock.advance_time(Duration::from_secs(7));
        assert!(manager.heartbeat(&id, stats).await.unwrap());

        manager
            .force_heartbeat(
                &id,
                HeartbeatStats {
                    messages_processed: 9,
                    messages_failed: 2,
                },
            )
            .await
            .unwrap();
        assert_eq!(manager.get(&id).await.unwrap().unwrap().messages_processed, 9);
    }

    #[tokio::test]
    async fn test_silent_process_listed_as_dead_but_kept() {
        let (manager, clock) = manager();
        let id = manager.register(registration("pubsub", "billing")).await.unwrap().id;
        manager
            .update_status(&id, ProcessStatus::Running, None)
            .await
            .unwrap();

        clock.advance_time(Duration::from_secs(61));
        let views = manager.list().await.unwrap();
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].display_status, "dead?");
        assert_eq!(views[0].record.status, ProcessStatus::Running);
        assert_eq!(views[0].heartbeat_age_secs, 61);
    }

    #[tokio::test]
    async fn test_reap_removes_only_stale_records() {
        let (manager, clock) = manager();
        let old = manager.register(registration("stream", "a")).await.unwrap().id;
        clock.advance_time(Duration::from_secs(200));
        let fresh = manager.register(registration("stream", "b")).await.unwrap().id;
        clock.advance_time(Duration::from_secs(150));

        let reaped = manager.reap_stale(Duration::from_secs(300)).await.unwrap();
        assert_eq!(reaped, vec![old.clone()]);
        assert!(manager.get(&old).await.unwrap().is_none());
        assert!(manager.get(&fresh).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_statistics_aggregate() {
        let (manager, clock) = manager();
        let a = manager.register(registration("stream", "audit")).await.unwrap().id;
        let b = manager.register(registration("stream", "billing")).await.unwrap().id;
        let _c = manager.register(registration("amqp", "billing")).await.unwrap().id;

        manager.update_status(&a, ProcessStatus::Running, None).await.unwrap();
        manager.mark_failed(&b, "connection refused").await.unwrap();
        clock.advance_time(Duration::from_secs(10));
        manager
            .heartbeat(
                &a,
                HeartbeatStats {
                    messages_processed: 40,
                    messages_failed: 3,
                },
            )
            .await
            .unwrap();

        let stats = manager.statistics().await.unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_status["running"], 1);
        assert_eq!(stats.by_status["failed"], 1);
        assert_eq!(stats.by_status["starting"], 1);
        assert_eq!(stats.by_driver["stream"], 2);
        assert_eq!(stats.by_handler["billing"], 2);
        assert_eq!(stats.messages_processed, 40);
        assert_eq!(stats.messages_failed, 3);
        assert_eq!(stats.suspected_dead, 0);

        let failed = manager.get(&b).await.unwrap().unwrap();
        assert_eq!(failed.error.as_deref(), Some("connection refused"));
    }
}
