//! Process record storage
//!
//! [`FileProcessStore`] keeps one JSON document per process in a directory.
//! Writes go to a temporary file in the same directory and are renamed into
//! place, so a concurrent reader sees either the old or the new record, never
//! a torn one.

use crate::core::sync::Poisoned;
use crate::process::error::{ProcessError, ProcessResult};
use crate::process::record::ConsumerProcessRecord;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const RECORD_EXTENSION: &str = "json";

#[async_trait]
pub trait ProcessStore: Send + Sync {
    /// Insert or replace a record
    async fn save(&self, record: &ConsumerProcessRecord) -> ProcessResult<()>;

    async fn load(&self, id: &str) -> ProcessResult<Option<ConsumerProcessRecord>>;

    /// Remove a record; `false` if it did not exist
    async fn remove(&self, id: &str) -> ProcessResult<bool>;

    /// All readable records, ordered by id
    async fn list(&self) -> ProcessResult<Vec<ConsumerProcessRecord>>;
}

#[derive(Debug, Clone)]
pub struct FileProcessStore {
    dir: PathBuf,
}

impl FileProcessStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", id, RECORD_EXTENSION))
    }

    async fn read_record(path: &Path) -> ProcessResult<Option<ConsumerProcessRecord>> {
        let contents = match tokio::fs::read_to_string(path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(ProcessError::io(path, e)),
        };
        serde_json::from_str(&contents)
            .map(Some)
            .map_err(|e| ProcessError::Corrupt {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })
    }
}

#[async_trait]
impl ProcessStore for FileProcessStore {
    async fn save(&self, record: &ConsumerProcessRecord) -> ProcessResult<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| ProcessError::io(&self.dir, e))?;

        let body = serde_json::to_vec_pretty(record).map_err(|e| ProcessError::Corrupt {
            path: self.record_path(&record.id),
            reason: e.to_string(),
        })?;
        // Dot-prefixed so listings skip it while it is being written
        let temp = self.dir.join(format!(
            ".{}.{}.tmp",
            record.id,
            uuid::Uuid::new_v4().simple()
        ));
        tokio::fs::write(&temp, body)
            .await
            .map_err(|e| ProcessError::io(&temp, e))?;

        let target = self.record_path(&record.id);
        if let Err(e) = tokio::fs::rename(&temp, &target).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(ProcessError::io(target, e));
        }
        Ok(())
    }

    async fn load(&self, id: &str) -> ProcessResult<Option<ConsumerProcessRecord>> {
        Self::read_record(&self.record_path(id)).await
    }

    async fn remove(&self, id: &str) -> ProcessResult<bool> {
        let path = self.record_path(id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(ProcessError::io(path, e)),
        }
    }

    async fn list(&self) -> ProcessResult<Vec<ConsumerProcessRecord>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(ProcessError::io(&self.dir, e)),
        };

        let mut records = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| ProcessError::io(&self.dir, e))?
        {
            let path = entry.path();
            let hidden = path
                .file_name()
                .and_then(|n| n.to_str())
                .map_or(true, |n| n.starts_with('.'));
            let is_record = path.extension().and_then(|e| e.to_str()) == Some(RECORD_EXTENSION);
            if hidden || !is_record {
                continue;
            }
            match Self::read_record(&path).await {
                Ok(Some(record)) => records.push(record),
                // Removed between listing and reading
                Ok(None) => {}
                Err(e) => log::warn!("Skipping process record: {}", e),
            }
        }
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }
}

/// In-memory store for tests and single-process tools
#[derive(Debug, Default)]
pub struct MemoryProcessStore {
    records: Mutex<BTreeMap<String, ConsumerProcessRecord>>,
}

impl MemoryProcessStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> ProcessResult<std::sync::MutexGuard<'_, BTreeMap<String, ConsumerProcessRecord>>> {
        self.records.lock().or_process("process registry")
    }
}

#[async_trait]
impl ProcessStore for MemoryProcessStore {
    async fn save(&self, record: &ConsumerProcessRecord) -> ProcessResult<()> {
        self.records()?.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn load(&self, id: &str) -> ProcessResult<Option<ConsumerProcessRecord>> {
        Ok(self.records()?.get(id).cloned())
    }

    async fn remove(&self, id: &str) -> ProcessResult<bool> {
        Ok(self.records()?.remove(id).is_some())
    }

    async fn list(&self) -> ProcessResult<Vec<ConsumerProcessRecord>> {
        Ok(self.records()?.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::record::ProcessStatus;
    use chrono::Utc;
    use tempfile::TempDir;

    fn record(id: &str) -> ConsumerProcessRecord {
        let now = Utc::now();
        ConsumerProcessRecord {
            id: id.to_string(),
            pid: 42,
            host: "worker-1".into(),
            driver: "pubsub".into(),
            handler: "billing".into(),
            channels: vec!["invoices.*".into()],
            status: ProcessStatus::Starting,
            started_at: now,
            last_heartbeat: now,
            messages_processed: 0,
            messages_failed: 0,
            error: None,
            stopped_at: None,
        }
    }

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = FileProcessStore::new(dir.path().join("registry"));

        assert!(store.list().await.unwrap().is_empty());
        store.save(&record("b")).await.unwrap();
        store.save(&record("a")).await.unwrap();

        let mut updated = record("a");
        updated.status = ProcessStatus::Running;
        store.save(&updated).await.unwrap();

        let ids: Vec<_> = store.list().await.unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(
            store.load("a").await.unwrap().unwrap().status,
            ProcessStatus::Running
        );

        assert!(store.remove("a").await.unwrap());
        assert!(!store.remove("a").await.unwrap());
        assert!(store.load("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_store_skips_temp_and_corrupt_files() {
        let dir = TempDir::new().unwrap();
        let store = FileProcessStore::new(dir.path());
        store.save(&record("good")).await.unwrap();
        std::fs::write(dir.path().join(".good.123.tmp"), "{").unwrap();
        std::fs::write(dir.path().join("broken.json"), "not json").unwrap();

        let records = store.list().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, "good");
        assert!(matches!(
            store.load("broken").await,
            Err(ProcessError::Corrupt { .. })
        ));
    }

    #[tokio::test]
    async fn test_concurrent_saves_never_tear() {
        let dir = TempDir::new().unwrap();
        let store = std::sync::Arc::new(FileProcessStore::new(dir.path()));

        let mut tasks = Vec::new();
        for i in 0..20u64 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                let mut r = record("shared");
                r.messages_processed = i;
                store.save(&r).await.unwrap();
            }));
        }
        for _ in 0..20 {
            // Every read parses; there is no half-written state to observe
            let _ = store.load("shared").await.unwrap();
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert!(store.load("shared").await.unwrap().is_some());
    }
}
