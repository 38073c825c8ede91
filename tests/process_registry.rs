//! File-backed process registry shared between a consumer and readers

use relaybus::core::time::MockTimeProvider;
use relaybus::process::{
    ConsumerProcessManager, ConsumerProcessRecord, FileProcessStore, HeartbeatStats, ProcessRegistration,
    ProcessStatus, ProcessStore,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn registration(pid: u32) -> ProcessRegistration {
    ProcessRegistration {
        driver: "stream".to_string(),
        handler: "orders".to_string(),
        channels: vec!["orders".to_string(), "payments".to_string()],
        pid: Some(pid),
    }
}

fn read_record(dir: &TempDir, id: &str) -> ConsumerProcessRecord {
    let text = std::fs::read_to_string(dir.path().join(format!("{}.json", id))).unwrap();
    serde_json::from_str(&text).unwrap()
}

fn stats(processed: u64, failed: u64) -> HeartbeatStats {
    HeartbeatStats {
        messages_processed: processed,
        messages_failed: failed,
    }
}

#[tokio::test]
async fn heartbeats_within_interval_are_not_persisted() {
    let dir = TempDir::new().unwrap();
    let clock = MockTimeProvider::new();
    let manager = ConsumerProcessManager::new(
        Arc::new(FileProcessStore::new(dir.path())),
        Duration::from_secs(5),
        Duration::from_secs(30),
    )
    .with_clock(Arc::new(clock.clone()));

    let record = manager.register(registration(4242)).await.unwrap();
    manager
        .update_status(&record.id, ProcessStatus::Running, None)
        .await
        .unwrap();

    assert!(manager.heartbeat(&record.id, stats(10, 1)).await.unwrap());
    clock.advance_time(Duration::from_secs(2));
    assert!(!manager.heartbeat(&record.id, stats(20, 2)).await.unwrap());

    let on_disk = read_record(&dir, &record.id);
    assert_eq!(on_disk.messages_processed, 10);
    assert_eq!(on_disk.messages_failed, 1);

    clock.advance_time(Duration::from_secs(4));
    assert!(manager.heartbeat(&record.id, stats(30, 3)).await.unwrap());
    let on_disk = read_record(&dir, &record.id);
    assert_eq!(on_disk.messages_processed, 30);
    assert_eq!(on_disk.status, ProcessStatus::Running);
}

#[tokio::test]
async fn silent_process_is_listed_as_suspect_then_reaped() {
    let dir = TempDir::new().unwrap();
    let clock = MockTimeProvider::new();
    let manager = ConsumerProcessManager::new(
        Arc::new(FileProcessStore::new(dir.path())),
        Duration::from_secs(5),
        Duration::from_secs(30),
    )
    .with_clock(Arc::new(clock.clone()));

    let record = manager.register(registration(7)).await.unwrap();
    manager
        .update_status(&record.id, ProcessStatus::Running, None)
        .await
        .unwrap();

    clock.advance_time(Duration::from_secs(45));
    let views = manager.list().await.unwrap();
    assert_eq!(views.len(), 1);
    assert_eq!(views[0].display_status, "dead?");
    assert_eq!(views[0].record.status, ProcessStatus::Running);

    let reaped = manager.reap_stale(Duration::from_secs(40)).await.unwrap();
    assert_eq!(reaped, vec![record.id.clone()]);
    assert!(manager.get(&record.id).await.unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn readers_never_see_partial_records() {
    let dir = TempDir::new().unwrap();
    let manager = Arc::new(ConsumerProcessManager::new(
        Arc::new(FileProcessStore::new(dir.path())),
        Duration::ZERO,
        Duration::from_secs(30),
    ));
    let record = manager.register(registration(99)).await.unwrap();
    manager
        .update_status(&record.id, ProcessStatus::Running, None)
        .await
        .unwrap();

    let done = Arc::new(AtomicBool::new(false));
    let reader = {
        let store = FileProcessStore::new(dir.path());
        let done = done.clone();
        tokio::spawn(async move {
            let mut reads = 0;
            while !done.load(Ordering::SeqCst) {
                let records = store.list().await.unwrap();
                assert_eq!(records.len(), 1, "temp files must not be listed");
                assert!(records[0].messages_processed <= 500);
                reads += 1;
                tokio::task::yield_now().await;
            }
            reads
        })
    };

    for n in 1..=500 {
        assert!(manager.heartbeat(&record.id, stats(n, 0)).await.unwrap());
    }
    done.store(true, Ordering::SeqCst);
    let reads = reader.await.unwrap();
    assert!(reads > 0);
    assert_eq!(read_record(&dir, &record.id).messages_processed, 500);
}
