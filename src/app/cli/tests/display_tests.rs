//! Tests for administrative output rendering

use crate::app::cli::display::*;
use crate::broker::HealthCheckResult;
use crate::process::{ConsumerProcessRecord, ProcessStatistics, ProcessStatus, ProcessView};
use chrono::Utc;

fn view(id: &str, display_status: &str) -> ProcessView {
    let now = Utc::now();
    ProcessView {
        record: ConsumerProcessRecord {
            id: id.to_string(),
            pid: 311,
            host: "worker".into(),
            driver: "stream".into(),
            handler: "audit".into(),
            channels: vec!["orders".into(), "users.*".into()],
            status: ProcessStatus::Running,
            started_at: now,
            last_heartbeat: now,
            messages_processed: 12,
            messages_failed: 1,
            error: None,
            stopped_at: None,
        },
        display_status: display_status.to_string(),
        heartbeat_age_secs: 75,
    }
}

#[test]
fn test_process_table_plain() {
    let table = process_table(&[view("worker-311-abcd", "dead?")], false);
    let output = table.to_string();

    assert!(output.contains("STATUS"));
    assert!(output.contains("worker-311-abcd"));
    assert!(output.contains("dead?"));
    assert!(output.contains("orders,users.*"));
    assert!(output.contains("75s ago"));
    assert!(!output.contains("\x1b["));
}

#[test]
fn test_long_channel_lists_are_truncated() {
    let mut long = view("w", "running");
    long.record.channels = (0..20).map(|i| format!("channel-{}", i)).collect();
    let output = process_table(&[long], false).to_string();
    assert!(output.contains('…'));
    assert!(!output.contains("channel-19"));
}

#[test]
fn test_statistics_lines() {
    let mut stats = ProcessStatistics {
        total: 2,
        messages_processed: 40,
        ..Default::default()
    };
    stats.by_status.insert("running".into(), 2);
    stats.by_driver.insert("amqp".into(), 2);

    let lines = statistics_lines(&stats, false);
    assert_eq!(lines[0], "processes: 2");
    assert_eq!(lines[1], "by status: running=2");
    assert_eq!(lines[3], "by handler: -");
    assert!(!lines.iter().any(|l| l.starts_with("suspected dead")));

    stats.suspected_dead = 1;
    let lines = statistics_lines(&stats, false);
    assert_eq!(lines.last().map(String::as_str), Some("suspected dead: 1"));
}

#[test]
fn test_health_lines_flatten_details() {
    let result = HealthCheckResult::degraded("circuit half-open")
        .with_detail("driver", "stream")
        .with_detail("queued", 3);
    let lines = health_lines(&result, false);
    assert!(lines[0].starts_with("DEGRADED circuit half-open"));
    assert!(lines.contains(&"  driver: stream".to_string()));
    assert!(lines.contains(&"  queued: 3".to_string()));
}
