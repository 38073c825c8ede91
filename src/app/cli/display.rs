//! Terminal rendering for administrative commands

use crate::broker::HealthCheckResult;
use crate::core::styles::StyleRole;
use crate::process::{ProcessStatistics, ProcessView};
use prettytable::{format, Cell, Row, Table};

const CHANNEL_COLUMN_WIDTH: usize = 32;

fn header_row(titles: &[&str], use_color: bool) -> Row {
    Row::new(
        titles
            .iter()
            .map(|title| {
                let cell = Cell::new(title);
                match StyleRole::Header.to_prettytable_spec() {
                    Some(spec) if use_color => cell.style_spec(&format!("b{}", spec)),
                    _ => cell,
                }
            })
            .collect(),
    )
}

fn status_cell(label: &str, use_color: bool) -> Cell {
    let cell = Cell::new(label);
    match StyleRole::for_status(label).to_prettytable_spec() {
        Some(spec) if use_color => cell.style_spec(spec),
        _ => cell,
    }
}

fn truncate(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        return text.to_string();
    }
    let kept: String = text.chars().take(width.saturating_sub(1)).collect();
    format!("{}…", kept)
}

/// Process listing as a table; liveness shown as `dead?` for silent processes
pub fn process_table(views: &[ProcessView], use_color: bool) -> Table {
    let mut table = Table::new();
    table.set_format(*format::consts::FORMAT_CLEAN);
    table.set_titles(header_row(
        &[
            "ID", "PID", "DRIVER", "HANDLER", "CHANNELS", "STATUS", "HEARTBEAT", "PROCESSED", "FAILED",
        ],
        use_color,
    ));

    for view in views {
        let record = &view.record;
        table.add_row(Row::new(vec![
            Cell::new(&record.id),
            Cell::new(&record.pid.to_string()),
            Cell::new(&record.driver),
            Cell::new(&record.handler),
            Cell::new(&truncate(&record.channels.join(","), CHANNEL_COLUMN_WIDTH)),
            status_cell(&view.display_status, use_color),
            Cell::new(&format!("{}s ago", view.heartbeat_age_secs)),
            Cell::new(&record.messages_processed.to_string()).style_spec("r"),
            Cell::new(&record.messages_failed.to_string()).style_spec("r"),
        ]));
    }
    table
}

pub fn statistics_lines(stats: &ProcessStatistics, use_color: bool) -> Vec<String> {
    let key = |k: &str| StyleRole::Key.paint(k, use_color);
    let breakdown = |counts: &std::collections::BTreeMap<String, usize>| {
        if counts.is_empty() {
            return "-".to_string();
        }
        counts
            .iter()
            .map(|(name, count)| format!("{}={}", name, count))
            .collect::<Vec<_>>()
            .join(", ")
    };

    let mut lines = vec![
        format!("{}: {}", key("processes"), stats.total),
        format!("{}: {}", key("by status"), breakdown(&stats.by_status)),
        format!("{}: {}", key("by driver"), breakdown(&stats.by_driver)),
        format!("{}: {}", key("by handler"), breakdown(&stats.by_handler)),
        format!("{}: {}", key("messages processed"), stats.messages_processed),
        format!("{}: {}", key("messages failed"), stats.messages_failed),
    ];
    if stats.suspected_dead > 0 {
        lines.push(format!(
            "{}: {}",
            key("suspected dead"),
            StyleRole::Suspect.paint(&stats.suspected_dead.to_string(), use_color)
        ));
    }
    lines
}

pub fn health_lines(result: &HealthCheckResult, use_color: bool) -> Vec<String> {
    let status = result.status.to_string();
    let mut lines = vec![format!(
        "{} {} ({} ms)",
        StyleRole::for_status(&status).paint(&status.to_uppercase(), use_color),
        result.message,
        result.latency_ms
    )];
    for (name, value) in &result.details {
        let value = match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        lines.push(format!(
            "  {}: {}",
            StyleRole::Key.paint(name, use_color),
            value
        ));
    }
    lines
}
