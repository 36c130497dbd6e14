//! Output formatting utilities

use console::{style, StyledObject};
use fetchd_types::{DownloadRecord, DownloadStatus};
use serde::Serialize;
use tabled::{Table, Tabled};

pub fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Format bytes as human-readable
pub fn format_bytes(bytes: u64) -> String {
    human_bytes::human_bytes(bytes as f64)
}

pub fn format_speed(bytes_per_sec: u64) -> String {
    format!("{}/s", human_bytes::human_bytes(bytes_per_sec as f64))
}

/// Format an ETA in milliseconds, `-1` meaning unknown
pub fn format_eta(eta_ms: i64) -> String {
    if eta_ms < 0 {
        return "-".to_string();
    }

    let seconds = (eta_ms as u64).div_ceil(1000);
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, secs)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, secs)
    } else {
        format!("{}s", secs)
    }
}

pub fn format_size(record: &DownloadRecord) -> String {
    match record.total_known() {
        Some(total) => format!(
            "{} / {}",
            format_bytes(record.downloaded_bytes),
            format_bytes(total)
        ),
        None => format!("{} / ?", format_bytes(record.downloaded_bytes)),
    }
}

pub fn format_progress(record: &DownloadRecord) -> String {
    record
        .progress()
        .map(|p| format!("{:.1}%", p))
        .unwrap_or_else(|| "?".to_string())
}

pub fn status_icon(status: DownloadStatus) -> StyledObject<&'static str> {
    match status {
        DownloadStatus::Completed => style("✓").green(),
        DownloadStatus::Downloading => style("↓").cyan(),
        DownloadStatus::Paused => style("⏸").yellow(),
        DownloadStatus::Failed => style("✗").red(),
        DownloadStatus::Cancelled | DownloadStatus::Removed => style("○").dim(),
        DownloadStatus::Queued => style("·").dim(),
    }
}

/// Trim to `max` characters, marking the cut
pub fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let kept: String = text.chars().take(max.saturating_sub(3)).collect();
    format!("{}...", kept)
}

#[derive(Tabled)]
struct RecordRow {
    id: String,
    name: String,
    status: String,
    progress: String,
    size: String,
    group: u32,
    priority: String,
}

pub fn print_table(records: &[DownloadRecord]) {
    let rows: Vec<RecordRow> = records
        .iter()
        .map(|r| RecordRow {
            id: r.id.short(),
            name: truncate(&r.display_name, 30),
            status: r.status.to_string(),
            progress: format_progress(r),
            size: format_size(r),
            group: r.group.0,
            priority: format!("{:?}", r.priority).to_lowercase(),
        })
        .collect();

    println!("{}", Table::new(rows));
}

pub fn print_record(record: &DownloadRecord, detailed: bool) {
    println!(
        "{} {} {} [{}]",
        status_icon(record.status),
        style(&record.display_name).bold(),
        style(format_progress(record)).dim(),
        style(record.status).dim()
    );

    if detailed {
        println!("    ID: {}", record.id);
        println!("    URL: {}", record.url);
        println!("    File: {}", record.destination.display());
        println!("    Size: {}", format_size(record));
        println!("    Group: {}", record.group);
        println!("    Network: {}", record.network_policy.as_str());
        if let Some(reason) = record.pause_reason {
            println!("    Paused by: {}", reason.as_str());
        }
        if let Some(ref message) = record.error_message {
            println!("    Error: {} ({})", style(message).red(), record.error);
        }
        println!("    Added: {}", record.created_at.format("%Y-%m-%d %H:%M:%S"));
        println!();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_eta() {
        assert_eq!(format_eta(-1), "-");
        assert_eq!(format_eta(0), "0s");
        assert_eq!(format_eta(1_500), "2s");
        assert_eq!(format_eta(61_000), "1m 1s");
        assert_eq!(format_eta(3_723_000), "1h 2m 3s");
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("a-rather-long-name.iso", 10), "a-rathe...");
    }
}
