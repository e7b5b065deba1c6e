//! Output formatting utilities

use console::{style, StyledObject};
use segdl_types::StatusCode;

/// Format bytes as human-readable
pub fn format_bytes(bytes: u64) -> String {
    human_bytes::human_bytes(bytes as f64)
}

/// Format speed as human-readable
pub fn format_speed(bytes_per_sec: u64) -> String {
    format!("{}/s", human_bytes::human_bytes(bytes_per_sec as f64))
}

/// Progress of `done` out of an optional total
pub fn format_progress(done: u64, total: Option<u64>) -> String {
    match total {
        Some(0) => "100.0%".to_string(),
        Some(total) => format!("{:.1}%", done as f64 * 100.0 / total as f64),
        None => format_bytes(done),
    }
}

/// Status icon for list output
pub fn status_icon(status: StatusCode) -> StyledObject<&'static str> {
    match status {
        StatusCode::Success => style("✓").green(),
        StatusCode::Running => style("↓").cyan(),
        StatusCode::Paused => style("⏸").yellow(),
        StatusCode::Stopped => style("○").dim(),
        StatusCode::WaitingToRetry | StatusCode::WaitingForNetwork => style("↻").yellow(),
        status if status.is_error() => style("✗").red(),
        _ => style("·").dim(),
    }
}

/// Shorten long names for table cells
pub fn truncate_name(name: &str, max: usize) -> String {
    if name.chars().count() <= max {
        return name.to_string();
    }
    let head: String = name.chars().take(max.saturating_sub(3)).collect();
    format!("{}...", head)
}
