//! Human-readable formatting for operator messages.

use chrono::{DateTime, Local};

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// Format seconds as human-readable string
pub fn format_duration(seconds: f64) -> String {
    if seconds < 60.0 {
        format!("{:.2}s", seconds)
    } else if seconds < 3600.0 {
        let whole = seconds as u64;
        format!("{}m {}s", whole / 60, whole % 60)
    } else {
        let whole = seconds as u64;
        format!("{}h {}m", whole / 3600, (whole % 3600) / 60)
    }
}

/// Display time stored alongside each slot
pub fn display_time(at: DateTime<Local>) -> String {
    at.format("%Y/%m/%d %H:%M:%S").to_string()
}
