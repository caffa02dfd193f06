//! Human-readable sizes and durations for progress output

/// Format a byte count with decimal units (e.g. "1.23 GB", "456.78 MB")
pub fn format_size(bytes: u64) -> String {
    if bytes >= 1_000_000_000 {
        return format!("{:.2} GB", bytes as f64 / 1_000_000_000.0);
    }
    if bytes >= 1_000_000 {
        return format!("{:.2} MB", bytes as f64 / 1_000_000.0);
    }
    if bytes >= 1_000 {
        return format!("{:.2} KB", bytes as f64 / 1_000.0);
    }
    format!("{} B", bytes)
}

/// Format a number of seconds as "2h 15m", "45m 30s" or "30s"
pub fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        return format!("{}s", seconds);
    }

    let minutes = seconds / 60;
    let remaining_seconds = seconds % 60;

    if minutes < 60 {
        if remaining_seconds > 0 {
            return format!("{}m {}s", minutes, remaining_seconds);
        }
        return format!("{}m", minutes);
    }

    let hours = minutes / 60;
    let remaining_minutes = minutes % 60;

    if remaining_minutes > 0 {
        format!("{}h {}m", hours, remaining_minutes)
    } else {
        format!("{}h", hours)
    }
}
