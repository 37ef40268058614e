//! Display formatting helpers for speeds, durations and sizes.

use std::time::{SystemTime, UNIX_EPOCH};

/// Bytes in one megabyte as used for speed display.
pub const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Placeholder shown when the ETA is unknown.
pub const UNKNOWN_ETA: &str = "—";

/// Current time as Unix milliseconds.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Formats a speed in megabytes per second, e.g. `"1.8MB/s"`.
#[must_use]
pub fn format_speed_mbps(mbps: f64) -> String {
    format!("{mbps:.1}MB/s")
}

/// Formats remaining seconds as `mm:ss` or `hh:mm:ss`.
///
/// Zero and negative values (unknown) render as [`UNKNOWN_ETA`].
#[must_use]
pub fn format_eta(seconds: i64) -> String {
    if seconds <= 0 {
        return UNKNOWN_ETA.to_string();
    }
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;
    if hours > 0 {
        format!("{hours:02}:{minutes:02}:{secs:02}")
    } else {
        format!("{minutes:02}:{secs:02}")
    }
}

/// Formats a media duration the way the download tool prints it:
/// `"4:05"`, `"1:02:03"`.
#[must_use]
pub fn format_duration_label(seconds: u64) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;
    if hours > 0 {
        format!("{hours}:{minutes:02}:{secs:02}")
    } else {
        format!("{minutes}:{secs:02}")
    }
}

/// Formats a byte count with a binary unit suffix.
#[must_use]
pub fn format_file_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_speed() {
        assert_eq!(format_speed_mbps(1.8), "1.8MB/s");
        assert_eq!(format_speed_mbps(12.345), "12.3MB/s");
    }

    #[test]
    fn test_format_eta() {
        assert_eq!(format_eta(-1), UNKNOWN_ETA);
        assert_eq!(format_eta(0), UNKNOWN_ETA);
        assert_eq!(format_eta(75), "01:15");
        assert_eq!(format_eta(3723), "01:02:03");
    }

    #[test]
    fn test_format_duration_label() {
        assert_eq!(format_duration_label(245), "4:05");
        assert_eq!(format_duration_label(3723), "1:02:03");
        assert_eq!(format_duration_label(0), "0:00");
    }

    #[test]
    fn test_format_file_size() {
        assert_eq!(format_file_size(512), "512 B");
        assert_eq!(format_file_size(1536), "1.5 KB");
        assert_eq!(format_file_size(5 * 1024 * 1024), "5.0 MB");
    }
}
