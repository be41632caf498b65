//! Display helpers for sizes and timestamps.

use chrono::{DateTime, Local, TimeZone};
use std::fmt::Display;

const SIZE_UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// `1536` → `"1.5KB"`. At most two decimals; a value is only scaled up once
/// it exceeds 1024 of the next unit, so `1024` stays `"1024B"`.
pub fn format_size(size: u64) -> String {
    let mut value = size as f64;
    let mut unit = 0;
    while value / 1024.0 > 1.0 && unit < SIZE_UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    let fixed = format!("{:.2}", value);
    let trimmed = fixed.trim_end_matches('0').trim_end_matches('.');
    format!("{}{}", trimmed, SIZE_UNITS[unit])
}

/// `yyyy-MM-dd HH:mm:ss` in the timestamp's own zone.
pub fn format_timestamp<Tz: TimeZone>(at: &DateTime<Tz>) -> String
where
    Tz::Offset: Display,
{
    at.format(TIMESTAMP_FORMAT).to_string()
}

/// Epoch milliseconds rendered in the local zone; `None` if out of range.
pub fn format_epoch_millis(millis: i64) -> Option<String> {
    Local
        .timestamp_millis_opt(millis)
        .single()
        .map(|at| format_timestamp(&at))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn sizes() {
        assert_eq!(format_size(0), "0B");
        assert_eq!(format_size(512), "512B");
        assert_eq!(format_size(1024), "1024B");
        assert_eq!(format_size(1536), "1.5KB");
        assert_eq!(format_size(10 * 1024 * 1024), "10MB");
        assert_eq!(format_size(3 * 1024 * 1024 * 1024 + 1024 * 1024 * 1024 / 4), "3.25GB");
        assert_eq!(format_size(5 * 1024u64.pow(4)), "5120GB");
    }

    #[test]
    fn timestamps() {
        let at = Utc.with_ymd_and_hms(2026, 3, 7, 9, 5, 0).unwrap();
        assert_eq!(format_timestamp(&at), "2026-03-07 09:05:00");
        assert!(format_epoch_millis(0).is_some());
        assert!(format_epoch_millis(i64::MAX).is_none());
    }
}
