use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Local};

pub fn utc_ns_now() -> u64 {
    let d = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    d.as_secs() * 1_000_000_000 + d.subsec_nanos() as u64
}

/// Seconds since the epoch as float, the unit used in stream message metadata.
pub fn unix_seconds_now() -> f64 {
    utc_ns_now() as f64 / 1e9
}

/// ISO-8601 timestamp stored in artifact metadata.
pub fn iso8601_now() -> String {
    Local::now().to_rfc3339()
}

/// ISO-8601 form of a file time.
pub fn iso8601_of(time: SystemTime) -> String {
    DateTime::<Local>::from(time).to_rfc3339()
}

/// Compact local timestamp used in generated filenames (`20250101_120000`).
pub fn filename_stamp() -> String {
    Local::now().format("%Y%m%d_%H%M%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iso8601_roundtrips() {
        let stamp = iso8601_now();
        assert!(chrono::DateTime::parse_from_rfc3339(&stamp).is_ok());
    }

    #[test]
    fn test_iso8601_of_epoch() {
        let stamp = iso8601_of(UNIX_EPOCH);
        let parsed = chrono::DateTime::parse_from_rfc3339(&stamp).unwrap();
        assert_eq!(parsed.timestamp(), 0);
    }

    #[test]
    fn test_filename_stamp_shape() {
        let stamp = filename_stamp();
        assert_eq!(stamp.len(), 15);
        assert_eq!(&stamp[8..9], "_");
    }
}
