// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Monotonic uptime plus wall-clock formatting in a fixed configured zone.
//!
//! Mirrors the role of the originating system's Atlanta timezone helper: a
//! single place that knows how to stamp filenames and report "now" without
//! every caller re-deriving the offset.

use std::time::Instant;

use chrono::{DateTime, FixedOffset, Utc};

/// A named, fixed UTC offset. Real deployments pin one timezone for the
/// lifetime of the process (filenames must not shift meaning mid-run if DST
/// changes), so we resolve the configured zone name to a fixed offset once
/// at construction rather than carrying an IANA tz database dependency.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    offset: FixedOffset,
    started_at: Instant,
}

impl Clock {
    /// `zone` accepts a small set of recognized names plus raw `+HH:MM` /
    /// `-HH:MM` offsets; unrecognized names fall back to UTC with a warning
    /// left to the caller (config validation surfaces it, not this type).
    pub fn new(zone: &str) -> Self {
        Self {
            offset: resolve_offset(zone),
            started_at: Instant::now(),
        }
    }

    pub fn utc() -> Self {
        Self {
            offset: FixedOffset::east_opt(0).expect("zero offset is always valid"),
            started_at: Instant::now(),
        }
    }

    /// Current instant in the configured zone.
    pub fn now(&self) -> DateTime<FixedOffset> {
        Utc::now().with_timezone(&self.offset)
    }

    /// Seconds since this `Clock` (and, in practice, the process) started.
    pub fn uptime_seconds(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64()
    }

    /// `YYYYMMDD_HHMMSS`, safe for use in filenames.
    pub fn format_filename_timestamp(&self) -> String {
        self.now().format("%Y%m%d_%H%M%S").to_string()
    }

    /// ISO-8601 with offset, used throughout the state snapshots and index.
    pub fn format_iso(&self) -> String {
        self.now().to_rfc3339()
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }
}

fn resolve_offset(zone: &str) -> FixedOffset {
    let trimmed = zone.trim();
    match trimmed {
        "UTC" | "" => FixedOffset::east_opt(0).unwrap(),
        "America/New_York" | "America/Atlanta" | "US/Eastern" => {
            // Fixed EST offset; real DST handling would need a tz database,
            // which is deliberately out of scope for this crate's Clock.
            FixedOffset::west_opt(5 * 3600).unwrap()
        }
        "America/Chicago" | "US/Central" => FixedOffset::west_opt(6 * 3600).unwrap(),
        "America/Denver" | "US/Mountain" => FixedOffset::west_opt(7 * 3600).unwrap(),
        "America/Los_Angeles" | "US/Pacific" => FixedOffset::west_opt(8 * 3600).unwrap(),
        other => parse_numeric_offset(other).unwrap_or_else(|| FixedOffset::east_opt(0).unwrap()),
    }
}

fn parse_numeric_offset(s: &str) -> Option<FixedOffset> {
    let (sign, rest) = match s.as_bytes().first()? {
        b'+' => (1, &s[1..]),
        b'-' => (-1, &s[1..]),
        _ => return None,
    };
    let mut parts = rest.split(':');
    let hours: i32 = parts.next()?.parse().ok()?;
    let minutes: i32 = parts.next().unwrap_or("0").parse().ok()?;
    let total = sign * (hours * 3600 + minutes * 60);
    FixedOffset::east_opt(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utc_zone_has_zero_offset() {
        let clock = Clock::new("UTC");
        assert_eq!(clock.offset().local_minus_utc(), 0);
    }

    #[test]
    fn unknown_zone_falls_back_to_utc() {
        let clock = Clock::new("Mars/Olympus_Mons");
        assert_eq!(clock.offset().local_minus_utc(), 0);
    }

    #[test]
    fn numeric_offset_parses() {
        let clock = Clock::new("-05:00");
        assert_eq!(clock.offset().local_minus_utc(), -5 * 3600);
    }

    #[test]
    fn filename_timestamp_has_expected_shape() {
        let clock = Clock::new("UTC");
        let ts = clock.format_filename_timestamp();
        assert_eq!(ts.len(), "20260730_235900".len());
        assert!(ts.chars().nth(8) == Some('_'));
    }

    #[test]
    fn uptime_is_nonnegative_and_increases() {
        let clock = Clock::new("UTC");
        let first = clock.uptime_seconds();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let second = clock.uptime_seconds();
        assert!(second >= first);
    }
}
