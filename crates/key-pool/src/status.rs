//! Usage snapshots and their text rendering
//!
//! `KeyStatus` is rebuilt from a record on every request and never stored.
//! It serializes to JSON for the HTTP surface and renders to a multi-line
//! report for humans.

use std::fmt::Write as _;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Serialize, Serializer};

use crate::window::Window;

/// Message rendered when no key could be handed out.
pub const NO_KEY_AVAILABLE: &str = "No API key available: all keys are rate limited or expired";

/// Usage of one window at the snapshot instant.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowStatus {
    pub window: Window,
    pub limit: u64,
    pub used: u64,
    /// `None` for an unlimited window.
    pub remaining: Option<u64>,
    pub resets_at: DateTime<Utc>,
    #[serde(serialize_with = "as_secs")]
    pub resets_in: Duration,
}

/// Usage of one key at the snapshot instant.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeyStatus {
    pub id: String,
    pub expired: bool,
    pub expires_at: Option<DateTime<Utc>>,
    /// `None` when the key never expires; zero once it has.
    #[serde(serialize_with = "as_secs_opt")]
    pub expires_in: Option<Duration>,
    pub last_used: Option<DateTime<Utc>>,
    pub minute: WindowStatus,
    pub hour: WindowStatus,
    pub day: WindowStatus,
    pub month: WindowStatus,
}

impl KeyStatus {
    pub fn windows(&self) -> [&WindowStatus; 4] {
        [&self.minute, &self.hour, &self.day, &self.month]
    }
}

fn as_secs<S: Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

fn as_secs_opt<S: Serializer>(d: &Option<Duration>, s: S) -> std::result::Result<S::Ok, S::Error> {
    match d {
        Some(d) => s.serialize_some(&d.as_secs_f64()),
        None => s.serialize_none(),
    }
}

/// Render a duration in its largest whole unit, one decimal place.
///
/// Values are rounded before the unit is picked, so 59.96 seconds reads
/// "1.0 minutes" rather than "60.0 seconds".
pub fn humanize(d: Duration) -> String {
    let round = |v: f64| (v * 10.0).round() / 10.0;
    let secs = d.as_secs_f64();

    let seconds = round(secs);
    if seconds < 60.0 {
        return format!("{seconds:.1} seconds");
    }
    let minutes = round(secs / 60.0);
    if minutes < 60.0 {
        return format!("{minutes:.1} minutes");
    }
    let hours = round(secs / 3600.0);
    if hours < 24.0 {
        return format!("{hours:.1} hours");
    }
    format!("{:.1} days", round(secs / 86_400.0))
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Multi-line report for one key.
pub fn render(status: &KeyStatus) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Key: {}", status.id);

    let expiry = match (status.expired, status.expires_in) {
        (true, _) => "expired".to_string(),
        (false, Some(left)) => format!("expires in {}", humanize(left)),
        (false, None) => "never expires".to_string(),
    };
    let _ = writeln!(out, "Expiration: {expiry}");

    let last_used = status
        .last_used
        .map(timestamp)
        .unwrap_or_else(|| "never".to_string());
    let _ = writeln!(out, "Last used: {last_used}");

    for window in status.windows() {
        let capacity = match window.remaining {
            Some(remaining) => format!("{}/{} used, {remaining} remaining", window.used, window.limit),
            None => format!("{} used, unlimited", window.used),
        };
        let _ = writeln!(
            out,
            "Per {}: {capacity}, resets in {} at {}",
            window.window.label(),
            humanize(window.resets_in),
            timestamp(window.resets_at),
        );
    }
    out
}

/// Report for a key, or the fixed sentinel when none was available.
pub fn render_or_unavailable(status: Option<&KeyStatus>) -> String {
    match status {
        Some(status) => render(status),
        None => NO_KEY_AVAILABLE.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{KeyRecord, RateLimits};

    fn at(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[test]
    fn humanize_picks_largest_whole_unit() {
        assert_eq!(humanize(Duration::from_secs(0)), "0.0 seconds");
        assert_eq!(humanize(Duration::from_millis(59_940)), "59.9 seconds");
        assert_eq!(humanize(Duration::from_secs(60)), "1.0 minutes");
        assert_eq!(humanize(Duration::from_secs(90 * 60)), "1.5 hours");
        assert_eq!(humanize(Duration::from_secs(36 * 3600)), "1.5 days");
    }

    #[test]
    fn humanize_rounds_up_into_the_next_unit() {
        assert_eq!(humanize(Duration::from_millis(59_960)), "1.0 minutes");
        assert_eq!(humanize(Duration::from_millis(3_599_000)), "1.0 hours");
        assert_eq!(humanize(Duration::from_millis(86_399_000)), "1.0 days");
        assert_eq!(humanize(Duration::from_millis(3_560_000)), "59.3 minutes");
    }

    #[test]
    fn render_lists_every_window() {
        let now = at("2024-05-05T10:10:30Z");
        let limits = RateLimits {
            per_minute: 10,
            per_hour: 0,
            per_day: 1000,
            per_month: 0,
        };
        let mut record = KeyRecord::new("alpha", limits);
        record.reconcile(now);
        record.mark_used(now);

        let report = render(&record.status(now));
        assert!(report.starts_with("Key: alpha\n"), "{report}");
        assert!(report.contains("Expiration: never expires"), "{report}");
        assert!(report.contains("Last used: 2024-05-05T10:10:30Z"), "{report}");
        assert!(
            report.contains("Per minute: 1/10 used, 9 remaining, resets in 30.0 seconds at 2024-05-05T10:11:00Z"),
            "{report}"
        );
        assert!(report.contains("Per hour: 1 used, unlimited"), "{report}");
        assert!(report.contains("Per day: 1/1000 used, 999 remaining"), "{report}");
        assert!(report.contains("Per month: 1 used, unlimited"), "{report}");
    }

    #[test]
    fn render_marks_expired_keys() {
        let now = at("2024-05-05T10:10:30Z");
        let mut record =
            KeyRecord::new("old", RateLimits::unlimited()).with_expiration(at("2024-05-01T00:00:00Z"));
        let report = render(&record.status(now));
        assert!(report.contains("Expiration: expired"), "{report}");
        assert!(report.contains("Last used: never"), "{report}");
    }

    #[test]
    fn render_shows_time_to_expiration() {
        let now = at("2024-05-05T00:00:00Z");
        let mut record =
            KeyRecord::new("soon", RateLimits::unlimited()).with_expiration(at("2024-05-07T12:00:00Z"));
        let report = render(&record.status(now));
        assert!(report.contains("Expiration: expires in 2.5 days"), "{report}");
    }

    #[test]
    fn unavailable_renders_sentinel() {
        assert_eq!(render_or_unavailable(None), NO_KEY_AVAILABLE);
    }

    #[test]
    fn status_serializes_durations_as_seconds() {
        let now = at("2024-05-05T10:10:30Z");
        let mut record = KeyRecord::new("alpha", RateLimits::unlimited());
        let json = serde_json::to_value(record.status(now)).unwrap();
        assert_eq!(json["minute"]["resets_in"], 30.0);
        assert_eq!(json["minute"]["window"], "minute");
        assert_eq!(json["minute"]["remaining"], serde_json::Value::Null);
        assert_eq!(json["expires_in"], serde_json::Value::Null);
    }
}
