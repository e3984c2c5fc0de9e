//! Calendar-aligned accounting windows
//!
//! Windows are fixed, not sliding: a minute window starts at :00 seconds,
//! an hour window at :00 minutes, a day window at midnight UTC and a month
//! window at midnight UTC on the 1st. A counter is only meaningful relative
//! to the window start it was recorded against, so every read or write goes
//! through `WindowState::reconcile` first.

use chrono::{DateTime, Datelike, TimeDelta, Timelike, Utc};
use serde::{Deserialize, Serialize};

/// One of the four nested accounting periods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Window {
    Minute,
    Hour,
    Day,
    Month,
}

impl Window {
    pub const ALL: [Window; 4] = [Window::Minute, Window::Hour, Window::Day, Window::Month];

    /// Label for logs and reports.
    pub fn label(self) -> &'static str {
        match self {
            Window::Minute => "minute",
            Window::Hour => "hour",
            Window::Day => "day",
            Window::Month => "month",
        }
    }

    /// Start of the window containing `now`.
    pub fn floor(self, now: DateTime<Utc>) -> DateTime<Utc> {
        let minute = now
            - TimeDelta::seconds(i64::from(now.second()))
            - TimeDelta::nanoseconds(i64::from(now.nanosecond()));
        let hour = minute - TimeDelta::minutes(i64::from(now.minute()));
        let day = hour - TimeDelta::hours(i64::from(now.hour()));
        match self {
            Window::Minute => minute,
            Window::Hour => hour,
            Window::Day => day,
            Window::Month => day - TimeDelta::days(i64::from(now.day0())),
        }
    }

    /// Start of the window following the one that begins at `start`.
    ///
    /// Months use calendar arithmetic: the 1st plus 32 days always lands in
    /// the following month, which is then floored back to its 1st. This
    /// carries December into January of the next year.
    pub fn next_start(self, start: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Window::Minute => start + TimeDelta::minutes(1),
            Window::Hour => start + TimeDelta::hours(1),
            Window::Day => start + TimeDelta::days(1),
            Window::Month => Window::Month.floor(Window::Month.floor(start) + TimeDelta::days(32)),
        }
    }
}

/// Counter, limit and window start for a single window.
///
/// `started_at` is `None` until the first reconcile ("never").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowState {
    pub count: u64,
    /// Zero means unlimited.
    pub limit: u64,
    pub started_at: Option<DateTime<Utc>>,
}

impl WindowState {
    pub fn new(limit: u64) -> Self {
        Self {
            count: 0,
            limit,
            started_at: None,
        }
    }

    /// Reset the counter if `now` lies in a later window than `started_at`.
    ///
    /// Returns true when a reset happened. Idempotent for a fixed `now`, and
    /// a clock that moves backwards leaves the state untouched.
    pub fn reconcile(&mut self, window: Window, now: DateTime<Utc>) -> bool {
        let current = window.floor(now);
        match self.started_at {
            Some(start) if start >= current => false,
            _ => {
                self.count = 0;
                self.started_at = Some(current);
                true
            }
        }
    }

    /// True when a nonzero limit has been reached.
    pub fn is_exhausted(&self) -> bool {
        self.limit != 0 && self.count >= self.limit
    }

    /// Remaining capacity, or `None` when the window is unlimited.
    pub fn remaining(&self) -> Option<u64> {
        if self.limit == 0 {
            None
        } else {
            Some(self.limit.saturating_sub(self.count))
        }
    }
}
