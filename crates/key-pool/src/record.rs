//! Per-key rate-limit state machine
//!
//! A `KeyRecord` carries one credential's expiration, last-use stamp and the
//! four window counters. All mutation goes through `reconcile` first, so a
//! counter is never compared against its limit while stale.
//!
//! `KeyHandle` is what the queues pass around: a shared, lockable record.
//! Compound read-modify-write sequences hold the handle's lock for their
//! whole duration; the guard releases it on every exit path.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard};

use crate::status::{KeyStatus, WindowStatus};
use crate::window::{Window, WindowState};

/// Per-window limits applied to every key in a pool. Zero means unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimits {
    pub per_minute: u64,
    pub per_hour: u64,
    pub per_day: u64,
    pub per_month: u64,
}

impl RateLimits {
    pub fn unlimited() -> Self {
        Self::default()
    }
}

/// One credential plus its rate-limit and expiration state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRecord {
    pub id: String,
    /// `None` means the key never expires.
    pub expires_at: Option<DateTime<Utc>>,
    pub last_used: Option<DateTime<Utc>>,
    pub minute: WindowState,
    pub hour: WindowState,
    pub day: WindowState,
    pub month: WindowState,
}

impl KeyRecord {
    /// Fresh record: zero counters, window starts and last-use at "never".
    pub fn new(id: impl Into<String>, limits: RateLimits) -> Self {
        Self {
            id: id.into(),
            expires_at: None,
            last_used: None,
            minute: WindowState::new(limits.per_minute),
            hour: WindowState::new(limits.per_hour),
            day: WindowState::new(limits.per_day),
            month: WindowState::new(limits.per_month),
        }
    }

    pub fn with_expiration(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn window(&self, window: Window) -> &WindowState {
        match window {
            Window::Minute => &self.minute,
            Window::Hour => &self.hour,
            Window::Day => &self.day,
            Window::Month => &self.month,
        }
    }

    fn window_mut(&mut self, window: Window) -> &mut WindowState {
        match window {
            Window::Minute => &mut self.minute,
            Window::Hour => &mut self.hour,
            Window::Day => &mut self.day,
            Window::Month => &mut self.month,
        }
    }

    /// Bring every window up to date with `now`.
    pub fn reconcile(&mut self, now: DateTime<Utc>) {
        for window in Window::ALL {
            self.window_mut(window).reconcile(window, now);
        }
    }

    /// Debit one unit from every window. Callers reconcile first.
    pub fn record_usage(&mut self) {
        for window in Window::ALL {
            let state = self.window_mut(window);
            state.count = state.count.saturating_add(1);
        }
    }

    /// Stamp `now` as the last use and debit one unit.
    pub fn mark_used(&mut self, now: DateTime<Utc>) {
        self.last_used = Some(now);
        self.record_usage();
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now > at)
    }

    /// Reconcile, then check expiry and every limited window.
    pub fn is_rate_limited(&mut self, now: DateTime<Utc>) -> bool {
        self.reconcile(now);
        self.is_expired(now) || Window::ALL.iter().any(|w| self.window(*w).is_exhausted())
    }

    /// Reconcile, then snapshot usage as of `now`.
    pub fn status(&mut self, now: DateTime<Utc>) -> KeyStatus {
        self.reconcile(now);
        let window_status = |window: Window| {
            let state = self.window(window);
            // reconcile above guarantees a start
            let start = state.started_at.unwrap_or_else(|| window.floor(now));
            let resets_at = window.next_start(start);
            WindowStatus {
                window,
                limit: state.limit,
                used: state.count,
                remaining: state.remaining(),
                resets_at,
                resets_in: non_negative(resets_at - now),
            }
        };

        KeyStatus {
            id: self.id.clone(),
            expired: self.is_expired(now),
            expires_at: self.expires_at,
            expires_in: self.expires_at.map(|at| non_negative(at - now)),
            last_used: self.last_used,
            minute: window_status(Window::Minute),
            hour: window_status(Window::Hour),
            day: window_status(Window::Day),
            month: window_status(Window::Month),
        }
    }
}

fn non_negative(delta: chrono::TimeDelta) -> Duration {
    delta.to_std().unwrap_or_default()
}

/// Shared handle to a record.
///
/// Clones share the same record, so a key re-enqueued by one caller and
/// dequeued by another is observed consistently inside one process.
#[derive(Debug, Clone)]
pub struct KeyHandle {
    id: Arc<str>,
    record: Arc<Mutex<KeyRecord>>,
}

impl KeyHandle {
    pub fn new(record: KeyRecord) -> Self {
        Self {
            id: Arc::from(record.id.as_str()),
            record: Arc::new(Mutex::new(record)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Exclusive access for a compound read-modify-write.
    pub async fn lock(&self) -> MutexGuard<'_, KeyRecord> {
        self.record.lock().await
    }

    /// Copy of the current state.
    pub async fn snapshot(&self) -> KeyRecord {
        self.record.lock().await.clone()
    }

    /// Whether both handles point at the same record instance.
    pub fn same_record(&self, other: &KeyHandle) -> bool {
        Arc::ptr_eq(&self.record, &other.record)
    }
}
