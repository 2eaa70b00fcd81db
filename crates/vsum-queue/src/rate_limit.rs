//! Per-user sliding-window rate limiter.
//!
//! Each user has a window of admission timestamps. A request is admitted
//! when fewer than `limit` timestamps fall inside the trailing window; an
//! admitted request appends its own timestamp. Timestamps at or before
//! `now - window` are evicted on every check.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use tracing::debug;

/// Sliding-window limiter keyed by user ID.
#[derive(Debug)]
pub struct RateLimiter {
    limit: usize,
    window: Duration,
    windows: Mutex<HashMap<String, VecDeque<DateTime<Utc>>>>,
}

impl RateLimiter {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    fn window_delta(&self) -> TimeDelta {
        TimeDelta::from_std(self.window).unwrap_or(TimeDelta::MAX)
    }

    /// Check and record one request.
    ///
    /// Returns `false` for an empty user ID or when the window is full. A
    /// rejected request leaves the window untouched.
    pub fn admit(&self, user_id: &str, now: DateTime<Utc>) -> bool {
        if user_id.is_empty() {
            return false;
        }

        let cutoff = now.checked_sub_signed(self.window_delta()).unwrap_or(DateTime::<Utc>::MIN_UTC);
        let mut windows = self.windows.lock();
        let window = windows.entry(user_id.to_string()).or_default();
        evict(window, cutoff);

        if window.len() >= self.limit {
            debug!(user_id = %user_id, in_window = window.len(), "Rate limit reached");
            return false;
        }

        window.push_back(now);
        true
    }

    /// Timestamps currently in the user's window, oldest first.
    pub fn snapshot(&self, user_id: &str) -> Vec<DateTime<Utc>> {
        self.windows
            .lock()
            .get(user_id)
            .map(|window| window.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Remaining admissions for the user at `now`.
    pub fn remaining(&self, user_id: &str, now: DateTime<Utc>) -> usize {
        let cutoff = now.checked_sub_signed(self.window_delta()).unwrap_or(DateTime::<Utc>::MIN_UTC);
        let used = self
            .windows
            .lock()
            .get(user_id)
            .map(|window| window.iter().filter(|ts| **ts > cutoff).count())
            .unwrap_or(0);
        self.limit.saturating_sub(used)
    }

    /// Seed a user's window from persisted timestamps.
    ///
    /// Expired entries are dropped and at most `limit` of the newest are kept.
    pub fn restore(&self, user_id: &str, mut timestamps: Vec<DateTime<Utc>>, now: DateTime<Utc>) {
        if user_id.is_empty() {
            return;
        }
        let cutoff = now.checked_sub_signed(self.window_delta()).unwrap_or(DateTime::<Utc>::MIN_UTC);
        timestamps.retain(|ts| *ts > cutoff);
        timestamps.sort();
        let skip = timestamps.len().saturating_sub(self.limit);

        let mut windows = self.windows.lock();
        let window = windows.entry(user_id.to_string()).or_default();
        window.extend(timestamps.into_iter().skip(skip));
        window.make_contiguous().sort();
        while window.len() > self.limit {
            window.pop_front();
        }
    }

    /// Drop users whose windows are empty at `now`. Returns how many were dropped.
    pub fn purge_idle(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now.checked_sub_signed(self.window_delta()).unwrap_or(DateTime::<Utc>::MIN_UTC);
        let mut windows = self.windows.lock();
        let before = windows.len();
        windows.retain(|_, window| {
            evict(window, cutoff);
            !window.is_empty()
        });
        before - windows.len()
    }

    /// Number of users with a tracked window.
    pub fn tracked_users(&self) -> usize {
        self.windows.lock().len()
    }
}

fn evict(window: &mut VecDeque<DateTime<Utc>>, cutoff: DateTime<Utc>) {
    while window.front().is_some_and(|ts| *ts <= cutoff) {
        window.pop_front();
    }
}
