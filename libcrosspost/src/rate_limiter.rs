//! Rate limiting for destinations
//!
//! Two mechanisms keep the orchestrator from over-posting to a site:
//! an hourly post budget per destination, and a serialization lane that lets
//! only one submission at a time post to a given destination.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;

/// Hourly post budget per destination
pub struct RateLimiter {
    /// Destination-specific limits (posts per hour)
    limits: HashMap<String, u32>,
    /// (window start, posts recorded in that window) per destination
    windows: Mutex<HashMap<String, (i64, u32)>>,
}

impl RateLimiter {
    /// Create a new rate limiter with the given limits
    pub fn new(limits: HashMap<String, u32>) -> Self {
        Self {
            limits,
            windows: Mutex::new(HashMap::new()),
        }
    }

    fn windows(&self) -> std::sync::MutexGuard<'_, HashMap<String, (i64, u32)>> {
        self.windows.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Check if posting is allowed and record the post under one lock
    ///
    /// Returns true if posting is allowed, false if rate limited
    pub fn check_and_record(&self, destination: &str, now: i64) -> bool {
        let Some(&limit) = self.limits.get(destination) else {
            return true;
        };
        let window_start = get_window_start(now);
        let mut windows = self.windows();
        let entry = windows
            .entry(destination.to_string())
            .or_insert((window_start, 0));
        if entry.0 != window_start {
            *entry = (window_start, 0);
        }
        if entry.1 >= limit {
            return false;
        }
        entry.1 += 1;
        true
    }

    /// Check if posting is allowed (without recording)
    pub fn check(&self, destination: &str, now: i64) -> bool {
        let limit = match self.limits.get(destination) {
            Some(l) => *l,
            None => return true, // No limit configured, allow
        };
        self.window_count(destination, now) < limit
    }

    /// Seconds until the current hourly window ends
    pub fn retry_after(&self, now: i64) -> i64 {
        get_window_start(now) + 3600 - now
    }

    /// Drop windows that ended before `cutoff`
    pub fn cleanup_old_windows(&self, cutoff: i64) {
        let cutoff_window = get_window_start(cutoff);
        self.windows()
            .retain(|_, (window_start, _)| *window_start >= cutoff_window);
    }

    fn window_count(&self, destination: &str, now: i64) -> u32 {
        let window_start = get_window_start(now);
        match self.windows().get(destination) {
            Some((start, count)) if *start == window_start => *count,
            _ => 0,
        }
    }
}

/// Get the window start timestamp (floor to hour)
fn get_window_start(timestamp: i64) -> i64 {
    (timestamp / 3600) * 3600
}

/// Per-destination serialization across submissions
#[derive(Default)]
pub struct DestinationLanes {
    lanes: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl DestinationLanes {
    pub fn new() -> Self {
        Self::default()
    }

    fn lane(&self, destination: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut lanes = self.lanes.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(lanes.entry(destination.to_string()).or_default())
    }

    /// Take the lane for `destination` if nobody holds it.
    ///
    /// The lane is released when the returned guard is dropped.
    pub fn try_acquire(&self, destination: &str) -> Option<OwnedMutexGuard<()>> {
        self.lane(destination).try_lock_owned().ok()
    }
}
