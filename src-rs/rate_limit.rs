use crate::clock::Clock;
use crate::config::RateLimits;
use crate::error::{BridgeError, BridgeResult};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Sliding-window request counter keyed by operation name. In-memory only.
pub struct RateLimiter {
    limits: RateLimits,
    clock: Arc<dyn Clock>,
    hits: Mutex<HashMap<String, VecDeque<DateTime<Utc>>>>,
}

impl RateLimiter {
    pub fn new(limits: RateLimits, clock: Arc<dyn Clock>) -> Self {
        Self {
            limits,
            clock,
            hits: Mutex::new(HashMap::new()),
        }
    }

    fn max_for(&self, key: &str) -> usize {
        self.limits
            .per_key
            .get(key)
            .copied()
            .unwrap_or(self.limits.default_max)
    }

    /// Records a request for `key` and returns true when it fits in the window.
    /// Rejected requests are not recorded.
    pub fn is_allowed(&self, key: &str) -> bool {
        let now = self.clock.now();
        let max = self.max_for(key);
        let mut hits = self.hits.lock().unwrap_or_else(|e| e.into_inner());
        let window = hits.entry(key.to_string()).or_default();
        prune(window, now - self.limits.window);
        if window.len() >= max {
            return false;
        }
        window.push_back(now);
        true
    }

    pub fn remaining(&self, key: &str) -> usize {
        let now = self.clock.now();
        let max = self.max_for(key);
        let mut hits = self.hits.lock().unwrap_or_else(|e| e.into_inner());
        match hits.get_mut(key) {
            Some(window) => {
                prune(window, now - self.limits.window);
                max.saturating_sub(window.len())
            }
            None => max,
        }
    }

    /// Seconds until the oldest recorded request for `key` leaves the window.
    pub fn retry_after_secs(&self, key: &str) -> u64 {
        let now = self.clock.now();
        let hits = self.hits.lock().unwrap_or_else(|e| e.into_inner());
        hits.get(key)
            .and_then(|window| window.front().copied())
            .map(|oldest| (oldest + self.limits.window - now).num_seconds().max(1) as u64)
            .unwrap_or(1)
    }

    /// `is_allowed` as a `Result`, for call sites that propagate with `?`.
    pub fn check(&self, key: &str) -> BridgeResult<()> {
        if self.is_allowed(key) {
            debug!(key, remaining = self.remaining(key), "rate limit check passed");
            return Ok(());
        }
        let retry_after_secs = self.retry_after_secs(key);
        warn!(key, retry_after_secs, "rate limit exceeded");
        Err(BridgeError::RateLimited {
            key: key.to_string(),
            retry_after_secs,
        })
    }
}

fn prune(window: &mut VecDeque<DateTime<Utc>>, cutoff: DateTime<Utc>) {
    while window.front().is_some_and(|t| *t <= cutoff) {
        window.pop_front();
    }
}
