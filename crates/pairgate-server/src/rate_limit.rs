//! Sliding-window limiter for session creation

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Per-client limiter: at most `max_requests` within any `window`
#[derive(Debug)]
pub struct RateLimiter {
    max_requests: u32,
    window: Duration,
    /// client key -> timestamps of accepted requests
    entries: Mutex<HashMap<String, Vec<Instant>>>,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    fn cutoff(&self, now: Instant) -> Option<Instant> {
        now.checked_sub(self.window)
    }

    /// Record a request from `key` if it is still within its budget
    ///
    /// Returns `false` when the request must be rejected.
    pub fn check_and_record(&self, key: &str) -> bool {
        let now = Instant::now();
        let cutoff = self.cutoff(now);
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);

        let attempts = entries.entry(key.to_string()).or_default();
        if let Some(cutoff) = cutoff {
            attempts.retain(|t| *t > cutoff);
        }

        if attempts.len() as u32 >= self.max_requests {
            return false;
        }
        attempts.push(now);
        true
    }

    /// Drop clients with no request inside the window
    pub fn gc(&self) {
        let Some(cutoff) = self.cutoff(Instant::now()) else {
            return;
        };
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.retain(|_, attempts| {
            attempts.retain(|t| *t > cutoff);
            !attempts.is_empty()
        });
    }

    /// Number of clients currently tracked
    pub fn tracked_clients(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limits_per_key() {
        let limiter = RateLimiter::new(2, Duration::from_secs(60));

        assert!(limiter.check_and_record("10.0.0.1"));
        assert!(limiter.check_and_record("10.0.0.1"));
        assert!(!limiter.check_and_record("10.0.0.1"));

        // Other clients have their own budget
        assert!(limiter.check_and_record("10.0.0.2"));
    }

    #[test]
    fn test_window_expiry() {
        let limiter = RateLimiter::new(1, Duration::from_millis(20));

        assert!(limiter.check_and_record("a"));
        assert!(!limiter.check_and_record("a"));
        std::thread::sleep(Duration::from_millis(40));
        assert!(limiter.check_and_record("a"));
    }

    #[test]
    fn test_gc_drops_idle_clients() {
        let limiter = RateLimiter::new(3, Duration::from_millis(20));
        limiter.check_and_record("a");
        limiter.check_and_record("b");
        assert_eq!(limiter.tracked_clients(), 2);

        std::thread::sleep(Duration::from_millis(40));
        limiter.gc();
        assert_eq!(limiter.tracked_clients(), 0);
    }
}
