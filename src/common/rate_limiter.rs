//! Blocking rate limiter
//!
//! Spaces consecutive requests at least `min_interval` apart by sleeping the
//! calling thread.

use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

/// Configuration for the rate limiter
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Minimum time between two requests
    pub min_interval: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(100),
        }
    }
}

impl RateLimiterConfig {
    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    /// Interval for a requests-per-second budget
    pub fn with_rate(self, requests_per_second: u32) -> Self {
        let rps = requests_per_second.max(1);
        self.with_min_interval(Duration::from_secs(1) / rps)
    }
}

#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            min_interval: config.min_interval,
            last_request: Mutex::new(None),
        }
    }

    /// Block until the next request is allowed, then claim the slot
    pub fn acquire(&self) {
        let mut last = self.last_request.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.min_interval {
                thread::sleep(self.min_interval - elapsed);
            }
        }
        *last = Some(Instant::now());
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }
}
