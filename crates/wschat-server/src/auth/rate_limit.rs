//! Sliding-window limiter for `auth` envelopes.
//!
//! Keyed by peer IP so a client cannot dodge the limit by reconnecting.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// Window over which attempts are counted.
const WINDOW: Duration = Duration::from_secs(60);

/// Per-IP attempt counter over a rolling window.
#[derive(Debug)]
pub struct AuthRateLimiter {
    /// Attempts allowed per window; 0 disables limiting.
    max_attempts: u32,
    window: Duration,
    attempts: HashMap<IpAddr, VecDeque<Instant>>,
}

impl AuthRateLimiter {
    /// `max_attempts` per minute per IP. Zero means unlimited.
    pub fn per_minute(max_attempts: u32) -> Self {
        Self::with_window(max_attempts, WINDOW)
    }

    pub fn with_window(max_attempts: u32, window: Duration) -> Self {
        Self {
            max_attempts,
            window,
            attempts: HashMap::new(),
        }
    }

    /// Record an attempt from `ip` if it is within the limit.
    ///
    /// Returns `false` (and records nothing) when `ip` is over the limit.
    pub fn check_and_record(&mut self, ip: IpAddr) -> bool {
        if self.max_attempts == 0 {
            return true;
        }

        let now = Instant::now();
        let window = self.window;
        let attempts = self.attempts.entry(ip).or_default();
        while attempts
            .front()
            .is_some_and(|t| now.duration_since(*t) >= window)
        {
            attempts.pop_front();
        }

        if attempts.len() as u32 >= self.max_attempts {
            return false;
        }
        attempts.push_back(now);
        true
    }

    /// Drop IPs with no attempts inside the window.
    pub fn gc(&mut self) {
        let now = Instant::now();
        let window = self.window;
        self.attempts.retain(|_, attempts| {
            attempts.retain(|t| now.duration_since(*t) < window);
            !attempts.is_empty()
        });
    }

    /// Number of IPs currently tracked.
    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.attempts.len()
    }
}
