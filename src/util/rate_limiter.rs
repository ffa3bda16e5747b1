//! Token-bucket style rate limiting for merge writes.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Pauses below this length are accumulated instead of slept.
const MIN_PAUSE: Duration = Duration::from_millis(2);

/// Limits the throughput of writers sharing it to a configured bytes/sec.
#[derive(Debug)]
pub struct RateLimiter {
    bytes_per_sec: Mutex<f64>,
    next_free: Mutex<Instant>,
}

impl RateLimiter {
    /// Create a limiter allowing `bytes_per_sec` bytes per second.
    pub fn new(bytes_per_sec: f64) -> Self {
        RateLimiter {
            bytes_per_sec: Mutex::new(bytes_per_sec.max(1.0)),
            next_free: Mutex::new(Instant::now()),
        }
    }

    /// Current limit in bytes per second.
    pub fn bytes_per_sec(&self) -> f64 {
        *self.bytes_per_sec.lock()
    }

    /// Change the limit.
    pub fn set_bytes_per_sec(&self, bytes_per_sec: f64) {
        *self.bytes_per_sec.lock() = bytes_per_sec.max(1.0);
    }

    /// Reserve `bytes` and return how long the caller must wait.
    pub fn reserve(&self, bytes: usize) -> Duration {
        let rate = self.bytes_per_sec();
        let cost = Duration::from_secs_f64(bytes as f64 / rate);
        let now = Instant::now();
        let mut next_free = self.next_free.lock();
        if *next_free < now {
            *next_free = now;
        }
        *next_free += cost;
        next_free.saturating_duration_since(now)
    }

    /// Account for `bytes` written, sleeping when ahead of the budget.
    ///
    /// Returns the time spent paused.
    pub fn pause(&self, bytes: usize) -> Duration {
        let wait = self.reserve(bytes);
        if wait >= MIN_PAUSE {
            std::thread::sleep(wait);
            wait
        } else {
            Duration::ZERO
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_accumulates() {
        let limiter = RateLimiter::new(1000.0);
        let first = limiter.reserve(500);
        let second = limiter.reserve(500);
        assert!(second > first);
        assert!(second >= Duration::from_millis(900));
    }

    #[test]
    fn test_pause_sleeps_when_over_budget() {
        let limiter = RateLimiter::new(10_000.0);
        let start = Instant::now();
        limiter.pause(100);
        limiter.pause(200);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }
}
