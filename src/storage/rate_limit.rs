//! Request throttling and retry backoff for remote stores

use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

/// Longest single backoff delay
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Widest spacing between request starts, reached at the lowest valid rate
const MAX_SPACING: Duration = Duration::from_secs(1000);

/// Limits concurrent requests and spaces request starts
pub struct RateLimiter {
    semaphore: Arc<Semaphore>,
    /// Minimum spacing between request starts (zero = unlimited)
    interval: Duration,
    next_slot: Mutex<Instant>,
}

/// Held while a request is in flight
pub struct RateLimitPermit {
    _permit: OwnedSemaphorePermit,
}

impl RateLimiter {
    /// Create a limiter allowing `max_concurrent` requests in flight and at
    /// most `per_second` starts per second (`0.0` disables spacing)
    pub fn new(max_concurrent: usize, per_second: f64) -> Self {
        let interval = if per_second > 0.0 {
            Duration::try_from_secs_f64(1.0 / per_second)
                .map_or(MAX_SPACING, |interval| interval.min(MAX_SPACING))
        } else {
            Duration::ZERO
        };

        RateLimiter {
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
            interval,
            next_slot: Mutex::new(Instant::now()),
        }
    }

    /// Wait for a free slot
    pub async fn acquire(&self) -> Result<RateLimitPermit> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| Error::Internal("Rate limiter closed".to_string()))?;

        if !self.interval.is_zero() {
            let start = {
                let mut next = self.next_slot.lock();
                let now = Instant::now();
                let start = if *next > now { *next } else { now };
                *next = start + self.interval;
                start
            };
            tokio::time::sleep_until(start).await;
        }

        Ok(RateLimitPermit { _permit: permit })
    }

    /// Number of requests that could start right now
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

/// Exponential backoff schedule
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base_delay: Duration,
    max_retries: u32,
    attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(base_delay_ms: u64, max_retries: u32) -> Self {
        ExponentialBackoff {
            base_delay: Duration::from_millis(base_delay_ms),
            max_retries,
            attempt: 0,
        }
    }

    /// Delay before the next retry, or `None` once retries are exhausted
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_retries {
            return None;
        }
        let factor = 1u32 << self.attempt.min(16);
        self.attempt += 1;
        Some(self.base_delay.saturating_mul(factor).min(MAX_BACKOFF))
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_then_stops() {
        let mut backoff = ExponentialBackoff::new(100, 3);
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(100)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(200)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(400)));
        assert_eq!(backoff.next_delay(), None);
        assert_eq!(backoff.attempts(), 3);
    }

    #[test]
    fn test_backoff_is_capped() {
        let mut backoff = ExponentialBackoff::new(20_000, 5);
        backoff.next_delay();
        assert_eq!(backoff.next_delay(), Some(MAX_BACKOFF));
    }

    #[tokio::test]
    async fn test_limiter_bounds_concurrency() {
        let limiter = RateLimiter::new(2, 0.0);
        let a = limiter.acquire().await.unwrap();
        let _b = limiter.acquire().await.unwrap();
        assert_eq!(limiter.available(), 0);
        drop(a);
        assert_eq!(limiter.available(), 1);
    }

    #[tokio::test]
    async fn test_tiny_rate_is_clamped() {
        assert_eq!(RateLimiter::new(1, 1e-20).interval, MAX_SPACING);
        assert_eq!(RateLimiter::new(1, f64::MIN_POSITIVE).interval, MAX_SPACING);
        assert_eq!(RateLimiter::new(1, f64::NAN).interval, Duration::ZERO);
        assert_eq!(RateLimiter::new(1, 4.0).interval, Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn test_limiter_spaces_requests() {
        let limiter = RateLimiter::new(4, 10.0);
        let start = Instant::now();
        for _ in 0..3 {
            let _permit = limiter.acquire().await.unwrap();
        }
        assert!(start.elapsed() >= Duration::from_millis(200));
    }
}
