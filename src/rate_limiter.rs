//! Per-connection inbound rate limiting.
//!
//! Each session owns one token bucket built from the configured
//! [`Quota`]. Buckets are never shared, so one chatty client cannot
//! consume another client's allowance.

use std::num::NonZeroU32;
use std::time::Duration;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter as GovRateLimiter};
use thiserror::Error;
use tokio::time::{Instant, timeout_at};

#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("deadline exceeded while waiting for a rate limit token")]
    DeadlineExceeded,
}

/// Build a quota of one token per `interval` with room for `burst` tokens.
///
/// Returns `None` for a zero interval or zero burst.
pub fn quota(interval: Duration, burst: u32) -> Option<Quota> {
    let burst = NonZeroU32::new(burst)?;
    Quota::with_period(interval).map(|q| q.allow_burst(burst))
}

pub struct RateLimiter {
    bucket: DefaultDirectRateLimiter,
}

impl RateLimiter {
    pub fn new(quota: Quota) -> Self {
        Self {
            bucket: GovRateLimiter::direct(quota),
        }
    }

    /// Wait for a token and consume it, giving up at `deadline`.
    pub async fn acquire(&self, deadline: Instant) -> Result<(), RateLimitError> {
        timeout_at(deadline, self.bucket.until_ready())
            .await
            .map_err(|_| RateLimitError::DeadlineExceeded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat_quota() -> Quota {
        quota(Duration::from_millis(100), 10).unwrap()
    }

    #[test]
    fn zero_parameters_are_rejected() {
        assert!(quota(Duration::ZERO, 10).is_none());
        assert!(quota(Duration::from_millis(100), 0).is_none());
    }

    #[tokio::test]
    async fn burst_is_available_immediately() {
        let limiter = RateLimiter::new(chat_quota());
        let deadline = Instant::now() + Duration::from_secs(5);

        let start = std::time::Instant::now();
        for _ in 0..10 {
            limiter.acquire(deadline).await.unwrap();
        }
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn eleventh_token_waits_for_refill() {
        let limiter = RateLimiter::new(chat_quota());
        let deadline = Instant::now() + Duration::from_secs(5);

        for _ in 0..10 {
            limiter.acquire(deadline).await.unwrap();
        }
        let start = std::time::Instant::now();
        limiter.acquire(deadline).await.unwrap();
        let waited = start.elapsed();

        assert!(waited >= Duration::from_millis(70), "waited {:?}", waited);
        assert!(waited < Duration::from_millis(500), "waited {:?}", waited);
    }

    #[tokio::test]
    async fn slow_senders_are_never_delayed() {
        let limiter = RateLimiter::new(chat_quota());
        let deadline = Instant::now() + Duration::from_secs(5);

        for _ in 0..3 {
            let start = std::time::Instant::now();
            limiter.acquire(deadline).await.unwrap();
            assert!(start.elapsed() < Duration::from_millis(50));
            tokio::time::sleep(Duration::from_millis(120)).await;
        }
    }

    #[tokio::test]
    async fn expired_deadline_cancels_the_wait() {
        let limiter = RateLimiter::new(chat_quota());
        let deadline = Instant::now() + Duration::from_secs(5);
        for _ in 0..10 {
            limiter.acquire(deadline).await.unwrap();
        }

        let err = limiter
            .acquire(Instant::now() + Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, RateLimitError::DeadlineExceeded));
    }

    #[tokio::test]
    async fn buckets_are_independent() {
        let first = RateLimiter::new(chat_quota());
        let second = RateLimiter::new(chat_quota());
        let deadline = Instant::now() + Duration::from_secs(5);
        for _ in 0..10 {
            first.acquire(deadline).await.unwrap();
        }

        let start = std::time::Instant::now();
        second.acquire(deadline).await.unwrap();
        assert!(start.elapsed() < Duration::from_millis(50));
    }
}
