//! Outbound command rate limiting
//!
//! The gateway disconnects clients that send more than 120 frames per
//! rolling 60 seconds. Every frame a shard writes, heartbeats included,
//! takes one cell from a governor token bucket sized to that window.

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::num::NonZeroU32;
use std::time::Duration;

/// Frames allowed per window by the gateway
pub const GATEWAY_COMMANDS_PER_WINDOW: u32 = 120;

/// Length of the gateway's rolling send window
pub const GATEWAY_WINDOW: Duration = Duration::from_secs(60);

/// Capacity and refill window of a send bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendQuota {
    burst: NonZeroU32,
    window: Duration,
}

impl SendQuota {
    /// `burst` frames, fully replenished over `window`.
    ///
    /// Returns None for a zero burst or a window too short to refill one cell.
    pub fn new(burst: u32, window: Duration) -> Option<Self> {
        let burst = NonZeroU32::new(burst)?;
        if (window / burst.get()).is_zero() {
            return None;
        }
        Some(Self { burst, window })
    }

    /// The gateway's published limit
    pub fn gateway() -> Self {
        Self {
            burst: NonZeroU32::MIN.saturating_add(GATEWAY_COMMANDS_PER_WINDOW - 1),
            window: GATEWAY_WINDOW,
        }
    }

    pub fn burst(&self) -> u32 {
        self.burst.get()
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    fn to_governor(self) -> Quota {
        let period = self.window / self.burst.get();
        Quota::with_period(period)
            .unwrap_or_else(|| Quota::per_second(self.burst))
            .allow_burst(self.burst)
    }
}

impl Default for SendQuota {
    fn default() -> Self {
        Self::gateway()
    }
}

/// Token bucket guarding one shard's outbound channel
pub struct SendLimiter {
    limiter: DefaultDirectRateLimiter,
    quota: SendQuota,
}

impl SendLimiter {
    pub fn new(quota: SendQuota) -> Self {
        Self {
            limiter: RateLimiter::direct(quota.to_governor()),
            quota,
        }
    }

    /// Wait until a send slot is available and take it
    pub async fn acquire(&self) {
        self.limiter.until_ready().await;
    }

    /// Take a slot if one is free right now
    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }

    pub fn quota(&self) -> SendQuota {
        self.quota
    }
}

impl std::fmt::Debug for SendLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendLimiter").field("quota", &self.quota).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn gateway_quota_matches_published_limit() {
        let quota = SendQuota::gateway();
        assert_eq!(quota.burst(), 120);
        assert_eq!(quota.window(), Duration::from_secs(60));
    }

    #[test]
    fn rejects_degenerate_quotas() {
        assert!(SendQuota::new(0, Duration::from_secs(1)).is_none());
        assert!(SendQuota::new(10, Duration::from_nanos(5)).is_none());
        assert!(SendQuota::new(2, Duration::from_millis(100)).is_some());
    }

    #[test]
    fn burst_is_exhausted_then_refused() {
        let limiter = SendLimiter::new(SendQuota::new(3, Duration::from_secs(60)).unwrap());
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[tokio::test]
    async fn sends_beyond_burst_wait_for_refill() {
        // 2 frames per 300ms: one cell comes back every 150ms
        let limiter = SendLimiter::new(SendQuota::new(2, Duration::from_millis(300)).unwrap());

        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        assert!(start.elapsed() < Duration::from_millis(100), "burst should not wait");

        limiter.acquire().await;
        assert!(
            start.elapsed() >= Duration::from_millis(120),
            "third send should wait for a refill, waited {:?}",
            start.elapsed()
        );
    }
}
