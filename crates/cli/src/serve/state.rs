//! Application state and rate limiting.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Instant;

use jitgate_engine::Gate;
use jitgate_storage::SqliteStorage;
use tokio::sync::Mutex;

use super::RATE_LIMIT_WINDOW_SECS;

/// Per-IP request tracker: (request count, window start time).
type IpTracker = HashMap<IpAddr, (u64, Instant)>;

/// In-memory per-IP rate limiter.
pub(crate) struct RateLimiter {
    tracker: Mutex<IpTracker>,
    /// Maximum requests per window.
    max_requests: u64,
}

impl RateLimiter {
    pub(crate) fn new(max_requests: u64) -> Self {
        Self {
            tracker: Mutex::new(HashMap::new()),
            max_requests,
        }
    }

    /// Returns Ok(()) if allowed, Err(retry_after_secs) if rate limited.
    pub(crate) async fn check(&self, ip: IpAddr) -> Result<(), u64> {
        self.check_at(ip, Instant::now()).await
    }

    async fn check_at(&self, ip: IpAddr, now: Instant) -> Result<(), u64> {
        let mut tracker = self.tracker.lock().await;
        tracker.retain(|addr, (_, start)| {
            *addr == ip || now.duration_since(*start).as_secs() < RATE_LIMIT_WINDOW_SECS
        });
        let entry = tracker.entry(ip).or_insert((0, now));

        let elapsed = now.duration_since(entry.1).as_secs();
        if elapsed >= RATE_LIMIT_WINDOW_SECS {
            entry.0 = 0;
            entry.1 = now;
        }

        entry.0 += 1;
        if entry.0 > self.max_requests {
            Err(RATE_LIMIT_WINDOW_SECS.saturating_sub(elapsed))
        } else {
            Ok(())
        }
    }

    #[cfg(test)]
    async fn tracked(&self) -> usize {
        self.tracker.lock().await.len()
    }
}

/// Application state shared across request handlers.
pub(crate) struct AppState {
    pub(crate) gate: Gate<SqliteStorage>,
    pub(crate) rate_limiter: RateLimiter,
    /// Optional gateway key. None = no key required.
    pub(crate) api_key: Option<String>,
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn limiter_refuses_past_the_budget_and_resets_per_window() {
        let limiter = RateLimiter::new(2);
        let ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let start = Instant::now();

        assert!(limiter.check_at(ip, start).await.is_ok());
        assert!(limiter.check_at(ip, start).await.is_ok());
        assert!(limiter.check_at(ip, start).await.is_err());

        let other = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        assert!(limiter.check_at(other, start).await.is_ok());

        let later = start + Duration::from_secs(RATE_LIMIT_WINDOW_SECS);
        assert!(limiter.check_at(ip, later).await.is_ok());
    }

    #[tokio::test]
    async fn expired_windows_are_dropped() {
        let limiter = RateLimiter::new(5);
        let start = Instant::now();
        for last in 1..=3u8 {
            let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, last));
            assert!(limiter.check_at(ip, start).await.is_ok());
        }
        assert_eq!(limiter.tracked().await, 3);

        let later = start + Duration::from_secs(RATE_LIMIT_WINDOW_SECS);
        let fresh = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9));
        assert!(limiter.check_at(fresh, later).await.is_ok());
        assert_eq!(limiter.tracked().await, 1);
    }
}
