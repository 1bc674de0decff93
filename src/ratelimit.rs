//! Demo broker - Rate-limit helpers (spec §4.5)
//!
//! Three independent sliding-window counters keyed by remote address:
//! connection opens, invite validation failures, and cookie-issuance
//! requests. Each stores the timestamps of recent events and evicts
//! anything older than the configured window on every check.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, PartialEq)]
pub enum LimitOutcome {
    Allowed,
    /// Retry after this many milliseconds.
    Limited { retry_after: Duration },
}

struct Window {
    events: Vec<Instant>,
}

impl Window {
    fn new() -> Self {
        Self { events: Vec::new() }
    }
}

/// A single sliding-window counter keyed by remote address.
pub struct SlidingWindowLimiter {
    threshold: u32,
    window: Duration,
    counters: Mutex<HashMap<IpAddr, Window>>,
}

impl SlidingWindowLimiter {
    pub fn new(threshold: u32, window: Duration) -> Self {
        Self { threshold, window, counters: Mutex::new(HashMap::new()) }
    }

    /// Record an event for `addr` and report whether the caller is now over
    /// threshold. Matches the spec's "record first, then decide" framing:
    /// the event being checked is itself counted against the window.
    pub async fn check_and_record(&self, addr: IpAddr) -> LimitOutcome {
        let now = Instant::now();
        let mut counters = self.counters.lock().await;
        let entry = counters.entry(addr).or_insert_with(Window::new);
        entry.events.retain(|t| now.duration_since(*t) < self.window);
        entry.events.push(now);

        if entry.events.len() as u32 > self.threshold {
            let oldest = entry.events[0];
            let retry_after = self.window.saturating_sub(now.duration_since(oldest));
            LimitOutcome::Limited { retry_after }
        } else {
            LimitOutcome::Allowed
        }
    }

    /// Report the current state for `addr` without recording a new event.
    /// Used to short-circuit work before an attempt is even made, e.g.
    /// rejecting an invite validation outright once the caller is already
    /// over threshold from prior failures.
    ///
    /// Triggers at `live >= threshold`, not `>`: the event this call is
    /// guarding has not been recorded yet, so a caller who has already
    /// accumulated `threshold` failures must be blocked *before* this one
    /// becomes the `threshold + 1`th instead of after.
    pub async fn peek(&self, addr: IpAddr) -> LimitOutcome {
        let now = Instant::now();
        let counters = self.counters.lock().await;
        let Some(entry) = counters.get(&addr) else {
            return LimitOutcome::Allowed;
        };
        let live: Vec<&Instant> = entry.events.iter().filter(|t| now.duration_since(**t) < self.window).collect();
        if live.len() as u32 >= self.threshold {
            let oldest = **live.iter().min().expect("non-empty");
            let retry_after = self.window.saturating_sub(now.duration_since(oldest));
            LimitOutcome::Limited { retry_after }
        } else {
            LimitOutcome::Allowed
        }
    }

    /// Drop addresses whose windows have fully elapsed, bounding memory use.
    pub async fn evict_idle(&self) {
        let now = Instant::now();
        let mut counters = self.counters.lock().await;
        counters.retain(|_, w| w.events.iter().any(|t| now.duration_since(*t) < self.window));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
    }

    #[tokio::test]
    async fn allows_under_threshold() {
        let limiter = SlidingWindowLimiter::new(3, Duration::from_secs(60));
        for _ in 0..3 {
            assert_eq!(limiter.check_and_record(ip()).await, LimitOutcome::Allowed);
        }
    }

    #[tokio::test]
    async fn limits_over_threshold() {
        let limiter = SlidingWindowLimiter::new(2, Duration::from_secs(60));
        assert_eq!(limiter.check_and_record(ip()).await, LimitOutcome::Allowed);
        assert_eq!(limiter.check_and_record(ip()).await, LimitOutcome::Allowed);
        let third = limiter.check_and_record(ip()).await;
        assert!(matches!(third, LimitOutcome::Limited { .. }));
    }

    #[tokio::test]
    async fn window_expiry_resets_counter() {
        let limiter = SlidingWindowLimiter::new(1, Duration::from_millis(10));
        assert_eq!(limiter.check_and_record(ip()).await, LimitOutcome::Allowed);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(limiter.check_and_record(ip()).await, LimitOutcome::Allowed);
    }

    #[tokio::test]
    async fn independent_addresses_do_not_interfere() {
        let limiter = SlidingWindowLimiter::new(1, Duration::from_secs(60));
        let a = ip();
        let b = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(limiter.check_and_record(a).await, LimitOutcome::Allowed);
        assert_eq!(limiter.check_and_record(b).await, LimitOutcome::Allowed);
    }

    #[tokio::test]
    async fn peek_does_not_record_an_event() {
        let limiter = SlidingWindowLimiter::new(1, Duration::from_secs(60));
        assert_eq!(limiter.peek(ip()).await, LimitOutcome::Allowed);
        assert_eq!(limiter.peek(ip()).await, LimitOutcome::Allowed);
        assert_eq!(limiter.check_and_record(ip()).await, LimitOutcome::Allowed);
    }

    #[tokio::test]
    async fn peek_reports_limited_once_threshold_is_reached() {
        // peek must trip as soon as `threshold` events are already on the
        // books, not only once a would-be (threshold+1)th is recorded —
        // the event peek is guarding has not happened yet.
        let limiter = SlidingWindowLimiter::new(2, Duration::from_secs(60));
        limiter.check_and_record(ip()).await;
        assert_eq!(limiter.peek(ip()).await, LimitOutcome::Allowed);
        limiter.check_and_record(ip()).await;
        assert!(matches!(limiter.peek(ip()).await, LimitOutcome::Limited { .. }));
    }

    #[tokio::test]
    async fn eleventh_failure_within_hour_is_limited() {
        // Mirrors end-to-end scenario 5: eleven failures, threshold 10.
        let limiter = SlidingWindowLimiter::new(10, Duration::from_secs(3600));
        for _ in 0..10 {
            assert_eq!(limiter.check_and_record(ip()).await, LimitOutcome::Allowed);
        }
        let eleventh = limiter.check_and_record(ip()).await;
        assert!(matches!(eleventh, LimitOutcome::Limited { .. }));
    }

    #[tokio::test]
    async fn eleventh_call_is_limited_via_peek_before_any_record() {
        // The path `InviteStore::validate` actually drives: peek before
        // recording. After 10 recorded failures the 11th call must be
        // blocked by `peek` alone, never reaching `check_and_record` (so
        // the counter never advances to 11, and no 12th-call-before-block
        // off-by-one survives).
        let limiter = SlidingWindowLimiter::new(10, Duration::from_secs(3600));
        for _ in 0..10 {
            assert_eq!(limiter.peek(ip()).await, LimitOutcome::Allowed);
            limiter.check_and_record(ip()).await;
        }
        assert!(matches!(limiter.peek(ip()).await, LimitOutcome::Limited { .. }));
    }
}
