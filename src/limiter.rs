//! Per-user fixed-window send-rate accounting.
//!
//! Coarse fixed-window counter, not a sliding log: O(1) memory per user at
//! the cost of burst-at-boundary imprecision. Windows live in a DashMap so
//! unrelated users never contend; the entry lock makes each user's
//! increment-and-compare atomic relative to that user's own sends.

use dashmap::DashMap;
use std::time::{Duration, Instant};

/// Rate-limit settings: budget B messages per window W.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitSettings {
    pub budget: u32,
    pub window: Duration,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        // 30 messages per minute
        Self {
            budget: 30,
            window: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
struct RateWindow {
    window_start: Instant,
    count: u32,
}

/// Fixed-window rate limiter keyed by user id.
#[derive(Debug)]
pub struct RateLimiter {
    settings: RateLimitSettings,
    windows: DashMap<String, RateWindow>,
}

impl RateLimiter {
    pub fn new(settings: RateLimitSettings) -> Self {
        Self {
            settings,
            windows: DashMap::new(),
        }
    }

    /// Account one send for `user_id` and decide whether it is within budget.
    ///
    /// A fresh or expired window starts at count 1 and is allowed. Otherwise
    /// the count is incremented first and the send is allowed iff the
    /// post-increment count is within budget — a user hammering past the
    /// limit keeps incrementing and stays rejected until the window rolls
    /// over.
    pub fn allow(&self, user_id: &str) -> bool {
        let now = Instant::now();
        let mut entry = self
            .windows
            .entry(user_id.to_string())
            .or_insert_with(|| RateWindow {
                window_start: now,
                count: 0,
            });

        if now.duration_since(entry.window_start) >= self.settings.window {
            entry.window_start = now;
            entry.count = 1;
            return true;
        }

        entry.count += 1;
        entry.count <= self.settings.budget
    }

    /// Drop all accounting for a user. Called on disconnect and by the
    /// session reaper; a stale window is a memory leak, never a correctness
    /// problem.
    pub fn clear(&self, user_id: &str) {
        self.windows.remove(user_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(budget: u32, window_ms: u64) -> RateLimiter {
        RateLimiter::new(RateLimitSettings {
            budget,
            window: Duration::from_millis(window_ms),
        })
    }

    #[test]
    fn allows_exactly_budget_then_rejects() {
        let limiter = limiter(30, 60_000);
        for i in 0..30 {
            assert!(limiter.allow("bob"), "send {} should be allowed", i + 1);
        }
        assert!(!limiter.allow("bob"), "31st send should be rejected");
        assert!(!limiter.allow("bob"), "rejection persists within the window");
    }

    #[test]
    fn window_rollover_starts_fresh() {
        let limiter = limiter(2, 50);
        assert!(limiter.allow("carol"));
        assert!(limiter.allow("carol"));
        assert!(!limiter.allow("carol"));

        std::thread::sleep(Duration::from_millis(60));

        // Fresh window: first send counts 1 and is allowed again.
        assert!(limiter.allow("carol"));
        assert!(limiter.allow("carol"));
        assert!(!limiter.allow("carol"));
    }

    #[test]
    fn users_are_independent() {
        let limiter = limiter(1, 60_000);
        assert!(limiter.allow("alice"));
        assert!(!limiter.allow("alice"));
        assert!(limiter.allow("bob"), "bob's budget is unaffected by alice");
    }

    #[test]
    fn clear_resets_accounting() {
        let limiter = limiter(1, 60_000);
        assert!(limiter.allow("dave"));
        assert!(!limiter.allow("dave"));
        limiter.clear("dave");
        assert!(limiter.allow("dave"));
    }
}
