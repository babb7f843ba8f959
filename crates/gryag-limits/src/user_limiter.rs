//! Per-user sliding-hour rate limiter.
//!
//! In-memory timestamp windows per user; admins bypass at the call site.

use std::collections::VecDeque;

use dashmap::DashMap;

const WINDOW_SECS: i64 = 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub remaining: u32,
    pub retry_after_secs: u64,
}

pub struct UserRateLimiter {
    limit_per_hour: u32,
    windows: DashMap<i64, VecDeque<i64>>,
}

impl UserRateLimiter {
    pub fn new(limit_per_hour: u32) -> Self {
        Self {
            limit_per_hour,
            windows: DashMap::new(),
        }
    }

    /// Check and consume one slot for a user. Denials do not consume.
    pub fn check(&self, user_id: i64, now_ts: i64) -> RateDecision {
        let mut window = self.windows.entry(user_id).or_default();
        while window.front().is_some_and(|&t| now_ts - t >= WINDOW_SECS) {
            window.pop_front();
        }
        let used = window.len() as u32;
        if used < self.limit_per_hour {
            window.push_back(now_ts);
            RateDecision {
                allowed: true,
                remaining: self.limit_per_hour - used - 1,
                retry_after_secs: 0,
            }
        } else {
            let oldest = *window.front().expect("window is full, front exists");
            RateDecision {
                allowed: false,
                remaining: 0,
                retry_after_secs: (oldest + WINDOW_SECS - now_ts).max(1) as u64,
            }
        }
    }

    /// Drop every window (admin reset).
    pub fn reset_all(&self) {
        self.windows.clear();
    }

    /// Drop one user's window.
    pub fn reset_user(&self, user_id: i64) {
        self.windows.remove(&user_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_limit() {
        let limiter = UserRateLimiter::new(3);
        for i in 0..3 {
            let d = limiter.check(42, 100 + i);
            assert!(d.allowed, "request {i} should pass");
        }
        let denied = limiter.check(42, 104);
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert!(denied.retry_after_secs > 0);
    }

    #[test]
    fn remaining_counts_down() {
        let limiter = UserRateLimiter::new(3);
        assert_eq!(limiter.check(42, 100).remaining, 2);
        assert_eq!(limiter.check(42, 101).remaining, 1);
        assert_eq!(limiter.check(42, 102).remaining, 0);
    }

    #[test]
    fn window_slides() {
        let limiter = UserRateLimiter::new(1);
        assert!(limiter.check(42, 100).allowed);
        assert!(!limiter.check(42, 200).allowed);
        assert!(limiter.check(42, 100 + 3600).allowed);
    }

    #[test]
    fn users_are_independent() {
        let limiter = UserRateLimiter::new(1);
        assert!(limiter.check(1, 100).allowed);
        assert!(limiter.check(2, 100).allowed);
    }

    #[test]
    fn reset_clears_window() {
        let limiter = UserRateLimiter::new(1);
        limiter.check(42, 100);
        limiter.reset_all();
        assert!(limiter.check(42, 101).allowed);
    }

    #[test]
    fn retry_after_matches_window_edge() {
        let limiter = UserRateLimiter::new(1);
        limiter.check(42, 1000);
        let denied = limiter.check(42, 1600);
        assert_eq!(denied.retry_after_secs, 3000);
    }
}
