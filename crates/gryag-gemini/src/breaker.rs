//! Circuit breaker over terminal generation failures.
//!
//! After `threshold` consecutive terminal failures the circuit opens for
//! `cooldown`; requests during the open window fail immediately instead of
//! hammering a provider that is already refusing us. Any success closes the
//! circuit and resets the count.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::warn;

use gryag_core::telemetry;

#[derive(Debug)]
struct BreakerState {
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold,
            cooldown,
            state: Mutex::new(BreakerState {
                consecutive_failures: 0,
                open_until: None,
            }),
        }
    }

    /// True while the circuit is open; callers must fail fast.
    pub fn is_open(&self) -> bool {
        let mut state = self.state.lock().expect("breaker mutex poisoned");
        match state.open_until {
            Some(until) if Instant::now() < until => true,
            Some(_) => {
                // Cooldown elapsed: half-open, allow the next attempt.
                state.open_until = None;
                false
            }
            None => false,
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock().expect("breaker mutex poisoned");
        state.consecutive_failures = 0;
        state.open_until = None;
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock().expect("breaker mutex poisoned");
        state.consecutive_failures += 1;
        if state.consecutive_failures >= self.threshold && state.open_until.is_none() {
            state.open_until = Some(Instant::now() + self.cooldown);
            telemetry::incr("circuit_open");
            warn!(
                failures = state.consecutive_failures,
                cooldown_secs = self.cooldown.as_secs(),
                "circuit breaker opened"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_after_threshold() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        assert!(!breaker.is_open());
        breaker.record_failure();
        breaker.record_failure();
        assert!(!breaker.is_open());
        breaker.record_failure();
        assert!(breaker.is_open());
    }

    #[test]
    fn success_resets_count() {
        let breaker = CircuitBreaker::new(2, Duration::from_secs(60));
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        assert!(!breaker.is_open());
    }

    #[test]
    fn cooldown_elapse_half_opens() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(10));
        breaker.record_failure();
        assert!(breaker.is_open());
        std::thread::sleep(Duration::from_millis(20));
        assert!(!breaker.is_open());
    }
}
