//! Process-wide counters.
//!
//! Lightweight counter-scoped telemetry: named monotonic counters that
//! subsystems bump on interesting events (`cache_hits`, `llm_retries`,
//! `context_fallbacks`, per-tool success/failure). The resource-monitor loop
//! logs a snapshot periodically; tests assert on individual counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use dashmap::DashMap;

fn registry() -> &'static DashMap<String, AtomicU64> {
    static REGISTRY: OnceLock<DashMap<String, AtomicU64>> = OnceLock::new();
    REGISTRY.get_or_init(DashMap::new)
}

/// Increment a named counter by 1.
pub fn incr(name: &str) {
    add(name, 1);
}

/// Increment a named counter by `n`.
pub fn add(name: &str, n: u64) {
    registry()
        .entry(name.to_string())
        .or_insert_with(|| AtomicU64::new(0))
        .fetch_add(n, Ordering::Relaxed);
}

/// Current value of a counter; 0 if it has never been bumped.
pub fn get(name: &str) -> u64 {
    registry()
        .get(name)
        .map(|c| c.load(Ordering::Relaxed))
        .unwrap_or(0)
}

/// Sorted (name, value) snapshot of every counter.
pub fn snapshot() -> Vec<(String, u64)> {
    let mut out: Vec<(String, u64)> = registry()
        .iter()
        .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
        .collect();
    out.sort();
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_counter_is_zero() {
        assert_eq!(get("telemetry_test_never_bumped"), 0);
    }

    #[test]
    fn incr_and_add_accumulate() {
        incr("telemetry_test_acc");
        add("telemetry_test_acc", 4);
        assert_eq!(get("telemetry_test_acc"), 5);
    }

    #[test]
    fn snapshot_contains_bumped_counter() {
        incr("telemetry_test_snap");
        let snap = snapshot();
        assert!(snap.iter().any(|(k, v)| k == "telemetry_test_snap" && *v >= 1));
    }
}
