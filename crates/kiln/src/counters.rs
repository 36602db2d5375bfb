//! Process-wide named counters.
//!
//! Cheap observability for cache and pool behavior: tests assert on these,
//! production code treats them as fire-and-forget. Reset between test cases
//! with [`reset`].

use std::collections::HashMap;
use std::sync::Mutex;

use once_cell::sync::Lazy;

pub const GRAPH_CACHE_HIT: &str = "graph_cache_hit";
pub const GRAPH_CACHE_MISS: &str = "graph_cache_miss";
pub const GRAPH_CACHE_BYPASS: &str = "graph_cache_bypass";
pub const GRAPH_CACHE_GUARD_MISS: &str = "graph_cache_guard_miss";
/// Remote hit written back into the local tier.
pub const LOOKUP_WRITE_FILE: &str = "lookup_write_file";
pub const AUTOTUNE_CACHE_HIT: &str = "autotune_cache_hit";
pub const AUTOTUNE_CACHE_MISS: &str = "autotune_cache_miss";
pub const WORKER_CRASH: &str = "autotune_worker_crash";
pub const WORKER_RESPAWN: &str = "autotune_worker_respawn";

static COUNTERS: Lazy<Mutex<HashMap<&'static str, u64>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

pub fn bump(name: &'static str) {
    add(name, 1);
}

pub fn add(name: &'static str, delta: u64) {
    let mut counters = COUNTERS.lock().expect("counter table poisoned");
    *counters.entry(name).or_insert(0) += delta;
}

pub fn get(name: &'static str) -> u64 {
    let counters = COUNTERS.lock().expect("counter table poisoned");
    counters.get(name).copied().unwrap_or(0)
}

/// Clears every counter. Intended for test isolation.
pub fn reset() {
    COUNTERS.lock().expect("counter table poisoned").clear();
}

/// Snapshot of all non-zero counters, sorted by name.
pub fn snapshot() -> Vec<(&'static str, u64)> {
    let counters = COUNTERS.lock().expect("counter table poisoned");
    let mut rows: Vec<_> = counters
        .iter()
        .filter(|(_, value)| **value > 0)
        .map(|(name, value)| (*name, *value))
        .collect();
    rows.sort_by_key(|(name, _)| *name);
    rows
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_and_reset() {
        reset();
        bump(GRAPH_CACHE_HIT);
        bump(GRAPH_CACHE_HIT);
        add(GRAPH_CACHE_MISS, 3);
        assert_eq!(get(GRAPH_CACHE_HIT), 2);
        assert_eq!(get(GRAPH_CACHE_MISS), 3);
        assert_eq!(get(GRAPH_CACHE_BYPASS), 0);
        reset();
        assert_eq!(get(GRAPH_CACHE_HIT), 0);
    }
}
