//! Mutation generations.
//!
//! Compiled artifacts bake in constants read from caller-owned objects. Those
//! objects signal mutation explicitly: anything under tracking writes through
//! [`Tracked::set`], which bumps the shared generation counter. The
//! orchestrator records the generation when it memoizes a program and treats
//! a newer generation as a guard miss, forcing re-validation against disk.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Shared monotonic mutation counter.
#[derive(Clone, Default)]
pub struct GenerationTracker {
    generation: Arc<AtomicU64>,
}

impl GenerationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Records that some tracked object changed.
    pub fn bump(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }
}

/// A value whose mutations must invalidate memoized programs.
///
/// All writes go through [`Tracked::set`]; there is no way to obtain a
/// mutable reference without bumping the tracker.
#[derive(Clone)]
pub struct Tracked<T> {
    value: T,
    tracker: GenerationTracker,
}

impl<T> Tracked<T> {
    pub fn new(value: T, tracker: GenerationTracker) -> Self {
        Self { value, tracker }
    }

    pub fn get(&self) -> &T {
        &self.value
    }

    pub fn set(&mut self, value: T) {
        self.value = value;
        self.tracker.bump();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_bumps_the_shared_generation() {
        let tracker = GenerationTracker::new();
        let mut weight = Tracked::new(vec![1.0f32, 2.0], tracker.clone());
        assert_eq!(tracker.current(), 0);
        weight.set(vec![3.0, 4.0]);
        assert_eq!(tracker.current(), 1);
        assert_eq!(weight.get(), &vec![3.0, 4.0]);
    }

    #[test]
    fn clones_share_one_counter() {
        let tracker = GenerationTracker::new();
        let other = tracker.clone();
        tracker.bump();
        other.bump();
        assert_eq!(tracker.current(), 2);
    }
}
