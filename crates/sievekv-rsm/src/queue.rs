//! The per-replica record of invoked, not-yet-committed operations (`I`).
//!
//! Keeps insertion order, a wall-clock timestamp per operation (set at
//! insertion, reset wholesale on epoch change) and deduplicates by operation
//! equality. The age checker scans it for operations the leader has been
//! sitting on too long.

use std::time::{Duration, Instant};

use sievekv_types::Operation;

/// Queue of invoked operations with per-operation ages.
#[derive(Debug, Clone, Default)]
pub struct OpQueue {
    entries: Vec<(Operation, Instant)>,
}

impl OpQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an operation stamped `now`. A duplicate (by tuple equality) is
    /// ignored and keeps its original timestamp, so resubmitting does not
    /// reset the age clock.
    pub fn insert(&mut self, op: Operation, now: Instant) {
        if !self.contains(&op) {
            self.entries.push((op, now));
        }
    }

    /// Removes an operation. Returns whether it was present.
    pub fn remove(&mut self, op: &Operation) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(o, _)| o != op);
        self.entries.len() != before
    }

    pub fn contains(&self, op: &Operation) -> bool {
        self.entries.iter().any(|(o, _)| o == op)
    }

    /// First operation (in insertion order) older than `max_age` at `now`.
    pub fn first_over_age(&self, now: Instant, max_age: Duration) -> Option<&Operation> {
        self.entries
            .iter()
            .find(|(_, inserted)| now.saturating_duration_since(*inserted) > max_age)
            .map(|(op, _)| op)
    }

    /// Restamps every entry to `now`. Epoch changes call this so inherited
    /// work gets a fresh grace period under the new leader.
    pub fn reset_ages(&mut self, now: Instant) {
        for (_, inserted) in &mut self.entries {
            *inserted = now;
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(key: &str, value: i64) -> Operation {
        Operation::new(key, value)
    }

    #[test]
    fn insert_deduplicates_and_keeps_first_age() {
        let t0 = Instant::now();
        let t1 = t0 + Duration::from_secs(10);

        let mut q = OpQueue::new();
        q.insert(op("a", 1), t0);
        q.insert(op("a", 1), t1);
        assert_eq!(q.len(), 1);

        // Aged relative to t0, not the re-insertion at t1.
        let probe = t0 + Duration::from_secs(5);
        assert_eq!(
            q.first_over_age(probe, Duration::from_secs(4)),
            Some(&op("a", 1))
        );
    }

    #[test]
    fn first_over_age_respects_insertion_order() {
        let t0 = Instant::now();
        let mut q = OpQueue::new();
        q.insert(op("a", 1), t0);
        q.insert(op("b", 2), t0);

        let probe = t0 + Duration::from_secs(5);
        assert_eq!(
            q.first_over_age(probe, Duration::from_secs(4)),
            Some(&op("a", 1))
        );

        q.remove(&op("a", 1));
        assert_eq!(
            q.first_over_age(probe, Duration::from_secs(4)),
            Some(&op("b", 2))
        );
    }

    #[test]
    fn fresh_entries_are_not_over_age() {
        let t0 = Instant::now();
        let mut q = OpQueue::new();
        q.insert(op("a", 1), t0);
        assert_eq!(q.first_over_age(t0, Duration::from_secs(4)), None);
        assert_eq!(
            q.first_over_age(t0 + Duration::from_secs(4), Duration::from_secs(4)),
            None
        );
    }

    #[test]
    fn reset_ages_restamps_everything() {
        let t0 = Instant::now();
        let mut q = OpQueue::new();
        q.insert(op("a", 1), t0);
        q.insert(op("b", 2), t0);

        let t1 = t0 + Duration::from_secs(10);
        q.reset_ages(t1);

        assert_eq!(q.first_over_age(t1, Duration::from_secs(4)), None);
        assert!(
            q.first_over_age(t1 + Duration::from_secs(5), Duration::from_secs(4))
                .is_some()
        );
    }

    #[test]
    fn remove_missing_is_noop() {
        let mut q = OpQueue::new();
        q.insert(op("a", 1), Instant::now());
        assert!(!q.remove(&op("z", 0)));
        assert!(q.remove(&op("a", 1)));
        assert!(q.is_empty());
    }
}
