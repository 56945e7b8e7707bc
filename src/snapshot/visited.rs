//! Deduplicating containers for previously-seen states/pairs (spec §4.12).
//!
//! Sorted by `(nb_actors, heap_bytes_used)`; lookup binary-searches the equivalence subrange and
//! falls back to full snapshot equality. Bounded by `visited_max`, evicting the entry with the
//! smallest sequence number unless the exploration stack still references it.

use std::rc::Rc;

use crate::error::Result;
use crate::snapshot::Snapshot;

/// Common bucketing/eviction fields shared by [`VisitedState`] and [`VisitedPair`].
pub trait Keyed {
    fn bucket_key(&self) -> (usize, u64);
    fn seq(&self) -> u64;
    fn snapshot(&self) -> Option<&Snapshot>;
    /// Releases the owned snapshot while keeping the entry (and its key) around, so a later
    /// lookup against the same key still finds *something* to bucket against, per spec §4.12
    /// "its snapshot is released but its identity is retained".
    fn release_snapshot(&mut self);
}

/// A deduplication record for the safety/communication-determinism checkers (spec §3
/// VisitedState).
pub struct VisitedState {
    pub seq: u64,
    pub nb_actors: usize,
    pub heap_bytes_used: u64,
    pub snapshot: Option<Rc<Snapshot>>,
}

impl Keyed for VisitedState {
    fn bucket_key(&self) -> (usize, u64) {
        (self.nb_actors, self.heap_bytes_used)
    }
    fn seq(&self) -> u64 {
        self.seq
    }
    fn snapshot(&self) -> Option<&Snapshot> {
        self.snapshot.as_deref()
    }
    fn release_snapshot(&mut self) {
        self.snapshot = None;
    }
}

/// A deduplication record for the liveness checker's pair search (spec §4.10 Pair,
/// `AcceptancePairs`/`VisitedPairs`).
pub struct VisitedPair {
    pub seq: u64,
    pub nb_actors: usize,
    pub heap_bytes_used: u64,
    pub automaton_state: u32,
    pub propositional_values: Vec<bool>,
    pub snapshot: Option<Rc<Snapshot>>,
}

impl Keyed for VisitedPair {
    fn bucket_key(&self) -> (usize, u64) {
        (self.nb_actors, self.heap_bytes_used)
    }
    fn seq(&self) -> u64 {
        self.seq
    }
    fn snapshot(&self) -> Option<&Snapshot> {
        self.snapshot.as_deref()
    }
    fn release_snapshot(&mut self) {
        self.snapshot = None;
    }
}

impl VisitedPair {
    /// The non-snapshot part of pair equality (spec §4.10 "equal by `(automaton_state,
    /// propositional_values, snapshot-equal)`").
    pub fn matches_non_snapshot(&self, automaton_state: u32, propositional_values: &[bool]) -> bool {
        self.automaton_state == automaton_state && self.propositional_values == propositional_values
    }
}

pub enum Insertion {
    /// No equivalent entry existed; `candidate` was inserted.
    New,
    /// An equivalent entry already existed at this sequence number.
    AlreadyPresent(u64),
}

/// Sorted, LRU-capped container of `T: Keyed` (spec §4.12).
pub struct VisitedSet<T: Keyed> {
    entries: Vec<T>,
    visited_max: usize,
    next_seq: u64,
}

impl<T: Keyed> VisitedSet<T> {
    /// `visited_max == 0` means unbounded (spec §6 default).
    pub fn new(visited_max: i32) -> Self {
        Self {
            entries: Vec::new(),
            visited_max: visited_max.max(0) as usize,
            next_seq: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn equivalence_range(&self, key: (usize, u64)) -> std::ops::Range<usize> {
        let start = self
            .entries
            .partition_point(|e| e.bucket_key() < key);
        let end = self
            .entries
            .partition_point(|e| e.bucket_key() <= key);
        start..end
    }

    /// Looks up `candidate` against the equivalence subrange using `equals`; if no match is
    /// found, inserts `candidate` in sorted position. `on_stack` reports whether a given sequence
    /// number is still referenced by the exploration stack, which gates eviction.
    pub fn insert_if_new(
        &mut self,
        candidate: T,
        mut equals: impl FnMut(&T, &T) -> Result<bool>,
        on_stack: impl Fn(u64) -> bool,
    ) -> Result<Insertion> {
        let key = candidate.bucket_key();
        let range = self.equivalence_range(key);
        for idx in range.clone() {
            if candidate.snapshot().is_some()
                && self.entries[idx].snapshot().is_some()
                && equals(&self.entries[idx], &candidate)?
            {
                return Ok(Insertion::AlreadyPresent(self.entries[idx].seq()));
            }
        }

        let insert_at = self
            .entries
            .partition_point(|e| e.bucket_key() <= key);
        self.entries.insert(insert_at, candidate);
        self.evict_if_over_capacity(&on_stack);
        Ok(Insertion::New)
    }

    /// Evicts the entry with the smallest sequence number once `visited_max` is exceeded, unless
    /// it is still referenced from the exploration stack (spec §4.12).
    fn evict_if_over_capacity(&mut self, on_stack: &impl Fn(u64) -> bool) {
        if self.visited_max == 0 || self.entries.len() <= self.visited_max {
            return;
        }
        let mut candidates: Vec<usize> = (0..self.entries.len())
            .filter(|&i| self.entries[i].snapshot().is_some())
            .collect();
        candidates.sort_by_key(|&i| self.entries[i].seq());
        for idx in candidates {
            if !on_stack(self.entries[idx].seq()) {
                self.entries[idx].release_snapshot();
                return;
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone)]
    struct Dummy {
        seq: u64,
        key: (usize, u64),
    }

    impl Keyed for Dummy {
        fn bucket_key(&self) -> (usize, u64) {
            self.key
        }
        fn seq(&self) -> u64 {
            self.seq
        }
        fn snapshot(&self) -> Option<&Snapshot> {
            // `Dummy` never owns a real `Snapshot`; these tests only exercise bucket ordering.
            // Full snapshot-backed equality is exercised against the real `Snapshot` type
            // elsewhere (region/page-store round-trip tests).
            None
        }
        fn release_snapshot(&mut self) {}
    }

    #[test]
    fn bucket_ordering_and_lookup_by_key() {
        let mut set: VisitedSet<Dummy> = VisitedSet::new(0);
        let a = Dummy { seq: set.next_seq(), key: (2, 100) };
        let b = Dummy { seq: set.next_seq(), key: (1, 50) };
        set.insert_if_new(a, |_, _| Ok(false), |_| false).unwrap();
        set.insert_if_new(b, |_, _| Ok(false), |_| false).unwrap();
        let keys: Vec<_> = set.iter().map(|d| d.bucket_key()).collect();
        assert_eq!(keys, vec![(1, 50), (2, 100)]);
    }

    #[test]
    fn entries_without_snapshots_never_short_circuit_as_duplicates() {
        let mut set: VisitedSet<Dummy> = VisitedSet::new(0);
        let a = Dummy { seq: set.next_seq(), key: (1, 1) };
        set.insert_if_new(a, |_, _| Ok(false), |_| false).unwrap();

        // `snapshot()` returns `None` for `Dummy`, so the duplicate check's snapshot-presence
        // guard always falls through to insertion, regardless of what `equals` would say.
        let b = Dummy { seq: set.next_seq(), key: (1, 1) };
        let outcome = set.insert_if_new(b, |_, _| Ok(true), |_| false).unwrap();
        assert!(matches!(outcome, Insertion::New));
    }
}
