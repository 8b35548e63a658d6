//! Lamport counter and vector clocks

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::identity::NodeId;

/// Per-process monotonic event counter.
#[derive(Debug, Default)]
pub struct LamportClock(AtomicU64);

impl LamportClock {
    pub fn new(start: u64) -> Self {
        Self(AtomicU64::new(start))
    }

    /// Atomically increment and return the new value.
    pub fn tick(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn current(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    /// Raise the counter to at least `observed`. Keeps the own-component
    /// invariant when a merged clock carries a higher value.
    pub fn observe(&self, observed: u64) {
        self.0.fetch_max(observed, Ordering::SeqCst);
    }
}

/// Pairwise causal relation between two vector clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CausalOrdering {
    Before,
    After,
    Equal,
    Concurrent,
}

/// Mapping from node identity to Lamport counter. Missing entries read as 0.
/// Backed by a `BTreeMap` so serialized forms are canonically ordered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock(BTreeMap<NodeId, u64>);

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, node: &NodeId) -> u64 {
        self.0.get(node).copied().unwrap_or(0)
    }

    pub fn set(&mut self, node: NodeId, value: u64) {
        self.0.insert(node, value);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &u64)> {
        self.0.iter()
    }

    /// Componentwise maximum with `other` (the `updateFromRemote` rule).
    pub fn merge_max(&mut self, other: &VectorClock) {
        for (node, &counter) in other.0.iter() {
            let entry = self.0.entry(node.clone()).or_insert(0);
            *entry = (*entry).max(counter);
        }
    }

    /// Compare two clocks over the union of their components.
    pub fn compare(&self, other: &VectorClock) -> CausalOrdering {
        let mut less = false;
        let mut greater = false;

        for node in self.0.keys().chain(other.0.keys()) {
            let a = self.get(node);
            let b = other.get(node);
            if a < b {
                less = true;
            } else if a > b {
                greater = true;
            }
            if less && greater {
                return CausalOrdering::Concurrent;
            }
        }

        match (less, greater) {
            (true, false) => CausalOrdering::Before,
            (false, true) => CausalOrdering::After,
            (false, false) => CausalOrdering::Equal,
            (true, true) => CausalOrdering::Concurrent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(c: char) -> NodeId {
        NodeId::normalize(&c.to_string().repeat(64)).unwrap()
    }

    #[test]
    fn lamport_tick_is_monotonic() {
        let clock = LamportClock::default();
        assert_eq!(clock.tick(), 1);
        assert_eq!(clock.tick(), 2);
        clock.observe(10);
        assert_eq!(clock.current(), 10);
        clock.observe(5);
        assert_eq!(clock.current(), 10);
    }

    #[test]
    fn missing_components_read_as_zero() {
        let vc = VectorClock::new();
        assert_eq!(vc.get(&id('a')), 0);
    }

    #[test]
    fn compare_before_after() {
        let mut a = VectorClock::new();
        a.set(id('a'), 1);
        let mut b = a.clone();
        b.set(id('a'), 2);

        assert_eq!(a.compare(&b), CausalOrdering::Before);
        assert_eq!(b.compare(&a), CausalOrdering::After);
        assert_eq!(a.compare(&a.clone()), CausalOrdering::Equal);
    }

    #[test]
    fn compare_concurrent() {
        let mut a = VectorClock::new();
        a.set(id('a'), 1);
        let mut b = VectorClock::new();
        b.set(id('b'), 1);

        assert_eq!(a.compare(&b), CausalOrdering::Concurrent);
        assert_eq!(b.compare(&a), CausalOrdering::Concurrent);
    }

    #[test]
    fn merge_max_takes_pairwise_maximum() {
        let mut a = VectorClock::new();
        a.set(id('a'), 3);
        a.set(id('b'), 1);
        let mut b = VectorClock::new();
        b.set(id('b'), 5);
        b.set(id('c'), 2);

        a.merge_max(&b);
        assert_eq!(a.get(&id('a')), 3);
        assert_eq!(a.get(&id('b')), 5);
        assert_eq!(a.get(&id('c')), 2);
    }
}
