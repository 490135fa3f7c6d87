// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::key::Revision;
use std::sync::{
    atomic::{
        AtomicI64,
        Ordering::{AcqRel, Acquire, Release},
    },
    Arc,
};

/// Thread-safe revision generator
///
/// Revisions are the 64-bit logical timestamps ordering concurrent writes;
/// every commit log block and every cached cell carries one. Replay after a
/// restart seeds the counter past the highest revision found in the logs.
#[derive(Clone, Default, Debug)]
pub struct RevisionCounter(Arc<AtomicI64>);

impl RevisionCounter {
    /// Creates a new counter, setting it to some previous value
    #[must_use]
    pub fn new(prev: Revision) -> Self {
        Self(Arc::new(AtomicI64::new(prev)))
    }

    /// Gets the current revision without assigning a new one.
    #[must_use]
    pub fn get(&self) -> Revision {
        self.0.load(Acquire)
    }

    /// Assigns the next revision.
    #[must_use]
    pub fn next(&self) -> Revision {
        self.0.fetch_add(1, Release) + 1
    }

    /// Raises the counter to at least `revision`.
    pub fn fetch_max(&self, revision: Revision) {
        self.0.fetch_max(revision, AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn revision_monotonic() {
        let counter = RevisionCounter::default();
        let a = counter.next();
        let b = counter.next();
        assert!(b > a);
    }

    #[test]
    fn revision_replay_seed() {
        let counter = RevisionCounter::default();
        counter.fetch_max(1000);
        counter.fetch_max(50);
        assert_eq!(1001, counter.next());
    }
}
