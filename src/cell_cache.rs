// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{cell::Cell, key::Key, key::Revision, Slice};
use crossbeam_skiplist::SkipMap;
use std::ops::Bound::{Excluded, Unbounded};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// The in-memory sorted cell map of one access group
///
/// New cells land here after their commit log append. When the cache grows
/// too large, the access group freezes it (snapshot) and drains it into a
/// cell store; scanners keep the frozen map alive through an `Arc` until
/// they close, so a snapshot never blocks readers.
pub struct CellCache {
    /// The actual content, stored in a lock-free skiplist.
    items: SkipMap<Key, Slice>,

    /// Sum of serialized key+value sizes.
    mem_used: AtomicU64,

    /// Lowest revision cached; pins the commit log tail.
    earliest_revision: AtomicI64,

    /// Highest revision cached.
    latest_revision: AtomicI64,
}

impl CellCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self {
            items: SkipMap::new(),
            mem_used: AtomicU64::new(0),
            earliest_revision: AtomicI64::new(i64::MAX),
            latest_revision: AtomicI64::new(0),
        }
    }

    /// Inserts a cell.
    pub fn add(&self, cell: Cell) {
        let size = (cell.key.encoded_len() + cell.value.len()) as u64;
        self.mem_used.fetch_add(size, Ordering::AcqRel);

        self.earliest_revision
            .fetch_min(cell.key.revision, Ordering::AcqRel);
        self.latest_revision
            .fetch_max(cell.key.revision, Ordering::AcqRel);

        self.items.insert(cell.key, cell.value);
    }

    /// Returns the first cell strictly after `prev`, or the first cell of
    /// the cache when `prev` is `None`.
    ///
    /// Scanners iterate the cache cursor-style with this, holding no borrow
    /// between steps.
    #[must_use]
    pub fn next_after(&self, prev: Option<&Key>) -> Option<Cell> {
        let entry = match prev {
            Some(key) => self.items.range((Excluded(key.clone()), Unbounded)).next(),
            None => self.items.front(),
        }?;

        Some(Cell {
            key: entry.key().clone(),
            value: entry.value().clone(),
        })
    }

    /// Returns the first cell with key `>= key`.
    #[must_use]
    pub fn lower_bound(&self, key: &Key) -> Option<Cell> {
        let entry = self.items.lower_bound(std::ops::Bound::Included(key))?;
        Some(Cell {
            key: entry.key().clone(),
            value: entry.value().clone(),
        })
    }

    /// Middle row of the cache, used as a split point fallback.
    #[must_use]
    pub fn middle_row(&self) -> Option<Slice> {
        let n = self.items.len();
        if n == 0 {
            return None;
        }

        self.items
            .iter()
            .nth(n / 2)
            .map(|entry| entry.key().row.clone())
    }

    /// Bytes of serialized cells held.
    #[must_use]
    pub fn mem_used(&self) -> u64 {
        self.mem_used.load(Ordering::Acquire)
    }

    /// Number of cells held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns `true` if the cache holds no cells.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Lowest cached revision; `i64::MAX` when empty.
    #[must_use]
    pub fn earliest_revision(&self) -> Revision {
        self.earliest_revision.load(Ordering::Acquire)
    }

    /// Highest cached revision; 0 when empty.
    #[must_use]
    pub fn latest_revision(&self) -> Revision {
        self.latest_revision.load(Ordering::Acquire)
    }
}

impl Default for CellCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn cell_cache_sorted_cursor() {
        let cache = CellCache::new();

        cache.add(Cell::new(Key::insert("b", 1, "", 10, 2), "vb"));
        cache.add(Cell::new(Key::insert("a", 1, "", 10, 1), "va"));
        cache.add(Cell::new(Key::insert("c", 1, "", 10, 3), "vc"));

        let mut rows = vec![];
        let mut prev: Option<Key> = None;
        while let Some(cell) = cache.next_after(prev.as_ref()) {
            rows.push(cell.key.row.to_vec());
            prev = Some(cell.key);
        }

        assert_eq!(vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()], rows);
    }

    #[test]
    fn cell_cache_newer_version_first() {
        let cache = CellCache::new();

        cache.add(Cell::new(Key::insert("r", 1, "q", 10, 1), "old"));
        cache.add(Cell::new(Key::insert("r", 1, "q", 20, 2), "new"));

        let first = cache.next_after(None).expect("cache is non-empty");
        assert_eq!(b"new", &*first.value);
    }

    #[test]
    fn cell_cache_accounting() {
        let cache = CellCache::new();
        assert_eq!(0, cache.mem_used());
        assert_eq!(i64::MAX, cache.earliest_revision());

        let cell = Cell::new(Key::insert("row", 1, "q", 10, 7), "value");
        let expected = (cell.key.encoded_len() + cell.value.len()) as u64;
        cache.add(cell);

        assert_eq!(expected, cache.mem_used());
        assert_eq!(7, cache.earliest_revision());
        assert_eq!(7, cache.latest_revision());
    }

    #[test]
    fn cell_cache_lower_bound() {
        let cache = CellCache::new();
        cache.add(Cell::new(Key::insert("a", 1, "", 10, 1), "va"));
        cache.add(Cell::new(Key::insert("c", 1, "", 10, 2), "vc"));

        let probe = Key::insert("b", 1, "", i64::MAX, i64::MAX);
        let hit = cache.lower_bound(&probe).expect("should find c");
        assert_eq!(b"c", &*hit.key.row);
    }
}
