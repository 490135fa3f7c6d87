// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The scan pipeline.
//!
//! Server side, a range scan is a heap-merge of per-source cell iterators
//! (cell cache, frozen snapshot, each cell store) behind a filter that
//! applies the scan specification: tombstone masking, column and version
//! limits, TTL, time interval, regexes and row bounds. Results are framed
//! into bounded [`ScanBlock`]s; the server keeps live scanners by id.
//! Client side, [`IntervalScanner`] drives one logical cursor across ranges
//! with block readahead.

mod interval_scanner;
mod scan_block;
mod scan_spec;
mod scanner_map;

pub use interval_scanner::IntervalScanner;
pub use scan_block::ScanBlock;
pub use scan_spec::{CellInterval, RowInterval, ScanSpec};
pub use scanner_map::ScannerMap;

use crate::{
    cell::Cell,
    cell_cache::CellCache,
    key::{Key, KeyFlag},
    schema::Schema,
    Slice,
};
use interval_heap::IntervalHeap;
use regex::bytes::Regex;
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Arc;

/// A cell iterator in key order; the unit the merge composes
pub type CellListScanner = Box<dyn Iterator<Item = crate::Result<Cell>> + Send>;

/// Smallest possible key of `row`, used to position scanners.
#[must_use]
pub fn row_probe_key(row: &[u8]) -> Key {
    Key::new(row, 0, [], KeyFlag::DeleteRow, i64::MAX, i64::MAX)
}

/// Cursor-style scanner over a (possibly frozen) cell cache
///
/// Holds only an `Arc` on the cache; each step re-seeks past the previous
/// key, so maintenance can swap caches while scanners run.
pub struct CellCacheScanner {
    cache: Arc<CellCache>,
    last: Option<Key>,
    started: bool,
    start: Option<Key>,
}

impl CellCacheScanner {
    /// Creates a scanner positioned at `start`, or the cache's first cell.
    #[must_use]
    pub fn new(cache: Arc<CellCache>, start: Option<Key>) -> Self {
        Self {
            cache,
            last: None,
            started: false,
            start,
        }
    }
}

impl Iterator for CellCacheScanner {
    type Item = crate::Result<Cell>;

    fn next(&mut self) -> Option<Self::Item> {
        let cell = if self.started {
            self.cache.next_after(self.last.as_ref())
        } else {
            self.started = true;
            match &self.start {
                Some(key) => self.cache.lower_bound(key),
                None => self.cache.next_after(None),
            }
        }?;

        self.last = Some(cell.key.clone());
        Some(Ok(cell))
    }
}

#[derive(Eq)]
struct HeapItem(usize, Cell);

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.1.key == other.1.key
    }
}

impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.1.key.cmp(&other.1.key)
    }
}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Merges multiple cell iterators into one key-ordered stream
pub struct MergeScanner {
    iterators: Vec<CellListScanner>,
    heap: IntervalHeap<HeapItem>,
    initialized: bool,
}

impl MergeScanner {
    /// Creates a merge over the given sources.
    #[must_use]
    pub fn new(iterators: Vec<CellListScanner>) -> Self {
        let heap = IntervalHeap::with_capacity(iterators.len());

        Self {
            iterators,
            heap,
            initialized: false,
        }
    }

    #[allow(clippy::indexing_slicing)]
    fn initialize(&mut self) -> crate::Result<()> {
        for idx in 0..self.iterators.len() {
            if let Some(item) = self.iterators[idx].next() {
                let item = item?;
                self.heap.push(HeapItem(idx, item));
            }
        }
        self.initialized = true;
        Ok(())
    }
}

impl Iterator for MergeScanner {
    type Item = crate::Result<Cell>;

    #[allow(clippy::indexing_slicing)]
    fn next(&mut self) -> Option<Self::Item> {
        if !self.initialized {
            fail_iter!(self.initialize());
        }

        let min_item = self.heap.pop_min()?;

        if let Some(next_item) = self.iterators[min_item.0].next() {
            let next_item = fail_iter!(next_item);
            self.heap.push(HeapItem(min_item.0, next_item));
        }

        Some(Ok(min_item.1))
    }
}

/// Compiled scan predicates: the spec resolved against a schema
pub struct ScanContext {
    /// The raw specification
    pub spec: ScanSpec,

    row_regex: Option<Regex>,
    value_regex: Option<Regex>,

    family_allowed: [bool; 256],
    family_max_versions: [u32; 256],
    family_ttl_cutoff: [i64; 256],
    qualifier_filters: FxHashMap<u8, FxHashSet<Vec<u8>>>,

    row_set: Option<FxHashSet<Vec<u8>>>,

    cell_start: Option<(Slice, u8, Slice, bool)>,
    cell_end: Option<(Slice, u8, Slice, bool)>,

    // Major compactions set this: tombstones pass the filter until their
    // family's TTL retires them, even though the spec does not ask for
    // deletes back
    retain_unexpired_deletes: bool,
}

fn split_column(column: &str) -> (&str, Option<&str>) {
    match column.split_once(':') {
        Some((family, qualifier)) => (family, Some(qualifier)),
        None => (column, None),
    }
}

fn resolve_column(schema: &Schema, column: &str) -> crate::Result<(u8, Option<Vec<u8>>)> {
    let (family, qualifier) = split_column(column);
    let cf = schema
        .family_by_name(family)
        .ok_or_else(|| crate::Error::BadScanSpec(format!("unknown column family {family:?}")))?;
    Ok((cf.id, qualifier.map(|q| q.as_bytes().to_vec())))
}

impl ScanContext {
    /// Compiles a spec against a schema.
    ///
    /// Fails with [`crate::Error::BadScanSpec`] on unknown columns or bad
    /// regexes.
    pub fn new(spec: ScanSpec, schema: &Schema, now: crate::key::Timestamp) -> crate::Result<Self> {
        spec.validate()?;

        let row_regex = spec
            .row_regex
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|e| crate::Error::BadScanSpec(format!("bad row regex: {e}")))?;
        let value_regex = spec
            .value_regex
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|e| crate::Error::BadScanSpec(format!("bad value regex: {e}")))?;

        let mut family_allowed = [false; 256];
        let mut qualifier_filters: FxHashMap<u8, FxHashSet<Vec<u8>>> = FxHashMap::default();

        if spec.columns.is_empty() {
            for cf in &schema.column_families {
                family_allowed[usize::from(cf.id)] = true;
            }
        } else {
            for column in &spec.columns {
                let (id, qualifier) = resolve_column(schema, column)?;
                family_allowed[usize::from(id)] = true;
                if let Some(qualifier) = qualifier {
                    qualifier_filters.entry(id).or_default().insert(qualifier);
                }
            }
        }

        let mut family_max_versions = [0u32; 256];
        let mut family_ttl_cutoff = [i64::MIN; 256];

        for cf in &schema.column_families {
            let idx = usize::from(cf.id);

            family_max_versions[idx] = match (cf.max_versions, spec.max_versions) {
                (0, n) | (n, 0) => n,
                (a, b) => a.min(b),
            };

            if cf.ttl_secs > 0 {
                family_ttl_cutoff[idx] = now - i64::from(cf.ttl_secs) * 1_000_000_000;
            }
        }

        let row_set = spec
            .scan_and_filter_rows
            .then(|| spec.rows.iter().map(|r| r.to_vec()).collect());

        let (cell_start, cell_end) = match &spec.cell_interval {
            Some(interval) => {
                let (start_id, start_qual) = resolve_column(schema, &interval.start_column)?;
                let (end_id, end_qual) = resolve_column(schema, &interval.end_column)?;
                (
                    Some((
                        interval.start_row.clone(),
                        start_id,
                        start_qual.unwrap_or_default().into(),
                        interval.start_inclusive,
                    )),
                    Some((
                        interval.end_row.clone(),
                        end_id,
                        end_qual.unwrap_or_default().into(),
                        interval.end_inclusive,
                    )),
                )
            }
            None => (None, None),
        };

        Ok(Self {
            spec,
            row_regex,
            value_regex,
            family_allowed,
            family_max_versions,
            family_ttl_cutoff,
            qualifier_filters,
            row_set,
            cell_start,
            cell_end,
            retain_unexpired_deletes: false,
        })
    }

    /// Keeps tombstones that have not outlived their family's TTL, even
    /// when the spec does not return deletes. Major compactions use this so
    /// a tombstone retires only once it has aged out.
    #[must_use]
    pub(crate) fn with_retained_unexpired_deletes(mut self) -> Self {
        self.retain_unexpired_deletes = true;
        self
    }

    /// Returns `true` once a tombstone has aged past its family's TTL.
    /// Row tombstones carry family 0, which no TTL governs; they never
    /// age out this way.
    fn delete_expired(&self, key: &Key) -> bool {
        key.timestamp < self.family_ttl_cutoff[usize::from(key.family)]
    }

    fn family_allowed(&self, family: u8) -> bool {
        self.family_allowed[usize::from(family)]
    }

    fn qualifier_allowed(&self, family: u8, qualifier: &[u8]) -> bool {
        match self.qualifier_filters.get(&family) {
            Some(set) => set.contains(qualifier),
            None => true,
        }
    }

    fn row_matches(&self, row: &[u8]) -> bool {
        if let Some(set) = &self.row_set {
            if !set.contains(row) {
                return false;
            }
        }
        if let Some(regex) = &self.row_regex {
            if !regex.is_match(row) {
                return false;
            }
        }
        true
    }

    fn value_matches(&self, value: &[u8]) -> bool {
        match &self.value_regex {
            Some(regex) => regex.is_match(value),
            None => true,
        }
    }

    fn before_cell_start(&self, key: &Key) -> bool {
        let Some((row, family, qualifier, inclusive)) = &self.cell_start else {
            return false;
        };

        let probe = (&key.row, key.family, &key.qualifier);
        let bound = (row, *family, qualifier);

        if *inclusive {
            probe < bound
        } else {
            probe <= bound
        }
    }

    fn past_cell_end(&self, key: &Key) -> bool {
        let Some((row, family, qualifier, inclusive)) = &self.cell_end else {
            return false;
        };

        let probe = (&key.row, key.family, &key.qualifier);
        let bound = (row, *family, qualifier);

        if *inclusive {
            probe > bound
        } else {
            probe >= bound
        }
    }
}

/// Applies a [`ScanContext`] to a merged cell stream
///
/// Enforces tombstone masking, per-family version limits, TTL, the scan's
/// time interval, column and row predicates, and the row limit.
pub struct ScanFilter<I: Iterator<Item = crate::Result<Cell>>> {
    inner: I,
    context: Arc<ScanContext>,

    cur_row: Option<Slice>,
    row_included: bool,
    rows_returned: u32,
    row_counted: bool,

    row_tombstone_ts: Option<i64>,
    cf_tombstone: Option<(u8, i64)>,
    cell_tombstone: Option<(u8, Slice, i64)>,

    version_key: Option<(u8, Slice)>,
    version_count: u32,

    prev_key: Option<Key>,
    done: bool,
}

impl<I: Iterator<Item = crate::Result<Cell>>> ScanFilter<I> {
    /// Wraps a merged stream.
    pub fn new(inner: I, context: Arc<ScanContext>) -> Self {
        Self {
            inner,
            context,
            cur_row: None,
            row_included: false,
            rows_returned: 0,
            row_counted: false,
            row_tombstone_ts: None,
            cf_tombstone: None,
            cell_tombstone: None,
            version_key: None,
            version_count: 0,
            prev_key: None,
            done: false,
        }
    }

    fn start_row(&mut self, row: &Slice) {
        self.cur_row = Some(row.clone());
        self.row_included = self.context.row_matches(row);
        self.row_counted = false;
        self.row_tombstone_ts = None;
        self.cf_tombstone = None;
        self.cell_tombstone = None;
        self.version_key = None;
        self.version_count = 0;
    }

    fn masked(&self, key: &Key) -> bool {
        if let Some(ts) = self.row_tombstone_ts {
            if ts >= key.timestamp {
                return true;
            }
        }
        if let Some((family, ts)) = &self.cf_tombstone {
            if *family == key.family && *ts >= key.timestamp {
                return true;
            }
        }
        if let Some((family, qualifier, ts)) = &self.cell_tombstone {
            if *family == key.family && qualifier == &key.qualifier && *ts >= key.timestamp {
                return true;
            }
        }
        false
    }

    fn record_tombstone(&mut self, key: &Key) {
        match key.flag {
            KeyFlag::DeleteRow => {
                let ts = self.row_tombstone_ts.unwrap_or(i64::MIN);
                self.row_tombstone_ts = Some(ts.max(key.timestamp));
            }
            KeyFlag::DeleteColumnFamily => match &mut self.cf_tombstone {
                Some((family, ts)) if *family == key.family => *ts = (*ts).max(key.timestamp),
                _ => self.cf_tombstone = Some((key.family, key.timestamp)),
            },
            KeyFlag::DeleteCell => match &mut self.cell_tombstone {
                Some((family, qualifier, ts))
                    if *family == key.family && qualifier == &key.qualifier =>
                {
                    *ts = (*ts).max(key.timestamp);
                }
                _ => {
                    self.cell_tombstone =
                        Some((key.family, key.qualifier.clone(), key.timestamp));
                }
            },
            KeyFlag::Insert => {}
        }
    }

    fn count_row(&mut self) -> bool {
        if self.row_counted {
            return true;
        }

        let limit = self.context.spec.row_limit;
        if limit > 0 && self.rows_returned >= limit {
            self.done = true;
            return false;
        }

        self.rows_returned += 1;
        self.row_counted = true;
        true
    }
}

impl<I: Iterator<Item = crate::Result<Cell>>> Iterator for ScanFilter<I> {
    type Item = crate::Result<Cell>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }

            let mut cell = fail_iter!(self.inner.next()?);
            let context = self.context.clone();

            // Merging a cache with a store it was already drained into can
            // surface the same cell twice; keep the first copy only
            if self.prev_key.as_ref() == Some(&cell.key) {
                continue;
            }
            self.prev_key = Some(cell.key.clone());

            if self.cur_row.as_ref() != Some(&cell.key.row) {
                if context.spec.row_interval.is_past(&cell.key.row) {
                    self.done = true;
                    return None;
                }
                self.start_row(&cell.key.row);
            }

            if context.spec.row_interval.is_before(&cell.key.row) {
                continue;
            }

            if cell.is_delete() {
                self.record_tombstone(&cell.key);

                let emit = context.spec.return_deletes
                    || (context.retain_unexpired_deletes && !context.delete_expired(&cell.key));

                if emit && self.row_included {
                    if !self.count_row() {
                        return None;
                    }
                    return Some(Ok(cell));
                }
                continue;
            }

            if !self.row_included || !context.family_allowed(cell.key.family) {
                continue;
            }

            if self.masked(&cell.key) {
                continue;
            }

            let (ts_start, ts_end) = context.spec.time_interval;
            if cell.key.timestamp < ts_start || cell.key.timestamp >= ts_end {
                continue;
            }

            if cell.key.timestamp < context.family_ttl_cutoff[usize::from(cell.key.family)] {
                continue;
            }

            if !context.qualifier_allowed(cell.key.family, &cell.key.qualifier) {
                continue;
            }

            if context.before_cell_start(&cell.key) {
                continue;
            }
            if context.past_cell_end(&cell.key) {
                self.done = true;
                return None;
            }

            let same_cell = self
                .version_key
                .as_ref()
                .is_some_and(|(family, qualifier)| {
                    *family == cell.key.family && qualifier == &cell.key.qualifier
                });

            if same_cell {
                self.version_count += 1;
            } else {
                self.version_key = Some((cell.key.family, cell.key.qualifier.clone()));
                self.version_count = 1;
            }

            let max_versions = context.family_max_versions[usize::from(cell.key.family)];
            if max_versions > 0 && self.version_count > max_versions {
                continue;
            }

            if !context.value_matches(&cell.value) {
                continue;
            }

            if !self.count_row() {
                return None;
            }

            if context.spec.keys_only {
                cell.value = Slice::empty();
            }

            return Some(Ok(cell));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn schema() -> Schema {
        Schema::parse_simple("1", &[("default", &["x", "y"])]).expect("should build")
    }

    fn filter(cells: Vec<Cell>, spec: ScanSpec) -> Vec<Cell> {
        let context = Arc::new(ScanContext::new(spec, &schema(), 0).expect("should compile"));
        let iter = Box::new(cells.into_iter().map(Ok));
        ScanFilter::new(iter, context)
            .collect::<crate::Result<Vec<_>>>()
            .expect("should not fail")
    }

    fn sorted(mut cells: Vec<Cell>) -> Vec<Cell> {
        cells.sort();
        cells
    }

    #[test]
    fn scan_filter_tombstone_masks_older_insert() {
        let cells = sorted(vec![
            Cell::new(Key::insert("r", 1, "", 10, 1), "v"),
            Cell::new(Key::delete_cell("r", 1, "", 20, 2), ""),
        ]);

        let out = filter(cells, ScanSpec::default());
        assert!(out.is_empty());
    }

    #[test]
    fn scan_filter_tombstone_spares_newer_insert() {
        let cells = sorted(vec![
            Cell::new(Key::insert("r", 1, "", 30, 3), "new"),
            Cell::new(Key::delete_cell("r", 1, "", 20, 2), ""),
            Cell::new(Key::insert("r", 1, "", 10, 1), "old"),
        ]);

        let out = filter(cells, ScanSpec::default());
        assert_eq!(1, out.len());
        assert_eq!(b"new", &*out[0].value);
    }

    #[test]
    fn scan_filter_row_tombstone_masks_all_families() {
        let cells = sorted(vec![
            Cell::new(Key::delete_row("r", 50, 5), ""),
            Cell::new(Key::insert("r", 1, "a", 10, 1), "x"),
            Cell::new(Key::insert("r", 2, "b", 20, 2), "y"),
            Cell::new(Key::insert("s", 1, "", 10, 1), "survives"),
        ]);

        let out = filter(cells, ScanSpec::default());
        assert_eq!(1, out.len());
        assert_eq!(b"s", &*out[0].key.row);
    }

    #[test]
    fn scan_filter_max_versions() {
        let cells = sorted(vec![
            Cell::new(Key::insert("r", 1, "q", 30, 3), "v3"),
            Cell::new(Key::insert("r", 1, "q", 20, 2), "v2"),
            Cell::new(Key::insert("r", 1, "q", 10, 1), "v1"),
        ]);

        let spec = ScanSpec {
            max_versions: 2,
            ..Default::default()
        };

        let out = filter(cells, spec);
        assert_eq!(2, out.len());
        assert_eq!(b"v3", &*out[0].value);
        assert_eq!(b"v2", &*out[1].value);
    }

    #[test]
    fn scan_filter_columns() {
        let cells = sorted(vec![
            Cell::new(Key::insert("r", 1, "", 10, 1), "fam-x"),
            Cell::new(Key::insert("r", 2, "", 10, 2), "fam-y"),
        ]);

        let spec = ScanSpec {
            columns: vec!["y".into()],
            ..Default::default()
        };

        let out = filter(cells, spec);
        assert_eq!(1, out.len());
        assert_eq!(b"fam-y", &*out[0].value);
    }

    #[test]
    fn scan_filter_time_interval() {
        let cells = sorted(vec![
            Cell::new(Key::insert("r", 1, "a", 5, 1), "old"),
            Cell::new(Key::insert("r", 1, "b", 15, 2), "mid"),
            Cell::new(Key::insert("r", 1, "c", 25, 3), "new"),
        ]);

        let spec = ScanSpec {
            time_interval: (10, 20),
            ..Default::default()
        };

        let out = filter(cells, spec);
        assert_eq!(1, out.len());
        assert_eq!(b"mid", &*out[0].value);
    }

    #[test]
    fn scan_filter_row_limit() {
        let cells = sorted(vec![
            Cell::new(Key::insert("a", 1, "", 10, 1), "1"),
            Cell::new(Key::insert("b", 1, "", 10, 2), "2"),
            Cell::new(Key::insert("c", 1, "", 10, 3), "3"),
        ]);

        let spec = ScanSpec {
            row_limit: 2,
            ..Default::default()
        };

        let out = filter(cells, spec);
        assert_eq!(2, out.len());
        assert_eq!(b"b", &*out[1].key.row);
    }

    #[test]
    fn scan_filter_row_regex() {
        let cells = sorted(vec![
            Cell::new(Key::insert("apple", 1, "", 10, 1), "1"),
            Cell::new(Key::insert("banana", 1, "", 10, 2), "2"),
            Cell::new(Key::insert("avocado", 1, "", 10, 3), "3"),
        ]);

        let spec = ScanSpec {
            row_regex: Some("^a".into()),
            ..Default::default()
        };

        let out = filter(cells, spec);
        assert_eq!(2, out.len());
    }

    #[test]
    fn scan_filter_return_deletes() {
        let cells = sorted(vec![
            Cell::new(Key::delete_cell("r", 1, "", 20, 2), ""),
            Cell::new(Key::insert("r", 1, "", 10, 1), "v"),
        ]);

        let spec = ScanSpec {
            return_deletes: true,
            ..Default::default()
        };

        let out = filter(cells, spec);
        assert_eq!(1, out.len());
        assert!(out[0].is_delete());
    }

    #[test]
    fn scan_filter_drops_exact_duplicates() {
        let cell = Cell::new(Key::insert("r", 1, "q", 10, 5), "v");

        let sources: Vec<CellListScanner> = vec![
            Box::new(vec![cell.clone()].into_iter().map(Ok)),
            Box::new(vec![cell].into_iter().map(Ok)),
        ];
        let merge = MergeScanner::new(sources);

        let context =
            Arc::new(ScanContext::new(ScanSpec::default(), &schema(), 0).expect("should compile"));
        let out = ScanFilter::new(merge, context)
            .collect::<crate::Result<Vec<_>>>()
            .expect("should not fail");

        assert_eq!(1, out.len());
    }

    #[test]
    fn merge_scanner_interleaves_sources() {
        let a = vec![
            Cell::new(Key::insert("a", 1, "", 10, 1), "1"),
            Cell::new(Key::insert("c", 1, "", 10, 3), "3"),
        ];
        let b = vec![
            Cell::new(Key::insert("b", 1, "", 10, 2), "2"),
            Cell::new(Key::insert("d", 1, "", 10, 4), "4"),
        ];

        let merge = MergeScanner::new(vec![
            Box::new(a.into_iter().map(Ok)),
            Box::new(b.into_iter().map(Ok)),
        ]);

        let rows: Vec<Vec<u8>> = merge
            .collect::<crate::Result<Vec<_>>>()
            .expect("should merge")
            .iter()
            .map(|c| c.key.row.to_vec())
            .collect();

        assert_eq!(
            vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()],
            rows
        );
    }

    #[test]
    fn cell_cache_scanner_with_start() {
        let cache = Arc::new(CellCache::new());
        for row in ["a", "b", "c"] {
            cache.add(Cell::new(Key::insert(row, 1, "", 10, 1), "v"));
        }

        let scanner = CellCacheScanner::new(cache, Some(row_probe_key(b"b")));
        let rows: Vec<Vec<u8>> = scanner
            .collect::<crate::Result<Vec<_>>>()
            .expect("should scan")
            .iter()
            .map(|c| c.key.row.to_vec())
            .collect();

        assert_eq!(vec![b"b".to_vec(), b"c".to_vec()], rows);
    }
}
