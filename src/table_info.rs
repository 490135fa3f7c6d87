// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    commit_log::CommitLog,
    range::{Range, RangeSpec},
    schema::{Schema, TableIdentifier},
};
use rustc_hash::FxHashMap;
use std::{
    collections::BTreeMap,
    ops::Bound::{Included, Unbounded},
    sync::{Arc, Mutex},
};

/// All loaded ranges of one table, sorted by end row
///
/// The set of live ranges partitions the table's key space: a row lookup
/// finds the first range whose end row is `>=` the row and checks that the
/// row lies past the range's start.
pub struct TableInfo {
    table_id: Arc<str>,
    schema: Mutex<Arc<Schema>>,
    ranges: Mutex<BTreeMap<Vec<u8>, Arc<Range>>>,
}

impl TableInfo {
    /// Creates an empty table registry.
    #[must_use]
    pub fn new(table_id: Arc<str>, schema: Arc<Schema>) -> Self {
        Self {
            table_id,
            schema: Mutex::new(schema),
            ranges: Mutex::new(BTreeMap::new()),
        }
    }

    /// Table id.
    #[must_use]
    pub fn table_id(&self) -> &Arc<str> {
        &self.table_id
    }

    /// Current schema.
    #[must_use]
    pub fn schema(&self) -> Arc<Schema> {
        #[allow(clippy::expect_used)]
        self.schema.lock().expect("lock is poisoned").clone()
    }

    /// Installs a newer schema.
    pub fn set_schema(&self, schema: Arc<Schema>) {
        #[allow(clippy::expect_used)]
        let mut slot = self.schema.lock().expect("lock is poisoned");
        *slot = schema;
    }

    /// Registers a range.
    ///
    /// # Panics
    ///
    /// Panics if a range with the same end row is already registered; live
    /// ranges must partition the key space.
    pub fn add_range(&self, range: Arc<Range>) {
        #[allow(clippy::expect_used)]
        let mut ranges = self.ranges.lock().expect("lock is poisoned");

        let end_row = range.spec().end_row.to_vec();
        let previous = ranges.insert(end_row, range);
        assert!(previous.is_none(), "duplicate end row in table range map");
    }

    /// Finds the range containing `row`.
    #[must_use]
    pub fn find_range(&self, row: &[u8]) -> Option<Arc<Range>> {
        #[allow(clippy::expect_used)]
        let ranges = self.ranges.lock().expect("lock is poisoned");

        let (_, range) = ranges.range::<[u8], _>((Included(row), Unbounded)).next()?;

        let spec = range.spec();

        // An empty probe row addresses the first range of the table
        if spec.contains(row) || (row.is_empty() && spec.start_row.is_empty()) {
            Some(range.clone())
        } else {
            None
        }
    }

    /// Removes the range with the given end row.
    pub fn remove_range(&self, end_row: &[u8]) -> Option<Arc<Range>> {
        #[allow(clippy::expect_used)]
        let mut ranges = self.ranges.lock().expect("lock is poisoned");
        ranges.remove(end_row)
    }

    /// All ranges, ordered by end row.
    #[must_use]
    pub fn ranges(&self) -> Vec<Arc<Range>> {
        #[allow(clippy::expect_used)]
        let ranges = self.ranges.lock().expect("lock is poisoned");
        ranges.values().cloned().collect()
    }

    /// Number of loaded ranges.
    #[must_use]
    pub fn len(&self) -> usize {
        #[allow(clippy::expect_used)]
        self.ranges.lock().expect("lock is poisoned").len()
    }

    /// Returns `true` if the table has no loaded ranges.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Atomically replaces the pre-split range entry with the two halves.
    pub fn replace_after_split(
        &self,
        old_spec: &RangeSpec,
        kept: Arc<Range>,
        new_range: Arc<Range>,
    ) {
        #[allow(clippy::expect_used)]
        let mut ranges = self.ranges.lock().expect("lock is poisoned");

        ranges.remove(&old_spec.end_row.to_vec());
        ranges.insert(kept.spec().end_row.to_vec(), kept);
        ranges.insert(new_range.spec().end_row.to_vec(), new_range);
    }
}

/// Server-global registry of tables, keyed by table id
#[derive(Default)]
pub struct TableInfoMap {
    tables: Mutex<FxHashMap<Arc<str>, Arc<TableInfo>>>,
}

impl TableInfoMap {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FxHashMap<Arc<str>, Arc<TableInfo>>> {
        #[allow(clippy::expect_used)]
        self.tables.lock().expect("lock is poisoned")
    }

    /// Looks up a table.
    pub fn get(&self, table_id: &str) -> crate::Result<Arc<TableInfo>> {
        self.lock()
            .get(table_id)
            .cloned()
            .ok_or_else(|| crate::Error::TableNotFound(table_id.into()))
    }

    /// Looks up a table, creating its registry with the given schema when
    /// missing.
    pub fn get_or_create(&self, table: &TableIdentifier, schema: &Arc<Schema>) -> Arc<TableInfo> {
        let mut tables = self.lock();
        tables
            .entry(table.id.clone())
            .or_insert_with(|| Arc::new(TableInfo::new(table.id.clone(), schema.clone())))
            .clone()
    }

    /// Removes a table and returns its ranges for teardown.
    pub fn remove(&self, table_id: &str) -> crate::Result<Vec<Arc<Range>>> {
        let info = self
            .lock()
            .remove(table_id)
            .ok_or_else(|| crate::Error::TableNotFound(table_id.into()))?;
        Ok(info.ranges())
    }

    /// Finds the range of a table containing `row`.
    pub fn find_range(&self, table_id: &str, row: &[u8]) -> crate::Result<Arc<Range>> {
        let info = self.get(table_id)?;
        info.find_range(row).ok_or_else(|| {
            crate::Error::RangeNotFound(format!(
                "{table_id}: no range covers row {:?}",
                String::from_utf8_lossy(row)
            ))
        })
    }

    /// All loaded ranges across all tables.
    #[must_use]
    pub fn all_ranges(&self) -> Vec<Arc<Range>> {
        let tables: Vec<Arc<TableInfo>> = self.lock().values().cloned().collect();
        tables.iter().flat_map(|info| info.ranges()).collect()
    }

    /// All tables.
    #[must_use]
    pub fn all_tables(&self) -> Vec<Arc<TableInfo>> {
        self.lock().values().cloned().collect()
    }

    /// Atomically replaces a split range with its halves.
    pub fn replace_after_split(
        &self,
        table: &TableIdentifier,
        old_spec: &RangeSpec,
        kept: Arc<Range>,
        new_range: Arc<Range>,
    ) -> crate::Result<()> {
        let info = self.get(&table.id)?;
        info.replace_after_split(old_spec, kept, new_range);
        Ok(())
    }

    /// Merges a staged replay map into this one, linking the replay log
    /// into the live commit log so its revisions stay replayable.
    pub fn atomic_merge(
        &self,
        staged: &Self,
        user_log: &CommitLog,
        replay_log: &str,
        latest_revision: crate::key::Revision,
    ) -> crate::Result<()> {
        {
            let staged_tables: Vec<Arc<TableInfo>> = staged.lock().values().cloned().collect();
            let mut tables = self.lock();

            for staged_info in staged_tables {
                let info = tables
                    .entry(staged_info.table_id().clone())
                    .or_insert_with(|| {
                        Arc::new(TableInfo::new(
                            staged_info.table_id().clone(),
                            staged_info.schema(),
                        ))
                    })
                    .clone();

                for range in staged_info.ranges() {
                    info.add_range(range);
                }
            }
        }

        user_log.link_log(replay_log, latest_revision)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    // Range construction needs a full server context, so the map logic is
    // exercised through the server tests; the pure lookup logic is covered
    // here with the bound arithmetic only.

    #[test]
    fn table_info_map_unknown_table() {
        let map = TableInfoMap::new();
        assert!(matches!(
            map.get("nope"),
            Err(crate::Error::TableNotFound(_))
        ));
        assert!(matches!(
            map.find_range("nope", b"row"),
            Err(crate::Error::TableNotFound(_))
        ));
    }
}
