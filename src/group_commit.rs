// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    cell::Cell,
    flyweight::FlyweightString,
    schema::{Schema, TableIdentifier},
};
use rustc_hash::FxHashMap;
use std::sync::Mutex;

/// Update flag: skip the durable flush after the log append for this batch
pub const UPDATE_FLAG_NO_LOG_SYNC: u32 = 0x01;

/// One client update batch awaiting commit
pub struct UpdateRequest {
    /// Decoded mutations
    pub cells: Vec<Cell>,

    /// `UPDATE_FLAG_*` bits
    pub flags: u32,

    /// Where the commit outcome is reported; `None` for fire-and-forget
    pub responder: Option<crossbeam_channel::Sender<crate::Result<()>>>,
}

struct TableUpdate {
    table: TableIdentifier,
    commit_iteration: u32,
    total_cells: usize,
    total_bytes: u64,
    requests: Vec<UpdateRequest>,
}

struct GroupCommitState {
    counter: u32,
    table_map: FxHashMap<TableIdentifier, TableUpdate>,
}

/// Coalesces updates per table and releases each table's batch every
/// schema-declared number of global commit ticks
pub struct GroupCommit {
    state: Mutex<GroupCommitState>,
    flyweight: FlyweightString,
    commit_interval_ms: u32,
}

impl GroupCommit {
    /// Creates a batcher driven by the global commit interval.
    #[must_use]
    pub fn new(commit_interval_ms: u32) -> Self {
        Self {
            state: Mutex::new(GroupCommitState {
                counter: 0,
                table_map: FxHashMap::default(),
            }),
            flyweight: FlyweightString::default(),
            commit_interval_ms: commit_interval_ms.max(1),
        }
    }

    /// Adds a request to its table's accumulating batch.
    pub fn add(&self, table: &TableIdentifier, schema: &Schema, request: UpdateRequest) {
        #[allow(clippy::expect_used)]
        let mut state = self.state.lock().expect("lock is poisoned");

        let bytes: u64 = request.cells.iter().map(|c| c.encoded_len() as u64).sum();
        let cells = request.cells.len();

        if let Some(entry) = state.table_map.get_mut(table) {
            entry.total_cells += cells;
            entry.total_bytes += bytes;
            entry.requests.push(request);
            return;
        }

        let interned = TableIdentifier {
            id: self.flyweight.get(&table.id),
            generation: table.generation,
        };

        let commit_iteration =
            schema.group_commit_interval_ms.div_ceil(self.commit_interval_ms).max(1);

        state.table_map.insert(
            interned.clone(),
            TableUpdate {
                table: interned,
                commit_iteration,
                total_cells: cells,
                total_bytes: bytes,
                requests: vec![request],
            },
        );
    }

    /// One global commit tick: removes and returns every table batch whose
    /// interval divides the tick counter.
    #[must_use]
    pub fn trigger(&self) -> Vec<(TableIdentifier, Vec<UpdateRequest>)> {
        #[allow(clippy::expect_used)]
        let mut state = self.state.lock().expect("lock is poisoned");

        state.counter += 1;
        let counter = state.counter;

        let due: Vec<TableIdentifier> = state
            .table_map
            .iter()
            .filter(|(_, update)| counter % update.commit_iteration == 0)
            .map(|(table, _)| table.clone())
            .collect();

        due.into_iter()
            .filter_map(|table| {
                let update = state.table_map.remove(&table)?;
                log::debug!(
                    "Group commit releasing {} requests ({} cells, {} bytes) for table {}",
                    update.requests.len(),
                    update.total_cells,
                    update.total_bytes,
                    update.table
                );
                Some((update.table, update.requests))
            })
            .collect()
    }

    /// Number of tables with an accumulating batch.
    #[must_use]
    pub fn len(&self) -> usize {
        #[allow(clippy::expect_used)]
        self.state.lock().expect("lock is poisoned").table_map.len()
    }

    /// Returns `true` if no batches are pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::Key;
    use test_log::test;

    fn schema(interval_ms: u32) -> Schema {
        let mut schema = Schema::parse_simple("1", &[("default", &["x"])]).expect("should build");
        schema.group_commit_interval_ms = interval_ms;
        schema
    }

    fn request(row: &str) -> UpdateRequest {
        UpdateRequest {
            cells: vec![Cell::new(Key::insert(row, 1, "", 10, 0), "v")],
            flags: 0,
            responder: None,
        }
    }

    #[test]
    fn group_commit_flushes_every_k_ticks() {
        // Table interval 150ms over a 50ms global tick: every 3rd tick
        let group_commit = GroupCommit::new(50);
        let schema = schema(150);
        let table = TableIdentifier::new("1", 1);

        group_commit.add(&table, &schema, request("a"));
        group_commit.add(&table, &schema, request("b"));

        assert!(group_commit.trigger().is_empty(), "tick 1 must not flush");
        assert!(group_commit.trigger().is_empty(), "tick 2 must not flush");

        let batches = group_commit.trigger();
        assert_eq!(1, batches.len());
        assert_eq!(2, batches[0].1.len());
        assert!(group_commit.is_empty());

        // Nothing pending: further ticks release nothing
        assert!(group_commit.trigger().is_empty());
    }

    #[test]
    fn group_commit_zero_interval_flushes_every_tick() {
        let group_commit = GroupCommit::new(50);
        let schema = schema(0);
        let table = TableIdentifier::new("1", 1);

        group_commit.add(&table, &schema, request("a"));

        let batches = group_commit.trigger();
        assert_eq!(1, batches.len());
    }

    #[test]
    fn group_commit_interns_table_ids() {
        let group_commit = GroupCommit::new(50);
        let schema = schema(0);

        group_commit.add(&TableIdentifier::new("42", 1), &schema, request("a"));
        group_commit.add(&TableIdentifier::new("42", 1), &schema, request("b"));

        assert_eq!(1, group_commit.len());
        assert_eq!(1, group_commit.flyweight.len());
    }

    #[test]
    fn group_commit_every_add_lands_in_flush() {
        let group_commit = GroupCommit::new(50);
        let schema = schema(100); // every 2nd tick
        let table = TableIdentifier::new("1", 1);

        group_commit.add(&table, &schema, request("a"));
        let _ = group_commit.trigger(); // tick 1: nothing
        group_commit.add(&table, &schema, request("b"));

        let batches = group_commit.trigger(); // tick 2: both
        assert_eq!(1, batches.len());
        assert_eq!(2, batches[0].1.len());
    }
}
