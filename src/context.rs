// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    cell_store::BlockCache,
    commit_log::CommitLog,
    metalog::MetaLogWriter,
    range::RangeSpec,
    revision::RevisionCounter,
    schema::TableIdentifier,
    table_info::TableInfoMap,
    Config, Filesystem,
};
use rustc_hash::FxHashMap;
use std::sync::{Arc, Mutex};

/// Sink for METADATA table rows describing range locations
///
/// The real deployment routes these through the METADATA table's own range
/// server; [`InMemoryMetadata`] stands in for single-process use and tests.
pub trait MetadataWriter: Send + Sync {
    /// Upserts the row for `(table, end_row)`: its start row and location.
    fn record_range(
        &self,
        table: &TableIdentifier,
        spec: &RangeSpec,
        location: &str,
    ) -> crate::Result<()>;
}

/// [`MetadataWriter`] over a plain in-process map
#[derive(Default)]
pub struct InMemoryMetadata {
    rows: Mutex<FxHashMap<(String, Vec<u8>), (Vec<u8>, String)>>,
}

impl InMemoryMetadata {
    /// All recorded `(table, end_row) -> (start_row, location)` rows.
    #[must_use]
    pub fn rows(&self) -> Vec<((String, Vec<u8>), (Vec<u8>, String))> {
        #[allow(clippy::expect_used)]
        let rows = self.rows.lock().expect("lock is poisoned");
        let mut rows: Vec<_> = rows.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        rows.sort();
        rows
    }
}

impl MetadataWriter for InMemoryMetadata {
    fn record_range(
        &self,
        table: &TableIdentifier,
        spec: &RangeSpec,
        location: &str,
    ) -> crate::Result<()> {
        #[allow(clippy::expect_used)]
        let mut rows = self.rows.lock().expect("lock is poisoned");
        rows.insert(
            (table.id.to_string(), spec.end_row.to_vec()),
            (spec.start_row.to_vec(), location.into()),
        );
        Ok(())
    }
}

/// Everything the data plane shares: broker, logs, caches, registries
///
/// Passed explicitly to ranges and maintenance tasks instead of living in
/// process-global state.
pub struct ServerContext {
    /// Filesystem broker
    pub fs: Arc<dyn Filesystem>,

    /// Server configuration
    pub config: Config,

    /// Block cache shared by all cell stores
    pub block_cache: Arc<BlockCache>,

    /// Revision source for all updates
    pub revision: RevisionCounter,

    /// The user-table commit log
    pub user_log: Arc<CommitLog>,

    /// The range server's entity journal
    pub metalog: Arc<MetaLogWriter>,

    /// METADATA row sink
    pub metadata: Arc<dyn MetadataWriter>,

    /// All loaded tables and their ranges
    pub tables: TableInfoMap,

    /// Location string this server registers in METADATA rows
    pub location: String,
}
