// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    cell_cache::CellCache,
    cell_store::{BlockCache, CellStore, CellStoreWriter, CellStoreWriterOptions},
    fs::Filesystem,
    key::{Key, Revision, Timestamp},
    scanner::{CellCacheScanner, CellListScanner, MergeScanner, ScanContext, ScanFilter, ScanSpec},
    schema::{AccessGroupSpec, Schema},
    Slice,
};
use std::sync::Arc;

/// What kind of compaction to run
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CompactionKind {
    /// Drain the frozen cell cache into a new store
    Minor,

    /// Merge the frozen cache and the newest `n` stores
    Merging(usize),

    /// Merge everything into a single store, retiring tombstones
    Major,
}

/// Per-access-group numbers the maintenance prioritizer consumes
#[derive(Clone, Copy, Debug)]
pub struct AccessGroupMaintenanceData<'a> {
    /// Access group name, arena-allocated for the cycle
    pub name: &'a str,

    /// Bytes in the live cell cache
    pub cache_mem: u64,

    /// Bytes in the frozen snapshot awaiting compaction
    pub shadow_cache_mem: u64,

    /// Bytes of loaded block indexes
    pub index_mem: u64,

    /// Bytes of loaded bloom filters
    pub filter_mem: u64,

    /// Bytes a compaction would move out of memory
    pub compactable_memory: u64,

    /// Bytes on disk across all stores
    pub disk_usage: u64,

    /// Lowest revision still cached; `i64::MAX` when nothing is cached
    pub earliest_cached_revision: Revision,

    /// Number of cell stores
    pub store_count: usize,
}

/// Groups the column families stored together for one range: one cell cache
/// (plus at most one frozen snapshot) and an ordered list of cell stores,
/// newest first
pub struct AccessGroup {
    spec: AccessGroupSpec,
    family_ids: Vec<u8>,
    dir: String,
    table_generation: u32,

    cell_cache: Arc<CellCache>,
    immutable_cache: Option<Arc<CellCache>>,
    stores: Vec<Arc<CellStore>>,
    next_store_id: u64,
}

impl AccessGroup {
    /// Creates an empty access group writing its stores under `dir`.
    pub fn new(
        spec: AccessGroupSpec,
        family_ids: Vec<u8>,
        dir: String,
        table_generation: u32,
    ) -> Self {
        Self {
            spec,
            family_ids,
            dir,
            table_generation,
            cell_cache: Arc::new(CellCache::new()),
            immutable_cache: None,
            stores: vec![],
            next_store_id: 0,
        }
    }

    /// Reopens the cell stores found in the group's directory, newest first.
    pub fn load_stores(
        &mut self,
        fs: &Arc<dyn Filesystem>,
        block_cache: Option<&Arc<BlockCache>>,
    ) -> crate::Result<()> {
        if !fs.exists(&self.dir)? {
            return Ok(());
        }

        let mut ids: Vec<u64> = fs
            .readdir(&self.dir)?
            .iter()
            .filter_map(|name| name.strip_prefix("cs").and_then(|n| n.parse().ok()))
            .collect();
        ids.sort_unstable_by(|a, b| b.cmp(a));

        for id in &ids {
            let path = format!("{}/cs{id}", self.dir);
            let store = CellStore::open(fs.clone(), &path, block_cache.cloned())?;
            self.stores.push(store);
        }

        self.next_store_id = ids.first().map(|id| id + 1).unwrap_or_default();

        Ok(())
    }

    /// Access group name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// Column family codes routed to this group.
    #[must_use]
    pub fn family_ids(&self) -> &[u8] {
        &self.family_ids
    }

    /// Returns `true` if the given family belongs to this group.
    #[must_use]
    pub fn owns_family(&self, family: u8) -> bool {
        // Row tombstones carry family 0 and go to every group
        family == 0 || self.family_ids.contains(&family)
    }

    /// Inserts a cell into the live cache.
    pub fn add(&self, cell: crate::Cell) {
        self.cell_cache.add(cell);
    }

    /// The live cell cache.
    #[must_use]
    pub fn cell_cache(&self) -> &Arc<CellCache> {
        &self.cell_cache
    }

    /// Current cell stores, newest first.
    #[must_use]
    pub fn stores(&self) -> &[Arc<CellStore>] {
        &self.stores
    }

    /// Bytes on disk across all stores.
    #[must_use]
    pub fn disk_usage(&self) -> u64 {
        self.stores.iter().map(|s| s.disk_usage()).sum()
    }

    /// Lowest revision still held in memory; `i64::MAX` when nothing is
    /// cached. The commit log may purge everything below the minimum of
    /// this value across all ranges.
    #[must_use]
    pub fn earliest_cached_revision(&self) -> Revision {
        let mut earliest = self.cell_cache.earliest_revision();
        if let Some(immutable) = &self.immutable_cache {
            earliest = earliest.min(immutable.earliest_revision());
        }
        earliest
    }

    /// Cell sources for a scan: live cache, frozen snapshot if a compaction
    /// is in flight, then each store newest to oldest.
    pub fn create_sources(&self, start: Option<&Key>) -> crate::Result<Vec<CellListScanner>> {
        let mut sources: Vec<CellListScanner> = vec![];

        sources.push(Box::new(CellCacheScanner::new(
            self.cell_cache.clone(),
            start.cloned(),
        )));

        if let Some(immutable) = &self.immutable_cache {
            sources.push(Box::new(CellCacheScanner::new(
                immutable.clone(),
                start.cloned(),
            )));
        }

        let start_bytes = start.map(Key::encode);
        for store in &self.stores {
            sources.push(Box::new(store.scanner(start_bytes.as_deref())?));
        }

        Ok(sources)
    }

    /// Freezes the live cache for compaction, opening a fresh one for
    /// writes. A no-op while a previous snapshot is still being drained or
    /// when the cache is empty.
    pub fn snapshot(&mut self) {
        if self.immutable_cache.is_some() || self.cell_cache.is_empty() {
            return;
        }

        let frozen = std::mem::replace(&mut self.cell_cache, Arc::new(CellCache::new()));
        log::debug!(
            "Snapshotted cell cache of {:?} ({} cells, {} bytes)",
            self.spec.name,
            frozen.len(),
            frozen.mem_used()
        );
        self.immutable_cache = Some(frozen);
    }

    /// Writer settings for split-half stores.
    #[must_use]
    pub fn split_writer_options(&self) -> CellStoreWriterOptions {
        self.writer_options(false, true)
    }

    fn writer_options(&self, major: bool, split: bool) -> CellStoreWriterOptions {
        CellStoreWriterOptions {
            block_size: self.spec.blocksize,
            compressor: self.spec.compressor,
            bloom_mode: self.spec.bloom_mode,
            table_generation: self.table_generation,
            major,
            split,
        }
    }

    /// Runs a compaction, publishing the new store atomically and retiring
    /// its inputs. Returns `false` when there was nothing to compact.
    pub fn compact(
        &mut self,
        fs: &Arc<dyn Filesystem>,
        block_cache: Option<&Arc<BlockCache>>,
        kind: CompactionKind,
        schema: &Schema,
        row_interval: &crate::scanner::RowInterval,
        now: Timestamp,
    ) -> crate::Result<bool> {
        self.snapshot();

        let (merged_stores, keep_deletes) = match kind {
            CompactionKind::Minor => (0, true),
            CompactionKind::Merging(n) => (n.min(self.stores.len()), true),
            CompactionKind::Major => (self.stores.len(), false),
        };

        let Some(snapshot) = self.immutable_cache.clone() else {
            if merged_stores == 0 {
                return Ok(false);
            }
            return self.compact_stores(
                fs,
                block_cache,
                merged_stores,
                keep_deletes,
                schema,
                row_interval,
                now,
            );
        };

        let path = format!("{}/cs{}", self.dir, self.next_store_id);
        let mut writer = CellStoreWriter::create(
            fs.clone(),
            &path,
            self.writer_options(kind == CompactionKind::Major, false),
        )?;

        if merged_stores == 0 {
            // Minor: drain the snapshot verbatim, clamped to the interval
            let mut cursor: Option<Key> = None;
            while let Some(cell) = snapshot.next_after(cursor.as_ref()) {
                cursor = Some(cell.key.clone());
                if row_interval.is_before(&cell.key.row) || row_interval.is_past(&cell.key.row) {
                    continue;
                }
                writer.add(&cell)?;
            }
        } else {
            let mut sources: Vec<CellListScanner> =
                vec![Box::new(CellCacheScanner::new(snapshot.clone(), None))];
            for store in self.stores.iter().take(merged_stores) {
                sources.push(Box::new(store.scanner(None)?));
            }

            let stream = compaction_stream(sources, keep_deletes, schema, row_interval, now)?;
            for cell in stream {
                writer.add(&cell?)?;
            }
        }

        let cell_count = writer.cell_count();
        writer.finish()?;

        let new_store = CellStore::open(fs.clone(), &path, block_cache.cloned())?;
        let retired: Vec<Arc<CellStore>> = self.stores.drain(..merged_stores).collect();
        self.stores.insert(0, new_store);
        self.immutable_cache = None;
        self.next_store_id += 1;

        log::info!(
            "Compacted {:?} ({kind:?}): {} cells into {path:?}, retired {} stores",
            self.spec.name,
            cell_count,
            retired.len()
        );

        for store in retired {
            let path = store.path().to_owned();
            drop(store);
            if let Err(e) = fs.remove(&path) {
                log::error!("Problem removing retired store {path:?}: {e}");
            }
        }

        Ok(true)
    }

    fn compact_stores(
        &mut self,
        fs: &Arc<dyn Filesystem>,
        block_cache: Option<&Arc<BlockCache>>,
        merged_stores: usize,
        keep_deletes: bool,
        schema: &Schema,
        row_interval: &crate::scanner::RowInterval,
        now: Timestamp,
    ) -> crate::Result<bool> {
        if merged_stores < 2 && keep_deletes {
            // Rewriting a single store without dropping anything is futile
            return Ok(false);
        }
        if self.stores.is_empty() {
            return Ok(false);
        }

        let path = format!("{}/cs{}", self.dir, self.next_store_id);
        let mut writer =
            CellStoreWriter::create(fs.clone(), &path, self.writer_options(!keep_deletes, false))?;

        let mut sources: Vec<CellListScanner> = vec![];
        for store in self.stores.iter().take(merged_stores) {
            sources.push(Box::new(store.scanner(None)?));
        }

        let stream = compaction_stream(sources, keep_deletes, schema, row_interval, now)?;
        for cell in stream {
            writer.add(&cell?)?;
        }

        writer.finish()?;

        let new_store = CellStore::open(fs.clone(), &path, block_cache.cloned())?;
        let retired: Vec<Arc<CellStore>> = self.stores.drain(..merged_stores).collect();
        self.stores.insert(0, new_store);
        self.next_store_id += 1;

        for store in retired {
            let path = store.path().to_owned();
            drop(store);
            if let Err(e) = fs.remove(&path) {
                log::error!("Problem removing retired store {path:?}: {e}");
            }
        }

        Ok(true)
    }

    /// Swaps the group's store list for the stores found in `dir`, keeping
    /// the caches. Used when a split shrinks a range to one half: the cache
    /// may still hold rows outside the narrowed interval, which scans and
    /// compactions clamp away.
    pub fn adopt_split_half(
        &mut self,
        fs: &Arc<dyn Filesystem>,
        block_cache: Option<&Arc<BlockCache>>,
        dir: String,
    ) -> crate::Result<()> {
        self.dir = dir;
        self.stores.clear();
        self.next_store_id = 0;
        self.load_stores(fs, block_cache)
    }

    /// Drops loaded block indexes and bloom filters, returning the bytes
    /// released.
    pub fn purge_memory(&mut self) -> u64 {
        self.stores.iter().map(|s| s.purge_memory()).sum()
    }

    /// Candidate split rows: the median row of each store's block index.
    #[must_use]
    pub fn split_row_candidates(&self) -> Vec<Slice> {
        let mut rows = vec![];
        for store in &self.stores {
            if let Ok(Some(row)) = store.median_row() {
                rows.push(row);
            }
        }
        if rows.is_empty() {
            if let Some(row) = self.cell_cache.middle_row() {
                rows.push(row);
            }
        }
        rows
    }

    /// Gathers this group's numbers for a maintenance cycle.
    #[must_use]
    pub fn get_maintenance_data<'a>(
        &self,
        arena: &'a bumpalo::Bump,
    ) -> AccessGroupMaintenanceData<'a> {
        let cache_mem = self.cell_cache.mem_used();
        let shadow_cache_mem = self
            .immutable_cache
            .as_ref()
            .map(|c| c.mem_used())
            .unwrap_or_default();
        let index_mem: u64 = self.stores.iter().map(|s| s.index_memory()).sum();
        let filter_mem: u64 = self.stores.iter().map(|s| s.filter_memory()).sum();

        AccessGroupMaintenanceData {
            name: arena.alloc_str(&self.spec.name),
            cache_mem,
            shadow_cache_mem,
            index_mem,
            filter_mem,
            compactable_memory: cache_mem + shadow_cache_mem,
            disk_usage: self.disk_usage(),
            earliest_cached_revision: self.earliest_cached_revision(),
            store_count: self.stores.len(),
        }
    }
}

/// Builds the merged, compaction-filtered stream over the given sources.
///
/// Partial merges keep every tombstone (it may mask cells in stores left
/// out of the merge). A full merge keeps a tombstone only until its
/// family's TTL retires it.
fn compaction_stream(
    sources: Vec<CellListScanner>,
    keep_deletes: bool,
    schema: &Schema,
    row_interval: &crate::scanner::RowInterval,
    now: Timestamp,
) -> crate::Result<ScanFilter<MergeScanner>> {
    let spec = ScanSpec {
        return_deletes: keep_deletes,
        row_interval: row_interval.clone(),
        ..Default::default()
    };

    let mut context = ScanContext::new(spec, schema, now)?;
    if !keep_deletes {
        context = context.with_retained_unexpired_deletes();
    }

    Ok(ScanFilter::new(MergeScanner::new(sources), Arc::new(context)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{fs::LocalBroker, Cell};
    use test_log::test;

    fn schema() -> Schema {
        Schema::parse_simple("1", &[("default", &["x"])]).expect("should build")
    }

    fn group(dir: &str) -> AccessGroup {
        let schema = schema();
        AccessGroup::new(
            schema.access_groups[0].clone(),
            vec![1],
            dir.into(),
            schema.generation,
        )
    }

    fn whole() -> crate::scanner::RowInterval {
        crate::scanner::RowInterval::whole_table()
    }

    fn collect_rows(ag: &AccessGroup) -> crate::Result<Vec<Vec<u8>>> {
        let sources = ag.create_sources(None)?;
        let merged = MergeScanner::new(sources).collect::<crate::Result<Vec<_>>>()?;
        Ok(merged.iter().map(|c| c.key.row.to_vec()).collect())
    }

    #[test]
    fn access_group_snapshot_isolation() {
        let mut ag = group("t/1/ag");

        ag.add(Cell::new(Key::insert("a", 1, "", 10, 1), "v1"));
        ag.snapshot();
        ag.add(Cell::new(Key::insert("b", 1, "", 10, 2), "v2"));

        // Snapshot holds only the pre-snapshot state
        let snapshot = ag.immutable_cache.clone().expect("snapshot exists");
        assert_eq!(1, snapshot.len());
        assert_eq!(1, ag.cell_cache().len());

        // Both remain visible to scans
        let rows = collect_rows(&ag).expect("should scan");
        assert_eq!(vec![b"a".to_vec(), b"b".to_vec()], rows);
    }

    #[test]
    fn access_group_minor_compaction() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let fs: Arc<dyn Filesystem> = Arc::new(LocalBroker::new(dir.path()));

        let mut ag = group("t/1/ag");
        for row in ["a", "b", "c"] {
            ag.add(Cell::new(Key::insert(row, 1, "", 10, 1), "v"));
        }

        let did = ag.compact(&fs, None, CompactionKind::Minor, &schema(), &whole(), 0)?;
        assert!(did);
        assert_eq!(1, ag.stores().len());
        assert!(ag.cell_cache().is_empty());
        assert_eq!(i64::MAX, ag.earliest_cached_revision());

        let rows = collect_rows(&ag)?;
        assert_eq!(vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()], rows);

        Ok(())
    }

    #[test]
    fn access_group_major_compaction_masks_but_keeps_fresh_tombstones() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let fs: Arc<dyn Filesystem> = Arc::new(LocalBroker::new(dir.path()));
        let schema = schema();

        let mut ag = group("t/1/ag");

        ag.add(Cell::new(Key::insert("r", 1, "", 10, 1), "old"));
        ag.compact(&fs, None, CompactionKind::Minor, &schema, &whole(), 0)?;

        ag.add(Cell::new(Key::delete_cell("r", 1, "", 20, 2), ""));
        ag.add(Cell::new(Key::insert("s", 1, "", 10, 3), "keep"));
        ag.compact(&fs, None, CompactionKind::Minor, &schema, &whole(), 0)?;
        assert_eq!(2, ag.stores().len());

        ag.compact(&fs, None, CompactionKind::Major, &schema, &whole(), 0)?;
        assert_eq!(1, ag.stores().len());

        // The masked insert is gone; the tombstone has no TTL to age it
        // out, so it survives the full merge
        let sources = ag.create_sources(None)?;
        let cells = MergeScanner::new(sources).collect::<crate::Result<Vec<_>>>()?;
        assert_eq!(2, cells.len());
        assert!(cells[0].is_delete());
        assert_eq!(b"r", &*cells[0].key.row);
        assert_eq!(b"s", &*cells[1].key.row);
        assert_eq!(b"keep", &*cells[1].value);

        Ok(())
    }

    #[test]
    fn access_group_major_compaction_retires_aged_tombstones() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let fs: Arc<dyn Filesystem> = Arc::new(LocalBroker::new(dir.path()));

        // One-second TTL; the merge runs at t=10s, so everything below
        // t=9s has aged out
        let mut schema = schema();
        schema.column_families[0].ttl_secs = 1;
        let now = 10_000_000_000;

        let mut ag = group("t/1/ag");

        ag.add(Cell::new(Key::insert("r", 1, "", 4_000_000_000, 1), "old"));
        ag.compact(&fs, None, CompactionKind::Minor, &schema, &whole(), 0)?;

        ag.add(Cell::new(Key::delete_cell("r", 1, "", 5_000_000_000, 2), ""));
        ag.add(Cell::new(Key::delete_cell("t", 1, "", 9_800_000_000, 3), ""));
        ag.add(Cell::new(Key::insert("s", 1, "", 9_900_000_000, 4), "keep"));
        ag.compact(&fs, None, CompactionKind::Minor, &schema, &whole(), 0)?;

        ag.compact(&fs, None, CompactionKind::Major, &schema, &whole(), now)?;
        assert_eq!(1, ag.stores().len());

        // The aged tombstone on "r" is retired with the cell it masked;
        // the fresh tombstone on "t" survives
        let sources = ag.create_sources(None)?;
        let cells = MergeScanner::new(sources).collect::<crate::Result<Vec<_>>>()?;
        assert_eq!(2, cells.len());
        assert_eq!(b"s", &*cells[0].key.row);
        assert!(cells[1].is_delete());
        assert_eq!(b"t", &*cells[1].key.row);

        Ok(())
    }

    #[test]
    fn access_group_reload_stores() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let fs: Arc<dyn Filesystem> = Arc::new(LocalBroker::new(dir.path()));

        {
            let mut ag = group("t/1/ag");
            ag.add(Cell::new(Key::insert("a", 1, "", 10, 1), "v"));
            ag.compact(&fs, None, CompactionKind::Minor, &schema(), &whole(), 0)?;
            ag.add(Cell::new(Key::insert("b", 1, "", 10, 2), "v"));
            ag.compact(&fs, None, CompactionKind::Minor, &schema(), &whole(), 0)?;
        }

        let mut ag = group("t/1/ag");
        ag.load_stores(&fs, None)?;
        assert_eq!(2, ag.stores().len());

        let rows = collect_rows(&ag)?;
        assert_eq!(vec![b"a".to_vec(), b"b".to_vec()], rows);

        Ok(())
    }
}
