// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The range server: dispatches every data-plane verb onto the owned
//! ranges.
//!
//! Startup rebuilds the server's state from the metalog (schemas, ranges,
//! in-flight splits) and replays the commit log into the cell caches. The
//! update path flows client batches through group commit, per-range
//! staging, a commit log append and the cell cache; scans compose per-range
//! merging scanners framed into scan blocks.

use crate::{
    access_group::CompactionKind,
    cell::Cell,
    cell_store::BlockCache,
    coding::Decode,
    commit_log::{CommitLog, CommitLogOptions, CommitLogReader},
    context::{InMemoryMetadata, ServerContext},
    fs::{Filesystem, OpenFlags},
    group_commit::{GroupCommit, UpdateRequest, UPDATE_FLAG_NO_LOG_SYNC},
    key::Revision,
    maintenance::{MaintenanceQueue, MaintenanceScheduler},
    metalog::{Entity, MetaLogReader, MetaLogWriter},
    range::{current_time_ns, Range, RangeSpec, RangeState},
    range_locator::{Locator, RangeLocation, RangeServerClient},
    revision::RevisionCounter,
    scanner::{ScanBlock, ScanSpec, ScannerMap},
    schema::{Schema, TableIdentifier},
    stop_signal::StopSignal,
    table_info::TableInfoMap,
    coding::Encode,
    Config,
};
use rustc_hash::{FxHashMap, FxHashSet};
use std::{
    sync::{Arc, Mutex, Weak},
    thread::JoinHandle,
    time::Duration,
};

const USER_LOG_DIR: &str = "logs/user";
const METALOG_DIR: &str = "logs/mml";
const METALOG_NAME: &str = "rs-mml";

/// Counters reported by `get_statistics`
#[derive(Clone, Debug, Default)]
pub struct ServerStatistics {
    /// Loaded ranges across all tables
    pub range_count: usize,

    /// Live server-side scanners
    pub scanner_count: usize,

    /// Bytes held by cell caches and snapshots
    pub cache_memory: u64,

    /// Bytes held by the block cache
    pub block_cache_memory: u64,

    /// Bytes on disk across all ranges
    pub disk_usage: u64,

    /// Highest assigned revision
    pub revision: Revision,
}

struct ReplayState {
    group: u32,
    staged: TableInfoMap,
    log: Arc<CommitLog>,
    log_dir: String,
    latest_revision: Revision,
}

/// The data-plane server: every RPC verb lands here
pub struct RangeServer {
    context: Arc<ServerContext>,
    scanners: ScannerMap,
    group_commit: GroupCommit,
    queue: Arc<MaintenanceQueue>,
    scheduler: Arc<MaintenanceScheduler>,
    stop: StopSignal,
    threads: Mutex<Vec<JoinHandle<()>>>,
    pending_ack: Mutex<FxHashSet<(Arc<str>, Vec<u8>)>>,
    schema_entity_ids: Mutex<FxHashMap<Arc<str>, u64>>,
    replay: Mutex<Option<ReplayState>>,
    metadata: Arc<InMemoryMetadata>,
}

impl RangeServer {
    /// Opens a server at the default location name.
    pub fn open(config: Config, fs: Arc<dyn Filesystem>) -> crate::Result<Arc<Self>> {
        Self::open_at(config, fs, "rs1")
    }

    /// Opens a server: recovers schemas, ranges and split progress from the
    /// metalog, replays the commit log, and starts the background workers.
    pub fn open_at(
        config: Config,
        fs: Arc<dyn Filesystem>,
        location: &str,
    ) -> crate::Result<Arc<Self>> {
        let snapshot = MetaLogReader::load(&fs, METALOG_DIR, METALOG_NAME)?;
        let metalog = Arc::new(MetaLogWriter::create(
            fs.clone(),
            METALOG_DIR,
            METALOG_NAME,
            &snapshot.entities,
        )?);

        let user_log = Arc::new(CommitLog::create(
            fs.clone(),
            USER_LOG_DIR,
            CommitLogOptions::from(&config),
        )?);

        let block_cache = Arc::new(BlockCache::with_capacity_bytes(config.query_cache_max_memory));

        let metadata = Arc::new(InMemoryMetadata::default());

        let context = Arc::new(ServerContext {
            fs,
            config: config.clone(),
            block_cache,
            revision: RevisionCounter::default(),
            user_log,
            metalog,
            metadata: metadata.clone(),
            tables: TableInfoMap::new(),
            location: location.into(),
        });

        let queue = MaintenanceQueue::start(context.clone(), config.maintenance_threads);
        let scheduler = Arc::new(MaintenanceScheduler::new(context.clone(), queue.clone()));

        let server = Arc::new(Self {
            context: context.clone(),
            scanners: ScannerMap::new(Duration::from_millis(config.scanner_ttl_ms)),
            group_commit: GroupCommit::new(config.commit_interval_ms),
            queue,
            scheduler,
            stop: StopSignal::default(),
            threads: Mutex::new(vec![]),
            pending_ack: Mutex::new(FxHashSet::default()),
            schema_entity_ids: Mutex::new(FxHashMap::default()),
            replay: Mutex::new(None),
            metadata,
        });

        server.recover(&snapshot.entities)?;
        context.metalog.record_recover()?;

        server.spawn_workers();

        Ok(server)
    }

    /// Rebuilds schemas and ranges from metalog entities, then replays the
    /// commit log into the caches.
    fn recover(&self, entities: &[(u64, Entity)]) -> crate::Result<()> {
        // Schemas first; ranges refer to them
        for (id, entity) in entities {
            if let Entity::Schema(schema) = entity {
                let schema = Arc::new(schema.clone());
                let table = TableIdentifier::new(&schema.table_id, schema.generation);
                let info = self.context.tables.get_or_create(&table, &schema);
                info.set_schema(schema);

                #[allow(clippy::expect_used)]
                self.schema_entity_ids
                    .lock()
                    .expect("lock is poisoned")
                    .insert(table.id.clone(), *id);
            }
        }

        let mut range_floor: FxHashMap<usize, Revision> = FxHashMap::default();

        for (id, entity) in entities {
            let Entity::Range(range_entity) = entity else {
                continue;
            };

            let info = self.context.tables.get(&range_entity.table.id)?;
            let schema = info.schema();

            let range = Range::create(
                &self.context,
                range_entity.table.clone(),
                schema,
                range_entity.spec.clone(),
                range_entity.state.clone(),
                range_entity.soft_limit,
                range_entity.transfer_log.clone(),
                *id,
            )?;

            range_floor.insert(Arc::as_ptr(&range) as usize, range.latest_revision());
            info.add_range(range);
        }

        // Replay the commit log: updates already in a store are skipped by
        // the per-range revision floor
        let mut reader = CommitLogReader::new(self.context.fs.clone(), USER_LOG_DIR, 0);
        let mut replayed = 0usize;

        for entry in reader.by_ref() {
            let entry = entry?;

            let mut cursor = &entry.payload[..];
            while !cursor.is_empty() {
                let cell = Cell::decode_from(&mut cursor)?;

                let Ok(range) = self.context.tables.find_range(&entry.table.id, &cell.key.row)
                else {
                    continue;
                };

                let floor = range_floor
                    .get(&(Arc::as_ptr(&range) as usize))
                    .copied()
                    .unwrap_or_default();

                if cell.key.revision > floor {
                    range.add(cell)?;
                    replayed += 1;
                }
            }
        }

        self.context.revision.fetch_max(reader.latest_revision());

        if replayed > 0 {
            log::info!("Replayed {replayed} cells from the commit log");
        }

        // Resume transfer logs left unfinished by a crash
        for range in self.context.tables.all_ranges() {
            range.replay_transfer_log(&self.context)?;
        }

        Ok(())
    }

    fn spawn_workers(self: &Arc<Self>) {
        let mut threads = vec![];

        // Group commit ticks
        {
            let weak: Weak<Self> = Arc::downgrade(self);
            let stop = self.stop.clone();
            let interval = Duration::from_millis(self.context.config.commit_interval_ms.into());

            threads.push(
                std::thread::Builder::new()
                    .name("group-commit".into())
                    .spawn(move || {
                        while !stop.is_stopped() {
                            std::thread::sleep(interval);
                            let Some(server) = weak.upgrade() else {
                                break;
                            };
                            server.group_commit_tick();
                        }
                    })
                    .unwrap_or_else(|e| panic!("spawning group commit worker: {e}")),
            );
        }

        threads.push(self.scheduler.clone().start(
            Duration::from_millis(self.context.config.maintenance_interval_ms.into()),
            self.stop.clone(),
        ));

        #[allow(clippy::expect_used)]
        {
            *self.threads.lock().expect("lock is poisoned") = threads;
        }
    }

    /// The shared context (broker, logs, caches, table registry).
    #[must_use]
    pub fn context(&self) -> &Arc<ServerContext> {
        &self.context
    }

    /// The METADATA rows this server has recorded, for inspection.
    #[must_use]
    pub fn metadata_rows(&self) -> Vec<((String, Vec<u8>), (Vec<u8>, String))> {
        self.metadata.rows()
    }

    fn check_shutdown(&self) -> crate::Result<()> {
        if self.stop.is_stopped() {
            Err(crate::Error::ShuttingDown)
        } else {
            Ok(())
        }
    }

    fn check_generation(&self, table: &TableIdentifier) -> crate::Result<Arc<Schema>> {
        let info = self.context.tables.get(&table.id)?;
        let schema = info.schema();

        if table.generation != 0 && table.generation != schema.generation {
            return Err(crate::Error::GenerationMismatch {
                expected: schema.generation,
                got: table.generation,
            });
        }

        Ok(schema)
    }

    /// Installs a table schema (a new table or a newer generation of an
    /// existing one).
    pub fn update_schema(&self, table: &TableIdentifier, schema: Schema) -> crate::Result<()> {
        self.check_shutdown()?;
        schema.validate()?;

        let schema = Arc::new(schema);
        let info = self.context.tables.get_or_create(table, &schema);

        if info.schema().generation > schema.generation {
            return Err(crate::Error::GenerationMismatch {
                expected: info.schema().generation,
                got: schema.generation,
            });
        }

        info.set_schema(schema.clone());
        for range in info.ranges() {
            if range.schema().generation < schema.generation {
                range.update_schema(schema.clone())?;
            }
        }

        let entity_id = {
            #[allow(clippy::expect_used)]
            let mut ids = self.schema_entity_ids.lock().expect("lock is poisoned");
            *ids.entry(table.id.clone())
                .or_insert_with(|| self.context.metalog.next_id())
        };

        self.context
            .metalog
            .record(entity_id, &Entity::Schema((*schema).clone()))?;

        log::info!("Installed schema for table {} generation {}", table.id, schema.generation);
        Ok(())
    }

    /// Loads a range: creates it, records it durably, replays its transfer
    /// log and leaves it awaiting `acknowledge_load`.
    pub fn load_range(
        &self,
        table: &TableIdentifier,
        spec: RangeSpec,
        transfer_log: Option<String>,
        state: RangeState,
    ) -> crate::Result<()> {
        self.check_shutdown()?;

        let schema = self.check_generation(table)?;
        let info = self.context.tables.get(&table.id)?;

        let metalog_id = self.context.metalog.next_id();
        let range = Range::create(
            &self.context,
            table.clone(),
            schema,
            spec.clone(),
            state.clone(),
            self.context.config.split_size,
            transfer_log.clone(),
            metalog_id,
        )?;

        self.context.metalog.record(
            metalog_id,
            &Entity::Range(crate::metalog::RangeEntity {
                table: table.clone(),
                spec: spec.clone(),
                state,
                soft_limit: self.context.config.split_size,
                transfer_log: transfer_log.clone(),
            }),
        )?;

        if transfer_log.is_some() {
            range.replay_transfer_log(&self.context)?;
            let latest = range.latest_revision();
            if let Some(dir) = &transfer_log {
                self.context.user_log.link_log(dir, latest)?;
            }
        }

        self.context
            .metadata
            .record_range(table, &spec, &self.context.location)?;

        info.add_range(range);

        #[allow(clippy::expect_used)]
        self.pending_ack
            .lock()
            .expect("lock is poisoned")
            .insert((table.id.clone(), spec.end_row.to_vec()));

        Ok(())
    }

    /// Confirms a loaded range; updates are refused until this arrives.
    pub fn acknowledge_load(&self, table: &TableIdentifier, spec: &RangeSpec) -> crate::Result<()> {
        #[allow(clippy::expect_used)]
        let removed = self
            .pending_ack
            .lock()
            .expect("lock is poisoned")
            .remove(&(table.id.clone(), spec.end_row.to_vec()));

        if removed {
            Ok(())
        } else {
            Err(crate::Error::RangeNotFound(format!("{table} {spec}")))
        }
    }

    fn range_awaits_ack(&self, table: &TableIdentifier, end_row: &[u8]) -> bool {
        #[allow(clippy::expect_used)]
        self.pending_ack
            .lock()
            .expect("lock is poisoned")
            .contains(&(table.id.clone(), end_row.to_vec()))
    }

    /// Applies a batch of mutations.
    ///
    /// Tables with a group-commit interval coalesce across clients and this
    /// call returns once the batch that includes these cells has committed;
    /// other tables commit immediately.
    pub fn update(
        &self,
        table: &TableIdentifier,
        cells: Vec<Cell>,
        flags: u32,
    ) -> crate::Result<()> {
        self.check_shutdown()?;
        let schema = self.check_generation(table)?;

        if schema.group_commit_interval_ms == 0 {
            return self.apply_cells(table, cells, flags);
        }

        let (tx, rx) = crossbeam_channel::bounded(1);
        self.group_commit.add(
            table,
            &schema,
            UpdateRequest {
                cells,
                flags,
                responder: Some(tx),
            },
        );

        rx.recv().map_err(|_| crate::Error::ShuttingDown)?
    }

    /// One global group-commit tick; also called by the timer thread.
    pub fn group_commit_tick(&self) {
        for (table, requests) in self.group_commit.trigger() {
            for request in requests {
                let result = self.apply_cells(&table, request.cells, request.flags);

                if let Some(responder) = request.responder {
                    let _ = responder.send(result);
                } else if let Err(e) = result {
                    log::error!("Problem committing batch for table {table}: {e}");
                }
            }
        }
    }

    /// Stages cells per range, appends each range's share to the right
    /// commit log and applies it to the cell caches.
    fn apply_cells(
        &self,
        table: &TableIdentifier,
        cells: Vec<Cell>,
        flags: u32,
    ) -> crate::Result<()> {
        let now = current_time_ns();

        // Stage per range
        let mut staged: FxHashMap<usize, (Arc<Range>, Vec<Cell>)> = FxHashMap::default();

        for mut cell in cells {
            if cell.key.timestamp == 0 {
                cell.key.timestamp = now;
            }

            let range = self.context.tables.find_range(&table.id, &cell.key.row)?;

            if self.range_awaits_ack(table, &range.spec().end_row) {
                return Err(crate::Error::RangeBusy);
            }

            staged
                .entry(Arc::as_ptr(&range) as usize)
                .or_insert_with(|| (range, vec![]))
                .1
                .push(cell);
        }

        let log_flags = if self.context.config.commit_log_flush && flags & UPDATE_FLAG_NO_LOG_SYNC == 0
        {
            OpenFlags::Flush
        } else {
            OpenFlags::None
        };

        for (_, (range, mut batch)) in staged {
            let _entry = range.update_entry();

            let revision = self.context.revision.next();
            for cell in &mut batch {
                cell.key.revision = revision;
            }

            // While a split is mid-flight, departing-side updates go to the
            // split log so the new range can replay them
            let predicate = range.split_predicate();

            let mut normal = Vec::new();
            let mut split = Vec::new();

            for cell in &batch {
                let to_split = predicate
                    .as_ref()
                    .is_some_and(|p| p.routes_to_split_log(&cell.key.row));
                if to_split {
                    cell.encode_into(&mut split)?;
                } else {
                    cell.encode_into(&mut normal)?;
                }
            }

            if !normal.is_empty() {
                self.context
                    .user_log
                    .write_flags(table, &normal, revision, log_flags)?;
            }
            if let (false, Some(predicate)) = (split.is_empty(), &predicate) {
                predicate.log.write_flags(table, &split, revision, log_flags)?;
            }

            for cell in batch {
                range.add(cell)?;
            }
        }

        Ok(())
    }

    /// Opens a scanner on the range holding the scan's start row and
    /// returns its first block.
    pub fn create_scanner(
        &self,
        table: &TableIdentifier,
        spec: &ScanSpec,
    ) -> crate::Result<ScanBlock> {
        self.check_shutdown()?;
        let _schema = self.check_generation(table)?;

        let range = self
            .context
            .tables
            .find_range(&table.id, &spec.row_interval.start)?;

        let scanner = range.create_scanner(spec, current_time_ns())?;
        self.scanners.create(scanner)
    }

    /// Fetches the next block of a live scanner.
    pub fn fetch_scanblock(&self, scanner_id: u32) -> crate::Result<ScanBlock> {
        self.check_shutdown()?;
        self.scanners.fetch(scanner_id)
    }

    /// Destroys a live scanner.
    pub fn destroy_scanner(&self, scanner_id: u32) {
        self.scanners.destroy(scanner_id);
    }

    /// Unloads one range and deletes its files.
    pub fn drop_range(&self, table: &TableIdentifier, spec: &RangeSpec) -> crate::Result<()> {
        let info = self.context.tables.get(&table.id)?;

        let range = info
            .remove_range(&spec.end_row)
            .ok_or_else(|| crate::Error::RangeNotFound(format!("{table} {spec}")))?;

        range.drop_range(&self.context)
    }

    /// Unloads a table and all of its ranges.
    pub fn drop_table(&self, table: &TableIdentifier) -> crate::Result<()> {
        let ranges = self.context.tables.remove(&table.id)?;
        for range in ranges {
            range.drop_range(&self.context)?;
        }
        Ok(())
    }

    /// Compacts one range, or every range of the table.
    pub fn compact(
        &self,
        table: &TableIdentifier,
        spec: Option<&RangeSpec>,
        kind: CompactionKind,
    ) -> crate::Result<()> {
        let info = self.context.tables.get(&table.id)?;

        let ranges = match spec {
            Some(spec) => {
                vec![info.find_range(&spec.end_row).ok_or_else(|| {
                    crate::Error::RangeNotFound(format!("{table} {spec}"))
                })?]
            }
            None => info.ranges(),
        };

        for range in ranges {
            range.compact(&self.context, kind)?;
        }

        Ok(())
    }

    /// Returns one range to the master's control.
    pub fn relinquish_range(&self, table: &TableIdentifier, spec: &RangeSpec) -> crate::Result<()> {
        let info = self.context.tables.get(&table.id)?;

        let range = info
            .remove_range(&spec.end_row)
            .ok_or_else(|| crate::Error::RangeNotFound(format!("{table} {spec}")))?;

        range.relinquish(&self.context)
    }

    /// Begins a replay session for a recovery group.
    pub fn replay_begin(&self, group: u32) -> crate::Result<()> {
        let log_dir = format!("logs/replay/{group}");
        let log = Arc::new(CommitLog::create(
            self.context.fs.clone(),
            &log_dir,
            CommitLogOptions::from(&self.context.config),
        )?);

        #[allow(clippy::expect_used)]
        let mut replay = self.replay.lock().expect("lock is poisoned");
        *replay = Some(ReplayState {
            group,
            staged: TableInfoMap::new(),
            log,
            log_dir,
            latest_revision: 0,
        });

        log::info!("Replay group {group} started");
        Ok(())
    }

    /// Stages a range for replay.
    pub fn replay_load_range(
        &self,
        table: &TableIdentifier,
        spec: RangeSpec,
        state: RangeState,
    ) -> crate::Result<()> {
        let schema = self.check_generation(table)?;

        #[allow(clippy::expect_used)]
        let replay = self.replay.lock().expect("lock is poisoned");
        let replay = replay.as_ref().ok_or(crate::Error::Protocol(
            "replay_load_range without replay_begin",
        ))?;

        let metalog_id = self.context.metalog.next_id();
        let range = Range::create(
            &self.context,
            table.clone(),
            schema.clone(),
            spec.clone(),
            state.clone(),
            self.context.config.split_size,
            None,
            metalog_id,
        )?;

        self.context.metalog.record(
            metalog_id,
            &Entity::Range(crate::metalog::RangeEntity {
                table: table.clone(),
                spec,
                state,
                soft_limit: self.context.config.split_size,
                transfer_log: None,
            }),
        )?;

        replay.staged.get_or_create(table, &schema).add_range(range);
        Ok(())
    }

    /// Applies one block of replayed updates to the staged ranges, after
    /// making it durable in the replay log.
    pub fn replay_update(&self, table: &TableIdentifier, payload: &[u8]) -> crate::Result<()> {
        #[allow(clippy::expect_used)]
        let mut replay = self.replay.lock().expect("lock is poisoned");
        let replay = replay
            .as_mut()
            .ok_or(crate::Error::Protocol("replay_update without replay_begin"))?;

        let mut revision = 0;
        let mut cells = vec![];
        let mut cursor = payload;

        while !cursor.is_empty() {
            let cell = Cell::decode_from(&mut cursor)?;
            revision = revision.max(cell.key.revision);
            cells.push(cell);
        }

        replay.log.write(table, payload, revision)?;
        replay.latest_revision = replay.latest_revision.max(revision);

        for cell in cells {
            let range = replay.staged.find_range(&table.id, &cell.key.row)?;
            range.add(cell)?;
        }

        Ok(())
    }

    /// Commits the replay session: staged ranges go live and the replay log
    /// is linked into the commit log.
    pub fn replay_commit(&self) -> crate::Result<()> {
        #[allow(clippy::expect_used)]
        let state = self
            .replay
            .lock()
            .expect("lock is poisoned")
            .take()
            .ok_or(crate::Error::Protocol("replay_commit without replay_begin"))?;

        state.log.close()?;

        self.context.revision.fetch_max(state.latest_revision);
        self.context.tables.atomic_merge(
            &state.staged,
            &self.context.user_log,
            &state.log_dir,
            state.latest_revision,
        )?;

        log::info!("Replay group {} committed", state.group);
        Ok(())
    }

    /// Runs one maintenance cycle immediately.
    pub fn run_maintenance_cycle(&self) -> crate::Result<()> {
        self.scheduler.schedule()
    }

    /// Blocks until the maintenance queue drains.
    pub fn wait_for_maintenance(&self) {
        self.queue.wait_for_empty();
    }

    /// Durably flushes the commit log.
    pub fn commit_log_sync(&self, _table: &TableIdentifier) -> crate::Result<()> {
        self.context.user_log.sync()
    }

    /// Health probe.
    pub fn status(&self) -> crate::Result<()> {
        self.check_shutdown()
    }

    /// Current server counters.
    #[must_use]
    pub fn get_statistics(&self) -> ServerStatistics {
        let ranges = self.context.tables.all_ranges();

        let arena = bumpalo::Bump::new();
        let mut cache_memory = 0;
        let mut disk_usage = 0;

        for range in &ranges {
            let data = range.get_maintenance_data(&arena);
            cache_memory += data.cache_mem + data.shadow_cache_mem;
            disk_usage += data.disk_usage;
        }

        ServerStatistics {
            range_count: ranges.len(),
            scanner_count: self.scanners.len(),
            cache_memory,
            block_cache_memory: self.context.block_cache.size(),
            disk_usage,
            revision: self.context.revision.get(),
        }
    }

    /// Human-readable state dump: ranges, log fragments, scanners.
    #[must_use]
    pub fn dump(&self) -> String {
        let mut out = String::new();

        for info in self.context.tables.all_tables() {
            for range in info.ranges() {
                out += &format!(
                    "RANGE {} {} state={:?} disk={} revision={}\n",
                    range.table(),
                    range.spec(),
                    range.state(),
                    range.disk_usage(),
                    range.latest_revision()
                );
            }
        }

        out += &self.context.user_log.get_stats();
        out += &format!("STAT scanners\t{}\n", self.scanners.len());

        out
    }

    /// Stops accepting new work and flushes the commit log.
    pub fn close(&self) -> crate::Result<()> {
        self.stop.send();
        self.context.user_log.sync()
    }

    /// Full shutdown: drains workers, closes logs and the metalog.
    pub fn shutdown(&self) -> crate::Result<()> {
        self.stop.send();

        self.queue.shutdown();

        #[allow(clippy::expect_used)]
        let mut threads = self.threads.lock().expect("lock is poisoned");
        for thread in threads.drain(..) {
            let _ = thread.join();
        }
        drop(threads);

        // Flush any batches the timer no longer serves
        self.group_commit_tick();

        self.context.user_log.close()?;
        self.context.metalog.close()?;

        log::info!("Range server {} shut down", self.context.location);
        Ok(())
    }
}

impl Drop for RangeServer {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::error!("Problem shutting down range server: {e}");
        }
    }
}

/// In-process [`RangeServerClient`] over a set of local servers
#[derive(Default)]
pub struct LocalClient {
    servers: Mutex<FxHashMap<String, Arc<RangeServer>>>,
}

impl LocalClient {
    /// Creates an empty client.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a server under a location name.
    pub fn register(&self, location: &str, server: Arc<RangeServer>) {
        #[allow(clippy::expect_used)]
        self.servers
            .lock()
            .expect("lock is poisoned")
            .insert(location.into(), server);
    }

    fn server(&self, location: &str) -> crate::Result<Arc<RangeServer>> {
        #[allow(clippy::expect_used)]
        self.servers
            .lock()
            .expect("lock is poisoned")
            .get(location)
            .cloned()
            .ok_or(crate::Error::NotConnected)
    }
}

impl RangeServerClient for LocalClient {
    fn create_scanner(
        &self,
        location: &str,
        table: &TableIdentifier,
        spec: &ScanSpec,
    ) -> crate::Result<ScanBlock> {
        self.server(location)?.create_scanner(table, spec)
    }

    fn fetch_scanblock(&self, location: &str, scanner_id: u32) -> crate::Result<ScanBlock> {
        self.server(location)?.fetch_scanblock(scanner_id)
    }

    fn destroy_scanner(&self, location: &str, scanner_id: u32) -> crate::Result<()> {
        self.server(location)?.destroy_scanner(scanner_id);
        Ok(())
    }
}

/// [`Locator`] answering directly from one local server's table map
pub struct LocalLocator {
    server: Arc<RangeServer>,
}

impl LocalLocator {
    /// Creates a locator over the given server.
    #[must_use]
    pub fn new(server: Arc<RangeServer>) -> Self {
        Self { server }
    }
}

impl Locator for LocalLocator {
    fn locate(
        &self,
        table: &TableIdentifier,
        row: &[u8],
        _timeout: Duration,
    ) -> crate::Result<RangeLocation> {
        let range = self.server.context.tables.find_range(&table.id, row)?;
        let spec = range.spec();

        Ok(RangeLocation {
            start_row: spec.start_row,
            end_row: spec.end_row,
            location: self.server.context.location.clone(),
        })
    }

    fn invalidate(&self, _table: &TableIdentifier, _row: &[u8]) {}
}
