// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! A range: one half-open row interval `(start_row, end_row]` of a table.
//!
//! The range routes updates into its access groups, composes scans across
//! them, and runs the maintenance operations that keep it healthy:
//! compaction, memory purge and, when it outgrows its soft limit, a split.
//! Split progress is a durable state machine (`Active → SplitLogInstalled →
//! SplitShrunk → Active`); a crash at any point is finished by replaying
//! the metalog on restart.

use crate::{
    access_group::{AccessGroup, AccessGroupMaintenanceData, CompactionKind},
    barrier::{Barrier, BarrierEntry, MaintenanceGuard},
    cell::Cell,
    cell_store::CellStoreWriter,
    coding::{self, Decode, DecodeError, Encode, EncodeError},
    commit_log::{CommitLog, CommitLogOptions, CommitLogReader},
    context::ServerContext,
    key::{Revision, Timestamp},
    metalog::{Entity, RangeEntity},
    scanner::{
        row_probe_key, CellListScanner, MergeScanner, RowInterval, ScanContext, ScanFilter,
        ScanSpec,
    },
    schema::{Schema, TableIdentifier},
    Slice, END_OF_TABLE,
};
use std::{
    io::{Read, Write},
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

/// A half-open row interval `(start_row, end_row]`
///
/// An empty start row means "from the beginning of the table"; the end row
/// `0xFF 0xFF` marks the table tail.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct RangeSpec {
    /// Exclusive start row; empty = table start
    pub start_row: Slice,

    /// Inclusive end row; `0xFF 0xFF` = table end
    pub end_row: Slice,
}

impl RangeSpec {
    /// Creates a range spec.
    pub fn new<S: Into<Slice>, E: Into<Slice>>(start_row: S, end_row: E) -> Self {
        Self {
            start_row: start_row.into(),
            end_row: end_row.into(),
        }
    }

    /// The whole table.
    #[must_use]
    pub fn whole_table() -> Self {
        Self::new([], END_OF_TABLE)
    }

    /// Returns `true` if the row belongs to this range.
    #[must_use]
    pub fn contains(&self, row: &[u8]) -> bool {
        row > &*self.start_row && row <= &*self.end_row
    }

    /// The interval as a scan bound: `(start, end]`.
    #[must_use]
    pub fn row_interval(&self) -> RowInterval {
        RowInterval {
            start: self.start_row.clone(),
            start_inclusive: false,
            end: self.end_row.clone(),
            end_inclusive: true,
        }
    }
}

impl std::fmt::Display for RangeSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "({}..{}]",
            String::from_utf8_lossy(&self.start_row),
            String::from_utf8_lossy(&self.end_row)
        )
    }
}

impl Encode for RangeSpec {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        coding::encode_vstr16(writer, &self.start_row)?;
        coding::encode_vstr16(writer, &self.end_row)?;
        Ok(())
    }
}

impl Decode for RangeSpec {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        Ok(Self {
            start_row: coding::decode_vstr16(reader)?.into(),
            end_row: coding::decode_vstr16(reader)?.into(),
        })
    }
}

/// Load / split progress of a range, durable in the metalog
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RangeState {
    /// Serving normally
    Active,

    /// A split log is installed; departing-side updates flow into it
    SplitLogInstalled {
        /// Chosen split row
        split_row: Slice,
        /// Directory of the split log
        split_log: String,
        /// Whether the high half leaves this range
        split_off_high: bool,
    },

    /// The range has shrunk to its kept half; the new range exists
    SplitShrunk {
        /// Chosen split row
        split_row: Slice,
        /// Directory of the split log
        split_log: String,
        /// Whether the high half left this range
        split_off_high: bool,
    },

    /// Handed back to the master
    Relinquished,
}

impl RangeState {
    /// Returns `true` while a split is mid-flight.
    #[must_use]
    pub fn split_in_progress(&self) -> bool {
        matches!(self, Self::SplitLogInstalled { .. } | Self::SplitShrunk { .. })
    }
}

impl Encode for RangeState {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        match self {
            Self::Active => writer.write_all(&[0])?,
            Self::SplitLogInstalled {
                split_row,
                split_log,
                split_off_high,
            } => {
                writer.write_all(&[1])?;
                coding::encode_vstr16(writer, split_row)?;
                coding::encode_vstr16(writer, split_log.as_bytes())?;
                writer.write_all(&[u8::from(*split_off_high)])?;
            }
            Self::SplitShrunk {
                split_row,
                split_log,
                split_off_high,
            } => {
                writer.write_all(&[2])?;
                coding::encode_vstr16(writer, split_row)?;
                coding::encode_vstr16(writer, split_log.as_bytes())?;
                writer.write_all(&[u8::from(*split_off_high)])?;
            }
            Self::Relinquished => writer.write_all(&[3])?,
        }
        Ok(())
    }
}

impl Decode for RangeState {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let mut tag = [0u8; 1];
        reader.read_exact(&mut tag)?;

        fn split_fields<R: Read>(reader: &mut R) -> Result<(Slice, String, bool), DecodeError> {
            let split_row = coding::decode_vstr16(reader)?.into();
            let split_log = String::from_utf8(coding::decode_vstr16(reader)?)
                .map_err(|_| DecodeError::InvalidHeader("RangeState split log"))?;
            let mut flag = [0u8; 1];
            reader.read_exact(&mut flag)?;
            Ok((split_row, split_log, flag[0] != 0))
        }

        match tag[0] {
            0 => Ok(Self::Active),
            1 => {
                let (split_row, split_log, split_off_high) = split_fields(reader)?;
                Ok(Self::SplitLogInstalled {
                    split_row,
                    split_log,
                    split_off_high,
                })
            }
            2 => {
                let (split_row, split_log, split_off_high) = split_fields(reader)?;
                Ok(Self::SplitShrunk {
                    split_row,
                    split_log,
                    split_off_high,
                })
            }
            3 => Ok(Self::Relinquished),
            tag => Err(DecodeError::InvalidTag(("RangeState", tag))),
        }
    }
}

/// Routes one update to the split log or the normal log while a split is
/// mid-flight
#[derive(Clone)]
pub struct SplitPredicate {
    /// Chosen split row
    pub split_row: Slice,

    /// Whether the high half is departing
    pub split_off_high: bool,

    /// The installed split log
    pub log: Arc<CommitLog>,
}

impl SplitPredicate {
    /// Returns `true` if the row's updates must go to the split log.
    #[must_use]
    pub fn routes_to_split_log(&self, row: &[u8]) -> bool {
        if self.split_off_high {
            row > &*self.split_row
        } else {
            row <= &*self.split_row
        }
    }
}

/// Per-range numbers handed to the maintenance prioritizer each cycle
#[derive(Debug)]
pub struct RangeMaintenanceData<'a> {
    /// Owning table id, arena-allocated for the cycle
    pub table: &'a str,

    /// Range interval, arena-allocated
    pub start_row: &'a [u8],

    /// Range interval, arena-allocated
    pub end_row: &'a [u8],

    /// Per access group numbers
    pub access_groups: Vec<AccessGroupMaintenanceData<'a>>,

    /// Bytes on disk across all groups
    pub disk_usage: u64,

    /// Bytes of live cell caches
    pub cache_mem: u64,

    /// Bytes of frozen snapshots
    pub shadow_cache_mem: u64,

    /// Bytes of loaded block indexes
    pub index_mem: u64,

    /// Bytes of loaded bloom filters
    pub filter_mem: u64,

    /// Bytes a compaction would release from memory
    pub compactable_memory: u64,

    /// Lowest revision this range pins in the commit log
    pub earliest_cached_revision: Revision,

    /// The range exceeded its soft limit and may split
    pub needs_split: bool,

    /// A maintenance task already runs on the range
    pub busy: bool,

    /// Split progress persisted for the range
    pub state: RangeState,

    /// Priority assigned by the prioritizer; lower runs earlier
    pub priority: i64,

    /// Task flags assigned by the prioritizer
    pub flags: u32,
}

struct RangeInner {
    schema: Arc<Schema>,
    spec: RangeSpec,
    state: RangeState,
    access_groups: Vec<AccessGroup>,
    base_dir: String,
    split_log: Option<Arc<CommitLog>>,
    transfer_log: Option<String>,
}

/// One loaded range of one table
pub struct Range {
    table: TableIdentifier,
    metalog_id: u64,
    inner: Mutex<RangeInner>,
    update_barrier: Barrier,
    scan_barrier: Barrier,
    maintenance_guard: MaintenanceGuard,
    dropped: AtomicBool,
    latest_revision: AtomicI64,
    soft_limit: AtomicU64,
}

fn range_dir(table: &TableIdentifier, spec: &RangeSpec) -> String {
    let mut keyed = spec.start_row.to_vec();
    keyed.push(0xFF);
    keyed.extend_from_slice(&spec.end_row);
    format!(
        "tables/{}/{:016x}",
        table.id,
        xxhash_rust::xxh3::xxh3_64(&keyed)
    )
}

fn build_access_groups(schema: &Schema, base_dir: &str) -> Vec<AccessGroup> {
    schema
        .access_groups
        .iter()
        .map(|ag_spec| {
            AccessGroup::new(
                ag_spec.clone(),
                schema.families_of(&ag_spec.name),
                format!("{base_dir}/{}", ag_spec.name),
                schema.generation,
            )
        })
        .collect()
}

impl Range {
    /// Opens a range: builds its access groups, reloads their stores and
    /// seeds the revision floor from the newest store.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        context: &ServerContext,
        table: TableIdentifier,
        schema: Arc<Schema>,
        spec: RangeSpec,
        state: RangeState,
        soft_limit: u64,
        transfer_log: Option<String>,
        metalog_id: u64,
    ) -> crate::Result<Arc<Self>> {
        let base_dir = range_dir(&table, &spec);

        let mut access_groups = build_access_groups(&schema, &base_dir);

        // Replay floor: the smallest per-group store revision. Groups
        // compacted later re-apply a few cells, which scans and
        // compactions deduplicate; a larger floor would lose data.
        let mut latest_revision = i64::MAX;

        for ag in &mut access_groups {
            ag.load_stores(&context.fs, Some(&context.block_cache))?;
            let group_max = ag
                .stores()
                .iter()
                .map(|store| store.trailer().revision())
                .max()
                .unwrap_or(0);
            latest_revision = latest_revision.min(group_max);
        }

        if latest_revision == i64::MAX {
            latest_revision = 0;
        }

        let split_log = match &state {
            RangeState::SplitLogInstalled { split_log, .. } => Some(Arc::new(CommitLog::create(
                context.fs.clone(),
                split_log,
                CommitLogOptions::from(&context.config),
            )?)),
            _ => None,
        };

        log::info!("Loaded range {table} {spec} state={state:?}");

        Ok(Arc::new(Self {
            table,
            metalog_id,
            inner: Mutex::new(RangeInner {
                schema,
                spec,
                state,
                access_groups,
                base_dir,
                split_log,
                transfer_log,
            }),
            update_barrier: Barrier::default(),
            scan_barrier: Barrier::default(),
            maintenance_guard: MaintenanceGuard::default(),
            dropped: AtomicBool::new(false),
            latest_revision: AtomicI64::new(latest_revision),
            soft_limit: AtomicU64::new(soft_limit),
        }))
    }

    fn lock(&self) -> MutexGuard<'_, RangeInner> {
        #[allow(clippy::expect_used)]
        self.inner.lock().expect("lock is poisoned")
    }

    fn check_dropped(&self) -> crate::Result<()> {
        if self.dropped.load(Ordering::Acquire) {
            Err(crate::Error::RangeNotFound(format!(
                "{} {}",
                self.table,
                self.spec()
            )))
        } else {
            Ok(())
        }
    }

    /// Owning table.
    #[must_use]
    pub fn table(&self) -> &TableIdentifier {
        &self.table
    }

    /// Metalog entity id of this range.
    #[must_use]
    pub fn metalog_id(&self) -> u64 {
        self.metalog_id
    }

    /// Current row interval.
    #[must_use]
    pub fn spec(&self) -> RangeSpec {
        self.lock().spec.clone()
    }

    /// Current split state.
    #[must_use]
    pub fn state(&self) -> RangeState {
        self.lock().state.clone()
    }

    /// Current schema.
    #[must_use]
    pub fn schema(&self) -> Arc<Schema> {
        self.lock().schema.clone()
    }

    /// Highest revision applied to this range.
    #[must_use]
    pub fn latest_revision(&self) -> Revision {
        self.latest_revision.load(Ordering::Acquire)
    }

    /// Bytes on disk across all access groups.
    #[must_use]
    pub fn disk_usage(&self) -> u64 {
        self.lock()
            .access_groups
            .iter()
            .map(AccessGroup::disk_usage)
            .sum()
    }

    /// Lowest revision this range still holds only in memory.
    #[must_use]
    pub fn earliest_cached_revision(&self) -> Revision {
        self.lock()
            .access_groups
            .iter()
            .map(AccessGroup::earliest_cached_revision)
            .min()
            .unwrap_or(i64::MAX)
    }

    /// Returns `true` once disk usage exceeds the soft limit and no split
    /// is already running.
    #[must_use]
    pub fn needs_split(&self) -> bool {
        self.disk_usage() > self.soft_limit.load(Ordering::Acquire)
            && self.state() == RangeState::Active
    }

    /// The single-entry maintenance latch.
    #[must_use]
    pub fn maintenance_guard(&self) -> &MaintenanceGuard {
        &self.maintenance_guard
    }

    /// Enters the update barrier; writers hold the entry across log append
    /// and cache insert.
    pub fn update_entry(&self) -> BarrierEntry<'_> {
        self.update_barrier.enter()
    }

    /// The split routing decision, while a split log is installed.
    #[must_use]
    pub fn split_predicate(&self) -> Option<SplitPredicate> {
        let inner = self.lock();
        match (&inner.state, &inner.split_log) {
            (
                RangeState::SplitLogInstalled {
                    split_row,
                    split_off_high,
                    ..
                },
                Some(log),
            ) => Some(SplitPredicate {
                split_row: split_row.clone(),
                split_off_high: *split_off_high,
                log: log.clone(),
            }),
            _ => None,
        }
    }

    /// Applies one cell to the owning access group.
    ///
    /// The caller has already made the mutation durable in a commit log.
    pub fn add(&self, cell: Cell) -> crate::Result<()> {
        self.check_dropped()?;

        let revision = cell.key.revision;
        let inner = self.lock();

        if cell.key.family == 0 {
            // Row tombstones mask every family, so every group gets one
            for ag in &inner.access_groups {
                ag.add(cell.clone());
            }
        } else {
            let ag = inner
                .access_groups
                .iter()
                .find(|ag| ag.owns_family(cell.key.family))
                .ok_or_else(|| {
                    crate::Error::BadSchema(format!("unknown column family {}", cell.key.family))
                })?;
            ag.add(cell);
        }

        drop(inner);
        self.latest_revision.fetch_max(revision, Ordering::AcqRel);

        Ok(())
    }

    /// Builds a merging scanner over every access group, clamped to the
    /// intersection of the scan's row interval and this range's interval.
    ///
    /// The scanner owns snapshots of the underlying caches and stores, so
    /// maintenance proceeding after creation does not disturb it.
    pub fn create_scanner(
        &self,
        spec: &ScanSpec,
        now: Timestamp,
    ) -> crate::Result<CellListScanner> {
        let _entry = self.scan_barrier.enter();
        self.check_dropped()?;

        let inner = self.lock();

        let mut clamped = spec.clone();
        if clamped.row_interval.start.is_empty()
            || inner.spec.row_interval().is_before(&clamped.row_interval.start)
        {
            clamped.row_interval.start = inner.spec.start_row.clone();
            clamped.row_interval.start_inclusive = false;
        }
        if clamped.row_interval.end.is_empty() || clamped.row_interval.end > inner.spec.end_row {
            clamped.row_interval.end = inner.spec.end_row.clone();
            clamped.row_interval.end_inclusive = true;
        }

        let context = Arc::new(ScanContext::new(clamped.clone(), &inner.schema, now)?);

        let probe = if clamped.row_interval.start.is_empty() {
            None
        } else {
            Some(row_probe_key(&clamped.row_interval.start))
        };

        let mut sources: Vec<CellListScanner> = vec![];
        for ag in &inner.access_groups {
            sources.extend(ag.create_sources(probe.as_ref())?);
        }

        drop(inner);

        Ok(Box::new(ScanFilter::new(MergeScanner::new(sources), context)))
    }

    /// Replays the transfer log (if any) into the cell caches, skipping
    /// updates already present in the stores. Returns the number of cells
    /// applied.
    pub fn replay_transfer_log(&self, context: &ServerContext) -> crate::Result<usize> {
        let transfer_log = self.lock().transfer_log.clone();
        let Some(transfer_log) = transfer_log else {
            return Ok(0);
        };

        let cutoff = self.latest_revision();
        let mut applied = 0;
        let mut highest = 0;

        for entry in CommitLogReader::new(context.fs.clone(), &transfer_log, cutoff + 1) {
            let entry = entry?;
            highest = highest.max(entry.revision);

            let mut cursor = &entry.payload[..];
            while !cursor.is_empty() {
                let cell = Cell::decode_from(&mut cursor)?;
                if cell.key.revision <= cutoff {
                    continue;
                }
                self.add(cell)?;
                applied += 1;
            }
        }

        context.revision.fetch_max(highest);
        self.lock().transfer_log = None;

        log::info!(
            "Replayed transfer log {transfer_log:?} into {} {}: {applied} cells",
            self.table,
            self.spec()
        );

        Ok(applied)
    }

    /// Runs a compaction over every access group.
    pub fn compact(&self, context: &ServerContext, kind: CompactionKind) -> crate::Result<()> {
        let _activator = self.maintenance_guard.activate()?;
        self.check_dropped()?;

        let now = current_time_ns();
        let mut inner = self.lock();
        let schema = inner.schema.clone();
        let row_interval = inner.spec.row_interval();

        for ag in &mut inner.access_groups {
            ag.compact(
                &context.fs,
                Some(&context.block_cache),
                kind,
                &schema,
                &row_interval,
                now,
            )?;
        }

        Ok(())
    }

    /// Drops loaded block indexes and bloom filters across the groups,
    /// returning the bytes released.
    pub fn purge_memory(&self) -> crate::Result<u64> {
        let _activator = self.maintenance_guard.activate()?;

        let mut inner = self.lock();
        Ok(inner
            .access_groups
            .iter_mut()
            .map(AccessGroup::purge_memory)
            .sum())
    }

    /// Splits the range at the median row of its stores.
    ///
    /// Returns the newly created range for the departing half, or `None`
    /// when no usable split row exists. Every state transition is recorded
    /// in the metalog before its effects become visible, so a crash at any
    /// point resumes cleanly.
    pub fn split(
        self: &Arc<Self>,
        context: &Arc<ServerContext>,
    ) -> crate::Result<Option<Arc<Self>>> {
        let _activator = self.maintenance_guard.activate()?;
        self.check_dropped()?;

        if self.state() == RangeState::Active {
            let Some(split_row) = self.choose_split_row() else {
                log::debug!("No usable split row for {} {}", self.table, self.spec());
                return Ok(None);
            };

            self.install_split_log(context, split_row)?;
        }

        let mut new_range = None;

        if let RangeState::SplitLogInstalled {
            split_row,
            split_log,
            split_off_high,
        } = self.state()
        {
            new_range = Some(self.shrink(context, &split_row, &split_log, split_off_high)?);
        }

        if let RangeState::SplitShrunk { split_log, .. } = self.state() {
            // Preserve the split log's revisions in the main log, then
            // return to normal service
            let latest = self.latest_revision();
            context.user_log.link_log(&split_log, latest)?;

            self.set_state(context, RangeState::Active)?;
            log::info!(
                "Split of {} finished; notifying master of new range",
                self.table
            );
        }

        Ok(new_range)
    }

    fn choose_split_row(&self) -> Option<Slice> {
        let inner = self.lock();

        let mut candidates: Vec<Slice> = vec![];
        for ag in &inner.access_groups {
            candidates.extend(ag.split_row_candidates());
        }
        candidates.sort();

        let row = candidates.get(candidates.len() / 2)?.clone();

        // A split at either boundary would create an empty half
        if *row <= *inner.spec.start_row || *row >= *inner.spec.end_row {
            return None;
        }

        Some(row)
    }

    fn set_state(&self, context: &ServerContext, state: RangeState) -> crate::Result<()> {
        let entity = {
            let mut inner = self.lock();
            inner.state = state;
            Entity::Range(RangeEntity {
                table: self.table.clone(),
                spec: inner.spec.clone(),
                state: inner.state.clone(),
                soft_limit: self.soft_limit.load(Ordering::Acquire),
                transfer_log: inner.transfer_log.clone(),
            })
        };

        context.metalog.record(self.metalog_id, &entity)
    }

    fn install_split_log(&self, context: &ServerContext, split_row: Slice) -> crate::Result<()> {
        let split_off_high = self.spec().end_row != END_OF_TABLE;

        let split_log_dir = format!(
            "logs/split/{}-{:016x}",
            self.table.id,
            xxhash_rust::xxh3::xxh3_64(&split_row)
        );

        // New updates must drain before the routing decision changes
        let _raised = self.update_barrier.put_up();

        let split_log = Arc::new(CommitLog::create(
            context.fs.clone(),
            &split_log_dir,
            CommitLogOptions::from(&context.config),
        )?);

        self.lock().split_log = Some(split_log);
        self.set_state(
            context,
            RangeState::SplitLogInstalled {
                split_row: split_row.clone(),
                split_log: split_log_dir,
                split_off_high,
            },
        )?;

        log::info!(
            "Installed split log for {} {} at row {:?}",
            self.table,
            self.spec(),
            split_row
        );

        Ok(())
    }

    fn shrink(
        self: &Arc<Self>,
        context: &Arc<ServerContext>,
        split_row: &Slice,
        split_log_dir: &str,
        split_off_high: bool,
    ) -> crate::Result<Arc<Self>> {
        let old_spec = self.spec();
        let low_spec = RangeSpec::new(old_spec.start_row.clone(), split_row.clone());
        let high_spec = RangeSpec::new(split_row.clone(), old_spec.end_row.clone());

        // METADATA learns about both halves before any data moves
        context
            .metadata
            .record_range(&self.table, &low_spec, &context.location)?;
        context
            .metadata
            .record_range(&self.table, &high_spec, &context.location)?;

        let low_dir = range_dir(&self.table, &low_spec);
        let high_dir = range_dir(&self.table, &high_spec);

        // Write both halves outside any lock; concurrent updates keep
        // flowing into the caches and the split log
        self.write_half(context, &low_spec, &low_dir)?;
        self.write_half(context, &high_spec, &high_dir)?;

        let (kept_spec, kept_dir, departing_spec) = if split_off_high {
            (low_spec, low_dir, high_spec)
        } else {
            (high_spec, high_dir, low_spec)
        };

        let new_metalog_id = context.metalog.next_id();
        let schema = self.schema();
        let soft_limit = self.soft_limit.load(Ordering::Acquire);

        let new_range = {
            // Swap under both barriers: writers and scanners observe either
            // the old wide range or the two halves, never a mix
            let _scans = self.scan_barrier.put_up();
            let _updates = self.update_barrier.put_up();

            let old_base = {
                let mut inner = self.lock();

                for ag in &mut inner.access_groups {
                    let dir = format!("{kept_dir}/{}", ag.name());
                    ag.adopt_split_half(&context.fs, Some(&context.block_cache), dir)?;
                }

                inner.spec = kept_spec.clone();
                inner.split_log = None;
                std::mem::replace(&mut inner.base_dir, kept_dir.clone())
            };

            self.set_state(
                context,
                RangeState::SplitShrunk {
                    split_row: split_row.clone(),
                    split_log: split_log_dir.to_owned(),
                    split_off_high,
                },
            )?;

            let new_range = Self::create(
                context,
                self.table.clone(),
                schema,
                departing_spec.clone(),
                RangeState::Active,
                soft_limit,
                Some(split_log_dir.to_owned()),
                new_metalog_id,
            )?;

            context.metalog.record(
                new_metalog_id,
                &Entity::Range(RangeEntity {
                    table: self.table.clone(),
                    spec: departing_spec.clone(),
                    state: RangeState::Active,
                    soft_limit,
                    transfer_log: Some(split_log_dir.to_owned()),
                }),
            )?;

            context.tables.replace_after_split(
                &self.table,
                &old_spec,
                self.clone(),
                new_range.clone(),
            )?;

            if context.fs.exists(&old_base)? {
                context.fs.rmdir(&old_base)?;
            }

            new_range
        };

        // Catch up the departing half on updates that raced the half write
        new_range.replay_transfer_log(context)?;

        log::info!(
            "Shrunk {} to {kept_spec}; new range {} created",
            self.table,
            departing_spec
        );

        Ok(new_range)
    }

    fn write_half(
        &self,
        context: &ServerContext,
        half_spec: &RangeSpec,
        half_dir: &str,
    ) -> crate::Result<()> {
        type HalfSource = (
            String,
            Vec<CellListScanner>,
            crate::cell_store::CellStoreWriterOptions,
        );

        let groups: Vec<HalfSource> = {
            let inner = self.lock();
            let mut groups = vec![];
            for ag in &inner.access_groups {
                groups.push((
                    ag.name().to_owned(),
                    ag.create_sources(None)?,
                    ag.split_writer_options(),
                ));
            }
            groups
        };

        for (name, sources, options) in groups {
            let path = format!("{half_dir}/{name}/cs0");
            let mut writer = CellStoreWriter::create(context.fs.clone(), &path, options)?;

            let mut prev_key = None;

            for cell in MergeScanner::new(sources) {
                let cell = cell?;

                // Cache and store may briefly hold the same cell after a
                // replay; keep the first copy
                if prev_key.as_ref() == Some(&cell.key) {
                    continue;
                }
                prev_key = Some(cell.key.clone());

                if !half_spec.contains(&cell.key.row) {
                    if *cell.key.row > *half_spec.end_row {
                        break;
                    }
                    continue;
                }

                writer.add(&cell)?;
            }

            writer.finish()?;
        }

        Ok(())
    }

    /// Relinquishes the range back to the master: a final minor compaction
    /// drains the caches, the state is recorded, and the range stops
    /// serving.
    pub fn relinquish(&self, context: &ServerContext) -> crate::Result<()> {
        self.compact(context, CompactionKind::Minor)?;
        self.set_state(context, RangeState::Relinquished)?;
        self.dropped.store(true, Ordering::Release);

        log::info!("Relinquished range {} {}", self.table, self.spec());
        Ok(())
    }

    /// Marks the range dropped: access groups are torn down and every
    /// further operation fails with `RangeNotFound`.
    pub fn drop_range(&self, context: &ServerContext) -> crate::Result<()> {
        self.dropped.store(true, Ordering::Release);

        let base_dir = {
            let mut inner = self.lock();
            inner.access_groups.clear();
            inner.base_dir.clone()
        };

        context
            .metalog
            .record_removal(self.metalog_id, crate::metalog::TYPE_RANGE)?;

        if context.fs.exists(&base_dir)? {
            context.fs.rmdir(&base_dir)?;
        }

        log::info!("Dropped range {} {}", self.table, self.spec());
        Ok(())
    }

    /// Installs a newer schema generation.
    pub fn update_schema(&self, schema: Arc<Schema>) -> crate::Result<()> {
        let mut inner = self.lock();

        if schema.generation <= inner.schema.generation {
            return Err(crate::Error::GenerationMismatch {
                expected: inner.schema.generation,
                got: schema.generation,
            });
        }

        inner.schema = schema;
        Ok(())
    }

    /// Gathers this range's numbers for one maintenance cycle.
    #[must_use]
    pub fn get_maintenance_data<'a>(&self, arena: &'a bumpalo::Bump) -> RangeMaintenanceData<'a> {
        let inner = self.lock();

        let access_groups: Vec<AccessGroupMaintenanceData<'a>> = inner
            .access_groups
            .iter()
            .map(|ag| ag.get_maintenance_data(arena))
            .collect();

        let disk_usage = access_groups.iter().map(|ag| ag.disk_usage).sum();
        let cache_mem = access_groups.iter().map(|ag| ag.cache_mem).sum();
        let shadow_cache_mem = access_groups.iter().map(|ag| ag.shadow_cache_mem).sum();
        let index_mem = access_groups.iter().map(|ag| ag.index_mem).sum();
        let filter_mem = access_groups.iter().map(|ag| ag.filter_mem).sum();
        let compactable_memory = access_groups.iter().map(|ag| ag.compactable_memory).sum();
        let earliest_cached_revision = access_groups
            .iter()
            .map(|ag| ag.earliest_cached_revision)
            .min()
            .unwrap_or(i64::MAX);

        RangeMaintenanceData {
            table: arena.alloc_str(&self.table.id),
            start_row: arena.alloc_slice_copy(&inner.spec.start_row),
            end_row: arena.alloc_slice_copy(&inner.spec.end_row),
            access_groups,
            disk_usage,
            cache_mem,
            shadow_cache_mem,
            index_mem,
            filter_mem,
            compactable_memory,
            earliest_cached_revision,
            needs_split: disk_usage > self.soft_limit.load(Ordering::Acquire)
                && inner.state == RangeState::Active,
            busy: self.maintenance_guard.in_progress(),
            state: inner.state.clone(),
            priority: 0,
            flags: 0,
        }
    }
}

pub(crate) fn current_time_ns() -> Timestamp {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| {
            // NOTE: Fits i64 until 2262
            #[allow(clippy::cast_possible_truncation)]
            {
                d.as_nanos() as i64
            }
        })
        .unwrap_or_default()
}

impl std::fmt::Debug for Range {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Range({} {})", self.table, self.spec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn range_spec_contains() {
        let spec = RangeSpec::new("b", "m");
        assert!(!spec.contains(b"a"));
        assert!(!spec.contains(b"b"));
        assert!(spec.contains(b"c"));
        assert!(spec.contains(b"m"));
        assert!(!spec.contains(b"n"));

        let tail = RangeSpec::new("m", END_OF_TABLE);
        assert!(tail.contains(b"z"));
        assert!(!tail.contains(b"m"));
    }

    #[test]
    fn range_spec_roundtrip() -> crate::Result<()> {
        let spec = RangeSpec::new("b", END_OF_TABLE);
        let bytes = spec.encode_into_vec();
        assert_eq!(spec, RangeSpec::decode_from(&mut &bytes[..])?);
        Ok(())
    }

    #[test]
    fn range_state_roundtrip() -> crate::Result<()> {
        let states = [
            RangeState::Active,
            RangeState::SplitLogInstalled {
                split_row: "m".into(),
                split_log: "logs/split/x".into(),
                split_off_high: true,
            },
            RangeState::SplitShrunk {
                split_row: "m".into(),
                split_log: "logs/split/x".into(),
                split_off_high: false,
            },
            RangeState::Relinquished,
        ];

        for state in states {
            let bytes = state.encode_into_vec();
            assert_eq!(state, RangeState::decode_from(&mut &bytes[..])?);
        }

        Ok(())
    }

    #[test]
    fn split_predicate_routing() {
        let log = {
            let dir = tempfile::tempdir().expect("should create");
            let fs: Arc<dyn crate::Filesystem> = Arc::new(crate::LocalBroker::new(dir.path()));
            Arc::new(
                CommitLog::create(fs, "log", CommitLogOptions::default()).expect("should create"),
            )
        };

        let high = SplitPredicate {
            split_row: "m".into(),
            split_off_high: true,
            log: log.clone(),
        };
        assert!(!high.routes_to_split_log(b"a"));
        assert!(!high.routes_to_split_log(b"m"));
        assert!(high.routes_to_split_log(b"n"));

        let low = SplitPredicate {
            split_row: "m".into(),
            split_off_high: false,
            log,
        };
        assert!(low.routes_to_split_log(b"a"));
        assert!(low.routes_to_split_log(b"m"));
        assert!(!low.routes_to_split_log(b"n"));
    }
}
