// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{TASK_COMPACT, TASK_MEMORY_PURGE, TASK_SPLIT};
use crate::{
    commit_log::FragmentPriorityData,
    key::Revision,
    range::RangeMaintenanceData,
};
use std::collections::BTreeMap;

/// How much memory the server holds and how much it must release
#[derive(Clone, Copy, Debug, Default)]
pub struct MemoryState {
    /// Tracked memory currently in use
    pub balance: u64,

    /// Bytes that must be released this cycle; 0 = no pressure
    pub needed: u64,
}

/// Assigns priorities and task flags to the cycle's range data
pub trait MaintenancePrioritizer {
    /// Strategy name for logs.
    fn name(&self) -> &'static str;

    /// Fills in `priority` and `flags` of each entry; lower priority runs
    /// earlier. Busy ranges must stay untouched.
    fn prioritize(
        &self,
        ranges: &mut [RangeMaintenanceData<'_>],
        memory: &MemoryState,
        log_priority: &BTreeMap<Revision, FragmentPriorityData>,
    );
}

/// Bytes of commit log pinned by a range's earliest cached revision.
fn pinned_log_bytes(
    earliest_cached_revision: Revision,
    log_priority: &BTreeMap<Revision, FragmentPriorityData>,
) -> u64 {
    if earliest_cached_revision == i64::MAX {
        return 0;
    }

    log_priority
        .range(earliest_cached_revision..)
        .next()
        .map(|(_, data)| data.cumulative_size)
        .unwrap_or_default()
}

/// Normal-pressure strategy: compactions are ordered by how much commit log
/// space they would free
pub struct LogCleanupPrioritizer;

impl MaintenancePrioritizer for LogCleanupPrioritizer {
    fn name(&self) -> &'static str {
        "log-cleanup"
    }

    fn prioritize(
        &self,
        ranges: &mut [RangeMaintenanceData<'_>],
        _memory: &MemoryState,
        log_priority: &BTreeMap<Revision, FragmentPriorityData>,
    ) {
        for data in ranges.iter_mut() {
            if data.busy {
                continue;
            }

            // A pending split always beats a compaction for the same range
            if data.needs_split || data.state.split_in_progress() {
                data.flags |= TASK_SPLIT;
                data.priority = i64::MIN;
                continue;
            }

            let pinned = pinned_log_bytes(data.earliest_cached_revision, log_priority);

            if data.compactable_memory > 0 && pinned > 0 {
                data.flags |= TASK_COMPACT;
                // NOTE: Log sizes stay far below i64::MAX
                #[allow(clippy::cast_possible_wrap)]
                {
                    data.priority = -(pinned as i64);
                }
            }
        }
    }
}

/// Memory-pressure strategy: releases the cheapest memory first until the
/// needed amount is accounted for
pub struct LowMemoryPrioritizer;

impl MaintenancePrioritizer for LowMemoryPrioritizer {
    fn name(&self) -> &'static str {
        "low-memory"
    }

    fn prioritize(
        &self,
        ranges: &mut [RangeMaintenanceData<'_>],
        memory: &MemoryState,
        _log_priority: &BTreeMap<Revision, FragmentPriorityData>,
    ) {
        // Largest releasable first
        let mut order: Vec<usize> = (0..ranges.len()).collect();
        order.sort_by_key(|i| {
            let data = &ranges[*i];
            std::cmp::Reverse(data.compactable_memory + data.index_mem + data.filter_mem)
        });

        let mut accounted = 0u64;

        for idx in order {
            let data = &mut ranges[idx];

            if data.busy {
                continue;
            }

            if data.needs_split || data.state.split_in_progress() {
                data.flags |= TASK_SPLIT;
                data.priority = i64::MIN;
                continue;
            }

            if accounted >= memory.needed {
                break;
            }

            let purgeable = data.index_mem + data.filter_mem;
            let released = data.compactable_memory + purgeable;
            if released == 0 {
                continue;
            }

            if data.compactable_memory > 0 {
                data.flags |= TASK_COMPACT;
            } else if purgeable > 0 {
                data.flags |= TASK_MEMORY_PURGE;
            }

            // NOTE: Memory sizes stay far below i64::MAX
            #[allow(clippy::cast_possible_wrap)]
            {
                data.priority = -(released as i64);
            }

            accounted += released;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::range::RangeState;
    use test_log::test;

    fn data<'a>(arena: &'a bumpalo::Bump, name: &str) -> RangeMaintenanceData<'a> {
        RangeMaintenanceData {
            table: arena.alloc_str(name),
            start_row: arena.alloc_slice_copy(b""),
            end_row: arena.alloc_slice_copy(&[0xFF, 0xFF]),
            access_groups: vec![],
            disk_usage: 0,
            cache_mem: 0,
            shadow_cache_mem: 0,
            index_mem: 0,
            filter_mem: 0,
            compactable_memory: 0,
            earliest_cached_revision: i64::MAX,
            needs_split: false,
            busy: false,
            state: RangeState::Active,
            priority: 0,
            flags: 0,
        }
    }

    fn log_map(entries: &[(i64, u64)]) -> BTreeMap<Revision, FragmentPriorityData> {
        entries
            .iter()
            .map(|(revision, cumulative_size)| {
                (
                    *revision,
                    FragmentPriorityData {
                        distance: 0,
                        cumulative_size: *cumulative_size,
                    },
                )
            })
            .collect()
    }

    #[test]
    fn log_cleanup_prefers_ranges_pinning_more_log() {
        let arena = bumpalo::Bump::new();

        let mut a = data(&arena, "1");
        a.compactable_memory = 100;
        a.earliest_cached_revision = 1; // pins the whole log

        let mut b = data(&arena, "2");
        b.compactable_memory = 100;
        b.earliest_cached_revision = 90; // pins just the tail

        let mut ranges = vec![a, b];
        let log = log_map(&[(10, 5000), (50, 3000), (100, 1000)]);

        LogCleanupPrioritizer.prioritize(&mut ranges, &MemoryState::default(), &log);

        assert_eq!(TASK_COMPACT, ranges[0].flags);
        assert_eq!(TASK_COMPACT, ranges[1].flags);
        assert!(
            ranges[0].priority < ranges[1].priority,
            "the range pinning more log must run first"
        );
    }

    #[test]
    fn split_beats_compaction() {
        let arena = bumpalo::Bump::new();

        let mut a = data(&arena, "1");
        a.compactable_memory = 100;
        a.earliest_cached_revision = 1;
        a.needs_split = true;

        let mut ranges = vec![a];
        let log = log_map(&[(10, 5000)]);

        LogCleanupPrioritizer.prioritize(&mut ranges, &MemoryState::default(), &log);

        assert_eq!(TASK_SPLIT, ranges[0].flags);
        assert_eq!(i64::MIN, ranges[0].priority);
    }

    #[test]
    fn low_memory_accounts_until_needed() {
        let arena = bumpalo::Bump::new();

        let mut a = data(&arena, "1");
        a.index_mem = 1000;

        let mut b = data(&arena, "2");
        b.compactable_memory = 5000;

        let mut c = data(&arena, "3");
        c.index_mem = 10;

        let mut ranges = vec![a, b, c];
        let memory = MemoryState {
            balance: 6010,
            needed: 5500,
        };

        LowMemoryPrioritizer.prioritize(&mut ranges, &memory, &BTreeMap::new());

        // b (5000) then a (1000) cover the need; c stays untouched
        assert_eq!(TASK_COMPACT, ranges[1].flags);
        assert_eq!(TASK_MEMORY_PURGE, ranges[0].flags);
        assert_eq!(0, ranges[2].flags);
    }

    #[test]
    fn low_memory_skips_busy_ranges() {
        let arena = bumpalo::Bump::new();

        let mut a = data(&arena, "1");
        a.index_mem = 1000;
        a.busy = true;

        let mut ranges = vec![a];
        let memory = MemoryState {
            balance: 1000,
            needed: 500,
        };

        LowMemoryPrioritizer.prioritize(&mut ranges, &memory, &BTreeMap::new());
        assert_eq!(0, ranges[0].flags);
    }
}
