// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{
    LogCleanupPrioritizer, LowMemoryPrioritizer, MaintenancePrioritizer, MaintenanceQueue,
    MaintenanceTask, MaintenanceTaskKind, MemoryState, TASK_COMPACT, TASK_MEMORY_PURGE, TASK_SPLIT,
};
use crate::{access_group::CompactionKind, context::ServerContext, stop_signal::StopSignal};
use std::{sync::Arc, time::Duration};

/// Runs the periodic maintenance cycle: purge unneeded commit log, gather
/// per-range stats, prioritize, enqueue
pub struct MaintenanceScheduler {
    context: Arc<ServerContext>,
    queue: Arc<MaintenanceQueue>,
}

impl MaintenanceScheduler {
    /// Creates a scheduler feeding the given queue.
    #[must_use]
    pub fn new(context: Arc<ServerContext>, queue: Arc<MaintenanceQueue>) -> Self {
        Self { context, queue }
    }

    /// Runs one maintenance cycle.
    pub fn schedule(&self) -> crate::Result<()> {
        let ranges = self.context.tables.all_ranges();

        // Nothing below the lowest cached revision is still needed for
        // replay
        let cutoff = ranges
            .iter()
            .map(|range| range.earliest_cached_revision())
            .min()
            .unwrap_or(i64::MAX);
        self.context.user_log.purge(cutoff)?;

        if ranges.is_empty() {
            return Ok(());
        }

        let arena = bumpalo::Bump::new();
        let mut stats: Vec<_> = ranges
            .iter()
            .map(|range| range.get_maintenance_data(&arena))
            .collect();

        let balance: u64 = stats
            .iter()
            .map(|data| data.cache_mem + data.shadow_cache_mem + data.index_mem + data.filter_mem)
            .sum();
        let memory = MemoryState {
            balance,
            needed: balance.saturating_sub(self.context.config.memory_limit),
        };

        let log_priority = self.context.user_log.load_fragment_priority_map();

        let prioritizer: &dyn MaintenancePrioritizer = if memory.needed > 0 {
            &LowMemoryPrioritizer
        } else {
            &LogCleanupPrioritizer
        };

        log::debug!(
            "Maintenance cycle: {} ranges, balance={balance}, needed={}, strategy={}",
            ranges.len(),
            memory.needed,
            prioritizer.name()
        );

        prioritizer.prioritize(&mut stats, &memory, &log_priority);

        let mut order: Vec<usize> = (0..stats.len()).collect();
        order.sort_by_key(|i| stats[*i].priority);

        for idx in order {
            let data = &stats[idx];
            let range = &ranges[idx];

            if data.flags == 0 || data.busy || self.queue.contains(range) {
                continue;
            }

            let kind = if data.flags & TASK_SPLIT != 0 {
                MaintenanceTaskKind::Split
            } else if data.flags & TASK_COMPACT != 0 {
                MaintenanceTaskKind::Compact(CompactionKind::Minor)
            } else if data.flags & TASK_MEMORY_PURGE != 0 {
                MaintenanceTaskKind::MemoryPurge
            } else {
                continue;
            };

            self.queue
                .add(MaintenanceTask::new(range.clone(), kind, data.priority));
        }

        Ok(())
    }

    /// Spawns the scheduler loop, cycling every `interval` until stopped.
    pub fn start(
        self: Arc<Self>,
        interval: Duration,
        stop: StopSignal,
    ) -> std::thread::JoinHandle<()> {
        std::thread::Builder::new()
            .name("maintenance-scheduler".into())
            .spawn(move || {
                while !stop.is_stopped() {
                    // Sleep in slices so shutdown stays responsive
                    let mut slept = Duration::ZERO;
                    while slept < interval && !stop.is_stopped() {
                        let slice = (interval - slept).min(Duration::from_millis(100));
                        std::thread::sleep(slice);
                        slept += slice;
                    }

                    if stop.is_stopped() {
                        break;
                    }

                    if let Err(e) = self.schedule() {
                        log::error!("Problem running maintenance cycle: {e}");
                    }
                }
            })
            .unwrap_or_else(|e| panic!("spawning maintenance scheduler: {e}"))
    }
}
