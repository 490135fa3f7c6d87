// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Background maintenance: the work queue, the prioritizers that decide
//! what runs, and the scheduler cycle tying them together.

mod prioritizer;
mod queue;
mod scheduler;

pub use prioritizer::{
    LogCleanupPrioritizer, LowMemoryPrioritizer, MaintenancePrioritizer, MemoryState,
};
pub use queue::MaintenanceQueue;
pub use scheduler::MaintenanceScheduler;

use crate::{access_group::CompactionKind, range::Range};
use std::{sync::Arc, time::Instant};

/// Task flag: the range should split
pub const TASK_SPLIT: u32 = 0x01;

/// Task flag: the range should compact
pub const TASK_COMPACT: u32 = 0x02;

/// Task flag: the range should drop droppable memory
pub const TASK_MEMORY_PURGE: u32 = 0x04;

/// What a maintenance task does when it runs
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MaintenanceTaskKind {
    /// Split the range at its median row
    Split,

    /// Compact the range
    Compact(CompactionKind),

    /// Drop block indexes and bloom filters
    MemoryPurge,
}

/// One queued unit of maintenance work
pub struct MaintenanceTask {
    /// Range the task operates on
    pub range: Arc<Range>,

    /// Operation to run
    pub kind: MaintenanceTaskKind,

    /// Priority; lower runs earlier among ready tasks
    pub priority: i64,

    /// Earliest time the task may run
    pub start_time: Instant,

    /// How often the task failed and was re-enqueued
    pub retries: u32,
}

impl MaintenanceTask {
    /// Creates an immediately runnable task.
    #[must_use]
    pub fn new(range: Arc<Range>, kind: MaintenanceTaskKind, priority: i64) -> Self {
        Self {
            range,
            kind,
            priority,
            start_time: Instant::now(),
            retries: 0,
        }
    }
}

impl std::fmt::Debug for MaintenanceTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "MaintenanceTask({:?}, {:?}, priority={})",
            self.kind, self.range, self.priority
        )
    }
}
