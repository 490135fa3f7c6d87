// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{MaintenanceTask, MaintenanceTaskKind};
use crate::{context::ServerContext, range::Range};
use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashSet},
    sync::{Arc, Condvar, Mutex},
    thread::JoinHandle,
    time::{Duration, Instant},
};

const RETRY_DELAY: Duration = Duration::from_secs(5);

struct QueuedTask(MaintenanceTask);

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.0.start_time == other.0.start_time && self.0.priority == other.0.priority
    }
}

impl Eq for QueuedTask {}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap; reverse so the earliest start time and
        // the lowest priority pop first
        (
            Reverse(self.0.start_time),
            Reverse(self.0.priority),
        )
            .cmp(&(Reverse(other.0.start_time), Reverse(other.0.priority)))
    }
}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

fn range_key(range: &Arc<Range>) -> usize {
    Arc::as_ptr(range) as usize
}

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<QueuedTask>,
    pending: HashSet<usize>,
    in_progress: HashSet<usize>,
    pause: usize,
    shutdown: bool,
}

/// Priority-ordered maintenance work queue with worker threads
///
/// Workers block until the earliest start time of a queued task arrives.
/// A range is "in the queue" while a task for it is pending or running; a
/// second task for the same range is rejected until the first finishes. A
/// failed task is re-enqueued with a delay, except memory purges, which are
/// dropped to avoid feedback loops.
pub struct MaintenanceQueue {
    context: Arc<ServerContext>,
    state: Mutex<QueueState>,
    cond: Condvar,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl MaintenanceQueue {
    /// Creates the queue and spawns `worker_count` worker threads.
    pub fn start(context: Arc<ServerContext>, worker_count: usize) -> Arc<Self> {
        let queue = Arc::new(Self {
            context,
            state: Mutex::new(QueueState::default()),
            cond: Condvar::new(),
            workers: Mutex::new(vec![]),
        });

        let mut workers = vec![];
        for i in 0..worker_count.max(1) {
            let queue = queue.clone();
            workers.push(
                std::thread::Builder::new()
                    .name(format!("maintenance-{i}"))
                    .spawn(move || queue.worker_loop())
                    .unwrap_or_else(|e| panic!("spawning maintenance worker: {e}")),
            );
        }

        #[allow(clippy::expect_used)]
        {
            *queue.workers.lock().expect("lock is poisoned") = workers;
        }

        queue
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        #[allow(clippy::expect_used)]
        self.state.lock().expect("lock is poisoned")
    }

    /// Returns `true` if a task for the range is pending or running.
    #[must_use]
    pub fn contains(&self, range: &Arc<Range>) -> bool {
        let state = self.lock();
        let key = range_key(range);
        state.pending.contains(&key) || state.in_progress.contains(&key)
    }

    /// Enqueues a task unless the range already has one queued or running.
    /// Returns `false` if the task was rejected.
    pub fn add(&self, task: MaintenanceTask) -> bool {
        let mut state = self.lock();

        if state.shutdown {
            return false;
        }

        let key = range_key(&task.range);
        if state.pending.contains(&key) || state.in_progress.contains(&key) {
            return false;
        }

        state.pending.insert(key);
        state.heap.push(QueuedTask(task));
        self.cond.notify_one();

        true
    }

    /// Stops dispatch; every `pause` needs a matching `resume`.
    pub fn pause(&self) {
        self.lock().pause += 1;
    }

    /// Resumes dispatch.
    pub fn resume(&self) {
        let mut state = self.lock();
        state.pause = state.pause.saturating_sub(1);
        drop(state);
        self.cond.notify_all();
    }

    /// Blocks until no task is pending or running.
    pub fn wait_for_empty(&self) {
        let mut state = self.lock();
        while !state.heap.is_empty() || !state.in_progress.is_empty() {
            #[allow(clippy::expect_used)]
            let (next, _) = self
                .cond
                .wait_timeout(state, Duration::from_millis(50))
                .expect("lock is poisoned");
            state = next;
        }
    }

    /// Signals shutdown and joins the workers.
    pub fn shutdown(&self) {
        {
            let mut state = self.lock();
            state.shutdown = true;
        }
        self.cond.notify_all();

        #[allow(clippy::expect_used)]
        let mut workers = self.workers.lock().expect("lock is poisoned");
        for worker in workers.drain(..) {
            let _ = worker.join();
        }
    }

    fn next_task(&self) -> Option<MaintenanceTask> {
        let mut state = self.lock();

        loop {
            if state.shutdown {
                return None;
            }

            let now = Instant::now();

            let ready = state.pause == 0
                && state
                    .heap
                    .peek()
                    .is_some_and(|task| task.0.start_time <= now);

            if ready {
                #[allow(clippy::expect_used)]
                let task = state.heap.pop().expect("peeked").0;
                let key = range_key(&task.range);
                state.pending.remove(&key);
                state.in_progress.insert(key);
                return Some(task);
            }

            let wait = if state.pause > 0 {
                Duration::from_millis(200)
            } else {
                state
                    .heap
                    .peek()
                    .map(|task| {
                        task.0
                            .start_time
                            .saturating_duration_since(now)
                            .min(Duration::from_millis(500))
                    })
                    .unwrap_or(Duration::from_millis(500))
            };

            #[allow(clippy::expect_used)]
            let (next, _) = self
                .cond
                .wait_timeout(state, wait)
                .expect("lock is poisoned");
            state = next;
        }
    }

    fn finish_task(&self, range: &Arc<Range>) {
        let mut state = self.lock();
        state.in_progress.remove(&range_key(range));
        drop(state);
        self.cond.notify_all();
    }

    fn worker_loop(self: Arc<Self>) {
        while let Some(mut task) = self.next_task() {
            let result = self.execute(&task);
            let range = task.range.clone();

            match result {
                Ok(()) => self.finish_task(&range),
                Err(e) => {
                    self.finish_task(&range);

                    if task.kind == MaintenanceTaskKind::MemoryPurge {
                        log::warn!("Dropping failed memory purge for {range:?}: {e}");
                        continue;
                    }

                    log::warn!("Re-enqueueing failed task {task:?} after {e}");
                    task.retries += 1;
                    task.start_time = Instant::now() + RETRY_DELAY;
                    self.add(task);
                }
            }
        }
    }

    fn execute(&self, task: &MaintenanceTask) -> crate::Result<()> {
        log::debug!("Running {task:?}");

        match task.kind {
            MaintenanceTaskKind::Split => {
                task.range.split(&self.context)?;
                Ok(())
            }
            MaintenanceTaskKind::Compact(kind) => task.range.compact(&self.context, kind),
            MaintenanceTaskKind::MemoryPurge => {
                task.range.purge_memory()?;
                Ok(())
            }
        }
    }
}
