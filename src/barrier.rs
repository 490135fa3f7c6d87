// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::sync::{Condvar, Mutex};

#[derive(Default)]
struct BarrierState {
    counter: usize,
    up: bool,
}

/// A counting barrier guarding a class of operations on a range
///
/// Any number of operations may hold the barrier concurrently; raising it
/// blocks new entries and waits for the holders to drain. Maintenance that
/// mutates a range raises the update barrier (and briefly the scan barrier)
/// around its critical sections.
#[derive(Default)]
pub struct Barrier {
    state: Mutex<BarrierState>,
    cond: Condvar,
}

/// Releases one barrier entry on drop
pub struct BarrierEntry<'a> {
    barrier: &'a Barrier,
}

/// Lowers a raised barrier on drop
pub struct BarrierRaise<'a> {
    barrier: &'a Barrier,
}

impl Barrier {
    /// Enters the barrier, waiting while it is raised.
    pub fn enter(&self) -> BarrierEntry<'_> {
        #[allow(clippy::expect_used)]
        let mut state = self.state.lock().expect("lock is poisoned");

        while state.up {
            #[allow(clippy::expect_used)]
            {
                state = self.cond.wait(state).expect("lock is poisoned");
            }
        }

        state.counter += 1;
        BarrierEntry { barrier: self }
    }

    /// Raises the barrier: blocks new entries, then waits until current
    /// holders drain.
    pub fn put_up(&self) -> BarrierRaise<'_> {
        #[allow(clippy::expect_used)]
        let mut state = self.state.lock().expect("lock is poisoned");

        while state.up {
            #[allow(clippy::expect_used)]
            {
                state = self.cond.wait(state).expect("lock is poisoned");
            }
        }

        state.up = true;

        while state.counter > 0 {
            #[allow(clippy::expect_used)]
            {
                state = self.cond.wait(state).expect("lock is poisoned");
            }
        }

        BarrierRaise { barrier: self }
    }
}

impl Drop for BarrierEntry<'_> {
    fn drop(&mut self) {
        #[allow(clippy::expect_used)]
        let mut state = self.barrier.state.lock().expect("lock is poisoned");
        state.counter -= 1;
        if state.counter == 0 {
            self.barrier.cond.notify_all();
        }
    }
}

impl Drop for BarrierRaise<'_> {
    fn drop(&mut self) {
        #[allow(clippy::expect_used)]
        let mut state = self.barrier.state.lock().expect("lock is poisoned");
        state.up = false;
        self.barrier.cond.notify_all();
    }
}

/// Single-entry latch marking a range as undergoing maintenance
#[derive(Default)]
pub struct MaintenanceGuard {
    in_progress: Mutex<bool>,
}

/// Clears the in-progress mark on every exit path
pub struct Activator<'a> {
    guard: &'a MaintenanceGuard,
}

impl MaintenanceGuard {
    /// Marks maintenance as in progress.
    ///
    /// Fails with [`crate::Error::RangeBusy`] if another task holds the
    /// guard.
    pub fn activate(&self) -> crate::Result<Activator<'_>> {
        #[allow(clippy::expect_used)]
        let mut in_progress = self.in_progress.lock().expect("lock is poisoned");

        if *in_progress {
            return Err(crate::Error::RangeBusy);
        }

        *in_progress = true;
        Ok(Activator { guard: self })
    }

    /// Returns `true` while a maintenance task runs on the range.
    #[must_use]
    pub fn in_progress(&self) -> bool {
        #[allow(clippy::expect_used)]
        *self.in_progress.lock().expect("lock is poisoned")
    }
}

impl Drop for Activator<'_> {
    fn drop(&mut self) {
        #[allow(clippy::expect_used)]
        let mut in_progress = self.guard.in_progress.lock().expect("lock is poisoned");
        *in_progress = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };
    use test_log::test;

    #[test]
    fn barrier_counts_holders() {
        let barrier = Barrier::default();

        let a = barrier.enter();
        let b = barrier.enter();
        drop(a);
        drop(b);

        let raised = barrier.put_up();
        drop(raised);

        let _ = barrier.enter();
    }

    #[test]
    fn barrier_raise_waits_for_drain() {
        let barrier = Arc::new(Barrier::default());
        let entered = Arc::new(AtomicUsize::new(0));

        let entry = barrier.enter();

        let handle = {
            let barrier = barrier.clone();
            let entered = entered.clone();
            std::thread::spawn(move || {
                let _raised = barrier.put_up();
                entered.store(1, Ordering::SeqCst);
            })
        };

        std::thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(0, entered.load(Ordering::SeqCst), "raise must wait");

        drop(entry);
        handle.join().expect("thread panicked");
        assert_eq!(1, entered.load(Ordering::SeqCst));
    }

    #[test]
    fn maintenance_guard_single_entry() -> crate::Result<()> {
        let guard = MaintenanceGuard::default();

        let activator = guard.activate()?;
        assert!(guard.in_progress());

        assert!(matches!(guard.activate(), Err(crate::Error::RangeBusy)));

        drop(activator);
        assert!(!guard.in_progress());

        let _second = guard.activate()?;
        Ok(())
    }
}
