// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{scan_block::DEFAULT_SCANBLOCK_SIZE, CellListScanner, ScanBlock};
use rustc_hash::FxHashMap;
use std::{
    iter::Peekable,
    sync::{
        atomic::{AtomicU32, Ordering},
        Mutex,
    },
    time::{Duration, Instant},
};

struct ServerScanner {
    scanner: Peekable<CellListScanner>,
    expires_at: Instant,
}

/// Registry of live server-side scanners, keyed by id
///
/// A scanner not fetched from within its TTL is expired and destroyed; a
/// fetch that drains the scanner retires it immediately.
pub struct ScannerMap {
    scanners: Mutex<FxHashMap<u32, ServerScanner>>,
    next_id: AtomicU32,
    ttl: Duration,
}

impl ScannerMap {
    /// Creates a registry with the given idle TTL.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            scanners: Mutex::new(FxHashMap::default()),
            next_id: AtomicU32::new(1),
            ttl,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FxHashMap<u32, ServerScanner>> {
        #[allow(clippy::expect_used)]
        self.scanners.lock().expect("lock is poisoned")
    }

    fn purge_expired(map: &mut FxHashMap<u32, ServerScanner>) {
        let now = Instant::now();
        map.retain(|id, scanner| {
            let keep = scanner.expires_at > now;
            if !keep {
                log::debug!("Expiring idle scanner {id}");
            }
            keep
        });
    }

    /// Registers a scanner and returns the first scan block.
    ///
    /// If the first block already drains the scanner, it is not retained and
    /// the returned block has `eos` set.
    pub fn create(&self, scanner: CellListScanner) -> crate::Result<ScanBlock> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut scanner = scanner.peekable();

        let block = ScanBlock::fill(&mut scanner, id, DEFAULT_SCANBLOCK_SIZE)?;

        if !block.eos {
            let mut map = self.lock();
            Self::purge_expired(&mut map);
            map.insert(
                id,
                ServerScanner {
                    scanner,
                    expires_at: Instant::now() + self.ttl,
                },
            );
        }

        Ok(block)
    }

    /// Fetches the next block of a registered scanner.
    pub fn fetch(&self, id: u32) -> crate::Result<ScanBlock> {
        let mut entry = {
            let mut map = self.lock();
            Self::purge_expired(&mut map);
            map.remove(&id).ok_or(crate::Error::ScannerNotFound(id))?
        };

        let block = ScanBlock::fill(&mut entry.scanner, id, DEFAULT_SCANBLOCK_SIZE)?;

        if !block.eos {
            entry.expires_at = Instant::now() + self.ttl;
            self.lock().insert(id, entry);
        }

        Ok(block)
    }

    /// Destroys a scanner; unknown ids are fine (the scanner may have hit
    /// EOS and retired itself).
    pub fn destroy(&self, id: u32) {
        self.lock().remove(&id);
    }

    /// Number of live scanners.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns `true` if no scanners are live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{cell::Cell, key::Key};
    use test_log::test;

    fn big_scanner(n: usize) -> CellListScanner {
        Box::new((0..n).map(|i| {
            Ok(Cell::new(
                Key::insert(format!("row-{i:06}"), 1, "", 10, i as i64 + 1),
                vec![0u8; 128],
            ))
        }))
    }

    #[test]
    fn scanner_map_create_fetch_destroy() -> crate::Result<()> {
        let map = ScannerMap::new(Duration::from_secs(60));

        let first = map.create(big_scanner(10_000))?;
        assert!(!first.eos);
        assert_eq!(1, map.len());

        let second = map.fetch(first.scanner_id)?;
        assert!(!second.eos);

        map.destroy(first.scanner_id);
        assert!(map.is_empty());

        assert!(matches!(
            map.fetch(first.scanner_id),
            Err(crate::Error::ScannerNotFound(_))
        ));

        Ok(())
    }

    #[test]
    fn scanner_map_eos_retires() -> crate::Result<()> {
        let map = ScannerMap::new(Duration::from_secs(60));

        let block = map.create(big_scanner(3))?;
        assert!(block.eos);
        assert!(map.is_empty());

        Ok(())
    }

    #[test]
    fn scanner_map_ttl_expiry() -> crate::Result<()> {
        let map = ScannerMap::new(Duration::from_millis(1));

        let block = map.create(big_scanner(10_000))?;
        assert!(!block.eos);

        std::thread::sleep(Duration::from_millis(10));

        assert!(matches!(
            map.fetch(block.scanner_id),
            Err(crate::Error::ScannerNotFound(_))
        ));

        Ok(())
    }
}
