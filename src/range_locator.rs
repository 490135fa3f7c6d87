// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Routes a row key to the range server holding its range.
//!
//! Locations resolve through the two-level METADATA table: the root range
//! (found through the coordination service) maps second-level METADATA
//! ranges, which map user ranges. Results are cached; misses walk the
//! levels with deadline-bounded retries.

use crate::{
    key::Key,
    location_cache::LocationCache,
    scanner::{RowInterval, ScanBlock, ScanSpec},
    schema::TableIdentifier,
    Slice, END_OF_TABLE,
};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};

/// Table id of the METADATA table
pub const METADATA_TABLE_ID: &str = "0";

/// Column family code of the METADATA `StartRow` column
pub const METADATA_STARTROW_FAMILY: u8 = 1;

/// Column family code of the METADATA `Location` column
pub const METADATA_LOCATION_FAMILY: u8 = 2;

/// Coordination file holding the root range pointer
pub const ROOT_FILE: &str = "/hypertable/root";

const METADATA_COLUMNS: [&str; 2] = ["StartRow", "Location"];

/// Where a range lives: its interval and its server
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RangeLocation {
    /// Exclusive start row of the range
    pub start_row: Slice,

    /// Inclusive end row of the range
    pub end_row: Slice,

    /// Server the range is assigned to
    pub location: String,
}

/// The coordination-service surface the locator consumes
pub trait Hyperspace: Send + Sync {
    /// Reads an attribute of a coordination file.
    fn attr_get(&self, file: &str, attr: &str) -> crate::Result<Vec<u8>>;
}

/// The remote range-server surface the client stack consumes
pub trait RangeServerClient: Send + Sync {
    /// Opens a scanner and returns the first block.
    fn create_scanner(
        &self,
        location: &str,
        table: &TableIdentifier,
        spec: &ScanSpec,
    ) -> crate::Result<ScanBlock>;

    /// Fetches the next block of an open scanner.
    fn fetch_scanblock(&self, location: &str, scanner_id: u32) -> crate::Result<ScanBlock>;

    /// Destroys an open scanner.
    fn destroy_scanner(&self, location: &str, scanner_id: u32) -> crate::Result<()>;
}

/// Anything that can resolve a row to a range location
///
/// [`RangeLocator`] is the METADATA-walking implementation; a local,
/// in-process deployment may answer from its own table map instead.
pub trait Locator: Send + Sync {
    /// Resolves the range containing `(table, row)` within `timeout`.
    fn locate(
        &self,
        table: &TableIdentifier,
        row: &[u8],
        timeout: Duration,
    ) -> crate::Result<RangeLocation>;

    /// Drops cached state covering `(table, row)` after a routing miss.
    fn invalidate(&self, table: &TableIdentifier, row: &[u8]);
}

/// Deadline carried through retry loops
#[derive(Clone, Copy, Debug)]
pub struct Timer {
    deadline: Instant,
}

impl Timer {
    /// Starts a timer expiring after `timeout`.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            deadline: Instant::now() + timeout,
        }
    }

    /// Returns `true` once the deadline passed.
    #[must_use]
    pub fn expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Time left until the deadline.
    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

const RETRY_INITIAL: Duration = Duration::from_millis(1000);
const RETRY_FACTOR: f32 = 1.5;

/// Resolves rows through the two-level METADATA walk, with caching
pub struct RangeLocator {
    hyperspace: Arc<dyn Hyperspace>,
    client: Arc<dyn RangeServerClient>,
    cache: LocationCache,
}

fn metadata_row(prefix: &str, row: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + 1 + row.len());
    key.extend_from_slice(prefix.as_bytes());
    key.push(b':');
    key.extend_from_slice(row);
    key
}

fn metadata_scan_spec(start: Vec<u8>, end: Vec<u8>) -> ScanSpec {
    ScanSpec {
        row_interval: RowInterval {
            start: start.into(),
            start_inclusive: true,
            end: end.into(),
            end_inclusive: true,
        },
        columns: METADATA_COLUMNS.iter().map(|c| (*c).to_string()).collect(),
        max_versions: 1,
        ..Default::default()
    }
}

/// Parses the first row of a METADATA scan result into a range location.
fn parse_metadata_row(block: &ScanBlock, key_prefix: &str) -> crate::Result<RangeLocation> {
    let mut row: Option<Slice> = None;
    let mut start_row = None;
    let mut location = None;

    for (key_bytes, value) in &block.cells {
        let key = Key::decode(key_bytes)?;

        match &row {
            None => row = Some(key.row.clone()),
            Some(first) if *first != key.row => break,
            Some(_) => {}
        }

        match key.family {
            METADATA_STARTROW_FAMILY => start_row = Some(value.clone()),
            METADATA_LOCATION_FAMILY => location = Some(value.clone()),
            _ => {}
        }
    }

    let (Some(row), Some(start_row), Some(location)) = (row, start_row, location) else {
        return Err(crate::Error::RangeNotFound(
            "incomplete METADATA row".into(),
        ));
    };

    // The METADATA row key is "<prefix>:<end row>"
    let end_row = row
        .strip_prefix(metadata_row(key_prefix, b"").as_slice())
        .map(Slice::new)
        .ok_or_else(|| crate::Error::RangeNotFound("malformed METADATA row key".into()))?;

    Ok(RangeLocation {
        start_row: Slice::new(&start_row),
        end_row,
        location: String::from_utf8_lossy(&location).into_owned(),
    })
}

impl RangeLocator {
    /// Creates a locator.
    #[must_use]
    pub fn new(
        hyperspace: Arc<dyn Hyperspace>,
        client: Arc<dyn RangeServerClient>,
        cache_max_entries: usize,
    ) -> Self {
        Self {
            hyperspace,
            client,
            cache: LocationCache::new(cache_max_entries),
        }
    }

    fn root_location(&self) -> crate::Result<String> {
        if let Some(hit) = self.cache.lookup(METADATA_TABLE_ID, b"0:") {
            return Ok(hit.location);
        }

        let raw = self.hyperspace.attr_get(ROOT_FILE, "Location")?;
        let location = String::from_utf8_lossy(&raw).into_owned();

        // The root range covers every first-level METADATA row
        self.cache.insert(
            METADATA_TABLE_ID,
            RangeLocation {
                start_row: Slice::empty(),
                end_row: metadata_row("0", END_OF_TABLE).into(),
                location: location.clone(),
            },
            true,
        );

        Ok(location)
    }

    fn metadata_scan(
        &self,
        location: &str,
        start: Vec<u8>,
        end: Vec<u8>,
        key_prefix: &str,
    ) -> crate::Result<RangeLocation> {
        let table = TableIdentifier::new(METADATA_TABLE_ID, 0);
        let spec = metadata_scan_spec(start, end);

        let block = self.client.create_scanner(location, &table, &spec)?;

        if !block.eos {
            // Readahead is pointless here; release the server scanner
            if let Err(e) = self.client.destroy_scanner(location, block.scanner_id) {
                log::debug!("Problem destroying METADATA scanner: {e}");
            }
        }

        parse_metadata_row(&block, key_prefix)
    }

    /// One resolution attempt, cache first.
    fn find(&self, table: &TableIdentifier, row: &[u8]) -> crate::Result<RangeLocation> {
        if let Some(hit) = self.cache.lookup(&table.id, row) {
            return Ok(hit);
        }

        let root = self.root_location()?;

        // Level 2: which METADATA range holds this table's rows?
        let probe = metadata_row("0", &metadata_row(&table.id, row));
        let end = metadata_row("0", &metadata_row(&table.id, END_OF_TABLE));
        let level2 = self.metadata_scan(&root, probe, end, "0")?;

        self.cache
            .insert(METADATA_TABLE_ID, level2.clone(), false);

        // Level 3: the user range itself
        let probe = metadata_row(&table.id, row);
        let end = metadata_row(&table.id, END_OF_TABLE);
        let user = self.metadata_scan(&level2.location, probe, end, &table.id)?;

        self.cache.insert(&table.id, user.clone(), false);

        Ok(user)
    }
}

impl Locator for RangeLocator {
    /// Resolves with exponential backoff until the deadline.
    ///
    /// `TableNotFound` is terminal; routing and transport errors retry.
    fn locate(
        &self,
        table: &TableIdentifier,
        row: &[u8],
        timeout: Duration,
    ) -> crate::Result<RangeLocation> {
        let timer = Timer::new(timeout);
        let mut wait = RETRY_INITIAL;

        loop {
            match self.find(table, row) {
                Ok(location) => return Ok(location),
                Err(e @ crate::Error::TableNotFound(_)) => return Err(e),
                Err(e) if e.is_retryable() => {
                    if timer.expired() {
                        return Err(crate::Error::Timeout);
                    }

                    log::debug!("Retrying range location of {table} after {e}");
                    self.cache.invalidate(&table.id, row);

                    std::thread::sleep(wait.min(timer.remaining()));
                    wait = wait.mul_f32(RETRY_FACTOR);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn invalidate(&self, table: &TableIdentifier, row: &[u8]) {
        self.cache.invalidate(&table.id, row);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use test_log::test;

    struct MockHyperspace;

    impl Hyperspace for MockHyperspace {
        fn attr_get(&self, file: &str, attr: &str) -> crate::Result<Vec<u8>> {
            assert_eq!(ROOT_FILE, file);
            assert_eq!("Location", attr);
            Ok(b"rs-root".to_vec())
        }
    }

    fn metadata_cells(row: &[u8], start_row: &[u8], location: &str) -> Vec<(Slice, Slice)> {
        let mut cells = vec![];

        let key = Key::insert(row, METADATA_STARTROW_FAMILY, "", 1, 1);
        cells.push((key.encode(), Slice::new(start_row)));

        let key = Key::insert(row, METADATA_LOCATION_FAMILY, "", 1, 1);
        cells.push((key.encode(), Slice::new(location.as_bytes())));

        cells
    }

    /// Serves the root range on "rs-root" and one second-level METADATA
    /// range on "rs-meta2"; user table "7" lives on "rs-user".
    struct MockClient {
        calls: Mutex<Vec<String>>,
    }

    impl RangeServerClient for MockClient {
        fn create_scanner(
            &self,
            location: &str,
            table: &TableIdentifier,
            spec: &ScanSpec,
        ) -> crate::Result<ScanBlock> {
            assert_eq!(METADATA_TABLE_ID, &*table.id);

            #[allow(clippy::expect_used)]
            self.calls
                .lock()
                .expect("lock is poisoned")
                .push(location.to_owned());

            let start = spec.row_interval.start.to_vec();

            let cells = match location {
                // Root: second-level range "7:<END>" starts at "" and
                // lives on rs-meta2
                "rs-root" => {
                    assert!(start.starts_with(b"0:7:"));
                    let mut row = b"0:7:".to_vec();
                    row.extend_from_slice(END_OF_TABLE);
                    metadata_cells(&row, b"", "rs-meta2")
                }
                // Second level: user range "(g..<END>]" on rs-user
                "rs-meta2" => {
                    assert!(start.starts_with(b"7:"));
                    let mut row = b"7:".to_vec();
                    row.extend_from_slice(END_OF_TABLE);
                    metadata_cells(&row, b"g", "rs-user")
                }
                _ => {
                    return Err(crate::Error::NotConnected);
                }
            };

            Ok(ScanBlock {
                scanner_id: 1,
                eos: true,
                cells,
            })
        }

        fn fetch_scanblock(&self, _: &str, _: u32) -> crate::Result<ScanBlock> {
            unreachable!("metadata scans are single-block")
        }

        fn destroy_scanner(&self, _: &str, _: u32) -> crate::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn range_locator_two_level_walk() -> crate::Result<()> {
        let client = Arc::new(MockClient {
            calls: Mutex::new(vec![]),
        });

        let locator = RangeLocator::new(Arc::new(MockHyperspace), client.clone(), 64);
        let table = TableIdentifier::new("7", 1);

        let location = locator.locate(&table, b"zebra", Duration::from_secs(5))?;
        assert_eq!("rs-user", location.location);
        assert_eq!(b"g", &*location.start_row);
        assert_eq!(END_OF_TABLE, &*location.end_row);

        {
            #[allow(clippy::expect_used)]
            let calls = client.calls.lock().expect("lock is poisoned");
            assert_eq!(vec!["rs-root".to_owned(), "rs-meta2".to_owned()], *calls);
        }

        // Second resolution is served from the cache
        let again = locator.locate(&table, b"zulu", Duration::from_secs(5))?;
        assert_eq!("rs-user", again.location);

        #[allow(clippy::expect_used)]
        let calls = client.calls.lock().expect("lock is poisoned");
        assert_eq!(2, calls.len());

        Ok(())
    }
}
