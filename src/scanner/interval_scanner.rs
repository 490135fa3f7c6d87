// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{ScanBlock, ScanSpec};
use crate::{
    cell::Cell,
    key::Key,
    range_locator::{Locator, RangeServerClient, Timer},
    schema::TableIdentifier,
    Slice, END_OF_TABLE,
};
use std::{collections::VecDeque, sync::Arc, time::Duration};

/// One logical scan cursor over a key interval that may span many ranges
/// and servers
///
/// The scanner locates the range holding the interval's start, streams its
/// scan blocks with one block of readahead, and advances to the successor
/// range when the current one is exhausted. Dropping the scanner destroys
/// any still-open server-side scanner.
pub struct IntervalScanner {
    locator: Arc<dyn Locator>,
    client: Arc<dyn RangeServerClient>,
    table: TableIdentifier,
    spec: ScanSpec,
    timeout: Duration,
    retry_table_not_found: bool,

    cells: VecDeque<(Slice, Slice)>,
    scanner: Option<(String, u32)>,
    readahead: Option<crossbeam_channel::Receiver<crate::Result<ScanBlock>>>,
    range_end_row: Slice,
    range_eos: bool,

    rows_seen: u32,
    last_row: Option<Slice>,

    started: bool,
    done: bool,
}

/// Successor of a row key: the smallest row sorting after it.
fn row_successor(row: &[u8]) -> Vec<u8> {
    let mut successor = row.to_vec();
    successor.push(0x00);
    successor
}

impl IntervalScanner {
    /// Creates a scanner; no I/O happens until the first `next`.
    pub fn new(
        locator: Arc<dyn Locator>,
        client: Arc<dyn RangeServerClient>,
        table: TableIdentifier,
        spec: ScanSpec,
        timeout: Duration,
    ) -> crate::Result<Self> {
        spec.validate()?;

        Ok(Self {
            locator,
            client,
            table,
            spec,
            timeout,
            retry_table_not_found: true,
            cells: VecDeque::new(),
            scanner: None,
            readahead: None,
            range_end_row: Slice::empty(),
            range_eos: false,
            rows_seen: 0,
            last_row: None,
            started: false,
            done: false,
        })
    }

    fn range_spec(&self, start_row: &[u8]) -> ScanSpec {
        let mut spec = self.spec.clone();

        if !start_row.is_empty() {
            spec.row_interval.start = Slice::new(start_row);
            spec.row_interval.start_inclusive = true;
        }

        if spec.row_limit > 0 {
            spec.row_limit -= self.rows_seen.min(spec.row_limit);
        }

        spec
    }

    fn issue_readahead(&mut self) {
        let Some((location, id)) = self.scanner.clone() else {
            return;
        };

        let (tx, rx) = crossbeam_channel::bounded(1);
        let client = self.client.clone();

        std::thread::spawn(move || {
            let _ = tx.send(client.fetch_scanblock(&location, id));
        });

        self.readahead = Some(rx);
    }

    fn install_block(&mut self, block: ScanBlock) {
        self.range_eos = block.eos;
        self.scanner = if block.eos {
            None
        } else {
            self.scanner
                .take()
                .map(|(location, _)| (location, block.scanner_id))
        };
        self.cells = block.cells.into();

        if !self.range_eos {
            self.issue_readahead();
        }
    }

    fn start_scan(&mut self, start_row: &[u8]) -> crate::Result<()> {
        let spec = self.range_spec(start_row);
        let probe = if start_row.is_empty() {
            spec.row_interval.start.to_vec()
        } else {
            start_row.to_vec()
        };

        let timer = Timer::new(self.timeout);

        loop {
            if timer.expired() {
                return Err(crate::Error::Timeout);
            }

            let location = self.locator.locate(&self.table, &probe, self.timeout)?;

            match self
                .client
                .create_scanner(&location.location, &self.table, &spec)
            {
                Ok(block) => {
                    self.range_end_row = location.end_row;
                    self.scanner = Some((location.location, block.scanner_id));
                    self.install_block(block);
                    return Ok(());
                }
                Err(crate::Error::GenerationMismatch { expected, .. }) => {
                    // The server moved to a newer schema; retry with it
                    log::debug!(
                        "Schema generation refresh for table {}: {} -> {expected}",
                        self.table.id,
                        self.table.generation
                    );
                    self.table.generation = expected;
                }
                Err(e @ crate::Error::TableNotFound(_)) if self.retry_table_not_found => {
                    log::debug!("Relocating after {e}");
                    self.retry_table_not_found = false;
                    self.locator.invalidate(&self.table, &probe);
                }
                Err(e @ (crate::Error::RangeNotFound(_) | crate::Error::NotConnected)) => {
                    log::debug!("Relocating after {e}");
                    self.locator.invalidate(&self.table, &probe);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn fetch_next_block(&mut self) -> crate::Result<()> {
        if let Some(rx) = self.readahead.take() {
            let block = rx
                .recv()
                .map_err(|_| crate::Error::NotConnected)??;
            self.install_block(block);
            return Ok(());
        }

        let Some((location, id)) = self.scanner.clone() else {
            self.range_eos = true;
            return Ok(());
        };

        let block = self.client.fetch_scanblock(&location, id)?;
        self.install_block(block);
        Ok(())
    }

    fn finished_interval(&self) -> bool {
        if self.range_end_row == END_OF_TABLE {
            return true;
        }

        let end = &self.spec.row_interval.end;
        !end.is_empty() && self.range_end_row >= *end
    }

    fn stop(&mut self) {
        self.done = true;
        self.drain_readahead();

        if let Some((location, id)) = self.scanner.take() {
            if let Err(e) = self.client.destroy_scanner(&location, id) {
                log::debug!("Problem destroying scanner {id}: {e}");
            }
        }
    }

    fn drain_readahead(&mut self) {
        if let Some(rx) = self.readahead.take() {
            if let Ok(Ok(block)) = rx.recv() {
                // The fetched block supersedes the stored scanner id
                if !block.eos {
                    self.scanner = self
                        .scanner
                        .take()
                        .map(|(location, _)| (location, block.scanner_id));
                } else {
                    self.scanner = None;
                }
            }
        }
    }
}

impl Iterator for IntervalScanner {
    type Item = crate::Result<Cell>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }

            if !self.started {
                self.started = true;
                let start = self.spec.row_interval.start.to_vec();
                fail_iter!(self.start_scan(&start));
                continue;
            }

            if let Some((key_bytes, value)) = self.cells.pop_front() {
                let key = fail_iter!(Key::decode(&key_bytes));

                if self.last_row.as_ref() != Some(&key.row) {
                    let limit = self.spec.row_limit;
                    if limit > 0 && self.rows_seen >= limit {
                        self.stop();
                        return None;
                    }
                    self.rows_seen += 1;
                    self.last_row = Some(key.row.clone());
                }

                return Some(Ok(Cell { key, value }));
            }

            if !self.range_eos {
                fail_iter!(self.fetch_next_block());
                continue;
            }

            if self.finished_interval() {
                self.done = true;
                return None;
            }

            // Advance to the next range
            let next_row = row_successor(&self.range_end_row);
            fail_iter!(self.start_scan(&next_row));
        }
    }
}

impl Drop for IntervalScanner {
    fn drop(&mut self) {
        self.stop();
    }
}
