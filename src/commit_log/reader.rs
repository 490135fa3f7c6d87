// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{block_stream::CommitLogBlockStream, LogBlock};
use crate::{
    fs::Filesystem,
    key::Revision,
    schema::TableIdentifier,
};
use std::{
    collections::{HashSet, VecDeque},
    sync::Arc,
};

/// One replayable update block
#[derive(Debug)]
pub struct LogEntry {
    /// Table the update block belongs to
    pub table: TableIdentifier,

    /// Revision of the block
    pub revision: Revision,

    /// Serialized cells
    pub payload: Vec<u8>,
}

struct Frame {
    dir: String,
    fragments: VecDeque<u32>,
    stream: Option<CommitLogBlockStream>,
}

/// Replays a commit log directory, following `LINK` blocks depth-first so a
/// linked log's records appear at the position of its link block.
///
/// Blocks whose revision is below the cutoff are skipped; directories are
/// visited at most once.
pub struct CommitLogReader {
    fs: Arc<dyn Filesystem>,
    revision_cutoff: Revision,
    visited: HashSet<String>,
    frames: Vec<Frame>,
    latest_revision: Revision,
}

fn list_fragments(fs: &Arc<dyn Filesystem>, dir: &str) -> VecDeque<u32> {
    let mut nums: Vec<u32> = match fs.readdir(dir) {
        Ok(listing) => listing
            .iter()
            .filter_map(|name| {
                if let Ok(num) = name.parse::<u32>() {
                    Some(num)
                } else {
                    if name.ends_with(".bad") {
                        log::debug!("Skipping rotated-away fragment {dir}/{name}");
                    }
                    None
                }
            })
            .collect(),
        Err(e) => {
            log::error!("Problem listing log directory {dir:?}: {e}");
            vec![]
        }
    };

    nums.sort_unstable();
    nums.into()
}

impl CommitLogReader {
    /// Opens a reader over a log directory.
    pub fn new(fs: Arc<dyn Filesystem>, log_dir: &str, revision_cutoff: Revision) -> Self {
        let fragments = list_fragments(&fs, log_dir);

        let mut visited = HashSet::new();
        visited.insert(log_dir.trim_end_matches('/').to_owned());

        Self {
            fs,
            revision_cutoff,
            visited,
            frames: vec![Frame {
                dir: log_dir.into(),
                fragments,
                stream: None,
            }],
            latest_revision: 0,
        }
    }

    /// Highest revision seen so far; meaningful after full iteration.
    #[must_use]
    pub fn latest_revision(&self) -> Revision {
        self.latest_revision
    }

    fn enter_link(&mut self, block: &LogBlock) {
        let Some(dir) = block.linked_dir() else {
            log::error!("Malformed link block payload, skipping");
            return;
        };

        let canonical = dir.trim_end_matches('/').to_owned();
        if !self.visited.insert(canonical) {
            log::debug!("Skipping already-visited linked log {dir}");
            return;
        }

        let fragments = list_fragments(&self.fs, &dir);
        log::debug!("Following link into {dir} ({} fragments)", fragments.len());

        self.frames.push(Frame {
            dir,
            fragments,
            stream: None,
        });
    }
}

impl Iterator for CommitLogReader {
    type Item = crate::Result<LogEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let frame = self.frames.last_mut()?;

            if frame.stream.is_none() {
                let Some(num) = frame.fragments.pop_front() else {
                    self.frames.pop();
                    continue;
                };

                let fragment = format!("{}/{num}", frame.dir);
                match CommitLogBlockStream::open(self.fs.clone(), &fragment) {
                    Ok(stream) => frame.stream = Some(stream),
                    Err(e) => {
                        log::error!("Problem opening fragment {fragment:?}: {e}");
                    }
                }
                continue;
            }

            #[allow(clippy::expect_used)]
            let stream = frame.stream.as_mut().expect("stream exists");

            let Some(block) = stream.next() else {
                frame.stream = None;
                continue;
            };

            let block = fail_iter!(block);

            if block.is_link() {
                self.enter_link(&block);
                continue;
            }

            self.latest_revision = self.latest_revision.max(block.revision);

            if block.revision < self.revision_cutoff {
                continue;
            }

            return Some(Ok(LogEntry {
                table: block.table,
                revision: block.revision,
                payload: block.payload,
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        commit_log::{CommitLog, CommitLogOptions},
        fs::LocalBroker,
        CompressionType,
    };
    use test_log::test;

    fn options() -> CommitLogOptions {
        CommitLogOptions {
            compressor: CompressionType::Zlib,
            roll_limit: 1024 * 1024,
            flush: false,
        }
    }

    #[test]
    fn reader_follows_links_in_place() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let fs: Arc<dyn Filesystem> = Arc::new(LocalBroker::new(dir.path()));
        let table = TableIdentifier::new("1", 1);

        // Log B carries revisions 1..=3
        let log_b = CommitLog::create(fs.clone(), "log-b", options())?;
        for rev in 1..=3i64 {
            log_b.write(&table, format!("b-{rev}").as_bytes(), rev)?;
        }
        log_b.close()?;

        // Log A links B, then writes revision 4
        let log_a = CommitLog::create(fs.clone(), "log-a", options())?;
        log_a.link_log("log-b", 3)?;
        log_a.write(&table, b"a-4", 4)?;
        log_a.close()?;

        let revisions: Vec<i64> = CommitLogReader::new(fs, "log-a", 0)
            .collect::<crate::Result<Vec<_>>>()?
            .iter()
            .map(|e| e.revision)
            .collect();

        assert_eq!(vec![1, 2, 3, 4], revisions);

        Ok(())
    }

    #[test]
    fn reader_applies_revision_cutoff() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let fs: Arc<dyn Filesystem> = Arc::new(LocalBroker::new(dir.path()));
        let table = TableIdentifier::new("1", 1);

        let log = CommitLog::create(fs.clone(), "log", options())?;
        for rev in 1..=6i64 {
            log.write(&table, b"x", rev)?;
        }
        log.close()?;

        let mut reader = CommitLogReader::new(fs, "log", 4);
        let revisions: Vec<i64> = reader
            .by_ref()
            .collect::<crate::Result<Vec<_>>>()?
            .iter()
            .map(|e| e.revision)
            .collect();

        assert_eq!(vec![4, 5, 6], revisions);
        assert_eq!(6, reader.latest_revision());

        Ok(())
    }

    #[test]
    fn reader_ignores_duplicate_links() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let fs: Arc<dyn Filesystem> = Arc::new(LocalBroker::new(dir.path()));
        let table = TableIdentifier::new("1", 1);

        let log_b = CommitLog::create(fs.clone(), "log-b", options())?;
        log_b.write(&table, b"b", 1)?;
        log_b.close()?;

        let log_a = CommitLog::create(fs.clone(), "log-a", options())?;
        log_a.link_log("log-b", 1)?;
        log_a.link_log("log-b", 1)?;
        log_a.write(&table, b"a", 2)?;
        log_a.close()?;

        let entries = CommitLogReader::new(fs, "log-a", 0).collect::<crate::Result<Vec<_>>>()?;
        assert_eq!(2, entries.len());

        Ok(())
    }
}
