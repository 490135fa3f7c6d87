// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Durable, rollable, linkable commit log.
//!
//! A log is a directory of numerically named fragment files, each a stream
//! of framed, compressed blocks. Fragments roll when they exceed the
//! configured size; purge drops fragments whose data has been compacted;
//! `link_log` stitches another log directory into this one via a `LINK`
//! block so its records replay in place.

mod block_stream;
mod reader;

pub use block_stream::{CommitLogBlockStream, LogBlock};
pub use reader::CommitLogReader;

use crate::{
    block,
    coding::{Decode, Encode},
    fs::{Fd, Filesystem, OpenFlags},
    key::Revision,
    schema::TableIdentifier,
    CompressionType,
};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::{
    collections::{BTreeMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
};

pub(crate) const MAGIC_DATA: [u8; 10] = *b"COMMITDATA";
pub(crate) const MAGIC_LINK: [u8; 10] = *b"COMMITLINK";

const FRAGMENT_REPLICATION: i32 = 3;
const FRAGMENT_BLOCK_SIZE: i64 = 67_108_864;

/// One closed fragment file of a commit log
#[derive(Clone, Debug)]
pub struct FragmentInfo {
    /// Directory the fragment lives in
    pub log_dir: String,

    /// Numeric file name
    pub num: u32,

    /// File size in bytes
    pub size: u64,

    /// Highest revision of any block in the fragment
    pub revision: Revision,

    /// Remove the whole directory once this fragment is purged
    pub purge_log_dir: bool,
}

/// Per-fragment cost data for the log-cleanup prioritizer
#[derive(Clone, Copy, Debug, Default)]
pub struct FragmentPriorityData {
    /// Fragments between this one and the tail
    pub distance: u32,

    /// Bytes of log this fragment and everything newer pin
    pub cumulative_size: u64,
}

/// Commit log writer settings
#[derive(Clone, Debug)]
pub struct CommitLogOptions {
    /// Codec for data blocks
    pub compressor: CompressionType,

    /// Fragment size that triggers a roll
    pub roll_limit: u64,

    /// Follow every append with a durable flush
    pub flush: bool,
}

impl Default for CommitLogOptions {
    fn default() -> Self {
        Self {
            compressor: CompressionType::Zlib,
            roll_limit: 100 * 1024 * 1024,
            flush: true,
        }
    }
}

impl From<&crate::Config> for CommitLogOptions {
    fn from(config: &crate::Config) -> Self {
        Self {
            compressor: config.commit_log_compressor,
            roll_limit: config.commit_log_roll_limit,
            flush: config.commit_log_flush,
        }
    }
}

struct LogWriter {
    fd: Option<Fd>,
    cur_fragment_num: u32,
    cur_fragment_length: u64,
    latest_revision: Revision,
    fragment_queue: VecDeque<FragmentInfo>,
    needs_roll: bool,
}

/// Single-appender commit log over a broker directory
pub struct CommitLog {
    fs: Arc<dyn Filesystem>,
    log_dir: String,
    options: CommitLogOptions,
    inner: Mutex<LogWriter>,
}

/// Serializes the commit log block header extension: revision + table.
pub(crate) fn encode_extension(revision: Revision, table: &TableIdentifier) -> Vec<u8> {
    let mut ext = Vec::with_capacity(8 + 2 + table.id.len() + 4);

    #[allow(clippy::expect_used)]
    {
        ext.write_i64::<BigEndian>(revision).expect("should not fail");
        table.encode_into(&mut ext).expect("should not fail");
    }

    ext
}

/// Parses a commit log block header extension.
pub(crate) fn decode_extension(ext: &[u8]) -> crate::Result<(Revision, TableIdentifier)> {
    let mut cursor = ext;
    let revision = cursor
        .read_i64::<BigEndian>()
        .map_err(|_| crate::Error::BadCompressionHeader("short commit log extension"))?;
    let table = TableIdentifier::decode_from(&mut cursor)?;
    Ok((revision, table))
}

impl CommitLog {
    /// Opens a commit log for appending, creating the directory if needed.
    ///
    /// The first fragment is numbered one past the highest numeric name
    /// already present, so a reopened log never overwrites old fragments.
    pub fn create(
        fs: Arc<dyn Filesystem>,
        log_dir: &str,
        options: CommitLogOptions,
    ) -> crate::Result<Self> {
        fs.mkdirs(log_dir)?;

        let mut cur_fragment_num = 0;
        for name in fs.readdir(log_dir)? {
            if let Ok(num) = name.parse::<u32>() {
                cur_fragment_num = cur_fragment_num.max(num + 1);
            }
        }

        let fname = format!("{log_dir}/{cur_fragment_num}");
        let fd = fs.create(&fname, true, FRAGMENT_REPLICATION, FRAGMENT_BLOCK_SIZE)?;

        Ok(Self {
            fs,
            log_dir: log_dir.into(),
            options,
            inner: Mutex::new(LogWriter {
                fd: Some(fd),
                cur_fragment_num,
                cur_fragment_length: 0,
                latest_revision: 0,
                fragment_queue: VecDeque::new(),
                needs_roll: false,
            }),
        })
    }

    /// Directory this log writes into.
    #[must_use]
    pub fn log_dir(&self) -> &str {
        &self.log_dir
    }

    /// Highest revision appended to the still-open fragment.
    #[must_use]
    pub fn latest_revision(&self) -> Revision {
        self.lock().latest_revision
    }

    fn lock(&self) -> MutexGuard<'_, LogWriter> {
        #[allow(clippy::expect_used)]
        self.inner.lock().expect("lock is poisoned")
    }

    fn flush_flag(&self) -> OpenFlags {
        if self.options.flush {
            OpenFlags::Flush
        } else {
            OpenFlags::None
        }
    }

    /// Compresses a block of updates and appends it.
    ///
    /// Rolls the fragment first if a previous roll failed, and afterwards if
    /// the fragment outgrew the roll limit.
    pub fn write(
        &self,
        table: &TableIdentifier,
        payload: &[u8],
        revision: Revision,
    ) -> crate::Result<()> {
        self.write_flags(table, payload, revision, self.flush_flag())
    }

    /// Like [`CommitLog::write`], with an explicit flush decision for this
    /// append (group commit batches carrying `NO_LOG_SYNC` pass `None`).
    pub fn write_flags(
        &self,
        table: &TableIdentifier,
        payload: &[u8],
        revision: Revision,
        flags: OpenFlags,
    ) -> crate::Result<()> {
        debug_assert!(revision != 0);

        let extension = encode_extension(revision, table);
        let block = block::encode_block(MAGIC_DATA, self.options.compressor, &extension, payload)?;

        let mut inner = self.lock();

        if inner.needs_roll {
            self.roll_locked(&mut inner)?;
        }

        self.append_locked(&mut inner, &block, revision, flags)?;

        if inner.cur_fragment_length > self.options.roll_limit {
            self.roll_locked(&mut inner)?;
        }

        Ok(())
    }

    /// Links another log directory into this one.
    ///
    /// The link block is written uncompressed and the fragment is rolled
    /// immediately, so the link sits in a sealed fragment of its own.
    pub fn link_log(&self, other_log_dir: &str, latest_revision: Revision) -> crate::Result<()> {
        let table = TableIdentifier::new("", 0);
        let extension = encode_extension(latest_revision, &table);

        let mut payload = Vec::with_capacity(other_log_dir.len() + 1);
        payload.extend_from_slice(other_log_dir.as_bytes());
        payload.push(0);

        let block = block::encode_block(MAGIC_LINK, CompressionType::None, &extension, &payload)?;

        let mut inner = self.lock();

        if inner.needs_roll {
            self.roll_locked(&mut inner)?;
        }

        self.append_locked(&mut inner, &block, latest_revision, self.flush_flag())?;

        log::info!("Linked log {other_log_dir} into {}", self.log_dir);

        self.roll_locked(&mut inner)
    }

    fn append_locked(
        &self,
        inner: &mut LogWriter,
        block: &[u8],
        revision: Revision,
        flags: OpenFlags,
    ) -> crate::Result<()> {
        let fd = inner.fd.ok_or(crate::Error::ShuttingDown)?;

        self.fs.append(fd, block, flags)?;
        inner.cur_fragment_length += block.len() as u64;
        inner.latest_revision = inner.latest_revision.max(revision);

        Ok(())
    }

    /// Seals the current fragment and opens the next numeric file.
    ///
    /// A fragment that never saw data is reused instead of sealed, so rolls
    /// are free on an idle log.
    pub fn roll(&self) -> crate::Result<()> {
        let mut inner = self.lock();
        self.roll_locked(&mut inner)
    }

    fn roll_locked(&self, inner: &mut LogWriter) -> crate::Result<()> {
        if inner.latest_revision == 0 {
            inner.needs_roll = false;
            return Ok(());
        }

        inner.needs_roll = true;

        if let Some(fd) = inner.fd.take() {
            self.fs.close(fd)?;

            let info = FragmentInfo {
                log_dir: self.log_dir.clone(),
                num: inner.cur_fragment_num,
                size: inner.cur_fragment_length,
                revision: inner.latest_revision,
                purge_log_dir: false,
            };

            log::debug!(
                "Rolled commit log fragment {}/{} size={} revision={}",
                info.log_dir,
                info.num,
                info.size,
                info.revision
            );

            let out_of_order = inner
                .fragment_queue
                .back()
                .is_some_and(|back| back.revision > info.revision);

            inner.fragment_queue.push_back(info);

            if out_of_order {
                inner
                    .fragment_queue
                    .make_contiguous()
                    .sort_by_key(|f| (f.revision, f.num));
            }

            inner.latest_revision = 0;
            inner.cur_fragment_length = 0;
            inner.cur_fragment_num += 1;
        }

        let fname = format!("{}/{}", self.log_dir, inner.cur_fragment_num);
        let fd = self
            .fs
            .create(&fname, true, FRAGMENT_REPLICATION, FRAGMENT_BLOCK_SIZE)?;

        inner.fd = Some(fd);
        inner.needs_roll = false;

        Ok(())
    }

    /// Removes sealed fragments whose highest revision is below `revision`.
    pub fn purge(&self, revision: Revision) -> crate::Result<()> {
        let mut inner = self.lock();

        while let Some(front) = inner.fragment_queue.front() {
            if front.revision >= revision {
                break;
            }

            #[allow(clippy::expect_used)]
            let info = inner.fragment_queue.pop_front().expect("front exists");

            let fname = format!("{}/{}", info.log_dir, info.num);
            self.fs.remove(&fname)?;

            log::info!(
                "Purged log fragment {fname} revision={} cutoff={revision}",
                info.revision
            );

            if info.purge_log_dir {
                log::info!("Removing linked commit log directory {}", info.log_dir);
                self.fs.rmdir(&info.log_dir)?;
            }
        }

        Ok(())
    }

    /// Adopts the sealed fragments of a replayed log, marking them for
    /// directory removal when purged. Used when a replay-time log is merged
    /// into the live one.
    pub fn stitch_in(&self, fragments: Vec<FragmentInfo>) {
        let mut inner = self.lock();

        for mut info in fragments {
            info.purge_log_dir = true;
            inner.fragment_queue.push_back(info);
        }

        inner
            .fragment_queue
            .make_contiguous()
            .sort_by_key(|f| (f.revision, f.num));
    }

    /// Durably flushes the open fragment.
    pub fn sync(&self) -> crate::Result<()> {
        let inner = self.lock();
        if let Some(fd) = inner.fd {
            self.fs.flush(fd)?;
        }
        Ok(())
    }

    /// Final close; idempotent.
    pub fn close(&self) -> crate::Result<()> {
        let mut inner = self.lock();
        if let Some(fd) = inner.fd.take() {
            self.fs.close(fd)?;
        }
        Ok(())
    }

    /// Maps each fragment's revision to how much log it pins.
    ///
    /// Entries are keyed by the fragment's highest revision; the value
    /// carries the distance from the tail and the cumulative size of that
    /// fragment plus everything newer. The log-cleanup prioritizer reads
    /// this to decide which range's compaction frees the most log.
    #[must_use]
    pub fn load_fragment_priority_map(&self) -> BTreeMap<Revision, FragmentPriorityData> {
        let inner = self.lock();
        let mut map = BTreeMap::new();

        if inner.latest_revision != 0 {
            map.insert(
                inner.latest_revision,
                FragmentPriorityData {
                    distance: 0,
                    cumulative_size: inner.cur_fragment_length,
                },
            );
        }

        for info in &inner.fragment_queue {
            map.insert(
                info.revision,
                FragmentPriorityData {
                    distance: 0,
                    cumulative_size: info.size,
                },
            );
        }

        let mut distance = 0;
        let mut cumulative = 0;
        for (_, data) in map.iter_mut().rev() {
            cumulative += data.cumulative_size;
            data.distance = distance;
            data.cumulative_size = cumulative;
            distance += 1;
        }

        map
    }

    /// Per-fragment STAT lines for diagnostics dumps.
    #[must_use]
    pub fn get_stats(&self) -> String {
        let inner = self.lock();
        let mut stats = String::new();

        for frag in &inner.fragment_queue {
            stats += &format!("STAT frag-{}\tsize\t{}\n", frag.num, frag.size);
            stats += &format!("STAT frag-{}\trevision\t{}\n", frag.num, frag.revision);
        }
        stats += &format!(
            "STAT frag-{}\tsize\t{}\n",
            inner.cur_fragment_num, inner.cur_fragment_length
        );
        stats += &format!(
            "STAT frag-{}\trevision\t{}\n",
            inner.cur_fragment_num, inner.latest_revision
        );

        stats
    }

    /// Snapshot of the sealed fragment queue.
    #[must_use]
    pub fn fragments(&self) -> Vec<FragmentInfo> {
        self.lock().fragment_queue.iter().cloned().collect()
    }
}

impl Drop for CommitLog {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::error!("Problem closing commit log {:?}: {e}", self.log_dir);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::LocalBroker;
    use test_log::test;

    fn test_log(dir: &tempfile::TempDir, roll_limit: u64) -> crate::Result<CommitLog> {
        let fs = Arc::new(LocalBroker::new(dir.path()));
        CommitLog::create(
            fs,
            "logs/user",
            CommitLogOptions {
                compressor: CompressionType::Zlib,
                roll_limit,
                flush: false,
            },
        )
    }

    #[test]
    fn commit_log_write_and_replay() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let log = test_log(&dir, 1024 * 1024)?;
        let table = TableIdentifier::new("1", 1);

        for rev in 1..=10i64 {
            log.write(&table, format!("update-{rev}").as_bytes(), rev)?;
        }
        log.close()?;

        let fs = Arc::new(LocalBroker::new(dir.path()));
        let mut seen = vec![];
        for entry in CommitLogReader::new(fs, "logs/user", 0) {
            let entry = entry?;
            seen.push((entry.revision, entry.payload));
        }

        assert_eq!(10, seen.len());
        for (i, (rev, payload)) in seen.iter().enumerate() {
            assert_eq!(i as i64 + 1, *rev);
            assert_eq!(format!("update-{rev}").as_bytes(), &**payload);
        }

        Ok(())
    }

    #[test]
    fn commit_log_rolls_at_limit() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        // Tiny roll limit: every block rolls
        let log = test_log(&dir, 1)?;
        let table = TableIdentifier::new("1", 1);

        log.write(&table, b"aaaa", 1)?;
        log.write(&table, b"bbbb", 2)?;
        log.write(&table, b"cccc", 3)?;

        let fragments = log.fragments();
        assert_eq!(3, fragments.len());
        assert_eq!(vec![1, 2, 3], fragments.iter().map(|f| f.revision).collect::<Vec<_>>());

        log.close()?;
        Ok(())
    }

    #[test]
    fn commit_log_purge() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let log = test_log(&dir, 1)?;
        let table = TableIdentifier::new("1", 1);

        for rev in 1..=5i64 {
            log.write(&table, b"data", rev)?;
        }

        log.purge(4)?;

        let fragments = log.fragments();
        assert!(fragments.iter().all(|f| f.revision >= 4));
        assert_eq!(2, fragments.len());

        // fragment files 0..=2 are gone, 3..=4 remain
        let fs = LocalBroker::new(dir.path());
        assert!(!fs.exists("logs/user/0")?);
        assert!(!fs.exists("logs/user/2")?);
        assert!(fs.exists("logs/user/3")?);

        log.close()?;
        Ok(())
    }

    #[test]
    fn commit_log_reopen_skips_old_fragments() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let table = TableIdentifier::new("1", 1);

        {
            let log = test_log(&dir, 1)?;
            log.write(&table, b"one", 1)?;
            log.close()?;
        }

        let log = test_log(&dir, 1)?;
        log.write(&table, b"two", 2)?;
        log.close()?;

        let fs = Arc::new(LocalBroker::new(dir.path()));
        let payloads: Vec<_> = CommitLogReader::new(fs, "logs/user", 0)
            .collect::<crate::Result<Vec<_>>>()?
            .into_iter()
            .map(|e| e.payload)
            .collect();

        assert_eq!(2, payloads.len());
        assert_eq!(b"one", &*payloads[0]);
        assert_eq!(b"two", &*payloads[1]);

        Ok(())
    }

    #[test]
    fn commit_log_priority_map() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let log = test_log(&dir, 1)?;
        let table = TableIdentifier::new("1", 1);

        for rev in 1..=3i64 {
            log.write(&table, b"0123456789", rev)?;
        }

        let map = log.load_fragment_priority_map();
        assert_eq!(3, map.len());

        // Oldest fragment pins the whole log
        let oldest = map.values().next().copied().unwrap_or_default();
        let newest = map.values().last().copied().unwrap_or_default();
        assert!(oldest.cumulative_size >= newest.cumulative_size);
        assert!(oldest.distance > newest.distance);

        log.close()?;
        Ok(())
    }
}
