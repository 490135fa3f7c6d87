// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Typed, versioned, checksummed entity journal.
//!
//! The range server records every range it owns (and each range's split
//! progress) here, so a restart can rebuild its exact state. A metalog
//! directory holds numbered generation files; each server start writes a
//! new generation seeded with a snapshot of the live entities. Readers load
//! the highest generation, rotating damaged files to `.bad` and falling
//! back to the previous one.

mod entity;
mod reader;

pub use entity::{Entity, RangeEntity};
pub use reader::{MetaLogReader, MetaLogSnapshot};

use crate::{
    checksum::crc32,
    coding::Encode,
    fs::{Fd, Filesystem, OpenFlags},
};
use byteorder::{BigEndian, WriteBytesExt};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
};

/// Metalog format version
pub const METALOG_VERSION: u16 = 1;

/// File header: version word plus a 14-byte name
pub const HEADER_LEN: usize = 16;

/// Entry header: checksum, type, length, flags, id, timestamp
pub const ENTRY_HEADER_LEN: usize = 4 + 4 + 4 + 4 + 8 + 8;

/// Entry flag: the entity with this id is logically deleted
pub const FLAG_REMOVE: u32 = 0x01;

/// Entry type: a range entity
pub const TYPE_RANGE: u32 = 1;

/// Entry type: a table schema entity
pub const TYPE_SCHEMA: u32 = 2;

/// Entry type: end-of-replayable-log marker
pub const TYPE_RECOVER: u32 = 0x8000_0000;

pub(crate) fn encode_file_header(name: &str) -> Vec<u8> {
    let mut header = Vec::with_capacity(HEADER_LEN);

    #[allow(clippy::expect_used)]
    header
        .write_u16::<BigEndian>(METALOG_VERSION)
        .expect("should not fail");

    let mut name_bytes = [0u8; 14];
    let n = name.len().min(14);
    name_bytes[..n].copy_from_slice(&name.as_bytes()[..n]);
    header.extend_from_slice(&name_bytes);

    header
}

pub(crate) fn entry_checksum(
    entry_type: u32,
    flags: u32,
    id: u64,
    timestamp: u64,
    payload: &[u8],
) -> u32 {
    let mut covered = Vec::with_capacity(ENTRY_HEADER_LEN - 4 + payload.len());

    #[allow(clippy::expect_used)]
    let _ = (|| -> std::io::Result<()> {
        covered.write_u32::<BigEndian>(entry_type)?;
        // NOTE: Payload length caps at 2^32 by the format
        #[allow(clippy::cast_possible_truncation)]
        covered.write_u32::<BigEndian>(payload.len() as u32)?;
        covered.write_u32::<BigEndian>(flags)?;
        covered.write_u64::<BigEndian>(id)?;
        covered.write_u64::<BigEndian>(timestamp)?;
        Ok(())
    })()
    .expect("should not fail");

    covered.extend_from_slice(payload);
    crc32(&covered)
}

fn now_ns() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| {
            // NOTE: Nanoseconds since 1970 fit u64 for a few centuries
            #[allow(clippy::cast_possible_truncation)]
            {
                d.as_nanos() as u64
            }
        })
        .unwrap_or_default()
}

/// Appends entity records to the newest metalog generation
pub struct MetaLogWriter {
    fs: Arc<dyn Filesystem>,
    path: String,
    fd: Mutex<Option<Fd>>,
    next_id: AtomicU64,
}

impl MetaLogWriter {
    /// Starts a new generation file in `dir`, named one past the highest
    /// existing generation, and seeds it with a snapshot of `initial`
    /// entities.
    pub fn create(
        fs: Arc<dyn Filesystem>,
        dir: &str,
        name: &str,
        initial: &[(u64, Entity)],
    ) -> crate::Result<Self> {
        fs.mkdirs(dir)?;

        let mut generation = 0;
        for file in fs.readdir(dir)? {
            if let Ok(num) = file.parse::<u64>() {
                generation = generation.max(num + 1);
            }
        }

        let path = format!("{dir}/{generation}");
        let fd = fs.create(&path, true, 3, 0)?;
        fs.append(fd, &encode_file_header(name), OpenFlags::Flush)?;

        let max_id = initial.iter().map(|(id, _)| *id).max().unwrap_or_default();

        let writer = Self {
            fs,
            path,
            fd: Mutex::new(Some(fd)),
            next_id: AtomicU64::new(max_id + 1),
        };

        for (id, entity) in initial {
            writer.record(*id, entity)?;
        }

        Ok(writer)
    }

    /// Allocates a fresh entity id.
    #[must_use]
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn append_entry(
        &self,
        entry_type: u32,
        flags: u32,
        id: u64,
        payload: &[u8],
    ) -> crate::Result<()> {
        let timestamp = now_ns();
        let checksum = entry_checksum(entry_type, flags, id, timestamp, payload);

        let mut entry = Vec::with_capacity(ENTRY_HEADER_LEN + payload.len());

        #[allow(clippy::expect_used)]
        let _ = (|| -> std::io::Result<()> {
            entry.write_u32::<BigEndian>(checksum)?;
            entry.write_u32::<BigEndian>(entry_type)?;
            #[allow(clippy::cast_possible_truncation)]
            entry.write_u32::<BigEndian>(payload.len() as u32)?;
            entry.write_u32::<BigEndian>(flags)?;
            entry.write_u64::<BigEndian>(id)?;
            entry.write_u64::<BigEndian>(timestamp)?;
            Ok(())
        })()
        .expect("should not fail");

        entry.extend_from_slice(payload);

        #[allow(clippy::expect_used)]
        let fd = self.fd.lock().expect("lock is poisoned");
        let fd = fd.ok_or(crate::Error::ShuttingDown)?;

        self.fs.append(fd, &entry, OpenFlags::Flush)?;
        Ok(())
    }

    /// Records the current state of an entity.
    pub fn record(&self, id: u64, entity: &Entity) -> crate::Result<()> {
        let payload = entity.encode_into_vec();
        self.append_entry(entity.entry_type(), 0, id, &payload)
    }

    /// Marks an entity as removed. `entry_type` is the removed entity's
    /// own type tag (`Entity::entry_type`).
    pub fn record_removal(&self, id: u64, entry_type: u32) -> crate::Result<()> {
        self.append_entry(entry_type, FLAG_REMOVE, id, &[])
    }

    /// Writes the end-of-replayable-log marker.
    pub fn record_recover(&self) -> crate::Result<()> {
        self.append_entry(TYPE_RECOVER, 0, 0, &[])
    }

    /// Closes the generation file; idempotent.
    pub fn close(&self) -> crate::Result<()> {
        #[allow(clippy::expect_used)]
        let mut fd = self.fd.lock().expect("lock is poisoned");
        if let Some(fd) = fd.take() {
            self.fs.close(fd)?;
        }
        Ok(())
    }

    /// Path of the generation file being written.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Drop for MetaLogWriter {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::error!("Problem closing metalog {:?}: {e}", self.path);
        }
    }
}
