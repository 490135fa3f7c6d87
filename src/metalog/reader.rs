// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{
    entity::Entity, entry_checksum, FLAG_REMOVE, HEADER_LEN, METALOG_VERSION, TYPE_RECOVER,
};
use crate::fs::Filesystem;
use byteorder::{BigEndian, ReadBytesExt};
use std::{collections::BTreeMap, sync::Arc};

/// The live entities recovered from a metalog directory
#[derive(Debug, Default)]
pub struct MetaLogSnapshot {
    /// Latest state per entity id, removals applied
    pub entities: Vec<(u64, Entity)>,

    /// One past the highest id ever recorded
    pub next_id: u64,

    /// Whether the generation ended with a RECOVER marker
    pub found_recover: bool,
}

/// Loads the newest intact metalog generation
pub struct MetaLogReader;

impl MetaLogReader {
    /// Reads the live entity set of `dir`.
    ///
    /// Generations are tried newest first; a damaged file is renamed to
    /// `<n>.bad` and the previous generation is used. A directory with no
    /// generations yields an empty snapshot; if every generation is
    /// damaged, the last error surfaces.
    pub fn load(fs: &Arc<dyn Filesystem>, dir: &str, name: &str) -> crate::Result<MetaLogSnapshot> {
        if !fs.exists(dir)? {
            return Ok(MetaLogSnapshot::default());
        }

        let mut generations: Vec<u64> = fs
            .readdir(dir)?
            .iter()
            .filter_map(|file| file.parse().ok())
            .collect();
        generations.sort_unstable();

        if generations.is_empty() {
            return Ok(MetaLogSnapshot::default());
        }

        let mut last_error = None;

        while let Some(generation) = generations.pop() {
            let path = format!("{dir}/{generation}");

            match Self::load_file(fs, &path, name) {
                Ok(snapshot) => return Ok(snapshot),
                Err(e) => {
                    let bad = format!("{path}.bad");
                    log::warn!("Moving problematic metalog file {path:?} to {bad:?}: {e}");
                    if let Err(rename_err) = fs.rename(&path, &bad) {
                        log::error!("Problem renaming {path:?}: {rename_err}");
                    }
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or(crate::Error::MetaLogBadHeader))
    }

    fn load_file(
        fs: &Arc<dyn Filesystem>,
        path: &str,
        name: &str,
    ) -> crate::Result<MetaLogSnapshot> {
        let length = fs.length(path)?;
        let fd = fs.open(path)?;

        let result = Self::load_open_file(fs, fd, length, name);

        if let Err(e) = fs.close(fd) {
            log::error!("Problem closing metalog {path:?}: {e}");
        }

        result
    }

    fn load_open_file(
        fs: &Arc<dyn Filesystem>,
        fd: crate::fs::Fd,
        length: u64,
        name: &str,
    ) -> crate::Result<MetaLogSnapshot> {
        let header = fs.read(fd, HEADER_LEN)?;
        if header.len() < HEADER_LEN {
            return Err(crate::Error::MetaLogBadHeader);
        }

        let mut cursor = &header[..];
        let version = cursor.read_u16::<BigEndian>()?;
        if version != METALOG_VERSION {
            return Err(crate::Error::MetaLogBadHeader);
        }

        let mut expected_name = [0u8; 14];
        let n = name.len().min(14);
        expected_name[..n].copy_from_slice(&name.as_bytes()[..n]);
        if header[2..] != expected_name {
            return Err(crate::Error::MetaLogBadHeader);
        }

        let mut entities: BTreeMap<u64, Entity> = BTreeMap::new();
        let mut next_id = 1;
        let mut found_recover = false;
        let mut offset = HEADER_LEN as u64;

        while offset < length {
            let header = fs.read(fd, super::ENTRY_HEADER_LEN)?;
            if header.len() < super::ENTRY_HEADER_LEN {
                // Torn tail entry: everything before it still counts
                log::warn!("Dropping truncated metalog entry header at offset {offset}");
                break;
            }

            let mut cursor = &header[..];
            let checksum = cursor.read_u32::<BigEndian>()?;
            let entry_type = cursor.read_u32::<BigEndian>()?;
            let entry_length = cursor.read_u32::<BigEndian>()?;
            let flags = cursor.read_u32::<BigEndian>()?;
            let id = cursor.read_u64::<BigEndian>()?;
            let timestamp = cursor.read_u64::<BigEndian>()?;

            let payload = fs.read(fd, entry_length as usize)?;
            if payload.len() < entry_length as usize {
                log::warn!("Dropping truncated metalog entry payload at offset {offset}");
                break;
            }

            let computed = entry_checksum(entry_type, flags, id, timestamp, &payload);
            if computed != checksum {
                return Err(crate::Error::MetaLogChecksumMismatch {
                    expected: checksum,
                    got: computed,
                });
            }

            offset += (super::ENTRY_HEADER_LEN + payload.len()) as u64;
            next_id = next_id.max(id + 1);

            if entry_type == TYPE_RECOVER {
                found_recover = true;
                continue;
            }

            if flags & FLAG_REMOVE != 0 {
                entities.remove(&id);
                continue;
            }

            let entity = Entity::decode(entry_type, &payload)?;
            entities.insert(id, entity);
        }

        Ok(MetaLogSnapshot {
            entities: entities.into_iter().collect(),
            next_id,
            found_recover,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        fs::LocalBroker,
        metalog::{Entity, MetaLogWriter, RangeEntity},
        range::{RangeSpec, RangeState},
        schema::TableIdentifier,
    };
    use test_log::test;

    fn entity(end_row: &str) -> Entity {
        Entity::Range(RangeEntity {
            table: TableIdentifier::new("1", 1),
            spec: RangeSpec::new("", end_row),
            state: RangeState::Active,
            soft_limit: 1024,
            transfer_log: None,
        })
    }

    #[test]
    fn metalog_roundtrip() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let fs: Arc<dyn Filesystem> = Arc::new(LocalBroker::new(dir.path()));

        let writer = MetaLogWriter::create(fs.clone(), "mml", "rs-mml", &[])?;
        let a = writer.next_id();
        let b = writer.next_id();
        writer.record(a, &entity("m"))?;
        writer.record(b, &entity("z"))?;
        writer.record_removal(a, entity("m").entry_type())?;
        writer.record_recover()?;
        writer.close()?;

        let snapshot = MetaLogReader::load(&fs, "mml", "rs-mml")?;
        assert_eq!(1, snapshot.entities.len());
        assert_eq!(b, snapshot.entities[0].0);
        assert!(snapshot.found_recover);
        assert!(snapshot.next_id > b);

        Ok(())
    }

    #[test]
    fn metalog_tolerates_truncated_tail() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let fs: Arc<dyn Filesystem> = Arc::new(LocalBroker::new(dir.path()));

        let writer = MetaLogWriter::create(fs.clone(), "mml", "rs-mml", &[])?;
        let a = writer.next_id();
        writer.record(a, &entity("m"))?;
        writer.record(writer.next_id(), &entity("z"))?;
        writer.close()?;

        // Chop into the last entry
        let path = dir.path().join("mml/0");
        let data = std::fs::read(&path)?;
        std::fs::write(&path, &data[..data.len() - 7])?;

        let snapshot = MetaLogReader::load(&fs, "mml", "rs-mml")?;
        assert_eq!(1, snapshot.entities.len());
        assert_eq!(a, snapshot.entities[0].0);

        Ok(())
    }

    #[test]
    fn metalog_rotates_corrupt_file_to_previous_generation() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let fs: Arc<dyn Filesystem> = Arc::new(LocalBroker::new(dir.path()));

        {
            let writer = MetaLogWriter::create(fs.clone(), "mml", "rs-mml", &[])?;
            writer.record(writer.next_id(), &entity("gen0"))?;
            writer.close()?;
        }
        {
            let writer = MetaLogWriter::create(fs.clone(), "mml", "rs-mml", &[])?;
            writer.record(writer.next_id(), &entity("gen1"))?;
            writer.close()?;
        }

        // Corrupt a checksum in the middle of generation 1
        let path = dir.path().join("mml/1");
        let mut data = std::fs::read(&path)?;
        data[HEADER_LEN + 2] ^= 0xFF;
        std::fs::write(&path, data)?;

        let snapshot = MetaLogReader::load(&fs, "mml", "rs-mml")?;
        assert_eq!(1, snapshot.entities.len());

        let Entity::Range(range) = &snapshot.entities[0].1 else {
            panic!("expected a range entity");
        };
        assert_eq!(b"gen0", &*range.spec.end_row);

        // The damaged generation was rotated away
        assert!(fs.exists("mml/1.bad")?);
        assert!(!fs.exists("mml/1")?);

        Ok(())
    }

    #[test]
    fn metalog_empty_directory() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let fs: Arc<dyn Filesystem> = Arc::new(LocalBroker::new(dir.path()));

        let snapshot = MetaLogReader::load(&fs, "missing", "rs-mml")?;
        assert!(snapshot.entities.is_empty());
        assert!(!snapshot.found_recover);

        Ok(())
    }
}
