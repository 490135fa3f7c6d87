// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{coding, key::Key, Slice};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Read;

/// One data block: its first serialized key and its file offset
#[derive(Clone, Debug)]
pub struct IndexEntry {
    /// Serialized first key of the block
    pub first_key: Slice,

    /// File offset of the block
    pub offset: u64,
}

/// In-memory block index of a cell store: per block, the first key and the
/// file offset
///
/// Kept droppable: under memory pressure the index is released and rebuilt
/// from the file tail on the next seek.
#[derive(Debug, Default)]
pub struct BlockIndex {
    entries: Vec<IndexEntry>,
}

impl BlockIndex {
    /// Builds an index from parallel key/offset lists.
    #[must_use]
    pub fn new(entries: Vec<IndexEntry>) -> Self {
        Self { entries }
    }

    /// Number of blocks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` for an empty store.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entry accessor.
    #[must_use]
    pub fn get(&self, idx: usize) -> Option<&IndexEntry> {
        self.entries.get(idx)
    }

    /// Index of the last block whose first key is `<=` the probe, which is
    /// the block a seek for `key` must start in.
    ///
    /// Returns 0 when the probe sorts before the first block's first key.
    #[must_use]
    pub fn seek_block(&self, key: &[u8]) -> usize {
        let after = self.entries.partition_point(|e| &*e.first_key <= key);
        after.saturating_sub(1)
    }

    /// Row of the middle index entry, the store's contribution to split-point
    /// election.
    #[must_use]
    pub fn median_row(&self) -> Option<Slice> {
        let entry = self.entries.get(self.entries.len() / 2)?;
        Key::decode(&entry.first_key).ok().map(|k| k.row)
    }

    /// Bytes of memory the index occupies.
    #[must_use]
    pub fn memory_used(&self) -> u64 {
        self.entries
            .iter()
            .map(|e| (e.first_key.len() + std::mem::size_of::<IndexEntry>()) as u64)
            .sum()
    }

    /// Serializes the variable index block payload (first keys, in order).
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn encode_var_payload(&self) -> Vec<u8> {
        let mut v = vec![];
        for entry in &self.entries {
            coding::encode_vstr16(&mut v, &entry.first_key).expect("should not fail");
        }
        v
    }

    /// Serializes the fixed index block payload (offsets, in order).
    ///
    /// `sixty_four_bit` selects u64 offsets; legacy stores carry u32.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn encode_fix_payload(&self, sixty_four_bit: bool) -> Vec<u8> {
        let mut v = vec![];
        for entry in &self.entries {
            if sixty_four_bit {
                v.write_u64::<BigEndian>(entry.offset).expect("should not fail");
            } else {
                // NOTE: Legacy stores are capped at 4 GiB by their format
                #[allow(clippy::cast_possible_truncation)]
                v.write_u32::<BigEndian>(entry.offset as u32)
                    .expect("should not fail");
            }
        }
        v
    }

    /// Rebuilds the index from the two decoded index block payloads.
    pub fn decode(
        var_payload: &[u8],
        fix_payload: &[u8],
        entries: u32,
        sixty_four_bit: bool,
    ) -> crate::Result<Self> {
        let mut keys = Vec::with_capacity(entries as usize);
        let mut var_cursor = var_payload;
        for _ in 0..entries {
            let key = coding::decode_vstr16(&mut var_cursor)
                .map_err(|_| crate::Error::CorruptCellStore("truncated variable index".into()))?;
            keys.push(Slice::from(key));
        }

        let mut offsets = Vec::with_capacity(entries as usize);
        let mut fix_cursor = fix_payload;
        for _ in 0..entries {
            let offset = if sixty_four_bit {
                fix_cursor.read_u64::<BigEndian>()
            } else {
                fix_cursor.read_u32::<BigEndian>().map(u64::from)
            }
            .map_err(|_| crate::Error::CorruptCellStore("truncated fixed index".into()))?;
            offsets.push(offset);
        }

        let mut rest = [0u8; 1];
        if fix_cursor.read(&mut rest).unwrap_or(0) != 0 {
            return Err(crate::Error::CorruptCellStore(
                "trailing bytes after fixed index".into(),
            ));
        }

        Ok(Self {
            entries: keys
                .into_iter()
                .zip(offsets)
                .map(|(first_key, offset)| IndexEntry { first_key, offset })
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn index_of(keys: &[(&str, u64)]) -> BlockIndex {
        BlockIndex::new(
            keys.iter()
                .map(|(row, offset)| IndexEntry {
                    first_key: Key::insert(*row, 1, "", 10, 1).encode(),
                    offset: *offset,
                })
                .collect(),
        )
    }

    #[test]
    fn index_seek_block() {
        let index = index_of(&[("b", 0), ("f", 100), ("m", 200)]);

        let probe = |row: &str| Key::insert(row, 1, "", 10, 1).encode();

        assert_eq!(0, index.seek_block(&probe("a")));
        assert_eq!(0, index.seek_block(&probe("b")));
        assert_eq!(0, index.seek_block(&probe("c")));
        assert_eq!(1, index.seek_block(&probe("f")));
        assert_eq!(1, index.seek_block(&probe("g")));
        assert_eq!(2, index.seek_block(&probe("z")));
    }

    #[test]
    fn index_roundtrip_both_widths() -> crate::Result<()> {
        let index = index_of(&[("a", 0), ("k", 4096), ("t", 8192)]);

        for sixty_four_bit in [true, false] {
            let var = index.encode_var_payload();
            let fix = index.encode_fix_payload(sixty_four_bit);

            let decoded = BlockIndex::decode(&var, &fix, 3, sixty_four_bit)?;
            assert_eq!(3, decoded.len());

            for i in 0..3 {
                let a = index.get(i).expect("entry exists");
                let b = decoded.get(i).expect("entry exists");
                assert_eq!(a.first_key, b.first_key);
                assert_eq!(a.offset, b.offset);
            }
        }

        Ok(())
    }

    #[test]
    fn index_median_row() {
        let index = index_of(&[("a", 0), ("m", 100), ("z", 200)]);
        assert_eq!(b"m", &*index.median_row().expect("non-empty"));
    }
}
