// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Read;

/// What a cell store's bloom filter is keyed by
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BloomMode {
    /// No filter
    Disabled,

    /// Keyed by row
    Rows,

    /// Keyed by row + family + qualifier
    RowsCols,
}

impl BloomMode {
    /// Wire id.
    #[must_use]
    pub fn id(self) -> u8 {
        match self {
            Self::Disabled => 0,
            Self::Rows => 1,
            Self::RowsCols => 2,
        }
    }

    /// Resolves a wire id.
    pub fn from_id(id: u8) -> crate::Result<Self> {
        match id {
            0 => Ok(Self::Disabled),
            1 => Ok(Self::Rows),
            2 => Ok(Self::RowsCols),
            _ => Err(crate::Error::CorruptCellStore(format!(
                "unknown bloom mode {id}"
            ))),
        }
    }
}

fn hash64(bytes: &[u8]) -> u64 {
    xxhash_rust::xxh3::xxh3_64(bytes)
}

fn secondary_hash(h1: u64) -> u64 {
    h1.wrapping_shr(32).wrapping_mul(0x51_7c_c1_b7_27_22_0a_95)
}

/// A standard bloom filter over double hashing
///
/// Will never have a false negative.
#[derive(Debug, PartialEq, Eq)]
pub struct BloomFilter {
    bits: Vec<u8>,

    /// Bit count
    m: usize,

    /// Number of hash functions
    k: usize,
}

impl BloomFilter {
    /// Size of the filter in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bits.len()
    }

    /// Returns `true` if the filter has no bits.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    /// Number of hash functions.
    #[must_use]
    pub fn hash_count(&self) -> u8 {
        // NOTE: k is tiny by construction
        #[allow(clippy::cast_possible_truncation)]
        {
            self.k as u8
        }
    }

    fn has_bit(&self, idx: usize) -> bool {
        let byte = self.bits.get(idx / 8).copied().unwrap_or_default();
        byte & (1 << (idx % 8)) != 0
    }

    /// Returns `true` if the key may be contained.
    #[must_use]
    pub fn contains(&self, key: &[u8]) -> bool {
        if self.m == 0 {
            return true;
        }

        let mut h1 = hash64(key);
        let mut h2 = secondary_hash(h1);

        for i in 1..=(self.k as u64) {
            let idx = h1 % (self.m as u64);

            #[allow(clippy::cast_possible_truncation)]
            if !self.has_bit(idx as usize) {
                return false;
            }

            h1 = h1.wrapping_add(h2);
            h2 = h2.wrapping_mul(i);
        }

        true
    }

    /// Serializes the filter (m, k, bit array).
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn encode(&self) -> Vec<u8> {
        let mut v = Vec::with_capacity(16 + self.bits.len());
        v.write_u64::<BigEndian>(self.m as u64).expect("should not fail");
        v.write_u64::<BigEndian>(self.k as u64).expect("should not fail");
        v.extend_from_slice(&self.bits);
        v
    }

    /// Deserializes a filter.
    pub fn decode<R: Read>(reader: &mut R) -> crate::Result<Self> {
        let m = reader.read_u64::<BigEndian>().map_err(|_| {
            crate::Error::CorruptCellStore("short bloom filter".into())
        })? as usize;
        let k = reader.read_u64::<BigEndian>().map_err(|_| {
            crate::Error::CorruptCellStore("short bloom filter".into())
        })? as usize;

        let mut bits = vec![0; m.div_ceil(8)];
        reader
            .read_exact(&mut bits)
            .map_err(|_| crate::Error::CorruptCellStore("short bloom filter".into()))?;

        Ok(Self { bits, m, k })
    }
}

/// Buffers key hashes, then builds a filter sized for the item count
#[derive(Debug, Default)]
pub struct BloomBuilder {
    hashes: Vec<u64>,
}

impl BloomBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffers a key.
    pub fn add(&mut self, key: &[u8]) {
        self.hashes.push(hash64(key));
    }

    /// Number of buffered keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    /// Returns `true` if no keys were buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    /// Builds the filter with `bpk` bits per key.
    ///
    /// 10 bits per key is a sensible default.
    #[must_use]
    pub fn build(&self, bpk: f32) -> BloomFilter {
        use std::f32::consts::LN_2;

        assert!(bpk > 0.0);

        let n = self.hashes.len().max(1);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let bytes = ((n as f32 * bpk) / 8.0).ceil() as usize;
        let m = bytes * 8;

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let k = ((bpk * LN_2) as usize).max(1);

        let mut bits = vec![0u8; bytes];

        for hash in &self.hashes {
            let mut h1 = *hash;
            let mut h2 = secondary_hash(h1);

            for i in 1..=(k as u64) {
                let idx = (h1 % (m as u64)) as usize;
                #[allow(clippy::cast_possible_truncation)]
                {
                    bits[idx / 8] |= 1 << (idx % 8);
                }

                h1 = h1.wrapping_add(h2);
                h2 = h2.wrapping_mul(i);
            }
        }

        BloomFilter { bits, m, k }
    }
}

/// Builds the composite key a `RowsCols` filter hashes: row + family + qualifier.
#[must_use]
pub fn rows_cols_key(row: &[u8], family: u8, qualifier: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(row.len() + 1 + qualifier.len());
    key.extend_from_slice(row);
    key.push(family);
    key.extend_from_slice(qualifier);
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn bloom_no_false_negatives() {
        let mut builder = BloomBuilder::new();
        for i in 0..1_000u32 {
            builder.add(format!("row-{i}").as_bytes());
        }

        let filter = builder.build(10.0);

        for i in 0..1_000u32 {
            assert!(filter.contains(format!("row-{i}").as_bytes()));
        }
    }

    #[test]
    fn bloom_mostly_rejects_absent_keys() {
        let mut builder = BloomBuilder::new();
        for i in 0..1_000u32 {
            builder.add(format!("row-{i}").as_bytes());
        }

        let filter = builder.build(10.0);

        let false_positives = (0..1_000u32)
            .filter(|i| filter.contains(format!("absent-{i}").as_bytes()))
            .count();

        // ~1% expected at 10 bpk; leave generous slack
        assert!(false_positives < 100, "{false_positives} false positives");
    }

    #[test]
    fn bloom_roundtrip() -> crate::Result<()> {
        let mut builder = BloomBuilder::new();
        builder.add(b"a");
        builder.add(b"b");

        let filter = builder.build(10.0);
        let encoded = filter.encode();

        let decoded = BloomFilter::decode(&mut &encoded[..])?;
        assert_eq!(filter, decoded);

        Ok(())
    }
}
