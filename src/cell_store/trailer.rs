// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Versioned cell store trailers.
//!
//! The last two bytes of a cell store file carry the trailer version, which
//! fixes the trailer's total size and layout. Every version is sealed with a
//! fletcher32 checksum directly before the version word. Writers emit the
//! newest version; readers decode every version ever shipped.

use super::bloom::BloomMode;
use crate::{checksum::fletcher32, CompressionType};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Read;

/// Index offsets are 64-bit (always set from v1 on)
pub const FLAG_64BIT_INDEX: u16 = 0x01;

/// Store was produced by a major compaction
pub const FLAG_MAJOR_COMPACTION: u16 = 0x02;

/// Store was produced by a split shrink
pub const FLAG_SPLIT: u16 = 0x04;

/// Trailer sizes by version, version word included
pub const TRAILER_SIZES: [usize; 6] = [56, 112, 128, 144, 160, 192];

/// Largest trailer any version uses
pub const MAX_TRAILER_SIZE: usize = 192;

/// v0: 32-bit offsets, no bloom metadata
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TrailerV0 {
    /// Offset of the fixed (offset array) index block
    pub fix_index_offset: u32,
    /// Offset of the variable (first-key array) index block
    pub var_index_offset: u32,
    /// Offset of the bloom filter block, 0 = none
    pub filter_offset: u32,
    /// Target uncompressed block size
    pub block_size: u32,
    /// Number of data blocks / index entries
    pub index_entries: u32,
    /// Number of cells in the store
    pub total_entries: u32,
    /// Smallest cell timestamp
    pub timestamp_min: i64,
    /// Largest cell timestamp
    pub timestamp_max: i64,
    /// Schema generation the store was written under
    pub table_generation: u32,
    /// Codec id of the data blocks
    pub compression_codec: u16,
    /// `FLAG_*` bits
    pub flags: u16,
}

/// v1: 64-bit offsets, bloom metadata, revision, data-length accounting
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TrailerV1 {
    /// Offset of the fixed (offset array) index block
    pub fix_index_offset: u64,
    /// Offset of the variable (first-key array) index block
    pub var_index_offset: u64,
    /// Offset of the bloom filter block, 0 = none
    pub filter_offset: u64,
    /// Number of keys in the bloom filter
    pub filter_items: u64,
    /// On-disk length of the bloom filter block
    pub filter_length: u64,
    /// Target uncompressed block size
    pub block_size: u32,
    /// Number of data blocks / index entries
    pub index_entries: u32,
    /// Number of cells in the store
    pub total_entries: u64,
    /// Highest revision of any cell in the store
    pub revision: i64,
    /// Smallest cell timestamp
    pub timestamp_min: i64,
    /// Largest cell timestamp
    pub timestamp_max: i64,
    /// Bytes of compressed data blocks
    pub compressed_data_length: u64,
    /// Bytes of uncompressed data blocks
    pub uncompressed_data_length: u64,
    /// Schema generation the store was written under
    pub table_generation: u32,
    /// Codec id of the data blocks
    pub compression_codec: u16,
    /// `FLAG_*` bits
    pub flags: u16,
    /// Bloom filter mode id
    pub bloom_mode: u8,
    /// Bloom filter hash count
    pub bloom_hash_count: u8,
}

/// v2: adds key/value byte counters
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TrailerV2 {
    /// v1 fields
    pub base: TrailerV1,
    /// Serialized key bytes in the store
    pub key_bytes: u64,
    /// Value bytes in the store
    pub value_bytes: u64,
}

/// v3: adds the replaced-files list
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TrailerV3 {
    /// v2 fields
    pub base: TrailerV2,
    /// Offset of the replaced-files block, 0 = none
    pub replaced_files_offset: u64,
    /// Number of replaced files recorded
    pub replaced_files_count: u32,
}

/// v4: adds direct-IO alignment and preload hints
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TrailerV4 {
    /// v3 fields
    pub base: TrailerV3,
    /// Direct-IO alignment of block boundaries, 0 = unaligned
    pub alignment: u32,
    /// Offset from which an in-memory store preloads, 0 = whole file
    pub preload_offset: u64,
}

/// v5: adds delete/insert/expirable counters
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TrailerV5 {
    /// v4 fields
    pub base: TrailerV4,
    /// Tombstones in the store
    pub delete_count: u64,
    /// Inserts in the store
    pub insert_count: u64,
    /// Bytes that a TTL will eventually expire
    pub expirable_bytes: u64,
}

/// A decoded trailer of any version
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Trailer {
    /// Version 0
    V0(TrailerV0),
    /// Version 1
    V1(TrailerV1),
    /// Version 2
    V2(TrailerV2),
    /// Version 3
    V3(TrailerV3),
    /// Version 4
    V4(TrailerV4),
    /// Version 5
    V5(TrailerV5),
}

fn corrupt(msg: &str) -> crate::Error {
    crate::Error::CorruptCellStore(msg.into())
}

impl TrailerV0 {
    fn encode_fields(&self, v: &mut Vec<u8>) {
        #[allow(clippy::expect_used)]
        let _ = (|| -> std::io::Result<()> {
            v.write_u32::<BigEndian>(self.fix_index_offset)?;
            v.write_u32::<BigEndian>(self.var_index_offset)?;
            v.write_u32::<BigEndian>(self.filter_offset)?;
            v.write_u32::<BigEndian>(self.block_size)?;
            v.write_u32::<BigEndian>(self.index_entries)?;
            v.write_u32::<BigEndian>(self.total_entries)?;
            v.write_i64::<BigEndian>(self.timestamp_min)?;
            v.write_i64::<BigEndian>(self.timestamp_max)?;
            v.write_u32::<BigEndian>(self.table_generation)?;
            v.write_u16::<BigEndian>(self.compression_codec)?;
            v.write_u16::<BigEndian>(self.flags)?;
            v.write_u16::<BigEndian>(0)?; // unused
            Ok(())
        })()
        .expect("should not fail");
    }

    fn decode_fields<R: Read>(reader: &mut R) -> crate::Result<Self> {
        let mut t = Self {
            fix_index_offset: reader.read_u32::<BigEndian>()?,
            var_index_offset: reader.read_u32::<BigEndian>()?,
            filter_offset: reader.read_u32::<BigEndian>()?,
            block_size: reader.read_u32::<BigEndian>()?,
            index_entries: reader.read_u32::<BigEndian>()?,
            total_entries: reader.read_u32::<BigEndian>()?,
            timestamp_min: reader.read_i64::<BigEndian>()?,
            timestamp_max: reader.read_i64::<BigEndian>()?,
            table_generation: reader.read_u32::<BigEndian>()?,
            compression_codec: reader.read_u16::<BigEndian>()?,
            flags: 0,
        };
        t.flags = reader.read_u16::<BigEndian>()?;
        let _unused = reader.read_u16::<BigEndian>()?;
        Ok(t)
    }
}

impl TrailerV1 {
    fn encode_fields(&self, v: &mut Vec<u8>) {
        #[allow(clippy::expect_used)]
        let _ = (|| -> std::io::Result<()> {
            v.write_u64::<BigEndian>(self.fix_index_offset)?;
            v.write_u64::<BigEndian>(self.var_index_offset)?;
            v.write_u64::<BigEndian>(self.filter_offset)?;
            v.write_u64::<BigEndian>(self.filter_items)?;
            v.write_u64::<BigEndian>(self.filter_length)?;
            v.write_u32::<BigEndian>(self.block_size)?;
            v.write_u32::<BigEndian>(self.index_entries)?;
            v.write_u64::<BigEndian>(self.total_entries)?;
            v.write_i64::<BigEndian>(self.revision)?;
            v.write_i64::<BigEndian>(self.timestamp_min)?;
            v.write_i64::<BigEndian>(self.timestamp_max)?;
            v.write_u64::<BigEndian>(self.compressed_data_length)?;
            v.write_u64::<BigEndian>(self.uncompressed_data_length)?;
            v.write_u32::<BigEndian>(self.table_generation)?;
            v.write_u16::<BigEndian>(self.compression_codec)?;
            v.write_u16::<BigEndian>(self.flags)?;
            v.push(self.bloom_mode);
            v.push(self.bloom_hash_count);
            Ok(())
        })()
        .expect("should not fail");
    }

    fn decode_fields<R: Read>(reader: &mut R) -> crate::Result<Self> {
        Ok(Self {
            fix_index_offset: reader.read_u64::<BigEndian>()?,
            var_index_offset: reader.read_u64::<BigEndian>()?,
            filter_offset: reader.read_u64::<BigEndian>()?,
            filter_items: reader.read_u64::<BigEndian>()?,
            filter_length: reader.read_u64::<BigEndian>()?,
            block_size: reader.read_u32::<BigEndian>()?,
            index_entries: reader.read_u32::<BigEndian>()?,
            total_entries: reader.read_u64::<BigEndian>()?,
            revision: reader.read_i64::<BigEndian>()?,
            timestamp_min: reader.read_i64::<BigEndian>()?,
            timestamp_max: reader.read_i64::<BigEndian>()?,
            compressed_data_length: reader.read_u64::<BigEndian>()?,
            uncompressed_data_length: reader.read_u64::<BigEndian>()?,
            table_generation: reader.read_u32::<BigEndian>()?,
            compression_codec: reader.read_u16::<BigEndian>()?,
            flags: reader.read_u16::<BigEndian>()?,
            bloom_mode: reader.read_u8()?,
            bloom_hash_count: reader.read_u8()?,
        })
    }
}

impl TrailerV2 {
    fn encode_fields(&self, v: &mut Vec<u8>) {
        self.base.encode_fields(v);
        #[allow(clippy::expect_used)]
        let _ = (|| -> std::io::Result<()> {
            v.write_u64::<BigEndian>(self.key_bytes)?;
            v.write_u64::<BigEndian>(self.value_bytes)?;
            Ok(())
        })()
        .expect("should not fail");
    }

    fn decode_fields<R: Read>(reader: &mut R) -> crate::Result<Self> {
        Ok(Self {
            base: TrailerV1::decode_fields(reader)?,
            key_bytes: reader.read_u64::<BigEndian>()?,
            value_bytes: reader.read_u64::<BigEndian>()?,
        })
    }
}

impl TrailerV3 {
    fn encode_fields(&self, v: &mut Vec<u8>) {
        self.base.encode_fields(v);
        #[allow(clippy::expect_used)]
        let _ = (|| -> std::io::Result<()> {
            v.write_u64::<BigEndian>(self.replaced_files_offset)?;
            v.write_u32::<BigEndian>(self.replaced_files_count)?;
            v.write_u32::<BigEndian>(0)?; // unused
            Ok(())
        })()
        .expect("should not fail");
    }

    fn decode_fields<R: Read>(reader: &mut R) -> crate::Result<Self> {
        let t = Self {
            base: TrailerV2::decode_fields(reader)?,
            replaced_files_offset: reader.read_u64::<BigEndian>()?,
            replaced_files_count: reader.read_u32::<BigEndian>()?,
        };
        let _unused = reader.read_u32::<BigEndian>()?;
        Ok(t)
    }
}

impl TrailerV4 {
    fn encode_fields(&self, v: &mut Vec<u8>) {
        self.base.encode_fields(v);
        #[allow(clippy::expect_used)]
        let _ = (|| -> std::io::Result<()> {
            v.write_u32::<BigEndian>(self.alignment)?;
            v.write_u32::<BigEndian>(0)?; // unused
            v.write_u64::<BigEndian>(self.preload_offset)?;
            Ok(())
        })()
        .expect("should not fail");
    }

    fn decode_fields<R: Read>(reader: &mut R) -> crate::Result<Self> {
        let base = TrailerV3::decode_fields(reader)?;
        let alignment = reader.read_u32::<BigEndian>()?;
        let _unused = reader.read_u32::<BigEndian>()?;
        Ok(Self {
            base,
            alignment,
            preload_offset: reader.read_u64::<BigEndian>()?,
        })
    }
}

impl TrailerV5 {
    fn encode_fields(&self, v: &mut Vec<u8>) {
        self.base.encode_fields(v);
        #[allow(clippy::expect_used)]
        let _ = (|| -> std::io::Result<()> {
            v.write_u64::<BigEndian>(self.delete_count)?;
            v.write_u64::<BigEndian>(self.insert_count)?;
            v.write_u64::<BigEndian>(self.expirable_bytes)?;
            v.write_u64::<BigEndian>(0)?; // unused
            Ok(())
        })()
        .expect("should not fail");
    }

    fn decode_fields<R: Read>(reader: &mut R) -> crate::Result<Self> {
        let base = TrailerV4::decode_fields(reader)?;
        let delete_count = reader.read_u64::<BigEndian>()?;
        let insert_count = reader.read_u64::<BigEndian>()?;
        let expirable_bytes = reader.read_u64::<BigEndian>()?;
        let _unused = reader.read_u64::<BigEndian>()?;
        Ok(Self {
            base,
            delete_count,
            insert_count,
            expirable_bytes,
        })
    }
}

impl Trailer {
    /// Trailer version.
    #[must_use]
    pub fn version(&self) -> u16 {
        match self {
            Self::V0(_) => 0,
            Self::V1(_) => 1,
            Self::V2(_) => 2,
            Self::V3(_) => 3,
            Self::V4(_) => 4,
            Self::V5(_) => 5,
        }
    }

    /// Serialized trailer size for this version.
    #[must_use]
    pub fn serialized_len(&self) -> usize {
        TRAILER_SIZES[usize::from(self.version())]
    }

    /// Serializes the trailer, sealing it with checksum and version word.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn encode(&self) -> Vec<u8> {
        let mut v = Vec::with_capacity(self.serialized_len());

        match self {
            Self::V0(t) => t.encode_fields(&mut v),
            Self::V1(t) => t.encode_fields(&mut v),
            Self::V2(t) => t.encode_fields(&mut v),
            Self::V3(t) => t.encode_fields(&mut v),
            Self::V4(t) => t.encode_fields(&mut v),
            Self::V5(t) => t.encode_fields(&mut v),
        }

        let checksum = fletcher32(&v);
        v.write_u32::<BigEndian>(checksum).expect("should not fail");
        v.write_u16::<BigEndian>(self.version()).expect("should not fail");

        debug_assert_eq!(self.serialized_len(), v.len());
        v
    }

    /// Decodes a trailer from the tail bytes of a cell store file.
    ///
    /// `tail` must contain at least the full trailer; the version is taken
    /// from its last two bytes. Unknown versions and checksum mismatches
    /// fail with [`crate::Error::CorruptCellStore`].
    pub fn decode_tail(tail: &[u8]) -> crate::Result<Self> {
        if tail.len() < 2 {
            return Err(corrupt("file too short for a trailer"));
        }

        let version = u16::from_be_bytes([tail[tail.len() - 2], tail[tail.len() - 1]]);

        let size = *TRAILER_SIZES
            .get(usize::from(version))
            .ok_or_else(|| corrupt(&format!("unknown trailer version {version}")))?;

        if tail.len() < size {
            return Err(corrupt("file too short for its trailer version"));
        }

        let trailer = &tail[tail.len() - size..];
        let fields = &trailer[..size - 6];

        let stored = u32::from_be_bytes([
            trailer[size - 6],
            trailer[size - 5],
            trailer[size - 4],
            trailer[size - 3],
        ]);
        let computed = fletcher32(fields);
        if stored != computed {
            return Err(corrupt("trailer checksum mismatch"));
        }

        let mut reader = fields;
        Ok(match version {
            0 => Self::V0(TrailerV0::decode_fields(&mut reader)?),
            1 => Self::V1(TrailerV1::decode_fields(&mut reader)?),
            2 => Self::V2(TrailerV2::decode_fields(&mut reader)?),
            3 => Self::V3(TrailerV3::decode_fields(&mut reader)?),
            4 => Self::V4(TrailerV4::decode_fields(&mut reader)?),
            5 => Self::V5(TrailerV5::decode_fields(&mut reader)?),
            _ => return Err(corrupt("unknown trailer version")),
        })
    }

    fn v1(&self) -> Option<&TrailerV1> {
        match self {
            Self::V0(_) => None,
            Self::V1(t) => Some(t),
            Self::V2(t) => Some(&t.base),
            Self::V3(t) => Some(&t.base.base),
            Self::V4(t) => Some(&t.base.base.base),
            Self::V5(t) => Some(&t.base.base.base.base),
        }
    }

    /// Offset of the fixed index block.
    #[must_use]
    pub fn fix_index_offset(&self) -> u64 {
        match self {
            Self::V0(t) => t.fix_index_offset.into(),
            other => other.v1().map(|t| t.fix_index_offset).unwrap_or_default(),
        }
    }

    /// Offset of the variable index block.
    #[must_use]
    pub fn var_index_offset(&self) -> u64 {
        match self {
            Self::V0(t) => t.var_index_offset.into(),
            other => other.v1().map(|t| t.var_index_offset).unwrap_or_default(),
        }
    }

    /// Offset of the bloom filter block, if one was written.
    #[must_use]
    pub fn filter_offset(&self) -> Option<u64> {
        let offset = match self {
            Self::V0(t) => t.filter_offset.into(),
            other => other.v1().map(|t| t.filter_offset).unwrap_or_default(),
        };
        (offset != 0).then_some(offset)
    }

    /// Number of data blocks.
    #[must_use]
    pub fn index_entries(&self) -> u32 {
        match self {
            Self::V0(t) => t.index_entries,
            other => other.v1().map(|t| t.index_entries).unwrap_or_default(),
        }
    }

    /// Number of cells.
    #[must_use]
    pub fn total_entries(&self) -> u64 {
        match self {
            Self::V0(t) => t.total_entries.into(),
            other => other.v1().map(|t| t.total_entries).unwrap_or_default(),
        }
    }

    /// Highest revision in the store; 0 for v0 stores, which predate revisions.
    #[must_use]
    pub fn revision(&self) -> i64 {
        self.v1().map(|t| t.revision).unwrap_or_default()
    }

    /// Smallest cell timestamp.
    #[must_use]
    pub fn timestamp_min(&self) -> i64 {
        match self {
            Self::V0(t) => t.timestamp_min,
            other => other.v1().map(|t| t.timestamp_min).unwrap_or_default(),
        }
    }

    /// Largest cell timestamp.
    #[must_use]
    pub fn timestamp_max(&self) -> i64 {
        match self {
            Self::V0(t) => t.timestamp_max,
            other => other.v1().map(|t| t.timestamp_max).unwrap_or_default(),
        }
    }

    /// Schema generation the store was written under.
    #[must_use]
    pub fn table_generation(&self) -> u32 {
        match self {
            Self::V0(t) => t.table_generation,
            other => other.v1().map(|t| t.table_generation).unwrap_or_default(),
        }
    }

    /// Codec of the data blocks.
    pub fn compression(&self) -> crate::Result<CompressionType> {
        let id = match self {
            Self::V0(t) => t.compression_codec,
            other => other.v1().map(|t| t.compression_codec).unwrap_or_default(),
        };
        CompressionType::from_id(id)
    }

    /// `FLAG_*` bits.
    #[must_use]
    pub fn flags(&self) -> u16 {
        match self {
            Self::V0(t) => t.flags,
            other => other.v1().map(|t| t.flags).unwrap_or_default(),
        }
    }

    /// Bloom filter mode; v0 stores never carry one.
    #[must_use]
    pub fn bloom_mode(&self) -> BloomMode {
        self.v1()
            .and_then(|t| BloomMode::from_id(t.bloom_mode).ok())
            .unwrap_or(BloomMode::Disabled)
    }

    /// On-disk length of the filter block.
    #[must_use]
    pub fn filter_length(&self) -> u64 {
        self.v1().map(|t| t.filter_length).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn sample_v1() -> TrailerV1 {
        TrailerV1 {
            fix_index_offset: 1000,
            var_index_offset: 900,
            filter_offset: 1100,
            filter_items: 50,
            filter_length: 64,
            block_size: 65_536,
            index_entries: 3,
            total_entries: 50,
            revision: 77,
            timestamp_min: 10,
            timestamp_max: 99,
            compressed_data_length: 800,
            uncompressed_data_length: 900,
            table_generation: 2,
            compression_codec: 1,
            flags: FLAG_64BIT_INDEX,
            bloom_mode: 1,
            bloom_hash_count: 7,
        }
    }

    #[test]
    fn trailer_sizes_match_layouts() {
        let trailers = [
            Trailer::V0(TrailerV0::default()),
            Trailer::V1(TrailerV1::default()),
            Trailer::V2(TrailerV2::default()),
            Trailer::V3(TrailerV3::default()),
            Trailer::V4(TrailerV4::default()),
            Trailer::V5(TrailerV5::default()),
        ];

        for trailer in trailers {
            let encoded = trailer.encode();
            assert_eq!(
                TRAILER_SIZES[usize::from(trailer.version())],
                encoded.len(),
                "v{}",
                trailer.version()
            );
        }
    }

    #[test]
    fn trailer_roundtrip_every_version() -> crate::Result<()> {
        let v1 = sample_v1();
        let v2 = TrailerV2 {
            base: v1.clone(),
            key_bytes: 123,
            value_bytes: 456,
        };
        let v3 = TrailerV3 {
            base: v2.clone(),
            replaced_files_offset: 0,
            replaced_files_count: 0,
        };
        let v4 = TrailerV4 {
            base: v3.clone(),
            alignment: 512,
            preload_offset: 0,
        };
        let v5 = TrailerV5 {
            base: v4.clone(),
            delete_count: 1,
            insert_count: 49,
            expirable_bytes: 0,
        };

        let trailers = [
            Trailer::V0(TrailerV0 {
                fix_index_offset: 100,
                var_index_offset: 90,
                filter_offset: 0,
                block_size: 65_536,
                index_entries: 2,
                total_entries: 10,
                timestamp_min: 1,
                timestamp_max: 9,
                table_generation: 1,
                compression_codec: 0,
                flags: 0,
            }),
            Trailer::V1(v1),
            Trailer::V2(v2),
            Trailer::V3(v3),
            Trailer::V4(v4),
            Trailer::V5(v5),
        ];

        for trailer in trailers {
            let encoded = trailer.encode();
            let decoded = Trailer::decode_tail(&encoded)?;
            assert_eq!(trailer, decoded);
            assert_eq!(trailer.version(), decoded.version());
        }

        Ok(())
    }

    #[test]
    fn trailer_unknown_version() {
        let mut encoded = Trailer::V5(TrailerV5::default()).encode();
        let len = encoded.len();
        encoded[len - 2..].copy_from_slice(&99u16.to_be_bytes());

        assert!(matches!(
            Trailer::decode_tail(&encoded),
            Err(crate::Error::CorruptCellStore(_))
        ));
    }

    #[test]
    fn trailer_checksum_mismatch() {
        let mut encoded = Trailer::V1(sample_v1()).encode();
        encoded[0] ^= 0xFF;

        assert!(matches!(
            Trailer::decode_tail(&encoded),
            Err(crate::Error::CorruptCellStore(_))
        ));
    }

    #[test]
    fn trailer_accessors_upcast() {
        let trailer = Trailer::V5(TrailerV5 {
            base: TrailerV4 {
                base: TrailerV3 {
                    base: TrailerV2 {
                        base: sample_v1(),
                        key_bytes: 0,
                        value_bytes: 0,
                    },
                    replaced_files_offset: 0,
                    replaced_files_count: 0,
                },
                alignment: 0,
                preload_offset: 0,
            },
            delete_count: 0,
            insert_count: 0,
            expirable_bytes: 0,
        });

        assert_eq!(1000, trailer.fix_index_offset());
        assert_eq!(900, trailer.var_index_offset());
        assert_eq!(Some(1100), trailer.filter_offset());
        assert_eq!(77, trailer.revision());
        assert_eq!(BloomMode::Rows, trailer.bloom_mode());
    }
}
