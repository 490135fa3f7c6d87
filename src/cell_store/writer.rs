// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{
    bloom::{rows_cols_key, BloomBuilder, BloomMode},
    index::{BlockIndex, IndexEntry},
    trailer::{Trailer, TrailerV1, TrailerV2, TrailerV3, TrailerV4, TrailerV5, FLAG_64BIT_INDEX,
              FLAG_MAJOR_COMPACTION, FLAG_SPLIT},
    DATA_MAGIC, FILTER_MAGIC, INDEX_MAGIC,
};
use crate::{
    block,
    cell::Cell,
    coding::Encode,
    fs::{Fd, Filesystem, OpenFlags},
    CompressionType, Slice,
};
use std::sync::Arc;

const BLOOM_BITS_PER_KEY: f32 = 10.0;

/// Settings for writing one cell store
#[derive(Clone, Debug)]
pub struct CellStoreWriterOptions {
    /// Target uncompressed block size
    pub block_size: u32,

    /// Codec for data blocks
    pub compressor: CompressionType,

    /// Bloom filter mode
    pub bloom_mode: BloomMode,

    /// Schema generation the store is written under
    pub table_generation: u32,

    /// Mark the store as produced by a major compaction
    pub major: bool,

    /// Mark the store as produced by a split shrink
    pub split: bool,
}

impl Default for CellStoreWriterOptions {
    fn default() -> Self {
        Self {
            block_size: 65_536,
            compressor: CompressionType::Zlib,
            bloom_mode: BloomMode::Rows,
            table_generation: 0,
            major: false,
            split: false,
        }
    }
}

/// Writes an immutable sorted run of cells to the broker
///
/// Cells must arrive in strictly ascending key order. On [`CellStoreWriter::finish`],
/// the variable index, the fixed index, the bloom filter and the trailer are
/// appended after the data blocks.
pub struct CellStoreWriter {
    fs: Arc<dyn Filesystem>,
    path: String,
    fd: Option<Fd>,
    options: CellStoreWriterOptions,

    buffer: Vec<u8>,
    block_first_key: Option<Slice>,
    last_key: Option<Slice>,
    index: Vec<IndexEntry>,
    offset: u64,

    bloom: BloomBuilder,

    total_entries: u64,
    delete_count: u64,
    insert_count: u64,
    key_bytes: u64,
    value_bytes: u64,
    expirable_bytes: u64,
    compressed_data_length: u64,
    uncompressed_data_length: u64,
    timestamp_min: i64,
    timestamp_max: i64,
    revision: i64,
}

impl CellStoreWriter {
    /// Creates the store file and a writer over it.
    pub fn create(
        fs: Arc<dyn Filesystem>,
        path: &str,
        options: CellStoreWriterOptions,
    ) -> crate::Result<Self> {
        let fd = fs.create(path, true, 3, i64::from(options.block_size))?;

        Ok(Self {
            fs,
            path: path.into(),
            fd: Some(fd),
            options,
            buffer: vec![],
            block_first_key: None,
            last_key: None,
            index: vec![],
            offset: 0,
            bloom: BloomBuilder::new(),
            total_entries: 0,
            delete_count: 0,
            insert_count: 0,
            key_bytes: 0,
            value_bytes: 0,
            expirable_bytes: 0,
            compressed_data_length: 0,
            uncompressed_data_length: 0,
            timestamp_min: i64::MAX,
            timestamp_max: i64::MIN,
            revision: 0,
        })
    }

    /// Path the store is written to.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Number of cells added so far.
    #[must_use]
    pub fn cell_count(&self) -> u64 {
        self.total_entries
    }

    /// Appends a cell.
    ///
    /// Fails with [`crate::Error::CorruptCellStore`] if the cell's key does
    /// not sort strictly after the previous one.
    pub fn add(&mut self, cell: &Cell) -> crate::Result<()> {
        let encoded_key = cell.key.encode();

        if let Some(last) = &self.last_key {
            if *last >= encoded_key {
                return Err(crate::Error::CorruptCellStore(format!(
                    "out-of-order add: {:?} after {:?}",
                    cell.key, last
                )));
            }
        }

        if self.block_first_key.is_none() {
            self.block_first_key = Some(encoded_key.clone());
        }

        match self.options.bloom_mode {
            BloomMode::Disabled => {}
            BloomMode::Rows => self.bloom.add(&cell.key.row),
            BloomMode::RowsCols => self.bloom.add(&rows_cols_key(
                &cell.key.row,
                cell.key.family,
                &cell.key.qualifier,
            )),
        }

        cell.encode_into(&mut self.buffer)?;

        self.total_entries += 1;
        if cell.is_delete() {
            self.delete_count += 1;
        } else {
            self.insert_count += 1;
        }
        self.key_bytes += encoded_key.len() as u64;
        self.value_bytes += cell.value.len() as u64;
        self.timestamp_min = self.timestamp_min.min(cell.key.timestamp);
        self.timestamp_max = self.timestamp_max.max(cell.key.timestamp);
        self.revision = self.revision.max(cell.key.revision);

        self.last_key = Some(encoded_key);

        if self.buffer.len() >= self.options.block_size as usize {
            self.flush_block()?;
        }

        Ok(())
    }

    fn append(&mut self, bytes: &[u8]) -> crate::Result<u64> {
        let fd = self.fd.ok_or(crate::Error::ShuttingDown)?;
        self.fs.append(fd, bytes, OpenFlags::None)?;

        let offset = self.offset;
        self.offset += bytes.len() as u64;
        Ok(offset)
    }

    fn flush_block(&mut self) -> crate::Result<()> {
        let Some(first_key) = self.block_first_key.take() else {
            return Ok(());
        };

        let payload = std::mem::take(&mut self.buffer);
        let block = block::encode_block(DATA_MAGIC, self.options.compressor, &[], &payload)?;

        self.uncompressed_data_length += payload.len() as u64;
        self.compressed_data_length += block.len() as u64;

        let offset = self.append(&block)?;
        self.index.push(IndexEntry { first_key, offset });

        Ok(())
    }

    /// Flushes the last block, writes indexes, filter and trailer, closes
    /// the file and returns its total length.
    pub fn finish(mut self) -> crate::Result<u64> {
        self.flush_block()?;

        let index = BlockIndex::new(std::mem::take(&mut self.index));

        let var_index_offset = self.append(&block::encode_block(
            INDEX_MAGIC,
            self.options.compressor,
            &[],
            &index.encode_var_payload(),
        )?)?;

        let fix_index_offset = self.append(&block::encode_block(
            INDEX_MAGIC,
            self.options.compressor,
            &[],
            &index.encode_fix_payload(true),
        )?)?;

        let (filter_offset, filter_items, filter_length, bloom_hash_count) =
            if self.options.bloom_mode == BloomMode::Disabled || self.bloom.is_empty() {
                (0, 0, 0, 0)
            } else {
                let filter = self.bloom.build(BLOOM_BITS_PER_KEY);
                let framed = block::encode_block(
                    FILTER_MAGIC,
                    CompressionType::None,
                    &[],
                    &filter.encode(),
                )?;
                let offset = self.append(&framed)?;
                (
                    offset,
                    self.bloom.len() as u64,
                    framed.len() as u64,
                    filter.hash_count(),
                )
            };

        let mut flags = FLAG_64BIT_INDEX;
        if self.options.major {
            flags |= FLAG_MAJOR_COMPACTION;
        }
        if self.options.split {
            flags |= FLAG_SPLIT;
        }

        let bloom_mode = if filter_offset == 0 {
            BloomMode::Disabled
        } else {
            self.options.bloom_mode
        };

        // NOTE: A store holds far fewer than 2^32 blocks
        #[allow(clippy::cast_possible_truncation)]
        let index_entries = index.len() as u32;

        let trailer = Trailer::V5(TrailerV5 {
            base: TrailerV4 {
                base: TrailerV3 {
                    base: TrailerV2 {
                        base: TrailerV1 {
                            fix_index_offset,
                            var_index_offset,
                            filter_offset,
                            filter_items,
                            filter_length,
                            block_size: self.options.block_size,
                            index_entries,
                            total_entries: self.total_entries,
                            revision: self.revision,
                            timestamp_min: if self.total_entries == 0 {
                                0
                            } else {
                                self.timestamp_min
                            },
                            timestamp_max: if self.total_entries == 0 {
                                0
                            } else {
                                self.timestamp_max
                            },
                            compressed_data_length: self.compressed_data_length,
                            uncompressed_data_length: self.uncompressed_data_length,
                            table_generation: self.options.table_generation,
                            compression_codec: self.options.compressor.id(),
                            flags,
                            bloom_mode: bloom_mode.id(),
                            bloom_hash_count,
                        },
                        key_bytes: self.key_bytes,
                        value_bytes: self.value_bytes,
                    },
                    replaced_files_offset: 0,
                    replaced_files_count: 0,
                },
                alignment: 0,
                preload_offset: 0,
            },
            delete_count: self.delete_count,
            insert_count: self.insert_count,
            expirable_bytes: self.expirable_bytes,
        });

        self.append(&trailer.encode())?;

        let fd = self.fd.take().ok_or(crate::Error::ShuttingDown)?;
        self.fs.flush(fd)?;
        self.fs.close(fd)?;

        log::debug!(
            "Finished cell store {:?}: {} cells, {} blocks, {} bytes",
            self.path,
            self.total_entries,
            index.len(),
            self.offset
        );

        Ok(self.offset)
    }
}

impl Drop for CellStoreWriter {
    fn drop(&mut self) {
        if let Some(fd) = self.fd.take() {
            log::warn!("Cell store writer for {:?} dropped unfinished", self.path);
            if let Err(e) = self.fs.close(fd) {
                log::error!("Problem closing {:?}: {e}", self.path);
            }
        }
    }
}
