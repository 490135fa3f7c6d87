// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Immutable on-disk sorted runs of cells.
//!
//! A cell store is a sequence of compressed data blocks, followed by a
//! variable index (per-block first keys), a fixed index (per-block offsets),
//! an optional bloom filter and a versioned trailer. Seeks bisect the index
//! and scan one block; the block index and the filter can be dropped under
//! memory pressure and are rebuilt from the file tail on demand.

pub mod bloom;
mod index;
mod trailer;
mod writer;

pub use bloom::{BloomFilter, BloomMode};
pub use index::{BlockIndex, IndexEntry};
pub use trailer::{Trailer, MAX_TRAILER_SIZE, TRAILER_SIZES};
pub use writer::{CellStoreWriter, CellStoreWriterOptions};

use crate::{
    block::BlockHeader,
    cell::Cell,
    coding,
    fs::{Fd, Filesystem},
    key::Key,
    Slice,
};
use bloom::rows_cols_key;
use quick_cache::{sync::Cache as QuickCache, Weighter};
use std::{
    collections::VecDeque,
    io::Cursor,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

pub(crate) const DATA_MAGIC: [u8; 10] = *b"CELLSTDATA";
pub(crate) const INDEX_MAGIC: [u8; 10] = *b"CELLSTINDX";
pub(crate) const FILTER_MAGIC: [u8; 10] = *b"CELLSTBLOM";

static NEXT_CACHE_ID: AtomicU64 = AtomicU64::new(0);

#[derive(Clone)]
struct BlockWeighter;

impl Weighter<(u64, u64), Arc<Vec<u8>>> for BlockWeighter {
    fn weight(&self, _: &(u64, u64), payload: &Arc<Vec<u8>>) -> u64 {
        payload.len() as u64
    }
}

/// Caches decompressed data blocks across all cell stores of a server
///
/// This speeds up consecutive queries to nearby data, improving read
/// performance for hot data.
pub struct BlockCache {
    data: QuickCache<(u64, u64), Arc<Vec<u8>>, BlockWeighter, rustc_hash::FxBuildHasher>,
    capacity: u64,
}

impl BlockCache {
    /// Creates a block cache with roughly `bytes` of capacity.
    #[must_use]
    pub fn with_capacity_bytes(bytes: u64) -> Self {
        use quick_cache::sync::DefaultLifecycle;

        #[allow(clippy::expect_used)]
        let opts = quick_cache::OptionsBuilder::new()
            .weight_capacity(bytes)
            .hot_allocation(0.9)
            .estimated_items_capacity(100_000)
            .build()
            .expect("cache options should be valid");

        #[allow(clippy::default_trait_access)]
        let data = QuickCache::with_options(
            opts,
            BlockWeighter,
            Default::default(),
            DefaultLifecycle::default(),
        );

        Self {
            data,
            capacity: bytes,
        }
    }

    /// Returns the amount of cached bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.data.weight()
    }

    /// Returns the cache capacity in bytes.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    fn get(&self, key: (u64, u64)) -> Option<Arc<Vec<u8>>> {
        self.data.get(&key)
    }

    fn insert(&self, key: (u64, u64), payload: Arc<Vec<u8>>) {
        self.data.insert(key, payload);
    }
}

/// An opened, immutable cell store
pub struct CellStore {
    fs: Arc<dyn Filesystem>,
    path: String,
    fd: Fd,
    cache_id: u64,
    file_length: u64,
    trailer: Trailer,
    block_cache: Option<Arc<BlockCache>>,
    index: Mutex<Option<Arc<BlockIndex>>>,
    filter: Mutex<Option<Arc<BloomFilter>>>,
}

impl CellStore {
    /// Opens a cell store, reading and dispatching its trailer.
    pub fn open(
        fs: Arc<dyn Filesystem>,
        path: &str,
        block_cache: Option<Arc<BlockCache>>,
    ) -> crate::Result<Arc<Self>> {
        let file_length = fs.length(path)?;
        let fd = fs.open(path)?;

        let tail_len = file_length.min(MAX_TRAILER_SIZE as u64);
        let tail = fs.pread(fd, file_length - tail_len, tail_len as usize)?;

        let trailer = match Trailer::decode_tail(&tail) {
            Ok(trailer) => trailer,
            Err(e) => {
                let _ = fs.close(fd);
                return Err(e);
            }
        };

        // Reject stores compressed with a codec this build cannot inflate
        if let Err(e) = trailer.compression() {
            let _ = fs.close(fd);
            return Err(e);
        }

        Ok(Arc::new(Self {
            fs,
            path: path.into(),
            fd,
            cache_id: NEXT_CACHE_ID.fetch_add(1, Ordering::Relaxed),
            file_length,
            trailer,
            block_cache,
            index: Mutex::new(None),
            filter: Mutex::new(None),
        }))
    }

    /// Path of the store file.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Decoded trailer.
    #[must_use]
    pub fn trailer(&self) -> &Trailer {
        &self.trailer
    }

    /// File size in bytes.
    #[must_use]
    pub fn disk_usage(&self) -> u64 {
        self.file_length
    }

    fn read_framed_block_at(&self, offset: u64, expected_magic: [u8; 10]) -> crate::Result<Vec<u8>> {
        let slab = self.fs.pread(self.fd, offset, 256)?;
        let mut cursor = Cursor::new(&slab[..]);

        let (header, _) = BlockHeader::decode_from(&mut cursor)?;

        if header.magic != expected_magic {
            return Err(crate::Error::CorruptCellStore(format!(
                "unexpected block magic at offset {offset} in {:?}",
                self.path
            )));
        }

        let payload_offset = offset + cursor.position();
        let compressed = self
            .fs
            .pread(self.fd, payload_offset, header.compressed_len as usize)?;

        crate::block::decode_payload(&mut Cursor::new(compressed), &header)
    }

    /// Returns the block index, loading it from the file tail if it was
    /// dropped or never loaded.
    pub fn block_index(&self) -> crate::Result<Arc<BlockIndex>> {
        #[allow(clippy::expect_used)]
        let mut slot = self.index.lock().expect("lock is poisoned");

        if let Some(index) = &*slot {
            return Ok(index.clone());
        }

        let var_payload =
            self.read_framed_block_at(self.trailer.var_index_offset(), INDEX_MAGIC)?;
        let fix_payload =
            self.read_framed_block_at(self.trailer.fix_index_offset(), INDEX_MAGIC)?;

        let sixty_four_bit = match &self.trailer {
            Trailer::V0(t) => t.flags & trailer::FLAG_64BIT_INDEX != 0,
            _ => true,
        };

        let index = Arc::new(BlockIndex::decode(
            &var_payload,
            &fix_payload,
            self.trailer.index_entries(),
            sixty_four_bit,
        )?);

        *slot = Some(index.clone());
        Ok(index)
    }

    fn bloom_filter(&self) -> crate::Result<Option<Arc<BloomFilter>>> {
        let Some(offset) = self.trailer.filter_offset() else {
            return Ok(None);
        };

        #[allow(clippy::expect_used)]
        let mut slot = self.filter.lock().expect("lock is poisoned");

        if let Some(filter) = &*slot {
            return Ok(Some(filter.clone()));
        }

        let payload = self.read_framed_block_at(offset, FILTER_MAGIC)?;
        let filter = Arc::new(BloomFilter::decode(&mut &payload[..])?);

        *slot = Some(filter.clone());
        Ok(Some(filter))
    }

    /// Returns `false` if the filter proves no cell of the row exists here.
    pub fn may_contain_row(&self, row: &[u8]) -> crate::Result<bool> {
        if self.trailer.bloom_mode() != BloomMode::Rows {
            return Ok(true);
        }

        Ok(match self.bloom_filter()? {
            Some(filter) => filter.contains(row),
            None => true,
        })
    }

    /// Returns `false` if the filter proves the cell does not exist here.
    pub fn may_contain_cell(
        &self,
        row: &[u8],
        family: u8,
        qualifier: &[u8],
    ) -> crate::Result<bool> {
        match self.trailer.bloom_mode() {
            BloomMode::Disabled => Ok(true),
            BloomMode::Rows => self.may_contain_row(row),
            BloomMode::RowsCols => Ok(match self.bloom_filter()? {
                Some(filter) => filter.contains(&rows_cols_key(row, family, qualifier)),
                None => true,
            }),
        }
    }

    /// Bytes of memory the loaded block index occupies.
    #[must_use]
    pub fn index_memory(&self) -> u64 {
        #[allow(clippy::expect_used)]
        self.index
            .lock()
            .expect("lock is poisoned")
            .as_ref()
            .map(|index| index.memory_used())
            .unwrap_or_default()
    }

    /// Bytes of memory the loaded bloom filter occupies.
    #[must_use]
    pub fn filter_memory(&self) -> u64 {
        #[allow(clippy::expect_used)]
        self.filter
            .lock()
            .expect("lock is poisoned")
            .as_ref()
            .map(|filter| filter.len() as u64)
            .unwrap_or_default()
    }

    /// Drops the loaded index and filter, returning the bytes released.
    /// Both are rebuilt from the file tail on next use.
    pub fn purge_memory(&self) -> u64 {
        let freed = self.index_memory() + self.filter_memory();

        #[allow(clippy::expect_used)]
        {
            *self.index.lock().expect("lock is poisoned") = None;
            *self.filter.lock().expect("lock is poisoned") = None;
        }

        freed
    }

    /// Median row of the block index, for split-point election.
    pub fn median_row(&self) -> crate::Result<Option<Slice>> {
        Ok(self.block_index()?.median_row())
    }

    /// Opens a scanner positioned at the first cell with serialized key
    /// `>= start`, or at the first cell of the store.
    pub fn scanner(
        self: &Arc<Self>,
        start: Option<&[u8]>,
    ) -> crate::Result<CellStoreScanner> {
        CellStoreScanner::new(self.clone(), start)
    }

    fn load_block(&self, block: usize, index: &BlockIndex) -> crate::Result<Option<Arc<Vec<u8>>>> {
        let Some(entry) = index.get(block) else {
            return Ok(None);
        };

        let cache_key = (self.cache_id, entry.offset);

        if let Some(cache) = &self.block_cache {
            if let Some(payload) = cache.get(cache_key) {
                return Ok(Some(payload));
            }
        }

        let payload = Arc::new(self.read_framed_block_at(entry.offset, DATA_MAGIC)?);

        if let Some(cache) = &self.block_cache {
            cache.insert(cache_key, payload.clone());
        }

        Ok(Some(payload))
    }
}

impl Drop for CellStore {
    fn drop(&mut self) {
        if let Err(e) = self.fs.close(self.fd) {
            log::error!("Problem closing cell store {:?}: {e}", self.path);
        }
    }
}

impl std::fmt::Debug for CellStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "CellStore({:?}, v{}, {} cells)",
            self.path,
            self.trailer.version(),
            self.trailer.total_entries()
        )
    }
}

fn parse_block_cells(payload: &[u8]) -> crate::Result<VecDeque<(Slice, Cell)>> {
    let mut cells = VecDeque::new();
    let mut cursor = payload;

    while !cursor.is_empty() {
        let key_bytes = coding::decode_vstr16(&mut cursor)
            .map_err(|_| crate::Error::CorruptCellStore("truncated data block".into()))?;
        let key = Key::decode(&key_bytes)?;
        let value = coding::decode_vstr32(&mut cursor)
            .map_err(|_| crate::Error::CorruptCellStore("truncated data block".into()))?;

        cells.push_back((Slice::from(key_bytes), Cell::new(key, value)));
    }

    Ok(cells)
}

/// Streams the cells of one store in key order
pub struct CellStoreScanner {
    store: Arc<CellStore>,
    index: Arc<BlockIndex>,
    cells: VecDeque<(Slice, Cell)>,
    next_block: usize,
}

impl CellStoreScanner {
    fn new(store: Arc<CellStore>, start: Option<&[u8]>) -> crate::Result<Self> {
        let index = store.block_index()?;

        let mut scanner = Self {
            store,
            index,
            cells: VecDeque::new(),
            next_block: 0,
        };

        if let Some(start) = start {
            scanner.next_block = scanner.index.seek_block(start);
            scanner.fill()?;

            while let Some((raw, _)) = scanner.cells.front() {
                if &**raw >= start {
                    break;
                }
                scanner.cells.pop_front();
            }
        }

        Ok(scanner)
    }

    fn fill(&mut self) -> crate::Result<()> {
        while self.cells.is_empty() {
            let Some(payload) = self.store.load_block(self.next_block, &self.index)? else {
                return Ok(());
            };
            self.next_block += 1;
            self.cells = parse_block_cells(&payload)?;
        }
        Ok(())
    }
}

impl Iterator for CellStoreScanner {
    type Item = crate::Result<Cell>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cells.is_empty() {
            fail_iter!(self.fill());
        }

        self.cells.pop_front().map(|(_, cell)| Ok(cell))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::LocalBroker;
    use crate::CompressionType;
    use test_log::test;

    fn write_store(
        fs: &Arc<dyn Filesystem>,
        path: &str,
        rows: &[&str],
        options: CellStoreWriterOptions,
    ) -> crate::Result<u64> {
        let mut writer = CellStoreWriter::create(fs.clone(), path, options)?;
        for (i, row) in rows.iter().enumerate() {
            writer.add(&Cell::new(
                Key::insert(*row, 1, "", 10, i as i64 + 1),
                format!("value-{row}"),
            ))?;
        }
        writer.finish()
    }

    fn small_blocks() -> CellStoreWriterOptions {
        CellStoreWriterOptions {
            block_size: 64,
            compressor: CompressionType::Zlib,
            ..Default::default()
        }
    }

    #[test]
    fn cell_store_roundtrip() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let fs: Arc<dyn Filesystem> = Arc::new(LocalBroker::new(dir.path()));

        let rows: Vec<String> = (0..50).map(|i| format!("row-{i:03}")).collect();
        let row_refs: Vec<&str> = rows.iter().map(String::as_str).collect();
        write_store(&fs, "cs/0", &row_refs, small_blocks())?;

        let store = CellStore::open(fs, "cs/0", None)?;
        assert_eq!(5, store.trailer().version());
        assert_eq!(50, store.trailer().total_entries());
        assert!(store.trailer().index_entries() > 1, "want multiple blocks");

        let cells: Vec<Cell> = store.scanner(None)?.collect::<crate::Result<Vec<_>>>()?;
        assert_eq!(50, cells.len());
        for (cell, row) in cells.iter().zip(&rows) {
            assert_eq!(row.as_bytes(), &*cell.key.row);
            assert_eq!(format!("value-{row}").as_bytes(), &*cell.value);
        }

        Ok(())
    }

    #[test]
    fn cell_store_seek() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let fs: Arc<dyn Filesystem> = Arc::new(LocalBroker::new(dir.path()));

        write_store(&fs, "cs/0", &["a", "c", "e", "g", "i", "k"], small_blocks())?;
        let store = CellStore::open(fs, "cs/0", None)?;

        // Probe key between "c" and "e"
        let probe = Key::insert("d", 0, "", i64::MAX, i64::MAX).encode();
        let mut scanner = store.scanner(Some(&probe))?;

        let first = scanner.next().expect("should yield")?;
        assert_eq!(b"e", &*first.key.row);

        let rest: Vec<Vec<u8>> = scanner
            .collect::<crate::Result<Vec<_>>>()?
            .iter()
            .map(|c| c.key.row.to_vec())
            .collect();
        assert_eq!(vec![b"g".to_vec(), b"i".to_vec(), b"k".to_vec()], rest);

        Ok(())
    }

    #[test]
    fn cell_store_rejects_out_of_order() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let fs: Arc<dyn Filesystem> = Arc::new(LocalBroker::new(dir.path()));

        let mut writer = CellStoreWriter::create(fs, "cs/0", CellStoreWriterOptions::default())?;
        writer.add(&Cell::new(Key::insert("b", 1, "", 10, 1), "x"))?;

        let result = writer.add(&Cell::new(Key::insert("a", 1, "", 10, 2), "y"));
        assert!(matches!(result, Err(crate::Error::CorruptCellStore(_))));

        Ok(())
    }

    #[test]
    fn cell_store_unknown_trailer_version() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let fs: Arc<dyn Filesystem> = Arc::new(LocalBroker::new(dir.path()));

        write_store(&fs, "cs/0", &["a", "b"], CellStoreWriterOptions::default())?;

        // Stomp the version word
        let path = dir.path().join("cs/0");
        let mut data = std::fs::read(&path)?;
        let len = data.len();
        data[len - 2..].copy_from_slice(&99u16.to_be_bytes());
        std::fs::write(&path, data)?;

        assert!(matches!(
            CellStore::open(fs, "cs/0", None),
            Err(crate::Error::CorruptCellStore(_))
        ));

        Ok(())
    }

    #[test]
    fn cell_store_bloom_filter_rows() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let fs: Arc<dyn Filesystem> = Arc::new(LocalBroker::new(dir.path()));

        write_store(&fs, "cs/0", &["apple", "banana"], CellStoreWriterOptions::default())?;
        let store = CellStore::open(fs, "cs/0", None)?;

        assert_eq!(BloomMode::Rows, store.trailer().bloom_mode());
        assert!(store.may_contain_row(b"apple")?);
        assert!(store.may_contain_row(b"banana")?);

        let mut false_positives = 0;
        for i in 0..100 {
            if store.may_contain_row(format!("absent-{i}").as_bytes())? {
                false_positives += 1;
            }
        }
        assert!(false_positives < 50, "{false_positives} false positives");

        Ok(())
    }

    #[test]
    fn cell_store_index_purge_and_rebuild() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let fs: Arc<dyn Filesystem> = Arc::new(LocalBroker::new(dir.path()));

        write_store(&fs, "cs/0", &["a", "b", "c", "d"], small_blocks())?;
        let store = CellStore::open(fs, "cs/0", None)?;

        let _ = store.block_index()?;
        let _ = store.may_contain_row(b"a")?;
        assert!(store.index_memory() > 0);

        let freed = store.purge_memory();
        assert!(freed > 0);
        assert_eq!(0, store.index_memory());

        // Rebuilds transparently
        let cells: Vec<Cell> = store.scanner(None)?.collect::<crate::Result<Vec<_>>>()?;
        assert_eq!(4, cells.len());
        assert!(store.index_memory() > 0);

        Ok(())
    }

    #[test]
    fn cell_store_block_cache_hit() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let fs: Arc<dyn Filesystem> = Arc::new(LocalBroker::new(dir.path()));

        write_store(&fs, "cs/0", &["a", "b", "c"], CellStoreWriterOptions::default())?;

        let cache = Arc::new(BlockCache::with_capacity_bytes(1024 * 1024));
        let store = CellStore::open(fs, "cs/0", Some(cache.clone()))?;

        let _ = store.scanner(None)?.collect::<crate::Result<Vec<_>>>()?;
        assert!(cache.size() > 0);

        let cells: Vec<Cell> = store.scanner(None)?.collect::<crate::Result<Vec<_>>>()?;
        assert_eq!(3, cells.len());

        Ok(())
    }
}
