// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::CellListScanner;
use crate::{
    coding::{self, Decode, DecodeError, Encode, EncodeError},
    Slice,
};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};
use std::iter::Peekable;

/// Default byte budget of one scan block
pub const DEFAULT_SCANBLOCK_SIZE: usize = 64 * 1024;

/// A bounded transport frame of serialized `(key, value)` pairs
///
/// `eos` tells the client the server-side scanner is exhausted and has been
/// retired; otherwise the scanner id stays valid for `fetch_scanblock`.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ScanBlock {
    /// Server-side scanner id
    pub scanner_id: u32,

    /// No more cells after this block
    pub eos: bool,

    /// Serialized key/value pairs in key order
    pub cells: Vec<(Slice, Slice)>,
}

impl ScanBlock {
    /// Drains up to `max_bytes` of cells from a scanner into a block.
    ///
    /// Sets `eos` when the scanner is fully exhausted.
    pub fn fill(
        scanner: &mut Peekable<CellListScanner>,
        scanner_id: u32,
        max_bytes: usize,
    ) -> crate::Result<Self> {
        let mut block = Self {
            scanner_id,
            eos: false,
            cells: vec![],
        };

        let mut used = 0;

        loop {
            if scanner.peek().is_none() {
                block.eos = true;
                break;
            }

            if used >= max_bytes {
                break;
            }

            #[allow(clippy::expect_used)]
            let cell = scanner.next().expect("peeked")?;

            used += cell.encoded_len();
            block.cells.push((cell.key.encode(), cell.value));
        }

        Ok(block)
    }

    /// Number of cells in the block.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Returns `true` if the block carries no cells.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

impl Encode for ScanBlock {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_u32::<BigEndian>(self.scanner_id)?;
        writer.write_u8(u8::from(self.eos))?;

        // NOTE: Blocks are bounded far below 2^32 cells
        #[allow(clippy::cast_possible_truncation)]
        writer.write_u32::<BigEndian>(self.cells.len() as u32)?;

        for (key, value) in &self.cells {
            coding::encode_vstr16(writer, key)?;
            coding::encode_vstr32(writer, value)?;
        }

        Ok(())
    }
}

impl Decode for ScanBlock {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let scanner_id = reader.read_u32::<BigEndian>()?;
        let eos = reader.read_u8()? != 0;
        let count = reader.read_u32::<BigEndian>()?;

        let mut cells = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let key = coding::decode_vstr16(reader)?;
            let value = coding::decode_vstr32(reader)?;
            cells.push((Slice::from(key), Slice::from(value)));
        }

        Ok(Self {
            scanner_id,
            eos,
            cells,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{cell::Cell, key::Key};
    use test_log::test;

    fn scanner_of(cells: Vec<Cell>) -> Peekable<CellListScanner> {
        let boxed: CellListScanner = Box::new(cells.into_iter().map(Ok));
        boxed.peekable()
    }

    #[test]
    fn scan_block_fill_sets_eos() -> crate::Result<()> {
        let mut scanner = scanner_of(vec![
            Cell::new(Key::insert("a", 1, "", 10, 1), "1"),
            Cell::new(Key::insert("b", 1, "", 10, 2), "2"),
        ]);

        let block = ScanBlock::fill(&mut scanner, 7, usize::MAX)?;
        assert_eq!(7, block.scanner_id);
        assert!(block.eos);
        assert_eq!(2, block.len());

        Ok(())
    }

    #[test]
    fn scan_block_fill_respects_budget() -> crate::Result<()> {
        let cells: Vec<Cell> = (0..100)
            .map(|i| Cell::new(Key::insert(format!("row-{i:03}"), 1, "", 10, i + 1), "v"))
            .collect();
        let mut scanner = scanner_of(cells);

        let block = ScanBlock::fill(&mut scanner, 1, 128)?;
        assert!(!block.eos);
        assert!(block.len() < 100);
        assert!(!block.is_empty());

        // Remaining cells still come out
        let rest = ScanBlock::fill(&mut scanner, 1, usize::MAX)?;
        assert!(rest.eos);
        assert_eq!(100, block.len() + rest.len());

        Ok(())
    }

    #[test]
    fn scan_block_roundtrip() -> crate::Result<()> {
        let mut scanner = scanner_of(vec![Cell::new(Key::insert("a", 1, "q", 10, 1), "value")]);
        let block = ScanBlock::fill(&mut scanner, 3, usize::MAX)?;

        let bytes = block.encode_into_vec();
        let decoded = ScanBlock::decode_from(&mut &bytes[..])?;
        assert_eq!(block, decoded);

        Ok(())
    }
}
