// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    coding::{self, Decode, DecodeError, Encode, EncodeError},
    key::Key,
    Slice,
};
use std::io::{Read, Write};

/// A key plus a value; the unit of insertion, delete and scan output
#[derive(Clone, Eq)]
pub struct Cell {
    /// Fully qualified cell address
    pub key: Key,

    /// Cell value, empty for tombstones
    ///
    /// Supports up to 2^32 bytes
    pub value: Slice,
}

impl Cell {
    /// Creates a new [`Cell`].
    ///
    /// # Panics
    ///
    /// Panics if the value length exceeds 2^32 bytes.
    pub fn new<V: Into<Slice>>(key: Key, value: V) -> Self {
        let value = value.into();

        assert!(
            u32::try_from(value.len()).is_ok(),
            "values can be 2^32 bytes in length"
        );

        Self { key, value }
    }

    /// Returns `true` if the cell is a tombstone.
    #[must_use]
    pub fn is_delete(&self) -> bool {
        self.key.is_delete()
    }

    /// Serialized size of the cell (length-prefixed key + length-prefixed value).
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        // NOTE: Values are capped at 2^32 bytes
        #[allow(clippy::cast_possible_truncation)]
        let value_prefix = coding::varint_len(self.value.len() as u32);
        2 + self.key.encoded_len() + value_prefix + self.value.len()
    }
}

impl PartialEq for Cell {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl PartialOrd for Cell {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.key.cmp(&other.key))
    }
}

impl Ord for Cell {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key.cmp(&other.key)
    }
}

impl std::fmt::Debug for Cell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?} => {:?}",
            self.key,
            if self.value.len() >= 64 {
                format!("[ ... {} bytes ]", self.value.len())
            } else {
                format!("{:?}", self.value)
            }
        )
    }
}

impl Encode for Cell {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        coding::encode_vstr16(writer, &self.key.encode())?;
        coding::encode_vstr32(writer, &self.value)?;
        Ok(())
    }
}

impl Decode for Cell {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let key_bytes = coding::decode_vstr16(reader)?;
        let key = Key::decode(&key_bytes).map_err(|_| DecodeError::InvalidHeader("Cell key"))?;

        let value = coding::decode_vstr32(reader)?;

        Ok(Self {
            key,
            value: value.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use test_log::test;

    #[test]
    fn cell_roundtrip() -> crate::Result<()> {
        let cell = Cell::new(Key::insert("row", 1, "q", 10, 7), "value-bytes");

        let mut serialized = Vec::new();
        cell.encode_into(&mut serialized)?;
        assert_eq!(serialized.len(), cell.encoded_len());

        let decoded = Cell::decode_from(&mut Cursor::new(serialized))?;
        assert_eq!(cell, decoded);
        assert_eq!(cell.value, decoded.value);

        Ok(())
    }

    #[test]
    fn cell_empty_value() -> crate::Result<()> {
        let cell = Cell::new(Key::delete_row("row", 10, 7), []);

        let mut serialized = Vec::new();
        cell.encode_into(&mut serialized)?;

        let decoded = Cell::decode_from(&mut Cursor::new(serialized))?;
        assert!(decoded.value.is_empty());
        assert!(decoded.is_delete());

        Ok(())
    }
}
