// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    coding::{Encode, EncodeError},
    Slice,
};
use byteorder::{BigEndian, WriteBytesExt};
use std::{cmp::Ordering, io::Write};

/// Cell timestamp in nanoseconds since the epoch, assigned by the client or server
pub type Timestamp = i64;

/// Monotonically assigned logical timestamp ordering concurrent writes
pub type Revision = i64;

/// Length of the fixed tail of a serialized key: flag + ~timestamp + ~revision
pub const KEY_TRAILER_LEN: usize = 1 + 8 + 8;

/// Kind of mutation a key carries
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum KeyFlag {
    /// Tombstone masking every older cell of the row
    DeleteRow,

    /// Tombstone masking every older cell of one column family in the row
    DeleteColumnFamily,

    /// Tombstone masking older versions of one cell
    DeleteCell,

    /// Regular insert
    Insert,
}

impl TryFrom<u8> for KeyFlag {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Self::DeleteRow),
            0x01 => Ok(Self::DeleteColumnFamily),
            0x02 => Ok(Self::DeleteCell),
            0xFF => Ok(Self::Insert),
            _ => Err(()),
        }
    }
}

impl From<KeyFlag> for u8 {
    fn from(value: KeyFlag) -> Self {
        match value {
            KeyFlag::DeleteRow => 0x00,
            KeyFlag::DeleteColumnFamily => 0x01,
            KeyFlag::DeleteCell => 0x02,
            KeyFlag::Insert => 0xFF,
        }
    }
}

impl KeyFlag {
    /// Returns `true` for any of the delete flags.
    #[must_use]
    pub fn is_delete(self) -> bool {
        self != Self::Insert
    }
}

/// Fully qualified cell address
///
/// Rows and qualifiers may not contain NUL bytes; the serialized form is
/// `row NUL family qualifier NUL flag ~timestamp ~revision` where timestamp
/// and revision are stored as the bitwise complement of their big-endian
/// encoding, so that plain byte comparison of serialized keys orders newer
/// cells first.
#[derive(Clone, Eq, PartialEq, Hash)]
pub struct Key {
    /// Row key, non-empty
    pub row: Slice,

    /// Column family code
    pub family: u8,

    /// Column qualifier, possibly empty
    pub qualifier: Slice,

    /// Mutation kind
    pub flag: KeyFlag,

    /// Cell timestamp
    pub timestamp: Timestamp,

    /// Write revision
    pub revision: Revision,
}

impl std::fmt::Debug for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?}:{}:{:?}:{}:{}:{}",
            self.row,
            self.family,
            self.qualifier,
            self.timestamp,
            self.revision,
            match self.flag {
                KeyFlag::Insert => "I",
                KeyFlag::DeleteCell => "DC",
                KeyFlag::DeleteColumnFamily => "DF",
                KeyFlag::DeleteRow => "DR",
            },
        )
    }
}

impl Key {
    /// Creates an insert key.
    ///
    /// # Panics
    ///
    /// Panics if the row is empty.
    pub fn insert<R: Into<Slice>, Q: Into<Slice>>(
        row: R,
        family: u8,
        qualifier: Q,
        timestamp: Timestamp,
        revision: Revision,
    ) -> Self {
        Self::new(row, family, qualifier, KeyFlag::Insert, timestamp, revision)
    }

    /// Creates a key with an explicit flag.
    ///
    /// # Panics
    ///
    /// Panics if the row is empty.
    pub fn new<R: Into<Slice>, Q: Into<Slice>>(
        row: R,
        family: u8,
        qualifier: Q,
        flag: KeyFlag,
        timestamp: Timestamp,
        revision: Revision,
    ) -> Self {
        let row = row.into();
        assert!(!row.is_empty(), "row may not be empty");

        Self {
            row,
            family,
            qualifier: qualifier.into(),
            flag,
            timestamp,
            revision,
        }
    }

    /// Creates a row tombstone.
    pub fn delete_row<R: Into<Slice>>(row: R, timestamp: Timestamp, revision: Revision) -> Self {
        Self::new(row, 0, [], KeyFlag::DeleteRow, timestamp, revision)
    }

    /// Creates a column family tombstone.
    pub fn delete_column_family<R: Into<Slice>>(
        row: R,
        family: u8,
        timestamp: Timestamp,
        revision: Revision,
    ) -> Self {
        Self::new(row, family, [], KeyFlag::DeleteColumnFamily, timestamp, revision)
    }

    /// Creates a cell tombstone.
    pub fn delete_cell<R: Into<Slice>, Q: Into<Slice>>(
        row: R,
        family: u8,
        qualifier: Q,
        timestamp: Timestamp,
        revision: Revision,
    ) -> Self {
        Self::new(row, family, qualifier, KeyFlag::DeleteCell, timestamp, revision)
    }

    /// Returns `true` if the key is a tombstone.
    #[must_use]
    pub fn is_delete(&self) -> bool {
        self.flag.is_delete()
    }

    /// Length of the serialized form.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        self.row.len() + 1 + 1 + self.qualifier.len() + 1 + KEY_TRAILER_LEN
    }

    /// Serializes the key into a freshly allocated [`Slice`].
    #[must_use]
    pub fn encode(&self) -> Slice {
        self.encode_into_vec().into()
    }

    /// Deserializes a key from its full serialized form.
    ///
    /// Fails with [`crate::Error::BadKey`] on an empty row, missing
    /// terminators or a short trailer.
    pub fn decode(bytes: &[u8]) -> crate::Result<Self> {
        use crate::Error::BadKey;

        let row_end = bytes
            .iter()
            .position(|b| *b == 0)
            .ok_or(BadKey("missing row terminator"))?;

        if row_end == 0 {
            return Err(BadKey("empty row"));
        }

        let rest = bytes.get(row_end + 1..).ok_or(BadKey("truncated"))?;
        let family = *rest.first().ok_or(BadKey("missing column family"))?;

        let rest = rest.get(1..).ok_or(BadKey("truncated"))?;
        let qual_end = rest
            .iter()
            .position(|b| *b == 0)
            .ok_or(BadKey("missing qualifier terminator"))?;

        let trailer = rest.get(qual_end + 1..).ok_or(BadKey("truncated"))?;
        if trailer.len() != KEY_TRAILER_LEN {
            return Err(BadKey("bad trailer length"));
        }

        let flag =
            KeyFlag::try_from(trailer[0]).map_err(|()| BadKey("unknown flag"))?;

        let mut ts_raw = [0u8; 8];
        ts_raw.copy_from_slice(&trailer[1..9]);
        let mut rev_raw = [0u8; 8];
        rev_raw.copy_from_slice(&trailer[9..17]);

        #[allow(clippy::cast_possible_wrap)]
        Ok(Self {
            row: Slice::new(&bytes[..row_end]),
            family,
            qualifier: Slice::new(&rest[..qual_end]),
            flag,
            timestamp: (!u64::from_be_bytes(ts_raw)) as i64,
            revision: (!u64::from_be_bytes(rev_raw)) as i64,
        })
    }
}

impl Encode for Key {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_all(&self.row)?;
        writer.write_u8(0)?;
        writer.write_u8(self.family)?;
        writer.write_all(&self.qualifier)?;
        writer.write_u8(0)?;
        writer.write_u8(u8::from(self.flag))?;

        // Complemented big-endian timestamps sort newest-first bytewise
        #[allow(clippy::cast_sign_loss)]
        writer.write_u64::<BigEndian>(!(self.timestamp as u64))?;
        #[allow(clippy::cast_sign_loss)]
        writer.write_u64::<BigEndian>(!(self.revision as u64))?;

        Ok(())
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Order by row, family, qualifier, flag, then timestamp and revision
// DESCENDING. Must equal byte order of the serialized form.
impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        #[allow(clippy::cast_sign_loss)]
        let this = (
            &self.row,
            self.family,
            &self.qualifier,
            u8::from(self.flag),
            !(self.timestamp as u64),
            !(self.revision as u64),
        );
        #[allow(clippy::cast_sign_loss)]
        let that = (
            &other.row,
            other.family,
            &other.qualifier,
            u8::from(other.flag),
            !(other.timestamp as u64),
            !(other.revision as u64),
        );
        this.cmp(&that)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn key_roundtrip() -> crate::Result<()> {
        let key = Key::insert("row1", 3, "qual", 1_234_567, 42);
        let encoded = key.encode();
        let decoded = Key::decode(&encoded)?;
        assert_eq!(key, decoded);
        assert_eq!(encoded.len(), key.encoded_len());
        Ok(())
    }

    #[test]
    fn key_roundtrip_tombstones() -> crate::Result<()> {
        for key in [
            Key::delete_row("r", 10, 1),
            Key::delete_column_family("r", 2, 10, 1),
            Key::delete_cell("r", 2, "q", 10, 1),
        ] {
            assert_eq!(key, Key::decode(&key.encode())?);
        }
        Ok(())
    }

    #[test]
    fn key_decode_rejects_empty_row() {
        let key = Key::insert("x", 1, "", 1, 1);
        let mut encoded = key.encode().to_vec();
        encoded.remove(0);
        assert!(matches!(
            Key::decode(&encoded),
            Err(crate::Error::BadKey("empty row"))
        ));
    }

    #[test]
    fn key_decode_rejects_short_trailer() {
        let key = Key::insert("x", 1, "q", 1, 1);
        let mut encoded = key.encode().to_vec();
        encoded.truncate(encoded.len() - 1);
        assert!(matches!(
            Key::decode(&encoded),
            Err(crate::Error::BadKey("bad trailer length"))
        ));
    }

    #[test]
    fn key_decode_rejects_missing_terminator() {
        assert!(matches!(
            Key::decode(b"rowwithoutnul"),
            Err(crate::Error::BadKey("missing row terminator"))
        ));
    }

    #[test]
    fn key_order_matches_encoded_order() {
        let keys = [
            Key::insert("a", 1, "", 10, 1),
            Key::insert("a", 1, "", 20, 2),
            Key::insert("a", 1, "q", 5, 1),
            Key::insert("a", 2, "", 5, 1),
            Key::insert("ab", 1, "", 5, 1),
            Key::insert("b", 1, "", 5, 1),
            Key::delete_row("b", 5, 1),
            Key::delete_cell("a", 1, "q", 7, 2),
        ];

        for x in &keys {
            for y in &keys {
                assert_eq!(
                    x.cmp(y),
                    x.encode().cmp(&y.encode()),
                    "logical and serialized order disagree for {x:?} / {y:?}"
                );
            }
        }
    }

    #[test]
    fn key_newer_timestamp_sorts_first() {
        let old = Key::insert("r", 1, "q", 10, 1);
        let new = Key::insert("r", 1, "q", 20, 2);
        assert!(new < old);
    }

    #[test]
    fn key_deletes_sort_before_inserts() {
        let del = Key::delete_cell("r", 1, "q", 10, 1);
        let ins = Key::insert("r", 1, "q", 99, 2);
        assert!(del < ins);
    }
}
