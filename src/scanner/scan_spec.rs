// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    coding::{self, Decode, DecodeError, Encode, EncodeError},
    Slice,
};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// A row interval; an empty end row means "to the end of the table"
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RowInterval {
    /// First row of the interval; empty = from the start of the table
    pub start: Slice,

    /// Whether `start` itself is included
    pub start_inclusive: bool,

    /// Last row of the interval; empty = to the end of the table
    pub end: Slice,

    /// Whether `end` itself is included
    pub end_inclusive: bool,
}

impl RowInterval {
    /// The whole table.
    #[must_use]
    pub fn whole_table() -> Self {
        Self {
            start: Slice::empty(),
            start_inclusive: true,
            end: Slice::empty(),
            end_inclusive: true,
        }
    }

    /// A single row.
    pub fn single_row<R: Into<Slice>>(row: R) -> Self {
        let row = row.into();
        Self {
            start: row.clone(),
            start_inclusive: true,
            end: row,
            end_inclusive: true,
        }
    }

    /// Returns `true` if `row` lies before the interval.
    #[must_use]
    pub fn is_before(&self, row: &[u8]) -> bool {
        if self.start.is_empty() {
            return false;
        }
        if self.start_inclusive {
            row < &*self.start
        } else {
            row <= &*self.start
        }
    }

    /// Returns `true` if `row` lies past the interval.
    #[must_use]
    pub fn is_past(&self, row: &[u8]) -> bool {
        if self.end.is_empty() {
            return false;
        }
        if self.end_inclusive {
            row > &*self.end
        } else {
            row >= &*self.end
        }
    }
}

impl Encode for RowInterval {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        coding::encode_vstr16(writer, &self.start)?;
        writer.write_u8(u8::from(self.start_inclusive))?;
        coding::encode_vstr16(writer, &self.end)?;
        writer.write_u8(u8::from(self.end_inclusive))?;
        Ok(())
    }
}

impl Decode for RowInterval {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        Ok(Self {
            start: coding::decode_vstr16(reader)?.into(),
            start_inclusive: reader.read_u8()? != 0,
            end: coding::decode_vstr16(reader)?.into(),
            end_inclusive: reader.read_u8()? != 0,
        })
    }
}

/// A half-open interval over full cell addresses (row + column)
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CellInterval {
    /// First row of the interval
    pub start_row: Slice,

    /// Column (`family` or `family:qualifier`) of the first cell
    pub start_column: String,

    /// Whether the start cell itself is included
    pub start_inclusive: bool,

    /// Last row of the interval
    pub end_row: Slice,

    /// Column of the last cell
    pub end_column: String,

    /// Whether the end cell itself is included
    pub end_inclusive: bool,
}

impl Encode for CellInterval {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        coding::encode_vstr16(writer, &self.start_row)?;
        coding::encode_vstr16(writer, self.start_column.as_bytes())?;
        writer.write_u8(u8::from(self.start_inclusive))?;
        coding::encode_vstr16(writer, &self.end_row)?;
        coding::encode_vstr16(writer, self.end_column.as_bytes())?;
        writer.write_u8(u8::from(self.end_inclusive))?;
        Ok(())
    }
}

impl Decode for CellInterval {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let start_row = coding::decode_vstr16(reader)?.into();
        let start_column = String::from_utf8(coding::decode_vstr16(reader)?)
            .map_err(|_| DecodeError::InvalidHeader("CellInterval"))?;
        let start_inclusive = reader.read_u8()? != 0;
        let end_row = coding::decode_vstr16(reader)?.into();
        let end_column = String::from_utf8(coding::decode_vstr16(reader)?)
            .map_err(|_| DecodeError::InvalidHeader("CellInterval"))?;
        let end_inclusive = reader.read_u8()? != 0;

        Ok(Self {
            start_row,
            start_column,
            start_inclusive,
            end_row,
            end_column,
            end_inclusive,
        })
    }
}

/// What a scan returns: intervals, columns, version and time bounds,
/// delete visibility, regex predicates
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ScanSpec {
    /// Row interval to scan
    pub row_interval: RowInterval,

    /// Optional cell-address interval, tighter than the row interval
    pub cell_interval: Option<CellInterval>,

    /// Discrete row set; non-empty only with `scan_and_filter_rows`
    pub rows: Vec<Slice>,

    /// Columns to return (`family` or `family:qualifier`); empty = all
    pub columns: Vec<String>,

    /// Versions returned per cell; 0 = every version
    pub max_versions: u32,

    /// Rows returned before the scan ends; 0 = unlimited
    pub row_limit: u32,

    /// Timestamps returned: `[start, end)`
    pub time_interval: (i64, i64),

    /// Also return tombstones
    pub return_deletes: bool,

    /// Return empty values
    pub keys_only: bool,

    /// Rows must match this regex
    pub row_regex: Option<String>,

    /// Values must match this regex
    pub value_regex: Option<String>,

    /// Scan the whole interval and filter by the discrete `rows` set
    pub scan_and_filter_rows: bool,
}

impl Default for ScanSpec {
    fn default() -> Self {
        Self {
            row_interval: RowInterval::whole_table(),
            cell_interval: None,
            rows: vec![],
            columns: vec![],
            max_versions: 0,
            row_limit: 0,
            time_interval: (i64::MIN, i64::MAX),
            return_deletes: false,
            keys_only: false,
            row_regex: None,
            value_regex: None,
            scan_and_filter_rows: false,
        }
    }
}

impl ScanSpec {
    /// Validates regexes and interval sanity.
    pub fn validate(&self) -> crate::Result<()> {
        use crate::Error::BadScanSpec;

        if let Some(pattern) = &self.row_regex {
            regex::Regex::new(pattern)
                .map_err(|e| BadScanSpec(format!("bad row regex: {e}")))?;
        }
        if let Some(pattern) = &self.value_regex {
            regex::Regex::new(pattern)
                .map_err(|e| BadScanSpec(format!("bad value regex: {e}")))?;
        }

        if self.time_interval.0 > self.time_interval.1 {
            return Err(BadScanSpec("empty time interval".into()));
        }

        if self.scan_and_filter_rows && self.rows.is_empty() {
            return Err(BadScanSpec(
                "scan_and_filter_rows without a row set".into(),
            ));
        }

        Ok(())
    }
}

fn encode_opt_str<W: Write>(writer: &mut W, value: Option<&String>) -> Result<(), EncodeError> {
    match value {
        Some(s) => coding::encode_vstr16(writer, s.as_bytes()),
        None => coding::encode_vstr16(writer, b""),
    }
}

impl Encode for ScanSpec {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        self.row_interval.encode_into(writer)?;

        match &self.cell_interval {
            Some(interval) => {
                writer.write_u8(1)?;
                interval.encode_into(writer)?;
            }
            None => writer.write_u8(0)?,
        }

        // NOTE: Row sets and column lists are tiny
        #[allow(clippy::cast_possible_truncation)]
        writer.write_u32::<BigEndian>(self.rows.len() as u32)?;
        for row in &self.rows {
            coding::encode_vstr16(writer, row)?;
        }

        #[allow(clippy::cast_possible_truncation)]
        writer.write_u16::<BigEndian>(self.columns.len() as u16)?;
        for column in &self.columns {
            coding::encode_vstr16(writer, column.as_bytes())?;
        }

        writer.write_u32::<BigEndian>(self.max_versions)?;
        writer.write_u32::<BigEndian>(self.row_limit)?;
        writer.write_i64::<BigEndian>(self.time_interval.0)?;
        writer.write_i64::<BigEndian>(self.time_interval.1)?;
        writer.write_u8(u8::from(self.return_deletes))?;
        writer.write_u8(u8::from(self.keys_only))?;
        encode_opt_str(writer, self.row_regex.as_ref())?;
        encode_opt_str(writer, self.value_regex.as_ref())?;
        writer.write_u8(u8::from(self.scan_and_filter_rows))?;

        Ok(())
    }
}

impl Decode for ScanSpec {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let row_interval = RowInterval::decode_from(reader)?;

        let cell_interval = if reader.read_u8()? != 0 {
            Some(CellInterval::decode_from(reader)?)
        } else {
            None
        };

        let row_count = reader.read_u32::<BigEndian>()?;
        let mut rows = Vec::with_capacity(row_count as usize);
        for _ in 0..row_count {
            rows.push(coding::decode_vstr16(reader)?.into());
        }

        let column_count = reader.read_u16::<BigEndian>()?;
        let mut columns = Vec::with_capacity(column_count.into());
        for _ in 0..column_count {
            columns.push(
                String::from_utf8(coding::decode_vstr16(reader)?)
                    .map_err(|_| DecodeError::InvalidHeader("ScanSpec column"))?,
            );
        }

        let max_versions = reader.read_u32::<BigEndian>()?;
        let row_limit = reader.read_u32::<BigEndian>()?;
        let time_interval = (
            reader.read_i64::<BigEndian>()?,
            reader.read_i64::<BigEndian>()?,
        );
        let return_deletes = reader.read_u8()? != 0;
        let keys_only = reader.read_u8()? != 0;

        let row_regex = {
            let s = coding::decode_vstr16(reader)?;
            if s.is_empty() {
                None
            } else {
                Some(
                    String::from_utf8(s)
                        .map_err(|_| DecodeError::InvalidHeader("ScanSpec regex"))?,
                )
            }
        };
        let value_regex = {
            let s = coding::decode_vstr16(reader)?;
            if s.is_empty() {
                None
            } else {
                Some(
                    String::from_utf8(s)
                        .map_err(|_| DecodeError::InvalidHeader("ScanSpec regex"))?,
                )
            }
        };

        let scan_and_filter_rows = reader.read_u8()? != 0;

        Ok(Self {
            row_interval,
            cell_interval,
            rows,
            columns,
            max_versions,
            row_limit,
            time_interval,
            return_deletes,
            keys_only,
            row_regex,
            value_regex,
            scan_and_filter_rows,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn scan_spec_roundtrip() -> crate::Result<()> {
        let spec = ScanSpec {
            row_interval: RowInterval {
                start: "a".into(),
                start_inclusive: true,
                end: "m".into(),
                end_inclusive: false,
            },
            columns: vec!["x".into(), "y:qual".into()],
            max_versions: 2,
            row_limit: 10,
            time_interval: (5, 500),
            return_deletes: true,
            row_regex: Some("^a.*".into()),
            ..Default::default()
        };

        let bytes = spec.encode_into_vec();
        let decoded = ScanSpec::decode_from(&mut &bytes[..])?;
        assert_eq!(spec, decoded);

        Ok(())
    }

    #[test]
    fn row_interval_bounds() {
        let interval = RowInterval {
            start: "b".into(),
            start_inclusive: true,
            end: "m".into(),
            end_inclusive: false,
        };

        assert!(interval.is_before(b"a"));
        assert!(!interval.is_before(b"b"));
        assert!(!interval.is_past(b"l"));
        assert!(interval.is_past(b"m"));

        let whole = RowInterval::whole_table();
        assert!(!whole.is_before(b"a"));
        assert!(!whole.is_past(&[0xFF, 0xFF]));
    }

    #[test]
    fn scan_spec_rejects_bad_regex() {
        let spec = ScanSpec {
            row_regex: Some("[".into()),
            ..Default::default()
        };
        assert!(matches!(
            spec.validate(),
            Err(crate::Error::BadScanSpec(_))
        ));
    }
}
