// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{TYPE_RANGE, TYPE_SCHEMA};
use crate::{
    coding::{self, Decode, DecodeError, Encode, EncodeError},
    range::{RangeSpec, RangeState},
    schema::{Schema, TableIdentifier},
};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// Durable description of one range this server owns
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RangeEntity {
    /// Owning table
    pub table: TableIdentifier,

    /// Row interval
    pub spec: RangeSpec,

    /// Load / split progress state
    pub state: RangeState,

    /// Size threshold for split eligibility
    pub soft_limit: u64,

    /// Transfer log to replay before the range goes live
    pub transfer_log: Option<String>,
}

impl Encode for RangeEntity {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        self.table.encode_into(writer)?;
        self.spec.encode_into(writer)?;
        self.state.encode_into(writer)?;
        writer.write_u64::<BigEndian>(self.soft_limit)?;
        match &self.transfer_log {
            Some(dir) => coding::encode_vstr16(writer, dir.as_bytes())?,
            None => coding::encode_vstr16(writer, b"")?,
        }
        Ok(())
    }
}

impl Decode for RangeEntity {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let table = TableIdentifier::decode_from(reader)?;
        let spec = RangeSpec::decode_from(reader)?;
        let state = RangeState::decode_from(reader)?;
        let soft_limit = reader.read_u64::<BigEndian>()?;

        let transfer_log = {
            let dir = coding::decode_vstr16(reader)?;
            if dir.is_empty() {
                None
            } else {
                Some(
                    String::from_utf8(dir)
                        .map_err(|_| DecodeError::InvalidHeader("RangeEntity transfer log"))?,
                )
            }
        };

        Ok(Self {
            table,
            spec,
            state,
            soft_limit,
            transfer_log,
        })
    }
}

/// Any entity the metalog journals
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Entity {
    /// A range owned by this server
    Range(RangeEntity),

    /// A table schema this server serves
    Schema(Schema),
}

impl Entity {
    /// Entry type tag recorded in the journal.
    #[must_use]
    pub fn entry_type(&self) -> u32 {
        match self {
            Self::Range(_) => TYPE_RANGE,
            Self::Schema(_) => TYPE_SCHEMA,
        }
    }

    /// Decodes an entity of the given entry type.
    pub fn decode(entry_type: u32, payload: &[u8]) -> crate::Result<Self> {
        let mut cursor = payload;
        match entry_type {
            TYPE_RANGE => Ok(Self::Range(RangeEntity::decode_from(&mut cursor)?)),
            TYPE_SCHEMA => Ok(Self::Schema(Schema::decode_from(&mut cursor)?)),
            _ => Err(crate::Error::MetaLogBadHeader),
        }
    }
}

impl Encode for Entity {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        match self {
            Self::Range(entity) => entity.encode_into(writer),
            Self::Schema(schema) => schema.encode_into(writer),
        }
    }
}
