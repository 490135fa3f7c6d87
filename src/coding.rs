// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};
use varint_rs::{VarintReader, VarintWriter};

/// Error during serialization
#[derive(Debug)]
pub enum EncodeError {
    /// I/O error
    Io(std::io::Error),
}

impl std::fmt::Display for EncodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "EncodeError({})",
            match self {
                Self::Io(e) => e.to_string(),
            }
        )
    }
}

impl From<std::io::Error> for EncodeError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl std::error::Error for EncodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
        }
    }
}

/// Error during deserialization
#[derive(Debug)]
pub enum DecodeError {
    /// I/O error
    Io(std::io::Error),

    /// Invalid enum tag (type name, tag)
    InvalidTag((&'static str, u8)),

    /// Invalid block or file header
    InvalidHeader(&'static str),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DecodeError({self:?})")
    }
}

impl From<std::io::Error> for DecodeError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl std::error::Error for DecodeError {}

/// Trait to serialize stuff
pub trait Encode {
    /// Serializes into writer.
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError>;

    /// Serializes into vector.
    #[allow(clippy::expect_used)]
    fn encode_into_vec(&self) -> Vec<u8> {
        let mut v = vec![];
        self.encode_into(&mut v).expect("cannot fail");
        v
    }
}

/// Trait to deserialize stuff
pub trait Decode {
    /// Deserializes from reader.
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError>
    where
        Self: Sized;
}

/// Writes a length-prefixed byte string (u16 length).
pub fn encode_vstr16<W: Write>(writer: &mut W, bytes: &[u8]) -> Result<(), EncodeError> {
    // NOTE: Truncation is impossible, the wire format caps these at 2^16
    #[allow(clippy::cast_possible_truncation)]
    writer.write_u16::<BigEndian>(bytes.len() as u16)?;
    writer.write_all(bytes)?;
    Ok(())
}

/// Reads a length-prefixed byte string (u16 length).
pub fn decode_vstr16<R: Read>(reader: &mut R) -> Result<Vec<u8>, DecodeError> {
    let len = reader.read_u16::<BigEndian>()?;
    let mut buf = vec![0; len.into()];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

/// Writes a length-prefixed byte string (u32 varint length).
pub fn encode_vstr32<W: Write>(writer: &mut W, bytes: &[u8]) -> Result<(), EncodeError> {
    // NOTE: Values are capped at 2^32 bytes
    #[allow(clippy::cast_possible_truncation)]
    writer.write_u32_varint(bytes.len() as u32)?;
    writer.write_all(bytes)?;
    Ok(())
}

/// Reads a length-prefixed byte string (u32 varint length).
pub fn decode_vstr32<R: Read>(reader: &mut R) -> Result<Vec<u8>, DecodeError> {
    let len = reader.read_u32_varint()?;
    let mut buf = vec![0; len as usize];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

/// Serialized size of a u32 varint.
#[must_use]
pub fn varint_len(value: u32) -> usize {
    match value {
        0..=0x7F => 1,
        0x80..=0x3FFF => 2,
        0x4000..=0x1F_FFFF => 3,
        0x20_0000..=0xFFF_FFFF => 4,
        _ => 5,
    }
}
