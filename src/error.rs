// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    coding::{DecodeError, EncodeError},
    CompressionType,
};

/// Represents errors that can occur in the range store
#[derive(Debug)]
pub enum Error {
    /// I/O error
    Io(std::io::Error),

    /// Serialization failed
    Encode(EncodeError),

    /// Deserialization failed
    Decode(DecodeError),

    /// A serialized key was rejected (empty row, missing terminator, short trailer)
    BadKey(&'static str),

    /// A schema definition was rejected
    BadSchema(String),

    /// A scan specification was rejected
    BadScanSpec(String),

    /// Block payload checksum did not match (expected, got)
    BlockChecksumMismatch {
        /// Checksum stored in the block header
        expected: u32,
        /// Checksum computed over the payload
        got: u32,
    },

    /// Block compression header was malformed
    BadCompressionHeader(&'static str),

    /// Compression codec id is not supported by this build
    UnsupportedCompressionType(u16),

    /// Decompression failed
    Decompress(CompressionType),

    /// Cell store file is damaged or its trailer version is unknown
    CorruptCellStore(String),

    /// MetaLog file header was malformed
    MetaLogBadHeader,

    /// MetaLog entry checksum did not match (expected, got)
    MetaLogChecksumMismatch {
        /// Checksum stored in the entry header
        expected: u32,
        /// Checksum computed over the entry
        got: u32,
    },

    /// MetaLog entry was cut short by a crash
    MetaLogEntryTruncated,

    /// Table is not known to this server
    TableNotFound(String),

    /// No loaded range covers the requested row
    RangeNotFound(String),

    /// Request carried a stale schema generation (expected, got)
    GenerationMismatch {
        /// Generation the server holds
        expected: u32,
        /// Generation the request carried
        got: u32,
    },

    /// Scanner id is unknown or already expired
    ScannerNotFound(u32),

    /// Range is busy with conflicting maintenance
    RangeBusy,

    /// Server is shutting down
    ShuttingDown,

    /// Deadline expired
    Timeout,

    /// Peer is not reachable
    NotConnected,

    /// Request arrived out of protocol order or malformed
    Protocol(&'static str),
}

impl Error {
    /// Returns `true` if a caller holding a deadline may retry the operation.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RangeNotFound(_) | Self::RangeBusy | Self::Timeout | Self::NotConnected
        )
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RangeStoreError: {self:?}")
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<EncodeError> for Error {
    fn from(value: EncodeError) -> Self {
        Self::Encode(value)
    }
}

impl From<DecodeError> for Error {
    fn from(value: DecodeError) -> Self {
        Self::Decode(value)
    }
}

/// Range store result
pub type Result<T> = std::result::Result<T, Error>;
