// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::io::{Read, Write};

/// Block compression codec
///
/// Every id the on-disk format names is recognized; only `None` and `Zlib`
/// are implemented by this build, the others fail with
/// [`crate::Error::UnsupportedCompressionType`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[allow(clippy::module_name_repetitions)]
pub enum CompressionType {
    /// No compression
    None,

    /// Zlib (deflate) compression
    Zlib,

    /// LZO compression (recognized, not implemented)
    Lzo,

    /// QuickLZ compression (recognized, not implemented)
    Quicklz,

    /// BMZ compression (recognized, not implemented)
    Bmz,

    /// Snappy compression (recognized, not implemented)
    Snappy,
}

impl CompressionType {
    /// Wire id of the codec.
    #[must_use]
    pub fn id(self) -> u16 {
        match self {
            Self::None => 0,
            Self::Zlib => 1,
            Self::Lzo => 2,
            Self::Quicklz => 3,
            Self::Bmz => 4,
            Self::Snappy => 5,
        }
    }

    /// Resolves a wire id; unknown ids fail.
    pub fn from_id(id: u16) -> crate::Result<Self> {
        match id {
            0 => Ok(Self::None),
            1 => Ok(Self::Zlib),
            2 => Ok(Self::Lzo),
            3 => Ok(Self::Quicklz),
            4 => Ok(Self::Bmz),
            5 => Ok(Self::Snappy),
            id => Err(crate::Error::UnsupportedCompressionType(id)),
        }
    }

    /// Resolves a codec by configuration name.
    pub fn from_name(name: &str) -> crate::Result<Self> {
        match name {
            "none" => Ok(Self::None),
            "zlib" => Ok(Self::Zlib),
            "lzo" => Ok(Self::Lzo),
            "quicklz" => Ok(Self::Quicklz),
            "bmz" => Ok(Self::Bmz),
            "snappy" => Ok(Self::Snappy),
            _ => Err(crate::Error::UnsupportedCompressionType(u16::MAX)),
        }
    }

    /// Compresses a buffer; fails for unimplemented codecs.
    pub fn compress(self, data: &[u8]) -> crate::Result<Vec<u8>> {
        match self {
            Self::None => Ok(data.to_vec()),
            Self::Zlib => {
                let mut encoder = flate2::write::ZlibEncoder::new(
                    Vec::with_capacity(data.len() / 2),
                    flate2::Compression::default(),
                );
                encoder.write_all(data).map_err(|_| crate::Error::Decompress(self))?;
                encoder.finish().map_err(|_| crate::Error::Decompress(self))
            }
            _ => Err(crate::Error::UnsupportedCompressionType(self.id())),
        }
    }

    /// Decompresses a buffer into `uncompressed_len` bytes.
    pub fn decompress(self, data: &[u8], uncompressed_len: usize) -> crate::Result<Vec<u8>> {
        match self {
            Self::None => Ok(data.to_vec()),
            Self::Zlib => {
                let mut out = Vec::with_capacity(uncompressed_len);
                let mut decoder = flate2::read::ZlibDecoder::new(data);
                decoder
                    .read_to_end(&mut out)
                    .map_err(|_| crate::Error::Decompress(self))?;
                Ok(out)
            }
            _ => Err(crate::Error::UnsupportedCompressionType(self.id())),
        }
    }
}

impl std::fmt::Display for CompressionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::None => "none",
                Self::Zlib => "zlib",
                Self::Lzo => "lzo",
                Self::Quicklz => "quicklz",
                Self::Bmz => "bmz",
                Self::Snappy => "snappy",
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn compression_zlib_roundtrip() -> crate::Result<()> {
        let data = b"the quick brown fox".repeat(32);
        let compressed = CompressionType::Zlib.compress(&data)?;
        assert!(compressed.len() < data.len());

        let decompressed = CompressionType::Zlib.decompress(&compressed, data.len())?;
        assert_eq!(data, decompressed);

        Ok(())
    }

    #[test]
    fn compression_unknown_id() {
        assert!(matches!(
            CompressionType::from_id(99),
            Err(crate::Error::UnsupportedCompressionType(99))
        ));
    }

    #[test]
    fn compression_unimplemented_codec() {
        assert!(matches!(
            CompressionType::Snappy.compress(b"x"),
            Err(crate::Error::UnsupportedCompressionType(5))
        ));
    }
}
