// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{decode_extension, MAGIC_DATA, MAGIC_LINK};
use crate::{
    block::{self, BlockHeader},
    fs::{Fd, Filesystem},
    key::Revision,
    schema::TableIdentifier,
};
use std::{io::Cursor, sync::Arc};

/// One decoded commit log block
#[derive(Debug)]
pub struct LogBlock {
    /// `COMMITDATA` or `COMMITLINK`
    pub magic: [u8; 10],

    /// Highest revision the block carries
    pub revision: Revision,

    /// Table the updates belong to; empty id for link blocks
    pub table: TableIdentifier,

    /// Decompressed payload; for link blocks, `dir\0`
    pub payload: Vec<u8>,
}

impl LogBlock {
    /// Returns `true` for a `COMMITLINK` block.
    #[must_use]
    pub fn is_link(&self) -> bool {
        self.magic == MAGIC_LINK
    }

    /// Extracts the linked directory from a link block payload.
    #[must_use]
    pub fn linked_dir(&self) -> Option<String> {
        if !self.is_link() {
            return None;
        }

        let end = self.payload.iter().position(|b| *b == 0)?;
        String::from_utf8(self.payload.get(..end)?.to_vec()).ok()
    }
}

/// Streams the blocks of a single fragment file.
///
/// A torn or corrupt tail block terminates the stream: everything after the
/// last verifiable block is treated as never written.
pub struct CommitLogBlockStream {
    fs: Arc<dyn Filesystem>,
    fragment: String,
    fd: Option<Fd>,
    length: u64,
    offset: u64,
}

impl CommitLogBlockStream {
    /// Opens a fragment file for streaming.
    pub fn open(fs: Arc<dyn Filesystem>, fragment: &str) -> crate::Result<Self> {
        let length = fs.length(fragment)?;
        let fd = fs.open(fragment)?;

        Ok(Self {
            fs,
            fragment: fragment.into(),
            fd: Some(fd),
            length,
            offset: 0,
        })
    }

    fn close(&mut self) {
        if let Some(fd) = self.fd.take() {
            if let Err(e) = self.fs.close(fd) {
                log::error!("Problem closing fragment {:?}: {e}", self.fragment);
            }
        }
    }

    fn read_block(&mut self) -> crate::Result<Option<LogBlock>> {
        let Some(fd) = self.fd else {
            return Ok(None);
        };

        if self.offset >= self.length {
            return Ok(None);
        }

        // Read a generous header slab; headers are far smaller than this
        let header_slab = self.fs.pread(fd, self.offset, 4096)?;
        let mut cursor = Cursor::new(&header_slab[..]);

        let (header, extension) = BlockHeader::decode_from(&mut cursor)?;

        if header.magic != MAGIC_DATA && header.magic != MAGIC_LINK {
            return Err(crate::Error::BadCompressionHeader("unknown block magic"));
        }

        let header_len = cursor.position();
        let payload_offset = self.offset + header_len;
        let payload_len = u64::from(header.compressed_len);

        if payload_offset + payload_len > self.length {
            // Torn write: header landed, payload did not
            return Err(crate::Error::BadCompressionHeader("truncated payload"));
        }

        let compressed = self
            .fs
            .pread(fd, payload_offset, header.compressed_len as usize)?;
        let payload = block::decode_payload(&mut Cursor::new(compressed), &header)?;

        let (revision, table) = decode_extension(&extension)?;

        self.offset = payload_offset + payload_len;

        Ok(Some(LogBlock {
            magic: header.magic,
            revision,
            table,
            payload,
        }))
    }
}

impl Iterator for CommitLogBlockStream {
    type Item = crate::Result<LogBlock>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.read_block() {
            Ok(Some(block)) => Some(Ok(block)),
            Ok(None) => {
                self.close();
                None
            }
            Err(e) => {
                // The fragment is logically truncated at the last good block
                log::warn!(
                    "Truncating fragment {:?} at offset {}: {e}",
                    self.fragment,
                    self.offset
                );
                self.close();
                None
            }
        }
    }
}

impl Drop for CommitLogBlockStream {
    fn drop(&mut self) {
        self.close();
    }
}
