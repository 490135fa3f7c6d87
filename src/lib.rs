// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Data-plane core of a range-partitioned, wide-column table store.
//!
//! This crate implements the storage engine a range server runs: ranges own
//! half-open row intervals of a table, persist mutations through a durable,
//! rollable commit log, absorb them into an in-memory cell cache, and spill
//! them into immutable, block-indexed cell stores. Background maintenance
//! (compaction, split, memory purge) is chosen by a prioritizer and executed
//! by a worker queue. Scans merge the cache and the stores per access group
//! and are framed into bounded scan blocks for transport.
//!
//! The external collaborators (distributed filesystem broker, coordination
//! service, remote range servers) enter through narrow traits; a local
//! filesystem broker is provided.
//!
//! # Example usage
//!
//! ```
//! use range_store::{Config, LocalBroker, RangeServer, Schema, TableIdentifier};
//! use std::sync::Arc;
//! #
//! # let folder = tempfile::tempdir()?;
//!
//! let fs = Arc::new(LocalBroker::new(folder.path()));
//! let server = RangeServer::open(Config::default(), fs)?;
//!
//! let table = TableIdentifier::new("1", 1);
//! server.update_schema(&table, Schema::parse_simple("1", &[("default", &["x"])])?)?;
//! #
//! # Ok::<(), range_store::Error>(())
//! ```

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs, clippy::cargo)]
#![deny(clippy::unwrap_used)]
#![warn(clippy::pedantic, clippy::nursery)]
#![warn(clippy::expect_used)]
#![allow(clippy::missing_const_for_fn)]
#![warn(clippy::multiple_crate_versions)]
#![allow(clippy::option_if_let_else)]

macro_rules! fail_iter {
    ($e:expr) => {
        match $e {
            Ok(v) => v,
            Err(e) => return Some(Err(e)),
        }
    };
}

mod access_group;
mod barrier;

#[doc(hidden)]
pub mod block;

mod cell;
mod cell_cache;

#[doc(hidden)]
pub mod cell_store;

mod checksum;

#[doc(hidden)]
pub mod coding;

#[doc(hidden)]
pub mod commit_log;

mod compression;
mod config;
mod context;
mod error;
mod flyweight;

#[doc(hidden)]
pub mod fs;

mod group_commit;
mod key;
mod location_cache;

#[doc(hidden)]
pub mod maintenance;

#[doc(hidden)]
pub mod metalog;

mod range;
mod range_locator;
mod revision;

#[doc(hidden)]
pub mod scanner;

mod schema;
mod server;
mod slice;

#[doc(hidden)]
pub mod stop_signal;

mod table_info;

#[doc(hidden)]
pub use {
    cell_cache::CellCache,
    cell_store::{CellStore, CellStoreWriter},
    commit_log::{CommitLog, CommitLogReader},
    flyweight::FlyweightString,
    group_commit::GroupCommit,
    location_cache::LocationCache,
    metalog::{MetaLogReader, MetaLogWriter},
    table_info::{TableInfo, TableInfoMap},
};

pub use {
    access_group::CompactionKind,
    cell::Cell,
    coding::{DecodeError, EncodeError},
    compression::CompressionType,
    config::Config,
    context::{InMemoryMetadata, MetadataWriter, ServerContext},
    error::{Error, Result},
    fs::{Fd, Filesystem, LocalBroker, OpenFlags},
    group_commit::UPDATE_FLAG_NO_LOG_SYNC,
    key::{Key, KeyFlag, Revision, Timestamp},
    range::{Range, RangeSpec, RangeState},
    range_locator::{Hyperspace, Locator, RangeLocation, RangeLocator, RangeServerClient},
    revision::RevisionCounter,
    scanner::{CellInterval, IntervalScanner, RowInterval, ScanBlock, ScanSpec},
    schema::{AccessGroupSpec, ColumnFamily, Schema, TableIdentifier},
    server::{LocalClient, LocalLocator, RangeServer, ServerStatistics},
    slice::Slice,
};

/// End-of-table row marker; ranges whose end row equals this cover the table tail.
pub const END_OF_TABLE: &[u8] = &[0xFF, 0xFF];

/// KV-tuple in serialized key form, as yielded by scanners
pub type KvPair = (Slice, Slice);
