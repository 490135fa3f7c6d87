// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::CompressionType;

/// Server configuration
///
/// Values default sensibly; the dotted property names accepted by
/// [`Config::set`] match the knobs a deployment passes at startup.
#[derive(Clone, Debug)]
pub struct Config {
    /// Byte size above which a range becomes eligible for split
    pub split_size: u64,

    /// Global group-commit tick in milliseconds
    pub commit_interval_ms: u32,

    /// Commit log fragment size that triggers a roll
    pub commit_log_roll_limit: u64,

    /// Codec for commit log blocks
    pub commit_log_compressor: CompressionType,

    /// Follow every commit log append with a durable flush
    pub commit_log_flush: bool,

    /// Maintenance scheduler cycle in milliseconds
    pub maintenance_interval_ms: u32,

    /// Statistics gathering cycle in milliseconds
    pub monitoring_interval_ms: u32,

    /// Memory budget of the block cache serving queries
    pub query_cache_max_memory: u64,

    /// Maximum live entries in the client location cache
    pub location_cache_max_entries: usize,

    /// Idle server-side scanners expire after this many milliseconds
    pub scanner_ttl_ms: u64,

    /// Worker threads draining the maintenance queue
    pub maintenance_threads: usize,

    /// Tracked memory above which the low-memory prioritizer takes over
    pub memory_limit: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            split_size: 256 * 1024 * 1024,
            commit_interval_ms: 50,
            commit_log_roll_limit: 100 * 1024 * 1024,
            commit_log_compressor: CompressionType::Zlib,
            commit_log_flush: true,
            maintenance_interval_ms: 30_000,
            monitoring_interval_ms: 30_000,
            query_cache_max_memory: 50 * 1024 * 1024,
            location_cache_max_entries: 1_000_000,
            scanner_ttl_ms: 120_000,
            maintenance_threads: 2,
            memory_limit: 1024 * 1024 * 1024,
        }
    }
}

impl Config {
    /// Sets the split size threshold.
    #[must_use]
    pub fn split_size(mut self, bytes: u64) -> Self {
        self.split_size = bytes;
        self
    }

    /// Sets the group-commit tick.
    #[must_use]
    pub fn commit_interval_ms(mut self, ms: u32) -> Self {
        self.commit_interval_ms = ms;
        self
    }

    /// Sets the commit log roll limit.
    #[must_use]
    pub fn commit_log_roll_limit(mut self, bytes: u64) -> Self {
        self.commit_log_roll_limit = bytes;
        self
    }

    /// Sets the commit log codec.
    #[must_use]
    pub fn commit_log_compressor(mut self, codec: CompressionType) -> Self {
        self.commit_log_compressor = codec;
        self
    }

    /// Enables or disables per-append durable flushing.
    #[must_use]
    pub fn commit_log_flush(mut self, flush: bool) -> Self {
        self.commit_log_flush = flush;
        self
    }

    /// Sets the maintenance cycle interval.
    #[must_use]
    pub fn maintenance_interval_ms(mut self, ms: u32) -> Self {
        self.maintenance_interval_ms = ms;
        self
    }

    /// Sets the number of maintenance worker threads.
    #[must_use]
    pub fn maintenance_threads(mut self, n: usize) -> Self {
        self.maintenance_threads = n.max(1);
        self
    }

    /// Sets the location cache capacity.
    #[must_use]
    pub fn location_cache_max_entries(mut self, n: usize) -> Self {
        self.location_cache_max_entries = n;
        self
    }

    /// Sets the memory-pressure threshold.
    #[must_use]
    pub fn memory_limit(mut self, bytes: u64) -> Self {
        self.memory_limit = bytes;
        self
    }

    /// Applies a dotted startup property.
    ///
    /// Recognized names:
    /// `Hypertable.RangeServer.Range.SplitSize`,
    /// `Hypertable.RangeServer.CommitInterval`,
    /// `Hypertable.RangeServer.CommitLog.RollLimit`,
    /// `Hypertable.RangeServer.CommitLog.Compressor`,
    /// `Hypertable.RangeServer.CommitLog.Flush`,
    /// `Hypertable.RangeServer.Maintenance.Interval`,
    /// `Hypertable.Monitoring.Interval`,
    /// `Hypertable.RangeServer.QueryCache.MaxMemory`,
    /// `Hypertable.LocationCache.MaxEntries`.
    pub fn set(mut self, name: &str, value: &str) -> crate::Result<Self> {
        fn parse<T: std::str::FromStr>(name: &str, value: &str) -> crate::Result<T> {
            value.parse().map_err(|_| {
                crate::Error::BadSchema(format!("bad value {value:?} for property {name}"))
            })
        }

        match name {
            "Hypertable.RangeServer.Range.SplitSize" => {
                self.split_size = parse(name, value)?;
            }
            "Hypertable.RangeServer.CommitInterval" => {
                self.commit_interval_ms = parse(name, value)?;
            }
            "Hypertable.RangeServer.CommitLog.RollLimit" => {
                self.commit_log_roll_limit = parse(name, value)?;
            }
            "Hypertable.RangeServer.CommitLog.Compressor" => {
                self.commit_log_compressor = CompressionType::from_name(value)?;
            }
            "Hypertable.RangeServer.CommitLog.Flush" => {
                self.commit_log_flush = parse(name, value)?;
            }
            "Hypertable.RangeServer.Maintenance.Interval" => {
                self.maintenance_interval_ms = parse(name, value)?;
            }
            "Hypertable.Monitoring.Interval" => {
                self.monitoring_interval_ms = parse(name, value)?;
            }
            "Hypertable.RangeServer.QueryCache.MaxMemory" => {
                self.query_cache_max_memory = parse(name, value)?;
            }
            "Hypertable.LocationCache.MaxEntries" => {
                self.location_cache_max_entries = parse(name, value)?;
            }
            _ => {
                return Err(crate::Error::BadSchema(format!("unknown property {name:?}")));
            }
        }

        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn config_set_properties() -> crate::Result<()> {
        let config = Config::default()
            .set("Hypertable.RangeServer.Range.SplitSize", "4194304")?
            .set("Hypertable.RangeServer.CommitLog.Compressor", "none")?
            .set("Hypertable.RangeServer.CommitLog.Flush", "false")?;

        assert_eq!(4 * 1024 * 1024, config.split_size);
        assert_eq!(CompressionType::None, config.commit_log_compressor);
        assert!(!config.commit_log_flush);

        Ok(())
    }

    #[test]
    fn config_rejects_unknown_property() {
        assert!(Config::default().set("Hypertable.Nope", "1").is_err());
    }
}
