// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Filesystem broker interface.
//!
//! The data plane talks to an append-only distributed filesystem through
//! this trait; [`LocalBroker`] implements it over the local filesystem for
//! tests and single-node deployments. Paths are broker-namespace strings,
//! rooted wherever the broker decides.

use rustc_hash::FxHashMap;
use std::{
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::Mutex,
};

/// Broker file handle
pub type Fd = i32;

/// Flags for [`Filesystem::append`]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OpenFlags {
    /// Plain append
    None,

    /// Append followed by a durable flush
    Flush,
}

/// The distributed filesystem verbs the data plane consumes
pub trait Filesystem: Send + Sync {
    /// Opens an existing file for sequential reads.
    fn open(&self, name: &str) -> crate::Result<Fd>;

    /// Creates a file for appending.
    ///
    /// `replication` and `block_size` are pass-through hints for the broker;
    /// a local broker ignores them.
    fn create(&self, name: &str, overwrite: bool, replication: i32, block_size: i64)
        -> crate::Result<Fd>;

    /// Closes a handle. Closing an unknown handle is an error.
    fn close(&self, fd: Fd) -> crate::Result<()>;

    /// Reads up to `len` bytes at the current cursor; short reads signal EOF.
    fn read(&self, fd: Fd, len: usize) -> crate::Result<Vec<u8>>;

    /// Reads up to `len` bytes at `offset` without moving the cursor.
    fn pread(&self, fd: Fd, offset: u64, len: usize) -> crate::Result<Vec<u8>>;

    /// Appends bytes to the end of the file; flushes durably when asked to.
    fn append(&self, fd: Fd, data: &[u8], flags: OpenFlags) -> crate::Result<u64>;

    /// Positions the sequential-read cursor.
    fn seek(&self, fd: Fd, offset: u64) -> crate::Result<()>;

    /// Durably flushes buffered writes.
    fn flush(&self, fd: Fd) -> crate::Result<()>;

    /// Returns the length of a file by name.
    fn length(&self, name: &str) -> crate::Result<u64>;

    /// Removes a file.
    fn remove(&self, name: &str) -> crate::Result<()>;

    /// Creates a directory and all missing parents.
    fn mkdirs(&self, name: &str) -> crate::Result<()>;

    /// Removes a directory and its contents.
    fn rmdir(&self, name: &str) -> crate::Result<()>;

    /// Lists the entry names of a directory.
    fn readdir(&self, name: &str) -> crate::Result<Vec<String>>;

    /// Returns `true` if the path exists.
    fn exists(&self, name: &str) -> crate::Result<bool>;

    /// Renames a file or directory.
    fn rename(&self, from: &str, to: &str) -> crate::Result<()>;
}

struct OpenFile {
    file: File,
    cursor: u64,
}

struct BrokerInner {
    next_fd: Fd,
    files: FxHashMap<Fd, OpenFile>,
}

/// [`Filesystem`] over the local filesystem, rooted at a base directory
pub struct LocalBroker {
    base: PathBuf,
    inner: Mutex<BrokerInner>,
}

impl LocalBroker {
    /// Creates a broker rooted at `base`.
    pub fn new<P: AsRef<Path>>(base: P) -> Self {
        Self {
            base: base.as_ref().into(),
            inner: Mutex::new(BrokerInner {
                next_fd: 1,
                files: FxHashMap::default(),
            }),
        }
    }

    fn resolve(&self, name: &str) -> PathBuf {
        self.base.join(name.trim_start_matches('/'))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BrokerInner> {
        #[allow(clippy::expect_used)]
        self.inner.lock().expect("lock is poisoned")
    }

    fn with_file<T>(
        &self,
        fd: Fd,
        f: impl FnOnce(&mut OpenFile) -> std::io::Result<T>,
    ) -> crate::Result<T> {
        let mut inner = self.lock();
        let entry = inner
            .files
            .get_mut(&fd)
            .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::NotFound))?;
        Ok(f(entry)?)
    }
}

impl Filesystem for LocalBroker {
    fn open(&self, name: &str) -> crate::Result<Fd> {
        let file = File::open(self.resolve(name))?;
        let mut inner = self.lock();
        let fd = inner.next_fd;
        inner.next_fd += 1;
        inner.files.insert(fd, OpenFile { file, cursor: 0 });
        Ok(fd)
    }

    fn create(
        &self,
        name: &str,
        overwrite: bool,
        _replication: i32,
        _block_size: i64,
    ) -> crate::Result<Fd> {
        let path = self.resolve(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(overwrite)
            .append(!overwrite)
            .open(path)?;

        let mut inner = self.lock();
        let fd = inner.next_fd;
        inner.next_fd += 1;
        inner.files.insert(fd, OpenFile { file, cursor: 0 });
        Ok(fd)
    }

    fn close(&self, fd: Fd) -> crate::Result<()> {
        let mut inner = self.lock();
        inner
            .files
            .remove(&fd)
            .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::NotFound))?;
        Ok(())
    }

    fn read(&self, fd: Fd, len: usize) -> crate::Result<Vec<u8>> {
        self.with_file(fd, |entry| {
            entry.file.seek(SeekFrom::Start(entry.cursor))?;

            let mut buf = vec![0u8; len];
            let mut filled = 0;

            while filled < len {
                let n = entry.file.read(&mut buf[filled..])?;
                if n == 0 {
                    break;
                }
                filled += n;
            }

            buf.truncate(filled);
            entry.cursor += filled as u64;
            Ok(buf)
        })
    }

    fn pread(&self, fd: Fd, offset: u64, len: usize) -> crate::Result<Vec<u8>> {
        self.with_file(fd, |entry| {
            entry.file.seek(SeekFrom::Start(offset))?;

            let mut buf = vec![0u8; len];
            let mut filled = 0;

            while filled < len {
                let n = entry.file.read(&mut buf[filled..])?;
                if n == 0 {
                    break;
                }
                filled += n;
            }

            buf.truncate(filled);

            // restore the sequential cursor
            entry.file.seek(SeekFrom::Start(entry.cursor))?;
            Ok(buf)
        })
    }

    fn append(&self, fd: Fd, data: &[u8], flags: OpenFlags) -> crate::Result<u64> {
        self.with_file(fd, |entry| {
            let offset = entry.file.seek(SeekFrom::End(0))?;
            entry.file.write_all(data)?;

            if flags == OpenFlags::Flush {
                entry.file.sync_data()?;
            }

            Ok(offset)
        })
    }

    fn seek(&self, fd: Fd, offset: u64) -> crate::Result<()> {
        self.with_file(fd, |entry| {
            entry.cursor = offset;
            Ok(())
        })
    }

    fn flush(&self, fd: Fd) -> crate::Result<()> {
        self.with_file(fd, |entry| entry.file.sync_data())
    }

    fn length(&self, name: &str) -> crate::Result<u64> {
        Ok(std::fs::metadata(self.resolve(name))?.len())
    }

    fn remove(&self, name: &str) -> crate::Result<()> {
        Ok(std::fs::remove_file(self.resolve(name))?)
    }

    fn mkdirs(&self, name: &str) -> crate::Result<()> {
        Ok(std::fs::create_dir_all(self.resolve(name))?)
    }

    fn rmdir(&self, name: &str) -> crate::Result<()> {
        Ok(std::fs::remove_dir_all(self.resolve(name))?)
    }

    fn readdir(&self, name: &str) -> crate::Result<Vec<String>> {
        let mut entries = vec![];

        for entry in std::fs::read_dir(self.resolve(name))? {
            let entry = entry?;
            entries.push(entry.file_name().to_string_lossy().into_owned());
        }

        Ok(entries)
    }

    fn exists(&self, name: &str) -> crate::Result<bool> {
        Ok(self.resolve(name).exists())
    }

    fn rename(&self, from: &str, to: &str) -> crate::Result<()> {
        Ok(std::fs::rename(self.resolve(from), self.resolve(to))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn broker_append_read_roundtrip() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let broker = LocalBroker::new(dir.path());

        broker.mkdirs("logs/user")?;
        let fd = broker.create("logs/user/0", true, 0, 0)?;
        broker.append(fd, b"hello ", OpenFlags::None)?;
        broker.append(fd, b"world", OpenFlags::Flush)?;
        broker.close(fd)?;

        assert_eq!(11, broker.length("logs/user/0")?);

        let fd = broker.open("logs/user/0")?;
        assert_eq!(b"hello", &*broker.read(fd, 5)?);
        assert_eq!(b" world", &*broker.read(fd, 100)?);
        assert!(broker.read(fd, 1)?.is_empty());

        assert_eq!(b"world", &*broker.pread(fd, 6, 5)?);
        broker.close(fd)?;

        Ok(())
    }

    #[test]
    fn broker_readdir_and_rename() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let broker = LocalBroker::new(dir.path());

        broker.mkdirs("d")?;
        for name in ["d/0", "d/1", "d/skipme"] {
            let fd = broker.create(name, true, 0, 0)?;
            broker.close(fd)?;
        }

        let mut listing = broker.readdir("d")?;
        listing.sort();
        assert_eq!(vec!["0", "1", "skipme"], listing);

        broker.rename("d/skipme", "d/2.bad")?;
        assert!(broker.exists("d/2.bad")?);
        assert!(!broker.exists("d/skipme")?);

        broker.rmdir("d")?;
        assert!(!broker.exists("d")?);

        Ok(())
    }

    #[test]
    fn broker_close_unknown_fd() {
        let dir = tempfile::tempdir().expect("should create");
        let broker = LocalBroker::new(dir.path());
        assert!(broker.close(42).is_err());
    }
}
