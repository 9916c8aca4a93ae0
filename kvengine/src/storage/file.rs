//! File-backed block storage.
//!
//! Every access seeks to an absolute byte offset; the OS page cache is the only
//! buffering. The data file and the log file each get their own `FileStore`.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::storage::io::{BlockStore, StorageError};

/// A file opened for offset-addressed reads and writes.
pub struct FileStore {
    file: File,
    path: PathBuf,
}

impl FileStore {
    /// Open the file at `path`, creating it empty if it does not exist.
    pub fn open_or_create(path: &Path) -> Result<Self, StorageError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BlockStore for FileStore {
    fn read(&mut self, offset: u64, len: usize) -> Result<Vec<u8>, StorageError> {
        let mut buf = vec![0u8; len];
        self.file.seek(SeekFrom::Start(offset))?;
        match self.file.read_exact(&mut buf) {
            Ok(()) => Ok(buf),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => Err(StorageError::ShortRead {
                offset,
                len,
                size: self.len()?,
            }),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    fn write(&mut self, offset: u64, data: &[u8]) -> Result<(), StorageError> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        Ok(())
    }

    fn sync(&mut self) -> Result<(), StorageError> {
        self.file.sync_all()?;
        Ok(())
    }

    fn len(&self) -> Result<u64, StorageError> {
        Ok(self.file.metadata()?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_create_write_reopen() {
        let dir = tempdir().expect("create temp dir");
        let path = dir.path().join("DATA");

        {
            let mut store = FileStore::open_or_create(&path).expect("create store");
            assert!(store.is_empty().expect("len"));
            store.write(0, b"hello").expect("write");
            store.write(16, b"world").expect("write past end");
            store.sync().expect("sync");
            assert_eq!(store.len().expect("len"), 21);
        }

        let mut store = FileStore::open_or_create(&path).expect("reopen store");
        assert_eq!(store.path(), path.as_path());
        assert_eq!(store.read(0, 5).expect("read"), b"hello");
        assert_eq!(store.read(5, 11).expect("read gap"), vec![0u8; 11]);
        assert_eq!(store.read(16, 5).expect("read"), b"world");
    }

    #[test]
    fn test_read_past_end_is_short_read() {
        let dir = tempdir().expect("create temp dir");
        let mut store = FileStore::open_or_create(&dir.path().join("DATA")).expect("create");
        store.write(0, &[7u8; 10]).expect("write");

        let err = store.read(4, 10).expect_err("read must fail");
        assert!(matches!(
            err,
            StorageError::ShortRead {
                offset: 4,
                len: 10,
                size: 10
            }
        ));
    }

    #[test]
    fn test_overwrite_in_place() {
        let dir = tempdir().expect("create temp dir");
        let mut store = FileStore::open_or_create(&dir.path().join("LOG")).expect("create");
        store.write(0, &[1u8; 8]).expect("write");
        store.write(2, &[9u8; 2]).expect("overwrite");
        assert_eq!(store.read(0, 8).expect("read"), [1, 1, 9, 9, 1, 1, 1, 1]);
        assert_eq!(store.len().expect("len"), 8);
    }
}
