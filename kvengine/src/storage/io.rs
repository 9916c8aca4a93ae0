//! Storage abstraction over the raw bytes of the data and log files.
//!
//! The engine reads and writes whole blocks by absolute byte offset. A
//! `BlockStore` does no caching or locking of its own; the logger serializes
//! all access to it. Production uses [`FileStore`](super::file::FileStore);
//! tests swap in an in-memory store that can inject faults.

/// Errors that can occur during block storage operations.
#[derive(Debug)]
pub enum StorageError {
    /// I/O error.
    Io(std::io::Error),
    /// Fewer bytes were available than requested.
    ShortRead { offset: u64, len: usize, size: u64 },
    /// Injected fault for simulation.
    InjectedFault(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::ShortRead { offset, len, size } => write!(
                f,
                "short read of {len} bytes at offset {offset} (store size: {size})"
            ),
            Self::InjectedFault(msg) => write!(f, "injected fault: {msg}"),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Abstraction over offset-addressed block storage.
///
/// # Implementation Notes
///
/// Implementations must ensure:
/// - `read` returns exactly `len` bytes or fails; partial reads are errors
/// - `write` either stores every byte or fails
/// - `write` past the end extends the store
/// - `sync` makes all previous writes durable
pub trait BlockStore: Send {
    /// Read `len` bytes starting at `offset`.
    fn read(&mut self, offset: u64, len: usize) -> Result<Vec<u8>, StorageError>;

    /// Write `data` starting at `offset`.
    fn write(&mut self, offset: u64, data: &[u8]) -> Result<(), StorageError>;

    /// Flush all previous writes to durable storage.
    fn sync(&mut self) -> Result<(), StorageError>;

    /// Current size of the store in bytes.
    fn len(&self) -> Result<u64, StorageError>;

    /// Whether the store holds no bytes at all.
    fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len()? == 0)
    }
}
