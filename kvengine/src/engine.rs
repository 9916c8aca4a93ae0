//! The engine facade: open a directory, then write, read and scan keys.
//!
//! A directory holds two files, `DATA` and `LOG`. Opening runs recovery on
//! them before the tree is loaded, or creates the tree if `DATA` is new.

use std::path::{Path, PathBuf};

use crate::config::EngineConfig;
use crate::storage::btree::{BPlusTree, MetaData, TreeError, TreeStats, Visitor};
use crate::storage::file::FileStore;
use crate::storage::io::{BlockStore, StorageError};
use crate::storage::logger::{LogError, Logger};
use crate::storage::recovery::RecoveryOutcome;

/// Name of the data file inside an engine directory.
pub const DATA_FILE_NAME: &str = "DATA";

/// Name of the log file inside an engine directory.
pub const LOG_FILE_NAME: &str = "LOG";

/// Result code of an engine operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetCode {
    Succ,
    NotFound,
    InvalidArgument,
    IoError,
}

impl RetCode {
    /// Code describing `result`.
    #[must_use]
    pub fn of<T>(result: &Result<T, EngineError>) -> Self {
        result.as_ref().map_or_else(EngineError::code, |_| Self::Succ)
    }
}

impl std::fmt::Display for RetCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Succ => "kSucc",
            Self::NotFound => "kNotFound",
            Self::InvalidArgument => "kInvalidArgument",
            Self::IoError => "kIOError",
        };
        f.write_str(name)
    }
}

/// An embedded key-value engine over one B+Tree.
pub struct Engine<S: BlockStore = FileStore> {
    tree: BPlusTree<S>,
    path: Option<PathBuf>,
}

impl Engine<FileStore> {
    /// Open (or create) the engine in `dir` with default settings.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, EngineError> {
        Self::open_with_config(dir, &EngineConfig::default())
    }

    /// Open (or create) the engine in `dir`.
    ///
    /// Creates the directory and its files if missing.
    pub fn open_with_config(dir: impl AsRef<Path>, config: &EngineConfig) -> Result<Self, EngineError> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir).map_err(StorageError::from)?;
        let data = FileStore::open_or_create(&dir.join(DATA_FILE_NAME))?;
        let log = FileStore::open_or_create(&dir.join(LOG_FILE_NAME))?;

        let mut engine = Self::with_stores(data, log, config)?;
        engine.path = Some(dir.to_path_buf());
        Ok(engine)
    }

    /// Directory the engine was opened in.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

impl<S: BlockStore> Engine<S> {
    /// Open an engine over explicit data and log stores.
    pub fn with_stores(data: S, log: S, config: &EngineConfig) -> Result<Self, EngineError> {
        let logger = Logger::open(data, log, config.logger_config())?;
        let recovery = logger.recovery_outcome();
        let tree = BPlusTree::open(logger, config.layout)?;

        let meta = tree.meta();
        tracing::info!(
            ?recovery,
            height = meta.height,
            internal_nodes = meta.internal_node_num,
            leaf_nodes = meta.leaf_node_num,
            "engine opened"
        );
        Ok(Self { tree, path: None })
    }

    /// Store `value` under `key`, replacing any previous value.
    pub fn write(&self, key: &[u8], value: &[u8]) -> Result<(), EngineError> {
        Ok(self.tree.insert_or_update(key, value)?)
    }

    /// Value stored under `key`.
    ///
    /// # Errors
    ///
    /// [`EngineError::NotFound`] if the key was never written.
    pub fn read(&self, key: &[u8]) -> Result<Vec<u8>, EngineError> {
        self.tree.search(key)?.ok_or(EngineError::NotFound)
    }

    /// Visit every record with `lower <= key < upper`, in key order.
    ///
    /// Empty bounds are open. A non-empty `upper` below `lower` is
    /// [`EngineError::InvalidArgument`] and visits nothing.
    pub fn range<V: Visitor + ?Sized>(&self, lower: &[u8], upper: &[u8], visitor: &mut V) -> Result<(), EngineError> {
        Ok(self.tree.search_range(lower, upper, visitor)?)
    }

    /// Snapshot of the tree's meta page.
    #[must_use]
    pub fn meta(&self) -> MetaData {
        self.tree.meta()
    }

    /// What recovery did when the engine was opened.
    #[must_use]
    pub const fn recovery_outcome(&self) -> RecoveryOutcome {
        self.tree.logger().recovery_outcome()
    }

    /// Check the tree's structural invariants.
    pub fn verify(&self) -> Result<TreeStats, EngineError> {
        Ok(self.tree.verify()?)
    }
}

/// Errors surfaced by the engine.
#[derive(Debug)]
pub enum EngineError {
    NotFound,
    InvalidArgument(String),
    Storage(StorageError),
    Log(LogError),
    Tree(TreeError),
}

impl EngineError {
    /// The result code this error maps to.
    #[must_use]
    pub const fn code(&self) -> RetCode {
        match self {
            Self::NotFound => RetCode::NotFound,
            Self::InvalidArgument(_) => RetCode::InvalidArgument,
            Self::Storage(_) | Self::Log(_) | Self::Tree(_) => RetCode::IoError,
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound => write!(f, "key not found"),
            Self::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Self::Storage(e) => write!(f, "storage error: {e}"),
            Self::Log(e) => write!(f, "log error: {e}"),
            Self::Tree(e) => write!(f, "tree error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Storage(e) => Some(e),
            Self::Log(e) => Some(e),
            Self::Tree(e) => Some(e),
            Self::NotFound | Self::InvalidArgument(_) => None,
        }
    }
}

impl From<StorageError> for EngineError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

impl From<LogError> for EngineError {
    fn from(e: LogError) -> Self {
        Self::Log(e)
    }
}

impl From<TreeError> for EngineError {
    fn from(e: TreeError) -> Self {
        match e {
            TreeError::InvalidArgument(msg) => Self::InvalidArgument(msg),
            other => Self::Tree(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn test_open_creates_files() {
        let dir = tempdir().expect("create temp dir");
        let path = dir.path().join("nested").join("db");

        let engine = Engine::open(&path).expect("open engine");
        assert!(path.join(DATA_FILE_NAME).is_file());
        assert!(path.join(LOG_FILE_NAME).is_file());
        assert_eq!(engine.path(), Some(path.as_path()));
        assert_eq!(engine.recovery_outcome(), RecoveryOutcome::EmptyLog);
        assert_eq!(engine.meta().height, 1);
    }

    #[test]
    fn test_return_codes() {
        let dir = tempdir().expect("create temp dir");
        let engine = Engine::open(dir.path()).expect("open engine");

        assert_eq!(RetCode::of(&engine.write(b"k", b"v")), RetCode::Succ);
        assert_eq!(RetCode::of(&engine.read(b"k")), RetCode::Succ);
        assert_eq!(RetCode::of(&engine.read(b"nope")), RetCode::NotFound);

        let mut visits = 0;
        let reversed = engine.range(b"z", b"a", &mut |_: &[u8], _: &[u8]| visits += 1);
        assert_eq!(RetCode::of(&reversed), RetCode::InvalidArgument);
        assert_eq!(visits, 0);

        let long_key = vec![b'k'; 1000];
        assert_eq!(
            RetCode::of(&engine.write(&long_key, b"v")),
            RetCode::InvalidArgument
        );
        assert_eq!(RetCode::IoError.to_string(), "kIOError");
    }

    #[test]
    fn test_open_rejects_foreign_file() {
        let dir = tempdir().expect("create temp dir");
        std::fs::write(dir.path().join(DATA_FILE_NAME), vec![0xAB; 512]).expect("write junk");

        let err = Engine::open(dir.path()).err().expect("foreign file rejected");
        assert_eq!(err.code(), RetCode::IoError);
        assert!(matches!(err, EngineError::Tree(TreeError::Meta(_))));
    }
}
