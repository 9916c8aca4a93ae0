//! Single-file storage engine.
//!
//! # Files
//!
//! - `DATA`: meta page at offset 0, then bump-allocated node blocks and value
//!   blobs
//! - `LOG`: the write-ahead record of the most recent transaction
//!
//! # Layers
//!
//! - [`BlockStore`]: byte-offset reads and writes ([`FileStore`] on disk)
//! - [`CacheQueue`]: node images in two LRU lists, synced and unsynced
//! - [`Logger`]: transactions committed atomically through the log
//! - [`BPlusTree`]: the index, over a logger

pub mod block;
pub mod btree;
pub mod cache_queue;
pub mod file;
pub mod io;
pub mod logger;
pub mod recovery;
#[cfg(test)]
pub mod simulated;
pub mod wal;

pub use block::{Block, BlockKind, NodeId, Offset};
pub use btree::{BPlusTree, NodeLayout, TreeError, TreeStats, Visitor};
pub use cache_queue::CacheQueue;
pub use file::FileStore;
pub use io::{BlockStore, StorageError};
pub use logger::{LogError, Logger, LoggerConfig};
pub use recovery::{RecoveryError, RecoveryOutcome};
