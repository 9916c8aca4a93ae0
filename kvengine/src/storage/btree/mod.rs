//! Disk-resident B+Tree.
//!
//! # Structure
//!
//! - Meta page at offset 0: tree shape, node geometry, allocation cursor
//! - Internal nodes: separator keys and child offsets, always ending in the
//!   sentinel maximum key
//! - Leaf nodes: keys and value blob locations, doubly linked in key order
//!
//! Nodes and value blobs are bump-allocated and never freed. Updates point a
//! record at a freshly written blob.
//!
//! # Usage
//!
//! ```ignore
//! let logger = Logger::open(data, log, LoggerConfig::default())?;
//! let tree = BPlusTree::open(logger, NodeLayout::default())?;
//! tree.insert_or_update(b"key", b"value")?;
//! assert_eq!(tree.search(b"key")?, Some(b"value".to_vec()));
//! ```

mod latch;
mod meta;
mod node;
mod tree;

pub use latch::{LatchMode, LatchTable, NodeLatch, unlock};
pub use meta::{META_SIZE, MIN_ORDER, MetaData, MetaError};
pub use node::{
    DEFAULT_ORDER, DEFAULT_POOL_CAPACITY, IndexEntry, InternalNode, LeafNode, MAX_KEY_SIZE,
    NodeError, NodeLayout, Record,
};
pub use tree::{BPlusTree, TreeError, TreeStats};

/// Receives the records of a range scan in ascending key order.
pub trait Visitor {
    fn visit(&mut self, key: &[u8], value: &[u8]);
}

impl<F: FnMut(&[u8], &[u8])> Visitor for F {
    fn visit(&mut self, key: &[u8], value: &[u8]) {
        self(key, value);
    }
}
