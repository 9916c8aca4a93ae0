//! Per-node reader/writer latches.
//!
//! Node ids are dense and never reused, so the table is an append-only slab
//! indexed by id. Latch guards own an `Arc` of their lock and release it on
//! drop, which makes "unlock exactly once on every path" structural.

use std::sync::Arc;

use lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{RawRwLock, RwLock};

use crate::storage::block::NodeId;

/// A held latch. Dropping it unlocks the node.
pub enum NodeLatch {
    Shared(ArcRwLockReadGuard<RawRwLock, ()>),
    Exclusive(ArcRwLockWriteGuard<RawRwLock, ()>),
}

impl std::fmt::Debug for NodeLatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Shared(_) => f.write_str("NodeLatch::Shared"),
            Self::Exclusive(_) => f.write_str("NodeLatch::Exclusive"),
        }
    }
}

/// How a node is latched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatchMode {
    Shared,
    Exclusive,
}

/// Append-only table of node latches.
///
/// Latches are not reentrant: a thread holding a node's latch must not
/// acquire it again.
#[derive(Debug, Default)]
pub struct LatchTable {
    latches: RwLock<Vec<Arc<RwLock<()>>>>,
}

impl LatchTable {
    /// A table with latches for ids `0..count`.
    #[must_use]
    pub fn with_len(count: usize) -> Self {
        let table = Self::default();
        table.ensure(count);
        table
    }

    /// Make sure latches exist for every id below `count`.
    pub fn ensure(&self, count: usize) {
        if self.latches.read().len() >= count {
            return;
        }
        let mut latches = self.latches.write();
        while latches.len() < count {
            latches.push(Arc::new(RwLock::new(())));
        }
    }

    /// Register the latch of a freshly allocated node.
    pub fn register(&self, id: NodeId) {
        self.ensure(id as usize + 1);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.latches.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn latch(&self, id: NodeId) -> Option<Arc<RwLock<()>>> {
        self.latches.read().get(id as usize).map(Arc::clone)
    }

    /// Block until the node is read-latched. `None` for an unknown id.
    #[must_use]
    pub fn read_lock(&self, id: NodeId) -> Option<NodeLatch> {
        self.latch(id).map(|l| NodeLatch::Shared(l.read_arc()))
    }

    /// Block until the node is write-latched. `None` for an unknown id.
    #[must_use]
    pub fn write_lock(&self, id: NodeId) -> Option<NodeLatch> {
        self.latch(id).map(|l| NodeLatch::Exclusive(l.write_arc()))
    }

    #[must_use]
    pub fn lock(&self, id: NodeId, mode: LatchMode) -> Option<NodeLatch> {
        match mode {
            LatchMode::Shared => self.read_lock(id),
            LatchMode::Exclusive => self.write_lock(id),
        }
    }

    /// Try to write-latch without blocking.
    #[cfg(test)]
    #[must_use]
    pub fn try_write_lock(&self, id: NodeId) -> Option<NodeLatch> {
        self.latch(id)?.try_write_arc().map(NodeLatch::Exclusive)
    }
}

/// Release a latch. Equivalent to dropping it.
pub fn unlock(latch: NodeLatch) {
    drop(latch);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_grows_with_registration() {
        let table = LatchTable::with_len(2);
        assert_eq!(table.len(), 2);
        table.register(5);
        assert_eq!(table.len(), 6);
        table.register(3);
        assert_eq!(table.len(), 6);
        assert!(table.read_lock(6).is_none());
    }

    #[test]
    fn test_readers_share_writers_exclude() {
        let table = LatchTable::with_len(1);
        let first = table.read_lock(0).expect("latch exists");
        let second = table.read_lock(0).expect("latch exists");
        assert!(table.try_write_lock(0).is_none());

        unlock(first);
        unlock(second);
        let writer = table.try_write_lock(0).expect("free after readers leave");
        assert!(matches!(writer, NodeLatch::Exclusive(_)));
        assert!(table.try_write_lock(0).is_none());
    }

    #[test]
    fn test_latches_are_independent_per_node() {
        let table = LatchTable::with_len(2);
        let _held = table.lock(0, LatchMode::Exclusive).expect("latch exists");
        assert!(table.try_write_lock(1).is_some());
    }

    #[test]
    fn test_latch_blocks_other_thread() {
        let table = Arc::new(LatchTable::with_len(1));
        let held = table.write_lock(0).expect("latch exists");

        let other = Arc::clone(&table);
        let handle = std::thread::spawn(move || {
            let _latch = other.read_lock(0).expect("latch exists");
        });
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!handle.is_finished());

        unlock(held);
        handle.join().expect("reader thread");
    }
}
