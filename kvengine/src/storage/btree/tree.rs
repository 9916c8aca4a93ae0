//! The B+Tree index.
//!
//! Every mutation runs in one internal logger transaction: node images, the
//! meta page and the value blob commit together or not at all.
//!
//! # Concurrency
//!
//! - `structure` is a tree-wide reader/writer lock. Ordinary writers hold it
//!   shared for their whole transaction and write-latch a single leaf. A
//!   writer whose leaf must split drops everything and retakes it exclusively,
//!   so splits and new roots never overlap an ordinary write.
//! - Readers never touch `structure`. They snapshot an even `version`,
//!   read-latch one node at a time on the way down, and retry if the version
//!   moved by the time they have read their leaf. A structural modification
//!   keeps `version` odd from its first write until after commit.
//! - Inside a structural modification the parent is write-latched before the
//!   child's latch is released.
//!
//! Lock order: `structure` → node latches → `meta` → logger.

// Value sizes are checked against u32::MAX before they are narrowed.
#![allow(clippy::cast_possible_truncation)]

use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::storage::block::{BlockKind, NULL_OFFSET, NodeId, Offset};
use crate::storage::btree::Visitor;
use crate::storage::btree::latch::{LatchMode, LatchTable, NodeLatch, unlock};
use crate::storage::btree::meta::{META_SIZE, MetaData, MetaError};
use crate::storage::btree::node::{
    Entry, IndexEntry, InternalNode, LeafNode, MAX_KEY_SIZE, Node, NodeError, NodeKey, NodeLayout,
    Record,
};
use crate::storage::io::BlockStore;
use crate::storage::logger::{LogError, Logger, META_NODE_ID, TransactionId};

/// Shape counters reported by [`BPlusTree::verify`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeStats {
    pub height: u32,
    pub internal_nodes: u64,
    pub leaf_nodes: u64,
    pub records: u64,
}

/// A separator waiting to be inserted into `parent` after `left` split off.
struct PendingSeparator {
    parent: Offset,
    key: Vec<u8>,
    left: Offset,
    /// Whether `left` and its sibling are leaves.
    children_are_leaves: bool,
}

/// Keeps the structure version odd while alive.
struct StructureChange<'a>(&'a AtomicU64);

impl<'a> StructureChange<'a> {
    fn begin(version: &'a AtomicU64) -> Self {
        version.fetch_add(1, Ordering::SeqCst);
        Self(version)
    }
}

impl Drop for StructureChange<'_> {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

/// A disk-resident B+Tree over a [`Logger`].
pub struct BPlusTree<S: BlockStore> {
    logger: Logger<S>,
    layout: NodeLayout,
    meta: Mutex<MetaData>,
    latches: LatchTable,
    structure: RwLock<()>,
    version: AtomicU64,
}

impl<S: BlockStore> BPlusTree<S> {
    /// Open the tree stored behind `logger`, creating it if the data file
    /// holds no meta page yet.
    ///
    /// `layout` only applies to a new file; an existing meta page wins.
    pub fn open(logger: Logger<S>, layout: NodeLayout) -> Result<Self, TreeError> {
        layout.validate()?;

        let existing = if logger.data_len() >= META_SIZE as u64 {
            let block = logger.read_node(BlockKind::Meta, 0, META_SIZE)?;
            MetaData::from_block(&block)?
        } else {
            None
        };

        let Some(meta) = existing else {
            return Self::create(logger, layout);
        };
        if meta.layout != layout {
            tracing::debug!(
                stored = ?meta.layout,
                requested = ?layout,
                "using node layout from the existing meta page"
            );
        }
        Ok(Self {
            logger,
            layout: meta.layout,
            latches: LatchTable::with_len(meta.number as usize),
            meta: Mutex::new(meta),
            structure: RwLock::new(()),
            version: AtomicU64::new(0),
        })
    }

    /// Lay down a root with a single sentinel entry over one empty leaf.
    fn create(logger: Logger<S>, layout: NodeLayout) -> Result<Self, TreeError> {
        let tree = Self {
            logger,
            layout,
            meta: Mutex::new(MetaData::new(layout)),
            latches: LatchTable::default(),
            structure: RwLock::new(()),
            version: AtomicU64::new(0),
        };

        tree.run_txn(|tid| {
            let (root_id, root_off) = tree.alloc_node::<IndexEntry>()?;
            let (leaf_id, leaf_off) = tree.alloc_node::<Record>()?;

            let mut root = InternalNode::new(root_id, layout);
            root.push(None, IndexEntry::new(leaf_off))?;
            let mut leaf = LeafNode::new(leaf_id, layout);
            leaf.parent = root_off;
            tree.persist(&root, root_off, tid)?;
            tree.persist(&leaf, leaf_off, tid)?;

            let mut meta = tree.meta.lock();
            meta.height = 1;
            meta.root_offset = root_off;
            meta.leaf_offset = leaf_off;
            Ok(())
        })?;

        tracing::debug!(?layout, "created empty tree");
        Ok(tree)
    }

    /// Snapshot of the meta page.
    #[must_use]
    pub fn meta(&self) -> MetaData {
        *self.meta.lock()
    }

    #[must_use]
    pub const fn layout(&self) -> NodeLayout {
        self.layout
    }

    #[must_use]
    pub const fn logger(&self) -> &Logger<S> {
        &self.logger
    }

    // --- Reads ---

    /// Look up the value stored under `key`.
    pub fn search(&self, key: &[u8]) -> Result<Option<Vec<u8>>, TreeError> {
        check_key(key)?;
        self.optimistic(|| {
            let (latch, leaf, _) = self.descend(key, LatchMode::Shared)?;
            let value = match leaf.find(key) {
                Ok(pos) => Some(self.read_value(&leaf.entries()[pos])?),
                Err(_) => None,
            };
            unlock(latch);
            Ok(value)
        })
    }

    /// Offset of the lowest index node on the path to `key`.
    ///
    /// Walks `height - 1` index levels below `root`, read-latching one node at
    /// a time.
    pub fn search_index(&self, key: &[u8], root: Offset, height: u32) -> Result<Offset, TreeError> {
        let mut offset = root;
        for _ in 1..height {
            let (latch, node) = self.load::<IndexEntry>(offset, LatchMode::Shared)?;
            offset = node.child_for(key)?;
            unlock(latch);
        }
        Ok(offset)
    }

    /// Offset of the leaf under index node `index_offset` covering `key`.
    pub fn search_leaf(&self, index_offset: Offset, key: &[u8]) -> Result<Offset, TreeError> {
        let (latch, node) = self.load::<IndexEntry>(index_offset, LatchMode::Shared)?;
        let leaf = node.child_for(key)?;
        unlock(latch);
        Ok(leaf)
    }

    /// Visit every record with `lower <= key < upper` in ascending order.
    ///
    /// An empty `lower` starts at the first key and an empty `upper` runs to
    /// the last. The visitor is never called while a latch is held.
    pub fn search_range<V: Visitor + ?Sized>(
        &self,
        lower: &[u8],
        upper: &[u8],
        visitor: &mut V,
    ) -> Result<(), TreeError> {
        if !upper.is_empty() && lower > upper {
            return Err(TreeError::InvalidArgument(
                "range lower bound is greater than upper bound".to_string(),
            ));
        }

        let mut from = Bound::Included(lower.to_vec());
        loop {
            let version = self.stable_version();
            match self.scan_leaves(&mut from, upper, visitor, version) {
                Ok(true) => return Ok(()),
                Err(e) if self.version_is(version) => return Err(e),
                Ok(false) | Err(_) => {
                    tracing::trace!("structure changed during range scan, resuming");
                }
            }
        }
    }

    /// Scan from `from` until `upper`, the last leaf, or a version change.
    ///
    /// Returns `Ok(false)` when the scan must resume from `from`.
    fn scan_leaves<V: Visitor + ?Sized>(
        &self,
        from: &mut Bound<Vec<u8>>,
        upper: &[u8],
        visitor: &mut V,
        version: u64,
    ) -> Result<bool, TreeError> {
        let start = match &*from {
            Bound::Included(key) | Bound::Excluded(key) => key.clone(),
            Bound::Unbounded => Vec::new(),
        };
        let (mut latch, mut leaf, _) = self.descend(&start, LatchMode::Shared)?;

        loop {
            let begin = match &*from {
                Bound::Included(key) => leaf.lower_bound(key),
                Bound::Excluded(key) => leaf.find(key).map_or_else(|pos| pos, |pos| pos + 1),
                Bound::Unbounded => 0,
            };

            let mut batch = Vec::new();
            let mut done = leaf.next == NULL_OFFSET;
            for (i, record) in leaf.entries().iter().enumerate().skip(begin) {
                let key = leaf.key_bytes(i)?;
                if !upper.is_empty() && key >= upper {
                    done = true;
                    break;
                }
                batch.push((key.to_vec(), self.read_value(record)?));
            }
            let next = leaf.next;
            unlock(latch);

            if !self.version_is(version) {
                return Ok(false);
            }
            for (key, value) in batch {
                visitor.visit(&key, &value);
                *from = Bound::Excluded(key);
            }
            if done {
                return Ok(true);
            }
            (latch, leaf) = self.load::<Record>(next, LatchMode::Shared)?;
        }
    }

    // --- Writes ---

    /// Insert `key`, or point it at `value` if it already exists.
    pub fn insert_or_update(&self, key: &[u8], value: &[u8]) -> Result<(), TreeError> {
        check_key(key)?;
        let value_size = u32::try_from(value.len()).map_err(|_| {
            TreeError::InvalidArgument(format!("value too large: {} bytes", value.len()))
        })?;

        if self.write_in_place(key, value, value_size)? {
            return Ok(());
        }
        self.write_with_split(key, value, value_size)
    }

    /// Update or insert without changing the tree's shape.
    ///
    /// Returns `Ok(false)` without writing anything if the leaf is full.
    fn write_in_place(&self, key: &[u8], value: &[u8], value_size: u32) -> Result<bool, TreeError> {
        let _shared = self.structure.read();
        let (latch, mut leaf, leaf_off) = self.descend(key, LatchMode::Exclusive)?;

        let found = leaf.find(key);
        if found.is_err() && !leaf.can_insert(key.len()) {
            unlock(latch);
            return Ok(false);
        }

        let record = Record::new(self.store_value(value)?, value_size);
        self.run_txn(|tid| {
            upsert(&mut leaf, found, key, record)?;
            self.persist(&leaf, leaf_off, tid)
        })?;
        unlock(latch);
        Ok(true)
    }

    /// Insert under the exclusive structure lock, splitting as needed.
    fn write_with_split(&self, key: &[u8], value: &[u8], value_size: u32) -> Result<(), TreeError> {
        let _exclusive = self.structure.write();
        let (latch, mut leaf, leaf_off) = self.descend(key, LatchMode::Exclusive)?;
        let record = Record::new(self.store_value(value)?, value_size);

        let found = leaf.find(key);
        if found.is_ok() || leaf.can_insert(key.len()) {
            // Another writer split this leaf while we waited.
            self.run_txn(|tid| {
                upsert(&mut leaf, found, key, record)?;
                self.persist(&leaf, leaf_off, tid)
            })?;
            unlock(latch);
            return Ok(());
        }

        let change = StructureChange::begin(&self.version);
        self.run_txn(|tid| self.split_leaf(latch, leaf, leaf_off, key, record, tid))?;
        drop(change);
        Ok(())
    }

    /// Split a full leaf around the incoming record and hand the separator
    /// to the parent.
    fn split_leaf(
        &self,
        latch: NodeLatch,
        mut leaf: LeafNode,
        leaf_off: Offset,
        key: &[u8],
        record: Record,
        tid: TransactionId,
    ) -> Result<(), TreeError> {
        let plan = leaf.split_point(key, key.len())?;
        let (left_id, left_off) = self.alloc_node::<Record>()?;
        let left_latch = self.latch(left_id, LatchMode::Exclusive)?;

        let mut left = LeafNode::new(left_id, self.layout);
        leaf.move_front_to(plan.point, &mut left)?;
        let half = if plan.key_left { &mut left } else { &mut leaf };
        let found = half.find(key);
        upsert(half, found, key, record)?;

        left.parent = leaf.parent;
        left.prev = leaf.prev;
        left.next = leaf_off;
        leaf.prev = left_off;
        if left.prev != NULL_OFFSET {
            self.link_next(left.prev, left_off, tid)?;
        }

        let separator = last_key(&left)?;
        self.persist(&left, left_off, tid)?;
        self.persist(&leaf, leaf_off, tid)?;
        tracing::debug!(
            leaf = leaf.id,
            new_leaf = left.id,
            offset = left_off,
            moved = left.len(),
            "split leaf"
        );

        self.insert_key_to_index(
            PendingSeparator {
                parent: leaf.parent,
                key: separator,
                left: left_off,
                children_are_leaves: true,
            },
            vec![latch, left_latch],
            tid,
        )
    }

    /// Point the `next` link of the leaf at `offset` to `next`.
    fn link_next(&self, offset: Offset, next: Offset, tid: TransactionId) -> Result<(), TreeError> {
        let (latch, mut prev) = self.load::<Record>(offset, LatchMode::Exclusive)?;
        prev.next = next;
        self.persist(&prev, offset, tid)?;
        unlock(latch);
        Ok(())
    }

    /// Insert separators bottom-up until one fits without a split.
    ///
    /// `child_latches` are released only once the parent is write-latched.
    fn insert_key_to_index(
        &self,
        mut pending: PendingSeparator,
        mut child_latches: Vec<NodeLatch>,
        tid: TransactionId,
    ) -> Result<(), TreeError> {
        loop {
            let parent_off = pending.parent;
            let (parent_latch, mut parent) =
                self.load::<IndexEntry>(parent_off, LatchMode::Exclusive)?;
            child_latches.clear();

            let key = pending.key.as_slice();
            let entry = IndexEntry::new(pending.left);
            if parent.can_insert(key.len()) {
                parent.insert(parent.lower_bound(key), Some(key), entry)?;
                self.persist(&parent, parent_off, tid)?;
                unlock(parent_latch);
                return Ok(());
            }

            let plan = parent.split_point(key, key.len())?;
            let (left_id, left_off) = self.alloc_node::<IndexEntry>()?;
            let left_latch = self.latch(left_id, LatchMode::Exclusive)?;

            let mut left = InternalNode::new(left_id, self.layout);
            parent.move_front_to(plan.point, &mut left)?;
            let half = if plan.key_left { &mut left } else { &mut parent };
            let pos = half.lower_bound(key);
            half.insert(pos, Some(key), entry)?;

            let separator = left.seal_last_key().ok_or_else(|| {
                TreeError::Inconsistent(format!("split index node {} has no key to copy up", left.id))
            })?;
            left.prev = parent.prev;
            left.next = parent_off;
            parent.prev = left_off;
            if left.prev != NULL_OFFSET {
                self.link_index_next(left.prev, left_off, tid)?;
            }

            let grows_root = parent.parent == NULL_OFFSET;
            let grandparent = if grows_root {
                let (root_off, root_latch) =
                    self.grow_root(&separator, left_off, parent_off, tid)?;
                parent.parent = root_off;
                child_latches.push(root_latch);
                root_off
            } else {
                parent.parent
            };
            left.parent = grandparent;

            self.persist(&left, left_off, tid)?;
            self.persist(&parent, parent_off, tid)?;
            self.reset_index_children_parent(&left, left_off, pending.children_are_leaves, tid)?;
            tracing::debug!(
                node = parent.id,
                new_node = left.id,
                offset = left_off,
                moved = left.len(),
                "split index node"
            );

            if grows_root {
                return Ok(());
            }
            child_latches.push(parent_latch);
            child_latches.push(left_latch);
            pending = PendingSeparator {
                parent: grandparent,
                key: separator,
                left: left_off,
                children_are_leaves: false,
            };
        }
    }

    /// Point the `next` link of the index node at `offset` to `next`.
    fn link_index_next(&self, offset: Offset, next: Offset, tid: TransactionId) -> Result<(), TreeError> {
        let (latch, mut prev) = self.load::<IndexEntry>(offset, LatchMode::Exclusive)?;
        prev.next = next;
        self.persist(&prev, offset, tid)?;
        unlock(latch);
        Ok(())
    }

    /// Put a new root above the two halves of a split root.
    ///
    /// Returns the new root's offset and its latch.
    fn grow_root(
        &self,
        separator: &[u8],
        left: Offset,
        old_root: Offset,
        tid: TransactionId,
    ) -> Result<(Offset, NodeLatch), TreeError> {
        let (root_id, root_off) = self.alloc_node::<IndexEntry>()?;
        let latch = self.latch(root_id, LatchMode::Exclusive)?;

        let mut root = InternalNode::new(root_id, self.layout);
        root.push(Some(separator), IndexEntry::new(left))?;
        root.push(None, IndexEntry::new(old_root))?;
        self.persist(&root, root_off, tid)?;

        let height = {
            let mut meta = self.meta.lock();
            meta.root_offset = root_off;
            meta.height += 1;
            meta.height
        };
        tracing::debug!(root = root_id, offset = root_off, height, "grew new root");
        Ok((root_off, latch))
    }

    /// Point every child of `node` back at `node_off`.
    pub fn reset_index_children_parent(
        &self,
        node: &InternalNode,
        node_off: Offset,
        children_are_leaves: bool,
        tid: TransactionId,
    ) -> Result<(), TreeError> {
        for entry in node.entries() {
            if children_are_leaves {
                self.set_parent::<Record>(entry.child, node_off, tid)?;
            } else {
                self.set_parent::<IndexEntry>(entry.child, node_off, tid)?;
            }
        }
        Ok(())
    }

    fn set_parent<E: Entry>(&self, offset: Offset, parent: Offset, tid: TransactionId) -> Result<(), TreeError> {
        let (latch, mut node) = self.load::<E>(offset, LatchMode::Exclusive)?;
        if node.parent != parent {
            node.parent = parent;
            self.persist(&node, offset, tid)?;
        }
        unlock(latch);
        Ok(())
    }

    // --- Verification ---

    /// Walk the whole tree and check its structural invariants.
    ///
    /// Blocks writers for the duration of the walk.
    pub fn verify(&self) -> Result<TreeStats, TreeError> {
        let _exclusive = self.structure.write();
        let meta = self.meta();
        let mut stats = TreeStats {
            height: meta.height,
            ..TreeStats::default()
        };
        let mut leaves = Vec::new();
        self.verify_index(meta.root_offset, NULL_OFFSET, meta.height, None, None, &mut stats, &mut leaves)?;

        for (i, &(offset, prev, next)) in leaves.iter().enumerate() {
            let expected_prev = if i == 0 { NULL_OFFSET } else { leaves[i - 1].0 };
            let expected_next = leaves.get(i + 1).map_or(NULL_OFFSET, |l| l.0);
            if prev != expected_prev || next != expected_next {
                return Err(TreeError::Inconsistent(format!(
                    "leaf at {offset} links prev {prev} next {next}, expected {expected_prev} and {expected_next}"
                )));
            }
        }
        if leaves.last().map(|l| l.0) != Some(meta.leaf_offset) {
            return Err(TreeError::Inconsistent(format!(
                "leaf_offset {} is not the rightmost leaf",
                meta.leaf_offset
            )));
        }
        if stats.internal_nodes != meta.internal_node_num || stats.leaf_nodes != meta.leaf_node_num {
            return Err(TreeError::Inconsistent(format!(
                "found {} index and {} leaf nodes, meta counts {} and {}",
                stats.internal_nodes, stats.leaf_nodes, meta.internal_node_num, meta.leaf_node_num
            )));
        }
        Ok(stats)
    }

    /// Check the subtree at `offset`: keys lie in `(lower, upper]`.
    #[allow(clippy::too_many_arguments)]
    fn verify_index(
        &self,
        offset: Offset,
        parent: Offset,
        levels: u32,
        lower: Option<&[u8]>,
        upper: Option<&[u8]>,
        stats: &mut TreeStats,
        leaves: &mut Vec<(Offset, Offset, Offset)>,
    ) -> Result<(), TreeError> {
        if levels == 0 {
            let (latch, leaf) = self.load::<Record>(offset, LatchMode::Shared)?;
            unlock(latch);
            check_node(&leaf, offset, parent, lower, upper)?;
            stats.leaf_nodes += 1;
            stats.records += leaf.len() as u64;
            leaves.push((offset, leaf.prev, leaf.next));
            return Ok(());
        }

        let (latch, node) = self.load::<IndexEntry>(offset, LatchMode::Shared)?;
        unlock(latch);
        check_node(&node, offset, parent, lower, upper)?;
        if !node.ends_with_sentinel() {
            return Err(NodeError::MissingSentinel(node.id).into());
        }
        stats.internal_nodes += 1;

        let mut child_lower = lower;
        for (i, entry) in node.entries().iter().enumerate() {
            let child_upper = match node.key(i) {
                NodeKey::Bytes(key) => Some(key),
                NodeKey::Max => upper,
            };
            self.verify_index(entry.child, offset, levels - 1, child_lower, child_upper, stats, leaves)?;
            child_lower = child_upper;
        }
        Ok(())
    }

    // --- Node plumbing ---

    /// Read the node at `offset` and latch it.
    ///
    /// The image is read again once the latch is held, so the returned node
    /// reflects every write that finished before the latch was granted.
    fn load<E: Entry>(&self, offset: Offset, mode: LatchMode) -> Result<(NodeLatch, Node<E>), TreeError> {
        let size = self.layout.block_size::<E>();
        let probe = self.logger.read_node(E::KIND, offset, size)?;
        let id = probe.node_id().ok_or(NodeError::InvalidSize {
            expected: size,
            actual: probe.len(),
        })?;

        let latch = self.latch(id, mode)?;
        let block = self.logger.read_node(E::KIND, offset, size)?;
        let node = Node::decode(&block, self.layout)?;
        Ok((latch, node))
    }

    fn latch(&self, id: NodeId, mode: LatchMode) -> Result<NodeLatch, TreeError> {
        self.latches.lock(id, mode).ok_or(TreeError::UnknownNode(id))
    }

    /// Descend to the leaf covering `key` and latch it in `mode`.
    fn descend(&self, key: &[u8], mode: LatchMode) -> Result<(NodeLatch, LeafNode, Offset), TreeError> {
        let (root, height) = {
            let meta = self.meta.lock();
            (meta.root_offset, meta.height)
        };
        let index = self.search_index(key, root, height)?;
        let leaf_off = self.search_leaf(index, key)?;
        let (latch, leaf) = self.load::<Record>(leaf_off, mode)?;
        Ok((latch, leaf, leaf_off))
    }

    fn persist<E: Entry>(&self, node: &Node<E>, offset: Offset, tid: TransactionId) -> Result<(), TreeError> {
        self.logger
            .write_node(&node.encode(), E::KIND, node.id, offset, tid)?;
        Ok(())
    }

    fn persist_meta(&self, tid: TransactionId) -> Result<(), TreeError> {
        let meta = self.meta.lock();
        self.logger
            .write_node(&meta.to_block(), BlockKind::Meta, META_NODE_ID, 0, tid)?;
        Ok(())
    }

    /// Bump-allocate a node block and register its latch.
    fn alloc_node<E: Entry>(&self) -> Result<(NodeId, Offset), TreeError> {
        let size = self.layout.block_size::<E>() as u64;
        let mut meta = self.meta.lock();
        let id = meta.number;
        if id == META_NODE_ID {
            return Err(TreeError::NodeIdsExhausted);
        }
        let offset = meta.slot;
        meta.slot += size;
        meta.number += 1;
        match E::KIND {
            BlockKind::Internal => meta.internal_node_num += 1,
            BlockKind::Leaf => meta.leaf_node_num += 1,
            BlockKind::Meta => {}
        }
        drop(meta);

        self.latches.register(id);
        Ok((id, offset))
    }

    /// Bump-allocate space for a value blob and write it.
    ///
    /// The blob becomes durable with the data-file sync of the commit that
    /// publishes it. An empty value takes no space.
    fn store_value(&self, value: &[u8]) -> Result<Offset, TreeError> {
        if value.is_empty() {
            return Ok(NULL_OFFSET);
        }
        let offset = {
            let mut meta = self.meta.lock();
            let offset = meta.slot;
            meta.slot += value.len() as u64;
            offset
        };
        self.logger.write_raw(offset, value)?;
        Ok(offset)
    }

    fn read_value(&self, record: &Record) -> Result<Vec<u8>, TreeError> {
        Ok(self
            .logger
            .read_raw(record.value_off, record.value_size as usize)?)
    }

    /// Run `f` in a fresh transaction, then persist the meta page and commit.
    ///
    /// A failure inside `f` abandons the transaction, which poisons the
    /// logger: its cache may already hold part of the change.
    fn run_txn<T>(&self, f: impl FnOnce(TransactionId) -> Result<T, TreeError>) -> Result<T, TreeError> {
        let tid = self.logger.open_transaction()?;
        let value = match f(tid).and_then(|value| self.persist_meta(tid).map(|()| value)) {
            Ok(value) => value,
            Err(e) => {
                self.logger.abandon_transaction(tid);
                return Err(e);
            }
        };
        self.logger.commit_transaction(tid)?;
        Ok(value)
    }

    // --- Structure version ---

    /// Current version once no structural modification is in progress.
    fn stable_version(&self) -> u64 {
        loop {
            let version = self.version.load(Ordering::SeqCst);
            if version & 1 == 0 {
                return version;
            }
            std::thread::yield_now();
        }
    }

    fn version_is(&self, version: u64) -> bool {
        self.version.load(Ordering::SeqCst) == version
    }

    /// Run a read until it completes without a concurrent structural change.
    fn optimistic<T>(&self, mut read: impl FnMut() -> Result<T, TreeError>) -> Result<T, TreeError> {
        loop {
            let version = self.stable_version();
            let result = read();
            if self.version_is(version) {
                return result;
            }
            tracing::trace!("structure changed during read, retrying");
        }
    }
}

/// Overwrite the record at `found`, or insert it where `found` says.
fn upsert(leaf: &mut LeafNode, found: Result<usize, usize>, key: &[u8], record: Record) -> Result<(), TreeError> {
    match found {
        Ok(pos) => {
            if let Some(existing) = leaf.entry_mut(pos) {
                existing.value_off = record.value_off;
                existing.value_size = record.value_size;
            }
        }
        Err(pos) => leaf.insert(pos, Some(key), record)?,
    }
    Ok(())
}

/// Copy of the largest real key of a freshly split left half.
fn last_key<E: Entry>(node: &Node<E>) -> Result<Vec<u8>, TreeError> {
    let last = node.len().checked_sub(1).ok_or_else(|| {
        TreeError::Inconsistent(format!("split left node {} empty", node.id))
    })?;
    Ok(node.key_bytes(last)?.to_vec())
}

fn check_key(key: &[u8]) -> Result<(), TreeError> {
    if key.len() > MAX_KEY_SIZE {
        return Err(TreeError::InvalidArgument(format!(
            "key too large: {} bytes (max {MAX_KEY_SIZE})",
            key.len()
        )));
    }
    Ok(())
}

/// Parent pointer, strict key order, and `(lower, upper]` bounds of one node.
fn check_node<E: Entry>(
    node: &Node<E>,
    offset: Offset,
    parent: Offset,
    lower: Option<&[u8]>,
    upper: Option<&[u8]>,
) -> Result<(), TreeError> {
    if node.parent != parent {
        return Err(TreeError::Inconsistent(format!(
            "node {} at {offset} has parent {}, expected {parent}",
            node.id, node.parent
        )));
    }
    let mut previous = lower.map(NodeKey::Bytes);
    for i in 0..node.len() {
        let key = node.key(i);
        let in_order = previous.is_none_or(|p| p < key);
        let in_bounds = match (key, upper) {
            (NodeKey::Bytes(k), Some(u)) => k <= u,
            (NodeKey::Max, _) => i + 1 == node.len(),
            (NodeKey::Bytes(_), None) => true,
        };
        if !in_order || !in_bounds {
            return Err(TreeError::Inconsistent(format!(
                "node {} at {offset}: key {i} out of order or bounds",
                node.id
            )));
        }
        previous = Some(key);
    }
    Ok(())
}

/// Errors from tree operations.
#[derive(Debug)]
pub enum TreeError {
    Log(LogError),
    Node(NodeError),
    Meta(MetaError),
    /// The caller passed an unusable key, value or range.
    InvalidArgument(String),
    /// A node id with no registered latch.
    UnknownNode(NodeId),
    /// Every node id has been handed out.
    NodeIdsExhausted,
    /// `verify` found a broken invariant.
    Inconsistent(String),
}

impl std::fmt::Display for TreeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Log(e) => write!(f, "log error: {e}"),
            Self::Node(e) => write!(f, "node error: {e}"),
            Self::Meta(e) => write!(f, "meta page error: {e}"),
            Self::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Self::UnknownNode(id) => write!(f, "unknown node id {id}"),
            Self::NodeIdsExhausted => write!(f, "node ids exhausted"),
            Self::Inconsistent(msg) => write!(f, "tree inconsistent: {msg}"),
        }
    }
}

impl std::error::Error for TreeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Log(e) => Some(e),
            Self::Node(e) => Some(e),
            Self::Meta(e) => Some(e),
            _ => None,
        }
    }
}

impl From<LogError> for TreeError {
    fn from(e: LogError) -> Self {
        Self::Log(e)
    }
}

impl From<NodeError> for TreeError {
    fn from(e: NodeError) -> Self {
        Self::Node(e)
    }
}

impl From<MetaError> for TreeError {
    fn from(e: MetaError) -> Self {
        Self::Meta(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::logger::LoggerConfig;
    use crate::storage::simulated::SimulatedStore;

    fn small_layout() -> NodeLayout {
        NodeLayout {
            order: 3,
            pool_capacity: 1024,
        }
    }

    fn open_tree(data: &SimulatedStore, log: &SimulatedStore, layout: NodeLayout) -> BPlusTree<SimulatedStore> {
        let config = LoggerConfig {
            sync: false,
            ..LoggerConfig::default()
        };
        let logger = Logger::open(data.clone(), log.clone(), config).expect("open logger");
        BPlusTree::open(logger, layout).expect("open tree")
    }

    fn collect(tree: &BPlusTree<SimulatedStore>, lower: &[u8], upper: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut out = Vec::new();
        tree.search_range(lower, upper, &mut |k: &[u8], v: &[u8]| out.push((k.to_vec(), v.to_vec())))
            .expect("range");
        out
    }

    #[test]
    fn test_new_tree_shape() {
        let (data, log) = (SimulatedStore::new(), SimulatedStore::new());
        let tree = open_tree(&data, &log, small_layout());

        let meta = tree.meta();
        assert_eq!(meta.height, 1);
        assert_eq!(meta.number, 2);
        assert_eq!(meta.root_offset, META_SIZE as u64);
        assert_eq!(meta.internal_node_num, 1);
        assert_eq!(meta.leaf_node_num, 1);
        assert_eq!(tree.search(b"missing").expect("search"), None);

        let stats = tree.verify().expect("verify");
        assert_eq!(stats.records, 0);
        assert_eq!(stats.leaf_nodes, 1);
    }

    #[test]
    fn test_insert_update_search() {
        let (data, log) = (SimulatedStore::new(), SimulatedStore::new());
        let tree = open_tree(&data, &log, small_layout());

        tree.insert_or_update(b"k1", b"one").expect("insert");
        tree.insert_or_update(b"k2", b"").expect("insert empty value");
        tree.insert_or_update(b"k1", b"uno").expect("update");

        assert_eq!(tree.search(b"k1").expect("search"), Some(b"uno".to_vec()));
        assert_eq!(tree.search(b"k2").expect("search"), Some(Vec::new()));
        assert_eq!(tree.verify().expect("verify").records, 2);
    }

    #[test]
    fn test_splits_grow_height_and_keep_order() {
        let (data, log) = (SimulatedStore::new(), SimulatedStore::new());
        let tree = open_tree(&data, &log, small_layout());

        for i in 0..60u32 {
            let key = format!("key{i:04}");
            tree.insert_or_update(key.as_bytes(), &i.to_le_bytes()).expect("insert");
        }

        let stats = tree.verify().expect("verify");
        assert!(stats.height > 2, "height {}", stats.height);
        assert_eq!(stats.records, 60);
        for i in 0..60u32 {
            let key = format!("key{i:04}");
            assert_eq!(
                tree.search(key.as_bytes()).expect("search"),
                Some(i.to_le_bytes().to_vec()),
                "{key}"
            );
        }

        let all = collect(&tree, b"", b"");
        assert_eq!(all.len(), 60);
        assert!(all.windows(2).all(|w| w[0].0 < w[1].0));
    }

    #[test]
    fn test_descending_inserts() {
        let (data, log) = (SimulatedStore::new(), SimulatedStore::new());
        let tree = open_tree(&data, &log, small_layout());

        for i in (0..40u32).rev() {
            tree.insert_or_update(format!("{i:03}").as_bytes(), b"v").expect("insert");
        }
        assert_eq!(tree.verify().expect("verify").records, 40);
        assert_eq!(collect(&tree, b"010", b"013").len(), 3);
    }

    #[test]
    fn test_long_keys_split_by_bytes() {
        let (data, log) = (SimulatedStore::new(), SimulatedStore::new());
        let layout = NodeLayout {
            order: 16,
            pool_capacity: 1024,
        };
        let tree = open_tree(&data, &log, layout);

        for i in 0..30u8 {
            let mut key = vec![b'k'; MAX_KEY_SIZE];
            key[0] = i;
            tree.insert_or_update(&key, &[i]).expect("insert");
        }
        let stats = tree.verify().expect("verify");
        assert_eq!(stats.records, 30);
        assert!(stats.leaf_nodes >= 8);
    }

    #[test]
    fn test_range_bounds() {
        let (data, log) = (SimulatedStore::new(), SimulatedStore::new());
        let tree = open_tree(&data, &log, small_layout());
        for key in [b"a", b"b", b"c", b"d", b"e"] {
            tree.insert_or_update(key, key).expect("insert");
        }

        let keys = |pairs: Vec<(Vec<u8>, Vec<u8>)>| pairs.into_iter().map(|(k, _)| k).collect::<Vec<_>>();
        assert_eq!(keys(collect(&tree, b"b", b"d")), vec![b"b".to_vec(), b"c".to_vec()]);
        assert_eq!(keys(collect(&tree, b"", b"b")), vec![b"a".to_vec()]);
        assert_eq!(keys(collect(&tree, b"d", b"")), vec![b"d".to_vec(), b"e".to_vec()]);
        assert_eq!(keys(collect(&tree, b"bb", b"bz")), Vec::<Vec<u8>>::new());
        assert!(collect(&tree, b"c", b"c").is_empty());

        let mut calls = 0;
        let err = tree
            .search_range(b"d", b"b", &mut |_: &[u8], _: &[u8]| calls += 1)
            .expect_err("reversed range");
        assert!(matches!(err, TreeError::InvalidArgument(_)));
        assert_eq!(calls, 0);
    }

    #[test]
    fn test_rejects_oversized_key() {
        let (data, log) = (SimulatedStore::new(), SimulatedStore::new());
        let tree = open_tree(&data, &log, small_layout());
        let key = vec![0u8; MAX_KEY_SIZE + 1];
        assert!(matches!(
            tree.insert_or_update(&key, b"v"),
            Err(TreeError::InvalidArgument(_))
        ));
        assert!(matches!(tree.search(&key), Err(TreeError::InvalidArgument(_))));
        tree.insert_or_update(&key[..MAX_KEY_SIZE], b"v").expect("max key");
    }

    #[test]
    fn test_reopen_keeps_tree() {
        let (data, log) = (SimulatedStore::new(), SimulatedStore::new());
        {
            let tree = open_tree(&data, &log, small_layout());
            for i in 0..25u32 {
                tree.insert_or_update(&i.to_be_bytes(), &i.to_be_bytes()).expect("insert");
            }
        }

        // A different requested layout is ignored for an existing file.
        let tree = open_tree(&data, &log, NodeLayout::default());
        assert_eq!(tree.layout(), small_layout());
        assert_eq!(tree.verify().expect("verify").records, 25);
        assert_eq!(
            tree.search(&7u32.to_be_bytes()).expect("search"),
            Some(7u32.to_be_bytes().to_vec())
        );
        tree.insert_or_update(&99u32.to_be_bytes(), b"new").expect("insert after reopen");
        assert_eq!(tree.verify().expect("verify").records, 26);
    }

    #[test]
    fn test_failed_commit_poisons_tree() {
        let (data, log) = (SimulatedStore::new(), SimulatedStore::new());
        let tree = open_tree(&data, &log, small_layout());
        tree.insert_or_update(b"a", b"1").expect("insert");

        log.fail_writes_after(0);
        assert!(matches!(
            tree.insert_or_update(b"b", b"2"),
            Err(TreeError::Log(_))
        ));
        log.heal();
        assert!(matches!(
            tree.insert_or_update(b"c", b"3"),
            Err(TreeError::Log(LogError::Poisoned))
        ));
    }

    #[test]
    fn test_failed_update_is_never_visible() {
        let (data, log) = (SimulatedStore::new(), SimulatedStore::new());
        {
            let tree = open_tree(&data, &log, small_layout());
            tree.insert_or_update(b"a", b"1").expect("insert");

            log.fail_writes_after(0);
            assert!(tree.insert_or_update(b"a", b"2").is_err());
            assert!(matches!(
                tree.search(b"a"),
                Err(TreeError::Log(LogError::Poisoned))
            ));
            let mut visited = 0;
            assert!(matches!(
                tree.search_range(b"", b"", &mut |_: &[u8], _: &[u8]| visited += 1),
                Err(TreeError::Log(LogError::Poisoned))
            ));
            assert_eq!(visited, 0);
        }

        log.heal();
        let tree = open_tree(&data, &log, small_layout());
        assert_eq!(tree.search(b"a").expect("search"), Some(b"1".to_vec()));
    }
}
