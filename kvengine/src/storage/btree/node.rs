//! B+Tree node blocks.
//!
//! Internal nodes and leaves share one block layout and differ only in their
//! entry type:
//!
//! ```text
//! +------------------+--------------------------------------------+
//! | 0                | kind (1 byte) + reserved (3)               |
//! | 4-7              | id (latch key)                             |
//! | 8-11             | n (live entries)                           |
//! | 12-15            | pool_used (bytes of key pool in use)       |
//! | 16-23            | parent offset                              |
//! | 24-31            | next sibling offset                        |
//! | 32-39            | prev sibling offset                        |
//! | 40-..            | `order` entries of `E::SIZE` bytes         |
//! | ..-end           | key pool of `pool_capacity` bytes          |
//! +------------------+--------------------------------------------+
//! ```
//!
//! Keys live packed in the pool in entry order; each entry records the
//! `(offset, size)` of its key. The sentinel maximum key occupies no pool bytes
//! and is marked by `size == SENTINEL_KEY_SIZE`.

// Pool offsets and key sizes are bounded by the pool capacity, itself a u32.
#![allow(clippy::cast_possible_truncation)]

use std::cmp::Ordering;

use crate::storage::block::{Block, BlockKind, NULL_OFFSET, NodeId, Offset};

/// Longest key the tree accepts.
pub const MAX_KEY_SIZE: usize = 256;

/// Size of the shared node header.
pub const NODE_HEADER_SIZE: usize = 40;

/// Key size marking the sentinel maximum key.
pub const SENTINEL_KEY_SIZE: u32 = u32::MAX;

/// Default maximum entries per node.
pub const DEFAULT_ORDER: usize = 7;

/// Default key pool bytes per node.
pub const DEFAULT_POOL_CAPACITY: usize = 8 * MAX_KEY_SIZE;

/// Node header field offsets.
mod offsets {
    pub const KIND: usize = 0;
    pub const ID: usize = crate::storage::block::NODE_ID_OFFSET;
    pub const N: usize = 8;
    pub const POOL_USED: usize = 12;
    pub const PARENT: usize = 16;
    pub const NEXT: usize = 24;
    pub const PREV: usize = 32;
}

/// Geometry shared by every node of a tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeLayout {
    /// Maximum entries per node.
    pub order: usize,
    /// Key pool bytes per node.
    pub pool_capacity: usize,
}

impl Default for NodeLayout {
    fn default() -> Self {
        Self {
            order: DEFAULT_ORDER,
            pool_capacity: DEFAULT_POOL_CAPACITY,
        }
    }
}

impl NodeLayout {
    /// Size of a node block holding entries of type `E`.
    #[must_use]
    pub const fn block_size<E: Entry>(&self) -> usize {
        NODE_HEADER_SIZE + self.order * E::SIZE + self.pool_capacity
    }
}

/// Location of a key inside a node's pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeySlot {
    pub off: u32,
    pub size: u32,
}

impl KeySlot {
    pub const SENTINEL: Self = Self {
        off: 0,
        size: SENTINEL_KEY_SIZE,
    };

    #[must_use]
    pub const fn is_sentinel(self) -> bool {
        self.size == SENTINEL_KEY_SIZE
    }

    /// Pool bytes the key occupies.
    #[must_use]
    pub const fn pool_len(self) -> usize {
        if self.is_sentinel() { 0 } else { self.size as usize }
    }
}

/// A key as stored in a node. `Max` sorts after every byte string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NodeKey<'a> {
    Bytes(&'a [u8]),
    Max,
}

impl NodeKey<'_> {
    /// Compare this stored key with a search key.
    #[must_use]
    pub fn cmp_probe(self, probe: &[u8]) -> Ordering {
        match self {
            Self::Bytes(bytes) => bytes.cmp(probe),
            Self::Max => Ordering::Greater,
        }
    }
}

/// Entry stored in a node: an index entry or a leaf record.
pub trait Entry: Copy + std::fmt::Debug {
    /// Block kind of nodes holding this entry type.
    const KIND: BlockKind;
    /// Encoded size in bytes.
    const SIZE: usize;

    fn key_slot(&self) -> KeySlot;
    fn set_key_slot(&mut self, slot: KeySlot);
    fn encode(&self, block: &mut Block, at: usize);
    fn decode(block: &Block, at: usize) -> Self;
}

/// Index entry: child `i` covers keys `<= key` and `>` the previous key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub child: Offset,
    pub key: KeySlot,
}

impl IndexEntry {
    /// An entry pointing at `child`; its key is set on insertion.
    #[must_use]
    pub const fn new(child: Offset) -> Self {
        Self {
            child,
            key: KeySlot::SENTINEL,
        }
    }
}

impl Entry for IndexEntry {
    const KIND: BlockKind = BlockKind::Internal;
    const SIZE: usize = 16;

    fn key_slot(&self) -> KeySlot {
        self.key
    }

    fn set_key_slot(&mut self, slot: KeySlot) {
        self.key = slot;
    }

    fn encode(&self, block: &mut Block, at: usize) {
        block.write_u64(at, self.child);
        block.write_u32(at + 8, self.key.off);
        block.write_u32(at + 12, self.key.size);
    }

    fn decode(block: &Block, at: usize) -> Self {
        Self {
            child: block.read_u64(at),
            key: KeySlot {
                off: block.read_u32(at + 8),
                size: block.read_u32(at + 12),
            },
        }
    }
}

/// Leaf record: the key plus where its value blob lives in the data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Record {
    pub value_off: Offset,
    pub value_size: u32,
    pub key: KeySlot,
}

impl Record {
    #[must_use]
    pub const fn new(value_off: Offset, value_size: u32) -> Self {
        Self {
            value_off,
            value_size,
            key: KeySlot::SENTINEL,
        }
    }
}

impl Entry for Record {
    const KIND: BlockKind = BlockKind::Leaf;
    const SIZE: usize = 24;

    fn key_slot(&self) -> KeySlot {
        self.key
    }

    fn set_key_slot(&mut self, slot: KeySlot) {
        self.key = slot;
    }

    fn encode(&self, block: &mut Block, at: usize) {
        block.write_u64(at, self.value_off);
        block.write_u32(at + 8, self.value_size);
        block.write_u32(at + 12, self.key.off);
        block.write_u32(at + 16, self.key.size);
        // 20-23 reserved
    }

    fn decode(block: &Block, at: usize) -> Self {
        Self {
            value_off: block.read_u64(at),
            value_size: block.read_u32(at + 8),
            key: KeySlot {
                off: block.read_u32(at + 12),
                size: block.read_u32(at + 16),
            },
        }
    }
}

/// How a full node is divided: the first `point` entries move to the new
/// left sibling, and the incoming key joins the left half if `key_left`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitPlan {
    pub point: usize,
    pub key_left: bool,
}

/// A decoded node.
///
/// # Invariants
/// - Entries are sorted strictly ascending by key
/// - Pool bytes are packed in entry order from offset 0
/// - `entries.len() <= layout.order`, `pool.len() <= layout.pool_capacity`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node<E> {
    pub id: NodeId,
    pub parent: Offset,
    pub next: Offset,
    pub prev: Offset,
    entries: Vec<E>,
    pool: Vec<u8>,
    layout: NodeLayout,
}

/// Index node: routes keys to children.
pub type InternalNode = Node<IndexEntry>;

/// Leaf node: holds records, linked to its neighbours for range scans.
pub type LeafNode = Node<Record>;

impl<E: Entry> Node<E> {
    /// Create an empty, unlinked node.
    #[must_use]
    pub fn new(id: NodeId, layout: NodeLayout) -> Self {
        Self {
            id,
            parent: NULL_OFFSET,
            next: NULL_OFFSET,
            prev: NULL_OFFSET,
            entries: Vec::with_capacity(layout.order),
            pool: Vec::new(),
            layout,
        }
    }

    #[must_use]
    pub const fn layout(&self) -> NodeLayout {
        self.layout
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn entries(&self) -> &[E] {
        &self.entries
    }

    pub fn entry_mut(&mut self, index: usize) -> Option<&mut E> {
        self.entries.get_mut(index)
    }

    #[must_use]
    pub fn pool_used(&self) -> usize {
        self.pool.len()
    }

    fn key_of(&self, entry: &E) -> NodeKey<'_> {
        let slot = entry.key_slot();
        if slot.is_sentinel() {
            NodeKey::Max
        } else {
            let start = slot.off as usize;
            NodeKey::Bytes(&self.pool[start..start + slot.size as usize])
        }
    }

    /// Key of entry `index`.
    ///
    /// # Panics
    /// Panics if `index >= len()`.
    #[must_use]
    pub fn key(&self, index: usize) -> NodeKey<'_> {
        self.key_of(&self.entries[index])
    }

    /// Real key bytes of entry `index`; the sentinel is an error here.
    pub fn key_bytes(&self, index: usize) -> Result<&[u8], NodeError> {
        match self.entries.get(index).map(|e| self.key_of(e)) {
            Some(NodeKey::Bytes(bytes)) => Ok(bytes),
            Some(NodeKey::Max) => Err(NodeError::UnexpectedSentinel(self.id)),
            None => Err(NodeError::IndexOutOfRange {
                index,
                len: self.len(),
            }),
        }
    }

    #[must_use]
    pub fn last_key(&self) -> Option<NodeKey<'_>> {
        self.entries.last().map(|e| self.key_of(e))
    }

    #[must_use]
    pub fn ends_with_sentinel(&self) -> bool {
        self.entries.last().is_some_and(|e| e.key_slot().is_sentinel())
    }

    /// Index of the first entry whose key is `>= probe`.
    #[must_use]
    pub fn lower_bound(&self, probe: &[u8]) -> usize {
        self.entries
            .partition_point(|e| self.key_of(e).cmp_probe(probe) == Ordering::Less)
    }

    /// `Ok(index)` of an exact match, or `Err(index)` where it would go.
    pub fn find(&self, probe: &[u8]) -> Result<usize, usize> {
        let pos = self.lower_bound(probe);
        match self.entries.get(pos) {
            Some(e) if self.key_of(e).cmp_probe(probe) == Ordering::Equal => Ok(pos),
            _ => Err(pos),
        }
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.layout.order
    }

    /// Whether a key of `key_len` bytes fits without splitting.
    #[must_use]
    pub fn can_insert(&self, key_len: usize) -> bool {
        !self.is_full() && self.pool.len() + key_len <= self.layout.pool_capacity
    }

    /// Pool offset where the key of entry `pos` starts.
    fn pool_offset_at(&self, pos: usize) -> usize {
        self.entries[..pos]
            .iter()
            .map(|e| e.key_slot().pool_len())
            .sum()
    }

    /// Insert `entry` at `pos` with `key` (`None` for the sentinel).
    ///
    /// The caller keeps entries sorted; `pos` normally comes from `find`.
    pub fn insert(&mut self, pos: usize, key: Option<&[u8]>, mut entry: E) -> Result<(), NodeError> {
        let key_len = key.map_or(0, <[u8]>::len);
        if key_len > MAX_KEY_SIZE {
            return Err(NodeError::KeyTooLarge(key_len));
        }
        if pos > self.entries.len() {
            return Err(NodeError::IndexOutOfRange {
                index: pos,
                len: self.entries.len(),
            });
        }
        if !self.can_insert(key_len) {
            return Err(NodeError::NodeFull(self.id));
        }

        let slot = match key {
            None => KeySlot::SENTINEL,
            Some(bytes) => {
                let off = self.pool_offset_at(pos);
                self.pool.extend_from_slice(bytes);
                self.pool[off..].rotate_right(bytes.len());
                for later in &mut self.entries[pos..] {
                    let mut shifted = later.key_slot();
                    if !shifted.is_sentinel() {
                        shifted.off += bytes.len() as u32;
                        later.set_key_slot(shifted);
                    }
                }
                KeySlot {
                    off: off as u32,
                    size: bytes.len() as u32,
                }
            }
        };

        entry.set_key_slot(slot);
        self.entries.insert(pos, entry);
        Ok(())
    }

    /// Append an entry that sorts after every existing one.
    pub fn push(&mut self, key: Option<&[u8]>, entry: E) -> Result<(), NodeError> {
        self.insert(self.entries.len(), key, entry)
    }

    /// Move the first `point` entries into the empty node `dest`, compacting
    /// this node's pool.
    pub fn move_front_to(&mut self, point: usize, dest: &mut Self) -> Result<(), NodeError> {
        let entries = std::mem::take(&mut self.entries);
        let pool = std::mem::take(&mut self.pool);

        for (i, entry) in entries.into_iter().enumerate() {
            let slot = entry.key_slot();
            let key = (!slot.is_sentinel())
                .then(|| &pool[slot.off as usize..slot.off as usize + slot.size as usize]);
            let target = if i < point { &mut *dest } else { &mut *self };
            target.push(key, entry)?;
        }
        Ok(())
    }

    /// Turn the last key into the sentinel, returning its former bytes.
    ///
    /// A new left sibling's last key moves up as the separator, and the
    /// sibling keeps ending in the sentinel.
    pub fn seal_last_key(&mut self) -> Option<Vec<u8>> {
        let last = self.entries.last_mut()?;
        let slot = last.key_slot();
        if slot.is_sentinel() {
            return None;
        }
        last.set_key_slot(KeySlot::SENTINEL);
        let start = slot.off as usize;
        Some(self.pool.split_off(start))
    }

    /// Choose how to split this full node to admit a key of `key_len` bytes
    /// sorting at `probe`.
    ///
    /// Starts from `point = n/2`, moved right by one when the key sorts after
    /// that entry. When the key bytes would overflow either half, falls back
    /// to the most byte-balanced split whose halves both fit.
    pub fn split_point(&self, probe: &[u8], key_len: usize) -> Result<SplitPlan, NodeError> {
        let n = self.entries.len();
        let pos = self.lower_bound(probe);

        let mut plan = SplitPlan {
            point: n / 2,
            key_left: true,
        };
        if plan.point < n && self.key(plan.point).cmp_probe(probe) == Ordering::Less {
            plan.point += 1;
            plan.key_left = false;
        }
        if self.split_sizes(plan, pos, key_len).is_some() {
            return Ok(plan);
        }

        (0..=n)
            .flat_map(|point| {
                [true, false].map(|key_left| SplitPlan { point, key_left })
            })
            .filter_map(|plan| {
                self.split_sizes(plan, pos, key_len).map(|(lb, rb, lc, rc)| {
                    (plan, (lb.abs_diff(rb), lc.abs_diff(rc)))
                })
            })
            .min_by_key(|&(_, score)| score)
            .map(|(plan, _)| plan)
            .ok_or(NodeError::NoSplitPoint(self.id))
    }

    /// `(left_bytes, right_bytes, left_count, right_count)` of a valid plan.
    fn split_sizes(&self, plan: SplitPlan, pos: usize, key_len: usize) -> Option<(usize, usize, usize, usize)> {
        let n = self.entries.len();
        let SplitPlan { point, key_left } = plan;
        if point > n || (key_left && pos > point) || (!key_left && pos < point) {
            return None;
        }
        // The sentinel must stay in the right half.
        if point == n && self.ends_with_sentinel() {
            return None;
        }

        let left_count = point + usize::from(key_left);
        let right_count = n - point + usize::from(!key_left);
        let split_at = self.pool_offset_at(point);
        let left_bytes = split_at + if key_left { key_len } else { 0 };
        let right_bytes = self.pool.len() - split_at + if key_left { 0 } else { key_len };

        let order = self.layout.order;
        let cap = self.layout.pool_capacity;
        (left_count > 0
            && right_count > 0
            && left_count <= order
            && right_count <= order
            && left_bytes <= cap
            && right_bytes <= cap)
            .then_some((left_bytes, right_bytes, left_count, right_count))
    }

    /// Serialize into a block of `layout.block_size::<E>()` bytes.
    #[must_use]
    pub fn encode(&self) -> Block {
        let mut block = Block::new(self.layout.block_size::<E>());
        block.write_u8(offsets::KIND, E::KIND as u8);
        block.write_u32(offsets::ID, self.id);
        block.write_u32(offsets::N, self.entries.len() as u32);
        block.write_u32(offsets::POOL_USED, self.pool.len() as u32);
        block.write_u64(offsets::PARENT, self.parent);
        block.write_u64(offsets::NEXT, self.next);
        block.write_u64(offsets::PREV, self.prev);

        for (i, entry) in self.entries.iter().enumerate() {
            entry.encode(&mut block, NODE_HEADER_SIZE + i * E::SIZE);
        }
        block.write_bytes(self.pool_start(), &self.pool);
        block
    }

    /// Deserialize and validate a block.
    pub fn decode(block: &Block, layout: NodeLayout) -> Result<Self, NodeError> {
        let expected = layout.block_size::<E>();
        if block.len() != expected {
            return Err(NodeError::InvalidSize {
                expected,
                actual: block.len(),
            });
        }
        let kind = block.read_u8(offsets::KIND);
        if kind != E::KIND as u8 {
            return Err(NodeError::WrongNodeType(kind));
        }

        let id = block.read_u32(offsets::ID);
        let n = block.read_u32(offsets::N) as usize;
        let pool_used = block.read_u32(offsets::POOL_USED) as usize;
        if n > layout.order || pool_used > layout.pool_capacity {
            return Err(NodeError::Corrupt {
                id,
                reason: format!("n {n}, pool_used {pool_used}"),
            });
        }

        let mut entries = Vec::with_capacity(layout.order);
        let mut expected_off = 0usize;
        for i in 0..n {
            let entry = E::decode(block, NODE_HEADER_SIZE + i * E::SIZE);
            let slot = entry.key_slot();
            if !slot.is_sentinel() {
                if slot.off as usize != expected_off || slot.pool_len() > MAX_KEY_SIZE {
                    return Err(NodeError::Corrupt {
                        id,
                        reason: format!("key {i} at pool offset {} size {}", slot.off, slot.size),
                    });
                }
                expected_off += slot.pool_len();
            }
            entries.push(entry);
        }
        if expected_off != pool_used {
            return Err(NodeError::Corrupt {
                id,
                reason: format!("keys use {expected_off} pool bytes, header says {pool_used}"),
            });
        }

        let pool_start = NODE_HEADER_SIZE + layout.order * E::SIZE;
        Ok(Self {
            id,
            parent: block.read_u64(offsets::PARENT),
            next: block.read_u64(offsets::NEXT),
            prev: block.read_u64(offsets::PREV),
            entries,
            pool: block.read_bytes(pool_start, pool_used).to_vec(),
            layout,
        })
    }

    const fn pool_start(&self) -> usize {
        NODE_HEADER_SIZE + self.layout.order * E::SIZE
    }
}

impl InternalNode {
    /// Child whose subtree covers `probe`.
    pub fn child_for(&self, probe: &[u8]) -> Result<Offset, NodeError> {
        self.entries
            .get(self.lower_bound(probe))
            .map(|e| e.child)
            .ok_or(NodeError::MissingSentinel(self.id))
    }
}

/// Errors decoding or mutating nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeError {
    /// Block size does not match the tree's layout.
    InvalidSize { expected: usize, actual: usize },
    /// Block kind tag is not the expected node type.
    WrongNodeType(u8),
    /// Header or key slots are inconsistent.
    Corrupt { id: NodeId, reason: String },
    /// Key longer than `MAX_KEY_SIZE`.
    KeyTooLarge(usize),
    /// Node is full.
    NodeFull(NodeId),
    /// No split leaves both halves within capacity.
    NoSplitPoint(NodeId),
    /// Index node has no entry covering the key.
    MissingSentinel(NodeId),
    /// The sentinel turned up where a real key was required.
    UnexpectedSentinel(NodeId),
    IndexOutOfRange { index: usize, len: usize },
}

impl std::fmt::Display for NodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidSize { expected, actual } => {
                write!(f, "node block is {actual} bytes, expected {expected}")
            }
            Self::WrongNodeType(kind) => write!(f, "wrong node type: 0x{kind:02x}"),
            Self::Corrupt { id, reason } => write!(f, "corrupt node {id}: {reason}"),
            Self::KeyTooLarge(size) => {
                write!(f, "key too large: {size} bytes (max {MAX_KEY_SIZE})")
            }
            Self::NodeFull(id) => write!(f, "node {id} is full"),
            Self::NoSplitPoint(id) => write!(f, "node {id} has no valid split point"),
            Self::MissingSentinel(id) => write!(f, "index node {id} does not end in the sentinel"),
            Self::UnexpectedSentinel(id) => write!(f, "unexpected sentinel key in node {id}"),
            Self::IndexOutOfRange { index, len } => {
                write!(f, "entry {index} out of range (len {len})")
            }
        }
    }
}

impl std::error::Error for NodeError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> NodeLayout {
        NodeLayout {
            order: 4,
            pool_capacity: 1024,
        }
    }

    fn leaf_with(keys: &[&[u8]]) -> LeafNode {
        let mut leaf = LeafNode::new(7, layout());
        for (i, key) in keys.iter().enumerate() {
            let pos = leaf.find(key).expect_err("keys are unique");
            leaf.insert(pos, Some(key), Record::new(1000 + i as u64, 4))
                .expect("insert");
        }
        leaf
    }

    fn keys<E: Entry>(node: &Node<E>) -> Vec<NodeKey<'_>> {
        (0..node.len()).map(|i| node.key(i)).collect()
    }

    #[test]
    fn test_insert_keeps_pool_packed_in_order() {
        let leaf = leaf_with(&[b"mango", b"apple", b"zz", b"kiwi"]);
        assert_eq!(
            keys(&leaf),
            vec![
                NodeKey::Bytes(b"apple"),
                NodeKey::Bytes(b"kiwi"),
                NodeKey::Bytes(b"mango"),
                NodeKey::Bytes(b"zz"),
            ]
        );
        assert_eq!(leaf.pool_used(), 16);
        assert_eq!(leaf.entries()[1].key, KeySlot { off: 5, size: 4 });
        // Record payloads travel with their keys.
        assert_eq!(leaf.entries()[0].value_off, 1001);
    }

    #[test]
    fn test_find_and_lower_bound() {
        let leaf = leaf_with(&[b"b", b"d", b"f"]);
        assert_eq!(leaf.find(b"d"), Ok(1));
        assert_eq!(leaf.find(b"c"), Err(1));
        assert_eq!(leaf.find(b""), Err(0));
        assert_eq!(leaf.find(b"g"), Err(3));
        assert_eq!(leaf.lower_bound(b"f"), 2);
    }

    #[test]
    fn test_sentinel_sorts_last() {
        let mut node = InternalNode::new(1, layout());
        node.push(None, IndexEntry::new(500)).expect("sentinel");
        let pos = node.lower_bound(b"m");
        node.insert(pos, Some(b"m"), IndexEntry::new(300)).expect("insert");

        assert_eq!(keys(&node), vec![NodeKey::Bytes(b"m"), NodeKey::Max]);
        assert_eq!(node.child_for(b"a").expect("child"), 300);
        assert_eq!(node.child_for(b"m").expect("child"), 300);
        assert_eq!(node.child_for(b"n").expect("child"), 500);
        assert_eq!(node.child_for(&[0xFF; MAX_KEY_SIZE]).expect("child"), 500);
        assert!(node.ends_with_sentinel());
    }

    #[test]
    fn test_encode_decode() {
        let mut leaf = leaf_with(&[b"alpha", b"beta", b""]);
        leaf.parent = 128;
        leaf.next = 4096;
        leaf.prev = 2048;

        let block = leaf.encode();
        assert_eq!(block.len(), layout().block_size::<Record>());
        assert_eq!(block.node_id(), Some(7));
        assert_eq!(LeafNode::decode(&block, layout()).expect("decode"), leaf);
    }

    #[test]
    fn test_decode_rejects_wrong_kind_and_corrupt_pool() {
        let leaf = leaf_with(&[b"alpha"]);
        let block = leaf.encode();
        assert_eq!(
            InternalNode::decode(&block, layout()),
            Err(NodeError::InvalidSize {
                expected: layout().block_size::<IndexEntry>(),
                actual: block.len()
            })
        );

        let mut bad = block;
        bad.write_u32(offsets::POOL_USED, 3);
        assert!(matches!(
            LeafNode::decode(&bad, layout()),
            Err(NodeError::Corrupt { id: 7, .. })
        ));
    }

    #[test]
    fn test_full_by_count_and_by_bytes() {
        let leaf = leaf_with(&[b"a", b"b", b"c", b"d"]);
        assert!(leaf.is_full());
        assert!(!leaf.can_insert(1));

        let big = [b'x'; MAX_KEY_SIZE];
        let mut roomy = LeafNode::new(1, layout());
        for i in 0..3u8 {
            let mut key = big;
            key[0] = i;
            roomy.push(Some(&key), Record::new(0, 0)).expect("push");
        }
        assert!(roomy.can_insert(MAX_KEY_SIZE));
        assert!(!roomy.can_insert(MAX_KEY_SIZE + 1));
        assert_eq!(
            roomy.insert(0, Some(&[0u8; MAX_KEY_SIZE + 1]), Record::new(0, 0)),
            Err(NodeError::KeyTooLarge(MAX_KEY_SIZE + 1))
        );
    }

    #[test]
    fn test_split_point_rule() {
        let leaf = leaf_with(&[b"b", b"d", b"f", b"h"]);
        // Key before the midpoint entry joins the left half.
        assert_eq!(
            leaf.split_point(b"c", 1).expect("plan"),
            SplitPlan {
                point: 2,
                key_left: true
            }
        );
        // Key after the midpoint entry shifts the point right.
        assert_eq!(
            leaf.split_point(b"g", 1).expect("plan"),
            SplitPlan {
                point: 3,
                key_left: false
            }
        );
    }

    #[test]
    fn test_split_point_falls_back_when_bytes_overflow() {
        let layout = NodeLayout {
            order: 16,
            pool_capacity: 1024,
        };
        let mut leaf = LeafNode::new(3, layout);
        for c in b'a'..=b'h' {
            leaf.push(Some(&[c]), Record::new(0, 0)).expect("push short");
        }
        for c in [b'x', b'y', b'z'] {
            leaf.push(Some(&[c; MAX_KEY_SIZE]), Record::new(0, 0))
                .expect("push long");
        }
        assert!(!leaf.can_insert(MAX_KEY_SIZE));

        // n/2 would leave every long key plus the new one on the right.
        let probe = [b'{'; MAX_KEY_SIZE];
        assert_eq!(
            leaf.split_point(&probe, MAX_KEY_SIZE).expect("plan"),
            SplitPlan {
                point: 10,
                key_left: false
            }
        );
    }

    #[test]
    fn test_move_front_and_seal() {
        let mut node = InternalNode::new(1, layout());
        for (key, child) in [(&b"c"[..], 10u64), (b"f", 20), (b"k", 30)] {
            node.push(Some(key), IndexEntry::new(child)).expect("push");
        }
        node.push(None, IndexEntry::new(40)).expect("sentinel");

        let mut left = InternalNode::new(2, layout());
        node.move_front_to(2, &mut left).expect("move");
        assert_eq!(keys(&left), vec![NodeKey::Bytes(b"c"), NodeKey::Bytes(b"f")]);
        assert_eq!(keys(&node), vec![NodeKey::Bytes(b"k"), NodeKey::Max]);
        assert_eq!(node.entries()[0].key, KeySlot { off: 0, size: 1 });

        assert_eq!(left.seal_last_key(), Some(b"f".to_vec()));
        assert_eq!(keys(&left), vec![NodeKey::Bytes(b"c"), NodeKey::Max]);
        assert_eq!(left.pool_used(), 1);
        assert_eq!(left.child_for(b"z").expect("child"), 20);
        assert_eq!(left.seal_last_key(), None);
    }

    #[test]
    fn test_key_bytes_rejects_sentinel() {
        let mut node = InternalNode::new(9, layout());
        node.push(None, IndexEntry::new(1)).expect("sentinel");
        assert_eq!(node.key_bytes(0), Err(NodeError::UnexpectedSentinel(9)));
        assert!(matches!(
            node.key_bytes(1),
            Err(NodeError::IndexOutOfRange { index: 1, len: 1 })
        ));
    }
}
