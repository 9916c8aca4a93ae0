//! The metadata page at offset 0 of the data file.
//!
//! It records the tree shape (root, height, counters), the node geometry the
//! file was created with, and the bump-allocator cursor `slot`.

// Geometry fields are validated to fit in u32 before they are narrowed.
#![allow(clippy::cast_possible_truncation)]

use crate::storage::block::{Block, NodeId, Offset};
use crate::storage::btree::node::{MAX_KEY_SIZE, NodeLayout};

/// Size of the meta page; the first node is allocated right after it.
pub const META_SIZE: usize = 128;

/// Magic number identifying a kvengine data file: "KVBT"
pub const MAGIC: [u8; 4] = *b"KVBT";

/// Current format version.
pub const FORMAT_VERSION: u32 = 1;

/// Smallest order that still leaves both halves of a split non-empty.
pub const MIN_ORDER: usize = 3;

/// Meta page field offsets.
mod offsets {
    pub const MAGIC: usize = 0;
    pub const FORMAT_VERSION: usize = 4;
    pub const ORDER: usize = 8;
    pub const POOL_CAPACITY: usize = 12;
    pub const HEIGHT: usize = 16;
    pub const NUMBER: usize = 20;
    pub const SLOT: usize = 24;
    pub const ROOT_OFFSET: usize = 32;
    pub const LEAF_OFFSET: usize = 40;
    pub const INTERNAL_NODE_NUM: usize = 48;
    pub const LEAF_NODE_NUM: usize = 56;
    // 64-127: reserved
}

/// Tree-wide metadata.
///
/// # Invariants
/// - `slot` only grows; every byte below it belongs to exactly one node, value
///   blob, or the meta page
/// - `number` is the id the next allocated node receives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetaData {
    pub layout: NodeLayout,
    /// Internal levels from root to leaves, leaves excluded.
    pub height: u32,
    /// Next free byte offset.
    pub slot: Offset,
    pub root_offset: Offset,
    /// The rightmost leaf; splits add siblings to its left.
    pub leaf_offset: Offset,
    pub internal_node_num: u64,
    pub leaf_node_num: u64,
    pub number: NodeId,
}

impl MetaData {
    /// Metadata of a file that holds nothing but this page.
    #[must_use]
    pub const fn new(layout: NodeLayout) -> Self {
        Self {
            layout,
            height: 0,
            slot: META_SIZE as Offset,
            root_offset: 0,
            leaf_offset: 0,
            internal_node_num: 0,
            leaf_node_num: 0,
            number: 0,
        }
    }

    /// Serialize to a meta page.
    #[must_use]
    pub fn to_block(&self) -> Block {
        let mut block = Block::new(META_SIZE);
        block.write_bytes(offsets::MAGIC, &MAGIC);
        block.write_u32(offsets::FORMAT_VERSION, FORMAT_VERSION);
        block.write_u32(offsets::ORDER, self.layout.order as u32);
        block.write_u32(offsets::POOL_CAPACITY, self.layout.pool_capacity as u32);
        block.write_u32(offsets::HEIGHT, self.height);
        block.write_u32(offsets::NUMBER, self.number);
        block.write_u64(offsets::SLOT, self.slot);
        block.write_u64(offsets::ROOT_OFFSET, self.root_offset);
        block.write_u64(offsets::LEAF_OFFSET, self.leaf_offset);
        block.write_u64(offsets::INTERNAL_NODE_NUM, self.internal_node_num);
        block.write_u64(offsets::LEAF_NODE_NUM, self.leaf_node_num);
        block
    }

    /// Deserialize a meta page.
    ///
    /// Returns `Ok(None)` for an all-zero page, which marks a file that was
    /// never initialized.
    pub fn from_block(block: &Block) -> Result<Option<Self>, MetaError> {
        if block.len() != META_SIZE {
            return Err(MetaError::InvalidSize(block.len()));
        }
        if block.as_bytes().iter().all(|&b| b == 0) {
            return Ok(None);
        }

        let magic = block.read_bytes(offsets::MAGIC, MAGIC.len());
        if magic != MAGIC {
            let mut found = [0u8; 4];
            found.copy_from_slice(magic);
            return Err(MetaError::InvalidMagic(found));
        }

        let version = block.read_u32(offsets::FORMAT_VERSION);
        if version != FORMAT_VERSION {
            return Err(MetaError::UnsupportedVersion(version));
        }

        let layout = NodeLayout {
            order: block.read_u32(offsets::ORDER) as usize,
            pool_capacity: block.read_u32(offsets::POOL_CAPACITY) as usize,
        };
        layout.validate()?;

        let meta = Self {
            layout,
            height: block.read_u32(offsets::HEIGHT),
            number: block.read_u32(offsets::NUMBER),
            slot: block.read_u64(offsets::SLOT),
            root_offset: block.read_u64(offsets::ROOT_OFFSET),
            leaf_offset: block.read_u64(offsets::LEAF_OFFSET),
            internal_node_num: block.read_u64(offsets::INTERNAL_NODE_NUM),
            leaf_node_num: block.read_u64(offsets::LEAF_NODE_NUM),
        };
        if meta.height == 0 || meta.root_offset < META_SIZE as Offset || meta.slot < meta.root_offset {
            return Err(MetaError::InvalidShape(format!(
                "height {}, root {}, slot {}",
                meta.height, meta.root_offset, meta.slot
            )));
        }
        Ok(Some(meta))
    }
}

impl NodeLayout {
    /// Check that the geometry can hold the largest key and split cleanly.
    pub const fn validate(&self) -> Result<(), MetaError> {
        if self.order < MIN_ORDER || self.order > u32::MAX as usize {
            return Err(MetaError::InvalidOrder(self.order));
        }
        if self.pool_capacity < 4 * MAX_KEY_SIZE || self.pool_capacity > u32::MAX as usize {
            return Err(MetaError::InvalidPoolCapacity(self.pool_capacity));
        }
        Ok(())
    }
}

/// Errors reading the meta page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetaError {
    InvalidSize(usize),
    InvalidMagic([u8; 4]),
    UnsupportedVersion(u32),
    InvalidOrder(usize),
    InvalidPoolCapacity(usize),
    InvalidShape(String),
}

impl std::fmt::Display for MetaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidSize(size) => write!(f, "meta page is {size} bytes, expected {META_SIZE}"),
            Self::InvalidMagic(magic) => write!(f, "invalid magic number: {magic:?}"),
            Self::UnsupportedVersion(v) => write!(f, "unsupported format version: {v}"),
            Self::InvalidOrder(order) => {
                write!(f, "invalid node order {order} (minimum {MIN_ORDER})")
            }
            Self::InvalidPoolCapacity(cap) => write!(
                f,
                "invalid key pool capacity {cap} (minimum {})",
                4 * MAX_KEY_SIZE
            ),
            Self::InvalidShape(msg) => write!(f, "inconsistent meta page: {msg}"),
        }
    }
}

impl std::error::Error for MetaError {}
