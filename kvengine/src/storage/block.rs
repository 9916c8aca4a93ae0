//! Block buffers and the encoding helpers shared by every on-disk structure.
//!
//! Everything the engine persists (the meta page, index and leaf nodes, log
//! records) is a fixed-layout, little-endian byte block. Callers size the block
//! up front and address fields by byte offset.

/// File offset of a block. Zero is the meta page, so it never names a node and
/// doubles as "no link".
pub type Offset = u64;

/// Sentinel offset for an absent parent or sibling.
pub const NULL_OFFSET: Offset = 0;

/// Node id stamped into every node header, used as the latch key.
pub type NodeId = u32;

/// Byte position of the node id inside every cached block.
///
/// The logger reads ids straight from block images it pulls off disk, so every
/// cached block kind keeps its id here.
pub const NODE_ID_OFFSET: usize = 4;

/// Kinds of cached blocks. Each kind gets its own cache queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BlockKind {
    Meta = 0x01,
    Internal = 0x02,
    Leaf = 0x03,
}

impl BlockKind {
    pub const ALL: [Self; 3] = [Self::Meta, Self::Internal, Self::Leaf];

    /// Index of this kind's cache queue.
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Meta => 0,
            Self::Internal => 1,
            Self::Leaf => 2,
        }
    }
}

impl TryFrom<u8> for BlockKind {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Meta),
            0x02 => Ok(Self::Internal),
            0x03 => Ok(Self::Leaf),
            _ => Err(value),
        }
    }
}

/// A heap-allocated block of a fixed size.
///
/// Accessors panic on out-of-range offsets; decoders validate sizes before
/// touching a block they did not build themselves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    data: Vec<u8>,
}

impl Block {
    /// Create a zeroed block.
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self {
            data: vec![0u8; size],
        }
    }

    /// Wrap raw bytes read from storage.
    #[must_use]
    pub const fn from_bytes(data: Vec<u8>) -> Self {
        Self { data }
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Read bytes at a specific offset.
    #[must_use]
    pub fn read_bytes(&self, offset: usize, len: usize) -> &[u8] {
        &self.data[offset..offset + len]
    }

    /// Write bytes at a specific offset.
    pub fn write_bytes(&mut self, offset: usize, bytes: &[u8]) {
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    #[must_use]
    pub fn read_u8(&self, offset: usize) -> u8 {
        self.data[offset]
    }

    pub fn write_u8(&mut self, offset: usize, value: u8) {
        self.data[offset] = value;
    }

    /// Read a u32 (little-endian) at the given offset.
    #[must_use]
    pub fn read_u32(&self, offset: usize) -> u32 {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&self.data[offset..offset + 4]);
        u32::from_le_bytes(buf)
    }

    /// Write a u32 (little-endian) at the given offset.
    pub fn write_u32(&mut self, offset: usize, value: u32) {
        self.data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Read a u64 (little-endian) at the given offset.
    #[must_use]
    pub fn read_u64(&self, offset: usize) -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.data[offset..offset + 8]);
        u64::from_le_bytes(buf)
    }

    /// Write a u64 (little-endian) at the given offset.
    pub fn write_u64(&mut self, offset: usize, value: u64) {
        self.data[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }

    /// Node id stored in the block header, if the block is large enough.
    #[must_use]
    pub fn node_id(&self) -> Option<NodeId> {
        (self.data.len() >= NODE_ID_OFFSET + 4).then(|| self.read_u32(NODE_ID_OFFSET))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_little_endian_fields() {
        let mut block = Block::new(32);
        block.write_u8(0, 0xAB);
        block.write_u32(4, 0x1234_5678);
        block.write_u64(8, 0x0102_0304_0506_0708);
        block.write_bytes(16, b"key");

        assert_eq!(block.read_u8(0), 0xAB);
        assert_eq!(block.read_bytes(4, 4), &[0x78, 0x56, 0x34, 0x12]);
        assert_eq!(block.read_u32(4), 0x1234_5678);
        assert_eq!(block.read_u64(8), 0x0102_0304_0506_0708);
        assert_eq!(block.read_bytes(16, 3), b"key");
        assert_eq!(block.node_id(), Some(0x1234_5678));
    }

    #[test]
    fn test_node_id_needs_full_header_field() {
        assert_eq!(Block::new(6).node_id(), None);
    }

    #[test]
    fn test_block_kind_round_trips_through_tag() {
        for kind in BlockKind::ALL {
            assert_eq!(BlockKind::try_from(kind as u8), Ok(kind));
        }
        assert_eq!(BlockKind::try_from(0x7F), Err(0x7F));
    }
}
