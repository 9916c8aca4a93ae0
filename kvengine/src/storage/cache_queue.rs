//! Fixed-budget cache of node-sized blocks.
//!
//! A `CacheQueue` divides a byte budget into `item_size` slots and tracks every
//! slot on one of two LRU lists: blocks that match what is on disk ("synced")
//! and blocks holding writes of a transaction that has not committed yet
//! ("unsynced"). Only synced slots are ever evicted.
//!
//! # Design
//!
//! - Slot storage grows lazily up to the budget, then slots are recycled
//! - Lists are intrusive and index-linked through `CacheNode`, so every list
//!   operation is O(1)
//! - Not thread-safe on its own; the logger guards it with its single lock
//!
//! # Invariants
//!
//! - A slot handed to `add_node` is on exactly one list afterwards
//! - Unsynced slots are never returned by `get_new_node`
//! - `synced.len + unsynced.len <= allocated <= capacity`

/// Index of a cache slot.
pub type SlotId = usize;

/// Bookkeeping for one cache slot.
#[derive(Debug, Clone, Copy, Default)]
struct CacheNode {
    prev: Option<SlotId>,
    next: Option<SlotId>,
    sync_with_disk: bool,
    linked: bool,
}

/// Head is the most recently used slot, tail the least.
#[derive(Debug, Clone, Copy, Default)]
struct LruList {
    head: Option<SlotId>,
    tail: Option<SlotId>,
    len: usize,
}

/// A cache of equally sized blocks with synced and unsynced LRU lists.
///
/// # Pre-conditions
/// - `item_size` > 0
///
/// # Invariants
/// - `data.len() == allocated * item_size`
pub struct CacheQueue {
    item_size: usize,
    /// Maximum number of slots the budget allows.
    capacity: usize,
    data: Vec<u8>,
    nodes: Vec<CacheNode>,
    synced: LruList,
    unsynced: LruList,
}

impl CacheQueue {
    /// Create a cache for blocks of `item_size` bytes within `byte_budget`.
    ///
    /// The budget always admits at least one slot.
    #[must_use]
    pub fn new(item_size: usize, byte_budget: usize) -> Self {
        debug_assert!(item_size > 0, "cache item size must be positive");
        let item_size = item_size.max(1);
        Self {
            item_size,
            capacity: (byte_budget / item_size).max(1),
            data: Vec::new(),
            nodes: Vec::new(),
            synced: LruList::default(),
            unsynced: LruList::default(),
        }
    }

    #[must_use]
    pub const fn item_size(&self) -> usize {
        self.item_size
    }

    /// Maximum number of slots.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of slots currently holding a block.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.synced.len + self.unsynced.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub const fn unsynced_len(&self) -> usize {
        self.unsynced.len
    }

    /// Whether the slot holds an image that is already on disk.
    #[cfg(test)]
    #[must_use]
    pub fn is_synced(&self, slot: SlotId) -> bool {
        self.nodes.get(slot).is_some_and(|n| n.linked && n.sync_with_disk)
    }

    /// Hand out a slot for a new block.
    ///
    /// Grows the slot storage while the budget allows; otherwise evicts the
    /// least recently used synced slot. The returned slot is detached from both
    /// lists until `add_node` fills it.
    ///
    /// # Returns
    /// - `Some(slot)` on success
    /// - `None` when every slot holds uncommitted data
    pub fn get_new_node(&mut self) -> Option<SlotId> {
        if self.nodes.len() < self.capacity {
            let slot = self.nodes.len();
            self.nodes.push(CacheNode::default());
            self.data.resize(self.data.len() + self.item_size, 0);
            return Some(slot);
        }

        let victim = self.synced.tail?;
        self.unlink(victim);
        Some(victim)
    }

    /// Store a block image in `slot` and make it the most recent entry of the
    /// synced or unsynced list.
    ///
    /// `data` must be exactly `item_size` bytes and `slot` must come from
    /// [`CacheQueue::get_new_node`]; the logger checks block sizes first.
    pub fn add_node(&mut self, data: &[u8], is_sync: bool, slot: SlotId) {
        debug_assert_eq!(data.len(), self.item_size, "cache block size mismatch");
        debug_assert!(slot < self.nodes.len(), "cache slot {slot} was never allocated");

        if self.nodes[slot].linked {
            self.unlink(slot);
        }
        let start = slot * self.item_size;
        self.data[start..start + self.item_size].copy_from_slice(data);
        self.push_front(slot, is_sync);
    }

    /// Read the image in `slot` and bump it to the head of its list.
    #[must_use]
    pub fn get_node(&mut self, slot: SlotId) -> Option<&[u8]> {
        let node = *self.nodes.get(slot)?;
        if !node.linked {
            return None;
        }
        self.unlink(slot);
        self.push_front(slot, node.sync_with_disk);
        Some(self.slot_bytes(slot))
    }

    /// Read the image in `slot` without touching recency.
    #[must_use]
    pub fn peek_node(&self, slot: SlotId) -> Option<&[u8]> {
        self.nodes
            .get(slot)
            .filter(|n| n.linked)
            .map(|_| self.slot_bytes(slot))
    }

    /// Move `slot` from the unsynced to the synced list, making it evictable.
    ///
    /// Returns false if the slot is not holding an unsynced block.
    pub fn sync_node(&mut self, slot: SlotId) -> bool {
        match self.nodes.get(slot) {
            Some(node) if node.linked && !node.sync_with_disk => {
                self.unlink(slot);
                self.push_front(slot, true);
                true
            }
            _ => false,
        }
    }

    fn slot_bytes(&self, slot: SlotId) -> &[u8] {
        let start = slot * self.item_size;
        &self.data[start..start + self.item_size]
    }

    const fn list_mut(&mut self, synced: bool) -> &mut LruList {
        if synced {
            &mut self.synced
        } else {
            &mut self.unsynced
        }
    }

    fn push_front(&mut self, slot: SlotId, synced: bool) {
        let old_head = self.list_mut(synced).head;
        self.nodes[slot] = CacheNode {
            prev: None,
            next: old_head,
            sync_with_disk: synced,
            linked: true,
        };
        if let Some(head) = old_head {
            self.nodes[head].prev = Some(slot);
        }

        let list = self.list_mut(synced);
        list.head = Some(slot);
        if list.tail.is_none() {
            list.tail = Some(slot);
        }
        list.len += 1;
    }

    fn unlink(&mut self, slot: SlotId) {
        let node = self.nodes[slot];
        debug_assert!(node.linked, "unlinking a detached cache slot");

        match node.prev {
            Some(prev) => self.nodes[prev].next = node.next,
            None => self.list_mut(node.sync_with_disk).head = node.next,
        }
        match node.next {
            Some(next) => self.nodes[next].prev = node.prev,
            None => self.list_mut(node.sync_with_disk).tail = node.prev,
        }
        self.list_mut(node.sync_with_disk).len -= 1;
        self.nodes[slot] = CacheNode::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(byte: u8) -> Vec<u8> {
        vec![byte; 8]
    }

    #[test]
    fn test_budget_sets_capacity() {
        assert_eq!(CacheQueue::new(8, 64).capacity(), 8);
        assert_eq!(CacheQueue::new(8, 3).capacity(), 1);
    }

    #[test]
    fn test_add_and_get() {
        let mut cache = CacheQueue::new(8, 32);
        let slot = cache.get_new_node().expect("free slot");
        cache.add_node(&block(1), true, slot);

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get_node(slot), Some(block(1).as_slice()));
        assert!(cache.is_synced(slot));
    }

    #[test]
    fn test_evicts_least_recently_used_synced_slot() {
        let mut cache = CacheQueue::new(8, 24);
        let slots: Vec<SlotId> = (0..3)
            .map(|i| {
                let slot = cache.get_new_node().expect("free slot");
                cache.add_node(&block(i), true, slot);
                slot
            })
            .collect();

        // Touch the oldest so the second slot becomes the LRU victim.
        let _ = cache.get_node(slots[0]);

        assert_eq!(cache.get_new_node(), Some(slots[1]));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get_node(slots[1]), None);
    }

    #[test]
    fn test_unsynced_slots_are_never_evicted() {
        let mut cache = CacheQueue::new(8, 16);
        let dirty = cache.get_new_node().expect("free slot");
        cache.add_node(&block(1), false, dirty);
        let clean = cache.get_new_node().expect("free slot");
        cache.add_node(&block(2), true, clean);

        assert_eq!(cache.get_new_node(), Some(clean));
        cache.add_node(&block(3), false, clean);

        assert_eq!(cache.get_new_node(), None);
        assert_eq!(cache.unsynced_len(), 2);
        assert_eq!(cache.peek_node(dirty), Some(block(1).as_slice()));
    }

    #[test]
    fn test_sync_node_makes_slot_evictable() {
        let mut cache = CacheQueue::new(8, 8);
        let slot = cache.get_new_node().expect("free slot");
        cache.add_node(&block(5), false, slot);
        assert_eq!(cache.get_new_node(), None);

        assert!(cache.sync_node(slot));
        assert!(!cache.sync_node(slot));
        assert!(cache.is_synced(slot));
        assert_eq!(cache.unsynced_len(), 0);
        assert_eq!(cache.get_new_node(), Some(slot));
    }

    #[test]
    fn test_readding_a_linked_slot_moves_it() {
        let mut cache = CacheQueue::new(8, 16);
        let slot = cache.get_new_node().expect("free slot");
        cache.add_node(&block(1), true, slot);
        cache.add_node(&block(2), false, slot);

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.unsynced_len(), 1);
        assert_eq!(cache.peek_node(slot), Some(block(2).as_slice()));
    }
}
