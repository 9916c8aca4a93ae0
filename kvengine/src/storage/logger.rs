//! Transactional node I/O.
//!
//! Every tree mutation runs inside an internal transaction. Node images written
//! through the logger land in a per-kind [`CacheQueue`] as unsynced blocks and
//! are recorded in the transaction. Commit makes the whole set durable at once:
//!
//! 1. Drop images superseded by a newer write of the same node; fsync raw
//!    value blobs the images may point at
//! 2. Write the surviving images to the log as one pending record, fsync
//! 3. Copy them into the data file, fsync
//! 4. Overwrite the log marker with "committed", fsync
//! 5. Mark the cache slots synced so they may be evicted
//!
//! A crash before step 4 leaves a pending record that recovery replays.
//!
//! # Concurrency
//!
//! All state, the stores included, sits behind one mutex. Node I/O is
//! serialized engine-wide; the tree's own latches decide who may mutate what.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::storage::block::{Block, BlockKind, NodeId, Offset};
use crate::storage::cache_queue::{CacheQueue, SlotId};
use crate::storage::io::{BlockStore, StorageError};
use crate::storage::recovery::{self, RecoveryError, RecoveryOutcome};
use crate::storage::wal::{self, DEFAULT_LOG_SIZE_LIMIT, LogRecordBuilder};

/// Identifier of an internal transaction. Never reused while a logger lives.
pub type TransactionId = u64;

/// Logical write clock used to order images of the same node.
pub type Timestamp = u64;

/// Node id reserved for the meta page.
pub const META_NODE_ID: NodeId = NodeId::MAX;

/// Default byte budget of each cache queue: 256MB.
pub const DEFAULT_CACHE_BYTES: usize = 256 * 1024 * 1024;

/// Tunables for a logger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoggerConfig {
    /// Byte budget of each of the three cache queues.
    pub cache_bytes: usize,
    /// Largest log record a commit may produce.
    pub log_size_limit: u64,
    /// Fsync the stores during commit and recovery.
    pub sync: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            cache_bytes: DEFAULT_CACHE_BYTES,
            log_size_limit: DEFAULT_LOG_SIZE_LIMIT,
            sync: true,
        }
    }
}

/// One node image written inside a transaction.
#[derive(Debug, Clone, Copy)]
struct LogItem {
    offset: Offset,
    length: usize,
    timestamp: Timestamp,
    node_id: NodeId,
    cache_id: SlotId,
    kind: BlockKind,
}

/// A cache queue plus the node currently owning each of its slots.
struct KindCache {
    queue: CacheQueue,
    owners: Vec<Option<NodeId>>,
}

impl KindCache {
    fn new(item_size: usize, byte_budget: usize) -> Self {
        Self {
            queue: CacheQueue::new(item_size, byte_budget),
            owners: Vec::new(),
        }
    }

    /// Take a slot, returning it with the node it was evicted from.
    fn claim_slot(&mut self) -> Option<(SlotId, Option<NodeId>)> {
        let slot = self.queue.get_new_node()?;
        if slot >= self.owners.len() {
            self.owners.resize(slot + 1, None);
        }
        Some((slot, self.owners[slot].take()))
    }
}

struct LoggerState<S> {
    data: S,
    log: S,
    data_len: u64,
    /// Raw value bytes written since the last data-file sync.
    raw_dirty: bool,
    caches: [Option<KindCache>; 3],
    /// Slot holding the newest image of each cached node.
    node_to_slot: HashMap<NodeId, (BlockKind, SlotId)>,
    offset_to_node: HashMap<Offset, NodeId>,
    /// Timestamp of the newest image of each node in the data file.
    latest_committed: HashMap<NodeId, Timestamp>,
    transactions: HashMap<TransactionId, Vec<LogItem>>,
    next_tid: TransactionId,
    clock: Timestamp,
    poisoned: bool,
}

/// Write-ahead logger and node cache over a data store and a log store.
pub struct Logger<S: BlockStore> {
    state: Mutex<LoggerState<S>>,
    config: LoggerConfig,
    recovery: RecoveryOutcome,
}

impl<S: BlockStore> Logger<S> {
    /// Take ownership of the stores and run recovery.
    pub fn open(mut data: S, mut log: S, config: LoggerConfig) -> Result<Self, LogError> {
        let recovery = recovery::recover(&mut data, &mut log, config.sync)?;
        let data_len = data.len()?;

        Ok(Self {
            state: Mutex::new(LoggerState {
                data,
                log,
                data_len,
                raw_dirty: false,
                caches: [None, None, None],
                node_to_slot: HashMap::new(),
                offset_to_node: HashMap::new(),
                latest_committed: HashMap::new(),
                transactions: HashMap::new(),
                next_tid: 1,
                clock: 0,
                poisoned: false,
            }),
            config,
            recovery,
        })
    }

    #[must_use]
    pub const fn config(&self) -> &LoggerConfig {
        &self.config
    }

    /// What recovery did when this logger was opened.
    #[must_use]
    pub const fn recovery_outcome(&self) -> RecoveryOutcome {
        self.recovery
    }

    /// Size of the data file, counting raw writes not yet synced.
    #[must_use]
    pub fn data_len(&self) -> u64 {
        self.state.lock().data_len
    }

    /// Start a new, empty transaction.
    pub fn open_transaction(&self) -> Result<TransactionId, LogError> {
        let mut state = self.state.lock();
        if state.poisoned {
            return Err(LogError::Poisoned);
        }
        let tid = state.next_tid;
        state.next_tid += 1;
        state.transactions.insert(tid, Vec::new());
        Ok(tid)
    }

    /// Buffer a node image in the cache and record it in transaction `tid`.
    pub fn write_node(
        &self,
        block: &Block,
        kind: BlockKind,
        node_id: NodeId,
        offset: Offset,
        tid: TransactionId,
    ) -> Result<(), LogError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.poisoned {
            return Err(LogError::Poisoned);
        }
        if !state.transactions.contains_key(&tid) {
            return Err(LogError::UnknownTransaction(tid));
        }

        let cache = cache_for(&mut state.caches, kind, block.len(), self.config.cache_bytes)?;
        let Some((slot, evicted)) = cache.claim_slot() else {
            state.poisoned = true;
            tracing::error!(?kind, node_id, "cache exhausted, logger poisoned");
            return Err(LogError::CacheExhausted(kind));
        };
        cache.queue.add_node(block.as_bytes(), false, slot);
        cache.owners[slot] = Some(node_id);
        if let Some(old) = evicted {
            if state.node_to_slot.get(&old) == Some(&(kind, slot)) {
                state.node_to_slot.remove(&old);
            }
        }
        state.node_to_slot.insert(node_id, (kind, slot));
        state.offset_to_node.insert(offset, node_id);

        state.clock += 1;
        let item = LogItem {
            offset,
            length: block.len(),
            timestamp: state.clock,
            node_id,
            cache_id: slot,
            kind,
        };
        if let Some(items) = state.transactions.get_mut(&tid) {
            items.push(item);
        }
        Ok(())
    }

    /// Read the newest image of the node stored at `offset`.
    ///
    /// Served from the cache when possible; otherwise read from the data file
    /// and cached as synced. When no slot can be freed the image is returned
    /// without caching it.
    ///
    /// Fails once the logger is poisoned: the cache may hold images that
    /// never committed.
    pub fn read_node(&self, kind: BlockKind, offset: Offset, len: usize) -> Result<Block, LogError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.poisoned {
            return Err(LogError::Poisoned);
        }

        if let Some(&(cached_kind, slot)) = state
            .offset_to_node
            .get(&offset)
            .and_then(|node| state.node_to_slot.get(node))
        {
            if cached_kind == kind {
                let cache = cache_for(&mut state.caches, kind, len, self.config.cache_bytes)?;
                if let Some(bytes) = cache.queue.get_node(slot) {
                    return Ok(Block::from_bytes(bytes.to_vec()));
                }
            }
        }

        check_bounds(offset, len, state.data_len)?;
        let block = Block::from_bytes(state.data.read(offset, len)?);
        let node_id = match kind {
            BlockKind::Meta => META_NODE_ID,
            BlockKind::Internal | BlockKind::Leaf => block
                .node_id()
                .ok_or(LogError::BlockSizeMismatch {
                    kind,
                    expected: len,
                    actual: block.len(),
                })?,
        };

        // Only cache images that carry the requested kind tag.
        if kind != BlockKind::Meta && block.read_u8(0) != kind as u8 {
            return Ok(block);
        }
        let cache = cache_for(&mut state.caches, kind, len, self.config.cache_bytes)?;
        if let Some((slot, evicted)) = cache.claim_slot() {
            cache.queue.add_node(block.as_bytes(), true, slot);
            cache.owners[slot] = Some(node_id);
            if let Some(old) = evicted {
                if state.node_to_slot.get(&old) == Some(&(kind, slot)) {
                    state.node_to_slot.remove(&old);
                }
            }
            state.node_to_slot.insert(node_id, (kind, slot));
            state.offset_to_node.insert(offset, node_id);
        }
        Ok(block)
    }

    /// Write raw bytes (a value blob) straight to the data file.
    ///
    /// The next commit fsyncs the data file before its log record is written,
    /// so a replayed record never points at bytes that did not reach disk.
    pub fn write_raw(&self, offset: Offset, bytes: &[u8]) -> Result<(), LogError> {
        let mut state = self.state.lock();
        if state.poisoned {
            return Err(LogError::Poisoned);
        }
        state.write_data(offset, bytes)?;
        state.raw_dirty |= !bytes.is_empty();
        Ok(())
    }

    /// Read raw bytes (a value blob) from the data file.
    pub fn read_raw(&self, offset: Offset, len: usize) -> Result<Vec<u8>, LogError> {
        let mut state = self.state.lock();
        if state.poisoned {
            return Err(LogError::Poisoned);
        }
        if len == 0 {
            return Ok(Vec::new());
        }
        check_bounds(offset, len, state.data_len)?;
        Ok(state.data.read(offset, len)?)
    }

    /// Make every image written in `tid` durable, atomically.
    ///
    /// Any failure poisons the logger; the data on disk stays recoverable.
    pub fn commit_transaction(&self, tid: TransactionId) -> Result<(), LogError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.poisoned {
            return Err(LogError::Poisoned);
        }
        let items = state
            .transactions
            .remove(&tid)
            .ok_or(LogError::UnknownTransaction(tid))?;

        match state.apply(&items, &self.config) {
            Ok(applied) => {
                for item in &items {
                    if let Some(cache) = state.caches[item.kind.index()].as_mut() {
                        cache.queue.sync_node(item.cache_id);
                    }
                }
                tracing::trace!(tid, items = items.len(), applied, "committed transaction");
                Ok(())
            }
            Err(e) => {
                state.poisoned = true;
                tracing::error!(tid, error = %e, "commit failed, logger poisoned");
                Err(e)
            }
        }
    }

    /// Drop a transaction whose mutation failed midway.
    ///
    /// Its cached images may describe a half-applied change, so the logger is
    /// poisoned; reopening recovers the last committed state.
    pub fn abandon_transaction(&self, tid: TransactionId) {
        let mut state = self.state.lock();
        state.transactions.remove(&tid);
        state.poisoned = true;
        tracing::error!(tid, "transaction abandoned, logger poisoned");
    }

    #[must_use]
    pub fn is_poisoned(&self) -> bool {
        self.state.lock().poisoned
    }

    #[cfg(test)]
    #[must_use]
    pub fn open_transactions(&self) -> usize {
        self.state.lock().transactions.len()
    }

    /// Blocks of `kind` in the cache, and how many of them are unsynced.
    #[cfg(test)]
    #[must_use]
    pub fn cache_usage(&self, kind: BlockKind) -> (usize, usize) {
        self.state.lock().caches[kind.index()]
            .as_ref()
            .map_or((0, 0), |c| (c.queue.len(), c.queue.unsynced_len()))
    }
}

impl<S: BlockStore> LoggerState<S> {
    /// Steps 1-4 of commit. Returns the number of images written.
    fn apply(&mut self, items: &[LogItem], config: &LoggerConfig) -> Result<usize, LogError> {
        let mut newest: HashMap<NodeId, Timestamp> = HashMap::new();
        for item in items {
            let ts = newest.entry(item.node_id).or_insert(item.timestamp);
            *ts = (*ts).max(item.timestamp);
        }
        let survivors: Vec<&LogItem> = items
            .iter()
            .filter(|item| newest.get(&item.node_id) == Some(&item.timestamp))
            .filter(|item| {
                self.latest_committed
                    .get(&item.node_id)
                    .is_none_or(|&committed| committed < item.timestamp)
            })
            .collect();
        if survivors.is_empty() {
            return Ok(0);
        }

        let mut builder = LogRecordBuilder::new();
        for item in &survivors {
            let bytes = self.caches[item.kind.index()]
                .as_ref()
                .and_then(|c| c.queue.peek_node(item.cache_id))
                .ok_or(LogError::MissingImage(item.node_id))?;
            debug_assert_eq!(bytes.len(), item.length);
            builder.push(item.offset, bytes);
        }
        if builder.len() as u64 > config.log_size_limit {
            return Err(LogError::LogFull {
                size: builder.len() as u64,
                limit: config.log_size_limit,
            });
        }

        if self.raw_dirty {
            if config.sync {
                self.data.sync()?;
            }
            self.raw_dirty = false;
        }

        let record = builder.finish();
        self.log.write(0, &record)?;
        if config.sync {
            self.log.sync()?;
        }

        for item in &survivors {
            let image = self.caches[item.kind.index()]
                .as_ref()
                .and_then(|c| c.queue.peek_node(item.cache_id))
                .map(<[u8]>::to_vec)
                .ok_or(LogError::MissingImage(item.node_id))?;
            self.write_data(item.offset, &image)?;
        }
        if config.sync {
            self.data.sync()?;
        }

        self.log.write(0, &wal::committed_marker())?;
        if config.sync {
            self.log.sync()?;
        }

        for item in &survivors {
            self.latest_committed.insert(item.node_id, item.timestamp);
        }
        Ok(survivors.len())
    }

    /// Write into the data file, zero-filling any gap past its end.
    fn write_data(&mut self, offset: Offset, bytes: &[u8]) -> Result<(), StorageError> {
        if bytes.is_empty() {
            return Ok(());
        }
        if offset > self.data_len {
            let gap = usize::try_from(offset - self.data_len)
                .map_err(|_| StorageError::InjectedFault(format!("gap to {offset} too large")))?;
            self.data.write(self.data_len, &vec![0u8; gap])?;
        }
        self.data.write(offset, bytes)?;
        self.data_len = self.data_len.max(offset + bytes.len() as u64);
        Ok(())
    }
}

fn cache_for(
    caches: &mut [Option<KindCache>; 3],
    kind: BlockKind,
    item_size: usize,
    byte_budget: usize,
) -> Result<&mut KindCache, LogError> {
    let cache = caches[kind.index()].get_or_insert_with(|| KindCache::new(item_size, byte_budget));
    if cache.queue.item_size() == item_size {
        Ok(cache)
    } else {
        Err(LogError::BlockSizeMismatch {
            kind,
            expected: cache.queue.item_size(),
            actual: item_size,
        })
    }
}

const fn check_bounds(offset: Offset, len: usize, data_len: u64) -> Result<(), LogError> {
    if offset.saturating_add(len as u64) > data_len {
        return Err(LogError::OutOfBounds {
            offset,
            len,
            data_len,
        });
    }
    Ok(())
}

/// Errors from the logger.
#[derive(Debug)]
pub enum LogError {
    /// Reading or writing a store failed.
    Storage(StorageError),
    /// Startup recovery failed.
    Recovery(RecoveryError),
    /// No open transaction has this id.
    UnknownTransaction(TransactionId),
    /// Every cache slot of this kind holds uncommitted data.
    CacheExhausted(BlockKind),
    /// The transaction's log record exceeds the configured limit.
    LogFull { size: u64, limit: u64 },
    /// A block's size differs from the size of its kind.
    BlockSizeMismatch {
        kind: BlockKind,
        expected: usize,
        actual: usize,
    },
    /// A read reaches past the end of the data file.
    OutOfBounds {
        offset: Offset,
        len: usize,
        data_len: u64,
    },
    /// A transaction's image vanished from the cache.
    MissingImage(NodeId),
    /// An earlier failure left uncommitted state behind; reopen the engine.
    Poisoned,
}

impl std::fmt::Display for LogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Storage(e) => write!(f, "logger storage error: {e}"),
            Self::Recovery(e) => write!(f, "{e}"),
            Self::UnknownTransaction(tid) => write!(f, "unknown transaction {tid}"),
            Self::CacheExhausted(kind) => {
                write!(f, "{kind:?} cache exhausted: every slot holds uncommitted data")
            }
            Self::LogFull { size, limit } => {
                write!(f, "log record of {size} bytes exceeds limit of {limit} bytes")
            }
            Self::BlockSizeMismatch {
                kind,
                expected,
                actual,
            } => write!(f, "{kind:?} block is {actual} bytes, expected {expected}"),
            Self::OutOfBounds {
                offset,
                len,
                data_len,
            } => write!(
                f,
                "read of {len} bytes at offset {offset} past end of data ({data_len} bytes)"
            ),
            Self::MissingImage(node) => write!(f, "cached image of node {node} is missing"),
            Self::Poisoned => write!(f, "logger poisoned by an earlier failure; reopen the engine"),
        }
    }
}

impl std::error::Error for LogError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Storage(e) => Some(e),
            Self::Recovery(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StorageError> for LogError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

impl From<RecoveryError> for LogError {
    fn from(e: RecoveryError) -> Self {
        Self::Recovery(e)
    }
}
