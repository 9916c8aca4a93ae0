//! Simulated in-memory block storage for crash and fault testing.
//!
//! Clones of a `SimulatedStore` share the same bytes, so a test can "crash" by
//! dropping an engine and reopen another one on the surviving contents.
//! [`SimulatedStore::crash`] additionally throws away every byte written since
//! the last successful sync, like a power loss. Faults are armed explicitly:
//! - fail every write once a budget of successful writes is spent
//! - tear the next write after a prefix of its bytes
//! - fail syncs

use std::sync::Arc;

use parking_lot::Mutex;

use crate::storage::io::{BlockStore, StorageError};

#[derive(Debug, Default)]
struct SimState {
    bytes: Vec<u8>,
    /// Contents as of the last successful sync.
    durable: Vec<u8>,
    /// Writes still allowed before every write fails.
    write_budget: Option<usize>,
    /// Persist only this many bytes of the next write, then fail it.
    tear_next_write: Option<usize>,
    fail_sync: bool,
    writes: u64,
    syncs: u64,
}

/// Statistics for simulated storage operations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimulatedStoreStats {
    pub writes: u64,
    pub syncs: u64,
}

/// An in-memory [`BlockStore`] whose clones share contents and fault plan.
#[derive(Debug, Clone, Default)]
pub struct SimulatedStore {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow `count` more successful writes, then fail all writes.
    pub fn fail_writes_after(&self, count: usize) {
        self.state.lock().write_budget = Some(count);
    }

    /// Store only the first `prefix` bytes of the next write and report failure.
    pub fn tear_next_write(&self, prefix: usize) {
        self.state.lock().tear_next_write = Some(prefix);
    }

    pub fn fail_syncs(&self, fail: bool) {
        self.state.lock().fail_sync = fail;
    }

    /// Clear every armed fault.
    pub fn heal(&self) {
        let mut state = self.state.lock();
        state.write_budget = None;
        state.tear_next_write = None;
        state.fail_sync = false;
    }

    /// Copy of the current contents.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.state.lock().bytes.clone()
    }

    /// Copy of the contents as of the last successful sync.
    #[must_use]
    pub fn snapshot_durable(&self) -> Vec<u8> {
        self.state.lock().durable.clone()
    }

    /// Lose every write that was not synced, and clear armed faults.
    pub fn crash(&self) {
        let mut state = self.state.lock();
        state.bytes = state.durable.clone();
        state.write_budget = None;
        state.tear_next_write = None;
        state.fail_sync = false;
    }

    #[must_use]
    pub fn stats(&self) -> SimulatedStoreStats {
        let state = self.state.lock();
        SimulatedStoreStats {
            writes: state.writes,
            syncs: state.syncs,
        }
    }
}

fn store_bytes(bytes: &mut Vec<u8>, offset: usize, data: &[u8]) {
    let end = offset + data.len();
    if bytes.len() < end {
        bytes.resize(end, 0);
    }
    bytes[offset..end].copy_from_slice(data);
}

impl BlockStore for SimulatedStore {
    fn read(&mut self, offset: u64, len: usize) -> Result<Vec<u8>, StorageError> {
        let state = self.state.lock();
        let size = state.bytes.len() as u64;
        let start = usize::try_from(offset).ok().filter(|s| s + len <= state.bytes.len());
        start
            .map(|s| state.bytes[s..s + len].to_vec())
            .ok_or(StorageError::ShortRead { offset, len, size })
    }

    fn write(&mut self, offset: u64, data: &[u8]) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        let offset = usize::try_from(offset)
            .map_err(|_| StorageError::InjectedFault(format!("offset {offset} too large")))?;

        if let Some(prefix) = state.tear_next_write.take() {
            let prefix = prefix.min(data.len());
            store_bytes(&mut state.bytes, offset, &data[..prefix]);
            return Err(StorageError::InjectedFault(format!(
                "torn write at offset {offset} after {prefix} bytes"
            )));
        }

        match state.write_budget {
            Some(0) => {
                return Err(StorageError::InjectedFault(format!(
                    "write of {} bytes at offset {offset}",
                    data.len()
                )));
            }
            Some(n) => state.write_budget = Some(n - 1),
            None => {}
        }

        store_bytes(&mut state.bytes, offset, data);
        state.writes += 1;
        Ok(())
    }

    fn sync(&mut self) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        if state.fail_sync {
            return Err(StorageError::InjectedFault("sync".to_string()));
        }
        state.durable = state.bytes.clone();
        state.syncs += 1;
        Ok(())
    }

    fn len(&self) -> Result<u64, StorageError> {
        Ok(self.state.lock().bytes.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_contents() {
        let mut a = SimulatedStore::new();
        let mut b = a.clone();

        a.write(4, b"data").expect("write");
        assert_eq!(b.len().expect("len"), 8);
        assert_eq!(b.read(0, 8).expect("read"), b"\0\0\0\0data");
        b.sync().expect("sync");
        assert_eq!(
            a.stats(),
            SimulatedStoreStats {
                writes: 1,
                syncs: 1
            }
        );
    }

    #[test]
    fn test_write_budget_then_fail() {
        let mut store = SimulatedStore::new();
        store.fail_writes_after(1);

        store.write(0, b"ok").expect("first write allowed");
        let err = store.write(2, b"no").expect_err("second write must fail");
        assert!(matches!(err, StorageError::InjectedFault(_)));
        assert_eq!(store.snapshot(), b"ok");

        store.heal();
        store.write(2, b"ok").expect("write after heal");
        assert_eq!(store.snapshot(), b"okok");
    }

    #[test]
    fn test_torn_write_keeps_prefix() {
        let mut store = SimulatedStore::new();
        store.tear_next_write(3);

        assert!(store.write(0, b"abcdef").is_err());
        assert_eq!(store.snapshot(), b"abc");

        store.write(0, b"xyz").expect("only one write is torn");
        assert_eq!(store.snapshot(), b"xyz");
    }

    #[test]
    fn test_read_out_of_range() {
        let mut store = SimulatedStore::new();
        store.write(0, &[1, 2, 3]).expect("write");
        assert!(matches!(
            store.read(2, 2),
            Err(StorageError::ShortRead { offset: 2, len: 2, size: 3 })
        ));
    }

    #[test]
    fn test_crash_drops_unsynced_writes() {
        let mut store = SimulatedStore::new();
        store.write(0, b"kept").expect("write");
        store.sync().expect("sync");
        store.write(4, b"lost").expect("write");
        store.write(0, b"KEPT").expect("overwrite");
        assert_eq!(store.snapshot_durable(), b"kept");

        store.crash();
        assert_eq!(store.snapshot(), b"kept");
        assert_eq!(store.len().expect("len"), 4);
    }

    #[test]
    fn test_sync_failure() {
        let mut store = SimulatedStore::new();
        store.fail_syncs(true);
        assert!(store.sync().is_err());
        store.fail_syncs(false);
        store.sync().expect("sync after reset");
    }
}
