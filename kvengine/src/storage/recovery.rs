//! Crash recovery for the storage engine.
//!
//! The log holds the images of at most one transaction. On startup:
//!
//! 1. Read the log header; an empty log or a committed marker needs nothing
//! 2. Check the recorded length against the log size (shorter log is fatal)
//! 3. Verify the checksum. A mismatch means the crash tore the log write
//!    itself, before any data-file write started, so the record is dropped
//! 4. Replay every `(offset, bytes)` item into the data file, padding any gap
//! 5. Sync the data file, then mark the record committed
//!
//! Replaying an already-applied record rewrites identical bytes, so recovery
//! interrupted by another crash is simply run again.

use crate::storage::io::{BlockStore, StorageError};
use crate::storage::wal::{self, LOG_HEADER_SIZE, LogHeader, WalError};

/// What recovery found in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// The log has never been written.
    EmptyLog,
    /// The last record was already applied.
    AlreadyCommitted,
    /// A pending record was replayed into the data file.
    Replayed { items: usize, bytes: u64 },
    /// A torn record was dropped; the data file was never touched by it.
    DiscardedTorn,
}

/// Run recovery over the data and log stores.
///
/// With `sync` disabled the stores are not fsynced; used by tests and
/// throwaway engines only.
pub fn recover<D: BlockStore, L: BlockStore>(
    data: &mut D,
    log: &mut L,
    sync: bool,
) -> Result<RecoveryOutcome, RecoveryError> {
    let log_len = log.len()?;
    if log_len == 0 {
        return Ok(RecoveryOutcome::EmptyLog);
    }
    if log_len < LOG_HEADER_SIZE as u64 {
        tracing::warn!(log_len, "discarding log with a torn header");
        return Ok(RecoveryOutcome::DiscardedTorn);
    }

    let mut header_bytes = [0u8; LOG_HEADER_SIZE];
    header_bytes.copy_from_slice(&log.read(0, LOG_HEADER_SIZE)?);
    let header = LogHeader::from_bytes(&header_bytes);
    if header.is_committed() {
        return Ok(RecoveryOutcome::AlreadyCommitted);
    }

    if u64::from(header.total_len) > log_len {
        return Err(RecoveryError::Truncated {
            recorded: u64::from(header.total_len),
            actual: log_len,
        });
    }

    let record = log.read(0, header.total_len as usize)?;
    let entries = match wal::decode_items(&header, &record) {
        Ok(entries) => entries,
        Err(WalError::ChecksumMismatch { expected, actual }) => {
            tracing::warn!(
                expected,
                actual,
                total_len = header.total_len,
                "discarding torn log record"
            );
            mark_committed(log, sync)?;
            return Ok(RecoveryOutcome::DiscardedTorn);
        }
        Err(e) => return Err(RecoveryError::Corrupt(e)),
    };

    let mut data_len = data.len()?;
    let mut bytes = 0u64;
    for entry in &entries {
        if entry.offset > data_len {
            let gap = usize::try_from(entry.offset - data_len)
                .map_err(|_| RecoveryError::Corrupt(WalError::CorruptRecord(format!(
                    "item offset {} too far past end of data",
                    entry.offset
                ))))?;
            data.write(data_len, &vec![0u8; gap])?;
        }
        data.write(entry.offset, &entry.bytes)?;
        data_len = data_len.max(entry.offset + entry.bytes.len() as u64);
        bytes += entry.bytes.len() as u64;
    }
    if sync {
        data.sync()?;
    }
    mark_committed(log, sync)?;

    tracing::info!(items = entries.len(), bytes, "replayed pending log record");
    Ok(RecoveryOutcome::Replayed {
        items: entries.len(),
        bytes,
    })
}

fn mark_committed<L: BlockStore>(log: &mut L, sync: bool) -> Result<(), StorageError> {
    log.write(0, &wal::committed_marker())?;
    if sync {
        log.sync()?;
    }
    Ok(())
}

/// Errors that abort recovery.
#[derive(Debug)]
pub enum RecoveryError {
    /// Reading or writing a store failed.
    Storage(StorageError),
    /// The log is shorter than the length its header records.
    Truncated { recorded: u64, actual: u64 },
    /// The record passed its checksum but its items are inconsistent.
    Corrupt(WalError),
}

impl std::fmt::Display for RecoveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Storage(e) => write!(f, "recovery storage error: {e}"),
            Self::Truncated { recorded, actual } => write!(
                f,
                "log truncated: header records {recorded} bytes, log holds {actual}"
            ),
            Self::Corrupt(e) => write!(f, "recovery failed: {e}"),
        }
    }
}

impl std::error::Error for RecoveryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Storage(e) => Some(e),
            Self::Corrupt(e) => Some(e),
            Self::Truncated { .. } => None,
        }
    }
}

impl From<StorageError> for RecoveryError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::simulated::SimulatedStore;
    use crate::storage::wal::LogRecordBuilder;

    fn pending_record(items: &[(u64, &[u8])]) -> Vec<u8> {
        let mut builder = LogRecordBuilder::new();
        for (offset, bytes) in items {
            builder.push(*offset, bytes);
        }
        builder.finish()
    }

    #[test]
    fn test_empty_log_is_noop() {
        let mut data = SimulatedStore::new();
        let mut log = SimulatedStore::new();
        assert_eq!(
            recover(&mut data, &mut log, true).expect("recover"),
            RecoveryOutcome::EmptyLog
        );
        assert!(data.snapshot().is_empty());
    }

    #[test]
    fn test_pending_record_is_replayed_with_padding() {
        let mut data = SimulatedStore::new();
        let mut log = SimulatedStore::new();
        data.write(0, b"meta").expect("seed data");
        log.write(0, &pending_record(&[(8, b"late"), (0, b"META")]))
            .expect("write log");

        let outcome = recover(&mut data, &mut log, true).expect("recover");
        assert_eq!(outcome, RecoveryOutcome::Replayed { items: 2, bytes: 8 });
        assert_eq!(data.snapshot(), b"META\0\0\0\0late");

        // A second pass sees the committed marker and leaves data alone.
        let writes = data.stats().writes;
        assert_eq!(
            recover(&mut data, &mut log, true).expect("recover again"),
            RecoveryOutcome::AlreadyCommitted
        );
        assert_eq!(data.stats().writes, writes);
    }

    #[test]
    fn test_replaying_twice_is_idempotent() {
        let record = pending_record(&[(4, b"abcd")]);
        let mut data = SimulatedStore::new();
        let mut log = SimulatedStore::new();
        log.write(0, &record).expect("write log");
        recover(&mut data, &mut log, false).expect("first replay");
        let once = data.snapshot();

        // Crash before the committed marker became durable: replay again.
        log.write(0, &record).expect("restore pending log");
        recover(&mut data, &mut log, false).expect("second replay");
        assert_eq!(data.snapshot(), once);
    }

    #[test]
    fn test_truncated_log_is_fatal() {
        let record = pending_record(&[(0, &[7u8; 64])]);
        let mut data = SimulatedStore::new();
        let mut log = SimulatedStore::new();
        log.write(0, &record[..40]).expect("write partial log");

        let err = recover(&mut data, &mut log, true).expect_err("must fail");
        assert!(matches!(
            err,
            RecoveryError::Truncated {
                actual: 40,
                ..
            }
        ));
        assert!(data.snapshot().is_empty());
    }

    #[test]
    fn test_torn_record_is_discarded() {
        let mut data = SimulatedStore::new();
        let mut log = SimulatedStore::new();
        log.write(0, &pending_record(&[(0, &[1u8; 32])]))
            .expect("first record");
        log.sync().expect("sync");

        // A newer record of the same size torn halfway through.
        log.tear_next_write(20);
        assert!(log.write(0, &pending_record(&[(0, &[2u8; 32])])).is_err());

        assert_eq!(
            recover(&mut data, &mut log, true).expect("recover"),
            RecoveryOutcome::DiscardedTorn
        );
        assert!(data.snapshot().is_empty());
        assert_eq!(
            recover(&mut data, &mut log, true).expect("recover again"),
            RecoveryOutcome::AlreadyCommitted
        );
    }
}
