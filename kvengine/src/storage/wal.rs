//! Log record format for the write-ahead log.
//!
//! The log file holds at most one record: the block images of the most recent
//! transaction, always written at offset 0. The leading marker says whether the
//! record still needs to be applied to the data file.
//!
//! # Log Record Format
//!
//! ```text
//! +----------+--------------------------------------------------+
//! | 0-3      | marker (PENDING or COMMITTED)                    |
//! | 4-7      | total_len (4 bytes, includes this header)        |
//! | 8-11     | CRC32 of bytes 16..total_len                     |
//! | 12-15    | item_count                                       |
//! | 16-N     | items: offset (8) + length (4) + block bytes     |
//! +----------+--------------------------------------------------+
//! ```

// Record lengths are checked against u32::MAX before they are narrowed.
#![allow(clippy::cast_possible_truncation)]

/// Marker of a record whose items may not have reached the data file.
pub const PENDING_MARKER: u32 = 443;

/// Marker of a record that has been fully applied.
pub const COMMITTED_MARKER: u32 = 4396;

/// Fixed header size before the first item.
pub const LOG_HEADER_SIZE: usize = 16;

/// Per-item header: target offset (8) + length (4).
pub const ITEM_HEADER_SIZE: usize = 12;

/// Default upper bound for a single log record: 4MB.
pub const DEFAULT_LOG_SIZE_LIMIT: u64 = 4 * 1024 * 1024;

/// Parsed log record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogHeader {
    pub marker: u32,
    pub total_len: u32,
    pub checksum: u32,
    pub item_count: u32,
}

impl LogHeader {
    /// Parse a header from the first `LOG_HEADER_SIZE` bytes of the log.
    #[must_use]
    pub fn from_bytes(bytes: &[u8; LOG_HEADER_SIZE]) -> Self {
        let field = |i: usize| u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        Self {
            marker: field(0),
            total_len: field(4),
            checksum: field(8),
            item_count: field(12),
        }
    }

    #[must_use]
    pub const fn is_committed(&self) -> bool {
        self.marker == COMMITTED_MARKER
    }
}

/// One block image recorded in the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub offset: u64,
    pub bytes: Vec<u8>,
}

/// Accumulates block images into a pending log record.
#[derive(Debug)]
pub struct LogRecordBuilder {
    buf: Vec<u8>,
    item_count: u32,
}

impl Default for LogRecordBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl LogRecordBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buf: vec![0u8; LOG_HEADER_SIZE],
            item_count: 0,
        }
    }

    /// Append the image of a block destined for `offset`.
    pub fn push(&mut self, offset: u64, bytes: &[u8]) {
        self.buf.extend_from_slice(&offset.to_le_bytes());
        self.buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        self.buf.extend_from_slice(bytes);
        self.item_count += 1;
    }

    /// Size the finished record will have.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.item_count == 0
    }

    #[must_use]
    pub const fn item_count(&self) -> u32 {
        self.item_count
    }

    /// Fill in the header and return the record bytes, marked pending.
    #[must_use]
    pub fn finish(mut self) -> Vec<u8> {
        let total_len = self.buf.len() as u32;
        let checksum = crc32fast::hash(&self.buf[LOG_HEADER_SIZE..]);
        self.buf[0..4].copy_from_slice(&PENDING_MARKER.to_le_bytes());
        self.buf[4..8].copy_from_slice(&total_len.to_le_bytes());
        self.buf[8..12].copy_from_slice(&checksum.to_le_bytes());
        self.buf[12..16].copy_from_slice(&self.item_count.to_le_bytes());
        self.buf
    }
}

/// Bytes that overwrite the leading marker once a record is applied.
#[must_use]
pub const fn committed_marker() -> [u8; 4] {
    COMMITTED_MARKER.to_le_bytes()
}

/// Verify the checksum of a full record and split it into its items.
///
/// `record` must be exactly `header.total_len` bytes.
pub fn decode_items(header: &LogHeader, record: &[u8]) -> Result<Vec<LogEntry>, WalError> {
    if record.len() < LOG_HEADER_SIZE || record.len() != header.total_len as usize {
        return Err(WalError::CorruptRecord(format!(
            "record is {} bytes, header says {}",
            record.len(),
            header.total_len
        )));
    }

    let body = &record[LOG_HEADER_SIZE..];
    let actual = crc32fast::hash(body);
    if actual != header.checksum {
        return Err(WalError::ChecksumMismatch {
            expected: header.checksum,
            actual,
        });
    }

    let mut entries = Vec::with_capacity(header.item_count as usize);
    let mut pos = 0usize;
    for index in 0..header.item_count {
        let item_header = body
            .get(pos..pos + ITEM_HEADER_SIZE)
            .ok_or_else(|| WalError::CorruptRecord(format!("item {index} header overruns record")))?;
        let mut offset = [0u8; 8];
        offset.copy_from_slice(&item_header[0..8]);
        let mut len = [0u8; 4];
        len.copy_from_slice(&item_header[8..12]);
        let len = u32::from_le_bytes(len) as usize;
        pos += ITEM_HEADER_SIZE;

        let bytes = body
            .get(pos..pos + len)
            .ok_or_else(|| WalError::CorruptRecord(format!("item {index} overruns record")))?;
        pos += len;
        entries.push(LogEntry {
            offset: u64::from_le_bytes(offset),
            bytes: bytes.to_vec(),
        });
    }

    if pos != body.len() {
        return Err(WalError::CorruptRecord(format!(
            "{} trailing bytes after {} items",
            body.len() - pos,
            header.item_count
        )));
    }

    Ok(entries)
}

/// Errors decoding a log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalError {
    /// Lengths inside the record are inconsistent.
    CorruptRecord(String),
    /// The record checksum does not match its contents.
    ChecksumMismatch { expected: u32, actual: u32 },
}

impl std::fmt::Display for WalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CorruptRecord(msg) => write!(f, "corrupt log record: {msg}"),
            Self::ChecksumMismatch { expected, actual } => write!(
                f,
                "log checksum mismatch: expected 0x{expected:08x}, got 0x{actual:08x}"
            ),
        }
    }
}

impl std::error::Error for WalError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_of(record: &[u8]) -> LogHeader {
        let mut bytes = [0u8; LOG_HEADER_SIZE];
        bytes.copy_from_slice(&record[..LOG_HEADER_SIZE]);
        LogHeader::from_bytes(&bytes)
    }

    #[test]
    fn test_builder_and_decode() {
        let mut builder = LogRecordBuilder::new();
        builder.push(128, b"first block");
        builder.push(4096, b"second");
        assert_eq!(builder.item_count(), 2);
        let expected_len = LOG_HEADER_SIZE + 2 * ITEM_HEADER_SIZE + 11 + 6;
        assert_eq!(builder.len(), expected_len);

        let record = builder.finish();
        let header = header_of(&record);
        assert_eq!(header.marker, PENDING_MARKER);
        assert!(!header.is_committed());
        assert_eq!(header.total_len as usize, expected_len);

        let entries = decode_items(&header, &record).expect("decode");
        assert_eq!(
            entries,
            vec![
                LogEntry {
                    offset: 128,
                    bytes: b"first block".to_vec()
                },
                LogEntry {
                    offset: 4096,
                    bytes: b"second".to_vec()
                },
            ]
        );
    }

    #[test]
    fn test_committed_marker_overwrites_header() {
        let mut record = LogRecordBuilder::new().finish();
        record[0..4].copy_from_slice(&committed_marker());
        assert!(header_of(&record).is_committed());
    }

    #[test]
    fn test_checksum_validation() {
        let mut builder = LogRecordBuilder::new();
        builder.push(64, &[0xAA; 32]);
        let mut record = builder.finish();
        let last = record.len() - 1;
        record[last] ^= 0xFF;

        let header = header_of(&record);
        assert!(matches!(
            decode_items(&header, &record),
            Err(WalError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_item_count_overrun_is_corrupt() {
        let mut builder = LogRecordBuilder::new();
        builder.push(64, &[1; 4]);
        let record = builder.finish();

        let mut header = header_of(&record);
        header.item_count = 2;
        assert!(matches!(
            decode_items(&header, &record),
            Err(WalError::CorruptRecord(_))
        ));
    }

    #[test]
    fn test_empty_record() {
        let record = LogRecordBuilder::default().finish();
        let header = header_of(&record);
        assert_eq!(header.item_count, 0);
        assert!(decode_items(&header, &record).expect("decode").is_empty());
    }
}
