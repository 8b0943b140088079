//! Binary format definitions for Casket WAL entries
//!
//! All WAL entries follow a consistent format:
//! entry header (32 bytes) + key_len(u32) + value_len(u32) + operation(u8) + padding(3) + key_bytes + value_bytes
//!
//! Batch markers (`Begin`, `Commit`, `Abort`) and `Clear` carry an empty key and value.

use std::path::PathBuf;

use crate::error::{CasketError, CasketResult};

/// Leading bytes of every WAL entry
pub const WAL_MAGIC: [u8; 4] = *b"CWAL";

/// Hard format limit for keys (1MB); stores usually configure less
pub const MAX_KEY_SIZE: usize = 1024 * 1024;

/// Hard format limit for values (1GB)
pub const MAX_VALUE_SIZE: usize = 1024 * 1024 * 1024;

/// Bytes of the header in front of every entry
pub const ENTRY_HEADER_SIZE: usize = 32;

/// Fixed payload prefix: key_len(4) + value_len(4) + op(1) + padding(3)
const PAYLOAD_PREFIX: usize = 12;

/// WAL operation types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Operation {
    /// Insert or update a key-value pair
    Put = 1,
    /// Delete a key
    Delete = 2,
    /// Remove every record
    Clear = 3,
    /// Start of an all-or-nothing batch
    Begin = 4,
    /// The batch since the last `Begin` is complete
    Commit = 5,
    /// The batch since the last `Begin` must be discarded
    Abort = 6,
}

impl Operation {
    fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Operation::Put),
            2 => Some(Operation::Delete),
            3 => Some(Operation::Clear),
            4 => Some(Operation::Begin),
            5 => Some(Operation::Commit),
            6 => Some(Operation::Abort),
            _ => None,
        }
    }

    /// Markers delimit batches and carry no record.
    pub fn is_marker(&self) -> bool {
        matches!(self, Operation::Begin | Operation::Commit | Operation::Abort)
    }
}

/// Fixed-size header in front of every WAL entry.
///
/// ```text
/// [0..4]   "CWAL"
/// [4..8]   payload length, u32 LE
/// [8..12]  CRC32C of the payload, u32 LE
/// [12]     operation
/// [13..32] zero
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct EntryHeader {
    magic: [u8; 4],
    length: u32,
    checksum: u32,
    operation: u8,
}

impl EntryHeader {
    fn encode(&self) -> [u8; ENTRY_HEADER_SIZE] {
        let mut buf = [0u8; ENTRY_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.magic);
        buf[4..8].copy_from_slice(&self.length.to_le_bytes());
        buf[8..12].copy_from_slice(&self.checksum.to_le_bytes());
        buf[12] = self.operation;
        buf
    }

    fn decode(bytes: &[u8]) -> Self {
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&bytes[0..4]);
        Self { magic, length: le_u32(&bytes[4..8]), checksum: le_u32(&bytes[8..12]), operation: bytes[12] }
    }
}

/// Decoded WAL entry.
#[derive(Debug, Clone)]
pub struct WalEntry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub operation: Operation,
}

pub(crate) fn le_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(buf)
}

/// Reject keys or values beyond the given limits before any allocation.
pub fn check_sizes(key: &[u8], value: &[u8], max_key: usize, max_value: usize) -> CasketResult<()> {
    if key.len() > max_key {
        return Err(CasketError::OversizedEntry {
            entry_size: key.len() as u64,
            max_size: max_key as u64,
            component: "key",
        });
    }
    if value.len() > max_value {
        return Err(CasketError::OversizedEntry {
            entry_size: value.len() as u64,
            max_size: max_value as u64,
            component: "value",
        });
    }
    Ok(())
}

/// Serialize an operation into a complete WAL entry
pub fn serialize_entry(key: &[u8], value: &[u8], op: Operation) -> CasketResult<Vec<u8>> {
    check_sizes(key, value, MAX_KEY_SIZE, MAX_VALUE_SIZE)?;

    let payload_size = PAYLOAD_PREFIX + key.len() + value.len();

    let mut payload = Vec::with_capacity(payload_size);
    payload.extend_from_slice(&(key.len() as u32).to_le_bytes());
    payload.extend_from_slice(&(value.len() as u32).to_le_bytes());
    payload.push(op as u8);
    payload.extend_from_slice(&[0u8; 3]);
    payload.extend_from_slice(key);
    payload.extend_from_slice(value);

    let header = EntryHeader {
        magic: WAL_MAGIC,
        length: payload.len() as u32,
        checksum: crc32c::crc32c(&payload),
        operation: op as u8,
    };

    let mut buffer = Vec::with_capacity(ENTRY_HEADER_SIZE + payload_size);
    buffer.extend_from_slice(&header.encode());
    buffer.extend_from_slice(&payload);
    Ok(buffer)
}

fn buffer_path() -> PathBuf {
    PathBuf::from("<buffer>")
}

/// Deserialize a WAL entry from a byte slice
pub fn deserialize_entry(data: &[u8]) -> CasketResult<WalEntry> {
    if data.len() < ENTRY_HEADER_SIZE {
        return Err(CasketError::Corrupted {
            path: buffer_path(),
            offset: 0,
            reason: format!("Entry too short: {} bytes, need at least {}", data.len(), ENTRY_HEADER_SIZE),
        });
    }

    let header = EntryHeader::decode(data);
    if header.magic != WAL_MAGIC {
        return Err(CasketError::NoMagicFound {
            path: buffer_path(),
            offset: 0,
            found_bytes: header.magic,
        });
    }

    let payload_start = ENTRY_HEADER_SIZE;
    let payload_end = payload_start + header.length as usize;

    if data.len() < payload_end {
        return Err(CasketError::TornWrite {
            path: buffer_path(),
            expected_size: header.length,
            available_bytes: (data.len() - payload_start) as u64,
            offset: payload_start as u64,
        });
    }

    let payload = &data[payload_start..payload_end];

    let computed_checksum = crc32c::crc32c(payload);
    if computed_checksum != header.checksum {
        return Err(CasketError::ChecksumMismatch {
            path: buffer_path(),
            expected: header.checksum,
            actual: computed_checksum,
            offset: payload_start as u64,
        });
    }

    if payload.len() < PAYLOAD_PREFIX {
        return Err(CasketError::Corrupted {
            path: buffer_path(),
            offset: payload_start as u64,
            reason: "Payload too short for header fields".to_string(),
        });
    }

    let key_len = le_u32(&payload[0..4]) as usize;
    let value_len = le_u32(&payload[4..8]) as usize;
    let operation = Operation::from_u8(payload[8])
        .filter(|op| *op as u8 == header.operation)
        .ok_or_else(|| CasketError::Corrupted {
            path: buffer_path(),
            offset: (payload_start + 8) as u64,
            reason: format!("Invalid operation type: {} (header says {})", payload[8], header.operation),
        })?;

    let key_end = PAYLOAD_PREFIX + key_len;
    let value_end = key_end + value_len;

    if payload.len() < value_end {
        return Err(CasketError::Corrupted {
            path: buffer_path(),
            offset: payload_start as u64,
            reason: format!("Payload too short: need {} bytes for key({}) + value({})",
                            value_end, key_len, value_len),
        });
    }

    Ok(WalEntry {
        key: payload[PAYLOAD_PREFIX..key_end].to_vec(),
        value: payload[key_end..value_end].to_vec(),
        operation,
    })
}
