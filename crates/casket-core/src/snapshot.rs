//! Snapshot file format
//!
//! A snapshot is a flat, backend-independent dump of every record. It is
//! what `dump_snapshot`/`copy` produce and also what a file store keeps as
//! its checkpointed data file.
//!
//! Layout:
//!   file header  (16 bytes): "CSNP" + version u16 + backend u8 + reserved
//!   record       (16 bytes + key + value): "CREC" + key_len u32 + value_len u32 + crc32c(key ++ value)
//!   trailer      (12 bytes): "CEND" + record count u64
//!
//! All integers are little-endian.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::{CasketError, CasketResult};
use crate::platform_durability::flush;
use crate::records::BackendKind;

/// Magic bytes opening every snapshot: "CSNP"
pub const SNAPSHOT_MAGIC: [u8; 4] = *b"CSNP";

const RECORD_MAGIC: [u8; 4] = *b"CREC";
const TRAILER_MAGIC: [u8; 4] = *b"CEND";
const FORMAT_VERSION: u16 = 1;

const FILE_HEADER_SIZE: usize = 16;
const RECORD_HEADER_SIZE: usize = 16;
const TRAILER_SIZE: usize = 12;

/// Streams records into a new snapshot file.
pub struct SnapshotWriter {
    out: BufWriter<File>,
    path: PathBuf,
    records: u64,
    bytes: u64,
}

impl SnapshotWriter {
    /// Create (or truncate) `path` and write the file header.
    ///
    /// `kind` is recorded for checkpoint files so a store cannot be reopened
    /// as the wrong backend; portable dumps pass `None`.
    pub fn create(path: &Path, kind: Option<BackendKind>) -> CasketResult<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .map_err(|e| CasketError::io_at(path, "Failed to create snapshot file", e))?;

        let mut header = [0u8; FILE_HEADER_SIZE];
        header[0..4].copy_from_slice(&SNAPSHOT_MAGIC);
        header[4..6].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        header[6] = kind.map(BackendKind::to_u8).unwrap_or(0);

        let mut writer = Self {
            out: BufWriter::new(file),
            path: path.to_path_buf(),
            records: 0,
            bytes: 0,
        };
        writer.write_raw(&header)?;
        Ok(writer)
    }

    fn write_raw(&mut self, bytes: &[u8]) -> CasketResult<()> {
        self.out
            .write_all(bytes)
            .map_err(|e| CasketError::io_at(&self.path, "Snapshot write failed", e))?;
        self.bytes += bytes.len() as u64;
        Ok(())
    }

    pub fn write_record(&mut self, key: &[u8], value: &[u8]) -> CasketResult<()> {
        let mut hasher_input = Vec::with_capacity(key.len() + value.len());
        hasher_input.extend_from_slice(key);
        hasher_input.extend_from_slice(value);

        let mut header = [0u8; RECORD_HEADER_SIZE];
        header[0..4].copy_from_slice(&RECORD_MAGIC);
        header[4..8].copy_from_slice(&(key.len() as u32).to_le_bytes());
        header[8..12].copy_from_slice(&(value.len() as u32).to_le_bytes());
        header[12..16].copy_from_slice(&crc32c::crc32c(&hasher_input).to_le_bytes());

        self.write_raw(&header)?;
        self.write_raw(&hasher_input)?;
        self.records += 1;
        Ok(())
    }

    /// Records written so far
    pub fn records(&self) -> u64 {
        self.records
    }

    /// Write the trailer and flush; `hard` makes the file durable.
    pub fn finish(mut self, hard: bool) -> CasketResult<(u64, u64)> {
        let mut trailer = [0u8; TRAILER_SIZE];
        trailer[0..4].copy_from_slice(&TRAILER_MAGIC);
        trailer[4..12].copy_from_slice(&self.records.to_le_bytes());
        self.write_raw(&trailer)?;

        let path = self.path.clone();
        let file = self
            .out
            .into_inner()
            .map_err(|e| CasketError::io_at(&path, "Snapshot flush failed", e.into_error()))?;
        flush(&file, hard).map_err(|e| CasketError::io_at(&path, "Snapshot sync failed", e))?;
        Ok((self.records, self.bytes))
    }
}

/// Contents of a snapshot file.
#[derive(Debug, Default)]
pub struct Snapshot {
    /// Backend recorded in the header, if any
    pub kind: Option<BackendKind>,
    /// Records in file order
    pub records: Vec<(Vec<u8>, Vec<u8>)>,
    /// Damaged records skipped while repairing
    pub corrupted: usize,
}

fn corrupted(path: &Path, offset: usize, reason: impl Into<String>) -> CasketError {
    CasketError::Corrupted {
        path: path.to_path_buf(),
        offset: offset as u64,
        reason: reason.into(),
    }
}

/// Read a whole snapshot file.
///
/// With `repair`, damaged records are skipped by scanning for the next record
/// magic and a missing trailer is tolerated; without it any damage is an
/// error. A bad file header is always an error.
pub fn read_snapshot(path: &Path, repair: bool) -> CasketResult<Snapshot> {
    let mut file = File::open(path)
        .map_err(|e| CasketError::io_at(path, "Failed to open snapshot file", e))?;
    let mut buffer = Vec::new();
    file.read_to_end(&mut buffer)
        .map_err(|e| CasketError::io_at(path, "Failed to read snapshot file", e))?;

    if buffer.len() < FILE_HEADER_SIZE || buffer[0..4] != SNAPSHOT_MAGIC {
        return Err(corrupted(path, 0, "not a snapshot file"));
    }
    let version = u16::from_le_bytes([buffer[4], buffer[5]]);
    if version != FORMAT_VERSION {
        return Err(corrupted(path, 4, format!("unsupported snapshot version {}", version)));
    }
    let kind = match buffer[6] {
        0 => None,
        byte => Some(
            BackendKind::from_u8(byte)
                .ok_or_else(|| corrupted(path, 6, format!("unknown backend tag {}", byte)))?,
        ),
    };

    let mut snapshot = Snapshot { kind, ..Snapshot::default() };
    let mut offset = FILE_HEADER_SIZE;
    let mut trailer_seen = false;

    while offset < buffer.len() {
        let rest = &buffer[offset..];

        if rest.len() >= TRAILER_SIZE && rest[0..4] == TRAILER_MAGIC {
            let mut count = [0u8; 8];
            count.copy_from_slice(&rest[4..12]);
            let count = u64::from_le_bytes(count);
            let found = (snapshot.records.len() + snapshot.corrupted) as u64;
            if count != found && !repair {
                return Err(corrupted(path, offset, format!("trailer counts {} records, found {}", count, found)));
            }
            trailer_seen = true;
            break;
        }

        let damage = if rest.len() < RECORD_HEADER_SIZE || rest[0..4] != RECORD_MAGIC {
            Some(corrupted(path, offset, "bad record header"))
        } else {
            let key_len = u32::from_le_bytes([rest[4], rest[5], rest[6], rest[7]]) as usize;
            let value_len = u32::from_le_bytes([rest[8], rest[9], rest[10], rest[11]]) as usize;
            let expected = u32::from_le_bytes([rest[12], rest[13], rest[14], rest[15]]);
            let total = RECORD_HEADER_SIZE + key_len + value_len;

            if total > rest.len() {
                Some(CasketError::TornWrite {
                    path: path.to_path_buf(),
                    expected_size: (key_len + value_len) as u32,
                    available_bytes: (rest.len() - RECORD_HEADER_SIZE) as u64,
                    offset: offset as u64,
                })
            } else {
                let body = &rest[RECORD_HEADER_SIZE..total];
                let actual = crc32c::crc32c(body);
                if actual == expected {
                    snapshot.records.push((body[..key_len].to_vec(), body[key_len..].to_vec()));
                    offset += total;
                    None
                } else {
                    Some(CasketError::ChecksumMismatch {
                        path: path.to_path_buf(),
                        expected,
                        actual,
                        offset: offset as u64,
                    })
                }
            }
        };

        if let Some(err) = damage {
            if !repair {
                return Err(err);
            }
            warn!(path = %path.display(), offset, error = %err, "Skipping damaged snapshot record");
            snapshot.corrupted += 1;
            match find_next_marker(&buffer, offset + 1) {
                Some(next) => offset = next,
                None => break,
            }
        }
    }

    if !trailer_seen {
        if !repair {
            return Err(corrupted(path, buffer.len(), "missing snapshot trailer"));
        }
        warn!(path = %path.display(), "Snapshot has no trailer, keeping records read so far");
    }

    Ok(snapshot)
}

/// Next record or trailer magic at or after `start`.
fn find_next_marker(buffer: &[u8], start: usize) -> Option<usize> {
    (start..buffer.len().saturating_sub(3)).find(|&i| {
        let window = &buffer[i..i + 4];
        window == RECORD_MAGIC || window == TRAILER_MAGIC
    })
}
