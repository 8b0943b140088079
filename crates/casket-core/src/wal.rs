//! Write-Ahead Log for file-backed stores
//!
//! Every mutation is appended here before it touches the in-memory record
//! maps, so a crash never leaves RAM ahead of the log:
//! 1. Serialize entry to buffer (CRC32C over the payload)
//! 2. Append buffer to the current WAL file
//! 3. Optionally durable_sync (AutoSync, hard commits)
//! 4. Return; only then does the caller update RAM
//!
//! Entries between `Begin` and `Commit` form a batch that recovery applies
//! all-or-nothing. The log is emptied by a checkpoint once its contents are
//! folded into the data file.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{CasketError, CasketResult};
use crate::format::{deserialize_entry, serialize_entry, Operation, WalEntry, ENTRY_HEADER_SIZE, WAL_MAGIC};
use crate::platform_durability::durable_sync;

const WAL_PREFIX: &str = "wal-";
const WAL_SUFFIX: &str = ".log";

fn wal_file_name(sequence: u64) -> String {
    format!("{}{:016x}{}", WAL_PREFIX, sequence, WAL_SUFFIX)
}

fn parse_sequence(name: &str) -> Option<u64> {
    let hex = name.strip_prefix(WAL_PREFIX)?.strip_suffix(WAL_SUFFIX)?;
    u64::from_str_radix(hex, 16).ok()
}

/// WAL files in `wal_dir`, sorted by sequence.
pub fn list_wal_files(wal_dir: &Path) -> CasketResult<Vec<(u64, PathBuf)>> {
    let mut files = Vec::new();
    let dir_entries = match std::fs::read_dir(wal_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(files),
        Err(e) => return Err(CasketError::io_at(wal_dir, "Failed to read WAL directory", e)),
    };

    for entry in dir_entries {
        let entry = entry.map_err(|e| CasketError::io_at(wal_dir, "Failed to read directory entry", e))?;
        let path = entry.path();
        if let Some(seq) = path.file_name().and_then(|n| n.to_str()).and_then(parse_sequence) {
            files.push((seq, path));
        }
    }

    files.sort_by_key(|(seq, _)| *seq);
    Ok(files)
}

/// WAL writer: appends entries and rotates files.
pub struct WalWriter {
    /// Current WAL file handle
    file: File,
    /// Path to current WAL file (for error context)
    path: PathBuf,
    /// Current file size in bytes
    size: u64,
    /// Bytes in all live WAL files since the last reset
    total_size: u64,
    /// WAL directory for file rotation
    wal_dir: PathBuf,
    /// Monotonic sequence number for WAL file naming
    sequence: u64,
    /// Rotation threshold
    rotation_size: u64,
}

impl WalWriter {
    /// Open a writer in `wal_dir`, appending to the highest existing file.
    pub fn new<P: AsRef<Path>>(wal_dir: P, rotation_size: u64) -> CasketResult<Self> {
        let wal_dir = wal_dir.as_ref().to_path_buf();

        std::fs::create_dir_all(&wal_dir)
            .map_err(|e| CasketError::io_at(&wal_dir, "Failed to create WAL directory", e))?;

        let existing = list_wal_files(&wal_dir)?;
        let mut total_size = 0u64;
        for (_, path) in &existing {
            total_size += std::fs::metadata(path)
                .map_err(|e| CasketError::io_at(path, "Failed to stat WAL file", e))?
                .len();
        }
        let sequence = existing.last().map(|(seq, _)| *seq).unwrap_or(0);
        let (file, path, size) = Self::open_segment(&wal_dir, sequence)?;

        Ok(Self { file, path, size, total_size, wal_dir, sequence, rotation_size })
    }

    fn open_segment(wal_dir: &Path, sequence: u64) -> CasketResult<(File, PathBuf, u64)> {
        let path = wal_dir.join(wal_file_name(sequence));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| CasketError::io_at(&path, "Failed to open WAL file", e))?;
        let size = file
            .metadata()
            .map_err(|e| CasketError::io_at(&path, "Failed to stat WAL file", e))?
            .len();
        Ok((file, path, size))
    }

    /// Append one entry; `durable` forces it to stable storage before returning.
    pub fn append(&mut self, key: &[u8], value: &[u8], op: Operation, durable: bool) -> CasketResult<()> {
        let entry_bytes = serialize_entry(key, value, op)?;

        // Batches may straddle a rotation; recovery reads files in sequence order.
        if self.size > 0 && self.size + entry_bytes.len() as u64 > self.rotation_size {
            self.rotate()?;
        }

        self.file
            .write_all(&entry_bytes)
            .map_err(|e| CasketError::io_at(&self.path, "WAL write failed", e))?;

        self.size += entry_bytes.len() as u64;
        self.total_size += entry_bytes.len() as u64;

        if durable {
            self.sync()?;
        }
        Ok(())
    }

    /// Append a batch marker.
    pub fn mark(&mut self, op: Operation, durable: bool) -> CasketResult<()> {
        debug_assert!(op.is_marker());
        self.append(&[], &[], op, durable)
    }

    fn rotate(&mut self) -> CasketResult<()> {
        self.sync()?;

        self.sequence += 1;
        let (file, path, size) = Self::open_segment(&self.wal_dir, self.sequence)?;
        debug!(path = %path.display(), "WAL rotated");

        self.file = file;
        self.path = path;
        self.size = size;
        Ok(())
    }

    /// Drop every WAL file and start an empty one.
    ///
    /// Only valid after the log's contents have been made durable elsewhere.
    pub fn reset(&mut self) -> CasketResult<()> {
        let old = list_wal_files(&self.wal_dir)?;

        self.sequence += 1;
        let (file, path, size) = Self::open_segment(&self.wal_dir, self.sequence)?;
        self.file = file;
        self.path = path;
        self.size = size;
        self.total_size = size;

        for (seq, path) in old {
            if seq == self.sequence {
                continue;
            }
            std::fs::remove_file(&path)
                .map_err(|e| CasketError::io_at(&path, "Failed to remove WAL file", e))?;
        }
        Ok(())
    }

    /// Sync the current WAL file without writing an entry.
    pub fn sync(&self) -> CasketResult<()> {
        durable_sync(&self.file).map_err(|e| CasketError::io_at(&self.path, "WAL sync failed", e))
    }

    /// Current WAL file path
    pub fn current_path(&self) -> &Path {
        &self.path
    }

    /// Bytes logged since the last reset
    pub fn total_size(&self) -> u64 {
        self.total_size
    }
}

/// Outcome of WAL recovery.
#[derive(Debug, Default)]
pub struct Recovery {
    /// Committed record operations (Put, Delete, Clear) in log order
    pub entries: Vec<WalEntry>,
    /// Corrupted entries skipped by magic resync
    pub corrupted: usize,
    /// A partial entry was found at the end of a file
    pub torn: bool,
    /// Batches dropped because they were aborted or never committed
    pub discarded_batches: usize,
}

impl Recovery {
    /// Whether anything had to be thrown away to make the log readable.
    pub fn salvaged(&self) -> bool {
        self.corrupted > 0
    }
}

/// WAL reader: replays entries for recovery.
pub struct WalReader {
    wal_dir: PathBuf,
}

impl WalReader {
    pub fn new<P: AsRef<Path>>(wal_dir: P) -> Self {
        Self { wal_dir: wal_dir.as_ref().to_path_buf() }
    }

    /// Recover committed operations from all WAL files in sequence order.
    ///
    /// Per file: validate magic, check length against the remaining bytes,
    /// verify CRC32C; resync on the next magic after corruption; stop at a
    /// torn tail. Entries inside a `Begin`..`Commit` batch are held back
    /// until the commit is seen.
    pub fn recover(&self) -> CasketResult<Recovery> {
        let mut recovery = Recovery::default();
        let mut batch: Option<Vec<WalEntry>> = None;

        for (_, wal_path) in list_wal_files(&self.wal_dir)? {
            for entry in self.read_file(&wal_path, &mut recovery)? {
                match entry.operation {
                    Operation::Begin => {
                        if batch.replace(Vec::new()).is_some() {
                            recovery.discarded_batches += 1;
                        }
                    }
                    Operation::Commit => {
                        if let Some(ops) = batch.take() {
                            recovery.entries.extend(ops);
                        }
                    }
                    Operation::Abort => {
                        if batch.take().is_some() {
                            recovery.discarded_batches += 1;
                        }
                    }
                    _ => match batch.as_mut() {
                        Some(ops) => ops.push(entry),
                        None => recovery.entries.push(entry),
                    },
                }
            }
        }

        if batch.is_some() {
            warn!(wal_dir = %self.wal_dir.display(), "Discarding uncommitted WAL batch");
            recovery.discarded_batches += 1;
        }

        Ok(recovery)
    }

    fn read_file(&self, path: &Path, recovery: &mut Recovery) -> CasketResult<Vec<WalEntry>> {
        let mut file = File::open(path)
            .map_err(|e| CasketError::io_at(path, "Failed to open WAL file for recovery", e))?;

        let mut buffer = Vec::new();
        file.read_to_end(&mut buffer)
            .map_err(|e| CasketError::io_at(path, "Failed to read WAL file", e))?;

        let mut entries = Vec::new();
        let mut offset = 0;

        while offset + ENTRY_HEADER_SIZE <= buffer.len() {
            if buffer[offset..offset + 4] != WAL_MAGIC {
                warn!(path = %path.display(), offset, "Bad WAL magic, scanning for next entry");
                recovery.corrupted += 1;
                match find_next_magic(&buffer, offset + 1) {
                    Some(next) => { offset = next; continue; }
                    None => break,
                }
            }

            let length = u32::from_le_bytes([
                buffer[offset + 4], buffer[offset + 5],
                buffer[offset + 6], buffer[offset + 7],
            ]) as usize;
            let total_entry_size = ENTRY_HEADER_SIZE + length;

            if offset + total_entry_size > buffer.len() {
                warn!(
                    path = %path.display(),
                    offset,
                    needed = total_entry_size,
                    available = buffer.len() - offset,
                    "Torn WAL write"
                );
                recovery.torn = true;
                break;
            }

            match deserialize_entry(&buffer[offset..offset + total_entry_size]) {
                Ok(entry) => {
                    entries.push(entry);
                    offset += total_entry_size;
                }
                Err(e) => {
                    warn!(path = %path.display(), offset, error = %e, "Corrupt WAL entry");
                    recovery.corrupted += 1;
                    match find_next_magic(&buffer, offset + 1) {
                        Some(next) => { offset = next; continue; }
                        None => break,
                    }
                }
            }
        }

        if offset < buffer.len() && offset + ENTRY_HEADER_SIZE > buffer.len() && !recovery.torn {
            recovery.torn = true;
        }

        Ok(entries)
    }
}

/// Scan forward in buffer to find the next WAL magic.
fn find_next_magic(buffer: &[u8], start: usize) -> Option<usize> {
    (start..buffer.len().saturating_sub(3)).find(|&i| buffer[i..i + 4] == WAL_MAGIC)
}
