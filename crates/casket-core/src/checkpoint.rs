//! Checkpoint: replace a snapshot file atomically
//!
//! Uses the atomic rename pattern for crash safety:
//! 1. Write the new snapshot to `<file>.tmp`
//! 2. durable_sync the temp file
//! 3. Rename temp file over the target (atomic on POSIX)
//! 4. durable_sync the parent directory
//!
//! If the process crashes at any point:
//! - Before rename: the previous file is intact, the temp file is orphaned
//! - After rename: the new file is complete
//!
//! Only after this returns may the caller drop the WAL it folded in.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{CasketError, CasketResult};
use crate::platform_durability::sync_directory;
use crate::records::BackendKind;
use crate::snapshot::SnapshotWriter;

/// Result of a checkpoint.
#[derive(Debug)]
pub struct CheckpointResult {
    /// File that now holds the records
    pub file_path: PathBuf,
    /// Number of records written
    pub records: u64,
    /// File size in bytes
    pub bytes: u64,
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(OsString::from).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Write a snapshot to `path` through a temp file and rename it into place.
///
/// `fill` streams the records into the writer.
pub fn write_checkpoint<F>(path: &Path, kind: Option<BackendKind>, fill: F) -> CasketResult<CheckpointResult>
where
    F: FnOnce(&mut SnapshotWriter) -> CasketResult<()>,
{
    let tmp = temp_path(path);

    let mut writer = SnapshotWriter::create(&tmp, kind)?;
    if let Err(e) = fill(&mut writer) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    let (records, bytes) = writer.finish(true)?;

    fs::rename(&tmp, path)
        .map_err(|e| CasketError::io_at(path, "Failed to rename checkpoint file", e))?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        sync_directory(parent)
            .map_err(|e| CasketError::io_at(parent, "Failed to sync directory after checkpoint", e))?;
    }

    Ok(CheckpointResult { file_path: path.to_path_buf(), records, bytes })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::read_snapshot;
    use tempfile::TempDir;

    #[test]
    fn test_checkpoint_replaces_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("store.kch");

        let first = write_checkpoint(&path, Some(BackendKind::Hash), |w| {
            w.write_record(b"a", b"1")?;
            w.write_record(b"b", b"2")
        })
        .unwrap();
        assert_eq!(first.records, 2);

        let second = write_checkpoint(&path, Some(BackendKind::Hash), |w| w.write_record(b"c", b"3")).unwrap();
        assert_eq!(second.records, 1);
        assert_eq!(second.bytes, std::fs::metadata(&path).unwrap().len());

        let snapshot = read_snapshot(&path, false).unwrap();
        assert_eq!(snapshot.records, vec![(b"c".to_vec(), b"3".to_vec())]);
        assert!(!temp_path(&path).exists());
    }

    #[test]
    fn test_failed_fill_keeps_previous_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("store.kct");

        write_checkpoint(&path, None, |w| w.write_record(b"keep", b"me")).unwrap();
        let result = write_checkpoint(&path, None, |w| {
            w.write_record(b"lost", b"")?;
            Err(CasketError::Misc { reason: "stop".to_string() })
        });
        assert!(result.is_err());

        let snapshot = read_snapshot(&path, false).unwrap();
        assert_eq!(snapshot.records[0].0, b"keep");
        assert!(!temp_path(&path).exists());
    }

    #[test]
    fn test_temp_path_appends_suffix() {
        assert_eq!(temp_path(Path::new("/x/records.csn")), PathBuf::from("/x/records.csn.tmp"));
    }
}
