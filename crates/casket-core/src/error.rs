//! Error types for Casket operations
//!
//! Every failure is a `CasketError` variant carrying enough context to debug
//! it. Callers that only care about the class of failure use
//! [`CasketError::kind`], which collapses the variants onto the small set of
//! error codes a database handle reports.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Classes of failure reported by a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed arguments (bad mode bits, oversized keys, bad patterns)
    InvalidArgs,
    /// The store could not be opened
    OpenFailed,
    /// Operation not allowed in the current state (closed handle, disabled cursor)
    InvalidState,
    /// Mutation attempted through a reader handle
    NoPermission,
    /// Record does not exist
    NotFound,
    /// Record already exists
    DuplicateRecord,
    /// Logical inconsistency (failed compare-and-swap, malformed numeric value)
    Logic,
    /// Operation not supported by the chosen backend
    Unimplemented,
    /// Underlying storage failure
    Io,
    /// Persistent data is corrupted
    Broken,
    /// Anything else
    Misc,
}

impl ErrorKind {
    /// Stable short code name of the kind.
    pub fn name(&self) -> &'static str {
        match self {
            ErrorKind::InvalidArgs => "INVALID",
            ErrorKind::OpenFailed => "NOREPOS",
            ErrorKind::InvalidState => "BADSTATE",
            ErrorKind::NoPermission => "NOPERM",
            ErrorKind::NotFound => "NOREC",
            ErrorKind::DuplicateRecord => "DUPREC",
            ErrorKind::Logic => "LOGIC",
            ErrorKind::Unimplemented => "NOIMPL",
            ErrorKind::Io => "SYSTEM",
            ErrorKind::Broken => "BROKEN",
            ErrorKind::Misc => "MISC",
        }
    }

    /// Expected conditions a caller routinely handles; the store stays usable.
    pub fn is_expected(&self) -> bool {
        matches!(self, ErrorKind::NotFound | ErrorKind::DuplicateRecord | ErrorKind::Logic)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Casket error types with detailed context
#[derive(Debug, Clone, Error)]
pub enum CasketError {
    /// Arguments rejected before touching the store
    #[error("Invalid arguments: {reason}")]
    InvalidArgs {
        /// Why the arguments were rejected
        reason: String,
    },

    /// The store could not be opened at the given path
    #[error("Failed to open {}: {reason}", .path.display())]
    OpenFailed {
        /// Path passed to open
        path: PathBuf,
        /// Description of the failure
        reason: String,
    },

    /// Operation invalid in the current state
    #[error("Invalid state: {reason}")]
    InvalidState {
        /// Description of the offending state
        reason: String,
    },

    /// Write attempted on a read-only handle
    #[error("Permission denied: {operation} requires a writer handle")]
    NoPermission {
        /// Operation that was refused
        operation: &'static str,
    },

    /// Record not present
    #[error("No record found: {operation}")]
    NotFound {
        /// Operation that looked for the record
        operation: &'static str,
    },

    /// Record already present
    #[error("Record already exists: {operation}")]
    DuplicateRecord {
        /// Operation that refused to overwrite
        operation: &'static str,
    },

    /// Logical failure: compare-and-swap mismatch, non-numeric increment target
    #[error("Logic error: {reason}")]
    Logic {
        /// Description of the inconsistency
        reason: String,
    },

    /// Backend does not support the operation
    #[error("{operation} is not supported by the {backend} backend")]
    Unimplemented {
        /// Operation that was attempted
        operation: &'static str,
        /// Backend name
        backend: &'static str,
    },

    /// I/O operation failed
    #[error("I/O error{}: {message} ({kind})", .path.as_ref().map(|p| format!(" in {}", p.display())).unwrap_or_default())]
    Io {
        /// The file path where the error occurred
        path: Option<PathBuf>,
        /// The underlying I/O error kind
        kind: std::io::ErrorKind,
        /// Human-readable description
        message: String,
    },

    /// Log or snapshot file is corrupted and cannot be used
    #[error("Corrupted data in {} at offset {offset}: {reason}", .path.display())]
    Corrupted {
        /// Path to the corrupted file
        path: PathBuf,
        /// Byte offset where corruption was detected
        offset: u64,
        /// Description of the corruption
        reason: String,
    },

    /// Checksum verification failed
    #[error("Checksum mismatch in {} at offset {offset}: expected 0x{expected:08x}, got 0x{actual:08x}", .path.display())]
    ChecksumMismatch {
        /// File where checksum failed
        path: PathBuf,
        /// Expected checksum value
        expected: u32,
        /// Actual checksum computed
        actual: u32,
        /// Byte offset of the corrupted data
        offset: u64,
    },

    /// Torn write detected (partial write at end of file)
    #[error("Torn write in {} at offset {offset}: expected {expected_size} bytes, only {available_bytes} available", .path.display())]
    TornWrite {
        /// File with torn write
        path: PathBuf,
        /// Expected entry size
        expected_size: u32,
        /// Actual bytes available
        available_bytes: u64,
        /// Offset where torn write begins
        offset: u64,
    },

    /// Magic bytes not found at expected location
    #[error("Magic bytes not found in {} at offset {offset}: found {}", .path.display(), hex4(.found_bytes))]
    NoMagicFound {
        /// File being read
        path: PathBuf,
        /// Offset where magic was expected
        offset: u64,
        /// Bytes actually found
        found_bytes: [u8; 4],
    },

    /// Entry size exceeds maximum allowed
    #[error("Entry {component} too large: {entry_size} bytes exceeds limit of {max_size} bytes")]
    OversizedEntry {
        /// Size of the oversized entry
        entry_size: u64,
        /// Maximum allowed size
        max_size: u64,
        /// Whether it's the key or value that's oversized
        component: &'static str,
    },

    /// Catch-all
    #[error("{reason}")]
    Misc {
        /// Description
        reason: String,
    },
}

fn hex4(bytes: &[u8; 4]) -> String {
    format!("{:02x}{:02x}{:02x}{:02x}", bytes[0], bytes[1], bytes[2], bytes[3])
}

impl CasketError {
    /// Class of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CasketError::InvalidArgs { .. } | CasketError::OversizedEntry { .. } => ErrorKind::InvalidArgs,
            CasketError::OpenFailed { .. } => ErrorKind::OpenFailed,
            CasketError::InvalidState { .. } => ErrorKind::InvalidState,
            CasketError::NoPermission { .. } => ErrorKind::NoPermission,
            CasketError::NotFound { .. } => ErrorKind::NotFound,
            CasketError::DuplicateRecord { .. } => ErrorKind::DuplicateRecord,
            CasketError::Logic { .. } => ErrorKind::Logic,
            CasketError::Unimplemented { .. } => ErrorKind::Unimplemented,
            CasketError::Io { .. } => ErrorKind::Io,
            CasketError::Corrupted { .. }
            | CasketError::ChecksumMismatch { .. }
            | CasketError::TornWrite { .. }
            | CasketError::NoMagicFound { .. } => ErrorKind::Broken,
            CasketError::Misc { .. } => ErrorKind::Misc,
        }
    }

    /// I/O error annotated with the file it happened on.
    pub fn io_at(path: &std::path::Path, context: &str, err: std::io::Error) -> Self {
        CasketError::Io {
            path: Some(path.to_path_buf()),
            kind: err.kind(),
            message: format!("{}: {}", context, err),
        }
    }

    pub fn invalid_state(reason: impl Into<String>) -> Self {
        CasketError::InvalidState { reason: reason.into() }
    }

    pub fn logic(reason: impl Into<String>) -> Self {
        CasketError::Logic { reason: reason.into() }
    }
}

/// Convert std::io::Error to CasketError::Io
impl From<std::io::Error> for CasketError {
    fn from(err: std::io::Error) -> Self {
        CasketError::Io {
            path: None,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Result type alias for Casket operations
pub type CasketResult<T> = Result<T, CasketError>;
