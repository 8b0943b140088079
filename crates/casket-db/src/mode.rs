//! Open modes and open-path syntax.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::path::{Path, PathBuf};

use casket_core::store::{Layout, Locking, StoreOptions};
use casket_core::{BackendKind, CasketError, CasketResult};

/// Bit set of open flags, composed with `|`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpenMode(u32);

impl OpenMode {
    /// Open read-only
    pub const READER: Self = Self(1 << 0);
    /// Open for reading and writing
    pub const WRITER: Self = Self(1 << 1);
    /// Create the store if it does not exist
    pub const CREATE: Self = Self(1 << 2);
    /// Discard existing records on open
    pub const TRUNCATE: Self = Self(1 << 3);
    /// Every mutation outside a transaction is durable when it returns
    pub const AUTO_TRANSACTION: Self = Self(1 << 4);
    /// Every logged write is synced to the device
    pub const AUTO_SYNC: Self = Self(1 << 5);
    /// Skip the inter-process file lock
    pub const NO_LOCK: Self = Self(1 << 6);
    /// Fail instead of waiting for the file lock
    pub const TRY_LOCK: Self = Self(1 << 7);
    /// Refuse to open damaged files instead of salvaging them
    pub const NO_REPAIR: Self = Self(1 << 8);

    const NAMES: [(OpenMode, &'static str); 9] = [
        (Self::READER, "READER"),
        (Self::WRITER, "WRITER"),
        (Self::CREATE, "CREATE"),
        (Self::TRUNCATE, "TRUNCATE"),
        (Self::AUTO_TRANSACTION, "AUTO_TRANSACTION"),
        (Self::AUTO_SYNC, "AUTO_SYNC"),
        (Self::NO_LOCK, "NO_LOCK"),
        (Self::TRY_LOCK, "TRY_LOCK"),
        (Self::NO_REPAIR, "NO_REPAIR"),
    ];

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn bits(&self) -> u32 {
        self.0
    }

    /// Whether every flag of `other` is set.
    pub const fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Reject contradictory combinations.
    pub fn validate(&self) -> CasketResult<()> {
        let invalid = |reason: &str| Err(CasketError::InvalidArgs { reason: reason.to_string() });

        if self.contains(Self::READER) && self.contains(Self::CREATE) {
            return invalid("READER cannot be combined with CREATE");
        }
        if !self.contains(Self::READER) && !self.contains(Self::WRITER) {
            return invalid("mode needs READER or WRITER");
        }
        Ok(())
    }

    /// Writer flag wins when both access flags are given.
    pub fn is_writer(&self) -> bool {
        self.contains(Self::WRITER)
    }
}

impl Default for OpenMode {
    fn default() -> Self {
        Self::WRITER | Self::CREATE
    }
}

impl BitOr for OpenMode {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for OpenMode {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for OpenMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = Self::NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "OpenMode({})", names.join(" | "))
    }
}

/// Backend selected by an open path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// `":"` or `"*"`
    MemoryHash,
    /// `"%"` or `"+"`
    MemoryTree,
    /// `*.kch`
    HashFile(PathBuf),
    /// `*.kct`
    TreeFile(PathBuf),
    /// `*.kcd`
    DirHash(PathBuf),
    /// `*.kcf`
    DirTree(PathBuf),
}

impl Target {
    /// Parse an open path. Unknown suffixes are an open failure.
    pub fn parse(path: &str) -> CasketResult<Self> {
        match path {
            ":" | "*" => return Ok(Target::MemoryHash),
            "%" | "+" => return Ok(Target::MemoryTree),
            _ => {}
        }

        let file = PathBuf::from(path);
        let extension = file.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase);
        match extension.as_deref() {
            Some("kch") => Ok(Target::HashFile(file)),
            Some("kct") => Ok(Target::TreeFile(file)),
            Some("kcd") => Ok(Target::DirHash(file)),
            Some("kcf") => Ok(Target::DirTree(file)),
            _ => Err(CasketError::OpenFailed {
                path: file,
                reason: "unknown database type".to_string(),
            }),
        }
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            Target::MemoryHash | Target::HashFile(_) | Target::DirHash(_) => BackendKind::Hash,
            Target::MemoryTree | Target::TreeFile(_) | Target::DirTree(_) => BackendKind::Tree,
        }
    }

    /// Descriptive name reported by `status()`.
    pub fn name(&self) -> &'static str {
        match self {
            Target::MemoryHash => "memory-hash",
            Target::MemoryTree => "memory-tree",
            Target::HashFile(_) => "file-hash",
            Target::TreeFile(_) => "file-tree",
            Target::DirHash(_) => "dir-hash",
            Target::DirTree(_) => "dir-tree",
        }
    }

    pub fn file_path(&self) -> Option<&Path> {
        match self {
            Target::MemoryHash | Target::MemoryTree => None,
            Target::HashFile(p) | Target::TreeFile(p) | Target::DirHash(p) | Target::DirTree(p) => Some(p),
        }
    }

    fn layout(&self) -> Layout {
        match self {
            Target::MemoryHash | Target::MemoryTree => Layout::Memory,
            Target::HashFile(p) | Target::TreeFile(p) => Layout::single_file(p),
            Target::DirHash(p) | Target::DirTree(p) => Layout::directory(p),
        }
    }

    /// Store options for opening this target with `mode`.
    pub fn options(&self, mode: OpenMode) -> StoreOptions {
        let locking = if mode.contains(OpenMode::NO_LOCK) {
            Locking::Disabled
        } else if mode.contains(OpenMode::TRY_LOCK) {
            Locking::Try
        } else {
            Locking::Blocking
        };
        StoreOptions {
            kind: self.kind(),
            layout: self.layout(),
            writable: mode.is_writer(),
            create: mode.contains(OpenMode::CREATE),
            truncate: mode.contains(OpenMode::TRUNCATE),
            auto_sync: mode.contains(OpenMode::AUTO_SYNC),
            auto_transaction: mode.contains(OpenMode::AUTO_TRANSACTION),
            locking,
            repair: !mode.contains(OpenMode::NO_REPAIR),
        }
    }
}
