//! Casket Core: RAM-first record store engine
//!
//! Records live in RAM, in hash buckets or a key-ordered tree. File-backed
//! stores add a write-ahead log for crash safety and a checkpointed data
//! file in the portable snapshot format.
//!
//! # Architecture
//!
//! - **Read path**: served from RAM under a bucket read lock
//! - **Write path**: WAL first, then RAM (crash-safe)
//! - **Checkpoint**: RAM rewritten to the data file by atomic rename, WAL emptied
//! - **Transactions**: undo log of before-images plus WAL batch markers
//!
//! The caller-facing database handle lives in the `casket-db` crate.

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod format;
pub mod platform_durability;
pub mod records;
pub mod snapshot;
pub mod store;
pub mod wal;

// Re-export key types for convenience
pub use config::{Config, ErrorMode};
pub use error::{CasketError, CasketResult, ErrorKind};
pub use format::Operation;
pub use records::BackendKind;
pub use snapshot::{read_snapshot, Snapshot, SnapshotWriter};
pub use store::{Change, Exclusive, Layout, Locking, Store, StoreOptions};
pub use wal::{WalReader, WalWriter};
