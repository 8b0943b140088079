//! Configuration for Casket stores
//!
//! `Config` carries the construction-time settings of a store: size limits,
//! WAL housekeeping thresholds, bucket striping, and the two global mode
//! switches (concurrent locking and the error reporting mode).

use crate::error::{CasketError, CasketResult};

/// How a database handle reports failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorMode {
    /// Failures are returned and also kept as the handle's last error,
    /// so callers may check only success and query the code afterwards.
    #[default]
    Status,
    /// Failures travel only in the returned error; serious ones are logged.
    Exceptional,
}

/// Casket store configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum key size in bytes
    pub max_key_size: usize,
    /// Maximum value size in bytes
    pub max_value_size: usize,
    /// WAL file rotation threshold (bytes)
    pub wal_rotation_size_bytes: u64,
    /// Checkpoint trigger: rewrite the data file once the WAL grows past this
    pub checkpoint_wal_bytes: u64,
    /// Number of independently locked buckets for hash stores
    pub hash_buckets: usize,
    /// Relaxed locking: lock-free reads, no whole-store traversal
    pub concurrent: bool,
    /// Failure reporting mode
    pub error_mode: ErrorMode,
}

impl Config {
    /// Defaults suitable for most embedded uses.
    pub fn new() -> Self {
        Self {
            max_key_size: 64 * 1024,
            max_value_size: 32 * 1024 * 1024,
            wal_rotation_size_bytes: 64 * 1024 * 1024,
            checkpoint_wal_bytes: 256 * 1024 * 1024,
            hash_buckets: 16,
            concurrent: false,
            error_mode: ErrorMode::Status,
        }
    }

    /// Enable or disable concurrent mode.
    pub fn with_concurrent(mut self, concurrent: bool) -> Self {
        self.concurrent = concurrent;
        self
    }

    /// Select the error reporting mode.
    pub fn with_error_mode(mut self, mode: ErrorMode) -> Self {
        self.error_mode = mode;
        self
    }

    /// Shorthand for `with_error_mode(ErrorMode::Exceptional)`.
    pub fn exceptional(self) -> Self {
        self.with_error_mode(ErrorMode::Exceptional)
    }

    pub fn with_hash_buckets(mut self, buckets: usize) -> Self {
        self.hash_buckets = buckets;
        self
    }

    pub fn with_checkpoint_wal_bytes(mut self, bytes: u64) -> Self {
        self.checkpoint_wal_bytes = bytes;
        self
    }

    pub fn with_max_key_size(mut self, bytes: usize) -> Self {
        self.max_key_size = bytes;
        self
    }

    pub fn with_max_value_size(mut self, bytes: usize) -> Self {
        self.max_value_size = bytes;
        self
    }

    /// Validate all configuration parameters
    pub fn validate(&self) -> CasketResult<()> {
        let invalid = |reason: &str| Err(CasketError::InvalidArgs { reason: reason.to_string() });

        if self.max_key_size == 0 || self.max_key_size > 1024 * 1024 {
            return invalid("max_key_size must be in [1, 1MB]");
        }
        if self.max_value_size == 0 || self.max_value_size > 1024 * 1024 * 1024 {
            return invalid("max_value_size must be in [1, 1GB]");
        }
        if self.wal_rotation_size_bytes < 64 * 1024 {
            return invalid("wal_rotation_size_bytes must be >= 64KB");
        }
        if self.checkpoint_wal_bytes == 0 {
            return invalid("checkpoint_wal_bytes must be > 0");
        }
        if self.hash_buckets == 0 || self.hash_buckets > 4096 {
            return invalid("hash_buckets must be in [1, 4096]");
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self { Self::new() }
}
