//! Record store engine
//!
//! `Store` keeps every record in RAM and, for file-backed stores, journals
//! each mutation to the WAL before applying it:
//!
//! **Read path**: bucket read lock, straight from RAM
//! **Write path**: bucket write lock, undo image (inside a transaction), WAL, RAM
//! **Checkpoint**: rewrite the data file from RAM, then empty the WAL
//!
//! Locking: a store-wide `structure` lock is shared by point operations and
//! taken exclusively by whole-store operations (see [`Exclusive`]). Locks are
//! always acquired in the order structure, bucket, undo, WAL.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

use crate::checkpoint::{write_checkpoint, CheckpointResult};
use crate::config::Config;
use crate::error::{CasketError, CasketResult, ErrorKind};
use crate::format::{check_sizes, Operation};
use crate::platform_durability::{lock_file, LockMode};
use crate::records::{bucket_index, BackendKind, RecordMap};
use crate::snapshot::read_snapshot;
use crate::wal::{list_wal_files, WalReader, WalWriter};

/// Where a file-backed store keeps its files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileLayout {
    /// Checkpointed records in the snapshot format
    pub data_file: PathBuf,
    /// WAL segments
    pub wal_dir: PathBuf,
    /// Advisory lock file
    pub lock_file: PathBuf,
    /// Root directory for directory stores
    pub root: Option<PathBuf>,
}

/// Persistence of a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Layout {
    /// Volatile, nothing on disk
    Memory,
    /// Data file plus WAL
    File(FileLayout),
}

impl Layout {
    /// A single data file at `path` with its WAL in `<path>.wal/`.
    pub fn single_file(path: &Path) -> Self {
        let mut wal = path.as_os_str().to_owned();
        wal.push(".wal");
        let wal_dir = PathBuf::from(wal);
        Layout::File(FileLayout {
            data_file: path.to_path_buf(),
            lock_file: wal_dir.join("LOCK"),
            wal_dir,
            root: None,
        })
    }

    /// A directory at `path` holding the data file, the WAL and the lock.
    pub fn directory(path: &Path) -> Self {
        Layout::File(FileLayout {
            data_file: path.join("records.csn"),
            wal_dir: path.join("wal"),
            lock_file: path.join("LOCK"),
            root: Some(path.to_path_buf()),
        })
    }
}

impl FileLayout {
    fn exists(&self) -> CasketResult<bool> {
        match &self.root {
            Some(root) => Ok(root.is_dir()),
            None => Ok(self.data_file.exists() || !list_wal_files(&self.wal_dir)?.is_empty()),
        }
    }
}

/// Inter-process locking policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Locking {
    /// Wait for a conflicting lock to be released
    #[default]
    Blocking,
    /// Fail the open instead of waiting
    Try,
    /// Take no lock at all
    Disabled,
}

/// How to open a store.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub kind: BackendKind,
    pub layout: Layout,
    pub writable: bool,
    pub create: bool,
    pub truncate: bool,
    /// Every WAL append reaches stable storage
    pub auto_sync: bool,
    /// Every mutation outside a transaction is durable on return
    pub auto_transaction: bool,
    pub locking: Locking,
    /// Salvage damaged data files instead of refusing to open
    pub repair: bool,
}

impl StoreOptions {
    /// Writable in-memory store.
    pub fn memory(kind: BackendKind) -> Self {
        Self {
            kind,
            layout: Layout::Memory,
            writable: true,
            create: true,
            truncate: false,
            auto_sync: false,
            auto_transaction: false,
            locking: Locking::Disabled,
            repair: true,
        }
    }

    /// Writable file store at `layout`, created if absent.
    pub fn file(kind: BackendKind, layout: Layout) -> Self {
        Self { layout, locking: Locking::Blocking, ..Self::memory(kind) }
    }
}

/// What an [`Store::update`] callback wants done with the record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    /// Leave the record as it is
    Keep,
    /// Delete the record (no-op when absent)
    Remove,
    /// Store this value
    Put(Vec<u8>),
}

struct Journal {
    layout: FileLayout,
    /// None for read-only handles
    wal: Option<Mutex<WalWriter>>,
    auto_sync: bool,
    auto_transaction: bool,
    _lock: Option<File>,
}

impl Journal {
    fn append(&self, key: &[u8], value: &[u8], op: Operation, deferred: bool) -> CasketResult<()> {
        let wal = self.wal.as_ref().ok_or(CasketError::NoPermission { operation: "write" })?;
        let durable = self.auto_sync || (self.auto_transaction && !deferred);
        wal.lock().append(key, value, op, durable)
    }

    fn mark(&self, op: Operation, durable: bool) -> CasketResult<()> {
        match &self.wal {
            Some(wal) => wal.lock().mark(op, durable || self.auto_sync),
            None => Ok(()),
        }
    }
}

/// Before-images of every record touched since a transaction or batch began.
struct UndoLog {
    hard: bool,
    before: HashMap<Vec<u8>, Option<Vec<u8>>>,
}

impl UndoLog {
    fn record(&mut self, key: &[u8], before: Option<&[u8]>) {
        if !self.before.contains_key(key) {
            self.before.insert(key.to_vec(), before.map(<[u8]>::to_vec));
        }
    }
}

/// RAM-first record store with optional WAL-backed persistence.
///
/// All methods take `&self`; the store is shared between threads.
pub struct Store {
    kind: BackendKind,
    config: Config,
    writable: bool,
    structure: RwLock<()>,
    buckets: Vec<RwLock<RecordMap>>,
    count: AtomicU64,
    size: AtomicU64,
    journal: Option<Journal>,
    undo: Mutex<Option<UndoLog>>,
    batch: Mutex<Option<UndoLog>>,
}

impl Store {
    /// Open or create a store.
    ///
    /// File stores load the checkpointed data file, replay committed WAL
    /// batches on top and, when anything was replayed, checkpoint again.
    pub fn open(options: StoreOptions, config: Config) -> CasketResult<Self> {
        config.validate()?;

        let bucket_count = match options.kind {
            BackendKind::Hash => config.hash_buckets,
            BackendKind::Tree => 1,
        };
        let mut store = Self {
            kind: options.kind,
            writable: options.writable,
            structure: RwLock::new(()),
            buckets: (0..bucket_count).map(|_| RwLock::new(RecordMap::new(options.kind))).collect(),
            count: AtomicU64::new(0),
            size: AtomicU64::new(0),
            journal: None,
            undo: Mutex::new(None),
            batch: Mutex::new(None),
            config,
        };

        if let Layout::File(layout) = &options.layout {
            let path = layout.data_file.clone();
            let as_open_failure = |e: CasketError| match e.kind() {
                ErrorKind::Io | ErrorKind::Broken => CasketError::OpenFailed {
                    path: path.clone(),
                    reason: e.to_string(),
                },
                _ => e,
            };

            let (journal, dirty) = store.attach(layout, &options).map_err(as_open_failure)?;
            store.journal = Some(journal);
            if dirty {
                store.checkpoint_unlocked().map_err(as_open_failure)?;
            }
        }

        Ok(store)
    }

    /// Load persisted state; returns the journal and whether a checkpoint is due.
    fn attach(&self, layout: &FileLayout, options: &StoreOptions) -> CasketResult<(Journal, bool)> {
        if !layout.exists()? && !options.create {
            return Err(CasketError::OpenFailed {
                path: layout.data_file.clone(),
                reason: "no such store".to_string(),
            });
        }

        if options.writable {
            if let Some(root) = &layout.root {
                std::fs::create_dir_all(root)
                    .map_err(|e| CasketError::io_at(root, "Failed to create store directory", e))?;
            }
            std::fs::create_dir_all(&layout.wal_dir)
                .map_err(|e| CasketError::io_at(&layout.wal_dir, "Failed to create WAL directory", e))?;
        }

        let lock = acquire_lock(layout, options)?;

        if options.truncate && options.writable {
            if layout.data_file.exists() {
                std::fs::remove_file(&layout.data_file)
                    .map_err(|e| CasketError::io_at(&layout.data_file, "Failed to truncate data file", e))?;
            }
            for (_, path) in list_wal_files(&layout.wal_dir)? {
                std::fs::remove_file(&path)
                    .map_err(|e| CasketError::io_at(&path, "Failed to truncate WAL file", e))?;
            }
        }

        let mut dirty = false;
        if layout.data_file.exists() {
            let snapshot = read_snapshot(&layout.data_file, options.repair)?;
            if let Some(kind) = snapshot.kind.filter(|k| *k != self.kind) {
                return Err(CasketError::OpenFailed {
                    path: layout.data_file.clone(),
                    reason: format!("file holds a {} store, not {}", kind.name(), self.kind.name()),
                });
            }
            dirty |= snapshot.corrupted > 0;
            for (key, value) in snapshot.records {
                let mut map = self.bucket(&key).write();
                self.apply(&mut map, &key, Some(value));
            }
        }

        let mut recovery = WalReader::new(&layout.wal_dir).recover()?;
        if recovery.salvaged() && !options.repair {
            return Err(CasketError::Corrupted {
                path: layout.wal_dir.clone(),
                offset: 0,
                reason: format!("{} corrupted WAL entries", recovery.corrupted),
            });
        }
        let entries = std::mem::take(&mut recovery.entries);
        let replayed = entries.len();
        for entry in entries {
            match entry.operation {
                Operation::Put => {
                    let mut map = self.bucket(&entry.key).write();
                    self.apply(&mut map, &entry.key, Some(entry.value));
                }
                Operation::Delete => {
                    let mut map = self.bucket(&entry.key).write();
                    self.apply(&mut map, &entry.key, None);
                }
                Operation::Clear => self.clear_maps(),
                _ => {}
            }
        }
        dirty |= replayed > 0 || recovery.salvaged() || recovery.torn || recovery.discarded_batches > 0;

        if recovery.salvaged() || recovery.torn {
            warn!(
                wal_dir = %layout.wal_dir.display(),
                corrupted = recovery.corrupted,
                torn = recovery.torn,
                "WAL recovered with damage"
            );
        }

        let wal = if options.writable {
            Some(Mutex::new(WalWriter::new(&layout.wal_dir, self.config.wal_rotation_size_bytes)?))
        } else {
            None
        };

        info!(
            path = %layout.data_file.display(),
            backend = self.kind.name(),
            records = self.count(),
            replayed,
            "Store opened"
        );

        let journal = Journal {
            layout: layout.clone(),
            auto_sync: options.auto_sync,
            auto_transaction: options.auto_transaction,
            _lock: lock,
            wal,
        };
        Ok((journal, dirty && options.writable))
    }

    fn bucket(&self, key: &[u8]) -> &RwLock<RecordMap> {
        &self.buckets[bucket_index(key, self.buckets.len())]
    }

    /// Structure lock for read-only point operations; skipped in concurrent mode.
    fn read_guard(&self) -> Option<RwLockReadGuard<'_, ()>> {
        if self.config.concurrent {
            None
        } else {
            Some(self.structure.read())
        }
    }

    fn check_writable(&self) -> CasketResult<()> {
        if self.writable {
            Ok(())
        } else {
            Err(CasketError::NoPermission { operation: "update" })
        }
    }

    /// Apply a change to RAM and the counters. Overwrites leave `count`
    /// untouched; `size` moves by one signed delta.
    fn apply(&self, map: &mut RecordMap, key: &[u8], value: Option<Vec<u8>>) {
        let present = value.is_some();
        let added = value.as_ref().map_or(0, |v| (key.len() + v.len()) as u64);
        let old = match value {
            Some(value) => map.insert(key.to_vec(), value),
            None => map.remove(key),
        };
        let removed = old.as_ref().map_or(0, |v| (key.len() + v.len()) as u64);
        if added >= removed {
            self.size.fetch_add(added - removed, Ordering::Relaxed);
        } else {
            self.size.fetch_sub(removed - added, Ordering::Relaxed);
        }
        match (present, old.is_some()) {
            (true, false) => {
                self.count.fetch_add(1, Ordering::Relaxed);
            }
            (false, true) => {
                self.count.fetch_sub(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    fn clear_maps(&self) {
        for bucket in &self.buckets {
            bucket.write().clear();
        }
        self.count.store(0, Ordering::Relaxed);
        self.size.store(0, Ordering::Relaxed);
    }

    // Point operations

    /// Value of `key`, if present.
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let _structure = self.read_guard();
        self.bucket(key).read().get(key).cloned()
    }

    /// Length of the value of `key` without copying it.
    pub fn value_len(&self, key: &[u8]) -> Option<usize> {
        let _structure = self.read_guard();
        self.bucket(key).read().get(key).map(Vec::len)
    }

    /// Run `f` on the current value under the record's read lock.
    pub fn read<R>(&self, key: &[u8], f: impl FnOnce(Option<&[u8]>) -> R) -> R {
        let _structure = self.read_guard();
        let map = self.bucket(key).read();
        f(map.get(key).map(Vec::as_slice))
    }

    /// Atomic read-modify-write of one record.
    ///
    /// `f` sees the current value under the record's write lock and decides
    /// the [`Change`]; an error from `f` leaves the record untouched.
    pub fn update<R, F>(&self, key: &[u8], f: F) -> CasketResult<R>
    where
        F: FnOnce(Option<&[u8]>) -> CasketResult<(Change, R)>,
    {
        let result = {
            let _structure = self.structure.read();
            self.update_unlocked(key, f)
        };
        if result.is_ok() {
            self.maybe_checkpoint()?;
        }
        result
    }

    fn update_unlocked<R, F>(&self, key: &[u8], f: F) -> CasketResult<R>
    where
        F: FnOnce(Option<&[u8]>) -> CasketResult<(Change, R)>,
    {
        self.check_writable()?;
        let mut map = self.bucket(key).write();
        let (change, out) = f(map.get(key).map(Vec::as_slice))?;

        let value = match change {
            Change::Keep => return Ok(out),
            Change::Remove if map.get(key).is_none() => return Ok(out),
            Change::Remove => None,
            Change::Put(value) => {
                check_sizes(key, &value, self.config.max_key_size, self.config.max_value_size)?;
                Some(value)
            }
        };

        self.journal_change(&map, key, value.as_deref())?;
        self.apply(&mut map, key, value);
        Ok(out)
    }

    /// Record `key`'s before-image in the open transaction and batch, if
    /// any. Returns whether WAL writes should be deferred.
    fn record_before(&self, key: &[u8], before: Option<&[u8]>) -> bool {
        let mut deferred = false;
        for slot in [&self.undo, &self.batch] {
            if let Some(log) = slot.lock().as_mut() {
                log.record(key, before);
                deferred = true;
            }
        }
        deferred
    }

    /// Undo image and WAL entry for a change about to be applied.
    fn journal_change(&self, map: &RecordMap, key: &[u8], value: Option<&[u8]>) -> CasketResult<()> {
        let deferred = self.record_before(key, map.get(key).map(Vec::as_slice));

        match (&self.journal, value) {
            (Some(journal), Some(value)) => journal.append(key, value, Operation::Put, deferred),
            (Some(journal), None) => journal.append(key, &[], Operation::Delete, deferred),
            (None, _) => Ok(()),
        }
    }

    /// Remove and return the first record in native order.
    pub fn shift(&self) -> CasketResult<Option<(Vec<u8>, Vec<u8>)>> {
        loop {
            let Some(key) = self.first_key() else {
                return Ok(None);
            };
            let removed = self.update(&key, |current| {
                Ok(match current {
                    Some(value) => (Change::Remove, Some(value.to_vec())),
                    None => (Change::Keep, None),
                })
            })?;
            // Lost a race with another remover; look again
            if let Some(value) = removed {
                return Ok(Some((key, value)));
            }
        }
    }

    // Navigation. Hash stores only answer `first_key`; ordered queries
    // return None for them.

    pub fn first_key(&self) -> Option<Vec<u8>> {
        let _structure = self.read_guard();
        self.buckets.iter().find_map(|bucket| bucket.read().first_key())
    }

    pub fn last_key(&self) -> Option<Vec<u8>> {
        self.ordered(|map| map.last_key())
    }

    pub fn ceiling_key(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.ordered(|map| map.ceiling_key(key))
    }

    pub fn floor_key(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.ordered(|map| map.floor_key(key))
    }

    pub fn key_after(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.ordered(|map| map.key_after(key))
    }

    pub fn key_before(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.ordered(|map| map.key_before(key))
    }

    fn ordered<R>(&self, f: impl FnOnce(&RecordMap) -> Option<R>) -> Option<R> {
        if !self.kind.is_ordered() {
            return None;
        }
        let _structure = self.read_guard();
        let map = self.buckets[0].read();
        f(&*map)
    }

    /// Every key in native order (sorted for tree stores).
    pub fn keys(&self) -> Vec<Vec<u8>> {
        let _structure = self.read_guard();
        self.keys_unlocked()
    }

    fn keys_unlocked(&self) -> Vec<Vec<u8>> {
        let mut keys = Vec::with_capacity(self.count() as usize);
        for bucket in &self.buckets {
            keys.extend(bucket.read().keys());
        }
        keys
    }

    /// Keys starting with `prefix` in ascending order, at most `limit`.
    pub fn prefix_keys(&self, prefix: &[u8], limit: Option<usize>) -> Vec<Vec<u8>> {
        let _structure = self.read_guard();
        if self.kind.is_ordered() {
            return self.buckets[0].read().prefix_keys(prefix, limit);
        }
        let mut keys = Vec::new();
        for bucket in &self.buckets {
            keys.extend(bucket.read().prefix_keys(prefix, None));
        }
        keys.sort();
        if let Some(limit) = limit {
            keys.truncate(limit);
        }
        keys
    }

    // Whole-store operations

    /// Run `f` with the whole store locked exclusively.
    ///
    /// A checkpoint due because of WAL growth runs after the lock is released.
    pub fn exclusive<R>(&self, f: impl FnOnce(&Exclusive<'_>) -> CasketResult<R>) -> CasketResult<R> {
        let result = {
            let guard = Exclusive { store: self, _guard: self.structure.write() };
            f(&guard)
        };
        if result.is_ok() {
            self.maybe_checkpoint()?;
        }
        result
    }

    /// Start recording before-images; every mutation until the matching
    /// commit or rollback belongs to the transaction.
    pub fn begin_undo(&self, hard: bool) -> CasketResult<()> {
        if !self.writable {
            return Err(CasketError::NoPermission { operation: "begin_transaction" });
        }
        self.exclusive(|_| {
            let mut undo = self.undo.lock();
            if undo.is_some() {
                return Err(CasketError::invalid_state("transaction already active"));
            }
            if let Some(journal) = &self.journal {
                journal.mark(Operation::Begin, false)?;
            }
            *undo = Some(UndoLog { hard, before: HashMap::new() });
            Ok(())
        })
    }

    /// Keep every change since `begin_undo`; hard commits reach stable storage.
    pub fn commit_undo(&self) -> CasketResult<()> {
        self.exclusive(|_| {
            let mut undo = self.undo.lock();
            let log = undo.take().ok_or_else(|| CasketError::invalid_state("no active transaction"))?;
            if let Some(journal) = &self.journal {
                journal.mark(Operation::Commit, log.hard || journal.auto_transaction)?;
            }
            debug!(touched = log.before.len(), hard = log.hard, "Transaction committed");
            Ok(())
        })
    }

    /// Restore every record touched since `begin_undo`.
    pub fn rollback_undo(&self) -> CasketResult<()> {
        self.exclusive(|_| {
            let log = self
                .undo
                .lock()
                .take()
                .ok_or_else(|| CasketError::invalid_state("no active transaction"))?;
            let touched = log.before.len();
            for (key, before) in log.before {
                let mut map = self.bucket(&key).write();
                self.apply(&mut map, &key, before);
            }
            if let Some(journal) = &self.journal {
                journal.mark(Operation::Abort, false)?;
            }
            debug!(touched, "Transaction rolled back");
            Ok(())
        })
    }

    /// Put back the before-images of a failed batch. Inside a transaction
    /// the restores are logged so the transaction's commit replays them.
    fn restore_batch(&self, log: UndoLog, in_tx: bool) -> CasketResult<()> {
        for (key, before) in log.before {
            let mut map = self.bucket(&key).write();
            if in_tx {
                self.journal_change(&map, &key, before.as_deref())?;
            }
            self.apply(&mut map, &key, before);
        }
        Ok(())
    }

    pub fn in_transaction(&self) -> bool {
        self.undo.lock().is_some()
    }

    /// Checkpoint pending writes; called once when the handle closes.
    pub fn close(&self) -> CasketResult<()> {
        let _structure = self.structure.write();
        if self.writable {
            self.checkpoint_unlocked()?;
        }
        if let Some(journal) = &self.journal {
            info!(path = %journal.layout.data_file.display(), records = self.count(), "Store closed");
        }
        Ok(())
    }

    fn wal_due(&self) -> bool {
        match self.journal.as_ref().and_then(|j| j.wal.as_ref()) {
            Some(wal) => wal.lock().total_size() > self.config.checkpoint_wal_bytes,
            None => false,
        }
    }

    fn maybe_checkpoint(&self) -> CasketResult<()> {
        if !self.wal_due() {
            return Ok(());
        }
        let _structure = self.structure.write();
        if self.wal_due() {
            self.checkpoint_unlocked()?;
        }
        Ok(())
    }

    /// Fold RAM into the data file and empty the WAL. Skipped while a
    /// transaction is open, since its changes may still be rolled back.
    fn checkpoint_unlocked(&self) -> CasketResult<Option<CheckpointResult>> {
        let Some(journal) = &self.journal else {
            return Ok(None);
        };
        let Some(wal) = &journal.wal else {
            return Ok(None);
        };
        if self.undo.lock().is_some() {
            return Ok(None);
        }

        let result = write_checkpoint(&journal.layout.data_file, Some(self.kind), |writer| {
            for bucket in &self.buckets {
                let map = bucket.read();
                let mut outcome = Ok(());
                map.for_each(|key, value| {
                    if outcome.is_ok() {
                        outcome = writer.write_record(key, value);
                    }
                });
                outcome?;
            }
            Ok(())
        })?;
        wal.lock().reset()?;

        debug!(
            path = %result.file_path.display(),
            records = result.records,
            bytes = result.bytes,
            "Checkpoint written"
        );
        Ok(Some(result))
    }

    // Accessors

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Number of records
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Total bytes of keys and values
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Relaxed)
    }

    /// Data file of a file store
    pub fn data_path(&self) -> Option<&Path> {
        self.journal.as_ref().map(|j| j.layout.data_file.as_path())
    }

    /// WAL bytes not yet folded into the data file
    pub fn wal_bytes(&self) -> u64 {
        self.journal
            .as_ref()
            .and_then(|j| j.wal.as_ref())
            .map(|wal| wal.lock().total_size())
            .unwrap_or(0)
    }
}

fn acquire_lock(layout: &FileLayout, options: &StoreOptions) -> CasketResult<Option<File>> {
    if options.locking == Locking::Disabled {
        return Ok(None);
    }
    let path = &layout.lock_file;

    let file = if options.writable {
        OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| CasketError::io_at(path, "Failed to open lock file", e))?
    } else {
        // Readers create nothing; a store never opened for writing has no lock file
        match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CasketError::io_at(path, "Failed to open lock file", e)),
        }
    };

    let mode = if options.writable { LockMode::Exclusive } else { LockMode::Shared };
    let acquired = lock_file(&file, mode, options.locking == Locking::Try)
        .map_err(|e| CasketError::io_at(path, "Failed to lock store", e))?;
    if !acquired {
        return Err(CasketError::OpenFailed {
            path: layout.data_file.clone(),
            reason: "store is locked by another handle".to_string(),
        });
    }
    Ok(Some(file))
}

/// The whole store, locked exclusively. Obtained through [`Store::exclusive`].
pub struct Exclusive<'a> {
    store: &'a Store,
    _guard: RwLockWriteGuard<'a, ()>,
}

impl Exclusive<'_> {
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.store.bucket(key).read().get(key).cloned()
    }

    pub fn read<R>(&self, key: &[u8], f: impl FnOnce(Option<&[u8]>) -> R) -> R {
        let map = self.store.bucket(key).read();
        f(map.get(key).map(Vec::as_slice))
    }

    /// Same contract as [`Store::update`].
    pub fn update<R, F>(&self, key: &[u8], f: F) -> CasketResult<R>
    where
        F: FnOnce(Option<&[u8]>) -> CasketResult<(Change, R)>,
    {
        self.store.update_unlocked(key, f)
    }

    pub fn keys(&self) -> Vec<Vec<u8>> {
        self.store.keys_unlocked()
    }

    /// Visit every record in native order.
    pub fn for_each(&self, mut f: impl FnMut(&[u8], &[u8])) {
        for bucket in &self.store.buckets {
            bucket.read().for_each(&mut f);
        }
    }

    pub fn count(&self) -> u64 {
        self.store.count()
    }

    pub fn size(&self) -> u64 {
        self.store.size()
    }

    /// Remove every record.
    pub fn clear(&self) -> CasketResult<()> {
        let store = self.store;
        store.check_writable()?;

        let mut deferred = false;
        for slot in [&store.undo, &store.batch] {
            if let Some(log) = slot.lock().as_mut() {
                self.for_each(|key, value| log.record(key, Some(value)));
                deferred = true;
            }
        }
        if let Some(journal) = &store.journal {
            journal.append(&[], &[], Operation::Clear, deferred)?;
        }
        store.clear_maps();
        Ok(())
    }

    /// Run `f` as one unit: if it fails, every record it changed is
    /// restored before the error is returned, and after a crash either all
    /// of its changes are recovered or none. Inside a transaction the
    /// transaction's own WAL batch covers it. Nested calls join the
    /// outer batch.
    pub fn batch<R>(&self, f: impl FnOnce(&Self) -> CasketResult<R>) -> CasketResult<R> {
        let store = self.store;
        if !store.writable || store.batch.lock().is_some() {
            return f(self);
        }
        let in_tx = store.in_transaction();
        let journal = store.journal.as_ref().filter(|_| !in_tx);

        if let Some(journal) = journal {
            journal.mark(Operation::Begin, false)?;
        }
        *store.batch.lock() = Some(UndoLog { hard: false, before: HashMap::new() });
        let result = f(self);
        let log = store.batch.lock().take();

        match result {
            Ok(out) => {
                if let Some(journal) = journal {
                    journal.mark(Operation::Commit, journal.auto_transaction)?;
                }
                Ok(out)
            }
            Err(e) => {
                if let Some(log) = log {
                    let touched = log.before.len();
                    store.restore_batch(log, in_tx)?;
                    debug!(touched, "Batch rolled back");
                }
                if let Some(journal) = journal {
                    journal.mark(Operation::Abort, false)?;
                }
                Err(e)
            }
        }
    }

    /// Make the store's state durable.
    ///
    /// Outside a transaction this checkpoints; inside one only the WAL can
    /// be flushed, and only when `hard`.
    pub fn synchronize(&self, hard: bool) -> CasketResult<()> {
        let store = self.store;
        if store.in_transaction() {
            if let Some(wal) = store.journal.as_ref().and_then(|j| j.wal.as_ref()) {
                if hard {
                    wal.lock().sync()?;
                }
            }
            return Ok(());
        }
        store.checkpoint_unlocked()?;
        Ok(())
    }
}
