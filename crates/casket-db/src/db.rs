//! Polymorphic database handle.
//!
//! `Db` opens any backend named by an open path and exposes the record,
//! visitor, snapshot and merge operations over it. Transactions, bulk
//! operations, pattern matching and cursors extend it from their own
//! modules.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use tracing::{error, info, warn};

use casket_core::checkpoint::write_checkpoint;
use casket_core::{
    read_snapshot, CasketError, CasketResult, Change, Config, ErrorMode, Exclusive, SnapshotWriter, Store,
};

use crate::mode::{OpenMode, Target};
use crate::tx::TxGate;
use crate::visitor::{visit, FileProcessor, FnVisitor, VisitOutcome, Visitor};

/// How `merge` resolves keys that already exist in the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergeMode {
    /// Overwrite existing records
    #[default]
    Set,
    /// Keep existing records
    Add,
    /// Only update records that exist
    Replace,
    /// Append source values to existing ones
    Append,
}

struct Opened {
    store: Store,
    path: String,
    target: Target,
    mode: OpenMode,
}

/// Database handle.
///
/// All methods take `&self`; a `Db` can be shared between threads.
pub struct Db {
    config: Config,
    state: RwLock<Option<Opened>>,
    last_error: Mutex<Option<CasketError>>,
    pub(crate) gate: TxGate,
    /// Bumped on every close; cursors created earlier become disabled
    generation: AtomicU64,
}

impl Db {
    /// Closed handle with the default configuration.
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    /// Closed handle; `config` fixes the concurrency and error modes.
    pub fn with_config(config: Config) -> Self {
        Self {
            config,
            state: RwLock::new(None),
            last_error: Mutex::new(None),
            gate: TxGate::new(),
            generation: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Plumbing
    // -----------------------------------------------------------------------

    /// Run `f` against the open store and record a failure per the error mode.
    pub(crate) fn run<T>(&self, f: impl FnOnce(&Store) -> CasketResult<T>) -> CasketResult<T> {
        let result = {
            // Recursive: visitors and transaction closures re-enter the handle
            let state = self.state.read_recursive();
            match state.as_ref() {
                Some(open) => f(&open.store),
                None => Err(CasketError::invalid_state("database is not open")),
            }
        };
        self.track(result)
    }

    /// Like `run`, refusing read-only handles.
    pub(crate) fn run_mut<T>(
        &self,
        operation: &'static str,
        f: impl FnOnce(&Store) -> CasketResult<T>,
    ) -> CasketResult<T> {
        self.run(|store| {
            if !store.is_writable() {
                return Err(CasketError::NoPermission { operation });
            }
            f(store)
        })
    }

    pub(crate) fn track<T>(&self, result: CasketResult<T>) -> CasketResult<T> {
        if let Err(e) = &result {
            match self.config.error_mode {
                ErrorMode::Status => *self.last_error.lock() = Some(e.clone()),
                ErrorMode::Exceptional => {
                    if !e.kind().is_expected() {
                        error!(code = e.kind().name(), error = %e, "Database operation failed");
                    }
                }
            }
        }
        result
    }

    /// Whole-store operations are refused in concurrent mode.
    pub(crate) fn check_traversable(&self, operation: &str) -> CasketResult<()> {
        if self.config.concurrent {
            return Err(CasketError::invalid_state(format!("{} is not available in concurrent mode", operation)));
        }
        Ok(())
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Last failure of this handle; always `None` in exceptional mode.
    pub fn error(&self) -> Option<CasketError> {
        self.last_error.lock().clone()
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Open the store named by `path`.
    ///
    /// `":"`/`"*"` and `"%"`/`"+"` are in-memory hash and tree stores;
    /// `.kch`, `.kct`, `.kcd` and `.kcf` select hash file, tree file,
    /// directory hash and directory tree stores.
    pub fn open(&self, path: &str, mode: OpenMode) -> CasketResult<()> {
        let result = (|| {
            let mut state = self.state.write();
            if state.is_some() {
                return Err(CasketError::invalid_state("database is already open"));
            }
            mode.validate()?;
            let target = Target::parse(path)?;
            let store = Store::open(target.options(mode), self.config.clone())?;
            info!(path, kind = target.name(), ?mode, "Database opened");
            *state = Some(Opened { store, path: path.to_string(), target, mode });
            Ok(())
        })();
        self.track(result)
    }

    /// Close the store. An open transaction is rolled back and every cursor
    /// of this handle is disabled.
    pub fn close(&self) -> CasketResult<()> {
        let result = (|| {
            let mut state = self.state.write();
            let open = state.take().ok_or_else(|| CasketError::invalid_state("database is not open"))?;
            self.generation.fetch_add(1, Ordering::AcqRel);

            if open.store.in_transaction() {
                warn!(path = %open.path, "Closing with an open transaction, rolling back");
                open.store.rollback_undo()?;
                self.gate.force_release();
            }
            open.store.close()?;
            info!(path = %open.path, "Database closed");
            Ok(())
        })();
        self.track(result)
    }

    pub fn is_open(&self) -> bool {
        self.state.read_recursive().is_some()
    }

    /// Path the handle was opened with.
    pub fn path(&self) -> Option<String> {
        self.state.read_recursive().as_ref().map(|open| open.path.clone())
    }

    /// Named properties of the open store.
    pub fn status(&self) -> CasketResult<BTreeMap<String, String>> {
        let result = {
            let state = self.state.read_recursive();
            match state.as_ref() {
                Some(open) => {
                    let store = &open.store;
                    let mut status = BTreeMap::new();
                    status.insert("count".to_string(), store.count().to_string());
                    status.insert("size".to_string(), store.size().to_string());
                    status.insert("path".to_string(), open.path.clone());
                    status.insert("type".to_string(), store.kind().name().to_string());
                    status.insert("realtype".to_string(), open.target.name().to_string());
                    status.insert("mode".to_string(), format!("{:?}", open.mode));
                    status.insert("wal_bytes".to_string(), store.wal_bytes().to_string());
                    status.insert("transaction".to_string(), store.in_transaction().to_string());
                    if let Some(file) = open.target.file_path() {
                        status.insert("file".to_string(), file.display().to_string());
                    }
                    Ok(status)
                }
                None => Err(CasketError::invalid_state("database is not open")),
            }
        };
        self.track(result)
    }

    // -----------------------------------------------------------------------
    // Point operations
    // -----------------------------------------------------------------------

    /// Value of `key`; `None` when absent.
    pub fn get(&self, key: &[u8]) -> CasketResult<Option<Vec<u8>>> {
        self.run(|store| Ok(store.get(key)))
    }

    /// Store `value` under `key`, replacing any existing value.
    pub fn set(&self, key: &[u8], value: &[u8]) -> CasketResult<()> {
        self.run_mut("set", |store| store.update(key, |_| Ok((Change::Put(value.to_vec()), ()))))
    }

    /// Insert only; an existing record is left as is.
    pub fn add(&self, key: &[u8], value: &[u8]) -> CasketResult<()> {
        self.run_mut("add", |store| {
            store.update(key, |current| match current {
                Some(_) => Err(CasketError::DuplicateRecord { operation: "add" }),
                None => Ok((Change::Put(value.to_vec()), ())),
            })
        })
    }

    /// Update only; fails when the record is absent.
    pub fn replace(&self, key: &[u8], value: &[u8]) -> CasketResult<()> {
        self.run_mut("replace", |store| {
            store.update(key, |current| match current {
                Some(_) => Ok((Change::Put(value.to_vec()), ())),
                None => Err(CasketError::NotFound { operation: "replace" }),
            })
        })
    }

    /// Append to the existing value, or create the record.
    pub fn append(&self, key: &[u8], suffix: &[u8]) -> CasketResult<()> {
        self.run_mut("append", |store| {
            store.update(key, |current| {
                let mut value = current.map(<[u8]>::to_vec).unwrap_or_default();
                value.extend_from_slice(suffix);
                Ok((Change::Put(value), ()))
            })
        })
    }

    /// Compare and swap. `old == None` expects the record to be absent;
    /// `new == None` removes it.
    pub fn cas(&self, key: &[u8], old: Option<&[u8]>, new: Option<&[u8]>) -> CasketResult<()> {
        self.run_mut("cas", |store| {
            store.update(key, |current| {
                if current != old {
                    return Err(CasketError::logic("compare-and-swap: current value differs"));
                }
                let change = match new {
                    Some(value) => Change::Put(value.to_vec()),
                    None => Change::Remove,
                };
                Ok((change, ()))
            })
        })
    }

    pub fn remove(&self, key: &[u8]) -> CasketResult<()> {
        self.seize_as(key, "remove").map(|_| ())
    }

    /// Remove the record and return its value.
    pub fn seize(&self, key: &[u8]) -> CasketResult<Vec<u8>> {
        self.seize_as(key, "seize")
    }

    fn seize_as(&self, key: &[u8], operation: &'static str) -> CasketResult<Vec<u8>> {
        self.run_mut(operation, |store| {
            store.update(key, |current| match current {
                Some(value) => Ok((Change::Remove, value.to_vec())),
                None => Err(CasketError::NotFound { operation }),
            })
        })
    }

    /// Add `delta` to the 8-byte big-endian integer stored under `key`.
    ///
    /// An absent record starts from `origin`. A value that is not 8 bytes
    /// long is a Logic error and stays as it was.
    pub fn increment(&self, key: &[u8], delta: i64, origin: i64) -> CasketResult<i64> {
        self.run_mut("increment", |store| {
            store.update(key, |current| {
                let base = match current {
                    Some(bytes) if bytes.len() == 8 => {
                        let mut buf = [0u8; 8];
                        buf.copy_from_slice(bytes);
                        i64::from_be_bytes(buf)
                    }
                    Some(bytes) => {
                        return Err(CasketError::logic(format!(
                            "increment: value is {} bytes, not an 8-byte integer",
                            bytes.len()
                        )))
                    }
                    None => origin,
                };
                let number = base.wrapping_add(delta);
                Ok((Change::Put(number.to_be_bytes().to_vec()), number))
            })
        })
    }

    /// Floating-point counterpart of [`Db::increment`] over 8-byte big-endian
    /// IEEE 754 values. A NaN result is a Logic error.
    pub fn increment_double(&self, key: &[u8], delta: f64, origin: f64) -> CasketResult<f64> {
        self.run_mut("increment_double", |store| {
            store.update(key, |current| {
                let base = match current {
                    Some(bytes) if bytes.len() == 8 => {
                        let mut buf = [0u8; 8];
                        buf.copy_from_slice(bytes);
                        f64::from_be_bytes(buf)
                    }
                    Some(bytes) => {
                        return Err(CasketError::logic(format!(
                            "increment_double: value is {} bytes, not an 8-byte double",
                            bytes.len()
                        )))
                    }
                    None => origin,
                };
                let number = base + delta;
                if number.is_nan() {
                    return Err(CasketError::logic("increment_double: result is not a number"));
                }
                Ok((Change::Put(number.to_be_bytes().to_vec()), number))
            })
        })
    }

    /// Length of the value of `key`.
    pub fn check(&self, key: &[u8]) -> CasketResult<usize> {
        self.run(|store| store.value_len(key).ok_or(CasketError::NotFound { operation: "check" }))
    }

    /// Number of records.
    pub fn count(&self) -> CasketResult<u64> {
        self.run(|store| Ok(store.count()))
    }

    /// Total bytes of keys and values.
    pub fn size(&self) -> CasketResult<u64> {
        self.run(|store| Ok(store.size()))
    }

    /// Remove every record.
    pub fn clear(&self) -> CasketResult<()> {
        self.run_mut("clear", |store| store.exclusive(|ex| ex.clear()))
    }

    /// Remove and return the first record (in key order for tree stores).
    pub fn shift(&self) -> CasketResult<(Vec<u8>, Vec<u8>)> {
        self.run_mut("shift", |store| {
            store.shift()?.ok_or(CasketError::NotFound { operation: "shift" })
        })
    }

    // -----------------------------------------------------------------------
    // Visitors
    // -----------------------------------------------------------------------

    /// Show the record of `key` to `visitor` under the record's lock.
    pub fn accept<V: Visitor + ?Sized>(&self, key: &[u8], visitor: &mut V, writable: bool) -> CasketResult<()> {
        if writable {
            self.run_mut("accept", |store| {
                store.update(key, |current| Ok((visit(visitor, key, current, true)?, ())))
            })
        } else {
            self.run(|store| store.read(key, |current| visit(visitor, key, current, false).map(|_| ())))
        }
    }

    /// Visit each key in order as one batch with the whole store locked.
    pub fn accept_bulk<K, V>(&self, keys: &[K], visitor: &mut V, writable: bool) -> CasketResult<()>
    where
        K: AsRef<[u8]>,
        V: Visitor + ?Sized,
    {
        if let Err(e) = self.check_traversable("accept_bulk") {
            return self.track(Err(e));
        }
        let body = |ex: &Exclusive<'_>| -> CasketResult<()> {
            for key in keys {
                visit_locked(ex, key.as_ref(), visitor, writable)?;
            }
            Ok(())
        };
        if writable {
            self.run_mut("accept_bulk", |store| store.exclusive(|ex| ex.batch(body)))
        } else {
            self.run(|store| store.exclusive(body))
        }
    }

    /// Visit every record in native order (key order for tree stores).
    ///
    /// Keys are captured when the walk starts, so records the visitor
    /// removes are simply not visited again.
    pub fn iterate<V: Visitor + ?Sized>(&self, visitor: &mut V, writable: bool) -> CasketResult<()> {
        if let Err(e) = self.check_traversable("iterate") {
            return self.track(Err(e));
        }
        let body = |ex: &Exclusive<'_>| -> CasketResult<()> {
            visitor.visit_before();
            let mut result = Ok(());
            for key in ex.keys() {
                let present = ex.read(&key, |current| current.is_some());
                if present {
                    result = visit_locked(ex, &key, visitor, writable);
                    if result.is_err() {
                        break;
                    }
                }
            }
            visitor.visit_after();
            result
        };
        if writable {
            self.run_mut("iterate", |store| store.exclusive(|ex| ex.batch(body)))
        } else {
            self.run(|store| store.exclusive(body))
        }
    }

    /// Call `f` with every record, read-only.
    pub fn each(&self, mut f: impl FnMut(&[u8], &[u8])) -> CasketResult<()> {
        let mut visitor = FnVisitor::full(|key: &[u8], value: &[u8]| {
            f(key, value);
            VisitOutcome::Nop
        });
        self.iterate(&mut visitor, false)
    }

    pub fn each_key(&self, mut f: impl FnMut(&[u8])) -> CasketResult<()> {
        self.each(|key, _| f(key))
    }

    pub fn each_value(&self, mut f: impl FnMut(&[u8])) -> CasketResult<()> {
        self.each(|_, value| f(value))
    }

    // -----------------------------------------------------------------------
    // Whole-store maintenance
    // -----------------------------------------------------------------------

    /// Make the store durable and optionally hand its file to `processor`
    /// while the store is held still.
    pub fn synchronize(&self, hard: bool, processor: Option<&mut dyn FileProcessor>) -> CasketResult<()> {
        let path = self.path().unwrap_or_default();
        self.run(|store| {
            store.exclusive(|ex| {
                if store.is_writable() {
                    ex.synchronize(hard)?;
                }
                run_processor(processor, &path, ex)
            })
        })
    }

    /// Hold the whole store still while `processor` runs.
    pub fn occupy(&self, writable: bool, processor: Option<&mut dyn FileProcessor>) -> CasketResult<()> {
        let path = self.path().unwrap_or_default();
        let body = |ex: &Exclusive<'_>| run_processor(processor, &path, ex);
        if writable {
            self.run_mut("occupy", |store| store.exclusive(body))
        } else {
            self.run(|store| store.exclusive(body))
        }
    }

    /// Write every record to `dest` in the snapshot format, atomically.
    ///
    /// The copy carries no backend tag, so it opens as either a hash or a
    /// tree file store.
    pub fn copy(&self, dest: impl AsRef<Path>) -> CasketResult<()> {
        let dest = dest.as_ref();
        self.run(|store| {
            store.exclusive(|ex| {
                write_checkpoint(dest, None, |writer| write_records(ex, writer)).map(|_| ())
            })
        })
    }

    /// Dump every record to `path`.
    pub fn dump_snapshot(&self, path: impl AsRef<Path>) -> CasketResult<()> {
        let path = path.as_ref();
        self.run(|store| {
            store.exclusive(|ex| {
                let mut writer = SnapshotWriter::create(path, None)?;
                write_records(ex, &mut writer)?;
                let (records, bytes) = writer.finish(false)?;
                info!(path = %path.display(), records, bytes, "Snapshot dumped");
                Ok(())
            })
        })
    }

    /// Upsert every record of the snapshot at `path`.
    pub fn load_snapshot(&self, path: impl AsRef<Path>) -> CasketResult<()> {
        let path = path.as_ref();
        self.run_mut("load_snapshot", |store| {
            let snapshot = read_snapshot(path, false)?;
            let records = snapshot.records.len();
            store.exclusive(|ex| {
                ex.batch(|ex| {
                    for (key, value) in snapshot.records {
                        ex.update(&key, |_| Ok((Change::Put(value), ())))?;
                    }
                    Ok(())
                })
            })?;
            info!(path = %path.display(), records, "Snapshot loaded");
            Ok(())
        })
    }

    /// Apply the records of every source, in list order, according to `mode`.
    pub fn merge(&self, sources: &[&Db], mode: MergeMode) -> CasketResult<()> {
        if sources.iter().any(|source| std::ptr::eq(*source, self)) {
            return self.track(Err(CasketError::InvalidArgs {
                reason: "a database cannot be merged into itself".to_string(),
            }));
        }

        self.run_mut("merge", |_| Ok(()))?;
        for source in sources {
            // Read the source completely before locking the target
            let mut records = Vec::new();
            let read = source.run(|store| {
                store.exclusive(|ex| {
                    ex.for_each(|key, value| records.push((key.to_vec(), value.to_vec())));
                    Ok(())
                })
            });
            self.track(read)?;

            self.run_mut("merge", |store| {
                store.exclusive(|ex| {
                    ex.batch(|ex| {
                        for (key, value) in records {
                            ex.update(&key, |current| Ok((merge_change(mode, current, value), ())))?;
                        }
                        Ok(())
                    })
                })
            })?;
        }
        Ok(())
    }
}

fn merge_change(mode: MergeMode, current: Option<&[u8]>, value: Vec<u8>) -> Change {
    match (mode, current) {
        (MergeMode::Set, _) => Change::Put(value),
        (MergeMode::Add, None) | (MergeMode::Replace, Some(_)) => Change::Put(value),
        (MergeMode::Add, Some(_)) | (MergeMode::Replace, None) => Change::Keep,
        (MergeMode::Append, Some(existing)) => {
            let mut joined = existing.to_vec();
            joined.extend_from_slice(&value);
            Change::Put(joined)
        }
        (MergeMode::Append, None) => Change::Put(value),
    }
}

/// One visit with the whole store already locked.
fn visit_locked<V: Visitor + ?Sized>(ex: &Exclusive<'_>, key: &[u8], visitor: &mut V, writable: bool) -> CasketResult<()> {
    if writable {
        ex.update(key, |current| Ok((visit(visitor, key, current, true)?, ())))
    } else {
        ex.read(key, |current| visit(visitor, key, current, false).map(|_| ()))
    }
}

fn write_records(ex: &Exclusive<'_>, writer: &mut SnapshotWriter) -> CasketResult<()> {
    let mut outcome = Ok(());
    ex.for_each(|key, value| {
        if outcome.is_ok() {
            outcome = writer.write_record(key, value);
        }
    });
    outcome
}

fn run_processor(processor: Option<&mut dyn FileProcessor>, path: &str, ex: &Exclusive<'_>) -> CasketResult<()> {
    if let Some(processor) = processor {
        if !processor.process(path, ex.count(), ex.size()) {
            return Err(CasketError::logic("file processor reported failure"));
        }
    }
    Ok(())
}

impl Default for Db {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Db {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read_recursive();
        f.debug_struct("Db")
            .field("path", &state.as_ref().map(|open| open.path.as_str()))
            .field("records", &state.as_ref().map(|open| open.store.count()))
            .field("error_mode", &self.config.error_mode)
            .finish()
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        if self.state.get_mut().is_some() {
            if let Err(e) = self.close() {
                warn!(error = %e, "Failed to close database on drop");
            }
        }
    }
}
