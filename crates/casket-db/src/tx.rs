//! Transactions.
//!
//! One transaction may be open per handle. It is owned by the thread that
//! began it; other threads calling `begin_transaction` wait until it ends.
//! Every mutation made while it is open, from any thread, belongs to it and
//! is rolled back on abort.

use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use casket_core::{CasketError, CasketResult};

use crate::db::Db;

// ---------------------------------------------------------------------------
// Gate
// ---------------------------------------------------------------------------

/// Admits one transaction owner at a time.
pub(crate) struct TxGate {
    owner: Mutex<Option<ThreadId>>,
    released: Condvar,
}

impl TxGate {
    pub(crate) fn new() -> Self {
        Self { owner: Mutex::new(None), released: Condvar::new() }
    }

    /// Wait for the gate and take it for the calling thread.
    fn enter(&self) -> CasketResult<()> {
        let me = thread::current().id();
        let mut owner = self.owner.lock();
        loop {
            match *owner {
                Some(current) if current == me => {
                    return Err(CasketError::invalid_state("transaction already active on this thread"));
                }
                Some(_) => self.released.wait(&mut owner),
                None => {
                    *owner = Some(me);
                    return Ok(());
                }
            }
        }
    }

    fn is_owner(&self) -> bool {
        *self.owner.lock() == Some(thread::current().id())
    }

    fn release(&self) {
        *self.owner.lock() = None;
        self.released.notify_one();
    }

    /// Release regardless of owner; used when the handle closes.
    pub(crate) fn force_release(&self) {
        self.release();
    }
}

// ---------------------------------------------------------------------------
// Db transaction operations
// ---------------------------------------------------------------------------

impl Db {
    /// Begin a transaction, waiting while another thread has one open.
    ///
    /// A hard transaction is synced to the device on commit.
    pub fn begin_transaction(&self, hard: bool) -> CasketResult<()> {
        if let Err(e) = self.gate.enter() {
            return self.track(Err(e));
        }
        let result = self.run_mut("begin_transaction", |store| store.begin_undo(hard));
        match &result {
            Ok(()) => debug!(hard, "Transaction started"),
            Err(_) => self.gate.release(),
        }
        result
    }

    /// End the calling thread's transaction, keeping its changes when
    /// `commit` is true and restoring every touched record otherwise.
    pub fn end_transaction(&self, commit: bool) -> CasketResult<()> {
        if !self.gate.is_owner() {
            return self.track(Err(CasketError::invalid_state("no transaction open on this thread")));
        }
        let result = self.run(|store| if commit { store.commit_undo() } else { store.rollback_undo() });
        self.gate.release();
        result
    }

    /// Run `f` inside a transaction.
    ///
    /// The transaction commits when `f` returns `Ok(true)` and aborts when it
    /// returns `Ok(false)`, fails or panics. Returns whether it committed.
    pub fn transaction<F>(&self, hard: bool, f: F) -> CasketResult<bool>
    where
        F: FnOnce(&Db) -> CasketResult<bool>,
    {
        self.begin_transaction(hard)?;
        let mut guard = AbortOnUnwind { db: self, armed: true };
        let outcome = f(self);
        guard.armed = false;

        match outcome {
            Ok(true) => self.end_transaction(true).map(|_| true),
            Ok(false) => self.end_transaction(false).map(|_| false),
            Err(e) => {
                if let Err(abort) = self.end_transaction(false) {
                    warn!(error = %abort, "Failed to abort transaction after error");
                }
                Err(e)
            }
        }
    }
}

/// Aborts the transaction if its body unwinds.
struct AbortOnUnwind<'a> {
    db: &'a Db,
    armed: bool,
}

impl Drop for AbortOnUnwind<'_> {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = self.db.end_transaction(false) {
                warn!(error = %e, "Failed to abort transaction during unwind");
            }
        }
    }
}
