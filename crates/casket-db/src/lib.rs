//! Casket database handle
//!
//! A single `Db` type fronts every backend of `casket-core`: in-memory and
//! file-backed, hash and key-ordered. The backend is picked by the open
//! path.
//!
//! # Architecture
//!
//! - **Point operations** lock one record bucket and go straight to the store
//! - **Visitors** see a record (or its absence) under its lock and answer
//!   with a `VisitOutcome`
//! - **Whole-store operations** (iterate, atomic bulk, snapshots, merge)
//!   hold the store exclusively and log as one WAL batch
//! - **Transactions** are per handle, owned by one thread at a time, and
//!   roll back from an undo log
//! - **Cursors** borrow the handle and are disabled when it closes
//!
//! ```no_run
//! use casket_db::{Db, OpenMode};
//!
//! let db = Db::new();
//! db.open("casket.kct", OpenMode::WRITER | OpenMode::CREATE)?;
//! db.set(b"hello", b"world")?;
//! assert_eq!(db.get(b"hello")?, Some(b"world".to_vec()));
//! db.close()?;
//! # Ok::<(), casket_db::CasketError>(())
//! ```

pub mod bulk;
pub mod cursor;
pub mod db;
pub mod matching;
pub mod mode;
pub mod tx;
pub mod visitor;

pub use casket_core::{CasketError, CasketResult, Config, ErrorKind, ErrorMode};
pub use cursor::Cursor;
pub use db::{Db, MergeMode};
pub use mode::{OpenMode, Target};
pub use visitor::{FileProcessor, FnVisitor, VisitOutcome, Visitor};
