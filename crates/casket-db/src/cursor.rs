//! Cursors over a database handle.
//!
//! Tree cursors are live: each step asks the ordered map for the key after
//! the current one, so records added or removed by others are seen as the
//! cursor moves. Hash stores have no order to resume from, so a hash cursor
//! walks a snapshot of the keys taken by `jump` and skips keys that have
//! been removed since.

use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;

use casket_core::{CasketError, CasketResult, Change, Store};

use crate::db::Db;
use crate::visitor::{visit, Visitor};

enum Position {
    Tree(Vec<u8>),
    Hash { keys: Vec<Vec<u8>>, index: usize },
}

enum CursorState {
    Unpositioned,
    Positioned(Position),
    Disabled,
}

/// Movable position within a store.
///
/// Created by [`Db::cursor`]. A cursor is disabled by [`Cursor::disable`]
/// and when its database is closed; every later call fails with
/// `InvalidState`.
pub struct Cursor<'a> {
    db: &'a Db,
    generation: u64,
    state: CursorState,
    // Send but not Sync
    _not_sync: PhantomData<Cell<()>>,
}

impl Db {
    /// Unpositioned cursor over this handle's store.
    pub fn cursor(&self) -> CasketResult<Cursor<'_>> {
        let generation = self.run(|_| Ok(self.generation()))?;
        Ok(Cursor { db: self, generation, state: CursorState::Unpositioned, _not_sync: PhantomData })
    }

    /// Run `f` with a fresh cursor that is disabled when `f` returns.
    pub fn cursor_process<R>(&self, f: impl FnOnce(&mut Cursor<'_>) -> R) -> CasketResult<R> {
        let mut cursor = self.cursor()?;
        let result = f(&mut cursor);
        cursor.disable();
        Ok(result)
    }
}

impl Cursor<'_> {
    // -----------------------------------------------------------------------
    // Positioning
    // -----------------------------------------------------------------------

    /// Move to `key`, or to the first record when `key` is `None`.
    ///
    /// Tree cursors land on the first key at or after `key`; hash cursors
    /// need an exact match.
    pub fn jump(&mut self, key: Option<&[u8]>) -> CasketResult<()> {
        self.enter(None, |store, state| {
            *state = CursorState::Unpositioned;
            let position = if store.kind().is_ordered() {
                let found = match key {
                    Some(key) => store.ceiling_key(key),
                    None => store.first_key(),
                };
                found.map(Position::Tree)
            } else {
                let keys = store.keys();
                let index = match key {
                    Some(key) => keys.iter().position(|k| k.as_slice() == key),
                    None => next_live(store, &keys, 0),
                };
                index.map(|index| Position::Hash { keys, index })
            };
            match position {
                Some(position) => {
                    *state = CursorState::Positioned(position);
                    Ok(())
                }
                None => Err(CasketError::NotFound { operation: "cursor_jump" }),
            }
        })
    }

    /// Move to `key` or the last key before it, or to the last record when
    /// `key` is `None`. Tree stores only.
    pub fn jump_back(&mut self, key: Option<&[u8]>) -> CasketResult<()> {
        self.enter(None, |store, state| {
            if !store.kind().is_ordered() {
                return Err(CasketError::Unimplemented { operation: "cursor_jump_back", backend: store.kind().name() });
            }
            let found = match key {
                Some(key) => store.floor_key(key),
                None => store.last_key(),
            };
            match found {
                Some(found) => {
                    *state = CursorState::Positioned(Position::Tree(found));
                    Ok(())
                }
                None => {
                    *state = CursorState::Unpositioned;
                    Err(CasketError::NotFound { operation: "cursor_jump_back" })
                }
            }
        })
    }

    /// Move to the next record. Stepping past the last record leaves the
    /// cursor unpositioned.
    pub fn step(&mut self) -> CasketResult<()> {
        self.enter(None, |store, state| {
            current_key(state, "cursor_step")?;
            if move_next(store, state) {
                Ok(())
            } else {
                Err(CasketError::NotFound { operation: "cursor_step" })
            }
        })
    }

    /// Move to the previous record. Tree stores only.
    pub fn step_back(&mut self) -> CasketResult<()> {
        self.enter(None, |store, state| {
            if !store.kind().is_ordered() {
                return Err(CasketError::Unimplemented { operation: "cursor_step_back", backend: store.kind().name() });
            }
            let key = current_key(state, "cursor_step_back")?;
            match store.key_before(key) {
                Some(previous) => {
                    *state = CursorState::Positioned(Position::Tree(previous));
                    Ok(())
                }
                None => {
                    *state = CursorState::Unpositioned;
                    Err(CasketError::NotFound { operation: "cursor_step_back" })
                }
            }
        })
    }

    // -----------------------------------------------------------------------
    // Record access
    // -----------------------------------------------------------------------

    /// Current record; moves to the next one afterwards when `step`.
    pub fn get(&mut self, step: bool) -> CasketResult<(Vec<u8>, Vec<u8>)> {
        self.enter(None, |store, state| {
            let key = current_key(state, "cursor_get")?.to_vec();
            let value = store.get(&key).ok_or(CasketError::NotFound { operation: "cursor_get" })?;
            if step {
                move_next(store, state);
            }
            Ok((key, value))
        })
    }

    pub fn get_key(&mut self, step: bool) -> CasketResult<Vec<u8>> {
        self.get(step).map(|(key, _)| key)
    }

    pub fn get_value(&mut self, step: bool) -> CasketResult<Vec<u8>> {
        self.get(step).map(|(_, value)| value)
    }

    /// Overwrite the current record's value.
    pub fn set_value(&mut self, value: &[u8], step: bool) -> CasketResult<()> {
        self.enter(Some("cursor_set_value"), |store, state| {
            let key = current_key(state, "cursor_set_value")?;
            store.update(key, |current| match current {
                Some(_) => Ok((Change::Put(value.to_vec()), ())),
                None => Err(CasketError::NotFound { operation: "cursor_set_value" }),
            })?;
            if step {
                move_next(store, state);
            }
            Ok(())
        })
    }

    /// Remove the current record and move to the next one.
    pub fn remove(&mut self) -> CasketResult<()> {
        self.seize_as("cursor_remove").map(|_| ())
    }

    /// Remove the current record, returning it, and move to the next one.
    pub fn seize(&mut self) -> CasketResult<(Vec<u8>, Vec<u8>)> {
        self.seize_as("cursor_seize")
    }

    fn seize_as(&mut self, operation: &'static str) -> CasketResult<(Vec<u8>, Vec<u8>)> {
        self.enter(Some(operation), |store, state| {
            let key = current_key(state, operation)?.to_vec();
            let value = store.update(&key, |current| match current {
                Some(value) => Ok((Change::Remove, value.to_vec())),
                None => Err(CasketError::NotFound { operation }),
            })?;
            move_next(store, state);
            Ok((key, value))
        })
    }

    /// Show the current record to `visitor`.
    pub fn accept<V: Visitor + ?Sized>(&mut self, visitor: &mut V, writable: bool, step: bool) -> CasketResult<()> {
        let operation = if writable { Some("cursor_accept") } else { None };
        self.enter(operation, |store, state| {
            let key = current_key(state, "cursor_accept")?;
            let missing = CasketError::NotFound { operation: "cursor_accept" };
            if writable {
                store.update(key, |current| match current {
                    Some(_) => Ok((visit(visitor, key, current, true)?, ())),
                    None => Err(missing),
                })?;
            } else {
                store.read(key, |current| match current {
                    Some(_) => visit(visitor, key, current, false).map(|_| ()),
                    None => Err(missing),
                })?;
            }
            if step {
                move_next(store, state);
            }
            Ok(())
        })
    }

    /// Disable the cursor; every later call fails with `InvalidState`.
    pub fn disable(&mut self) {
        self.state = CursorState::Disabled;
    }

    pub fn is_disabled(&self) -> bool {
        matches!(self.state, CursorState::Disabled)
    }

    /// Run `f` on the store after checking that the cursor is still usable.
    /// `writable` names the operation when it needs a writer handle.
    fn enter<T>(
        &mut self,
        writable: Option<&'static str>,
        f: impl FnOnce(&Store, &mut CursorState) -> CasketResult<T>,
    ) -> CasketResult<T> {
        let db = self.db;
        let generation = self.generation;
        let state = &mut self.state;
        let body = |store: &Store| {
            if db.generation() != generation {
                *state = CursorState::Disabled;
            }
            if let CursorState::Disabled = state {
                return Err(CasketError::invalid_state("cursor is disabled"));
            }
            f(store, state)
        };
        match writable {
            Some(operation) => db.run_mut(operation, body),
            None => db.run(body),
        }
    }
}

fn current_key<'s>(state: &'s CursorState, operation: &'static str) -> CasketResult<&'s [u8]> {
    match state {
        CursorState::Positioned(Position::Tree(key)) => Ok(key),
        CursorState::Positioned(Position::Hash { keys, index }) => Ok(&keys[*index]),
        _ => Err(CasketError::NotFound { operation }),
    }
}

/// First index at or after `from` whose key still has a record.
fn next_live(store: &Store, keys: &[Vec<u8>], from: usize) -> Option<usize> {
    (from..keys.len()).find(|&i| store.value_len(&keys[i]).is_some())
}

/// Advance to the next record; `false` when there is none and the cursor
/// is left unpositioned.
fn move_next(store: &Store, state: &mut CursorState) -> bool {
    match std::mem::replace(state, CursorState::Unpositioned) {
        CursorState::Positioned(Position::Tree(key)) => {
            if let Some(next) = store.key_after(&key) {
                *state = CursorState::Positioned(Position::Tree(next));
                return true;
            }
        }
        CursorState::Positioned(Position::Hash { keys, index }) => {
            if let Some(next) = next_live(store, &keys, index + 1) {
                *state = CursorState::Positioned(Position::Hash { keys, index: next });
                return true;
            }
        }
        other => *state = other,
    }
    false
}

impl fmt::Debug for Cursor<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let position = match &self.state {
            CursorState::Unpositioned => "unpositioned".to_string(),
            CursorState::Disabled => "disabled".to_string(),
            CursorState::Positioned(Position::Tree(key)) => format!("tree at {:?}", String::from_utf8_lossy(key)),
            CursorState::Positioned(Position::Hash { keys, index }) => format!("hash at {}/{}", index, keys.len()),
        };
        f.debug_struct("Cursor")
            .field("generation", &self.generation)
            .field("position", &position)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mode::OpenMode;
    use crate::visitor::{FnVisitor, VisitOutcome};
    use casket_core::ErrorKind;

    fn filled(path: &str, keys: &[&str]) -> Db {
        let db = Db::new();
        db.open(path, OpenMode::default()).unwrap();
        for key in keys {
            db.set(key.as_bytes(), key.to_uppercase().as_bytes()).unwrap();
        }
        db
    }

    fn collect_forward(cursor: &mut Cursor<'_>) -> Vec<Vec<u8>> {
        let mut keys = Vec::new();
        while let Ok(key) = cursor.get_key(true) {
            keys.push(key);
        }
        keys
    }

    #[test]
    fn test_tree_walk_both_ways() {
        let db = filled("%", &["b", "d", "a", "c"]);
        let mut cursor = db.cursor().unwrap();
        cursor.jump(None).unwrap();
        assert_eq!(collect_forward(&mut cursor), vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]);
        assert_eq!(cursor.step().unwrap_err().kind(), ErrorKind::NotFound);

        cursor.jump_back(None).unwrap();
        assert_eq!(cursor.get_key(false).unwrap(), b"d".to_vec());
        cursor.step_back().unwrap();
        cursor.step_back().unwrap();
        assert_eq!(cursor.get(false).unwrap(), (b"b".to_vec(), b"B".to_vec()));
        cursor.step_back().unwrap();
        assert_eq!(cursor.step_back().unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_tree_jump_to_nearest() {
        let db = filled("%", &["apple", "cherry"]);
        let mut cursor = db.cursor().unwrap();
        cursor.jump(Some(b"banana")).unwrap();
        assert_eq!(cursor.get_key(false).unwrap(), b"cherry".to_vec());
        cursor.jump_back(Some(b"banana")).unwrap();
        assert_eq!(cursor.get_key(false).unwrap(), b"apple".to_vec());
        assert_eq!(cursor.jump(Some(b"zebra")).unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(cursor.get(false).unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_hash_cursor_visits_every_record_once() {
        let keys: Vec<String> = (0..50).map(|i| format!("key-{}", i)).collect();
        let refs: Vec<&str> = keys.iter().map(String::as_str).collect();
        let db = filled(":", &refs);
        let mut cursor = db.cursor().unwrap();
        cursor.jump(None).unwrap();
        let mut seen = collect_forward(&mut cursor);
        seen.sort();
        let mut expected: Vec<Vec<u8>> = keys.iter().map(|k| k.as_bytes().to_vec()).collect();
        expected.sort();
        assert_eq!(seen, expected);

        assert_eq!(cursor.jump_back(None).unwrap_err().kind(), ErrorKind::Unimplemented);
        cursor.jump(Some(b"key-7")).unwrap();
        assert_eq!(cursor.step_back().unwrap_err().kind(), ErrorKind::Unimplemented);
        assert_eq!(cursor.jump(Some(b"missing")).unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_remove_advances() {
        let db = filled("%", &["a", "b", "c"]);
        let mut cursor = db.cursor().unwrap();
        cursor.jump(Some(b"b")).unwrap();
        cursor.remove().unwrap();
        assert_eq!(cursor.get_key(false).unwrap(), b"c".to_vec());
        assert_eq!(cursor.seize().unwrap(), (b"c".to_vec(), b"C".to_vec()));
        assert_eq!(cursor.remove().unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(db.count().unwrap(), 1);
    }

    #[test]
    fn test_record_removed_underneath() {
        let db = filled("%", &["a", "b", "c"]);
        let mut cursor = db.cursor().unwrap();
        cursor.jump(Some(b"b")).unwrap();
        db.remove(b"b").unwrap();
        assert_eq!(cursor.get(false).unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(cursor.set_value(b"x", false).unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(db.get(b"b").unwrap(), None);
        cursor.step().unwrap();
        assert_eq!(cursor.get_key(false).unwrap(), b"c".to_vec());
    }

    #[test]
    fn test_hash_cursor_skips_removed_keys() {
        let db = filled(":", &["a", "b", "c"]);
        let mut cursor = db.cursor().unwrap();
        cursor.jump(None).unwrap();
        let first = cursor.get_key(false).unwrap();
        for key in [b"a", b"b", b"c"] {
            if key.as_slice() != first.as_slice() {
                db.remove(key).unwrap();
            }
        }
        assert_eq!(cursor.step().unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_set_value_and_accept() {
        let db = filled("%", &["a", "b"]);
        let mut cursor = db.cursor().unwrap();
        cursor.jump(None).unwrap();
        cursor.set_value(b"first", true).unwrap();
        assert_eq!(cursor.get_key(false).unwrap(), b"b".to_vec());

        let mut replace = FnVisitor::full(|_: &[u8], value: &[u8]| VisitOutcome::Replace([value, b"!".as_slice()].concat()));
        assert_eq!(cursor.accept(&mut replace, false, false).unwrap_err().kind(), ErrorKind::InvalidState);
        cursor.accept(&mut replace, true, true).unwrap();
        assert_eq!(db.get(b"a").unwrap(), Some(b"first".to_vec()));
        assert_eq!(db.get(b"b").unwrap(), Some(b"B!".to_vec()));
        assert_eq!(cursor.get(false).unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_disable_and_close() {
        let db = filled("%", &["a"]);
        let mut cursor = db.cursor().unwrap();
        cursor.jump(None).unwrap();
        cursor.disable();
        assert!(cursor.is_disabled());
        assert_eq!(cursor.jump(None).unwrap_err().kind(), ErrorKind::InvalidState);

        let mut cursor = db.cursor().unwrap();
        cursor.jump(None).unwrap();
        db.close().unwrap();
        db.open("%", OpenMode::default()).unwrap();
        db.set(b"a", b"again").unwrap();
        assert_eq!(cursor.get(false).unwrap_err().kind(), ErrorKind::InvalidState);
        assert!(cursor.is_disabled());
    }

    #[test]
    fn test_cursor_process() {
        let db = filled("%", &["x", "y"]);
        let keys = db
            .cursor_process(|cursor| {
                cursor.jump(None).unwrap();
                collect_forward(cursor)
            })
            .unwrap();
        assert_eq!(keys.len(), 2);

        db.close().unwrap();
        assert_eq!(db.cursor().unwrap_err().kind(), ErrorKind::InvalidState);
    }
}
