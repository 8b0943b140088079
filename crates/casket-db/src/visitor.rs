//! Visitor protocol and file processors.
//!
//! A visitor is handed a record (or the absence of one) and answers with a
//! [`VisitOutcome`]. Visitors run under the store's locks and must not call
//! back into the database they are visiting.

use casket_core::{CasketError, CasketResult, Change};

/// What a visitor wants done with the record it was shown.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum VisitOutcome {
    /// Leave the record untouched
    #[default]
    Nop,
    /// Delete the record
    Remove,
    /// Store this value
    Replace(Vec<u8>),
}

impl VisitOutcome {
    pub fn is_mutation(&self) -> bool {
        !matches!(self, VisitOutcome::Nop)
    }
}

/// Record callback used by `accept`, `accept_bulk`, `iterate` and cursors.
pub trait Visitor {
    /// Called for a key that has a record.
    fn visit_full(&mut self, key: &[u8], value: &[u8]) -> VisitOutcome {
        let _ = (key, value);
        VisitOutcome::Nop
    }

    /// Called for a key that has no record.
    fn visit_empty(&mut self, key: &[u8]) -> VisitOutcome {
        let _ = key;
        VisitOutcome::Nop
    }

    /// Called once before a whole-store iteration.
    fn visit_before(&mut self) {}

    /// Called once after a whole-store iteration.
    fn visit_after(&mut self) {}
}

/// Visitor built from closures.
pub struct FnVisitor<F, E> {
    full: F,
    empty: E,
}

type NoEmpty = fn(&[u8]) -> VisitOutcome;

impl<F> FnVisitor<F, NoEmpty>
where
    F: FnMut(&[u8], &[u8]) -> VisitOutcome,
{
    /// Visitor that only cares about existing records.
    pub fn full(full: F) -> Self {
        Self { full, empty: |_| VisitOutcome::Nop }
    }
}

impl<F, E> FnVisitor<F, E>
where
    F: FnMut(&[u8], &[u8]) -> VisitOutcome,
    E: FnMut(&[u8]) -> VisitOutcome,
{
    pub fn new(full: F, empty: E) -> Self {
        Self { full, empty }
    }
}

impl<F, E> Visitor for FnVisitor<F, E>
where
    F: FnMut(&[u8], &[u8]) -> VisitOutcome,
    E: FnMut(&[u8]) -> VisitOutcome,
{
    fn visit_full(&mut self, key: &[u8], value: &[u8]) -> VisitOutcome {
        (self.full)(key, value)
    }

    fn visit_empty(&mut self, key: &[u8]) -> VisitOutcome {
        (self.empty)(key)
    }
}

/// Callback run against the store's files while the store is held still,
/// by `synchronize` and `occupy`. Returning `false` fails the operation.
pub trait FileProcessor {
    fn process(&mut self, path: &str, count: u64, size: u64) -> bool;
}

impl<F> FileProcessor for F
where
    F: FnMut(&str, u64, u64) -> bool,
{
    fn process(&mut self, path: &str, count: u64, size: u64) -> bool {
        self(path, count, size)
    }
}

/// Show `current` to the visitor and turn its answer into a store change.
///
/// A mutating answer in a read-only visit is refused and nothing changes.
pub(crate) fn visit<V: Visitor + ?Sized>(
    visitor: &mut V,
    key: &[u8],
    current: Option<&[u8]>,
    writable: bool,
) -> CasketResult<Change> {
    let outcome = match current {
        Some(value) => visitor.visit_full(key, value),
        None => visitor.visit_empty(key),
    };
    if !writable && outcome.is_mutation() {
        return Err(CasketError::invalid_state("visitor tried to modify a record in a read-only visit"));
    }
    Ok(match outcome {
        VisitOutcome::Nop => Change::Keep,
        VisitOutcome::Remove => Change::Remove,
        VisitOutcome::Replace(value) => Change::Put(value),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use casket_core::ErrorKind;

    struct Counter {
        full: usize,
        empty: usize,
        before: bool,
    }

    impl Visitor for Counter {
        fn visit_full(&mut self, _key: &[u8], _value: &[u8]) -> VisitOutcome {
            self.full += 1;
            VisitOutcome::Nop
        }

        fn visit_empty(&mut self, _key: &[u8]) -> VisitOutcome {
            self.empty += 1;
            VisitOutcome::Replace(b"fresh".to_vec())
        }

        fn visit_before(&mut self) {
            self.before = true;
        }
    }

    #[test]
    fn test_dispatch_full_and_empty() {
        let mut counter = Counter { full: 0, empty: 0, before: false };
        assert_eq!(visit(&mut counter, b"k", Some(b"v"), true).unwrap(), Change::Keep);
        assert_eq!(visit(&mut counter, b"k", None, true).unwrap(), Change::Put(b"fresh".to_vec()));
        assert_eq!((counter.full, counter.empty), (1, 1));
        counter.visit_before();
        assert!(counter.before);
    }

    #[test]
    fn test_read_only_visit_refuses_mutation() {
        let mut counter = Counter { full: 0, empty: 0, before: false };
        let err = visit(&mut counter, b"k", None, false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        assert!(visit(&mut counter, b"k", Some(b"v"), false).is_ok());
    }

    #[test]
    fn test_fn_visitor() {
        let mut seen = Vec::new();
        let mut visitor = FnVisitor::full(|key: &[u8], _value: &[u8]| {
            seen.push(key.to_vec());
            VisitOutcome::Remove
        });
        assert_eq!(visit(&mut visitor, b"a", Some(b"1"), true).unwrap(), Change::Remove);
        assert_eq!(visit(&mut visitor, b"b", None, true).unwrap(), Change::Keep);
        drop(visitor);
        assert_eq!(seen, vec![b"a".to_vec()]);
    }

    #[test]
    fn test_closure_file_processor() {
        let mut calls = 0;
        let mut processor = |path: &str, count: u64, _size: u64| {
            calls += 1;
            path == "x.kch" && count == 3
        };
        assert!(processor.process("x.kch", 3, 10));
        assert!(!processor.process("y.kch", 3, 10));
        assert_eq!(calls, 2);
    }
}
