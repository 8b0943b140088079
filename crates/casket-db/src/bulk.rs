//! Multi-key operations.
//!
//! Non-atomic bulk operations are a loop of point operations; other threads
//! may interleave between keys. Atomic ones hold the whole store exclusively
//! for the duration and log their writes as one WAL batch, so readers never
//! see a partial result and crash recovery restores all of it or none.

use std::collections::BTreeMap;

use casket_core::{CasketResult, Change, Exclusive};

use crate::db::Db;

impl Db {
    /// Values of the present keys; absent keys are omitted.
    pub fn get_bulk<K: AsRef<[u8]>>(&self, keys: &[K], atomic: bool) -> CasketResult<BTreeMap<Vec<u8>, Vec<u8>>> {
        let collect = |get: &dyn Fn(&[u8]) -> Option<Vec<u8>>| {
            keys.iter()
                .filter_map(|key| get(key.as_ref()).map(|value| (key.as_ref().to_vec(), value)))
                .collect::<BTreeMap<_, _>>()
        };
        if atomic {
            self.run(|store| store.exclusive(|ex| Ok(collect(&|key| ex.get(key)))))
        } else {
            self.run(|store| Ok(collect(&|key| store.get(key))))
        }
    }

    /// Store every record; returns how many were written.
    pub fn set_bulk<K, V>(&self, records: &[(K, V)], atomic: bool) -> CasketResult<usize>
    where
        K: AsRef<[u8]>,
        V: AsRef<[u8]>,
    {
        let put = |value: &V| Ok((Change::Put(value.as_ref().to_vec()), ()));
        if atomic {
            self.run_mut("set_bulk", |store| {
                store.exclusive(|ex| {
                    ex.batch(|ex: &Exclusive<'_>| {
                        for (key, value) in records {
                            ex.update(key.as_ref(), |_| put(value))?;
                        }
                        Ok(records.len())
                    })
                })
            })
        } else {
            self.run_mut("set_bulk", |store| {
                for (key, value) in records {
                    store.update(key.as_ref(), |_| put(value))?;
                }
                Ok(records.len())
            })
        }
    }

    /// Remove every present key; returns how many records were removed.
    pub fn remove_bulk<K: AsRef<[u8]>>(&self, keys: &[K], atomic: bool) -> CasketResult<usize> {
        let take = |current: Option<&[u8]>| -> CasketResult<(Change, bool)> {
            Ok(match current {
                Some(_) => (Change::Remove, true),
                None => (Change::Keep, false),
            })
        };
        if atomic {
            self.run_mut("remove_bulk", |store| {
                store.exclusive(|ex| {
                    ex.batch(|ex: &Exclusive<'_>| {
                        let mut removed = 0;
                        for key in keys {
                            if ex.update(key.as_ref(), take)? {
                                removed += 1;
                            }
                        }
                        Ok(removed)
                    })
                })
            })
        } else {
            self.run_mut("remove_bulk", |store| {
                let mut removed = 0;
                for key in keys {
                    if store.update(key.as_ref(), take)? {
                        removed += 1;
                    }
                }
                Ok(removed)
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mode::OpenMode;
    use casket_core::{Config, ErrorKind};
    use tempfile::TempDir;

    fn open(path: &str) -> Db {
        let db = Db::new();
        db.open(path, OpenMode::default()).unwrap();
        db
    }

    #[test]
    fn test_bulk_round() {
        for atomic in [false, true] {
            let db = open("%");
            let written = db.set_bulk(&[("a", "1"), ("b", "2"), ("c", "3")], atomic).unwrap();
            assert_eq!(written, 3);

            let found = db.get_bulk(&["a", "c", "missing"], atomic).unwrap();
            assert_eq!(found.len(), 2);
            assert_eq!(found[b"a".as_slice()], b"1".to_vec());
            assert_eq!(found[b"c".as_slice()], b"3".to_vec());

            let removed = db.remove_bulk(&["a", "missing", "b"], atomic).unwrap();
            assert_eq!(removed, 2);
            assert_eq!(db.count().unwrap(), 1);
        }
    }

    #[test]
    fn test_failed_atomic_bulk_writes_nothing() {
        let db = Db::with_config(Config::default().with_max_value_size(4));
        db.open("%", OpenMode::default()).unwrap();
        db.set(b"a", b"old").unwrap();

        let result = db.set_bulk(&[("a", "new"), ("b", "1"), ("c", "too long")], true);
        assert_eq!(result.unwrap_err().kind(), ErrorKind::InvalidArgs);
        assert_eq!(db.count().unwrap(), 1);
        assert_eq!(db.get(b"a").unwrap(), Some(b"old".to_vec()));

        // Non-atomic keeps what was written before the failure
        assert!(db.set_bulk(&[("b", "1"), ("c", "too long")], false).is_err());
        assert_eq!(db.count().unwrap(), 2);
    }

    #[test]
    fn test_bulk_on_closed_handle() {
        let db = open(":");
        db.close().unwrap();
        assert_eq!(db.set_bulk(&[("k", "v")], true).unwrap_err().kind(), ErrorKind::InvalidState);
    }

    #[test]
    fn test_atomic_bulk_survives_reopen() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("bulk.kct");
        let path = path.to_str().unwrap();
        let records: Vec<(String, String)> = (0..100).map(|i| (format!("k{:03}", i), format!("v{}", i))).collect();
        {
            let db = open(path);
            assert_eq!(db.set_bulk(&records, true).unwrap(), 100);
            assert_eq!(db.remove_bulk(&["k000", "k001"], true).unwrap(), 2);
        }
        let db = open(path);
        assert_eq!(db.count().unwrap(), 98);
        assert_eq!(db.get(b"k050").unwrap(), Some(b"v50".to_vec()));
    }
}
