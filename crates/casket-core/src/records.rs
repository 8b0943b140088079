//! In-memory record maps backing every store.
//!
//! A hash store is striped over several `RecordMap::Hash` buckets, each
//! behind its own lock; a tree store keeps one `RecordMap::Tree` so that key
//! order is available to cursors and range scans.

use std::collections::BTreeMap;
use std::ops::Bound;

use hashbrown::HashMap;

/// Physical organisation of a store's records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Unordered hash buckets
    Hash,
    /// Key-ordered tree
    Tree,
}

impl BackendKind {
    pub fn name(&self) -> &'static str {
        match self {
            BackendKind::Hash => "hash",
            BackendKind::Tree => "tree",
        }
    }

    /// Whether iteration follows lexicographic key order.
    pub fn is_ordered(&self) -> bool {
        matches!(self, BackendKind::Tree)
    }

    pub(crate) fn to_u8(self) -> u8 {
        match self {
            BackendKind::Hash => 1,
            BackendKind::Tree => 2,
        }
    }

    pub(crate) fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(BackendKind::Hash),
            2 => Some(BackendKind::Tree),
            _ => None,
        }
    }
}

/// One lockable unit of records.
#[derive(Debug)]
pub enum RecordMap {
    Hash(HashMap<Vec<u8>, Vec<u8>>),
    Tree(BTreeMap<Vec<u8>, Vec<u8>>),
}

impl RecordMap {
    pub fn new(kind: BackendKind) -> Self {
        match kind {
            BackendKind::Hash => RecordMap::Hash(HashMap::new()),
            BackendKind::Tree => RecordMap::Tree(BTreeMap::new()),
        }
    }

    pub fn get(&self, key: &[u8]) -> Option<&Vec<u8>> {
        match self {
            RecordMap::Hash(map) => map.get(key),
            RecordMap::Tree(map) => map.get(key),
        }
    }

    pub fn insert(&mut self, key: Vec<u8>, value: Vec<u8>) -> Option<Vec<u8>> {
        match self {
            RecordMap::Hash(map) => map.insert(key, value),
            RecordMap::Tree(map) => map.insert(key, value),
        }
    }

    pub fn remove(&mut self, key: &[u8]) -> Option<Vec<u8>> {
        match self {
            RecordMap::Hash(map) => map.remove(key),
            RecordMap::Tree(map) => map.remove(key),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            RecordMap::Hash(map) => map.len(),
            RecordMap::Tree(map) => map.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        match self {
            RecordMap::Hash(map) => map.clear(),
            RecordMap::Tree(map) => map.clear(),
        }
    }

    /// Visit every record in the map's native order.
    pub fn for_each(&self, mut f: impl FnMut(&[u8], &[u8])) {
        match self {
            RecordMap::Hash(map) => map.iter().for_each(|(k, v)| f(k.as_slice(), v.as_slice())),
            RecordMap::Tree(map) => map.iter().for_each(|(k, v)| f(k.as_slice(), v.as_slice())),
        }
    }

    /// Keys in native order.
    pub fn keys(&self) -> Vec<Vec<u8>> {
        match self {
            RecordMap::Hash(map) => map.keys().cloned().collect(),
            RecordMap::Tree(map) => map.keys().cloned().collect(),
        }
    }

    /// First key in native order.
    pub fn first_key(&self) -> Option<Vec<u8>> {
        match self {
            RecordMap::Hash(map) => map.keys().next().cloned(),
            RecordMap::Tree(map) => map.keys().next().cloned(),
        }
    }

    // Ordered navigation; hash maps answer None and callers check the kind first.

    pub fn last_key(&self) -> Option<Vec<u8>> {
        match self {
            RecordMap::Hash(_) => None,
            RecordMap::Tree(map) => map.keys().next_back().cloned(),
        }
    }

    /// Smallest key `>= key`.
    pub fn ceiling_key(&self, key: &[u8]) -> Option<Vec<u8>> {
        match self {
            RecordMap::Hash(_) => None,
            RecordMap::Tree(map) => map
                .range::<[u8], _>((Bound::Included(key), Bound::Unbounded))
                .next()
                .map(|(k, _)| k.clone()),
        }
    }

    /// Largest key `<= key`.
    pub fn floor_key(&self, key: &[u8]) -> Option<Vec<u8>> {
        match self {
            RecordMap::Hash(_) => None,
            RecordMap::Tree(map) => map
                .range::<[u8], _>((Bound::Unbounded, Bound::Included(key)))
                .next_back()
                .map(|(k, _)| k.clone()),
        }
    }

    /// Smallest key strictly greater than `key`.
    pub fn key_after(&self, key: &[u8]) -> Option<Vec<u8>> {
        match self {
            RecordMap::Hash(_) => None,
            RecordMap::Tree(map) => map
                .range::<[u8], _>((Bound::Excluded(key), Bound::Unbounded))
                .next()
                .map(|(k, _)| k.clone()),
        }
    }

    /// Largest key strictly less than `key`.
    pub fn key_before(&self, key: &[u8]) -> Option<Vec<u8>> {
        match self {
            RecordMap::Hash(_) => None,
            RecordMap::Tree(map) => map
                .range::<[u8], _>((Bound::Unbounded, Bound::Excluded(key)))
                .next_back()
                .map(|(k, _)| k.clone()),
        }
    }

    /// Keys starting with `prefix`, at most `limit` of them.
    ///
    /// Tree maps seek straight to the prefix; hash maps scan linearly.
    pub fn prefix_keys(&self, prefix: &[u8], limit: Option<usize>) -> Vec<Vec<u8>> {
        let limit = limit.unwrap_or(usize::MAX);
        match self {
            RecordMap::Hash(map) => map
                .keys()
                .filter(|k| k.starts_with(prefix))
                .take(limit)
                .cloned()
                .collect(),
            RecordMap::Tree(map) => map
                .range::<[u8], _>((Bound::Included(prefix), Bound::Unbounded))
                .map(|(k, _)| k)
                .take_while(|k| k.starts_with(prefix))
                .take(limit)
                .cloned()
                .collect(),
        }
    }
}

/// Bucket index for `key` among `buckets` stripes.
pub fn bucket_index(key: &[u8], buckets: usize) -> usize {
    if buckets <= 1 {
        return 0;
    }
    (crc32c::crc32c(key) as usize) % buckets
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(kind: BackendKind) -> RecordMap {
        let mut map = RecordMap::new(kind);
        for key in ["b", "d", "a", "c", "ab"] {
            map.insert(key.as_bytes().to_vec(), key.to_uppercase().into_bytes());
        }
        map
    }

    #[test]
    fn test_basic_ops_both_kinds() {
        for kind in [BackendKind::Hash, BackendKind::Tree] {
            let mut map = filled(kind);
            assert_eq!(map.len(), 5);
            assert_eq!(map.get(b"a"), Some(&b"A".to_vec()));
            assert_eq!(map.insert(b"a".to_vec(), b"x".to_vec()), Some(b"A".to_vec()));
            assert_eq!(map.remove(b"a"), Some(b"x".to_vec()));
            assert_eq!(map.remove(b"a"), None);
            map.clear();
            assert!(map.is_empty());
        }
    }

    #[test]
    fn test_tree_navigation() {
        let map = filled(BackendKind::Tree);
        assert_eq!(map.first_key(), Some(b"a".to_vec()));
        assert_eq!(map.last_key(), Some(b"d".to_vec()));
        assert_eq!(map.key_after(b"a"), Some(b"ab".to_vec()));
        assert_eq!(map.key_before(b"b"), Some(b"ab".to_vec()));
        assert_eq!(map.ceiling_key(b"bb"), Some(b"c".to_vec()));
        assert_eq!(map.floor_key(b"bb"), Some(b"b".to_vec()));
        assert_eq!(map.key_after(b"d"), None);
        assert_eq!(map.keys(), vec![b"a".to_vec(), b"ab".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]);
    }

    #[test]
    fn test_hash_has_no_order() {
        let map = filled(BackendKind::Hash);
        assert!(map.first_key().is_some());
        assert_eq!(map.last_key(), None);
        assert_eq!(map.key_after(b"a"), None);
        assert!(!BackendKind::Hash.is_ordered());
    }

    #[test]
    fn test_prefix_keys() {
        let tree = filled(BackendKind::Tree);
        assert_eq!(tree.prefix_keys(b"a", None), vec![b"a".to_vec(), b"ab".to_vec()]);
        assert_eq!(tree.prefix_keys(b"a", Some(1)), vec![b"a".to_vec()]);

        let hash = filled(BackendKind::Hash);
        let mut keys = hash.prefix_keys(b"a", None);
        keys.sort();
        assert_eq!(keys, vec![b"a".to_vec(), b"ab".to_vec()]);
    }

    #[test]
    fn test_bucket_index_stable() {
        assert_eq!(bucket_index(b"anything", 1), 0);
        let idx = bucket_index(b"key", 16);
        assert!(idx < 16);
        assert_eq!(idx, bucket_index(b"key", 16));
    }
}
