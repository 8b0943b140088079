//! Key matching: prefix, regular expression and edit distance.
//!
//! Results come back in key order (edit-distance matches by distance
//! first), capped at `limit` when one is given.

use regex::bytes::Regex;

use casket_core::{CasketError, CasketResult};

use crate::db::Db;

impl Db {
    /// Keys starting with `prefix`.
    pub fn match_prefix(&self, prefix: &[u8], limit: Option<usize>) -> CasketResult<Vec<Vec<u8>>> {
        self.run(|store| Ok(store.prefix_keys(prefix, limit)))
    }

    /// Keys matched anywhere by the regular expression `pattern`.
    pub fn match_regex(&self, pattern: &str, limit: Option<usize>) -> CasketResult<Vec<Vec<u8>>> {
        let regex = match Regex::new(pattern) {
            Ok(regex) => regex,
            Err(e) => {
                return self.track(Err(CasketError::InvalidArgs { reason: format!("invalid pattern: {}", e) }));
            }
        };
        self.run(|store| {
            let ordered = store.kind().is_ordered();
            let mut keys = Vec::new();
            for key in store.keys() {
                if regex.is_match(&key) {
                    keys.push(key);
                    // Tree keys already arrive sorted
                    if ordered && limit.is_some_and(|limit| keys.len() >= limit) {
                        break;
                    }
                }
            }
            if !ordered {
                keys.sort();
            }
            if let Some(limit) = limit {
                keys.truncate(limit);
            }
            Ok(keys)
        })
    }

    /// Keys within edit distance `range` of `origin`, nearest first.
    ///
    /// With `utf` the distance counts characters of the UTF-8 decoding
    /// instead of bytes.
    pub fn match_similar(
        &self,
        origin: &[u8],
        range: usize,
        utf: bool,
        limit: Option<usize>,
    ) -> CasketResult<Vec<Vec<u8>>> {
        let origin_chars: Vec<char> = String::from_utf8_lossy(origin).chars().collect();
        self.run(|store| {
            let mut scored: Vec<(usize, Vec<u8>)> = store
                .keys()
                .into_iter()
                .filter_map(|key| {
                    let distance = if utf {
                        let chars: Vec<char> = String::from_utf8_lossy(&key).chars().collect();
                        levenshtein(&origin_chars, &chars)
                    } else {
                        levenshtein(origin, &key)
                    };
                    (distance <= range).then_some((distance, key))
                })
                .collect();
            scored.sort();
            let keys = scored.into_iter().map(|(_, key)| key);
            Ok(match limit {
                Some(limit) => keys.take(limit).collect(),
                None => keys.collect(),
            })
        })
    }
}

/// Edit distance counting insertions, deletions and substitutions.
fn levenshtein<T: PartialEq>(a: &[T], b: &[T]) -> usize {
    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0; b.len() + 1];
    for (i, x) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, y) in b.iter().enumerate() {
            let cost = usize::from(x != y);
            current[j + 1] = (previous[j + 1] + 1).min(current[j] + 1).min(previous[j] + cost);
        }
        std::mem::swap(&mut previous, &mut current);
    }
    previous[b.len()]
}
