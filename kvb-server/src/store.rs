//! # Ordered In-Memory Store
//!
//! Purpose: Hold the test server's key space in sorted order so SCAN cursors
//! are stable positions.

use std::collections::BTreeMap;

use parking_lot::Mutex;

/// Keys returned per SCAN page when the client sends no COUNT.
pub const DEFAULT_SCAN_COUNT: usize = 10;

#[derive(Debug, Default)]
pub struct Store {
    map: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl Store {
    pub fn new() -> Self {
        Store::default()
    }

    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.map.lock().get(key).cloned()
    }

    pub fn set(&self, key: Vec<u8>, value: Vec<u8>) {
        self.map.lock().insert(key, value);
    }

    pub fn delete(&self, key: &[u8]) -> bool {
        self.map.lock().remove(key).is_some()
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.map.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.map.lock().clear();
    }

    pub fn keys(&self) -> Vec<Vec<u8>> {
        self.map.lock().keys().cloned().collect()
    }

    /// Increments an integer value, creating it at 0 first.
    pub fn incr(&self, key: &[u8]) -> Result<i64, &'static str> {
        let mut map = self.map.lock();
        let current = match map.get(key) {
            Some(raw) => std::str::from_utf8(raw)
                .ok()
                .and_then(|text| text.parse::<i64>().ok())
                .ok_or("value is not an integer or out of range")?,
            None => 0,
        };
        let next = current
            .checked_add(1)
            .ok_or("increment or decrement would overflow")?;
        map.insert(key.to_vec(), next.to_string().into_bytes());
        Ok(next)
    }

    /// One SCAN page: the cursor is the number of keys already walked in sorted
    /// order. Returns the next cursor (0 when done) and the matching keys.
    pub fn scan(&self, cursor: usize, pattern: Option<&[u8]>, count: usize) -> (usize, Vec<Vec<u8>>) {
        let map = self.map.lock();
        let count = count.max(1);
        let matches = map
            .keys()
            .skip(cursor)
            .take(count)
            .filter(|key| pattern.map_or(true, |pattern| glob_match(pattern, key)))
            .cloned()
            .collect();
        let next = cursor + count;
        if next >= map.len() {
            (0, matches)
        } else {
            (next, matches)
        }
    }
}

/// Glob matching with `*`, `?` and backslash escapes.
pub fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    let (mut p, mut t) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() {
            match pattern[p] {
                b'*' => {
                    star = Some((p, t));
                    p += 1;
                    continue;
                }
                b'?' => {
                    p += 1;
                    t += 1;
                    continue;
                }
                b'\\' if p + 1 < pattern.len() && pattern[p + 1] == text[t] => {
                    p += 2;
                    t += 1;
                    continue;
                }
                byte if byte != b'\\' && byte == text[t] => {
                    p += 1;
                    t += 1;
                    continue;
                }
                _ => {}
            }
        }
        match star {
            Some((star_p, star_t)) => {
                p = star_p + 1;
                t = star_t + 1;
                star = Some((star_p, star_t + 1));
            }
            None => return false,
        }
    }

    while p < pattern.len() && pattern[p] == b'*' {
        p += 1;
    }
    p == pattern.len()
}
