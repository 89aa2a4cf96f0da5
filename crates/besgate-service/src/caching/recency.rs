//! Ordering of cache entries by last access.

use std::collections::BTreeMap;
use std::time::Instant;

/// Position of a cache entry in the recency order.
///
/// Ordered by last access time first; the serial number breaks ties between
/// entries touched within the same clock tick, so the order is total and
/// deterministic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct RecencyKey {
    pub last_access: Instant,
    pub serial: u64,
}

/// The least-recently-accessed index over cache entries.
///
/// Holds resource keys ordered oldest-to-newest. The owning cache keeps this
/// index and its key/entry map in lock-step under one mutex; an entry whose
/// access time changes must be removed and reinserted, never reordered in
/// place.
#[derive(Debug, Default)]
pub(crate) struct RecencyIndex {
    index: BTreeMap<RecencyKey, String>,
}

impl RecencyIndex {
    pub fn insert(&mut self, key: RecencyKey, resource: String) {
        let previous = self.index.insert(key, resource);
        debug_assert!(previous.is_none(), "recency key collision");
    }

    pub fn remove(&mut self, key: &RecencyKey) {
        self.index.remove(key);
    }

    /// Removes and returns the `count` oldest entries.
    pub fn pop_oldest(&mut self, count: usize) -> Vec<(RecencyKey, String)> {
        let victims: Vec<RecencyKey> = self.index.keys().take(count).copied().collect();
        victims
            .into_iter()
            .map(|key| {
                let resource = self.index.remove(&key).unwrap();
                (key, resource)
            })
            .collect()
    }

    /// Resource keys ordered oldest-to-newest.
    pub fn keys_oldest_first(&self) -> Vec<String> {
        self.index.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn clear(&mut self) {
        self.index.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(base: Instant, offset_ns: u64, serial: u64) -> RecencyKey {
        RecencyKey {
            last_access: base + std::time::Duration::from_nanos(offset_ns),
            serial,
        }
    }

    #[test]
    fn test_ordering_by_access_time() {
        let base = Instant::now();
        let mut index = RecencyIndex::default();
        index.insert(key(base, 30, 2), "c".into());
        index.insert(key(base, 10, 0), "a".into());
        index.insert(key(base, 20, 1), "b".into());
        assert_eq!(index.keys_oldest_first(), ["a", "b", "c"]);
    }

    #[test]
    fn test_serial_breaks_ties() {
        let base = Instant::now();
        let mut index = RecencyIndex::default();
        index.insert(key(base, 0, 7), "later".into());
        index.insert(key(base, 0, 3), "earlier".into());
        assert_eq!(index.keys_oldest_first(), ["earlier", "later"]);
    }

    #[test]
    fn test_pop_oldest() {
        let base = Instant::now();
        let mut index = RecencyIndex::default();
        for (i, name) in ["a", "b", "c", "d"].iter().enumerate() {
            index.insert(key(base, i as u64 * 10, i as u64), (*name).into());
        }
        let popped = index.pop_oldest(2);
        let names: Vec<_> = popped.into_iter().map(|(_, name)| name).collect();
        assert_eq!(names, ["a", "b"]);
        assert_eq!(index.len(), 2);
        assert_eq!(index.keys_oldest_first(), ["c", "d"]);
    }

    #[test]
    fn test_pop_more_than_available() {
        let base = Instant::now();
        let mut index = RecencyIndex::default();
        index.insert(key(base, 0, 0), "only".into());
        let popped = index.pop_oldest(5);
        assert_eq!(popped.len(), 1);
        assert_eq!(index.len(), 0);
    }
}
