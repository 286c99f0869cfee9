use crossbeam_skiplist::SkipMap;

/// Location of the live record for a key: the segment holding it, the
/// position and size of its value bytes, and the record's timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct KeydirEntry {
    pub segment_id: u64,
    pub value_offset: u64,
    pub value_size: u32,
    pub timestamp: u64,
}

/// The in-memory index mapping each key to the location of its live record.
/// Reads are lock-free and safe to run concurrently with the single writer;
/// mutations happen only under the engine write lock.
#[derive(Debug, Default)]
pub(crate) struct Keydir {
    map: SkipMap<Vec<u8>, KeydirEntry>,
}

impl Keydir {
    pub fn new() -> Self {
        Keydir { map: SkipMap::new() }
    }

    pub fn get(&self, key: &[u8]) -> Option<KeydirEntry> {
        self.map.get(key).map(|e| *e.value())
    }

    /// Unconditionally replace the entry for `key`, returning the previous
    /// entry if there was one.
    pub fn insert(&self, key: Vec<u8>, entry: KeydirEntry) -> Option<KeydirEntry> {
        let prev = self.map.get(&key).map(|e| *e.value());
        self.map.insert(key, entry);
        prev
    }

    pub fn remove(&self, key: &[u8]) -> Option<KeydirEntry> {
        self.map.remove(key).map(|e| *e.value())
    }

    /// Replace the entry for `key` only if it still points at `old`. Used by
    /// the merge commit; a concurrent overwrite or delete wins the race.
    pub fn compare_swap(&self, key: Vec<u8>, old: KeydirEntry, new: KeydirEntry) -> bool {
        match self.map.get(&key) {
            Some(e) if e.value().segment_id == old.segment_id
                && e.value().value_offset == old.value_offset =>
            {
                self.map.insert(key, new);
                true
            }
            _ => false,
        }
    }

    /// Snapshot of all current keys.
    pub fn keys(&self) -> Vec<Vec<u8>> {
        self.map.iter().map(|e| e.key().clone()).collect()
    }

    /// Snapshot of all current key/entry pairs.
    pub fn entries(&self) -> Vec<(Vec<u8>, KeydirEntry)> {
        self.map.iter().map(|e| (e.key().clone(), *e.value())).collect()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(segment_id: u64, value_offset: u64) -> KeydirEntry {
        KeydirEntry { segment_id, value_offset, value_size: 1, timestamp: 0 }
    }

    #[test]
    fn insert_get_remove() {
        let keydir = Keydir::new();
        assert_eq!(keydir.insert(b"k".to_vec(), entry(0, 18)), None);
        assert_eq!(keydir.get(b"k"), Some(entry(0, 18)));
        assert_eq!(keydir.insert(b"k".to_vec(), entry(1, 18)), Some(entry(0, 18)));
        assert_eq!(keydir.remove(b"k"), Some(entry(1, 18)));
        assert_eq!(keydir.get(b"k"), None);
        assert_eq!(keydir.len(), 0);
    }

    #[test]
    fn compare_swap_respects_location() {
        let keydir = Keydir::new();
        keydir.insert(b"k".to_vec(), entry(0, 18));

        // A stale location loses the race.
        assert!(!keydir.compare_swap(b"k".to_vec(), entry(0, 99), entry(5, 18)));
        assert_eq!(keydir.get(b"k"), Some(entry(0, 18)));

        assert!(keydir.compare_swap(b"k".to_vec(), entry(0, 18), entry(5, 18)));
        assert_eq!(keydir.get(b"k"), Some(entry(5, 18)));

        // A removed key stays removed.
        keydir.remove(b"k");
        assert!(!keydir.compare_swap(b"k".to_vec(), entry(5, 18), entry(6, 18)));
        assert_eq!(keydir.get(b"k"), None);
    }

    #[test]
    fn keys_snapshot() {
        let keydir = Keydir::new();
        keydir.insert(b"a".to_vec(), entry(0, 18));
        keydir.insert(b"b".to_vec(), entry(0, 50));
        let mut keys = keydir.keys();
        keys.sort();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec()]);
    }
}
