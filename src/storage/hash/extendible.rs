use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use parking_lot::RwLock;

/// Extendible hash table with directory doubling and bucket splitting.
///
/// The buffer pool uses it as the page table (`PageId -> FrameId`), but it
/// works as a generic map. All operations linearize under one reader/writer
/// latch: `find` takes it shared, `insert` and `remove` exclusive.
///
/// Buckets live in an arena and the directory holds arena indices, so the
/// aliasing that directory doubling creates (several slots sharing one
/// bucket) is plain index sharing under the latch. Buckets are never merged
/// on underflow.
pub struct ExtendibleHashTable<K, V> {
    state: RwLock<TableState<K, V>>,
}

struct TableState<K, V> {
    global_depth: usize,
    bucket_size: usize,
    /// Directory slot -> index into `buckets`; length is `2^global_depth`
    directory: Vec<usize>,
    /// Bucket arena; splitting appends, nothing is ever removed
    buckets: Vec<Bucket<K, V>>,
}

struct Bucket<K, V> {
    depth: usize,
    items: Vec<(K, V)>,
}

impl<K, V> ExtendibleHashTable<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    pub fn new(bucket_size: usize) -> Self {
        assert!(bucket_size >= 1, "bucket size must be positive");
        Self {
            state: RwLock::new(TableState {
                global_depth: 0,
                bucket_size,
                directory: vec![0],
                buckets: vec![Bucket { depth: 0, items: Vec::new() }],
            }),
        }
    }

    /// Look up the value most recently inserted for `key`
    pub fn find(&self, key: &K) -> Option<V> {
        let state = self.state.read();
        let bucket = &state.buckets[state.directory[state.index_of(key)]];
        bucket
            .items
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }

    /// Remove `key`, reporting whether it was present
    pub fn remove(&self, key: &K) -> bool {
        let mut state = self.state.write();
        let slot = state.directory[state.index_of(key)];
        let items = &mut state.buckets[slot].items;
        match items.iter().position(|(k, _)| k == key) {
            Some(pos) => {
                items.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Insert or overwrite `key`. Overflowing a bucket splits it, doubling
    /// the directory first whenever the bucket's local depth has caught up
    /// with the global depth; splits repeat until the key fits.
    pub fn insert(&self, key: K, value: V) {
        let mut state = self.state.write();
        loop {
            let slot = state.directory[state.index_of(&key)];
            let bucket_size = state.bucket_size;
            let bucket = &mut state.buckets[slot];

            if let Some((_, v)) = bucket.items.iter_mut().find(|(k, _)| *k == key) {
                *v = value;
                return;
            }
            if bucket.items.len() < bucket_size {
                bucket.items.push((key, value));
                return;
            }

            state.split_bucket(slot);
        }
    }

    pub fn global_depth(&self) -> usize {
        self.state.read().global_depth
    }

    pub fn local_depth(&self, dir_index: usize) -> usize {
        let state = self.state.read();
        state.buckets[state.directory[dir_index]].depth
    }

    pub fn num_buckets(&self) -> usize {
        self.state.read().buckets.len()
    }
}

impl<K, V> TableState<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    fn index_of(&self, key: &K) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) & ((1 << self.global_depth) - 1)
    }

    /// Split the bucket at arena index `slot`, doubling the directory first
    /// if its local depth equals the global depth
    fn split_bucket(&mut self, slot: usize) {
        if self.buckets[slot].depth == self.global_depth {
            for i in 0..self.directory.len() {
                let aliased = self.directory[i];
                self.directory.push(aliased);
            }
            self.global_depth += 1;
        }

        self.buckets[slot].depth += 1;
        let depth = self.buckets[slot].depth;
        let mask = (1 << depth) - 1;

        // The sibling's identity differs from the old bucket's in the new
        // top bit of the depth-bit suffix
        let old_identity = self.identity_of(slot, mask);
        let new_identity = old_identity ^ (1 << (depth - 1));

        let new_slot = self.buckets.len();
        self.buckets.push(Bucket { depth, items: Vec::new() });
        for i in 0..self.directory.len() {
            if i & mask == new_identity {
                self.directory[i] = new_slot;
            }
        }

        // Rehash the old bucket's entries; each lands back in the old bucket
        // or moves to the sibling
        let items = std::mem::take(&mut self.buckets[slot].items);
        for (k, v) in items {
            let target = self.directory[self.index_of(&k)];
            self.buckets[target].items.push((k, v));
        }
    }

    /// Low `mask` bits shared by every directory slot referencing `slot`
    fn identity_of(&self, slot: usize, mask: usize) -> usize {
        let dir_index = self
            .directory
            .iter()
            .position(|&b| b == slot)
            .expect("bucket not referenced by any directory slot");
        dir_index & mask
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_find_remove() {
        let table: ExtendibleHashTable<i32, String> = ExtendibleHashTable::new(4);
        table.insert(1, "a".to_string());
        table.insert(2, "b".to_string());
        table.insert(3, "c".to_string());

        assert_eq!(table.find(&1), Some("a".to_string()));
        assert_eq!(table.find(&2), Some("b".to_string()));
        assert_eq!(table.find(&3), Some("c".to_string()));
        assert_eq!(table.find(&4), None);

        assert!(table.remove(&2));
        assert!(!table.remove(&2));
        assert_eq!(table.find(&2), None);
    }

    #[test]
    fn test_insert_overwrites_existing_key() {
        let table: ExtendibleHashTable<i32, i32> = ExtendibleHashTable::new(2);
        table.insert(5, 100);
        table.insert(5, 200);
        assert_eq!(table.find(&5), Some(200));
    }

    #[test]
    fn test_splits_grow_depth_and_keep_entries() {
        let table: ExtendibleHashTable<i32, i32> = ExtendibleHashTable::new(2);
        for i in 0..64 {
            table.insert(i, i * 10);
        }

        assert!(table.global_depth() > 0);
        assert!(table.num_buckets() > 1);
        for i in 0..64 {
            assert_eq!(table.find(&i), Some(i * 10), "key {} lost", i);
        }
    }

    #[test]
    fn test_directory_invariant_after_splits() {
        let table: ExtendibleHashTable<u64, u64> = ExtendibleHashTable::new(2);
        for i in 0..128 {
            table.insert(i, i);
        }

        let state = table.state.read();
        assert_eq!(state.directory.len(), 1 << state.global_depth);
        for (i, &slot) in state.directory.iter().enumerate() {
            let bucket = &state.buckets[slot];
            assert!(bucket.depth <= state.global_depth);
            assert!(bucket.items.len() <= state.bucket_size);
            // Every slot aliasing this bucket agrees on the low depth bits
            let mask = (1 << bucket.depth) - 1;
            let identity = state
                .directory
                .iter()
                .position(|&b| b == slot)
                .unwrap()
                & mask;
            assert_eq!(i & mask, identity, "slot {} wired to wrong bucket", i);
            // Entries actually hash to this bucket
            for (k, _) in &bucket.items {
                assert_eq!(state.directory[state.index_of(k)], slot);
            }
        }
    }

    #[test]
    fn test_works_as_page_table() {
        let table: ExtendibleHashTable<i32, usize> = ExtendibleHashTable::new(4);
        for frame in 0..10usize {
            table.insert(frame as i32 + 100, frame);
        }
        assert_eq!(table.find(&105), Some(5));
        assert!(table.remove(&105));
        assert_eq!(table.find(&105), None);
        table.insert(200, 5);
        assert_eq!(table.find(&200), Some(5));
    }

    #[test]
    fn test_last_write_wins_under_splits() {
        let table: ExtendibleHashTable<i32, i32> = ExtendibleHashTable::new(2);
        for round in 0..4 {
            for i in 0..32 {
                table.insert(i, i + round * 1000);
            }
        }
        for i in 0..32 {
            assert_eq!(table.find(&i), Some(i + 3000));
        }
    }
}
