use lru::LruCache;
use parking_lot::Mutex;
use std::hash::{Hash, Hasher};

const SHARDS: usize = 16;
/// Approximate per-entry bookkeeping cost added to the accounted size.
const ENTRY_OVERHEAD: usize = 64;

const KEY_SEPARATOR: u8 = 0x00;

/// Sharded LRU cache over serialized `ValueWithMetadata` records, keyed by
/// `(db, key)`. A `None` value is a negative entry: the key is known to be
/// absent from the backing store. The byte budget is split evenly across the
/// shards, each shard rounding its share up, so total consumption may exceed
/// the budget by up to one shard's granularity.
pub(crate) struct StateCache {
    shards: Vec<Mutex<Shard>>,
}

struct Shard {
    entries: LruCache<Vec<u8>, Option<Vec<u8>>>,
    bytes: usize,
    capacity: usize,
}

impl StateCache {
    pub(crate) fn new(size_bytes: usize) -> Self {
        let per_shard = size_bytes.div_ceil(SHARDS).max(1);
        let shards = (0..SHARDS)
            .map(|_| {
                Mutex::new(Shard {
                    entries: LruCache::unbounded(),
                    bytes: 0,
                    capacity: per_shard,
                })
            })
            .collect();
        StateCache { shards }
    }

    pub(crate) fn get(&self, db_name: &str, key: &str) -> Option<Option<Vec<u8>>> {
        let cache_key = cache_key(db_name, key);
        let mut shard = self.shards[shard_index(&cache_key)].lock();
        shard.entries.get(&cache_key).cloned()
    }

    /// Unconditional insert, used when populating on a read miss. `None`
    /// records a not-found result.
    pub(crate) fn put(&self, db_name: &str, key: &str, value: Option<Vec<u8>>) {
        let cache_key = cache_key(db_name, key);
        let mut shard = self.shards[shard_index(&cache_key)].lock();
        shard.insert(cache_key, value);
    }

    /// Replace-only insert, used on commit: a key already cached is updated,
    /// a key never read stays out of the cache.
    pub(crate) fn put_if_exist(&self, db_name: &str, key: &str, value: Vec<u8>) {
        let cache_key = cache_key(db_name, key);
        let mut shard = self.shards[shard_index(&cache_key)].lock();
        if shard.entries.contains(&cache_key) {
            shard.insert(cache_key, Some(value));
        }
    }

    pub(crate) fn purge(&self, db_name: &str, key: &str) {
        let cache_key = cache_key(db_name, key);
        let mut shard = self.shards[shard_index(&cache_key)].lock();
        shard.remove(&cache_key);
    }

    /// Drops every cached entry of `db_name`. Called when a database is
    /// deleted so a later re-creation cannot serve stale values.
    pub(crate) fn purge_db(&self, db_name: &str) {
        let mut prefix = db_name.as_bytes().to_vec();
        prefix.push(KEY_SEPARATOR);
        for shard in &self.shards {
            let mut shard = shard.lock();
            let stale: Vec<Vec<u8>> = shard
                .entries
                .iter()
                .filter(|(key, _)| key.starts_with(&prefix))
                .map(|(key, _)| key.clone())
                .collect();
            for key in stale {
                shard.remove(&key);
            }
        }
    }
}

impl Shard {
    fn insert(&mut self, key: Vec<u8>, value: Option<Vec<u8>>) {
        let size = entry_size(&key, &value);
        if let Some(old) = self.entries.put(key.clone(), value) {
            self.bytes -= entry_size(&key, &old);
        }
        self.bytes += size;
        while self.bytes > self.capacity {
            match self.entries.pop_lru() {
                Some((evicted_key, evicted_value)) => {
                    self.bytes -= entry_size(&evicted_key, &evicted_value);
                }
                None => break,
            }
        }
    }

    fn remove(&mut self, key: &[u8]) {
        if let Some(old) = self.entries.pop(key) {
            self.bytes -= entry_size(key, &old);
        }
    }
}

fn entry_size(key: &[u8], value: &Option<Vec<u8>>) -> usize {
    key.len() + value.as_ref().map_or(0, Vec::len) + ENTRY_OVERHEAD
}

fn cache_key(db_name: &str, key: &str) -> Vec<u8> {
    let mut cache_key = Vec::with_capacity(db_name.len() + 1 + key.len());
    cache_key.extend_from_slice(db_name.as_bytes());
    cache_key.push(KEY_SEPARATOR);
    cache_key.extend_from_slice(key.as_bytes());
    cache_key
}

fn shard_index(cache_key: &[u8]) -> usize {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    cache_key.hash(&mut hasher);
    (hasher.finish() as usize) % SHARDS
}
