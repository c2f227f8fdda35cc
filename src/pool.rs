//! Keyed object pool.
//!
//! A size-bounded multiset keyed by string, used to recycle expensive values
//! (open repository handles, lockfile descriptors) across requests. Entries
//! live in a per-shard arena; every entry is linked into two index-based
//! lists: the shard's global LRU list (eviction order) and its key's FIFO
//! list (lookup order). Shard selection hashes the key with a per-pool random
//! seed so adversarial keys cannot pile onto one shard.
//!
//! Locking rules: the shard mutex is held only for list surgery. The `new`
//! builder and the eviction callback always run outside it.

use std::collections::HashMap;
use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::Mutex;

use crate::errors::GitError;

/// Default total capacity across all shards.
pub const MAX_ENTRIES: usize = 256;

/// Default shard count.
pub const SHARDS: usize = 16;

const NIL: usize = usize::MAX;

pub type Builder<V> = Box<dyn Fn(&str) -> Result<V, GitError> + Send + Sync>;
pub type EvictCallback<V> = Box<dyn Fn(String, V) + Send + Sync>;

/// Construction options for [`KeyedPool`].
pub struct PoolOptions<V> {
    pub max_entries: usize,
    pub shards: usize,
    /// Called on `get` misses, outside the shard lock.
    pub new: Option<Builder<V>>,
    /// Called for every evicted value, outside the shard lock.
    pub on_evict: Option<EvictCallback<V>>,
}

impl<V> Default for PoolOptions<V> {
    fn default() -> Self {
        Self {
            max_entries: MAX_ENTRIES,
            shards: SHARDS,
            new: None,
            on_evict: None,
        }
    }
}

struct Slot<V> {
    key: String,
    value: Option<V>,
    g_prev: usize,
    g_next: usize,
    k_prev: usize,
    k_next: usize,
}

#[derive(Clone, Copy)]
struct KeyList {
    head: usize,
    tail: usize,
}

struct Shard<V> {
    slots: Vec<Slot<V>>,
    free: Vec<usize>,
    g_head: usize,
    g_tail: usize,
    keys: HashMap<String, KeyList>,
    len: usize,
}

impl<V> Shard<V> {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            g_head: NIL,
            g_tail: NIL,
            keys: HashMap::new(),
            len: 0,
        }
    }

    fn alloc(&mut self, key: String, value: V) -> usize {
        let slot = Slot {
            key,
            value: Some(value),
            g_prev: NIL,
            g_next: NIL,
            k_prev: NIL,
            k_next: NIL,
        };
        match self.free.pop() {
            Some(index) => {
                self.slots[index] = slot;
                index
            }
            None => {
                self.slots.push(slot);
                self.slots.len() - 1
            }
        }
    }

    fn link(&mut self, index: usize) {
        // Global list: append at the MRU tail.
        self.slots[index].g_prev = self.g_tail;
        self.slots[index].g_next = NIL;
        if self.g_tail != NIL {
            self.slots[self.g_tail].g_next = index;
        } else {
            self.g_head = index;
        }
        self.g_tail = index;

        // Key list: append at the FIFO tail.
        let key = self.slots[index].key.clone();
        match self.keys.get(&key).copied() {
            Some(list) => {
                self.slots[index].k_prev = list.tail;
                self.slots[list.tail].k_next = index;
                self.keys.get_mut(&key).expect("key list present").tail = index;
            }
            None => {
                self.keys.insert(
                    key,
                    KeyList {
                        head: index,
                        tail: index,
                    },
                );
            }
        }
        self.len += 1;
    }

    fn unlink(&mut self, index: usize) -> (String, V) {
        let (g_prev, g_next) = (self.slots[index].g_prev, self.slots[index].g_next);
        if g_prev != NIL {
            self.slots[g_prev].g_next = g_next;
        } else {
            self.g_head = g_next;
        }
        if g_next != NIL {
            self.slots[g_next].g_prev = g_prev;
        } else {
            self.g_tail = g_prev;
        }

        let (k_prev, k_next) = (self.slots[index].k_prev, self.slots[index].k_next);
        if k_prev != NIL {
            self.slots[k_prev].k_next = k_next;
        }
        if k_next != NIL {
            self.slots[k_next].k_prev = k_prev;
        }
        let key = self.slots[index].key.clone();
        let list = self.keys.get_mut(&key).expect("linked slot has a key list");
        if list.head == index {
            list.head = k_next;
        }
        if list.tail == index {
            list.tail = k_prev;
        }
        if list.head == NIL {
            self.keys.remove(&key);
        }

        let value = self.slots[index].value.take().expect("linked slot has a value");
        self.free.push(index);
        self.len -= 1;
        (key, value)
    }

    /// Remove and return the least-recently-used entry, if any.
    fn evict_lru(&mut self) -> Option<(String, V)> {
        if self.g_head == NIL {
            return None;
        }
        Some(self.unlink(self.g_head))
    }
}

/// Bounded, sharded, keyed LRU multiset.
pub struct KeyedPool<V> {
    shards: Vec<Mutex<Shard<V>>>,
    hasher: ahash::RandomState,
    max_per_shard: usize,
    new: Option<Builder<V>>,
    on_evict: Option<EvictCallback<V>>,
}

impl<V> KeyedPool<V> {
    pub fn new(options: PoolOptions<V>) -> Self {
        let shards = options.shards.max(1);
        let max_per_shard = (options.max_entries / shards).max(1);
        Self {
            shards: (0..shards).map(|_| Mutex::new(Shard::new())).collect(),
            // Seeded randomly per pool; keeps shard placement unpredictable.
            hasher: ahash::RandomState::new(),
            max_per_shard,
            new: options.new,
            on_evict: options.on_evict,
        }
    }

    fn shard_for(&self, key: &str) -> &Mutex<Shard<V>> {
        let mut hasher = self.hasher.build_hasher();
        key.hash(&mut hasher);
        let index = (hasher.finish() as usize) % self.shards.len();
        &self.shards[index]
    }

    fn run_evict(&self, evicted: Vec<(String, V)>) {
        for (key, value) in evicted {
            match &self.on_evict {
                Some(callback) => callback(key, value),
                None => drop(value),
            }
        }
    }

    /// Take one value associated with `key` out of the pool. On a miss the
    /// configured builder runs (outside any shard lock); without a builder
    /// the miss is `NotFound`.
    pub fn get(&self, key: &str) -> Result<V, GitError> {
        let hit = {
            let mut shard = self.shard_for(key).lock().unwrap();
            let head = shard.keys.get(key).map(|list| list.head);
            head.map(|index| shard.unlink(index).1)
        };
        match hit {
            Some(value) => Ok(value),
            None => match &self.new {
                Some(builder) => builder(key),
                None => Err(GitError::NotFound(key.to_string())),
            },
        }
    }

    /// Return a value to the pool at the most-recently-used position,
    /// evicting the least-recently-used entry when the shard is full.
    pub fn put(&self, key: impl Into<String>, value: V) {
        let key = key.into();
        let evicted = {
            let mut shard = self.shard_for(&key).lock().unwrap();
            let mut evicted = Vec::new();
            if shard.len >= self.max_per_shard {
                if let Some(entry) = shard.evict_lru() {
                    evicted.push(entry);
                }
            }
            let index = shard.alloc(key, value);
            shard.link(index);
            evicted
        };
        self.run_evict(evicted);
    }

    /// Evict every value currently associated with `key`.
    pub fn remove(&self, key: &str) {
        let evicted = {
            let mut shard = self.shard_for(key).lock().unwrap();
            let mut evicted = Vec::new();
            while let Some(index) = shard.keys.get(key).map(|list| list.head) {
                evicted.push(shard.unlink(index));
            }
            evicted
        };
        self.run_evict(evicted);
    }

    /// Evict everything.
    pub fn clear(&self) {
        let mut evicted = Vec::new();
        for shard in &self.shards {
            let mut shard = shard.lock().unwrap();
            while let Some(entry) = shard.evict_lru() {
                evicted.push(entry);
            }
        }
        self.run_evict(evicted);
    }

    /// Entry count across all shards.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().unwrap().len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
