//! Bounded key -> value cache with strict insertion-order eviction.
//!
//! Eviction order lives in a circular slot array separate from the map, so
//! neither reads nor value updates on an existing key ever move it.

use std::collections::HashMap;
use std::hash::Hash;

pub const DEFAULT_CAPACITY: usize = 500;

#[derive(Debug, Clone)]
pub struct FifoCache<K, V> {
    slots: Vec<Option<K>>,
    next: usize,
    map: HashMap<K, V>,
}

impl<K, V> FifoCache<K, V>
where
    K: Eq + Hash + Clone,
{
    /// A zero capacity is bumped to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: vec![None; capacity],
            next: 0,
            map: HashMap::with_capacity(capacity),
        }
    }

    pub fn set(&mut self, key: K, value: V) {
        if let Some(existing) = self.map.get_mut(&key) {
            *existing = value;
            return;
        }
        if let Some(evicted) = self.slots[self.next].take() {
            self.map.remove(&evicted);
        }
        self.slots[self.next] = Some(key.clone());
        self.map.insert(key, value);
        self.next = (self.next + 1) % self.slots.len();
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.map.get(key)
    }

    pub fn exists(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

impl<K, V> Default for FifoCache<K, V>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
