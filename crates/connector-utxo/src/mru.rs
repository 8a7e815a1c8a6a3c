//! Insertion-ordered cache with O(1) lookup, removal and oldest-first eviction.
//!
//! Entries live in a [`SlotMap`] and are threaded through a doubly linked list
//! by handle, oldest at the head. A [`HashMap`] indexes keys to handles.

use slotmap::{DefaultKey, SlotMap};
use std::collections::HashMap;
use std::hash::Hash;

struct Node<K, V> {
    key: K,
    value: V,
    prev: Option<DefaultKey>,
    next: Option<DefaultKey>,
}

/// Most-recently-used ordered map.
///
/// [`insert`](Self::insert) always places the key at the newest end, even when
/// it overwrites an existing value. Lookups do not reorder.
pub struct MruCache<K, V> {
    nodes: SlotMap<DefaultKey, Node<K, V>>,
    index: HashMap<K, DefaultKey>,
    oldest: Option<DefaultKey>,
    newest: Option<DefaultKey>,
}

impl<K: Hash + Eq + Clone, V> Default for MruCache<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Hash + Eq + Clone, V> MruCache<K, V> {
    pub fn new() -> Self {
        Self {
            nodes: SlotMap::new(),
            index: HashMap::new(),
            oldest: None,
            newest: None,
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.index.contains_key(key)
    }

    /// Inserts or overwrites `key`, marking it most recently used.
    /// Returns the previous value.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        let previous = self.remove(&key);

        let handle = self.nodes.insert(Node {
            key: key.clone(),
            value,
            prev: self.newest,
            next: None,
        });
        match self.newest {
            Some(newest) => self.nodes[newest].next = Some(handle),
            None => self.oldest = Some(handle),
        }
        self.newest = Some(handle);
        self.index.insert(key, handle);

        previous
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.index.get(key).map(|handle| &self.nodes[*handle].value)
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let handle = self.index.remove(key)?;
        let node = self.nodes.remove(handle)?;

        match node.prev {
            Some(prev) => self.nodes[prev].next = node.next,
            None => self.oldest = node.next,
        }
        match node.next {
            Some(next) => self.nodes[next].prev = node.prev,
            None => self.newest = node.prev,
        }

        Some(node.value)
    }

    /// Returns the least recently inserted entry.
    pub fn peek_oldest(&self) -> Option<(&K, &V)> {
        self.oldest.map(|handle| {
            let node = &self.nodes[handle];
            (&node.key, &node.value)
        })
    }

    /// Removes and returns the least recently inserted entry.
    pub fn pop_oldest(&mut self) -> Option<(K, V)> {
        let key = self.peek_oldest()?.0.clone();
        self.remove(&key).map(|value| (key, value))
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.index.clear();
        self.oldest = None;
        self.newest = None;
    }

    /// Iterates from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        std::iter::successors(self.oldest, |handle| self.nodes[*handle].next).map(|handle| {
            let node = &self.nodes[handle];
            (&node.key, &node.value)
        })
    }
}
