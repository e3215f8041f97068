// Copyright (c) 2021-2024 Espresso Systems (espressosys.com)
// This file is part of the Reliquary repository.

// You should have received a copy of the MIT License
// along with the Reliquary repository. If not, see <https://mit-license.org/>.

//! Utility functions, type aliases, helper structs and enum definitions.

use std::{
    collections::{HashMap, VecDeque},
    hash::Hash,
};

/// A map with a maximum size that remembers insertion order
///
/// Inserting into a full map evicts the oldest entry. Re-inserting an existing key refreshes it
/// to the newest position.
#[derive(Clone, Debug)]
pub struct BoundedOrderedMap<K, V> {
    /// Keys, oldest first. The inner [`VecDeque`] is a ring buffer.
    order: VecDeque<K>,
    /// The values
    entries: HashMap<K, V>,
    /// The maximum number of entries
    max_size: usize,
}

impl<K: Clone + Eq + Hash, V> BoundedOrderedMap<K, V> {
    /// Create a new bounded map with the given maximum size
    ///
    /// A maximum size of zero is treated as one.
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        let max_size = max_size.max(1);
        Self {
            order: VecDeque::with_capacity(max_size),
            entries: HashMap::with_capacity(max_size),
            max_size,
        }
    }

    /// Insert an entry, returning the entry evicted to make room, if any
    pub fn insert(&mut self, key: K, value: V) -> Option<(K, V)> {
        if self.entries.insert(key.clone(), value).is_some() {
            self.order.retain(|k| k != &key);
            self.order.push_back(key);
            return None;
        }
        self.order.push_back(key);
        if self.order.len() > self.max_size {
            let oldest = self.order.pop_front()?;
            let value = self.entries.remove(&oldest)?;
            return Some((oldest, value));
        }
        None
    }

    /// Look up an entry
    #[must_use]
    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    /// Remove an entry
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let value = self.entries.remove(key)?;
        self.order.retain(|k| k != key);
        Some(value)
    }

    /// Keep only the entries matching the predicate
    pub fn retain(&mut self, mut keep: impl FnMut(&K, &V) -> bool) {
        let entries = &mut self.entries;
        self.order.retain(|k| match entries.get(k) {
            Some(v) if keep(k, v) => true,
            _ => {
                entries.remove(k);
                false
            }
        });
    }

    /// Whether the key is present
    #[must_use]
    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether the map is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Entries, oldest first
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.order
            .iter()
            .filter_map(|k| self.entries.get(k).map(|v| (k, v)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounded_ordered_map() {
        let mut map = BoundedOrderedMap::new(3);
        assert_eq!(map.insert(1, "a"), None);
        assert_eq!(map.insert(2, "b"), None);
        assert_eq!(map.insert(3, "c"), None);
        assert_eq!(map.insert(4, "d"), Some((1, "a")));
        assert_eq!(map.len(), 3);

        // refreshing moves 2 to the newest slot, so 3 is evicted next
        assert_eq!(map.insert(2, "B"), None);
        assert_eq!(map.insert(5, "e"), Some((3, "c")));
        assert_eq!(
            map.iter().map(|(k, v)| (*k, *v)).collect::<Vec<_>>(),
            vec![(4, "d"), (2, "B"), (5, "e")]
        );
    }

    #[test]
    fn retain_and_remove_keep_order_consistent() {
        let mut map = BoundedOrderedMap::new(4);
        for i in 0..4 {
            map.insert(i, i * 10);
        }
        map.retain(|k, _| k % 2 == 0);
        assert_eq!(map.remove(&2), Some(20));
        assert_eq!(map.iter().map(|(k, _)| *k).collect::<Vec<_>>(), vec![0]);
        assert!(!map.contains_key(&1));
    }
}
