use std::sync::atomic::Ordering;

use crossbeam_epoch as epoch;

use crate::comparator::{Comparator, NaturalComparator};
use crate::error::Error;
use crate::iter::{Iter, RemoveWhere};
use crate::map::{MatchMode, NonBlockingHashMap, Pending, Previous};

/// A lock-free, resizing hash set: the hash map with unit values. The slot
/// cell still carries the stored key, which is what [`find_or_store`]
/// hands back for interning.
///
/// [`find_or_store`]: NonBlockingHashSet::find_or_store
pub struct NonBlockingHashSet<K, C = NaturalComparator> {
    map: NonBlockingHashMap<K, (), C>,
}

impl<K: Clone, C: Comparator<K> + Default> NonBlockingHashSet<K, C> {
    pub fn new() -> NonBlockingHashSet<K, C> {
        NonBlockingHashSet {
            map: NonBlockingHashMap::new(),
        }
    }

    pub fn with_capacity(initial_capacity: usize) -> NonBlockingHashSet<K, C> {
        NonBlockingHashSet {
            map: NonBlockingHashMap::with_capacity(initial_capacity),
        }
    }

    pub fn try_with_capacity(initial_capacity: usize) -> Result<NonBlockingHashSet<K, C>, Error> {
        Ok(NonBlockingHashSet {
            map: NonBlockingHashMap::try_with_capacity(initial_capacity)?,
        })
    }
}

impl<K: Clone, C: Comparator<K> + Default> Default for NonBlockingHashSet<K, C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Clone, C: Comparator<K>> NonBlockingHashSet<K, C> {
    pub fn with_capacity_and_comparator(initial_capacity: usize, cmp: C) -> NonBlockingHashSet<K, C> {
        NonBlockingHashSet {
            map: NonBlockingHashMap::with_capacity_and_comparator(initial_capacity, cmp),
        }
    }

    /// Add the key. Returns `true` iff the key was absent (the previous
    /// cell was empty or a tombstone) and `false` on a duplicate.
    pub fn add(&self, key: K) -> bool {
        self.map.put_if_absent(key, ()).is_ok()
    }

    /// Remove the key; `true` iff it was present.
    pub fn remove(&self, key: &K) -> bool {
        self.map.remove(key).is_some()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.map.contains(key)
    }

    /// Intern `key`: store it if absent and return it, or return the
    /// already-stored instance the comparator considers equal. The result is
    /// the canonical representative for everything structurally equal.
    pub fn find_or_store(&self, key: K) -> K {
        let guard = &epoch::pin();
        let t = self.map.current.load(Ordering::Acquire, guard);
        let out = self.map.put_if_match(
            t,
            &key,
            Pending::put(()),
            MatchMode::IfAbsent,
            true,
            guard,
        );
        if out.installed {
            key
        } else {
            match out.prev {
                Previous::Entry(stored, ()) => stored,
                _ => unreachable!("if-absent insert failed without a stored key"),
            }
        }
    }

    /// The stored instance equal to `key`, if any.
    pub fn get(&self, key: &K) -> Option<K> {
        self.map.get_key_value(key).map(|(k, ())| k)
    }

    /// Approximate member count; not a snapshot.
    pub fn len_estimate(&self) -> u64 {
        self.map.len_estimate()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.map.capacity()
    }

    /// Walk the members. Same racy-by-contract behavior as the map walk.
    pub fn iter(&self) -> Keys<'_, K, C> {
        Keys(self.map.iter())
    }

    /// Remove every member matching the predicate, yielding the removed
    /// keys.
    pub fn remove_where<F>(&self, mut pred: F) -> RemoveWhere<'_, K, (), C, impl FnMut(&K, &()) -> bool>
    where
        F: FnMut(&K) -> bool,
    {
        self.map.remove_where(move |k, _| pred(k))
    }
}

/// Key iterator over a set.
pub struct Keys<'m, K, C>(Iter<'m, K, (), C>);

impl<K: Clone, C: Comparator<K>> Iterator for Keys<'_, K, C> {
    type Item = K;

    fn next(&mut self) -> Option<K> {
        self.0.next().map(|(k, ())| k)
    }
}
