use crate::comparator::{Comparator, NaturalComparator};
use crate::set::NonBlockingHashSet;

/// An intern pool: canonicalizes structurally-equal keys to the first
/// instance stored, so later comparisons can be by identity.
///
/// A thin façade over the set's find-or-store primitive.
pub struct Atomizer<K, C = NaturalComparator> {
    entries: NonBlockingHashSet<K, C>,
}

impl<K: Clone, C: Comparator<K> + Default> Atomizer<K, C> {
    pub fn new() -> Atomizer<K, C> {
        Atomizer {
            entries: NonBlockingHashSet::new(),
        }
    }

    pub fn with_capacity(initial_capacity: usize) -> Atomizer<K, C> {
        Atomizer {
            entries: NonBlockingHashSet::with_capacity(initial_capacity),
        }
    }
}

impl<K: Clone, C: Comparator<K> + Default> Default for Atomizer<K, C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Clone, C: Comparator<K>> Atomizer<K, C> {
    pub fn with_capacity_and_comparator(initial_capacity: usize, cmp: C) -> Atomizer<K, C> {
        Atomizer {
            entries: NonBlockingHashSet::with_capacity_and_comparator(initial_capacity, cmp),
        }
    }

    /// Return the canonical instance equal to `key`, storing `key` itself if
    /// it is the first.
    pub fn atomize(&self, key: K) -> K {
        self.entries.find_or_store(key)
    }

    /// Number of distinct canonical instances stored (approximate).
    pub fn len_estimate(&self) -> u64 {
        self.entries.len_estimate()
    }
}

#[cfg(test)]
mod test {
    use super::Atomizer;
    use std::sync::Arc;

    #[test]
    fn test_atomize_canonicalizes() {
        let atomizer: Atomizer<Arc<str>> = Atomizer::new();
        let a = atomizer.atomize(Arc::from("interned"));
        let b = atomizer.atomize(Arc::from("interned"));
        assert!(Arc::ptr_eq(&a, &b));
        let c = atomizer.atomize(Arc::from("other"));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(atomizer.len_estimate(), 2);
    }
}
