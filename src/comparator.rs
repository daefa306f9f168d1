use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash, Hasher};
use std::marker::PhantomData;
use std::sync::Arc;

/// Injected equality and hashing for keys.
///
/// Implementations must be pure and thread-safe: two keys that compare equal
/// must hash equal, and neither function may observe mutable state. The hash
/// is 32 bits because the table memoizes it per slot; a result of zero is
/// remapped internally, so implementations need not avoid it.
pub trait Comparator<K: ?Sized>: Send + Sync {
    fn eq(&self, a: &K, b: &K) -> bool;
    fn hash(&self, key: &K) -> u32;
}

/// The natural comparator: `Eq` for equality, a [`BuildHasher`] for hashing.
///
/// The default `RandomState` seeds per map instance, which is fine because
/// memoized hashes never leave the map that computed them.
pub struct NaturalComparator<S = RandomState> {
    build: S,
}

impl<S: BuildHasher> NaturalComparator<S> {
    pub fn with_hasher(build: S) -> Self {
        NaturalComparator { build }
    }
}

impl Default for NaturalComparator {
    fn default() -> Self {
        NaturalComparator {
            build: RandomState::new(),
        }
    }
}

impl<K, S> Comparator<K> for NaturalComparator<S>
where
    K: Eq + Hash + ?Sized,
    S: BuildHasher + Send + Sync,
{
    fn eq(&self, a: &K, b: &K) -> bool {
        a == b
    }

    fn hash(&self, key: &K) -> u32 {
        let mut hasher = self.build.build_hasher();
        key.hash(&mut hasher);
        fold(hasher.finish())
    }
}

/// Reference-identity comparator over shared allocations: two keys are equal
/// iff they are the same allocation, and the hash is the allocation address.
pub struct IdentityComparator<T: ?Sized> {
    _marker: PhantomData<fn(&T)>,
}

impl<T: ?Sized> Default for IdentityComparator<T> {
    fn default() -> Self {
        IdentityComparator {
            _marker: PhantomData,
        }
    }
}

impl<T: ?Sized + Send + Sync> Comparator<Arc<T>> for IdentityComparator<T> {
    fn eq(&self, a: &Arc<T>, b: &Arc<T>) -> bool {
        Arc::ptr_eq(a, b)
    }

    fn hash(&self, key: &Arc<T>) -> u32 {
        fold(Arc::as_ptr(key) as *const () as usize as u64)
    }
}

fn fold(h: u64) -> u32 {
    (h ^ (h >> 32)) as u32
}

#[cfg(test)]
mod test {
    use super::{Comparator, IdentityComparator, NaturalComparator};
    use std::sync::Arc;

    #[test]
    fn test_natural_eq_implies_hash_eq() {
        let cmp = NaturalComparator::default();
        let a = String::from("slot");
        let b = String::from("slot");
        assert!(Comparator::<String>::eq(&cmp, &a, &b));
        assert_eq!(cmp.hash(&a), cmp.hash(&b));
    }

    #[test]
    fn test_identity_distinguishes_equal_contents() {
        let cmp = IdentityComparator::default();
        let a = Arc::new(7_u32);
        let b = Arc::new(7_u32);
        assert!(!cmp.eq(&a, &b));
        assert!(cmp.eq(&a, &Arc::clone(&a)));
        assert_eq!(cmp.hash(&a), cmp.hash(&Arc::clone(&a)));
    }
}
