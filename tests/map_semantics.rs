//! Single-threaded end-to-end behavior: growth, pathological hashing, and
//! injected comparators.

use nonblocking::{Comparator, NonBlockingHashMap};

#[test]
fn small_map_grows_and_keeps_entries() {
    let map: NonBlockingHashMap<String, u32> = NonBlockingHashMap::with_capacity(4);
    assert_eq!(map.capacity(), 4);

    map.put("a".to_string(), 1);
    map.put("b".to_string(), 2);
    map.put("c".to_string(), 3);

    // Three live entries cannot sit below the 25% fill trigger at capacity 4.
    assert!(map.capacity() > 4, "no resize was forced");
    assert_eq!(map.get(&"a".to_string()), Some(1));
    assert_eq!(map.get(&"b".to_string()), Some(2));
    assert_eq!(map.get(&"c".to_string()), Some(3));
    assert_eq!(map.len_estimate(), 3);
}

/// Every key collides: the memoized hash is always the same, so the whole
/// map degenerates into one linear probe chain and survives only because
/// the reprobe cap keeps forcing growth.
#[derive(Default)]
struct DegenerateHash;

impl Comparator<u32> for DegenerateHash {
    fn eq(&self, a: &u32, b: &u32) -> bool {
        a == b
    }

    fn hash(&self, _key: &u32) -> u32 {
        0
    }
}

#[test]
fn all_keys_colliding_still_work() {
    let map = NonBlockingHashMap::with_capacity_and_comparator(8, DegenerateHash);
    for k in 0..1_000_u32 {
        map.put(k, k + 7);
    }
    for k in 0..1_000_u32 {
        assert_eq!(map.get(&k), Some(k + 7), "key {k} unreachable");
    }
    for k in 0..1_000_u32 {
        assert_eq!(map.remove(&k), Some(k + 7), "key {k} unremovable");
    }
    for k in 0..1_000_u32 {
        assert_eq!(map.get(&k), None);
    }
}

/// Case-insensitive by uppercase mapping, which folds "ß" to "SS" and makes
/// the German sharp s compare equal to its two-letter spelling.
#[derive(Default)]
struct CaseFold;

impl Comparator<String> for CaseFold {
    fn eq(&self, a: &String, b: &String) -> bool {
        a.to_uppercase() == b.to_uppercase()
    }

    fn hash(&self, key: &String) -> u32 {
        // FNV-1a over the case-folded bytes so equal keys hash equal.
        let mut h: u32 = 0x811c_9dc5;
        for b in key.to_uppercase().bytes() {
            h = (h ^ b as u32).wrapping_mul(0x0100_0193);
        }
        h
    }
}

#[test]
fn case_insensitive_comparator() {
    let map = NonBlockingHashMap::with_capacity_and_comparator(16, CaseFold);
    map.put("Weißbier".to_string(), 93_u32);
    assert_eq!(map.get(&"WEISSBIER".to_string()), Some(93));
    assert!(map.replace_if_equal(&"weissbier".to_string(), &93, 777));
    assert_eq!(map.get(&"Weißbier".to_string()), Some(777));
}

#[test]
fn iteration_sees_all_entries_at_quiescence() {
    let map: NonBlockingHashMap<u32, u32> = NonBlockingHashMap::with_capacity(8);
    for k in 0..300 {
        map.put(k, k * 2);
    }
    let mut seen: Vec<(u32, u32)> = map.iter().collect();
    seen.sort_unstable();
    assert_eq!(seen.len(), 300);
    for (k, v) in seen {
        assert_eq!(v, k * 2);
    }
}

#[test]
fn remove_where_sweeps_matching_entries() {
    let map: NonBlockingHashMap<u32, u32> = NonBlockingHashMap::with_capacity(64);
    for k in 0..400 {
        map.put(k, k);
    }
    let removed: Vec<(u32, u32)> = map.remove_where(|_, v| v % 4 == 0).collect();
    assert_eq!(removed.len(), 100);
    for k in 0..400 {
        assert_eq!(map.get(&k).is_some(), k % 4 != 0, "key {k}");
    }
}
