use std::sync::atomic::Ordering;

use crossbeam_epoch::{self as epoch, Guard, Shared};

use crate::cell::{state_of, CellState, TAG_TOMB};
use crate::comparator::Comparator;
use crate::map::NonBlockingHashMap;
use crate::table::Table;

/// Snapshot-free enumerator over the table chain captured at creation.
///
/// Entries that migrate ahead of the cursor may be missed; entries that
/// migrate behind it are seen again when the walk reaches the successor.
/// Holds one pinned epoch for its whole lifetime, so long-lived iterators
/// delay memory reclamation.
pub struct Iter<'m, K, V, C> {
    map: &'m NonBlockingHashMap<K, V, C>,
    table: *const Table<K, V>,
    idx: usize,
    guard: Guard,
}

impl<'m, K: Clone, V: Clone, C: Comparator<K>> Iter<'m, K, V, C> {
    pub(crate) fn new(map: &'m NonBlockingHashMap<K, V, C>) -> Iter<'m, K, V, C> {
        let guard = epoch::pin();
        let table = map.current.load(Ordering::Acquire, &guard).as_raw();
        Iter {
            map,
            table,
            idx: 0,
            guard,
        }
    }
}

impl<K: Clone, V: Clone, C: Comparator<K>> Iterator for Iter<'_, K, V, C> {
    type Item = (K, V);

    fn next(&mut self) -> Option<(K, V)> {
        loop {
            // The guard pins the epoch, so the raw table pointer stays valid
            // even after a promotion retires the table.
            let t = unsafe { &*self.table };
            while self.idx < t.capacity() {
                let idx = self.idx;
                self.idx += 1;
                let slot = t.slot(idx);
                if slot.hash_memo() == 0 {
                    continue;
                }
                let cur = slot.cell.load(Ordering::Acquire, &self.guard);
                match state_of(cur) {
                    CellState::Live => {
                        let c = unsafe { cur.deref() };
                        return Some((c.key.clone(), c.value.clone()));
                    }
                    CellState::Prime => {
                        // Settle this one slot; the entry turns up again in
                        // the successor leg of the walk.
                        self.map
                            .copy_slot_and_promote(Shared::from(self.table), idx, &self.guard);
                    }
                    _ => {}
                }
            }
            let next = t.next.load(Ordering::Acquire, &self.guard);
            if next.is_null() {
                return None;
            }
            self.table = next.as_raw();
            self.idx = 0;
        }
    }
}

/// Enumerator that tombstones every live entry matching the predicate and
/// yields the removed pairs.
///
/// Dropping it after a large share of the walked table was tombstoned
/// requests a compacting resize (migration drops tombstones on the floor).
pub struct RemoveWhere<'m, K, V, C, F>
where
    K: Clone,
    V: Clone,
    C: Comparator<K>,
    F: FnMut(&K, &V) -> bool,
{
    map: &'m NonBlockingHashMap<K, V, C>,
    table: *const Table<K, V>,
    idx: usize,
    guard: Guard,
    pred: F,
    removed: usize,
}

impl<'m, K, V, C, F> RemoveWhere<'m, K, V, C, F>
where
    K: Clone,
    V: Clone,
    C: Comparator<K>,
    F: FnMut(&K, &V) -> bool,
{
    pub(crate) fn new(map: &'m NonBlockingHashMap<K, V, C>, pred: F) -> RemoveWhere<'m, K, V, C, F> {
        let guard = epoch::pin();
        let table = map.current.load(Ordering::Acquire, &guard).as_raw();
        RemoveWhere {
            map,
            table,
            idx: 0,
            guard,
            pred,
            removed: 0,
        }
    }
}

impl<K, V, C, F> Iterator for RemoveWhere<'_, K, V, C, F>
where
    K: Clone,
    V: Clone,
    C: Comparator<K>,
    F: FnMut(&K, &V) -> bool,
{
    type Item = (K, V);

    fn next(&mut self) -> Option<(K, V)> {
        loop {
            let t = unsafe { &*self.table };
            while self.idx < t.capacity() {
                let idx = self.idx;
                self.idx += 1;
                let slot = t.slot(idx);
                if slot.hash_memo() == 0 {
                    continue;
                }
                let mut cur = slot.cell.load(Ordering::Acquire, &self.guard);
                loop {
                    match state_of(cur) {
                        CellState::Live => {
                            let c = unsafe { cur.deref() };
                            if !(self.pred)(&c.key, &c.value) {
                                break;
                            }
                            match slot.cell.compare_exchange(
                                cur,
                                cur.with_tag(TAG_TOMB),
                                Ordering::AcqRel,
                                Ordering::Acquire,
                                &self.guard,
                            ) {
                                Ok(_) => {
                                    t.size.decrement();
                                    self.removed += 1;
                                    return Some((c.key.clone(), c.value.clone()));
                                }
                                // Lost the race: re-examine whatever landed.
                                Err(e) => cur = e.current,
                            }
                        }
                        CellState::Prime => {
                            self.map
                                .copy_slot_and_promote(Shared::from(self.table), idx, &self.guard);
                            break;
                        }
                        _ => break,
                    }
                }
            }
            let next = t.next.load(Ordering::Acquire, &self.guard);
            if next.is_null() {
                return None;
            }
            self.table = next.as_raw();
            self.idx = 0;
        }
    }
}

impl<K, V, C, F> Drop for RemoveWhere<'_, K, V, C, F>
where
    K: Clone,
    V: Clone,
    C: Comparator<K>,
    F: FnMut(&K, &V) -> bool,
{
    fn drop(&mut self) {
        if self.removed == 0 {
            return;
        }
        let t = unsafe { &*self.table };
        let live = t.size.estimate() as usize;
        if self.removed > t.capacity() / 16 || self.removed > live / 4 {
            log::trace!(
                "predicate removal tombstoned {} entries, requesting a compacting resize",
                self.removed
            );
            self.map.resize(Shared::from(self.table), &self.guard);
            self.map.help_copy(&self.guard);
        }
    }
}
