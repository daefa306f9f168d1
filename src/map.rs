use std::mem;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};

use crate::cell::{dead, state_of, Cell, CellState, TAG_PRIME, TAG_TOMB};
use crate::comparator::{Comparator, NaturalComparator};
use crate::error::Error;
use crate::iter::{Iter, RemoveWhere};
use crate::table::{memoize, ResizeTuning, Slot, Table, COPY_CHUNK, MAX_CAPACITY};

const MIN_SIZE: usize = 8;

// ---Mutation plumbing -----------------------------------------------------

/// What a mutation wants to leave in the slot: a fresh live cell built from
/// the payload, or a tombstone mark on whatever live cell is found.
pub(crate) struct Pending<K, V> {
    removing: bool,
    value: Option<V>,
    cell: Option<Owned<Cell<K, V>>>,
}

impl<K: Clone, V> Pending<K, V> {
    pub(crate) fn put(value: V) -> Pending<K, V> {
        Pending {
            removing: false,
            value: Some(value),
            cell: None,
        }
    }

    pub(crate) fn remove() -> Pending<K, V> {
        Pending {
            removing: true,
            value: None,
            cell: None,
        }
    }

    fn take_cell(&mut self, key: &K) -> Owned<Cell<K, V>> {
        match (self.cell.take(), self.value.take()) {
            (Some(cell), _) => cell,
            (None, Some(value)) => Owned::new(Cell {
                key: key.clone(),
                value,
            }),
            (None, None) => unreachable!("pending write consumed twice"),
        }
    }

    fn give_back(&mut self, cell: Owned<Cell<K, V>>) {
        self.cell = Some(cell);
    }
}

/// Which observed cells a mutation is allowed to replace.
pub(crate) enum MatchMode<'a, V> {
    /// Unconditional.
    Any,
    /// Only `Empty` or `Tombstone`: insert-if-absent.
    IfAbsent,
    /// Only a `Live` cell whose value satisfies the predicate.
    IfLive(&'a dyn Fn(&V) -> bool),
    /// Only `Empty`, exactly: the migration carry-forward, which must lose
    /// to any concurrent later write in the successor.
    SlotEmpty,
}

// Derived Clone/Copy would demand `V: Copy`; the variants only hold a
// reference, so hand-rolled impls lift that bound.
impl<V> Clone for MatchMode<'_, V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<V> Copy for MatchMode<'_, V> {}

/// The cell observed at the linearization point of a mutation.
pub(crate) enum Previous<K, V> {
    Absent,
    Removed,
    Entry(K, V),
}

pub(crate) struct Outcome<K, V> {
    /// Whether the mutation's write was performed.
    pub(crate) installed: bool,
    pub(crate) prev: Previous<K, V>,
}

// ---Hash map --------------------------------------------------------------

/// A lock-free, resizing, open-addressed hash map.
///
/// All single-key operations are linearizable per key and complete in a
/// bounded number of steps; the only synchronization used is CAS and atomic
/// add. Aggregates (`len_estimate`, iteration) are racy by contract.
///
/// `K: Clone + V: Clone` is part of the contract: lookups return owned
/// values (entries may be reclaimed as soon as the internal epoch guard is
/// dropped), and an incremental resize carries entries into the successor
/// table by cloning them.
///
/// Equality and hashing come from an injected [`Comparator`]; the default is
/// the natural one over `Eq + Hash`.
pub struct NonBlockingHashMap<K, V, C = NaturalComparator> {
    pub(crate) current: Atomic<Table<K, V>>,
    pub(crate) cmp: C,
    tuning: ResizeTuning,
}

unsafe impl<K: Send + Sync, V: Send + Sync, C: Send + Sync> Send for NonBlockingHashMap<K, V, C> {}
unsafe impl<K: Send + Sync, V: Send + Sync, C: Send + Sync> Sync for NonBlockingHashMap<K, V, C> {}

impl<K: Clone, V: Clone, C: Comparator<K> + Default> NonBlockingHashMap<K, V, C> {
    pub fn new() -> NonBlockingHashMap<K, V, C> {
        NonBlockingHashMap::with_capacity(MIN_SIZE)
    }

    /// `initial_capacity` is rounded up to a power of two. Out-of-range
    /// capacity (zero, or beyond 2^30) is a programmer error and panics; see
    /// [`try_with_capacity`](Self::try_with_capacity).
    pub fn with_capacity(initial_capacity: usize) -> NonBlockingHashMap<K, V, C> {
        match Self::try_with_capacity(initial_capacity) {
            Ok(map) => map,
            Err(e) => panic!("{e}"),
        }
    }

    pub fn try_with_capacity(initial_capacity: usize) -> Result<NonBlockingHashMap<K, V, C>, Error> {
        Self::try_with_capacity_and_comparator(initial_capacity, C::default())
    }
}

impl<K: Clone, V: Clone, C: Comparator<K> + Default> Default for NonBlockingHashMap<K, V, C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Clone, V: Clone, C: Comparator<K>> NonBlockingHashMap<K, V, C> {
    pub fn with_capacity_and_comparator(
        initial_capacity: usize,
        cmp: C,
    ) -> NonBlockingHashMap<K, V, C> {
        match Self::try_with_capacity_and_comparator(initial_capacity, cmp) {
            Ok(map) => map,
            Err(e) => panic!("{e}"),
        }
    }

    pub fn try_with_capacity_and_comparator(
        initial_capacity: usize,
        cmp: C,
    ) -> Result<NonBlockingHashMap<K, V, C>, Error> {
        if initial_capacity == 0 {
            return Err(Error::InvalidArgument("initial capacity must be at least 1"));
        }
        if initial_capacity > MAX_CAPACITY {
            return Err(Error::InvalidArgument("initial capacity exceeds 2^30 slots"));
        }
        let capacity = initial_capacity.next_power_of_two();
        Ok(NonBlockingHashMap {
            current: Atomic::new(Table::new(capacity, 0)),
            cmp,
            tuning: ResizeTuning::default(),
        })
    }

    /// Replace the resize back-pressure knobs (an optimization hint only).
    pub fn with_tuning(mut self, tuning: ResizeTuning) -> NonBlockingHashMap<K, V, C> {
        self.tuning = tuning;
        self
    }

    // ---Reads -------------------------------------------------------------

    pub fn get(&self, key: &K) -> Option<V> {
        let guard = &epoch::pin();
        let t = self.current.load(Ordering::Acquire, guard);
        self.find(t, key, self.hash_of(key), guard)
            .map(|c| c.value.clone())
    }

    pub fn contains(&self, key: &K) -> bool {
        let guard = &epoch::pin();
        let t = self.current.load(Ordering::Acquire, guard);
        self.find(t, key, self.hash_of(key), guard).is_some()
    }

    /// The stored key and value. The returned key is the instance the map
    /// holds, which an injected comparator may consider equal to `key`
    /// without being identical to it.
    pub fn get_key_value(&self, key: &K) -> Option<(K, V)> {
        let guard = &epoch::pin();
        let t = self.current.load(Ordering::Acquire, guard);
        self.find(t, key, self.hash_of(key), guard)
            .map(|c| (c.key.clone(), c.value.clone()))
    }

    /// [`get`](Self::get) for callers that treat a missing key as an error.
    pub fn try_get(&self, key: &K) -> Result<V, Error> {
        self.get(key).ok_or(Error::KeyAbsent)
    }

    /// Approximate number of live entries. Not a snapshot: concurrent
    /// mutations and an in-flight resize both skew it. Each table in the
    /// chain counts the entries whose authoritative cell it holds.
    pub fn len_estimate(&self) -> u64 {
        let guard = &epoch::pin();
        let mut table = self.current.load(Ordering::Acquire, guard);
        let mut total: i64 = 0;
        while !table.is_null() {
            let t = unsafe { table.deref() };
            total += t.size.estimate();
            table = t.next.load(Ordering::Acquire, guard);
        }
        total.max(0) as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len_estimate() == 0
    }

    /// Slot count of the current table. Grows across resizes, never shrinks.
    pub fn capacity(&self) -> usize {
        let guard = &epoch::pin();
        let t = self.current.load(Ordering::Acquire, guard);
        unsafe { t.deref() }.capacity()
    }

    // ---Writes ------------------------------------------------------------

    /// Insert or overwrite, returning the previous value if one was live.
    pub fn put(&self, key: K, value: V) -> Option<V> {
        let guard = &epoch::pin();
        let t = self.current.load(Ordering::Acquire, guard);
        let out = self.put_if_match(t, &key, Pending::put(value), MatchMode::Any, true, guard);
        match out.prev {
            Previous::Entry(_, v) => Some(v),
            _ => None,
        }
    }

    /// Insert only if the key is absent (empty or tombstoned); on failure
    /// the existing value is returned untouched.
    pub fn put_if_absent(&self, key: K, value: V) -> Result<(), V> {
        let guard = &epoch::pin();
        let t = self.current.load(Ordering::Acquire, guard);
        let out = self.put_if_match(t, &key, Pending::put(value), MatchMode::IfAbsent, true, guard);
        if out.installed {
            Ok(())
        } else {
            match out.prev {
                Previous::Entry(_, v) => Err(v),
                _ => unreachable!("if-absent insert failed without an existing entry"),
            }
        }
    }

    /// Swap in `new` only if the key currently maps to `expected`. Returns
    /// whether the swap happened; on `false` this call changed nothing.
    pub fn replace_if_equal(&self, key: &K, expected: &V, new: V) -> bool
    where
        V: PartialEq,
    {
        let guard = &epoch::pin();
        let t = self.current.load(Ordering::Acquire, guard);
        let pred = |v: &V| v == expected;
        self.put_if_match(t, key, Pending::put(new), MatchMode::IfLive(&pred), true, guard)
            .installed
    }

    /// Remove the key, returning the value that was live. Removing an
    /// absent or already-removed key returns `None` and writes nothing.
    pub fn remove(&self, key: &K) -> Option<V> {
        let guard = &epoch::pin();
        let t = self.current.load(Ordering::Acquire, guard);
        let out = self.put_if_match(t, key, Pending::remove(), MatchMode::Any, true, guard);
        if out.installed {
            match out.prev {
                Previous::Entry(_, v) => Some(v),
                _ => unreachable!("removal installed over a non-live cell"),
            }
        } else {
            None
        }
    }

    /// Remove only if the key currently maps to `expected`.
    pub fn remove_if_equal(&self, key: &K, expected: &V) -> bool
    where
        V: PartialEq,
    {
        let guard = &epoch::pin();
        let t = self.current.load(Ordering::Acquire, guard);
        let pred = |v: &V| v == expected;
        self.put_if_match(t, key, Pending::remove(), MatchMode::IfLive(&pred), true, guard)
            .installed
    }

    /// Insert `factory()` if the key is absent, otherwise replace the
    /// current value with `update(&current)`; retries until one of the two
    /// lands. Returns the value this call left in the map.
    pub fn update_or_insert<F, U>(&self, key: K, mut factory: F, mut update: U) -> V
    where
        V: PartialEq,
        F: FnMut() -> V,
        U: FnMut(&V) -> V,
    {
        loop {
            let guard = &epoch::pin();
            let t = self.current.load(Ordering::Acquire, guard);
            match self.find(t, &key, self.hash_of(&key), guard) {
                None => {
                    let value = factory();
                    let out = self.put_if_match(
                        t,
                        &key,
                        Pending::put(value.clone()),
                        MatchMode::IfAbsent,
                        true,
                        guard,
                    );
                    if out.installed {
                        return value;
                    }
                }
                Some(c) => {
                    let observed = c.value.clone();
                    let value = update(&observed);
                    let pred = |v: &V| *v == observed;
                    let out = self.put_if_match(
                        t,
                        &key,
                        Pending::put(value.clone()),
                        MatchMode::IfLive(&pred),
                        true,
                        guard,
                    );
                    if out.installed {
                        return value;
                    }
                }
            }
        }
    }

    /// Fallible [`update_or_insert`](Self::update_or_insert). A closure
    /// error aborts before any CAS for that attempt is issued, so the map is
    /// left unchanged by the failing attempt.
    pub fn try_update_or_insert<F, U>(&self, key: K, mut factory: F, mut update: U) -> Result<V, Error>
    where
        V: PartialEq,
        F: FnMut() -> Result<V, Box<dyn std::error::Error + Send + Sync>>,
        U: FnMut(&V) -> Result<V, Box<dyn std::error::Error + Send + Sync>>,
    {
        loop {
            let guard = &epoch::pin();
            let t = self.current.load(Ordering::Acquire, guard);
            match self.find(t, &key, self.hash_of(&key), guard) {
                None => {
                    let value = factory().map_err(Error::PredicateFault)?;
                    let out = self.put_if_match(
                        t,
                        &key,
                        Pending::put(value.clone()),
                        MatchMode::IfAbsent,
                        true,
                        guard,
                    );
                    if out.installed {
                        return Ok(value);
                    }
                }
                Some(c) => {
                    let observed = c.value.clone();
                    let value = update(&observed).map_err(Error::PredicateFault)?;
                    let pred = |v: &V| *v == observed;
                    let out = self.put_if_match(
                        t,
                        &key,
                        Pending::put(value.clone()),
                        MatchMode::IfLive(&pred),
                        true,
                        guard,
                    );
                    if out.installed {
                        return Ok(value);
                    }
                }
            }
        }
    }

    // ---Iteration ----------------------------------------------------------

    /// Walk the table chain yielding cloned entries. Snapshot-free: entries
    /// that migrate ahead of the cursor may be missed and entries that
    /// migrate behind it may be observed twice.
    pub fn iter(&self) -> Iter<'_, K, V, C> {
        Iter::new(self)
    }

    /// Remove every entry matching the predicate, yielding the removed
    /// pairs. Dropping the enumerator after it tombstoned a large share of
    /// the table requests a compacting resize.
    pub fn remove_where<F>(&self, pred: F) -> RemoveWhere<'_, K, V, C, F>
    where
        F: FnMut(&K, &V) -> bool,
    {
        RemoveWhere::new(self, pred)
    }

    // ---Probe engine --------------------------------------------------------

    pub(crate) fn hash_of(&self, key: &K) -> u32 {
        memoize(self.cmp.hash(key))
    }

    /// Locate the authoritative cell for `key`, tunneling through successor
    /// tables and helping single-slot migration where a probe lands on a
    /// `Prime`. Readers never do chunked copy work.
    pub(crate) fn find<'g>(
        &self,
        table: Shared<'g, Table<K, V>>,
        key: &K,
        hash: u32,
        guard: &'g Guard,
    ) -> Option<&'g Cell<K, V>> {
        let t = unsafe { table.deref() };
        let mask = t.mask();
        let mut idx = hash as usize & mask;
        let mut reprobes = 0;
        loop {
            let slot = t.slot(idx);
            let memo = slot.hash_memo();
            if memo == 0 {
                // Never claimed: the probe chain ends here.
                return self.find_in_next(t, key, hash, guard);
            }
            if memo == hash {
                let cur = slot.cell.load(Ordering::Acquire, guard);
                match state_of(cur) {
                    // Claimed but unwritten; nothing committed past it.
                    CellState::Empty => return self.find_in_next(t, key, hash, guard),
                    CellState::Dead => {
                        let next = t.next.load(Ordering::Acquire, guard);
                        return self.find(next, key, hash, guard);
                    }
                    CellState::Prime => {
                        self.copy_slot_and_promote(table, idx, guard);
                        let next = t.next.load(Ordering::Acquire, guard);
                        return self.find(next, key, hash, guard);
                    }
                    CellState::Live => {
                        let c = unsafe { cur.deref() };
                        if self.cmp.eq(&c.key, key) {
                            return Some(c);
                        }
                    }
                    CellState::Tombstone => {
                        let c = unsafe { cur.deref() };
                        if self.cmp.eq(&c.key, key) {
                            return None;
                        }
                    }
                }
            }
            reprobes += 1;
            if reprobes >= t.reprobe_limit() {
                return self.find_in_next(t, key, hash, guard);
            }
            idx = (idx + 1) & mask;
        }
    }

    fn find_in_next<'g>(
        &self,
        t: &'g Table<K, V>,
        key: &K,
        hash: u32,
        guard: &'g Guard,
    ) -> Option<&'g Cell<K, V>> {
        let next = t.next.load(Ordering::Acquire, guard);
        if next.is_null() {
            None
        } else {
            self.find(next, key, hash, guard)
        }
    }

    // ---Mutation engine -----------------------------------------------------

    /// The single primitive behind every mutation, including the migration
    /// carry-forward. Probes for the key's slot, claims a hash memo when it
    /// finds a virgin slot, then runs the CAS ladder against the value cell.
    /// `help` is false only for carry-forward calls, which owe the migration
    /// one slot rather than a chunk.
    pub(crate) fn put_if_match<'g>(
        &self,
        table: Shared<'g, Table<K, V>>,
        key: &K,
        mut pending: Pending<K, V>,
        mode: MatchMode<'_, V>,
        help: bool,
        guard: &'g Guard,
    ) -> Outcome<K, V> {
        let t = unsafe { table.deref() };
        let hash = self.hash_of(key);
        let mask = t.mask();
        let mut idx = hash as usize & mask;
        let mut reprobes = 0;

        loop {
            let slot = t.slot(idx);
            let mut memo = slot.hash_memo();
            if memo == 0 {
                if pending.removing {
                    // Pure delete into a virgin slot: never claim it. The key
                    // may still live in a successor that newer writes went to.
                    let next = t.next.load(Ordering::Acquire, guard);
                    if !next.is_null() {
                        if help {
                            self.help_copy(guard);
                        }
                        return self.put_if_match(next, key, pending, mode, help, guard);
                    }
                    return Outcome {
                        installed: false,
                        prev: Previous::Absent,
                    };
                }
                match slot.claim(hash) {
                    Ok(()) => {
                        t.slots_claimed.increment();
                        memo = hash;
                    }
                    Err(current) => memo = current,
                }
            }
            if memo == hash {
                // Once a successor exists it is authoritative for writes:
                // retire this slot, pay the chunk duty, retry over there.
                let next = t.next.load(Ordering::Acquire, guard);
                if !next.is_null() {
                    self.copy_slot_and_promote(table, idx, guard);
                    if help {
                        self.help_copy(guard);
                    }
                    return self.put_if_match(next, key, pending, mode, help, guard);
                }

                let mut cur = slot.cell.load(Ordering::Acquire, guard);
                'ladder: loop {
                    match state_of(cur) {
                        CellState::Dead => {
                            let next = t.next.load(Ordering::Acquire, guard);
                            debug_assert!(!next.is_null());
                            return self.put_if_match(next, key, pending, mode, help, guard);
                        }
                        CellState::Prime => {
                            self.copy_slot_and_promote(table, idx, guard);
                            let next = t.next.load(Ordering::Acquire, guard);
                            return self.put_if_match(next, key, pending, mode, help, guard);
                        }
                        CellState::Empty => {
                            if pending.removing {
                                return Outcome {
                                    installed: false,
                                    prev: Previous::Absent,
                                };
                            }
                            if let MatchMode::IfLive(_) = mode {
                                return Outcome {
                                    installed: false,
                                    prev: Previous::Absent,
                                };
                            }
                            let cell = pending.take_cell(key);
                            match slot.cell.compare_exchange(
                                Shared::null(),
                                cell,
                                Ordering::AcqRel,
                                Ordering::Acquire,
                                guard,
                            ) {
                                Ok(_) => {
                                    t.size.increment();
                                    self.grow_if_pressed(table, guard);
                                    return Outcome {
                                        installed: true,
                                        prev: Previous::Absent,
                                    };
                                }
                                Err(e) => {
                                    pending.give_back(e.new);
                                    cur = e.current;
                                }
                            }
                        }
                        CellState::Live => {
                            let c = unsafe { cur.deref() };
                            if !self.cmp.eq(&c.key, key) {
                                break 'ladder;
                            }
                            match mode {
                                MatchMode::SlotEmpty | MatchMode::IfAbsent => {
                                    return Outcome {
                                        installed: false,
                                        prev: Previous::Entry(c.key.clone(), c.value.clone()),
                                    };
                                }
                                MatchMode::IfLive(pred) if !pred(&c.value) => {
                                    return Outcome {
                                        installed: false,
                                        prev: Previous::Entry(c.key.clone(), c.value.clone()),
                                    };
                                }
                                _ => {}
                            }
                            if pending.removing {
                                match slot.cell.compare_exchange(
                                    cur,
                                    cur.with_tag(TAG_TOMB),
                                    Ordering::AcqRel,
                                    Ordering::Acquire,
                                    guard,
                                ) {
                                    Ok(_) => {
                                        t.size.decrement();
                                        return Outcome {
                                            installed: true,
                                            prev: Previous::Entry(c.key.clone(), c.value.clone()),
                                        };
                                    }
                                    Err(e) => cur = e.current,
                                }
                            } else {
                                let cell = pending.take_cell(key);
                                match slot.cell.compare_exchange(
                                    cur,
                                    cell,
                                    Ordering::AcqRel,
                                    Ordering::Acquire,
                                    guard,
                                ) {
                                    Ok(_) => {
                                        let prev = Previous::Entry(c.key.clone(), c.value.clone());
                                        unsafe { guard.defer_destroy(cur) };
                                        return Outcome {
                                            installed: true,
                                            prev,
                                        };
                                    }
                                    Err(e) => {
                                        pending.give_back(e.new);
                                        cur = e.current;
                                    }
                                }
                            }
                        }
                        CellState::Tombstone => {
                            let c = unsafe { cur.deref() };
                            if !self.cmp.eq(&c.key, key) {
                                break 'ladder;
                            }
                            match mode {
                                // The successor slot is no longer empty;
                                // the carry-forward loses.
                                MatchMode::SlotEmpty => {
                                    return Outcome {
                                        installed: false,
                                        prev: Previous::Removed,
                                    };
                                }
                                MatchMode::IfLive(_) => {
                                    return Outcome {
                                        installed: false,
                                        prev: Previous::Removed,
                                    };
                                }
                                _ => {}
                            }
                            if pending.removing {
                                // Remove of removed: detectable, idempotent.
                                return Outcome {
                                    installed: false,
                                    prev: Previous::Removed,
                                };
                            }
                            let cell = pending.take_cell(key);
                            match slot.cell.compare_exchange(
                                cur,
                                cell,
                                Ordering::AcqRel,
                                Ordering::Acquire,
                                guard,
                            ) {
                                Ok(_) => {
                                    t.size.increment();
                                    unsafe { guard.defer_destroy(cur) };
                                    self.grow_if_pressed(table, guard);
                                    return Outcome {
                                        installed: true,
                                        prev: Previous::Removed,
                                    };
                                }
                                Err(e) => {
                                    pending.give_back(e.new);
                                    cur = e.current;
                                }
                            }
                        }
                    }
                }
            }
            reprobes += 1;
            if reprobes >= t.reprobe_limit() {
                let next = self.resize(table, guard);
                if help {
                    self.help_copy(guard);
                }
                return self.put_if_match(next, key, pending, mode, help, guard);
            }
            idx = (idx + 1) & mask;
        }
    }

    fn grow_if_pressed<'g>(&self, table: Shared<'g, Table<K, V>>, guard: &'g Guard) {
        let t = unsafe { table.deref() };
        if t.should_grow() && t.next.load(Ordering::Acquire, guard).is_null() {
            self.resize(table, guard);
        }
    }

    // ---Resize --------------------------------------------------------------

    /// Install (or return the already-installed) successor table. One CAS
    /// winner publishes; losers drop their allocation. Late arrivals at a
    /// large target back off briefly so the winner's allocation can land.
    pub(crate) fn resize<'g>(
        &self,
        table: Shared<'g, Table<K, V>>,
        guard: &'g Guard,
    ) -> Shared<'g, Table<K, V>> {
        let t = unsafe { table.deref() };
        let next = t.next.load(Ordering::Acquire, guard);
        if !next.is_null() {
            return next;
        }

        let target = match t.target_capacity() {
            Ok(target) => target,
            Err(e) => panic!("{e}"),
        };
        let resizers = t.resizers.fetch_add(1, Ordering::AcqRel) + 1;

        let slot_bytes = target.saturating_mul(mem::size_of::<Slot<K, V>>());
        if resizers >= self.tuning.stampede_resizers && slot_bytes >= self.tuning.stampede_bytes {
            for _ in 0..64 {
                std::hint::spin_loop();
                let next = t.next.load(Ordering::Acquire, guard);
                if !next.is_null() {
                    return next;
                }
            }
            let nap = Duration::from_millis((slot_bytes >> 17) as u64 * (resizers as u64 - 1))
                .min(self.tuning.max_sleep);
            log::trace!(
                "resize back-pressure: {resizers} resizers for a {target}-slot target, sleeping {nap:?}"
            );
            thread::sleep(nap);
            let next = t.next.load(Ordering::Acquire, guard);
            if !next.is_null() {
                return next;
            }
        }

        let fresh = Owned::new(Table::new(target, t.size.estimate() as usize));
        match t
            .next
            .compare_exchange(Shared::null(), fresh, Ordering::AcqRel, Ordering::Acquire, guard)
        {
            Ok(installed) => {
                log::debug!(
                    "resize installed: {} -> {} slots ({} requesters)",
                    t.capacity(),
                    target,
                    resizers
                );
                installed
            }
            // Lost the install race; the winner's table stands and our
            // allocation is dropped here.
            Err(e) => e.current,
        }
    }

    // ---Migration -----------------------------------------------------------

    /// Migrate one slot and credit the table's copy-done count. Used by
    /// readers and probes that land on a mid-migration slot.
    pub(crate) fn copy_slot_and_promote<'g>(
        &self,
        table: Shared<'g, Table<K, V>>,
        idx: usize,
        guard: &'g Guard,
    ) {
        if self.copy_slot(table, idx, guard) {
            self.copy_check_and_promote(table, 1, guard);
        }
    }

    /// Pay one chunk of migration work on the current table, if any is due.
    pub(crate) fn help_copy(&self, guard: &Guard) {
        let table = self.current.load(Ordering::Acquire, guard);
        let t = unsafe { table.deref() };
        if t.next.load(Ordering::Acquire, guard).is_null() {
            return;
        }
        self.help_copy_table(table, guard);
    }

    fn help_copy_table<'g>(&self, table: Shared<'g, Table<K, V>>, guard: &'g Guard) {
        let t = unsafe { table.deref() };
        let len = t.capacity();
        let chunk = len.min(COPY_CHUNK);
        let mut sweep = false;
        let mut copy_idx = 0;

        while t.copy_done.load(Ordering::Acquire) < len {
            if !sweep {
                copy_idx = t.copy_idx.load(Ordering::Relaxed);
                while copy_idx < len * 2 {
                    match t.copy_idx.compare_exchange(
                        copy_idx,
                        copy_idx + chunk,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => break,
                        Err(cur) => copy_idx = cur,
                    }
                }
                if copy_idx >= len * 2 {
                    // The cursor lapped the table; stop taking chunks and
                    // sweep until every slot is accounted for.
                    sweep = true;
                }
            }
            let mut work = 0;
            for i in 0..chunk {
                if self.copy_slot(table, (copy_idx + i) & t.mask(), guard) {
                    work += 1;
                }
            }
            if work > 0 {
                self.copy_check_and_promote(table, work, guard);
            }
            copy_idx += chunk;
            if !sweep {
                return;
            }
        }
        self.copy_check_and_promote(table, 0, guard);
    }

    /// Drive one slot to `Dead`, carrying a live value into the successor.
    /// Returns whether this thread performed the final transition.
    fn copy_slot<'g>(&self, table: Shared<'g, Table<K, V>>, idx: usize, guard: &'g Guard) -> bool {
        let t = unsafe { table.deref() };
        let slot = t.slot(idx);

        let mut cur = slot.cell.load(Ordering::Acquire, guard);
        loop {
            match state_of(cur) {
                CellState::Dead => return false,
                CellState::Prime => break,
                CellState::Empty | CellState::Tombstone => {
                    // Nothing to carry forward; one step to the terminal
                    // state. This also fences off never-claimed slots.
                    let was_tomb = state_of(cur) == CellState::Tombstone;
                    match slot.cell.compare_exchange(
                        cur,
                        dead(),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                        guard,
                    ) {
                        Ok(_) => {
                            if was_tomb {
                                unsafe { guard.defer_destroy(cur) };
                            }
                            return true;
                        }
                        Err(e) => cur = e.current,
                    }
                }
                CellState::Live => {
                    match slot.cell.compare_exchange(
                        cur,
                        cur.with_tag(TAG_PRIME),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                        guard,
                    ) {
                        Ok(_) => {
                            cur = cur.with_tag(TAG_PRIME);
                            break;
                        }
                        Err(e) => cur = e.current,
                    }
                }
            }
        }

        // The slot is primed: no new writes land here. Publish a copy into
        // the successor unless a later write already claimed that slot.
        let next = t.next.load(Ordering::Acquire, guard);
        debug_assert!(!next.is_null());
        let c = unsafe { cur.deref() };
        self.put_if_match(
            next,
            &c.key,
            Pending::put(c.value.clone()),
            MatchMode::SlotEmpty,
            false,
            guard,
        );

        // Whoever lands Prime -> Dead owns retiring the old cell; the entry
        // now counts against the successor, not this table.
        match slot
            .cell
            .compare_exchange(cur, dead(), Ordering::AcqRel, Ordering::Acquire, guard)
        {
            Ok(_) => {
                t.size.decrement();
                unsafe { guard.defer_destroy(cur) };
                true
            }
            Err(_) => false,
        }
    }

    /// Credit migration work; at full credit, swing the top-level table
    /// pointer to the successor and retire the drained table. The CAS is
    /// equality-guarded, so racing promoters are harmless.
    pub(crate) fn copy_check_and_promote<'g>(
        &self,
        table: Shared<'g, Table<K, V>>,
        work: usize,
        guard: &'g Guard,
    ) {
        let t = unsafe { table.deref() };
        let len = t.capacity();
        let done = if work > 0 {
            t.copy_done.fetch_add(work, Ordering::AcqRel) + work
        } else {
            t.copy_done.load(Ordering::Acquire)
        };
        debug_assert!(done <= len);
        if done == len {
            let next = t.next.load(Ordering::Acquire, guard);
            if self
                .current
                .compare_exchange(table, next, Ordering::AcqRel, Ordering::Acquire, guard)
                .is_ok()
            {
                log::debug!(
                    "table promoted: {} -> {} slots",
                    len,
                    unsafe { next.deref() }.capacity()
                );
                unsafe { guard.defer_destroy(table) };
            }
        }
    }
}

impl<K, V, C> Drop for NonBlockingHashMap<K, V, C> {
    fn drop(&mut self) {
        // Exclusive access: walk the chain and free everything directly.
        let guard = unsafe { epoch::unprotected() };
        let mut table = self.current.load(Ordering::Relaxed, guard);
        while !table.is_null() {
            let next = unsafe { table.deref() }.next.load(Ordering::Relaxed, guard);
            let t = unsafe { table.into_owned() };
            for idx in 0..t.capacity() {
                let cell = t.slot(idx).cell.load(Ordering::Relaxed, guard);
                if !cell.is_null() {
                    drop(unsafe { cell.into_owned() });
                }
            }
            drop(t);
            table = next;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn map() -> NonBlockingHashMap<String, u32> {
        NonBlockingHashMap::new()
    }

    #[test]
    fn test_insert_get() {
        let m = map();
        assert_eq!(m.put("a".into(), 1), None);
        assert_eq!(m.get(&"a".into()), Some(1));
        assert_eq!(m.put("a".into(), 2), Some(1));
        assert_eq!(m.get(&"a".into()), Some(2));
        assert_eq!(m.get(&"b".into()), None);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let m = map();
        m.put("k".into(), 7);
        assert_eq!(m.remove(&"k".into()), Some(7));
        assert_eq!(m.remove(&"k".into()), None);
        assert_eq!(m.get(&"k".into()), None);
    }

    #[test]
    fn test_remove_absent_writes_nothing() {
        let m = map();
        assert_eq!(m.remove(&"never".into()), None);
        assert_eq!(m.len_estimate(), 0);
    }

    #[test]
    fn test_put_if_absent() {
        let m = map();
        assert!(m.put_if_absent("k".into(), 1).is_ok());
        assert_eq!(m.put_if_absent("k".into(), 2), Err(1));
        m.remove(&"k".into());
        // A tombstoned key counts as absent again.
        assert!(m.put_if_absent("k".into(), 3).is_ok());
        assert_eq!(m.get(&"k".into()), Some(3));
    }

    #[test]
    fn test_replace_if_equal() {
        let m = map();
        assert!(!m.replace_if_equal(&"k".into(), &1, 9));
        m.put("k".into(), 1);
        assert!(!m.replace_if_equal(&"k".into(), &2, 9));
        assert_eq!(m.get(&"k".into()), Some(1));
        assert!(m.replace_if_equal(&"k".into(), &1, 9));
        assert_eq!(m.get(&"k".into()), Some(9));
    }

    #[test]
    fn test_remove_if_equal() {
        let m = map();
        m.put("k".into(), 5);
        assert!(!m.remove_if_equal(&"k".into(), &6));
        assert_eq!(m.get(&"k".into()), Some(5));
        assert!(m.remove_if_equal(&"k".into(), &5));
        assert_eq!(m.get(&"k".into()), None);
    }

    #[test]
    fn test_update_or_insert() {
        let m = map();
        assert_eq!(m.update_or_insert("n".into(), || 1, |v| v + 1), 1);
        assert_eq!(m.update_or_insert("n".into(), || 1, |v| v + 1), 2);
        assert_eq!(m.update_or_insert("n".into(), || 1, |v| v + 1), 3);
    }

    #[test]
    fn test_try_update_or_insert_aborts_cleanly() {
        let m = map();
        m.put("n".into(), 10);
        let err = m
            .try_update_or_insert("n".into(), || Ok(0), |_| Err("nope".into()))
            .unwrap_err();
        assert!(matches!(err, Error::PredicateFault(_)));
        assert_eq!(m.get(&"n".into()), Some(10));
    }

    #[test]
    fn test_resize_preserves_entries() {
        let m: NonBlockingHashMap<u32, u32> = NonBlockingHashMap::with_capacity(8);
        for k in 0..1_000 {
            m.put(k, k * 3);
        }
        assert!(m.capacity() > 8);
        for k in 0..1_000 {
            assert_eq!(m.get(&k), Some(k * 3), "key {k} lost across resizes");
        }
        assert_eq!(m.len_estimate(), 1_000);
    }

    #[test]
    fn test_tombstone_then_reinsert_round_trip() {
        let m: NonBlockingHashMap<u32, u32> = NonBlockingHashMap::with_capacity(64);
        for k in 0..500 {
            m.put(k, k);
        }
        for k in 0..500 {
            assert_eq!(m.remove(&k), Some(k));
        }
        assert_eq!(m.len_estimate(), 0);
        let cap_after_drain = m.capacity();
        for k in 0..500 {
            m.put(k, k);
        }
        for k in 0..500 {
            assert_eq!(m.get(&k), Some(k));
        }
        assert!(m.capacity() >= cap_after_drain);
    }

    #[test]
    fn test_get_key_value_returns_stored_key() {
        let m = map();
        m.put("stored".into(), 1);
        let (k, v) = m.get_key_value(&"stored".into()).unwrap();
        assert_eq!(k, "stored");
        assert_eq!(v, 1);
    }

    #[test]
    fn test_try_get_reports_absence() {
        let m = map();
        assert!(matches!(m.try_get(&"x".into()), Err(Error::KeyAbsent)));
        m.put("x".into(), 4);
        assert_eq!(m.try_get(&"x".into()).unwrap(), 4);
    }

    #[test]
    fn test_capacity_validation() {
        assert!(matches!(
            NonBlockingHashMap::<u32, u32>::try_with_capacity(0),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            NonBlockingHashMap::<u32, u32>::try_with_capacity(MAX_CAPACITY + 1),
            Err(Error::InvalidArgument(_))
        ));
        let m = NonBlockingHashMap::<u32, u32>::with_capacity(9);
        assert_eq!(m.capacity(), 16);
    }

    #[test]
    #[should_panic(expected = "initial capacity")]
    fn test_zero_capacity_panics() {
        let _ = NonBlockingHashMap::<u32, u32>::with_capacity(0);
    }
}
