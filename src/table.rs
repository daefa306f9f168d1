use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use crossbeam_epoch::Atomic;

use crate::cell::Cell;
use crate::counter::StripedCounter;
use crate::error::Error;

/// Hard structural bound on a table's slot count.
pub(crate) const MAX_CAPACITY: usize = 1 << 30;

/// Probe-distance floor and the capacity divisor above it.
pub(crate) const REPROBE_MIN: usize = 5;
pub(crate) const REPROBE_SHIFT: usize = 32;

/// Slots migrated per helping mutator before it moves on to the successor.
pub(crate) const COPY_CHUNK: usize = 1024;

/// A memoized hash of zero means "never claimed", so a real hash of zero is
/// remapped to this sentinel.
pub(crate) const ZERO_HASH_SUBSTITUTE: u32 = 0x5555_5555;

/// Knobs for the resize-allocation stampede guard. These are hints on an
/// optimization path; correctness never depends on them.
#[derive(Clone, Debug)]
pub struct ResizeTuning {
    /// Concurrent resize requests at or above this count start backing off.
    pub stampede_resizers: usize,
    /// Back-pressure only engages for targets at least this many slot bytes.
    pub stampede_bytes: usize,
    /// Upper bound for one back-pressure sleep.
    pub max_sleep: Duration,
}

impl Default for ResizeTuning {
    fn default() -> Self {
        ResizeTuning {
            stampede_resizers: 3,
            stampede_bytes: 256 * 1024,
            max_sleep: Duration::from_millis(200),
        }
    }
}

// ---Slot record -----------------------------------------------------------

/// One open-addressed slot: the memoized hash and the value cell.
///
/// The memo is write-once: it moves from zero to a non-zero hash when the
/// slot is claimed and is never rewritten afterwards, so probes may trust a
/// mismatch without touching the cell.
pub(crate) struct Slot<K, V> {
    hash: AtomicU32,
    pub(crate) cell: Atomic<Cell<K, V>>,
}

impl<K, V> Slot<K, V> {
    fn new() -> Slot<K, V> {
        Slot {
            hash: AtomicU32::new(0),
            cell: Atomic::null(),
        }
    }

    pub(crate) fn hash_memo(&self) -> u32 {
        self.hash.load(Ordering::Acquire)
    }

    /// Claim the slot for `hash`. `Ok` means this caller performed the
    /// claim; `Err` carries the memo a racing claimer installed, which may
    /// equal `hash`.
    pub(crate) fn claim(&self, hash: u32) -> Result<(), u32> {
        match self
            .hash
            .compare_exchange(0, hash, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Ok(()),
            Err(current) => Err(current),
        }
    }
}

// ---Table -----------------------------------------------------------------

/// A fixed-capacity slot array plus the migration bookkeeping that lets a
/// table hand its contents to a successor.
pub(crate) struct Table<K, V> {
    slots: Box<[Slot<K, V>]>,
    /// The resize target. Write-once via CAS; a non-null value means a
    /// migration is in progress or complete.
    pub(crate) next: Atomic<Table<K, V>>,
    /// Live entries in this table (approximate).
    pub(crate) size: StripedCounter,
    /// Slots whose hash memo is non-zero (approximate, never decremented).
    pub(crate) slots_claimed: StripedCounter,
    /// Cursor handing out migration chunks.
    pub(crate) copy_idx: AtomicUsize,
    /// Slots that have reached `Dead`; promotion fires at capacity.
    pub(crate) copy_done: AtomicUsize,
    /// Threads that have requested a resize of this table.
    pub(crate) resizers: AtomicUsize,
    /// Live size of the predecessor when this table was allocated; a resize
    /// arriving at the same size again signals churn rather than growth.
    prev_size: usize,
}

impl<K, V> Table<K, V> {
    pub(crate) fn new(capacity: usize, prev_size: usize) -> Table<K, V> {
        debug_assert!(capacity.is_power_of_two());
        let slots = (0..capacity)
            .map(|_| Slot::new())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Table {
            slots,
            next: Atomic::null(),
            size: StripedCounter::new(),
            slots_claimed: StripedCounter::new(),
            copy_idx: AtomicUsize::new(0),
            copy_done: AtomicUsize::new(0),
            resizers: AtomicUsize::new(0),
            prev_size,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn mask(&self) -> usize {
        self.slots.len() - 1
    }

    pub(crate) fn slot(&self, idx: usize) -> &Slot<K, V> {
        &self.slots[idx]
    }

    /// Bound on linear-probe distance before the table is declared too full.
    pub(crate) fn reprobe_limit(&self) -> usize {
        REPROBE_MIN.max(self.capacity() / REPROBE_SHIFT)
    }

    /// Resize pressure independent of any one probe chain: live fill at a
    /// quarter of capacity, or claimed slots (live plus tombstoned) at half.
    pub(crate) fn should_grow(&self) -> bool {
        let cap = self.capacity();
        self.size.estimate() as usize >= cap / 4
            || self.slots_claimed.estimate() as usize >= cap / 2
    }

    /// "How big???" heuristics are here. Grows up to 8x the
    /// live size as fill rises, doubles on same-size churn and on tombstone
    /// pressure, and never shrinks.
    pub(crate) fn target_capacity(&self) -> Result<usize, Error> {
        let cap = self.capacity();
        let size = self.size.estimate() as usize;
        let slots = self.slots_claimed.estimate() as usize;

        let mut newsz = if size >= cap / 4 * 3 {
            size * 8
        } else if size >= cap / 2 {
            size * 4
        } else if size >= cap / 4 {
            size * 2
        } else {
            size
        };
        if newsz < cap {
            newsz = cap;
        }
        // No growth since the last resize: reprobe pressure without fill,
        // double anyway.
        if size == self.prev_size {
            newsz = newsz.max(cap * 2);
        }
        // Mostly tombstones: a same-size copy would refill immediately.
        if slots >= size.saturating_mul(2) {
            newsz = newsz.max(cap * 2);
        }

        let target = newsz.next_power_of_two();
        if target > MAX_CAPACITY {
            return Err(Error::CapacityExceeded(target));
        }
        Ok(target)
    }
}

/// Remap the comparator's hash so zero always means "never claimed".
pub(crate) fn memoize(hash: u32) -> u32 {
    if hash == 0 {
        ZERO_HASH_SUBSTITUTE
    } else {
        hash
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_claim_is_write_once() {
        let slot: Slot<u32, u32> = Slot::new();
        assert_eq!(slot.hash_memo(), 0);
        assert_eq!(slot.claim(42), Ok(()));
        assert_eq!(slot.claim(99), Err(42));
        assert_eq!(slot.claim(42), Err(42));
        assert_eq!(slot.hash_memo(), 42);
    }

    #[test]
    fn test_reprobe_limit_floor_and_scale() {
        let small: Table<u32, u32> = Table::new(64, 0);
        assert_eq!(small.reprobe_limit(), 5);
        let big: Table<u32, u32> = Table::new(4096, 0);
        assert_eq!(big.reprobe_limit(), 128);
    }

    #[test]
    fn test_target_capacity_growth_bands() {
        let t: Table<u32, u32> = Table::new(64, 1);
        // An empty table satisfies slots >= 2 * size, so even it doubles.
        assert_eq!(t.target_capacity().unwrap(), 128);

        for _ in 0..48 {
            t.size.increment();
            t.slots_claimed.increment();
        }
        // size 48 >= 3/4 * 64 -> 8 * 48 -> next power of two.
        assert_eq!(t.target_capacity().unwrap(), 512);
    }

    #[test]
    fn test_target_capacity_doubles_on_churn() {
        let t: Table<u32, u32> = Table::new(64, 3);
        for _ in 0..3 {
            t.size.increment();
            t.slots_claimed.increment();
        }
        // Same live size as at the previous resize: double.
        assert_eq!(t.target_capacity().unwrap(), 128);
    }

    #[test]
    fn test_target_capacity_doubles_on_tombstone_pressure() {
        let t: Table<u32, u32> = Table::new(64, 0);
        for _ in 0..4 {
            t.size.increment();
        }
        for _ in 0..40 {
            t.slots_claimed.increment();
        }
        assert_eq!(t.target_capacity().unwrap(), 128);
    }

    #[test]
    fn test_target_capacity_ceiling() {
        let t: Table<u32, u32> = Table::new(1 << 4, 0);
        for _ in 0..15 {
            t.size.increment();
        }
        // 15 >= 12 -> 8 * 15 = 120 -> 128; fine. Push the size estimate past
        // the representable range instead.
        t.size.add((MAX_CAPACITY as i64) + 1);
        assert!(matches!(
            t.target_capacity(),
            Err(Error::CapacityExceeded(_))
        ));
    }

    #[test]
    fn test_memoize_remaps_zero_only() {
        assert_eq!(memoize(0), ZERO_HASH_SUBSTITUTE);
        assert_eq!(memoize(7), 7);
        assert_eq!(memoize(ZERO_HASH_SUBSTITUTE), ZERO_HASH_SUBSTITUTE);
    }
}
