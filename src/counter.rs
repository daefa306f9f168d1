use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

/// A counter striped across cache lines.
///
/// Writers pick a stripe by thread affinity so uncontended increments never
/// share a line; [`estimate`](StripedCounter::estimate) sums the stripes
/// without any synchronization barrier and is therefore only a point-in-time
/// approximation under concurrent updates. The hash table uses one of these
/// per table for live size and another for claimed slots.
pub struct StripedCounter {
    stripes: Box<[CachePadded<AtomicI64>]>,
    mask: usize,
}

// One stripe per two hardware threads, capped so the footprint stays within
// a few cache lines even on large machines.
fn stripe_count() -> usize {
    (num_cpus::get() * 2).clamp(1, 16).next_power_of_two()
}

static NEXT_THREAD_STRIPE: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static THREAD_STRIPE: usize = NEXT_THREAD_STRIPE.fetch_add(1, Ordering::Relaxed);
}

impl StripedCounter {
    pub fn new() -> StripedCounter {
        let n = stripe_count();
        let stripes = (0..n)
            .map(|_| CachePadded::new(AtomicI64::new(0)))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        StripedCounter { stripes, mask: n - 1 }
    }

    pub fn add(&self, delta: i64) {
        let idx = THREAD_STRIPE.with(|s| *s) & self.mask;
        self.stripes[idx].fetch_add(delta, Ordering::AcqRel);
    }

    pub fn increment(&self) {
        self.add(1);
    }

    pub fn decrement(&self) {
        self.add(-1);
    }

    /// Point-in-time sum of all stripes. Concurrent updates may be missed or
    /// double-observed; never negative even when decrements race ahead of the
    /// increments they pair with.
    pub fn estimate(&self) -> i64 {
        self.stripes
            .iter()
            .map(|s| s.load(Ordering::Acquire))
            .sum::<i64>()
            .max(0)
    }
}

impl Default for StripedCounter {
    fn default() -> Self {
        StripedCounter::new()
    }
}

#[cfg(test)]
mod test {
    use super::StripedCounter;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_single_thread_sum() {
        let c = StripedCounter::new();
        for _ in 0..100 {
            c.increment();
        }
        for _ in 0..40 {
            c.decrement();
        }
        c.add(5);
        assert_eq!(c.estimate(), 65);
    }

    #[test]
    fn test_estimate_floor_at_zero() {
        let c = StripedCounter::new();
        c.decrement();
        assert_eq!(c.estimate(), 0);
    }

    #[test]
    fn test_concurrent_increments() {
        let c = Arc::new(StripedCounter::new());
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let c = Arc::clone(&c);
                thread::spawn(move || {
                    for _ in 0..10_000 {
                        c.increment();
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().expect("counter thread panicked");
        }
        assert_eq!(c.estimate(), 80_000);
    }
}
