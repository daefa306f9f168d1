use std::mem::MaybeUninit;
use std::sync::atomic::Ordering;

use crossbeam_epoch::{self as epoch, Atomic, Owned, Shared};

/// A Michael-Scott queue: a lock-free FIFO with a permanent sentinel head.
///
/// Both ends make progress by helping: an enqueuer that finds the tail
/// lagging swings it forward before retrying, so no thread ever waits on
/// another.
pub struct Queue<T> {
    head: Atomic<Node<T>>,
    tail: Atomic<Node<T>>,
}

struct Node<T> {
    // Uninitialized in the sentinel; initialized in every linked node and
    // read out exactly once by the dequeue that unlinks it.
    value: MaybeUninit<T>,
    next: Atomic<Node<T>>,
}

unsafe impl<T: Send> Send for Queue<T> {}
unsafe impl<T: Send> Sync for Queue<T> {}

impl<T> Queue<T> {
    pub fn new() -> Queue<T> {
        let guard = unsafe { epoch::unprotected() };
        let sentinel = Owned::new(Node {
            value: MaybeUninit::uninit(),
            next: Atomic::null(),
        })
        .into_shared(guard);
        Queue {
            head: Atomic::from(sentinel),
            tail: Atomic::from(sentinel),
        }
    }

    pub fn push(&self, value: T) {
        let guard = &epoch::pin();
        let node = Owned::new(Node {
            value: MaybeUninit::new(value),
            next: Atomic::null(),
        })
        .into_shared(guard);
        loop {
            let tail = self.tail.load(Ordering::Acquire, guard);
            let t = unsafe { tail.deref() };
            let next = t.next.load(Ordering::Acquire, guard);
            if !next.is_null() {
                // Tail is lagging; help it forward and retry.
                let _ = self
                    .tail
                    .compare_exchange(tail, next, Ordering::AcqRel, Ordering::Acquire, guard);
                continue;
            }
            if t.next
                .compare_exchange(Shared::null(), node, Ordering::AcqRel, Ordering::Acquire, guard)
                .is_ok()
            {
                let _ = self
                    .tail
                    .compare_exchange(tail, node, Ordering::AcqRel, Ordering::Acquire, guard);
                return;
            }
        }
    }

    pub fn pop(&self) -> Option<T> {
        let guard = &epoch::pin();
        loop {
            let head = self.head.load(Ordering::Acquire, guard);
            let h = unsafe { head.deref() };
            let next = h.next.load(Ordering::Acquire, guard);
            let n = unsafe { next.as_ref() }?;
            let tail = self.tail.load(Ordering::Acquire, guard);
            if tail == head {
                let _ = self
                    .tail
                    .compare_exchange(tail, next, Ordering::AcqRel, Ordering::Acquire, guard);
            }
            if self
                .head
                .compare_exchange(head, next, Ordering::AcqRel, Ordering::Acquire, guard)
                .is_ok()
            {
                // `next` is the new sentinel; its value moves out here and
                // is never touched again.
                let value = unsafe { n.value.assume_init_read() };
                unsafe { guard.defer_destroy(head) };
                return Some(value);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        let guard = &epoch::pin();
        let head = self.head.load(Ordering::Acquire, guard);
        unsafe { head.deref() }
            .next
            .load(Ordering::Acquire, guard)
            .is_null()
    }
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Queue::new()
    }
}

impl<T> Drop for Queue<T> {
    fn drop(&mut self) {
        // Exclusive access: free the chain directly. The first node is the
        // sentinel and holds no value.
        let guard = unsafe { epoch::unprotected() };
        let head = self.head.load(Ordering::Relaxed, guard);
        let sentinel = unsafe { head.into_owned() };
        let mut node = sentinel.next.load(Ordering::Relaxed, guard);
        drop(sentinel);
        while !node.is_null() {
            let mut owned = unsafe { node.into_owned() };
            unsafe { owned.value.assume_init_drop() };
            node = owned.next.load(Ordering::Relaxed, guard);
        }
    }
}

#[cfg(test)]
mod test {
    use super::Queue;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_fifo_order() {
        let q = Queue::new();
        assert!(q.is_empty());
        q.push(1);
        q.push(2);
        q.push(3);
        assert!(!q.is_empty());
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), Some(3));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn test_mpmc_delivers_everything_once() {
        let q = Arc::new(Queue::new());
        let producers: Vec<_> = (0..4)
            .map(|p| {
                let q = Arc::clone(&q);
                thread::spawn(move || {
                    for i in 0..5_000_u32 {
                        q.push(p * 5_000 + i);
                    }
                })
            })
            .collect();
        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let q = Arc::clone(&q);
                thread::spawn(move || {
                    let mut got = Vec::new();
                    while got.len() < 5_000 {
                        if let Some(v) = q.pop() {
                            got.push(v);
                        }
                    }
                    got
                })
            })
            .collect();
        for t in producers {
            t.join().expect("producer panicked");
        }
        let mut all: Vec<u32> = Vec::new();
        for t in consumers {
            all.extend(t.join().expect("consumer panicked"));
        }
        all.sort_unstable();
        assert_eq!(all, (0..20_000).collect::<Vec<_>>());
    }

    #[test]
    fn test_per_producer_order_is_kept() {
        let q = Arc::new(Queue::new());
        let producer = {
            let q = Arc::clone(&q);
            thread::spawn(move || {
                for i in 0..10_000_u32 {
                    q.push(i);
                }
            })
        };
        let mut last = None;
        let mut seen = 0;
        while seen < 10_000 {
            if let Some(v) = q.pop() {
                if let Some(prev) = last {
                    assert!(v > prev, "single-producer order violated: {prev} then {v}");
                }
                last = Some(v);
                seen += 1;
            }
        }
        producer.join().expect("producer panicked");
    }

    #[test]
    fn test_drop_releases_remaining_values() {
        let q = Queue::new();
        for i in 0..100 {
            q.push(Box::new(i));
        }
        q.pop();
        drop(q);
    }
}
