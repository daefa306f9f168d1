use std::mem::ManuallyDrop;
use std::sync::atomic::Ordering;

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};

/// A Treiber stack: a lock-free LIFO built from a single CAS'd head pointer.
pub struct Stack<T> {
    head: Atomic<Node<T>>,
}

struct Node<T> {
    // The winner of a pop reads the value out in place, so the node must not
    // drop it again when the epoch reclaims the allocation.
    value: ManuallyDrop<T>,
    next: Atomic<Node<T>>,
}

unsafe impl<T: Send> Send for Stack<T> {}
// peek_with exposes &T to concurrent callers, hence the extra Sync bound.
unsafe impl<T: Send + Sync> Sync for Stack<T> {}

impl<T> Stack<T> {
    pub fn new() -> Stack<T> {
        Stack {
            head: Atomic::null(),
        }
    }

    pub fn push(&self, value: T) {
        let guard = &epoch::pin();
        let mut node = Owned::new(Node {
            value: ManuallyDrop::new(value),
            next: Atomic::null(),
        });
        loop {
            let head = self.head.load(Ordering::Acquire, guard);
            node.next.store(head, Ordering::Relaxed);
            match self
                .head
                .compare_exchange(head, node, Ordering::AcqRel, Ordering::Acquire, guard)
            {
                Ok(_) => return,
                Err(e) => node = e.new,
            }
        }
    }

    pub fn pop(&self) -> Option<T> {
        let guard = &epoch::pin();
        loop {
            let head = self.head.load(Ordering::Acquire, guard);
            let node = unsafe { head.as_ref() }?;
            let next = node.next.load(Ordering::Acquire, guard);
            if self
                .head
                .compare_exchange(head, next, Ordering::AcqRel, Ordering::Acquire, guard)
                .is_ok()
            {
                let value = unsafe { std::ptr::read(&*node.value) };
                unsafe { guard.defer_destroy(head) };
                return Some(value);
            }
        }
    }

    /// Apply `f` to the value currently on top, if any. The observation is
    /// immediately stale under concurrency.
    pub fn peek_with<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        let guard = &epoch::pin();
        let head = self.head.load(Ordering::Acquire, guard);
        unsafe { head.as_ref() }.map(|node| f(&node.value))
    }

    pub fn is_empty(&self) -> bool {
        let guard = &epoch::pin();
        self.head.load(Ordering::Acquire, guard).is_null()
    }

    fn head_for_drop<'g>(&mut self, guard: &'g Guard) -> Shared<'g, Node<T>> {
        self.head.load(Ordering::Relaxed, guard)
    }
}

impl<T> Default for Stack<T> {
    fn default() -> Self {
        Stack::new()
    }
}

impl<T> Drop for Stack<T> {
    fn drop(&mut self) {
        // Exclusive access: free the chain directly.
        let guard = unsafe { epoch::unprotected() };
        let mut node = self.head_for_drop(guard);
        while !node.is_null() {
            let mut owned = unsafe { node.into_owned() };
            unsafe { ManuallyDrop::drop(&mut owned.value) };
            node = owned.next.load(Ordering::Relaxed, guard);
        }
    }
}
