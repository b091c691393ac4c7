//! Low-Lock MPSC Queue
//!
//! Linked queue used as a scheduler's dirty queue: any thread may push a
//! task handle, only the owning scheduler pops. Producers serialize on a
//! spinning flag held for two pointer writes; the consumer side does the
//! same. A permanent dummy node keeps head and tail decoupled so producers
//! and the consumer never contend on the same cache line for long.

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

struct Node<T> {
    value: Option<T>,
    next: AtomicPtr<Node<T>>,
}

impl<T> Node<T> {
    fn new(value: Option<T>) -> *mut Node<T> {
        Box::into_raw(Box::new(Node {
            value,
            next: AtomicPtr::new(ptr::null_mut()),
        }))
    }
}

pub struct MpscQueue<T> {
    /// Consumer side: dummy node whose `next` is the real front
    head: UnsafeCell<*mut Node<T>>,
    /// Producer side: last node in the chain
    tail: UnsafeCell<*mut Node<T>>,
    producer_lock: AtomicBool,
    consumer_lock: AtomicBool,
}

// Access to head/tail is guarded by the corresponding spin flag; values are
// moved across threads, so T must be Send.
unsafe impl<T: Send> Send for MpscQueue<T> {}
unsafe impl<T: Send> Sync for MpscQueue<T> {}

impl<T> MpscQueue<T> {
    pub fn new() -> Self {
        let dummy = Node::new(None);
        Self {
            head: UnsafeCell::new(dummy),
            tail: UnsafeCell::new(dummy),
            producer_lock: AtomicBool::new(false),
            consumer_lock: AtomicBool::new(false),
        }
    }

    fn acquire(flag: &AtomicBool) {
        while flag
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
    }

    pub fn push(&self, value: T) {
        let node = Node::new(Some(value));
        Self::acquire(&self.producer_lock);
        unsafe {
            // Publish to the consumer, then swing tail forward
            (**self.tail.get()).next.store(node, Ordering::Release);
            *self.tail.get() = node;
        }
        self.producer_lock.store(false, Ordering::Release);
    }

    pub fn pop(&self) -> Option<T> {
        Self::acquire(&self.consumer_lock);
        let result;
        unsafe {
            let first = *self.head.get();
            let next = (*first).next.load(Ordering::Acquire);
            if next.is_null() {
                self.consumer_lock.store(false, Ordering::Release);
                return None;
            }
            result = (*next).value.take();
            *self.head.get() = next;
            self.consumer_lock.store(false, Ordering::Release);
            drop(Box::from_raw(first));
        }
        result
    }

}

impl<T> Drop for MpscQueue<T> {
    fn drop(&mut self) {
        unsafe {
            let mut node = *self.head.get();
            while !node.is_null() {
                let next = (*node).next.load(Ordering::Relaxed);
                drop(Box::from_raw(node));
                node = next;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_fifo_order() {
        let q = MpscQueue::new();
        assert_eq!(q.pop(), None);
        for i in 0..10 {
            q.push(i);
        }
        for i in 0..10 {
            assert_eq!(q.pop(), Some(i));
        }
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn test_values_survive_drop() {
        let q = MpscQueue::new();
        let v = Arc::new(());
        q.push(v.clone());
        q.push(v.clone());
        drop(q);
        assert_eq!(Arc::strong_count(&v), 1);
    }

    #[test]
    fn test_multi_producer_single_consumer() {
        const PRODUCERS: usize = 8;
        const PER_PRODUCER: usize = 1000;

        let q = Arc::new(MpscQueue::new());
        let mut handles = Vec::new();
        for p in 0..PRODUCERS {
            let q = q.clone();
            handles.push(thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    q.push(p * PER_PRODUCER + i);
                }
            }));
        }

        let mut seen = vec![false; PRODUCERS * PER_PRODUCER];
        let mut count = 0;
        while count < PRODUCERS * PER_PRODUCER {
            if let Some(v) = q.pop() {
                assert!(!seen[v], "value {} delivered twice", v);
                seen[v] = true;
                count += 1;
            } else {
                std::hint::spin_loop();
            }
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(q.pop(), None);
    }
}
