//! Bounded producer/consumer queue
//!
//! The query executor's work channel in multi-threaded mode: a FIFO of
//! fixed capacity guarded by one mutex and two condition variables,
//! `not_empty` for consumers and `not_full` for producers. `not_full`
//! doubles as the completion signal, so `await_completion` wakes whenever
//! a consumer takes an element.

use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};

struct Inner<T> {
    queue: VecDeque<T>,
    shutdown: bool,
}

/// A bounded FIFO. All operations are safe to call from any thread.
pub struct TaskQueue<T> {
    inner: Mutex<Inner<T>>,
    capacity: usize,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<T> TaskQueue<T> {
    /// `capacity` must be at least 1.
    pub fn new(capacity: usize) -> TaskQueue<T> {
        assert!(capacity > 0, "task queue capacity must be positive");
        TaskQueue {
            inner: Mutex::new(Inner {
                queue: VecDeque::with_capacity(capacity),
                shutdown: false,
            }),
            capacity,
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// Enqueue, blocking while the queue is full. Returns false if the
    /// queue shut down before space appeared.
    pub fn submit(&self, task: T) -> bool {
        let mut inner = self.inner.lock();
        while inner.queue.len() >= self.capacity && !inner.shutdown {
            self.not_full.wait(&mut inner);
        }
        if inner.shutdown {
            return false;
        }
        inner.queue.push_back(task);
        self.not_empty.notify_one();
        true
    }

    /// Enqueue only if space is free right now.
    pub fn try_submit(&self, task: T) -> bool {
        let mut inner = self.inner.lock();
        if inner.shutdown || inner.queue.len() >= self.capacity {
            return false;
        }
        inner.queue.push_back(task);
        self.not_empty.notify_one();
        true
    }

    /// Drain `supplier` into free slots under one lock hold, until the
    /// queue fills or the supplier runs dry. Returns the number enqueued;
    /// all waiting consumers are notified.
    pub fn fill<F: FnMut() -> Option<T>>(&self, mut supplier: F) -> usize {
        let mut inner = self.inner.lock();
        let mut added = 0;
        while !inner.shutdown && inner.queue.len() < self.capacity {
            match supplier() {
                Some(task) => {
                    inner.queue.push_back(task);
                    added += 1;
                }
                None => break,
            }
        }
        if added > 0 {
            self.not_empty.notify_all();
        }
        added
    }

    /// Consume tasks until `shutdown` has been called and the queue is
    /// empty.
    pub fn process<F: FnMut(T)>(&self, mut handler: F) {
        loop {
            let task = {
                let mut inner = self.inner.lock();
                loop {
                    if let Some(task) = inner.queue.pop_front() {
                        // Wakes both blocked producers and
                        // await_completion waiters.
                        self.not_full.notify_all();
                        break task;
                    }
                    if inner.shutdown {
                        return;
                    }
                    self.not_empty.wait(&mut inner);
                }
            };
            handler(task);
        }
    }

    /// Block until the queue is empty.
    pub fn await_completion(&self) {
        let mut inner = self.inner.lock();
        while !inner.queue.is_empty() {
            self.not_full.wait(&mut inner);
        }
    }

    /// Wake every producer and consumer; `process` calls drain what is
    /// left and return.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock();
        inner.shutdown = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// A lower bound on free slots. The lock is held for the read; the
    /// value is monotone-decreasing only in the absence of consumers.
    pub fn minimum_remaining_capacity(&self) -> usize {
        let inner = self.inner.lock();
        self.capacity - inner.queue.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_fifo_order() {
        let queue = TaskQueue::new(8);
        for i in 0..5 {
            assert!(queue.submit(i));
        }
        queue.shutdown();
        let mut seen = Vec::new();
        queue.process(|task| seen.push(task));
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_try_submit_full() {
        let queue = TaskQueue::new(2);
        assert!(queue.try_submit(1));
        assert!(queue.try_submit(2));
        assert!(!queue.try_submit(3));
        assert_eq!(queue.minimum_remaining_capacity(), 0);
    }

    #[test]
    fn test_fill_stops_at_capacity() {
        let queue = TaskQueue::new(3);
        let mut next = 0;
        let added = queue.fill(|| {
            next += 1;
            Some(next)
        });
        assert_eq!(added, 3);
        assert_eq!(queue.len(), 3);

        let added = queue.fill(|| Some(99));
        assert_eq!(added, 0);
    }

    #[test]
    fn test_fill_stops_when_supplier_dries() {
        let queue: TaskQueue<i32> = TaskQueue::new(10);
        let mut items = vec![1, 2];
        let added = queue.fill(|| items.pop());
        assert_eq!(added, 2);
    }

    #[test]
    fn test_blocking_submit_and_concurrent_consume() {
        let queue = Arc::new(TaskQueue::new(2));
        let consumed = Arc::new(AtomicUsize::new(0));

        let consumer = {
            let queue = queue.clone();
            let consumed = consumed.clone();
            std::thread::spawn(move || {
                queue.process(|_task: usize| {
                    consumed.fetch_add(1, Ordering::SeqCst);
                });
            })
        };

        // More submissions than capacity: the producer must block and
        // resume as the consumer drains.
        for i in 0..20 {
            assert!(queue.submit(i));
        }
        queue.await_completion();
        queue.shutdown();
        consumer.join().unwrap();
        assert_eq!(consumed.load(Ordering::SeqCst), 20);
    }

    #[test]
    fn test_submit_after_shutdown_fails() {
        let queue = TaskQueue::new(2);
        queue.shutdown();
        assert!(!queue.submit(1));
        assert!(!queue.try_submit(1));
    }

    #[test]
    fn test_process_drains_after_shutdown() {
        let queue = TaskQueue::new(4);
        queue.submit(1);
        queue.submit(2);
        queue.shutdown();
        let mut seen = Vec::new();
        queue.process(|t| seen.push(t));
        assert_eq!(seen, vec![1, 2]);
    }
}
