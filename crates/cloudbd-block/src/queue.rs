//! Priority work queue with completion tracking
//!
//! Items are handed out highest priority first and FIFO within a priority.
//! Every `put` raises an unfinished-task counter that only `task_done`
//! lowers, so [`WorkQueue::join`] waits for processing to finish, not just
//! for the queue to empty.

use cloudbd_common::Priority;
use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering;
use std::collections::BinaryHeap;

struct Entry<T> {
    priority: Priority,
    seq: u64,
    item: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority first, then lower sequence number first
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct QueueState<T> {
    heap: BinaryHeap<Entry<T>>,
    next_seq: u64,
    /// Items put but not yet acknowledged with `task_done`
    unfinished: u64,
    shutdown: bool,
}

/// Thread-safe priority queue with `join` semantics
pub struct WorkQueue<T> {
    state: Mutex<QueueState<T>>,
    /// Signalled when an item is added or the queue shuts down
    available: Condvar,
    /// Signalled when the unfinished counter reaches zero
    all_done: Condvar,
}

impl<T> WorkQueue<T> {
    /// Create an empty queue
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                heap: BinaryHeap::new(),
                next_seq: 0,
                unfinished: 0,
                shutdown: false,
            }),
            available: Condvar::new(),
            all_done: Condvar::new(),
        }
    }

    /// Enqueue an item without blocking
    ///
    /// Returns the item back if the queue has been shut down.
    pub fn put(&self, item: T, priority: Priority) -> Result<(), T> {
        let mut state = self.state.lock();
        if state.shutdown {
            return Err(item);
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.unfinished += 1;
        state.heap.push(Entry {
            priority,
            seq,
            item,
        });
        drop(state);

        self.available.notify_one();
        Ok(())
    }

    /// Dequeue the next item, blocking until one is available
    ///
    /// Returns `None` only once the queue is shut down and drained.
    pub fn get(&self) -> Option<T> {
        let mut state = self.state.lock();
        loop {
            if let Some(entry) = state.heap.pop() {
                return Some(entry.item);
            }
            if state.shutdown {
                return None;
            }
            self.available.wait(&mut state);
        }
    }

    /// Mark one previously dequeued item as fully processed
    pub fn task_done(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.unfinished > 0, "task_done called more times than put");
        state.unfinished = state.unfinished.saturating_sub(1);
        if state.unfinished == 0 {
            self.all_done.notify_all();
        }
    }

    /// Block until every item put so far has been acknowledged
    pub fn join(&self) {
        let mut state = self.state.lock();
        while state.unfinished > 0 {
            self.all_done.wait(&mut state);
        }
    }

    /// Stop accepting items; consumers drain what is left, then get `None`
    pub fn shutdown(&self) {
        self.state.lock().shutdown = true;
        self.available.notify_all();
    }

    /// Stop accepting items and take every item not yet dequeued
    ///
    /// The caller owns the returned items and must call `task_done` for each.
    pub fn shutdown_now(&self) -> Vec<T> {
        let mut state = self.state.lock();
        state.shutdown = true;
        let mut pending = Vec::with_capacity(state.heap.len());
        while let Some(entry) = state.heap.pop() {
            pending.push(entry.item);
        }
        drop(state);

        self.available.notify_all();
        pending
    }

    /// Number of items waiting to be dequeued
    pub fn len(&self) -> usize {
        self.state.lock().heap.len()
    }

    /// Check if no items are waiting to be dequeued
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of items put but not yet acknowledged
    pub fn unfinished(&self) -> u64 {
        self.state.lock().unfinished
    }

    /// Check if the queue has been shut down
    pub fn is_shutdown(&self) -> bool {
        self.state.lock().shutdown
    }
}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
