//! A bounded, multi-producer multi-consumer FIFO queue handing off owned
//! work items from the network front end to the worker pool.
//!
//! Status queries (`is_empty`, `is_full`, `get_size`) must never serialize
//! with a waiter blocked in `add`/`pop`. `std::sync::Mutex` gives the
//! waiting protocol this needs for free (release before wait, re-check in
//! a loop on wakeup via [`Condvar::wait_timeout_while`]), so a single
//! `Mutex<Inner<T>>` plus two `Condvar`s reproduces that discipline without
//! a second lock — see `DESIGN.md` for the full rationale.

use std::{
    cell::Cell,
    collections::VecDeque,
    sync::{Condvar, Mutex},
    time::{Duration, Instant},
};

use sc_utils::safe_assert;
use thiserror::Error;
use tracing::error;

/// Default timeout for blocking `add`.
pub const ADD_TIMEOUT: Duration = Duration::from_secs(2);
/// Default timeout for blocking `pop`.
pub const POP_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    #[error("operation timed out waiting for queue capacity/items")]
    Timeout,
    #[error("queue is full")]
    Full,
    #[error("queue is empty")]
    Empty,
    #[error("invalid capacity (must be > 0)")]
    Invalid,
    #[error("capacity overflows the maximum safe allocation size")]
    Overflow,
    #[error("queue is closed")]
    Closed,
}

impl QueueError {
    /// A human-readable diagnostic so callers don't need to match on the
    /// enum themselves.
    #[must_use]
    pub fn strerror(self) -> &'static str {
        match self {
            QueueError::Timeout => "operation timed out",
            QueueError::Full => "queue is full",
            QueueError::Empty => "queue is empty",
            QueueError::Invalid => "invalid capacity",
            QueueError::Overflow => "capacity overflow",
            QueueError::Closed => "queue is closed",
        }
    }
}

thread_local! {
    static LAST_ERROR: Cell<Option<QueueError>> = const { Cell::new(None) };
}

fn set_last_error(err: Option<QueueError>) {
    LAST_ERROR.with(|cell| cell.set(err));
}

/// Returns the last error recorded by a queue operation on *this* thread,
/// or `None` if the last operation on this thread succeeded — a C-style
/// per-thread errno diagnostic.
#[must_use]
pub fn last_error() -> Option<QueueError> {
    LAST_ERROR.with(Cell::get)
}

struct Inner<T> {
    items: VecDeque<T>,
    capacity: usize,
    closed: bool,
}

/// A bounded FIFO queue of owned `T` values, safe to share across threads
/// behind an `Arc`.
pub struct WorkQueue<T> {
    inner: Mutex<Inner<T>>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<T> WorkQueue<T> {
    /// Maximum capacity this queue type accepts: a `usize::MAX / sizeof(slot)
    /// / 2` safety margin against allocation-size overflow.
    #[must_use]
    pub fn max_capacity() -> usize {
        let slot_size = std::mem::size_of::<T>().max(1);
        usize::MAX / slot_size / 2
    }

    /// Creates an empty queue holding up to `capacity` items.
    ///
    /// # Errors
    /// Returns [`QueueError::Invalid`] if `capacity == 0`, or
    /// [`QueueError::Overflow`] if `capacity` exceeds [`WorkQueue::max_capacity`].
    pub fn new(capacity: usize) -> Result<Self, QueueError> {
        if capacity == 0 {
            set_last_error(Some(QueueError::Invalid));
            return Err(QueueError::Invalid);
        }
        if capacity > Self::max_capacity() {
            set_last_error(Some(QueueError::Overflow));
            return Err(QueueError::Overflow);
        }

        set_last_error(None);
        Ok(Self {
            inner: Mutex::new(Inner { items: VecDeque::with_capacity(capacity), capacity, closed: false }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        })
    }

    /// Enqueues `item`, blocking up to [`ADD_TIMEOUT`] while the queue is
    /// full. Wakes exactly one waiting `pop`.
    ///
    /// # Errors
    /// [`QueueError::Timeout`] if the queue is still full after the
    /// deadline elapses.
    pub fn add(&self, item: T) -> Result<(), QueueError> {
        self.add_timeout(item, ADD_TIMEOUT)
    }

    /// Same as [`WorkQueue::add`] with an explicit timeout, using an
    /// absolute deadline computed once up front so repeated spurious
    /// wakeups cannot extend the total wait.
    pub fn add_timeout(&self, item: T, timeout: Duration) -> Result<(), QueueError> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);

        loop {
            if guard.closed {
                set_last_error(Some(QueueError::Closed));
                return Err(QueueError::Closed);
            }

            if guard.items.len() < guard.capacity {
                guard.items.push_back(item);
                safe_assert!(guard.items.len() <= guard.capacity, "queue size exceeded capacity after push");
                drop(guard);
                self.not_empty.notify_one();
                set_last_error(None);
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                set_last_error(Some(QueueError::Timeout));
                return Err(QueueError::Timeout);
            }

            let (g, timed_out) = self
                .not_full
                .wait_timeout_while(guard, deadline - now, |inner| !inner.closed && inner.items.len() >= inner.capacity)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            guard = g;
            if guard.closed {
                set_last_error(Some(QueueError::Closed));
                return Err(QueueError::Closed);
            }
            if timed_out.timed_out() && guard.items.len() >= guard.capacity {
                set_last_error(Some(QueueError::Timeout));
                return Err(QueueError::Timeout);
            }
        }
    }

    /// Enqueues `item` if there is room, else returns [`QueueError::Full`]
    /// immediately without blocking. Returns [`QueueError::Closed`] instead
    /// if the queue has been [`WorkQueue::close`]d — no new work is
    /// accepted once shutdown has begun.
    pub fn try_add(&self, item: T) -> Result<(), QueueError> {
        let mut guard = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if guard.closed {
            set_last_error(Some(QueueError::Closed));
            return Err(QueueError::Closed);
        }
        if guard.items.len() >= guard.capacity {
            set_last_error(Some(QueueError::Full));
            return Err(QueueError::Full);
        }
        guard.items.push_back(item);
        safe_assert!(guard.items.len() <= guard.capacity, "queue size exceeded capacity after push");
        drop(guard);
        self.not_empty.notify_one();
        set_last_error(None);
        Ok(())
    }

    /// Dequeues the oldest item, blocking up to [`POP_TIMEOUT`] while the
    /// queue is empty. Wakes exactly one waiting `add`.
    ///
    /// # Errors
    /// [`QueueError::Timeout`] if the queue is still empty after the
    /// deadline elapses.
    pub fn pop(&self) -> Result<T, QueueError> {
        self.pop_timeout(POP_TIMEOUT)
    }

    /// Same as [`WorkQueue::pop`] with an explicit timeout.
    pub fn pop_timeout(&self, timeout: Duration) -> Result<T, QueueError> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);

        loop {
            if let Some(item) = guard.items.pop_front() {
                drop(guard);
                self.not_full.notify_one();
                set_last_error(None);
                return Ok(item);
            }

            if guard.closed {
                set_last_error(Some(QueueError::Closed));
                return Err(QueueError::Closed);
            }

            let now = Instant::now();
            if now >= deadline {
                set_last_error(Some(QueueError::Timeout));
                return Err(QueueError::Timeout);
            }

            let (g, timed_out) = self
                .not_empty
                .wait_timeout_while(guard, deadline - now, |inner| !inner.closed && inner.items.is_empty())
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            guard = g;
            if !guard.items.is_empty() {
                continue;
            }
            if guard.closed {
                set_last_error(Some(QueueError::Closed));
                return Err(QueueError::Closed);
            }
            if timed_out.timed_out() {
                set_last_error(Some(QueueError::Timeout));
                return Err(QueueError::Timeout);
            }
        }
    }

    /// Dequeues an item if one is available, else returns
    /// [`QueueError::Empty`] immediately without blocking.
    pub fn try_pop(&self) -> Result<T, QueueError> {
        let mut guard = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        match guard.items.pop_front() {
            Some(item) => {
                drop(guard);
                self.not_full.notify_one();
                set_last_error(None);
                Ok(item)
            }
            None => {
                set_last_error(Some(QueueError::Empty));
                Err(QueueError::Empty)
            }
        }
    }

    /// Snapshot of the current item count under the data lock.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner).items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        let guard = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        guard.items.len() >= guard.capacity
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner).capacity
    }

    /// Marks the queue closed and wakes every waiter so blocked `add`/`pop`
    /// calls can observe shutdown promptly instead of waiting out their
    /// full timeout. Does not drop any remaining items; see
    /// [`WorkQueue::drain_with_cleanup`] for that.
    pub fn close(&self) {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner).closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner).closed
    }

    /// Drains every remaining item, invoking `cleanup` exactly once per
    /// item, then leaves the queue empty.
    /// A no-op on an already-empty queue.
    pub fn drain_with_cleanup<F: FnMut(T)>(&self, mut cleanup: F) {
        let mut guard = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        while let Some(item) = guard.items.pop_front() {
            cleanup(item);
        }
    }
}

impl<T> Drop for WorkQueue<T> {
    fn drop(&mut self) {
        let remaining = self.inner.lock().map(|g| g.items.len()).unwrap_or(0);
        if remaining > 0 {
            error!(remaining, "work queue dropped with items still enqueued");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use super::*;

    #[test]
    fn empty_queue_reports_empty_for_all_valid_capacities() {
        for capacity in [1usize, 2, 8, 1024] {
            let q: WorkQueue<u32> = WorkQueue::new(capacity).unwrap();
            assert_eq!(q.len(), 0);
            assert!(q.is_empty());
            assert!(!q.is_full());
        }
    }

    #[test]
    fn zero_capacity_is_invalid() {
        let result: Result<WorkQueue<u32>, _> = WorkQueue::new(0);
        assert_eq!(result.unwrap_err(), QueueError::Invalid);
    }

    #[test]
    fn try_add_on_full_does_not_change_size() {
        let q: WorkQueue<u32> = WorkQueue::new(1).unwrap();
        q.try_add(1).unwrap();
        assert_eq!(q.try_add(2), Err(QueueError::Full));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn try_pop_on_empty_does_not_change_size() {
        let q: WorkQueue<u32> = WorkQueue::new(4).unwrap();
        assert_eq!(q.try_pop(), Err(QueueError::Empty));
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn fifo_order_is_preserved_single_producer() {
        let q: WorkQueue<u32> = WorkQueue::new(8).unwrap();
        for i in 0..8 {
            q.try_add(i).unwrap();
        }
        for i in 0..8 {
            assert_eq!(q.try_pop().unwrap(), i);
        }
    }

    #[test]
    fn blocking_pop_times_out_within_margin() {
        let q: WorkQueue<u32> = WorkQueue::new(4).unwrap();
        let start = Instant::now();
        let result = q.pop_timeout(Duration::from_millis(200));
        let elapsed = start.elapsed();
        assert_eq!(result, Err(QueueError::Timeout));
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed <= Duration::from_millis(700));
    }

    #[test]
    fn blocking_add_unblocks_when_consumer_pops() {
        let q = Arc::new(WorkQueue::<u32>::new(2).unwrap());
        q.try_add(1).unwrap();
        q.try_add(2).unwrap();

        let q2 = Arc::clone(&q);
        let producer = thread::spawn(move || {
            let start = Instant::now();
            q2.add_timeout(3, Duration::from_secs(2)).unwrap();
            start.elapsed()
        });

        thread::sleep(Duration::from_millis(100));
        assert_eq!(q.try_pop().unwrap(), 1);

        let elapsed = producer.join().unwrap();
        assert!(elapsed <= Duration::from_millis(2500));
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn multi_producer_preserves_per_producer_order() {
        let q = Arc::new(WorkQueue::<(u32, u32)>::new(64).unwrap());
        let mut handles = Vec::new();
        for producer_id in 0..4 {
            let q = Arc::clone(&q);
            handles.push(thread::spawn(move || {
                for seq in 0..50 {
                    q.add((producer_id, seq)).unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let mut seen = [0u32; 4];
        for _ in 0..200 {
            let (producer, seq) = q.try_pop().unwrap();
            assert_eq!(seq, seen[producer as usize]);
            seen[producer as usize] += 1;
        }
        assert!(q.is_empty());
    }

    #[test]
    fn drain_with_cleanup_runs_once_per_item_and_not_on_empty() {
        let q: WorkQueue<u32> = WorkQueue::new(8).unwrap();
        let mut cleaned = Vec::new();
        q.drain_with_cleanup(|item| cleaned.push(item));
        assert!(cleaned.is_empty());

        for i in 0..5 {
            q.try_add(i).unwrap();
        }
        q.drain_with_cleanup(|item| cleaned.push(item));
        assert_eq!(cleaned, vec![0, 1, 2, 3, 4]);
        assert!(q.is_empty());
    }

    #[test]
    fn closed_queue_rejects_new_adds_but_still_yields_remaining_items() {
        let q: WorkQueue<u32> = WorkQueue::new(4).unwrap();
        q.try_add(1).unwrap();
        q.try_add(2).unwrap();
        q.close();

        assert!(q.is_closed());
        assert_eq!(q.try_add(3), Err(QueueError::Closed));
        assert_eq!(q.add_timeout(3, Duration::from_millis(50)), Err(QueueError::Closed));

        assert_eq!(q.try_pop().unwrap(), 1);
        assert_eq!(q.pop_timeout(Duration::from_millis(50)).unwrap(), 2);
        assert_eq!(q.pop_timeout(Duration::from_millis(50)), Err(QueueError::Closed));
    }

    #[test]
    fn closing_wakes_a_blocked_pop_promptly() {
        let q = Arc::new(WorkQueue::<u32>::new(4).unwrap());
        let q2 = Arc::clone(&q);

        let popper = thread::spawn(move || {
            let start = Instant::now();
            let result = q2.pop_timeout(Duration::from_secs(10));
            (result, start.elapsed())
        });

        thread::sleep(Duration::from_millis(50));
        q.close();

        let (result, elapsed) = popper.join().unwrap();
        assert_eq!(result, Err(QueueError::Closed));
        assert!(elapsed < Duration::from_secs(2));
    }

    #[test]
    fn last_error_is_independent_per_thread() {
        let q = Arc::new(WorkQueue::<u32>::new(1).unwrap());
        q.try_add(1).unwrap();

        let q2 = Arc::clone(&q);
        let t = thread::spawn(move || {
            let _ = q2.try_add(2);
            last_error()
        });
        let other_thread_error = t.join().unwrap();
        assert_eq!(other_thread_error, Some(QueueError::Full));

        // This thread never made a failing call on this queue.
        assert_eq!(last_error(), None);
    }
}
