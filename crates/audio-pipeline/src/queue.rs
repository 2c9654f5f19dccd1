//! Bounded blocking queues connecting pipeline stages.
//!
//! Each queue carries whole [`StreamUnit`]s between exactly one producer and
//! one consumer:
//! - reader → decoder: packets
//! - decoder → converter and converter → renderer: frames
//!
//! `push` blocks while the queue is full and `pop` blocks while it is empty,
//! which is all the flow control the upstream stages need. Both operations
//! observe the shared [`CancelToken`] so shutdown never leaves a stage parked
//! on a queue.
//!
//! [`StreamUnit`]: crate::unit::StreamUnit

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

use crate::cancel::{CancelToken, Cancelled, Wake};

/// Bounded FIFO queue for one producer and one consumer.
///
/// ## Design
/// - **Bounded** by a fixed unit capacity to cap memory and latency.
/// - Uses a single [`Condvar`] as a general "state changed" signal; with one
///   thread on each side there is no thundering herd to worry about.
/// - Construction registers the queue with the [`CancelToken`], so a later
///   `cancel()` wakes any blocked `push`/`pop` on this queue.
pub struct BoundedQueue<T> {
    inner: Mutex<VecDeque<T>>,
    cv: Condvar,
    capacity: usize,
    token: CancelToken,
}

impl<T: Send + 'static> BoundedQueue<T> {
    /// Create a queue wired to `token`.
    ///
    /// `capacity` is in units and must be at least 1.
    pub fn new(capacity: usize, token: &CancelToken) -> Arc<Self> {
        let queue = Arc::new(Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            cv: Condvar::new(),
            capacity: capacity.max(1),
            token: token.clone(),
        });
        token.register(&queue);
        queue
    }

    /// Unit capacity this queue was built with.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current number of buffered units (best-effort snapshot).
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }

    /// Append one unit, blocking while the queue is full.
    ///
    /// Returns [`Cancelled`] if the token fires before or during the wait;
    /// the unit is dropped in that case.
    pub fn push(&self, unit: T) -> Result<(), Cancelled> {
        let mut guard = self.inner.lock().unwrap();
        loop {
            if self.token.is_cancelled() {
                return Err(Cancelled);
            }
            if guard.len() < self.capacity {
                break;
            }
            guard = self.cv.wait(guard).unwrap();
        }
        guard.push_back(unit);
        drop(guard);
        self.cv.notify_all();
        Ok(())
    }

    /// Remove the oldest unit, blocking while the queue is empty.
    ///
    /// Returns [`Cancelled`] if the token fires before or during the wait;
    /// buffered units are abandoned on cancellation rather than drained.
    pub fn pop(&self) -> Result<T, Cancelled> {
        let mut guard = self.inner.lock().unwrap();
        loop {
            if self.token.is_cancelled() {
                return Err(Cancelled);
            }
            if let Some(unit) = guard.pop_front() {
                drop(guard);
                self.cv.notify_all();
                return Ok(unit);
            }
            guard = self.cv.wait(guard).unwrap();
        }
    }
}

impl<T: Send> Wake for BoundedQueue<T> {
    fn wake(&self) {
        // Hold the queue lock so the cancel flag cannot be missed by a
        // thread between its check and its wait.
        let _guard = self.inner.lock().unwrap();
        self.cv.notify_all();
    }
}
