//! Cooperative cancellation shared by all pipeline stages.
//!
//! One [`CancelToken`] is cloned into every stage and wired into each blocking
//! primitive (stage queues, the render sink ring). `cancel()` flips the flag
//! and wakes every registered waiter, so a thread blocked in a queue push/pop
//! or a device-space wait observes the stop promptly instead of sleeping
//! through it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// Returned by a blocking operation that was interrupted by [`CancelToken::cancel`].
///
/// Cancellation is an orderly stop, not a failure; callers translate it into
/// their own shutdown path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

/// Implemented by blocking primitives so a cancel can nudge their waiters
/// into re-checking the flag.
///
/// Implementations must take the lock guarding their wait condition before
/// notifying; otherwise the flag store could slip between a waiter's check
/// and its wait and the wakeup would be lost.
pub trait Wake: Send + Sync {
    fn wake(&self);
}

/// Shared cancellation flag with a registry of waiters to wake.
///
/// Cheap to clone; all clones observe the same flag.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

struct TokenInner {
    cancelled: AtomicBool,
    waiters: Mutex<Vec<Weak<dyn Wake>>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TokenInner {
                cancelled: AtomicBool::new(false),
                waiters: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Whether the token has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Relaxed)
    }

    /// Flip the flag and wake every registered waiter.
    ///
    /// Idempotent; later calls just re-notify.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Relaxed);
        let mut waiters = self.inner.waiters.lock().unwrap();
        waiters.retain(|w| match w.upgrade() {
            Some(w) => {
                w.wake();
                true
            }
            None => false,
        });
    }

    /// Register a primitive to be woken by [`cancel`](Self::cancel).
    ///
    /// Only a weak handle is kept; dropped waiters are pruned on the next
    /// cancel.
    pub fn register<W: Wake + 'static>(&self, waiter: &Arc<W>) {
        let weak = Arc::downgrade(waiter) as Weak<dyn Wake>;
        self.inner.waiters.lock().unwrap().push(weak);
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
