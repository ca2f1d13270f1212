use std::collections::VecDeque;
use std::fmt;
use std::sync::{Condvar, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;
use thiserror::Error;

/// Default capacity of a [`BoundedBuffer`].
///
/// The buffer grows and shrinks dynamically below this bound; the bound is a
/// safeguard against runaway producers filling memory. Under normal operation
/// the buffer should never come close to it.
pub const DEFAULT_BUFFER_CAPACITY: usize = 20_000;

/// Returned by the timeout variant of [`BoundedBuffer::push_front_timeout`].
///
/// Carries the rejected item back to the caller so nothing is lost on a full
/// buffer. A timeout is a reported condition at this layer, not an error.
pub struct PushTimeout<T>(pub T);

impl<T> fmt::Debug for PushTimeout<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PushTimeout(..)")
    }
}

impl<T> fmt::Display for PushTimeout<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("push timed out: buffer stayed full for the whole deadline")
    }
}

impl<T> std::error::Error for PushTimeout<T> {}

/// Returned by [`BoundedBuffer::pop_back_timeout`] when no item arrived in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("pop timed out: buffer stayed empty for the whole deadline")]
pub struct PopTimeout;

/// A thread-safe, capacity-bounded FIFO.
///
/// Items are added at the front by any number of threads and retrieved from
/// the back, also by any number of threads. When the buffer is full, pushes
/// block until space becomes available; when it is empty, pops block until an
/// item arrives. Both sides have timeout variants that report the condition
/// instead of blocking forever, which matters wherever a counterpart might
/// permanently or temporarily go away (e.g. due to network failure).
///
/// One mutex protects the deque; two condition variables (`not_full`,
/// `not_empty`) signal the two sides. All waits run their predicate in a loop
/// to defeat spurious wake-ups.
pub struct BoundedBuffer<T> {
    /// The actual data store.
    container: Mutex<VecDeque<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    /// The maximum allowed size of the container.
    capacity: usize,
    /// Write-once identifier, set by whichever component owns the buffer.
    id: OnceLock<u64>,
}

impl<T> BoundedBuffer<T> {
    /// Creates a buffer with [`DEFAULT_BUFFER_CAPACITY`].
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_CAPACITY)
    }

    /// Creates a buffer with a custom capacity. A minimum capacity of 1 is
    /// enforced.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            container: Mutex::new(VecDeque::new()),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity: capacity.max(1),
            id: OnceLock::new(),
        }
    }

    // A panicking lock holder leaves the deque in a consistent state (every
    // mutation completes before the guard drops), so poisoning is ignored.
    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.container.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a single item to the front of the buffer, blocking while the
    /// buffer is full.
    pub fn push_front(&self, item: T) {
        let guard = self.lock();
        let mut guard = self
            .not_full
            .wait_while(guard, |c| c.len() >= self.capacity)
            .unwrap_or_else(PoisonError::into_inner);
        guard.push_front(item);
        drop(guard);
        self.not_empty.notify_one();
    }

    /// Adds a single item to the front of the buffer, giving up after
    /// `timeout`. On timeout the item is handed back inside the error.
    pub fn push_front_timeout(&self, item: T, timeout: Duration) -> Result<(), PushTimeout<T>> {
        let guard = self.lock();
        let (mut guard, wait) = self
            .not_full
            .wait_timeout_while(guard, timeout, |c| c.len() >= self.capacity)
            .unwrap_or_else(PoisonError::into_inner);
        if wait.timed_out() && guard.len() >= self.capacity {
            return Err(PushTimeout(item));
        }
        guard.push_front(item);
        drop(guard);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Retrieves a single item from the back of the buffer, blocking while
    /// the buffer is empty.
    pub fn pop_back(&self) -> T {
        let guard = self.lock();
        let mut guard = self
            .not_empty
            .wait_while(guard, |q| q.is_empty())
            .unwrap_or_else(PoisonError::into_inner);
        let item = guard
            .pop_back()
            .expect("not_empty signalled on an empty buffer");
        drop(guard);
        self.not_full.notify_one();
        item
    }

    /// Retrieves a single item from the back of the buffer, giving up after
    /// `timeout`.
    pub fn pop_back_timeout(&self, timeout: Duration) -> Result<T, PopTimeout> {
        let guard = self.lock();
        let (mut guard, _) = self
            .not_empty
            .wait_timeout_while(guard, timeout, |q| q.is_empty())
            .unwrap_or_else(PoisonError::into_inner);
        let Some(item) = guard.pop_back() else {
            return Err(PopTimeout);
        };
        drop(guard);
        self.not_full.notify_one();
        Ok(item)
    }

    /// The maximum allowed size of the buffer.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The current size of the buffer. The buffer may change immediately
    /// after this function returns; the value is an indication only.
    pub fn size(&self) -> usize {
        self.lock().len()
    }

    /// The currently remaining space. Like [`size`](Self::size), an
    /// indication only.
    pub fn remaining_space(&self) -> usize {
        self.capacity - self.lock().len()
    }

    /// Whether the buffer currently holds any items. An indication only.
    pub fn is_not_empty(&self) -> bool {
        !self.lock().is_empty()
    }

    /// Sets the buffer id. Only the first call has an effect.
    pub fn set_id(&self, id: u64) {
        let _ = self.id.set(id);
    }

    /// The buffer id, if one has been set.
    pub fn id(&self) -> Option<u64> {
        self.id.get().copied()
    }
}

impl<T> Default for BoundedBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}
