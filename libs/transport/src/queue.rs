//! Thread-Safe Queue
//!
//! The mailbox between the I/O thread and the application thread. Every
//! operation takes the same lock; pushes signal a condition variable so a
//! consumer parked in [`TsQueue::wait`] wakes up.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

/// Double-ended queue guarded by a single mutex
pub struct TsQueue<E> {
    items: Mutex<VecDeque<E>>,
    available: Condvar,
}

impl<E> TsQueue<E> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
        }
    }

    pub fn push_back(&self, item: E) {
        self.items.lock().push_back(item);
        self.available.notify_one();
    }

    pub fn push_front(&self, item: E) {
        self.items.lock().push_front(item);
        self.available.notify_one();
    }

    /// Remove the oldest item, `None` when empty
    pub fn pop_front(&self) -> Option<E> {
        self.items.lock().pop_front()
    }

    /// Remove the newest item, `None` when empty
    pub fn pop_back(&self) -> Option<E> {
        self.items.lock().pop_back()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub fn count(&self) -> usize {
        self.items.lock().len()
    }

    pub fn clear(&self) {
        self.items.lock().clear();
    }

    /// Block until at least one item is queued.
    ///
    /// Returns immediately if the queue is already non-empty.
    pub fn wait(&self) {
        let mut items = self.items.lock();
        while items.is_empty() {
            self.available.wait(&mut items);
        }
    }

    /// Like [`TsQueue::wait`] but gives up after `timeout`.
    ///
    /// Returns `true` if an item is available.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut items = self.items.lock();
        if items.is_empty() {
            self.available
                .wait_while_for(&mut items, |items| items.is_empty(), timeout);
        }
        !items.is_empty()
    }
}

impl<E: Clone> TsQueue<E> {
    /// Clone of the oldest item
    pub fn front(&self) -> Option<E> {
        self.items.lock().front().cloned()
    }

    /// Clone of the newest item
    pub fn back(&self) -> Option<E> {
        self.items.lock().back().cloned()
    }
}

impl<E> Default for TsQueue<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> fmt::Debug for TsQueue<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TsQueue")
            .field("count", &self.count())
            .finish()
    }
}
