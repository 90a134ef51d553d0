//! Thread-safe FIFO queue used for the scheduler's incoming, retry and
//! response queues.
//!
//! Producers push from any task; the consumer either polls with
//! [`try_pop`](TsQueue::try_pop) or parks on [`notified`](TsQueue::notified)
//! between polls. The lock is never held across an await point.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;

/// A lock-protected FIFO with wakeup notification.
#[derive(Debug)]
pub struct TsQueue<T> {
    inner: Mutex<VecDeque<T>>,
    notify: Notify,
}

impl<T> Default for TsQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TsQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    /// Appends an element and wakes one waiting consumer.
    pub fn push(&self, item: T) {
        self.inner.lock().unwrap().push_back(item);
        self.notify.notify_one();
    }

    /// Puts an element back at the front, preserving its queue position.
    pub fn push_front(&self, item: T) {
        self.inner.lock().unwrap().push_front(item);
        self.notify.notify_one();
    }

    /// Removes and returns the oldest element, if any.
    pub fn try_pop(&self) -> Option<T> {
        self.inner.lock().unwrap().pop_front()
    }

    /// Removes every element, oldest first.
    pub fn drain(&self) -> Vec<T> {
        self.inner.lock().unwrap().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }

    /// Waits until a producer pushes.
    ///
    /// A permit stored by a push that raced ahead of this call is consumed
    /// immediately, so pushes are never lost.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }

    /// Retains only the elements for which `keep` returns true.
    pub fn retain<F: FnMut(&T) -> bool>(&self, keep: F) {
        self.inner.lock().unwrap().retain(keep);
    }
}
