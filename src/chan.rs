//! Unbounded FIFO queue with explicit close.
//!
//! Consumers loop on `while let Some(v) = chan.get().await`; once the channel
//! is closed and its backlog drained, `get` returns `None` forever.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;

#[derive(Debug)]
struct Inner<T> {
    queue: VecDeque<T>,
    closed: bool,
}

/// Multi-producer, multi-consumer queue.
#[derive(Debug)]
pub struct Chan<T> {
    inner: Mutex<Inner<T>>,
    notify: Notify,
}

impl<T> Default for Chan<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Chan<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Enqueue `v`. Returns `false` (and drops `v`) if the channel is closed.
    pub fn put(&self, v: T) -> bool {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return false;
            }
            inner.queue.push_back(v);
        }
        self.notify.notify_one();
        true
    }

    /// Wait for the next item. `None` means closed and drained.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a put/close between the check and the
            // await is not missed.
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock();
                if let Some(v) = inner.queue.pop_front() {
                    return Some(v);
                }
                if inner.closed {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Idempotent. Wakes every blocked `get`; the backlog stays readable.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
