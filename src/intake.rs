use crate::error::SeglogError;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::Notify;

/// An item the queue refused, handed back so the caller can fail its
/// completion slot.
#[derive(Debug)]
pub struct IntakeRejected<T> {
    pub item: T,
    pub error: SeglogError,
}

#[derive(Debug)]
struct Inner<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Bounded, closable FIFO between producers and the single processor loop.
/// Items are handed to the consumer in the order `add` returned success.
#[derive(Debug)]
pub struct IntakeQueue<T> {
    inner: Mutex<Inner<T>>,
    capacity: usize,
    available: Notify,
}

impl<T> IntakeQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                closed: false,
            }),
            capacity,
            available: Notify::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enqueues an item, failing fast with `Closed` or `QueueFull`.
    pub fn add(&self, item: T) -> Result<(), IntakeRejected<T>> {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(IntakeRejected {
                    item,
                    error: SeglogError::Closed("intake queue is closed".into()),
                });
            }
            if inner.items.len() >= self.capacity {
                return Err(IntakeRejected {
                    item,
                    error: SeglogError::QueueFull,
                });
            }
            inner.items.push_back(item);
        }
        self.available.notify_one();
        Ok(())
    }

    /// Waits until at least one item is available, then returns up to `max`
    /// in FIFO order. Intended for exactly one consumer at a time; fails
    /// with `Closed` once the queue is closed and drained.
    pub async fn take(&self, max: usize) -> Result<Vec<T>, SeglogError> {
        loop {
            let notified = self.available.notified();
            {
                let mut inner = self.inner.lock();
                if !inner.items.is_empty() {
                    return Ok(drain(&mut inner.items, max));
                }
                if inner.closed {
                    return Err(SeglogError::Closed("intake queue is closed".into()));
                }
            }
            notified.await;
        }
    }

    /// Non-blocking variant of `take`; returns whatever is immediately
    /// available, possibly nothing.
    pub fn poll(&self, max: usize) -> Vec<T> {
        let mut inner = self.inner.lock();
        drain(&mut inner.items, max)
    }

    /// Closes the queue and returns everything still in it so the caller
    /// can fail those items. Idempotent; later calls return nothing.
    pub fn close(&self) -> Vec<T> {
        let remainder = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            inner.items.drain(..).collect()
        };
        self.available.notify_waiters();
        remainder
    }
}

fn drain<T>(items: &mut VecDeque<T>, max: usize) -> Vec<T> {
    let count = items.len().min(max);
    items.drain(..count).collect()
}
