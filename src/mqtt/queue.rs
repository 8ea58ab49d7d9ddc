//! Bounded per-topic envelope queue with drop-oldest backpressure.
//!
//! The pool's event task is the producer; exactly one device worker consumes.
//! When the queue is full the oldest envelope is shed and returned to the
//! producer so it can be dead-lettered as `backpressure`.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;

use crate::model::Envelope;

/// Default bound for per-topic queues; meters publish at most every few
/// seconds, so this absorbs minutes of worker stall before shedding.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug)]
pub struct TopicQueue {
    inner: Mutex<VecDeque<Envelope>>,
    notify: Notify,
    capacity: usize,
}

impl TopicQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    /// Enqueues an envelope, returning the shed oldest entry when full.
    pub fn push(&self, envelope: Envelope) -> Option<Envelope> {
        let shed = {
            let mut inner = self.inner.lock().expect("queue lock poisoned");
            let shed = if inner.len() >= self.capacity {
                inner.pop_front()
            } else {
                None
            };
            inner.push_back(envelope);
            shed
        };
        self.notify.notify_one();
        shed
    }

    /// Waits for and removes the oldest envelope.
    pub async fn pop(&self) -> Envelope {
        loop {
            // Arm the notification before checking so a push between the
            // check and the await cannot be lost.
            let notified = self.notify.notified();
            if let Some(envelope) = self.inner.lock().expect("queue lock poisoned").pop_front() {
                return envelope;
            }
            notified.await;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("queue lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
