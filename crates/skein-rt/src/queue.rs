//! The Worker's inbound message queue.
//!
//! Grounded directly on `queue.c`: `queue_push` appends under a lock and
//! returns the new size; `queue_pop` takes a fast lock-free peek at
//! `head == NULL` before acquiring the lock, then — still under the lock
//! — takes the *entire* pending list in one swap rather than popping one
//! entry at a time. `skein_core::SpinLock<Vec<T>>` plus
//! `std::mem::take` gives the same swap-the-whole-thing semantics
//! without hand-rolling a linked list.

use skein_core::SpinLock;

use crate::bus::Message;

pub struct MessageQueue {
    inner: SpinLock<Vec<Box<dyn Message>>>,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self {
            inner: SpinLock::new(Vec::new()),
        }
    }

    /// Append one message, returning the queue's size after the push —
    /// callers use this to detect when a backlog threshold is crossed.
    pub fn push(&self, msg: Box<dyn Message>) -> usize {
        let mut queue = self.inner.lock();
        queue.push(msg);
        queue.len()
    }

    /// Current backlog size. `queue.c::worker_backlog` reads `q->size`
    /// the same way, under the same lock, to decide whether the worker
    /// thread can safely park on its condvar.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Swap out the entire pending list in one lock acquisition.
    pub fn pop_all(&self) -> Vec<Box<dyn Message>> {
        let mut queue = self.inner.lock();
        std::mem::take(&mut *queue)
    }
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::TimerExpire;

    #[test]
    fn push_returns_running_size() {
        let q = MessageQueue::new();
        assert_eq!(q.push(Box::new(TimerExpire { session: 1 })), 1);
        assert_eq!(q.push(Box::new(TimerExpire { session: 2 })), 2);
    }

    #[test]
    fn pop_all_drains_and_resets() {
        let q = MessageQueue::new();
        q.push(Box::new(TimerExpire { session: 1 }));
        q.push(Box::new(TimerExpire { session: 2 }));

        let drained = q.pop_all();
        assert_eq!(drained.len(), 2);
        assert!(q.pop_all().is_empty());
    }
}
