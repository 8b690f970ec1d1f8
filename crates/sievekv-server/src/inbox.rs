//! Bounded inbox between the listener and the executor.
//!
//! Uses `crossbeam-queue::ArrayQueue` for a lock-free, bounded queue. When
//! the inbox is full, `try_push` hands the event back: the listener drops the
//! datagram (UDP promises nothing anyway) and the protocol's timers recover.

use crossbeam_queue::ArrayQueue;

/// Result of attempting to push to a full inbox.
#[derive(Debug)]
pub enum PushResult<T> {
    /// Event was enqueued.
    Ok,
    /// Inbox is full. Returns the event for the caller to drop or retry.
    Backpressure(T),
}

/// A bounded, lock-free event inbox.
#[derive(Debug)]
pub struct Inbox<T> {
    inner: ArrayQueue<T>,
}

impl<T> Inbox<T> {
    /// Creates an inbox with the given capacity.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "inbox capacity must be positive");
        Self {
            inner: ArrayQueue::new(capacity),
        }
    }

    /// Attempts to enqueue an event.
    pub fn try_push(&self, event: T) -> PushResult<T> {
        match self.inner.push(event) {
            Ok(()) => PushResult::Ok,
            Err(event) => PushResult::Backpressure(event),
        }
    }

    /// Pops up to `max` events into a `Vec`, oldest first.
    pub fn pop_batch(&self, max: usize) -> Vec<T> {
        let mut batch = Vec::with_capacity(max.min(self.inner.len()));
        for _ in 0..max {
            match self.inner.pop() {
                Some(event) => batch.push(event),
                None => break,
            }
        }
        batch
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pop_in_order() {
        let inbox = Inbox::new(4);
        for i in 0..3 {
            assert!(matches!(inbox.try_push(i), PushResult::Ok));
        }
        assert_eq!(inbox.pop_batch(10), vec![0, 1, 2]);
        assert!(inbox.is_empty());
    }

    #[test]
    fn full_inbox_returns_the_event() {
        let inbox = Inbox::new(2);
        let _ = inbox.try_push(1);
        let _ = inbox.try_push(2);
        match inbox.try_push(3) {
            PushResult::Backpressure(event) => assert_eq!(event, 3),
            PushResult::Ok => panic!("expected backpressure"),
        }
        assert_eq!(inbox.len(), 2);
    }

    #[test]
    fn pop_batch_respects_max() {
        let inbox = Inbox::new(8);
        for i in 0..6 {
            let _ = inbox.try_push(i);
        }
        assert_eq!(inbox.pop_batch(4), vec![0, 1, 2, 3]);
        assert_eq!(inbox.pop_batch(4), vec![4, 5]);
    }

    #[test]
    #[should_panic(expected = "inbox capacity must be positive")]
    fn zero_capacity_panics() {
        let _inbox: Inbox<i32> = Inbox::new(0);
    }
}
