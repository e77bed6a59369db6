use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};

/// What happens to queued items when the queue is closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownPolicy {
    /// Keep every queued item; the consumer processes them before exiting.
    #[default]
    Drain,
    /// Drop queued items on close.
    Discard,
}

struct QueueState<T> {
    items: VecDeque<T>,
    /// Queued items accepted by the queue's `counts` predicate.
    pending: usize,
    closed: bool,
}

/// Single-consumer FIFO shared between producer threads and one consumer.
///
/// Ordering across producers is insertion order under the queue lock.
pub struct EventQueue<T> {
    state: Mutex<QueueState<T>>,
    ready: Condvar,
    counts: fn(&T) -> bool,
}

impl<T> EventQueue<T> {
    pub fn new() -> Self {
        Self::counting(|_| true)
    }

    /// Queue whose pending count only includes items accepted by `counts`
    pub fn counting(counts: fn(&T) -> bool) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                pending: 0,
                closed: false,
            }),
            ready: Condvar::new(),
            counts,
        }
    }

    fn take_front(&self, state: &mut QueueState<T>) -> Option<(T, usize)> {
        let item = state.items.pop_front()?;
        if (self.counts)(&item) {
            state.pending -= 1;
        }
        Some((item, state.pending))
    }

    /// Append an item, `false` once the queue is closed
    pub fn post(&self, item: T) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        if (self.counts)(&item) {
            state.pending += 1;
        }
        state.items.push_back(item);
        drop(state);
        self.ready.notify_one();
        true
    }

    /// Block until an item is available and pop it together with the number
    /// of counted items still queued.
    ///
    /// After close, queued items keep being returned until the queue is
    /// empty, then `None`.
    pub fn wait_pop(&self) -> Option<(T, usize)> {
        let mut state = self.state.lock();
        loop {
            if let Some(popped) = self.take_front(&mut state) {
                return Some(popped);
            }
            if state.closed {
                return None;
            }
            self.ready.wait(&mut state);
        }
    }

    /// Non-blocking pop
    pub fn try_pop(&self) -> Option<(T, usize)> {
        let mut state = self.state.lock();
        self.take_front(&mut state)
    }

    /// Close the queue, optionally appending a final item.
    ///
    /// Returns the number of discarded items, or `None` if the queue was
    /// already closed.
    pub fn close(&self, policy: ShutdownPolicy, tail: Option<T>) -> Option<usize> {
        let mut state = self.state.lock();
        if state.closed {
            return None;
        }

        let discarded = match policy {
            ShutdownPolicy::Drain => 0,
            ShutdownPolicy::Discard => {
                let count = state.items.len();
                state.items.clear();
                state.pending = 0;
                count
            }
        };
        if let Some(item) = tail {
            if (self.counts)(&item) {
                state.pending += 1;
            }
            state.items.push_back(item);
        }
        state.closed = true;
        drop(state);

        self.ready.notify_all();
        Some(discarded)
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// Queued items accepted by the `counts` predicate
    pub fn pending(&self) -> usize {
        self.state.lock().pending
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for EventQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn pops_in_post_order_with_remaining_count() {
        let queue = EventQueue::new();
        for i in 0..3 {
            assert!(queue.post(i));
        }

        assert_eq!(queue.wait_pop(), Some((0, 2)));
        assert_eq!(queue.wait_pop(), Some((1, 1)));
        assert_eq!(queue.wait_pop(), Some((2, 0)));
        assert_eq!(queue.try_pop(), None);
    }

    #[test]
    fn post_after_close_is_refused() {
        let queue = EventQueue::new();
        assert_eq!(queue.close(ShutdownPolicy::Drain, None), Some(0));
        assert!(!queue.post(1));
        assert_eq!(queue.close(ShutdownPolicy::Drain, None), None);
        assert_eq!(queue.wait_pop(), None);
    }

    #[test]
    fn drain_keeps_items_and_appends_tail() {
        let queue = EventQueue::new();
        queue.post(1);
        queue.post(2);
        queue.close(ShutdownPolicy::Drain, Some(99));

        assert_eq!(queue.wait_pop(), Some((1, 2)));
        assert_eq!(queue.wait_pop(), Some((2, 1)));
        assert_eq!(queue.wait_pop(), Some((99, 0)));
        assert_eq!(queue.wait_pop(), None);
    }

    #[test]
    fn discard_drops_pending_items() {
        let queue = EventQueue::new();
        queue.post(1);
        queue.post(2);
        assert_eq!(queue.close(ShutdownPolicy::Discard, Some(99)), Some(2));

        assert_eq!(queue.wait_pop(), Some((99, 0)));
        assert_eq!(queue.wait_pop(), None);
    }

    #[test]
    fn blocked_consumer_wakes_on_post() {
        let queue = Arc::new(EventQueue::new());
        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || queue.wait_pop())
        };

        thread::sleep(Duration::from_millis(20));
        queue.post("late");
        assert_eq!(consumer.join().unwrap(), Some(("late", 0)));
    }

    #[test]
    fn blocked_consumer_wakes_on_close() {
        let queue: Arc<EventQueue<u8>> = Arc::new(EventQueue::new());
        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || queue.wait_pop())
        };

        thread::sleep(Duration::from_millis(20));
        queue.close(ShutdownPolicy::Drain, None);
        assert_eq!(consumer.join().unwrap(), None);
    }
}
