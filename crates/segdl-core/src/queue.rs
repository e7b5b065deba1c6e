//! Overflow queue for downloads deferred past the concurrency limit

use parking_lot::Mutex;
use std::collections::VecDeque;
use uuid::Uuid;

/// FIFO of download ids waiting for a free slot
#[derive(Debug, Default)]
pub struct OverflowQueue {
    ids: Mutex<VecDeque<Uuid>>,
}

impl OverflowQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `id` unless it is already queued. Returns whether it was added.
    pub fn push(&self, id: Uuid) -> bool {
        let mut ids = self.ids.lock();
        if ids.contains(&id) {
            return false;
        }
        ids.push_back(id);
        true
    }

    /// Remove and return the oldest id, or `None` when empty
    pub fn pop(&self) -> Option<Uuid> {
        self.ids.lock().pop_front()
    }

    /// Drop `id` from the queue (e.g. when the download is deleted)
    pub fn remove(&self, id: Uuid) -> bool {
        let mut ids = self.ids.lock();
        let before = ids.len();
        ids.retain(|queued| *queued != id);
        ids.len() != before
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.ids.lock().contains(&id)
    }

    pub fn len(&self) -> usize {
        self.ids.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let queue = OverflowQueue::new();
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        queue.push(a);
        queue.push(b);
        queue.push(c);

        assert_eq!(queue.pop(), Some(a));
        assert_eq!(queue.pop(), Some(b));
        assert_eq!(queue.pop(), Some(c));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_push_is_idempotent() {
        let queue = OverflowQueue::new();
        let id = Uuid::new_v4();
        assert!(queue.push(id));
        assert!(!queue.push(id));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_remove() {
        let queue = OverflowQueue::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        queue.push(a);
        queue.push(b);

        assert!(queue.remove(a));
        assert!(!queue.remove(a));
        assert!(!queue.contains(a));
        assert_eq!(queue.pop(), Some(b));
        assert!(queue.is_empty());
    }
}
