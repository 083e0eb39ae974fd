//! Fixed-capacity FIFO ring buffer.

use std::collections::VecDeque;

/// Bounded FIFO container. Pushing beyond capacity evicts the oldest item.
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> RingBuffer<T> {
    /// Creates an empty buffer holding at most `capacity` items.
    ///
    /// A zero capacity is bumped to one so the newest item is always retained.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends an item, returning the evicted oldest item if the buffer was full.
    pub fn push(&mut self, item: T) -> Option<T> {
        let evicted = if self.items.len() >= self.capacity {
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(item);
        evicted
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.items.len() == self.capacity
    }

    /// Most recently pushed item.
    pub fn last(&self) -> Option<&T> {
        self.items.back()
    }

    /// Item pushed immediately before the most recent one.
    pub fn previous(&self) -> Option<&T> {
        self.items.len().checked_sub(2).and_then(|i| self.items.get(i))
    }

    /// Iterates oldest to newest.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> + ExactSizeIterator {
        self.items.iter()
    }

    /// Iterates over the newest `n` items, oldest first.
    pub fn last_n(&self, n: usize) -> impl DoubleEndedIterator<Item = &T> + ExactSizeIterator {
        let skip = self.items.len().saturating_sub(n);
        self.items.range(skip..)
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}
