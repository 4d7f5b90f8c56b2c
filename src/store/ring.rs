use std::collections::VecDeque;

/// Fixed-capacity history, newest first. Pushing onto a full ring evicts the
/// oldest entry.
#[derive(Debug, Clone)]
pub struct EventRing<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> EventRing<T> {
    /// Capacity is clamped to at least 1.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Push a new entry, returning the evicted oldest entry if the ring was full.
    pub fn push(&mut self, item: T) -> Option<T> {
        let evicted = if self.items.len() >= self.capacity {
            self.items.pop_back()
        } else {
            None
        };
        self.items.push_front(item);
        evicted
    }

    /// Change capacity, dropping the oldest entries that no longer fit.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        self.items.truncate(self.capacity);
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Iterate newest to oldest.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_newest_first() {
        let mut ring = EventRing::with_capacity(3);
        ring.push(1);
        ring.push(2);
        ring.push(3);
        assert_eq!(ring.iter().copied().collect::<Vec<_>>(), vec![3, 2, 1]);
    }

    #[test]
    fn test_push_evicts_oldest_when_full() {
        let mut ring = EventRing::with_capacity(2);
        assert_eq!(ring.push("a"), None);
        assert_eq!(ring.push("b"), None);
        assert_eq!(ring.push("c"), Some("a"));
        assert_eq!(ring.len(), 2);
        assert_eq!(ring.iter().copied().collect::<Vec<_>>(), vec!["c", "b"]);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let mut ring = EventRing::with_capacity(0);
        assert_eq!(ring.capacity(), 1);
        ring.push(1);
        ring.push(2);
        assert_eq!(ring.iter().copied().collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn test_shrinking_keeps_newest() {
        let mut ring = EventRing::with_capacity(5);
        for i in 0..5 {
            ring.push(i);
        }
        ring.set_capacity(2);
        assert_eq!(ring.iter().copied().collect::<Vec<_>>(), vec![4, 3]);
    }
}
