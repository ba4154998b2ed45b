//! Named ordered queues.
//!
//! Items are kept sorted by an integer key (priority, wake time); items with equal keys
//! keep their insertion order. Tail insertion gives plain FIFO behaviour.

use std::collections::VecDeque;

#[derive(Debug, Clone)]
struct Entry<T> {
    key: i64,
    item: T,
}

/// An ordered queue of items compared by identity
#[derive(Debug, Clone)]
pub struct OrderedQueue<T> {
    name: &'static str,
    entries: VecDeque<Entry<T>>,
}

impl<T: PartialEq + Clone> OrderedQueue<T> {
    /// Create an empty queue
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: VecDeque::new(),
        }
    }

    /// Name given at creation
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Insert after every item whose key is lower or equal
    pub fn insert(&mut self, key: i64, item: T) {
        let at = self.entries.partition_point(|entry| entry.key <= key);
        self.entries.insert(at, Entry { key, item });
    }

    /// Insert at the end, keyed after the current tail
    pub fn push_back(&mut self, item: T) {
        let key = self.entries.back().map_or(0, |entry| entry.key);
        self.entries.push_back(Entry { key, item });
    }

    /// Remove and return the head
    pub fn pop_front(&mut self) -> Option<T> {
        self.entries.pop_front().map(|entry| entry.item)
    }

    /// Remove `item`, returning its key
    pub fn remove(&mut self, item: &T) -> Option<i64> {
        let at = self.entries.iter().position(|entry| entry.item == *item)?;
        self.entries.remove(at).map(|entry| entry.key)
    }

    /// Remove the first item matching `predicate`
    pub fn remove_first<F: Fn(&T) -> bool>(&mut self, predicate: F) -> Option<T> {
        let at = self.entries.iter().position(|entry| predicate(&entry.item))?;
        self.entries.remove(at).map(|entry| entry.item)
    }

    /// Head of the queue with its key
    pub fn peek(&self) -> Option<(i64, &T)> {
        self.entries.front().map(|entry| (entry.key, &entry.item))
    }

    /// The `index`-th item, `None` past the end
    pub fn walk(&self, index: usize) -> Option<&T> {
        self.entries.get(index).map(|entry| &entry.item)
    }

    /// Whether `item` is queued
    pub fn contains(&self, item: &T) -> bool {
        self.entries.iter().any(|entry| entry.item == *item)
    }

    /// Key `item` was queued with
    pub fn key_of(&self, item: &T) -> Option<i64> {
        self.entries
            .iter()
            .find(|entry| entry.item == *item)
            .map(|entry| entry.key)
    }

    /// Number of queued items
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Items from head to tail
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter().map(|entry| &entry.item)
    }

    /// Copy of the items, head first
    pub fn to_vec(&self) -> Vec<T> {
        self.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// test that equal keys keep insertion order
    #[test]
    fn test_insert_is_stable() {
        let mut queue = OrderedQueue::new("ready");
        queue.insert(20, 'a');
        queue.insert(10, 'b');
        queue.insert(20, 'c');
        queue.insert(10, 'd');
        queue.insert(30, 'e');
        assert_eq!(queue.to_vec(), vec!['b', 'd', 'a', 'c', 'e']);
        assert_eq!(queue.peek(), Some((10, &'b')));
    }

    /// test removal by identity and by predicate
    #[test]
    fn test_remove() {
        let mut queue = OrderedQueue::new("disk");
        for pid in 1..=4 {
            queue.push_back(pid);
        }
        assert_eq!(queue.remove(&3), Some(0));
        assert_eq!(queue.remove(&3), None);
        assert_eq!(queue.remove_first(|pid| pid % 2 == 0), Some(2));
        assert_eq!(queue.to_vec(), vec![1, 4]);
        assert_eq!(queue.pop_front(), Some(1));
        assert!(queue.contains(&4));
        assert!(!queue.contains(&1));
    }

    /// test indexed walk past the end
    #[test]
    fn test_walk() {
        let mut queue = OrderedQueue::new("timer");
        queue.insert(5, 7u32);
        queue.insert(3, 9u32);
        assert_eq!(queue.walk(0), Some(&9));
        assert_eq!(queue.walk(1), Some(&7));
        assert_eq!(queue.walk(2), None);
        assert_eq!(queue.key_of(&7), Some(5));
        assert_eq!(queue.name(), "timer");
    }
}
