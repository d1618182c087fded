//! Bounded recently-seen set
//!
//! Remembers the most recent keys (transaction signatures, alert keys) so that
//! repeats can be dropped without growing without bound. When the set
//! overflows its capacity, the oldest half is evicted in one go.

use std::collections::{HashSet, VecDeque};

/// Default number of keys remembered
pub const DEFAULT_RECENT_CAPACITY: usize = 10_000;

#[derive(Debug)]
pub struct RecentSet {
    capacity: usize,
    order: VecDeque<String>,
    seen: HashSet<String>,
}

impl Default for RecentSet {
    fn default() -> Self {
        Self::new(DEFAULT_RECENT_CAPACITY)
    }
}

impl RecentSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            seen: HashSet::new(),
        }
    }

    /// Record `key`
    ///
    /// # Returns
    /// `true` if the key was not seen before, `false` for a repeat
    pub fn insert(&mut self, key: &str) -> bool {
        if self.seen.contains(key) {
            return false;
        }
        self.order.push_back(key.to_string());
        self.seen.insert(key.to_string());

        if self.order.len() > self.capacity {
            let evict = self.order.len() / 2;
            for old in self.order.drain(..evict) {
                self.seen.remove(&old);
            }
        }
        true
    }

    /// Forget `key`
    ///
    /// # Returns
    /// `true` if the key was present
    pub fn remove(&mut self, key: &str) -> bool {
        if !self.seen.remove(key) {
            return false;
        }
        self.order.retain(|k| k != key);
        true
    }

    pub fn contains(&self, key: &str) -> bool {
        self.seen.contains(key)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_reports_repeats() {
        let mut set = RecentSet::new(10);
        assert!(set.insert("a"));
        assert!(!set.insert("a"));
        assert!(set.insert("b"));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_overflow_evicts_oldest_half() {
        let mut set = RecentSet::new(4);
        for key in ["a", "b", "c", "d", "e"] {
            assert!(set.insert(key));
        }
        // 5 > 4: the two oldest are dropped
        assert_eq!(set.len(), 3);
        assert!(!set.contains("a"));
        assert!(!set.contains("b"));
        assert!(set.contains("c"));
        assert!(set.contains("e"));

        // An evicted key counts as new again
        assert!(set.insert("a"));
    }

    #[test]
    fn test_remove_forgets_key() {
        let mut set = RecentSet::new(4);
        set.insert("a");
        set.insert("b");
        assert!(set.remove("a"));
        assert!(!set.remove("a"));
        assert!(!set.contains("a"));
        assert_eq!(set.len(), 1);

        // A re-inserted key is evicted in its new position
        assert!(set.insert("a"));
        for key in ["c", "d", "e"] {
            set.insert(key);
        }
        assert!(!set.contains("b"));
        assert!(!set.contains("a"));
        assert!(set.contains("c"));
    }

    #[test]
    fn test_default_capacity() {
        let set = RecentSet::default();
        assert_eq!(set.capacity(), DEFAULT_RECENT_CAPACITY);
        assert!(set.is_empty());
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let mut set = RecentSet::new(0);
        assert!(set.insert("a"));
        assert!(set.insert("b"));
        assert!(set.len() <= 1);
    }

    #[test]
    fn test_stays_bounded_under_load() {
        let mut set = RecentSet::new(100);
        for i in 0..10_000 {
            set.insert(&format!("sig-{i}"));
        }
        assert!(set.len() <= 100);
        assert!(set.contains("sig-9999"));
    }
}
