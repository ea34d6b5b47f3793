//! Set of message bodies already processed, keyed by exact text.
//!
//! An unbounded cache grows for the life of the session. That is acceptable
//! for a session-scoped terminal but is a known limitation; use
//! [`DedupCache::bounded`] to evict the oldest bodies instead.

use std::collections::{HashSet, VecDeque};

#[derive(Debug, Default)]
pub struct DedupCache {
    bodies: HashSet<String>,
    /// Insertion order, only tracked when a capacity is set
    order: VecDeque<String>,
    capacity: Option<usize>,
}

impl DedupCache {
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// Keep at most `capacity` bodies, forgetting the oldest first.
    pub fn bounded(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity.max(1)),
            ..Self::default()
        }
    }

    pub fn seen(&self, body: &str) -> bool {
        self.bodies.contains(body)
    }

    pub fn remember(&mut self, body: &str) {
        self.check_and_remember(body);
    }

    /// Remember `body`, returning true if it was not already present.
    pub fn check_and_remember(&mut self, body: &str) -> bool {
        if self.bodies.contains(body) {
            return false;
        }
        self.bodies.insert(body.to_string());
        if let Some(capacity) = self.capacity {
            self.order.push_back(body.to_string());
            while self.order.len() > capacity {
                if let Some(oldest) = self.order.pop_front() {
                    self.bodies.remove(&oldest);
                }
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.bodies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bodies.is_empty()
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.bodies.clear();
        self.order.clear();
    }
}
