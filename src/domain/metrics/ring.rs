use std::collections::VecDeque;

use chrono::{DateTime, Utc};

use super::model::Timestamped;

/// Fixed-capacity FIFO, the oldest entry is evicted once full.
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    entries: VecDeque<T>,
    capacity: usize,
}

impl<T> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity.min(10_000)),
            capacity,
        }
    }

    pub fn push(&mut self, entry: T) {
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter()
    }
}

impl<T: Timestamped + Clone> RingBuffer<T> {
    /// Entries at or after `since`, oldest first.
    pub fn since(&self, since: DateTime<Utc>) -> Vec<T> {
        self.iter()
            .filter(|entry| entry.timestamp() >= since)
            .cloned()
            .collect()
    }
}
