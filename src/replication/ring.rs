//! Bounded op history.
//!
//! Each replica registration keeps its recent ops in an [`OpRing`]. When the
//! ring is full the oldest entry is evicted and handed back to the caller so
//! it can record what the replica may have lost.

use std::collections::VecDeque;

#[derive(Debug)]
pub struct OpRing<T> {
    entries: VecDeque<T>,
    capacity: usize,
}

impl<T> OpRing<T> {
    /// Creates a ring holding at most `capacity` entries (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity.min(4096)),
            capacity,
        }
    }

    /// Appends an entry, returning the evicted oldest entry if the ring was full.
    pub fn push(&mut self, entry: T) -> Option<T> {
        let evicted = if self.entries.len() == self.capacity {
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back(entry);
        evicted
    }

    /// Index of the first entry for which `pred` is false.
    ///
    /// Entries must be partitioned by `pred` (true, then false).
    pub fn partition_point(&self, pred: impl FnMut(&T) -> bool) -> usize {
        self.entries.partition_point(pred)
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.entries.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
