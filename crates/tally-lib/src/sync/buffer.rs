//! Pending increment buffer
//!
//! Holds increments that were observed but not yet committed to the
//! repository. Taking a name's count removes it in one step, so increments
//! that race with a drain land in the fresh entry instead of being lost.

use crate::models::EventName;
use dashmap::DashMap;

/// Per-name pending increments awaiting a drain
#[derive(Debug, Default)]
pub struct PendingBuffer {
    counts: DashMap<EventName, u64>,
}

impl PendingBuffer {
    pub fn new() -> Self {
        Self {
            counts: DashMap::new(),
        }
    }

    /// Add `by` to the pending count and return the new value
    pub fn add(&self, name: EventName, by: u64) -> u64 {
        let mut entry = self.counts.entry(name).or_insert(0);
        *entry += by;
        *entry
    }

    /// Put back an amount whose commit failed
    pub fn requeue(&self, name: EventName, count: u64) -> u64 {
        self.add(name, count)
    }

    /// Remove and return the pending count for `name`
    pub fn take(&self, name: EventName) -> u64 {
        self.counts.remove(&name).map(|(_, count)| count).unwrap_or(0)
    }

    /// Snapshot-and-clear every non-zero entry
    pub fn take_all(&self) -> Vec<(EventName, u64)> {
        EventName::ALL
            .iter()
            .filter_map(|name| {
                let count = self.take(*name);
                (count > 0).then_some((*name, count))
            })
            .collect()
    }

    pub fn get(&self, name: EventName) -> u64 {
        self.counts.get(&name).map(|c| *c).unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        EventName::ALL.iter().map(|name| self.get(*name)).sum()
    }

    /// Largest pending count across names
    pub fn max_pending(&self) -> u64 {
        EventName::ALL
            .iter()
            .map(|name| self.get(*name))
            .max()
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_returns_running_count() {
        let buffer = PendingBuffer::new();
        assert_eq!(buffer.add(EventName::A, 1), 1);
        assert_eq!(buffer.add(EventName::A, 1), 2);
        assert_eq!(buffer.add(EventName::B, 5), 5);
        assert_eq!(buffer.total(), 7);
        assert_eq!(buffer.max_pending(), 5);
    }

    #[test]
    fn test_take_all_clears_buffer() {
        let buffer = PendingBuffer::new();
        buffer.add(EventName::A, 3);
        buffer.add(EventName::B, 4);

        let snapshot = buffer.take_all();
        assert_eq!(snapshot, vec![(EventName::A, 3), (EventName::B, 4)]);
        assert!(buffer.is_empty());
        assert!(buffer.take_all().is_empty());
    }

    #[test]
    fn test_take_all_skips_empty_names() {
        let buffer = PendingBuffer::new();
        buffer.add(EventName::B, 2);

        assert_eq!(buffer.take_all(), vec![(EventName::B, 2)]);
    }

    #[test]
    fn test_increments_after_take_start_fresh() {
        let buffer = PendingBuffer::new();
        buffer.add(EventName::A, 10);
        assert_eq!(buffer.take(EventName::A), 10);

        buffer.add(EventName::A, 1);
        assert_eq!(buffer.get(EventName::A), 1);
    }

    #[test]
    fn test_requeue_merges_with_new_increments() {
        let buffer = PendingBuffer::new();
        buffer.add(EventName::B, 10);
        let snapshot = buffer.take_all();

        // New events arrive while the commit is in flight
        buffer.add(EventName::B, 2);

        let (name, count) = snapshot[0];
        assert_eq!(buffer.requeue(name, count), 12);
    }
}
