//! Per-event counter store
//!
//! Both the sync engine and the repository own one of these. Values only
//! grow; a write that would lower a counter is rejected.

use crate::error::StatsError;
use crate::models::EventName;
use dashmap::DashMap;
use std::collections::BTreeMap;

/// Monotonic event-name -> count mapping, zero for unseen names
#[derive(Debug, Default)]
pub struct EventStatistics {
    counts: DashMap<EventName, u64>,
}

impl EventStatistics {
    pub fn new() -> Self {
        Self {
            counts: DashMap::new(),
        }
    }

    /// Current count for `name`
    pub fn get(&self, name: EventName) -> u64 {
        self.counts.get(&name).map(|c| *c).unwrap_or(0)
    }

    /// Overwrite the count for `name`, refusing to go backwards
    pub fn set(&self, name: EventName, value: u64) -> Result<(), StatsError> {
        let mut entry = self.counts.entry(name).or_insert(0);
        if value < *entry {
            return Err(StatsError::WouldDecrease {
                name,
                current: *entry,
                requested: value,
            });
        }
        *entry = value;
        Ok(())
    }

    /// Add one and return the new count
    pub fn increment(&self, name: EventName) -> u64 {
        self.add(name, 1)
    }

    /// Add `by` and return the new count
    pub fn add(&self, name: EventName, by: u64) -> u64 {
        let mut entry = self.counts.entry(name).or_insert(0);
        *entry = entry.saturating_add(by);
        *entry
    }

    /// Counts for every name, including zeros
    pub fn snapshot(&self) -> BTreeMap<EventName, u64> {
        EventName::ALL
            .iter()
            .map(|name| (*name, self.get(*name)))
            .collect()
    }

    /// Sum over all names
    pub fn total(&self) -> u64 {
        EventName::ALL.iter().map(|name| self.get(*name)).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unseen_names_read_zero() {
        let stats = EventStatistics::new();
        assert_eq!(stats.get(EventName::A), 0);
        assert_eq!(stats.total(), 0);
    }

    #[test]
    fn test_increment_and_add() {
        let stats = EventStatistics::new();
        assert_eq!(stats.increment(EventName::A), 1);
        assert_eq!(stats.increment(EventName::A), 2);
        assert_eq!(stats.add(EventName::B, 10), 10);

        assert_eq!(stats.get(EventName::A), 2);
        assert_eq!(stats.get(EventName::B), 10);
        assert_eq!(stats.total(), 12);
    }

    #[test]
    fn test_set_rejects_decrease() {
        let stats = EventStatistics::new();
        stats.set(EventName::A, 5).unwrap();

        let err = stats.set(EventName::A, 3).unwrap_err();
        assert_eq!(
            err,
            StatsError::WouldDecrease {
                name: EventName::A,
                current: 5,
                requested: 3,
            }
        );
        assert_eq!(stats.get(EventName::A), 5);

        // Same value is allowed
        assert!(stats.set(EventName::A, 5).is_ok());
    }

    #[test]
    fn test_snapshot_includes_every_name() {
        let stats = EventStatistics::new();
        stats.increment(EventName::B);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.len(), EventName::ALL.len());
        assert_eq!(snapshot[&EventName::A], 0);
        assert_eq!(snapshot[&EventName::B], 1);
    }
}
