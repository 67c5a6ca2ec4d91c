//! Repository with simulated latency and transient faults
//!
//! Every commit sleeps for a random latency, then either fails (random or
//! injected) or adds its amount in one step. The failure decision is made
//! before the total is touched, so a failed commit leaves no trace.

use super::EventRepository;
use crate::error::CommitError;
use crate::models::EventName;
use crate::stats::EventStatistics;
use async_trait::async_trait;
use dashmap::DashMap;
use rand::Rng;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tracing::debug;

/// Latency and fault profile for the delayed repository
#[derive(Debug, Clone)]
pub struct RepositoryConfig {
    /// Lower bound of commit latency
    pub min_latency: Duration,
    /// Upper bound of commit latency
    pub max_latency: Duration,
    /// Probability in `[0, 1]` that a commit fails transiently
    pub failure_rate: f64,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            min_latency: Duration::from_millis(10),
            max_latency: Duration::from_millis(100),
            failure_rate: 0.1,
        }
    }
}

impl RepositoryConfig {
    /// Fixed latency, never fails on its own
    pub fn reliable(latency: Duration) -> Self {
        Self {
            min_latency: latency,
            max_latency: latency,
            failure_rate: 0.0,
        }
    }
}

/// Commit counters for the delayed repository
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepositoryStats {
    pub attempts: u64,
    pub failures: u64,
    pub max_in_flight: usize,
}

/// Counter store whose updates are asynchronous and may fail
pub struct DelayedRepository {
    stats: EventStatistics,
    config: RepositoryConfig,
    /// Forced failures still to hand out, per name
    injected_faults: DashMap<EventName, u32>,
    attempts: AtomicU64,
    failures: AtomicU64,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl DelayedRepository {
    pub fn new(config: RepositoryConfig) -> Self {
        Self {
            stats: EventStatistics::new(),
            config,
            injected_faults: DashMap::new(),
            attempts: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Make the next `times` commits for `name` fail
    pub fn fail_next(&self, name: EventName, times: u32) {
        *self.injected_faults.entry(name).or_insert(0) += times;
    }

    pub fn config(&self) -> &RepositoryConfig {
        &self.config
    }

    pub fn stats(&self) -> RepositoryStats {
        RepositoryStats {
            attempts: self.attempts.load(Ordering::SeqCst),
            failures: self.failures.load(Ordering::SeqCst),
            max_in_flight: self.max_in_flight.load(Ordering::SeqCst),
        }
    }

    fn sample_latency(&self) -> Duration {
        let min = self.config.min_latency.as_millis() as u64;
        let max = self.config.max_latency.as_millis() as u64;
        if max <= min {
            return self.config.min_latency;
        }
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }

    fn take_injected_fault(&self, name: EventName) -> bool {
        match self.injected_faults.get_mut(&name) {
            Some(mut remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }

    fn random_fault(&self) -> bool {
        self.config.failure_rate > 0.0
            && rand::thread_rng().gen_bool(self.config.failure_rate.min(1.0))
    }

    async fn commit_inner(&self, name: EventName, count: u64) -> Result<(), CommitError> {
        tokio::time::sleep(self.sample_latency()).await;

        if self.take_injected_fault(name) {
            return Err(CommitError::Injected { name, count });
        }
        if self.random_fault() {
            return Err(CommitError::Unavailable { name, count });
        }

        let total = self.stats.add(name, count);
        debug!(event = %name, count = count, total = total, "Repository commit applied");
        Ok(())
    }
}

/// Counts a commit as in flight until dropped, including on cancellation
struct InFlightSlot<'a> {
    in_flight: &'a AtomicUsize,
}

impl<'a> InFlightSlot<'a> {
    fn enter(in_flight: &'a AtomicUsize, max_in_flight: &AtomicUsize) -> Self {
        let current = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        max_in_flight.fetch_max(current, Ordering::SeqCst);
        Self { in_flight }
    }
}

impl Drop for InFlightSlot<'_> {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl EventRepository for DelayedRepository {
    async fn commit(&self, name: EventName, count: u64) -> Result<(), CommitError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let _slot = InFlightSlot::enter(&self.in_flight, &self.max_in_flight);

        let result = self.commit_inner(name, count).await;
        if result.is_err() {
            self.failures.fetch_add(1, Ordering::SeqCst);
        }
        result
    }

    fn read_stats(&self, name: EventName) -> u64 {
        self.stats.get(name)
    }
}
