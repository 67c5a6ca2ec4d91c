//! Buffered sync engine
//!
//! Counts every event synchronously in its own [`EventStatistics`] and in a
//! [`PendingBuffer`], then drains the buffer into an [`EventRepository`] on a
//! timer or when one name's backlog reaches the threshold.
//!
//! At any instant, per name:
//! `counter == committed + pending + in_flight`.
//!
//! A single `flushing` flag keeps drains mutually exclusive. A trigger that
//! arrives while a drain runs is dropped; when the drain finishes and a name
//! is still at or above the threshold, one follow-up drain is signalled.

use super::buffer::PendingBuffer;
use super::retry::RetryState;
use crate::emitter::EventEmitter;
use crate::error::{CommitError, SyncError, SyncResult};
use crate::models::EventName;
use crate::observability::{outcomes, StructuredLogger, SyncMetrics};
use crate::repository::EventRepository;
use crate::stats::EventStatistics;
use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

/// Default period between timer-driven drains
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(300);

/// Default per-name backlog that forces an immediate drain
pub const DEFAULT_BUFFER_THRESHOLD: u64 = 150;

/// Configuration for the sync engine
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Period of the timer-driven drain
    pub flush_interval: Duration,
    /// Pending count for a single name that triggers a drain
    pub buffer_threshold: u64,
    /// Pause after the first failing drain
    pub initial_backoff: Duration,
    /// Upper bound for the pause between failing drains
    pub max_backoff: Duration,
    /// How long shutdown keeps retrying before giving up
    pub shutdown_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            buffer_threshold: DEFAULT_BUFFER_THRESHOLD,
            initial_backoff: DEFAULT_FLUSH_INTERVAL,
            max_backoff: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl SyncConfig {
    pub fn validate(&self) -> SyncResult<()> {
        if self.flush_interval.is_zero() {
            return Err(SyncError::InvalidConfig(
                "flush_interval must be greater than zero".to_string(),
            ));
        }
        if self.buffer_threshold == 0 {
            return Err(SyncError::InvalidConfig(
                "buffer_threshold must be at least 1".to_string(),
            ));
        }
        if self.initial_backoff > self.max_backoff {
            return Err(SyncError::InvalidConfig(format!(
                "initial_backoff {:?} exceeds max_backoff {:?}",
                self.initial_backoff, self.max_backoff
            )));
        }
        Ok(())
    }
}

/// What started a drain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainTrigger {
    /// Periodic timer tick
    Interval,
    /// A name's backlog reached the threshold
    Threshold,
    /// Explicit caller request
    Manual,
    /// Final flush during shutdown
    Shutdown,
}

impl DrainTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            DrainTrigger::Interval => "interval",
            DrainTrigger::Threshold => "threshold",
            DrainTrigger::Manual => "manual",
            DrainTrigger::Shutdown => "shutdown",
        }
    }

    /// Automatic triggers wait out the backoff; explicit ones do not
    fn respects_backoff(&self) -> bool {
        matches!(self, DrainTrigger::Interval | DrainTrigger::Threshold)
    }
}

impl fmt::Display for DrainTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a drain did nothing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Another drain holds the flushing flag
    InProgress,
    /// Nothing was pending
    Empty,
    /// Waiting out the backoff after failed commits
    BackingOff,
}

/// Result of one drain pass over a buffer snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainReport {
    pub trigger: DrainTrigger,
    /// Increments the repository accepted
    pub committed: u64,
    /// Increments put back into the buffer
    pub requeued: u64,
    /// Rejected commits, in attempt order
    pub failures: Vec<CommitError>,
    pub elapsed: Duration,
}

impl DrainReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    Skipped(SkipReason),
    Completed(DrainReport),
}

impl DrainOutcome {
    pub fn is_skipped(&self) -> bool {
        matches!(self, DrainOutcome::Skipped(_))
    }

    pub fn report(&self) -> Option<&DrainReport> {
        match self {
            DrainOutcome::Completed(report) => Some(report),
            DrainOutcome::Skipped(_) => None,
        }
    }
}

/// Counters describing engine activity
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub drains_completed: u64,
    pub drains_skipped: u64,
    pub commits_succeeded: u64,
    pub commits_failed: u64,
    pub events_committed: u64,
    pub events_requeued: u64,
    /// Highest number of drains ever inside the critical section at once
    pub max_concurrent_drains: usize,
}

#[derive(Debug, Default)]
struct EngineCounters {
    drains_completed: AtomicU64,
    drains_skipped: AtomicU64,
    commits_succeeded: AtomicU64,
    commits_failed: AtomicU64,
    events_committed: AtomicU64,
    events_requeued: AtomicU64,
    active_drains: AtomicUsize,
    max_concurrent_drains: AtomicUsize,
}

struct EngineInner {
    config: SyncConfig,
    stats: EventStatistics,
    pending: PendingBuffer,
    /// Amounts taken from the buffer whose commit has not resolved
    in_flight: DashMap<EventName, u64>,
    flushing: AtomicBool,
    started: AtomicBool,
    repository: Arc<dyn EventRepository>,
    retry: Mutex<RetryState>,
    threshold_signal: Notify,
    drain_idle: Notify,
    counters: EngineCounters,
    metrics: SyncMetrics,
    logger: StructuredLogger,
}

impl EngineInner {
    /// Move the whole buffer into the in-flight ledger
    fn take_snapshot(&self) -> Vec<(EventName, u64)> {
        let snapshot = self.pending.take_all();
        for (name, count) in &snapshot {
            self.in_flight.insert(*name, *count);
            self.metrics.set_pending(*name, self.pending.get(*name));
        }
        snapshot
    }
}

/// Holds the flushing flag for the lifetime of one drain
struct DrainGuard<'a> {
    inner: &'a EngineInner,
}

impl<'a> DrainGuard<'a> {
    fn acquire(inner: &'a EngineInner) -> Option<Self> {
        inner
            .flushing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;

        let active = inner.counters.active_drains.fetch_add(1, Ordering::SeqCst) + 1;
        inner
            .counters
            .max_concurrent_drains
            .fetch_max(active, Ordering::SeqCst);

        Some(Self { inner })
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        // Anything still in flight belongs to a drain that was cancelled
        // mid-commit; its outcome is unknown to us, so it goes back.
        for name in EventName::ALL {
            if let Some((_, count)) = self.inner.in_flight.remove(&name) {
                let pending = self.inner.pending.requeue(name, count);
                self.inner.metrics.set_pending(name, pending);
            }
        }

        self.inner
            .counters
            .active_drains
            .fetch_sub(1, Ordering::SeqCst);
        self.inner.flushing.store(false, Ordering::Release);
        self.inner.drain_idle.notify_waiters();
    }
}

/// Event handler that mirrors counts locally and syncs them to a repository
///
/// Cheap to clone; clones share the same counters and buffer.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    /// Create an engine with its own metrics registry
    pub fn new(repository: Arc<dyn EventRepository>, config: SyncConfig) -> SyncResult<Self> {
        SyncEngineBuilder::new()
            .repository(repository)
            .config(config)
            .build()
    }

    fn from_parts(
        repository: Arc<dyn EventRepository>,
        config: SyncConfig,
        metrics: SyncMetrics,
        logger: StructuredLogger,
    ) -> Self {
        let retry = RetryState::new(config.initial_backoff, config.max_backoff);

        Self {
            inner: Arc::new(EngineInner {
                config,
                stats: EventStatistics::new(),
                pending: PendingBuffer::new(),
                in_flight: DashMap::new(),
                flushing: AtomicBool::new(false),
                started: AtomicBool::new(false),
                repository,
                retry: Mutex::new(retry),
                threshold_signal: Notify::new(),
                drain_idle: Notify::new(),
                counters: EngineCounters::default(),
                metrics,
                logger,
            }),
        }
    }

    /// Subscribe this engine to every event name on `emitter`
    pub fn attach(&self, emitter: &EventEmitter) {
        for name in EventName::ALL {
            let engine = self.clone();
            emitter.subscribe(name, move || engine.on_event(name));
        }
    }

    /// Record one occurrence of `name`; never blocks, never fails
    pub fn on_event(&self, name: EventName) {
        let inner = &*self.inner;

        inner.stats.increment(name);
        let pending = inner.pending.add(name, 1);

        inner.metrics.inc_events_observed(name);
        inner.metrics.set_pending(name, pending);

        // While a drain runs the crossing is dropped; the drain re-checks on exit
        if pending >= inner.config.buffer_threshold && !inner.flushing.load(Ordering::Acquire) {
            inner.threshold_signal.notify_one();
        }
    }

    /// Events observed for `name`, committed or not
    pub fn read_stats(&self, name: EventName) -> u64 {
        self.inner.stats.get(name)
    }

    /// Increments for `name` waiting for a drain
    pub fn pending(&self, name: EventName) -> u64 {
        self.inner.pending.get(name)
    }

    /// Increments for `name` currently being committed
    pub fn in_flight(&self, name: EventName) -> u64 {
        self.inner.in_flight.get(&name).map(|c| *c).unwrap_or(0)
    }

    /// Everything observed but not yet confirmed by the repository
    pub fn uncommitted(&self) -> u64 {
        EventName::ALL
            .iter()
            .map(|name| self.pending(*name) + self.in_flight(*name))
            .sum()
    }

    pub fn is_flushing(&self) -> bool {
        self.inner.flushing.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub fn metrics(&self) -> &SyncMetrics {
        &self.inner.metrics
    }

    pub fn repository(&self) -> &Arc<dyn EventRepository> {
        &self.inner.repository
    }

    pub async fn retry_state(&self) -> RetryState {
        self.inner.retry.lock().await.clone()
    }

    pub fn stats(&self) -> EngineStats {
        let c = &self.inner.counters;
        EngineStats {
            drains_completed: c.drains_completed.load(Ordering::SeqCst),
            drains_skipped: c.drains_skipped.load(Ordering::SeqCst),
            commits_succeeded: c.commits_succeeded.load(Ordering::SeqCst),
            commits_failed: c.commits_failed.load(Ordering::SeqCst),
            events_committed: c.events_committed.load(Ordering::SeqCst),
            events_requeued: c.events_requeued.load(Ordering::SeqCst),
            max_concurrent_drains: c.max_concurrent_drains.load(Ordering::SeqCst),
        }
    }

    /// Start the timer/threshold driver loop
    pub fn start(&self, shutdown: broadcast::Receiver<()>) -> SyncResult<JoinHandle<()>> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(SyncError::AlreadyStarted);
        }

        self.inner.logger.log_startup(
            self.inner.config.flush_interval.as_millis(),
            self.inner.config.buffer_threshold,
        );

        let engine = self.clone();
        Ok(tokio::spawn(async move { engine.run(shutdown).await }))
    }

    async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let period = self.inner.config.flush_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !self.inner.pending.is_empty()
                        && !self.is_flushing()
                        && !self.is_backing_off().await
                    {
                        self.spawn_drain(DrainTrigger::Interval);
                    }
                }
                _ = self.inner.threshold_signal.notified() => {
                    // Crossings during backoff are left to the first tick after it
                    if !self.is_backing_off().await {
                        self.spawn_drain(DrainTrigger::Threshold);
                    }
                }
                _ = shutdown.recv() => {
                    info!(instance = %self.inner.logger.instance(), "Stopping sync driver loop");
                    break;
                }
            }
        }
    }

    async fn is_backing_off(&self) -> bool {
        self.inner.retry.lock().await.is_backing_off(Instant::now())
    }

    fn spawn_drain(&self, trigger: DrainTrigger) {
        let engine = self.clone();
        tokio::spawn(async move {
            engine.drain(trigger).await;
        });
    }

    fn skip(&self, trigger: DrainTrigger, reason: SkipReason) -> DrainOutcome {
        let outcome = match reason {
            SkipReason::InProgress => outcomes::IN_PROGRESS,
            SkipReason::Empty => outcomes::EMPTY,
            SkipReason::BackingOff => outcomes::BACKING_OFF,
        };
        self.inner
            .counters
            .drains_skipped
            .fetch_add(1, Ordering::SeqCst);
        self.inner.metrics.inc_drain(outcome);
        debug!(trigger = %trigger, reason = ?reason, "Drain skipped");
        DrainOutcome::Skipped(reason)
    }

    /// Push the current buffer to the repository
    ///
    /// Snapshots and clears the buffer, commits each name, and requeues any
    /// amount the repository rejects. A no-op while another drain runs.
    pub async fn drain(&self, trigger: DrainTrigger) -> DrainOutcome {
        let inner = &*self.inner;

        if trigger.respects_backoff() && self.is_backing_off().await {
            return self.skip(trigger, SkipReason::BackingOff);
        }

        let Some(guard) = DrainGuard::acquire(inner) else {
            return self.skip(trigger, SkipReason::InProgress);
        };

        let snapshot = inner.take_snapshot();
        if snapshot.is_empty() {
            drop(guard);
            return self.skip(trigger, SkipReason::Empty);
        }

        let started = Instant::now();
        let mut report = DrainReport {
            trigger,
            committed: 0,
            requeued: 0,
            failures: Vec::new(),
            elapsed: Duration::ZERO,
        };

        for (name, count) in snapshot {
            let result = inner.repository.commit(name, count).await;
            inner.in_flight.remove(&name);

            match result {
                Ok(()) => {
                    report.committed += count;
                    inner.counters.commits_succeeded.fetch_add(1, Ordering::SeqCst);
                    inner.counters.events_committed.fetch_add(count, Ordering::SeqCst);
                    inner.metrics.record_commit_success(name, count);
                }
                Err(error) => {
                    let pending = inner.pending.requeue(name, count);
                    report.requeued += count;
                    inner.counters.commits_failed.fetch_add(1, Ordering::SeqCst);
                    inner.counters.events_requeued.fetch_add(count, Ordering::SeqCst);
                    inner.metrics.record_commit_failure(name, count);
                    inner.metrics.set_pending(name, pending);
                    inner
                        .logger
                        .log_commit_failure(name, count, pending, &error.to_string());
                    report.failures.push(error);
                }
            }
        }
        report.elapsed = started.elapsed();

        let backing_off = {
            let mut retry = inner.retry.lock().await;
            match report.failures.last() {
                Some(error) => {
                    retry.record_failure(Instant::now(), error.to_string());
                    true
                }
                None => {
                    retry.record_success();
                    false
                }
            }
        };

        drop(guard);

        inner.counters.drains_completed.fetch_add(1, Ordering::SeqCst);
        inner.metrics.inc_drain(outcomes::COMPLETED);
        inner
            .metrics
            .observe_drain_duration(report.elapsed.as_secs_f64());
        inner.logger.log_drain(
            trigger.as_str(),
            report.committed,
            report.requeued,
            report.failures.len(),
            report.elapsed.as_millis(),
        );

        if !backing_off && inner.pending.max_pending() >= inner.config.buffer_threshold {
            debug!(
                max_pending = inner.pending.max_pending(),
                "Backlog at threshold after drain, signalling follow-up"
            );
            inner.threshold_signal.notify_one();
        }

        DrainOutcome::Completed(report)
    }

    /// Drain until nothing is pending or in flight
    ///
    /// Waits for a running drain instead of racing it and sleeps out the
    /// backoff between failing attempts. Loops for as long as commits fail.
    pub async fn flush_all(&self) {
        loop {
            let idle = self.inner.drain_idle.notified();
            if self.is_flushing() {
                idle.await;
                continue;
            }
            if self.inner.pending.is_empty() {
                return;
            }

            if let DrainOutcome::Completed(report) = self.drain(DrainTrigger::Shutdown).await {
                if !report.is_clean() {
                    let wait = self.inner.retry.lock().await.remaining(Instant::now());
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// Final flush, bounded by `shutdown_timeout`
    ///
    /// Stop the driver loop first so timer drains do not compete.
    pub async fn shutdown(&self) -> SyncResult<()> {
        let timeout = self.inner.config.shutdown_timeout;
        let flushed = tokio::time::timeout(timeout, self.flush_all()).await;
        let remaining = self.uncommitted();

        match flushed {
            Ok(()) => {
                self.inner.logger.log_shutdown("flushed", remaining);
                Ok(())
            }
            Err(_) => {
                self.inner.logger.log_shutdown("flush timed out", remaining);
                Err(SyncError::ShutdownTimeout { timeout, remaining })
            }
        }
    }
}

/// Builder for SyncEngine configuration
pub struct SyncEngineBuilder {
    config: SyncConfig,
    repository: Option<Arc<dyn EventRepository>>,
    metrics: Option<SyncMetrics>,
    instance: String,
}

impl SyncEngineBuilder {
    pub fn new() -> Self {
        Self {
            config: SyncConfig::default(),
            repository: None,
            metrics: None,
            instance: "tally".to_string(),
        }
    }

    pub fn repository(mut self, repository: Arc<dyn EventRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.config.flush_interval = interval;
        self
    }

    pub fn buffer_threshold(mut self, threshold: u64) -> Self {
        self.config.buffer_threshold = threshold;
        self
    }

    pub fn initial_backoff(mut self, backoff: Duration) -> Self {
        self.config.initial_backoff = backoff;
        self
    }

    pub fn max_backoff(mut self, backoff: Duration) -> Self {
        self.config.max_backoff = backoff;
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    pub fn metrics(mut self, metrics: SyncMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = instance.into();
        self
    }

    pub fn build(self) -> SyncResult<SyncEngine> {
        let repository = self
            .repository
            .ok_or_else(|| SyncError::InvalidConfig("repository is required".to_string()))?;
        self.config.validate()?;

        let metrics = match self.metrics {
            Some(metrics) => metrics,
            None => SyncMetrics::new()?,
        };

        Ok(SyncEngine::from_parts(
            repository,
            self.config,
            metrics,
            StructuredLogger::new(self.instance),
        ))
    }
}

impl Default for SyncEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{DelayedRepository, RepositoryConfig};

    fn reliable_repo() -> Arc<DelayedRepository> {
        Arc::new(DelayedRepository::new(RepositoryConfig::reliable(
            Duration::from_millis(10),
        )))
    }

    #[test]
    fn test_sync_config_default() {
        let config = SyncConfig::default();
        assert_eq!(config.flush_interval, Duration::from_millis(300));
        assert_eq!(config.buffer_threshold, 150);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let config = SyncConfig {
            buffer_threshold: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(SyncError::InvalidConfig(_))));

        let config = SyncConfig {
            flush_interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = SyncConfig {
            initial_backoff: Duration::from_secs(10),
            max_backoff: Duration::from_secs(1),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_builder_pattern() {
        let engine = SyncEngineBuilder::new()
            .repository(reliable_repo())
            .flush_interval(Duration::from_millis(50))
            .buffer_threshold(10)
            .instance("builder-test")
            .build()
            .unwrap();

        assert_eq!(engine.config().flush_interval, Duration::from_millis(50));
        assert_eq!(engine.config().buffer_threshold, 10);
    }

    #[test]
    fn test_builder_missing_repository() {
        let result = SyncEngineBuilder::new().build();
        assert!(matches!(result, Err(SyncError::InvalidConfig(_))));
    }

    #[test]
    fn test_on_event_updates_counter_and_buffer() {
        let engine = SyncEngine::new(reliable_repo(), SyncConfig::default()).unwrap();

        engine.on_event(EventName::A);
        engine.on_event(EventName::A);
        engine.on_event(EventName::B);

        assert_eq!(engine.read_stats(EventName::A), 2);
        assert_eq!(engine.read_stats(EventName::B), 1);
        assert_eq!(engine.pending(EventName::A), 2);
        assert_eq!(engine.uncommitted(), 3);
        assert!(!engine.is_flushing());
    }

    #[tokio::test]
    async fn test_empty_drain_is_skipped() {
        let engine = SyncEngine::new(reliable_repo(), SyncConfig::default()).unwrap();

        let outcome = engine.drain(DrainTrigger::Manual).await;
        assert_eq!(outcome, DrainOutcome::Skipped(SkipReason::Empty));
        assert!(!engine.is_flushing());
        assert_eq!(engine.stats().drains_skipped, 1);
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let engine = SyncEngine::new(reliable_repo(), SyncConfig::default()).unwrap();
        let (tx, _) = broadcast::channel(1);

        let handle = engine.start(tx.subscribe()).unwrap();
        assert!(matches!(
            engine.start(tx.subscribe()),
            Err(SyncError::AlreadyStarted)
        ));

        tx.send(()).unwrap();
        handle.await.unwrap();
    }

    #[test]
    fn test_drain_trigger_labels() {
        assert_eq!(DrainTrigger::Interval.to_string(), "interval");
        assert!(DrainTrigger::Threshold.respects_backoff());
        assert!(!DrainTrigger::Shutdown.respects_backoff());
    }
}
