//! Observability infrastructure for the sync engine
//!
//! Provides:
//! - Prometheus metrics (events observed, drains, commits, pending backlog, drain latency)
//! - Structured JSON logging with tracing

use crate::models::EventName;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use tracing::{info, warn};

/// Histogram buckets for drain latency (in seconds)
const DRAIN_LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Drain outcome labels
pub mod outcomes {
    pub const COMPLETED: &str = "completed";
    pub const IN_PROGRESS: &str = "skipped_in_progress";
    pub const EMPTY: &str = "skipped_empty";
    pub const BACKING_OFF: &str = "skipped_backoff";
}

/// Sync engine metrics for Prometheus exposition
///
/// Each instance owns its registry, so several engines in one process
/// (tests, for example) never collide. Clones share the same metrics.
#[derive(Clone)]
pub struct SyncMetrics {
    registry: Registry,
    events_observed: IntCounterVec,
    drains: IntCounterVec,
    commits: IntCounterVec,
    events_committed: IntCounterVec,
    events_requeued: IntCounterVec,
    pending_events: IntGaugeVec,
    drain_duration_seconds: Histogram,
}

impl SyncMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let events_observed = IntCounterVec::new(
            Opts::new(
                "tally_events_observed_total",
                "Events delivered to the sync engine",
            ),
            &["event"],
        )?;
        let drains = IntCounterVec::new(
            Opts::new("tally_drains_total", "Drain attempts by outcome"),
            &["outcome"],
        )?;
        let commits = IntCounterVec::new(
            Opts::new("tally_commits_total", "Repository commits by result"),
            &["result"],
        )?;
        let events_committed = IntCounterVec::new(
            Opts::new(
                "tally_events_committed_total",
                "Event increments successfully committed to the repository",
            ),
            &["event"],
        )?;
        let events_requeued = IntCounterVec::new(
            Opts::new(
                "tally_events_requeued_total",
                "Event increments put back into the buffer after a failed commit",
            ),
            &["event"],
        )?;
        let pending_events = IntGaugeVec::new(
            Opts::new(
                "tally_pending_events",
                "Event increments waiting in the buffer",
            ),
            &["event"],
        )?;
        let drain_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "tally_drain_duration_seconds",
                "Time spent committing one buffer snapshot",
            )
            .buckets(DRAIN_LATENCY_BUCKETS.to_vec()),
        )?;

        registry.register(Box::new(events_observed.clone()))?;
        registry.register(Box::new(drains.clone()))?;
        registry.register(Box::new(commits.clone()))?;
        registry.register(Box::new(events_committed.clone()))?;
        registry.register(Box::new(events_requeued.clone()))?;
        registry.register(Box::new(pending_events.clone()))?;
        registry.register(Box::new(drain_duration_seconds.clone()))?;

        Ok(Self {
            registry,
            events_observed,
            drains,
            commits,
            events_committed,
            events_requeued,
            pending_events,
            drain_duration_seconds,
        })
    }

    pub fn inc_events_observed(&self, name: EventName) {
        self.events_observed.with_label_values(&[name.as_str()]).inc();
    }

    pub fn inc_drain(&self, outcome: &str) {
        self.drains.with_label_values(&[outcome]).inc();
    }

    pub fn record_commit_success(&self, name: EventName, count: u64) {
        self.commits.with_label_values(&["ok"]).inc();
        self.events_committed
            .with_label_values(&[name.as_str()])
            .inc_by(count);
    }

    pub fn record_commit_failure(&self, name: EventName, count: u64) {
        self.commits.with_label_values(&["failed"]).inc();
        self.events_requeued
            .with_label_values(&[name.as_str()])
            .inc_by(count);
    }

    pub fn set_pending(&self, name: EventName, pending: u64) {
        self.pending_events
            .with_label_values(&[name.as_str()])
            .set(pending as i64);
    }

    pub fn observe_drain_duration(&self, duration_secs: f64) {
        self.drain_duration_seconds.observe(duration_secs);
    }

    pub fn drain_count(&self, outcome: &str) -> u64 {
        self.drains.with_label_values(&[outcome]).get()
    }

    pub fn pending_gauge(&self, name: EventName) -> i64 {
        self.pending_events
            .with_label_values(&[name.as_str()])
            .get()
    }

    pub fn committed_count(&self, name: EventName) -> u64 {
        self.events_committed
            .with_label_values(&[name.as_str()])
            .get()
    }

    /// Render every metric in the Prometheus text format
    pub fn encode_text(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Structured logger for sync lifecycle events
///
/// Provides consistent JSON-formatted logging for drains, commit failures,
/// convergence, and shutdown.
#[derive(Clone)]
pub struct StructuredLogger {
    instance: String,
}

impl StructuredLogger {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
        }
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// Log engine startup
    pub fn log_startup(&self, flush_interval_ms: u128, buffer_threshold: u64) {
        info!(
            event = "sync_started",
            instance = %self.instance,
            flush_interval_ms = flush_interval_ms as u64,
            buffer_threshold = buffer_threshold,
            "Sync engine started"
        );
    }

    /// Log a finished drain
    pub fn log_drain(
        &self,
        trigger: &str,
        committed: u64,
        requeued: u64,
        failures: usize,
        elapsed_ms: u128,
    ) {
        if failures > 0 {
            warn!(
                event = "drain_completed",
                instance = %self.instance,
                trigger = %trigger,
                committed = committed,
                requeued = requeued,
                failures = failures,
                elapsed_ms = elapsed_ms as u64,
                "Drain finished with failed commits, amounts requeued"
            );
        } else {
            info!(
                event = "drain_completed",
                instance = %self.instance,
                trigger = %trigger,
                committed = committed,
                elapsed_ms = elapsed_ms as u64,
                "Drain finished"
            );
        }
    }

    /// Log a rejected commit
    pub fn log_commit_failure(&self, name: EventName, count: u64, pending: u64, error: &str) {
        warn!(
            event = "commit_failed",
            instance = %self.instance,
            event_name = %name,
            count = count,
            pending_after_requeue = pending,
            error = %error,
            "Failed to save events, retrying on a later drain"
        );
    }

    /// Log that both counters match the fired totals
    pub fn log_converged(&self, total_events: u64) {
        info!(
            event = "converged",
            instance = %self.instance,
            total_events = total_events,
            "Engine and repository counters converged"
        );
    }

    /// Log engine shutdown
    pub fn log_shutdown(&self, reason: &str, uncommitted: u64) {
        if uncommitted == 0 {
            info!(
                event = "sync_shutdown",
                instance = %self.instance,
                reason = %reason,
                "Sync engine shut down with everything committed"
            );
        } else {
            warn!(
                event = "sync_shutdown",
                instance = %self.instance,
                reason = %reason,
                uncommitted = uncommitted,
                "Sync engine shut down with uncommitted events"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_metrics_creation() {
        let metrics = SyncMetrics::new().unwrap();

        metrics.inc_events_observed(EventName::A);
        metrics.inc_drain(outcomes::COMPLETED);
        metrics.record_commit_success(EventName::A, 5);
        metrics.record_commit_failure(EventName::B, 3);
        metrics.set_pending(EventName::B, 3);
        metrics.observe_drain_duration(0.02);

        assert_eq!(metrics.drain_count(outcomes::COMPLETED), 1);
        assert_eq!(metrics.committed_count(EventName::A), 5);
    }

    #[test]
    fn test_metrics_instances_are_independent() {
        let first = SyncMetrics::new().unwrap();
        let second = SyncMetrics::new().unwrap();

        first.inc_drain(outcomes::EMPTY);
        assert_eq!(first.drain_count(outcomes::EMPTY), 1);
        assert_eq!(second.drain_count(outcomes::EMPTY), 0);
    }

    #[test]
    fn test_encode_text_contains_metric_names() {
        let metrics = SyncMetrics::new().unwrap();
        metrics.inc_events_observed(EventName::A);

        let text = metrics.encode_text().unwrap();
        assert!(text.contains("tally_events_observed_total"));
        assert!(text.contains("event=\"A\""));
    }

    #[test]
    fn test_structured_logger_creation() {
        let logger = StructuredLogger::new("test-engine");
        assert_eq!(logger.instance(), "test-engine");
    }
}
