//! Convergence reporting
//!
//! Periodically compares the fired totals from the event source with the
//! sync engine's counters and the repository's committed totals. Read-only:
//! nothing here mutates the engine or the repository.

use crate::emitter::EventEmitter;
use crate::error::{SyncError, SyncResult};
use crate::models::EventName;
use crate::observability::StructuredLogger;
use crate::sync::SyncEngine;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::info;

/// Counters for one event name at one instant
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NameReport {
    pub name: EventName,
    /// Ground truth from the event source
    pub fired: u64,
    /// Sync engine's own counter
    pub handler: u64,
    /// Repository's committed total
    pub repository: u64,
    pub pending: u64,
    pub in_flight: u64,
}

impl NameReport {
    /// All three counters agree
    pub fn is_converged(&self) -> bool {
        self.fired == self.handler && self.handler == self.repository
    }

    /// Nothing observed has gone missing between engine and repository
    pub fn is_conserved(&self) -> bool {
        self.handler == self.repository + self.pending + self.in_flight
    }
}

/// Snapshot of every event name's counters
#[derive(Debug, Clone, Serialize)]
pub struct ConvergenceReport {
    /// Unix seconds
    pub generated_at: i64,
    pub names: Vec<NameReport>,
    pub converged: bool,
}

impl ConvergenceReport {
    pub fn get(&self, name: EventName) -> Option<&NameReport> {
        self.names.iter().find(|r| r.name == name)
    }

    pub fn total_fired(&self) -> u64 {
        self.names.iter().map(|r| r.fired).sum()
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Read-only observer over an emitter and an attached sync engine
pub struct ConvergenceObserver {
    emitter: Arc<EventEmitter>,
    engine: SyncEngine,
    logger: StructuredLogger,
}

impl ConvergenceObserver {
    pub fn new(emitter: Arc<EventEmitter>, engine: SyncEngine) -> Self {
        Self {
            emitter,
            engine,
            logger: StructuredLogger::new("observer"),
        }
    }

    /// Read every counter once
    ///
    /// Conservation is exact when the engine runs on a current-thread
    /// runtime. On a multi-thread runtime a read can land between a drain's
    /// buffer and in-flight updates, so `is_conserved` is best-effort there.
    pub fn snapshot(&self) -> ConvergenceReport {
        let repository = self.engine.repository();

        let names: Vec<NameReport> = EventName::ALL
            .iter()
            .map(|name| NameReport {
                name: *name,
                fired: self.emitter.fired(*name),
                handler: self.engine.read_stats(*name),
                repository: repository.read_stats(*name),
                pending: self.engine.pending(*name),
                in_flight: self.engine.in_flight(*name),
            })
            .collect();

        let converged = names.iter().all(NameReport::is_converged);

        ConvergenceReport {
            generated_at: chrono::Utc::now().timestamp(),
            names,
            converged,
        }
    }

    fn log_report(&self, report: &ConvergenceReport) {
        for r in &report.names {
            info!(
                event = "progress",
                event_name = %r.name,
                fired = r.fired,
                handler = r.handler,
                repository = r.repository,
                pending = r.pending,
                in_flight = r.in_flight,
                converged = r.is_converged(),
                "Counter progress"
            );
        }
    }

    /// Log a report every `every` until shutdown
    pub async fn run(&self, every: Duration, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = interval(every);
        let mut was_converged = false;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.snapshot();
                    self.log_report(&report);

                    let converged = report.converged && report.total_fired() > 0;
                    if converged && !was_converged {
                        self.logger.log_converged(report.total_fired());
                    }
                    was_converged = converged;
                }
                _ = shutdown.recv() => break,
            }
        }
    }

    /// Poll until every name fired `expected` times and all counters agree
    pub async fn wait_for_convergence(
        &self,
        expected: u64,
        poll: Duration,
        timeout: Duration,
    ) -> SyncResult<ConvergenceReport> {
        let wait = async {
            loop {
                let report = self.snapshot();
                if report.converged && report.names.iter().all(|r| r.fired == expected) {
                    return report;
                }
                tokio::time::sleep(poll).await;
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(report) => {
                self.log_report(&report);
                self.logger.log_converged(report.total_fired());
                Ok(report)
            }
            Err(_) => Err(SyncError::ConvergenceTimeout { timeout }),
        }
    }
}
