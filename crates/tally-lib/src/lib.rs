//! Event tallying library
//!
//! This crate provides the core functionality for:
//! - Counting named events in memory as they are emitted
//! - Buffering increments and draining them into a slow, failure-prone repository
//! - Retrying failed commits without losing or double-counting increments
//! - Observing convergence between local and persisted counters

pub mod emitter;
pub mod error;
pub mod models;
pub mod observability;
pub mod observer;
pub mod repository;
pub mod stats;
pub mod sync;

pub use emitter::{trigger_randomly, EventEmitter};
pub use error::{CommitError, StatsError, SyncError, SyncResult};
pub use models::*;
pub use observability::{StructuredLogger, SyncMetrics};
pub use observer::{ConvergenceObserver, ConvergenceReport, NameReport};
pub use repository::{DelayedRepository, EventRepository, RepositoryConfig};
pub use stats::EventStatistics;
pub use sync::{SyncConfig, SyncEngine, SyncEngineBuilder};
