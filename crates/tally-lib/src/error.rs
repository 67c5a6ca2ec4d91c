//! Error types for tallying and syncing
//!
//! Event delivery and counter reads never fail. Errors only surface from
//! repository commits, explicit counter writes, and engine shutdown.

use crate::models::EventName;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for sync engine operations
pub type SyncResult<T> = Result<T, SyncError>;

/// A repository commit was rejected; nothing was applied
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommitError {
    #[error("repository unavailable while saving {count} {name} events")]
    Unavailable { name: EventName, count: u64 },

    #[error("injected fault while saving {count} {name} events")]
    Injected { name: EventName, count: u64 },
}

impl CommitError {
    pub fn name(&self) -> EventName {
        match self {
            CommitError::Unavailable { name, .. } | CommitError::Injected { name, .. } => *name,
        }
    }

    pub fn count(&self) -> u64 {
        match self {
            CommitError::Unavailable { count, .. } | CommitError::Injected { count, .. } => *count,
        }
    }
}

/// Counter store write rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StatsError {
    #[error("counter for {name} cannot decrease from {current} to {requested}")]
    WouldDecrease {
        name: EventName,
        current: u64,
        requested: u64,
    },
}

/// Sync engine lifecycle errors
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("engine already started")]
    AlreadyStarted,

    #[error("shutdown flush timed out after {timeout:?} with {remaining} events uncommitted")]
    ShutdownTimeout { timeout: Duration, remaining: u64 },

    #[error("invalid sync configuration: {0}")]
    InvalidConfig(String),

    #[error("counters did not converge within {timeout:?}")]
    ConvergenceTimeout { timeout: Duration },

    #[error("failed to register metrics: {0}")]
    Metrics(#[from] prometheus::Error),
}
