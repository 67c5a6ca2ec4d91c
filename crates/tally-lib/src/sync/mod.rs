//! Synchronization of in-memory event counts with a repository
//!
//! This module provides:
//! - A pending increment buffer with snapshot-and-clear semantics
//! - The sync engine with timer and threshold driven drains
//! - Backoff bookkeeping for failing commits

mod buffer;
mod engine;
mod retry;


pub use buffer::PendingBuffer;
pub use engine::{
    DrainOutcome, DrainReport, DrainTrigger, EngineStats, SkipReason, SyncConfig, SyncEngine,
    SyncEngineBuilder, DEFAULT_BUFFER_THRESHOLD, DEFAULT_FLUSH_INTERVAL,
};
pub use retry::RetryState;
