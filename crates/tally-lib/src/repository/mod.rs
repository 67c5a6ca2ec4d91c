//! Persistent counter backends
//!
//! The sync engine only relies on the [`EventRepository`] contract: a commit
//! either applies its whole amount or nothing, and may be slow or fail.

mod delayed;

pub use delayed::{DelayedRepository, RepositoryConfig, RepositoryStats};

use crate::error::CommitError;
use crate::models::EventName;
use async_trait::async_trait;

/// Backend that stores committed per-event totals
#[async_trait]
pub trait EventRepository: Send + Sync {
    /// Add `count` to the stored total for `name`, all-or-nothing
    async fn commit(&self, name: EventName, count: u64) -> Result<(), CommitError>;

    /// Committed total for `name`
    fn read_stats(&self, name: EventName) -> u64;
}
