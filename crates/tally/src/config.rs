//! Tally configuration

use anyhow::Result;
use serde::Deserialize;
use std::time::Duration;
use tally_lib::{RepositoryConfig, SyncConfig};

/// Process configuration, read from `TALLY_*` environment variables
#[derive(Debug, Clone, Deserialize)]
pub struct TallyConfig {
    /// Name attached to lifecycle log records
    #[serde(default = "default_instance")]
    pub instance: String,

    /// Events fired per event name
    #[serde(default = "default_events_per_name")]
    pub events_per_name: u64,

    /// Upper bound of the random pause between two events
    #[serde(default = "default_max_event_delay")]
    pub max_event_delay_ms: u64,

    /// Period of the timer-driven drain
    #[serde(default = "default_flush_interval")]
    pub flush_interval_ms: u64,

    /// Per-name backlog that forces a drain
    #[serde(default = "default_buffer_threshold")]
    pub buffer_threshold: u64,

    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// Repository commit latency bounds
    #[serde(default = "default_min_latency")]
    pub min_latency_ms: u64,

    #[serde(default = "default_max_latency")]
    pub max_latency_ms: u64,

    /// Probability that a repository commit fails
    #[serde(default = "default_failure_rate")]
    pub failure_rate: f64,

    /// Period of the progress report
    #[serde(default = "default_report_interval")]
    pub report_interval_ms: u64,

    /// How long to wait for the counters to agree once sources finish
    #[serde(default = "default_convergence_timeout")]
    pub convergence_timeout_secs: u64,
}

fn default_instance() -> String {
    "tally".to_string()
}

fn default_events_per_name() -> u64 {
    1000
}

fn default_max_event_delay() -> u64 {
    5
}

fn default_flush_interval() -> u64 {
    300
}

fn default_buffer_threshold() -> u64 {
    150
}

fn default_initial_backoff() -> u64 {
    300
}

fn default_max_backoff() -> u64 {
    5000
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_min_latency() -> u64 {
    10
}

fn default_max_latency() -> u64 {
    100
}

fn default_failure_rate() -> f64 {
    0.1
}

fn default_report_interval() -> u64 {
    1000
}

fn default_convergence_timeout() -> u64 {
    60
}

impl TallyConfig {
    /// Load configuration from the environment
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("TALLY").try_parsing(true))
            .build()?;

        Ok(config.try_deserialize()?)
    }

    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            flush_interval: Duration::from_millis(self.flush_interval_ms),
            buffer_threshold: self.buffer_threshold,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_secs),
        }
    }

    pub fn repository_config(&self) -> RepositoryConfig {
        RepositoryConfig {
            min_latency: Duration::from_millis(self.min_latency_ms),
            max_latency: Duration::from_millis(self.max_latency_ms),
            failure_rate: self.failure_rate.clamp(0.0, 1.0),
        }
    }

    pub fn max_event_delay(&self) -> Duration {
        Duration::from_millis(self.max_event_delay_ms)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_millis(self.report_interval_ms)
    }

    pub fn convergence_timeout(&self) -> Duration {
        Duration::from_secs(self.convergence_timeout_secs)
    }
}
