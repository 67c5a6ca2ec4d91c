//! Tally - buffered event counting against a slow repository
//!
//! Fires random bursts of named events, counts them in memory, and syncs the
//! counts to a delayed, failure-prone repository until both sides agree.

use anyhow::{bail, Result};
use std::sync::Arc;
use std::time::Duration;
use tally_lib::{
    trigger_randomly, ConvergenceObserver, DelayedRepository, EventEmitter, EventName,
    SyncEngineBuilder, SyncMetrics,
};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod config;

const CONVERGENCE_POLL: Duration = Duration::from_millis(50);

// Drains move amounts between the buffer and the in-flight ledger in several
// steps; a single worker keeps every observer read between those steps.
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting tally");

    let config = config::TallyConfig::load()?;
    info!(
        instance = %config.instance,
        events_per_name = config.events_per_name,
        failure_rate = config.failure_rate,
        "Tally configured"
    );

    let repository = Arc::new(DelayedRepository::new(config.repository_config()));
    let metrics = SyncMetrics::new()?;
    let engine = SyncEngineBuilder::new()
        .repository(repository.clone())
        .config(config.sync_config())
        .metrics(metrics.clone())
        .instance(config.instance.clone())
        .build()?;

    let emitter = Arc::new(EventEmitter::new());
    engine.attach(&emitter);

    let (shutdown_tx, _) = broadcast::channel(1);
    let driver = engine.start(shutdown_tx.subscribe())?;

    let observer = Arc::new(ConvergenceObserver::new(emitter.clone(), engine.clone()));
    let reporter = {
        let observer = observer.clone();
        let every = config.report_interval();
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move { observer.run(every, shutdown).await })
    };

    let mut sources: Vec<_> = EventName::ALL
        .iter()
        .map(|name| {
            trigger_randomly(
                emitter.clone(),
                *name,
                config.events_per_name,
                config.max_event_delay(),
            )
        })
        .collect();

    let interrupted = tokio::select! {
        result = async {
            for source in sources.iter_mut() {
                source.await?;
            }
            Ok::<(), tokio::task::JoinError>(())
        } => {
            result?;
            false
        }
        _ = tokio::signal::ctrl_c() => {
            warn!("SIGINT received, stopping before all events fired");
            true
        }
    };

    if interrupted {
        // The final flush must not chase events that keep arriving
        for source in &sources {
            source.abort();
        }
    }

    let report = if interrupted {
        None
    } else {
        match observer
            .wait_for_convergence(
                config.events_per_name,
                CONVERGENCE_POLL,
                config.convergence_timeout(),
            )
            .await
        {
            Ok(report) => Some(report),
            Err(e) => {
                warn!(error = %e, "Counters did not converge");
                None
            }
        }
    };

    // Driver and reporter go first so the final flush runs alone
    let _ = shutdown_tx.send(());
    driver.await?;
    reporter.await?;
    engine.shutdown().await?;

    let stats = engine.stats();
    let repo_stats = repository.stats();
    info!(
        drains_completed = stats.drains_completed,
        drains_skipped = stats.drains_skipped,
        commits_failed = stats.commits_failed,
        events_requeued = stats.events_requeued,
        max_concurrent_drains = stats.max_concurrent_drains,
        repository_attempts = repo_stats.attempts,
        repository_max_in_flight = repo_stats.max_in_flight,
        "Sync summary"
    );
    debug!(metrics = %metrics.encode_text()?, "Final metrics");

    let final_report = match report {
        Some(report) => report,
        None => observer.snapshot(),
    };
    println!("{}", serde_json::to_string_pretty(&final_report)?);

    if interrupted {
        info!("Shutting down");
        return Ok(());
    }
    if !final_report.converged {
        bail!("counters diverged: {}", final_report.to_json()?);
    }

    info!("Shutting down");
    Ok(())
}
