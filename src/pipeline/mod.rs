//! Pipeline lifecycle controller.
//!
//! Wires the stages together (source → worker pool → repository), installs
//! the shutdown signal, and tears everything down in reverse dependency
//! order: the source stops emitting, the pool drains its input, the result
//! consumer drains the result queue, and only then does the repository close
//! and flush. Skipping the pool drain would lose in-flight records, so the
//! controller never does.

mod signal;

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::emit;
use crate::error::{PipelineError, PoolError, RepositoryError};
use crate::metrics::events::SaveFailed;
use crate::pool::WorkerPool;
use crate::repository::{self, RepositoryRef};
use crate::source::{RandomSource, SourceConfig};
use crate::types::Reduction;

/// Statistics about a pipeline run.
#[derive(Debug, Clone, Default)]
pub struct RunStats {
    /// Reductions handed to the repository.
    pub reductions_persisted: usize,
    /// Reductions the repository refused (error logged, record dropped).
    pub persist_errors: usize,
}

/// Run the pipeline with the repository selected by the configuration,
/// shutting down on SIGINT/SIGTERM.
pub async fn run_pipeline(config: Config) -> Result<RunStats, PipelineError> {
    let repository = repository::for_driver(&config).await?;

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            signal::shutdown_signal().await;
            shutdown.cancel();
        }
    });

    run_with_shutdown(config, repository, shutdown).await
}

/// Run the pipeline over an injected repository and shutdown token.
///
/// Tests use this entry point to trigger shutdown without OS signals.
pub async fn run_with_shutdown(
    config: Config,
    repository: RepositoryRef,
    shutdown: CancellationToken,
) -> Result<RunStats, PipelineError> {
    info!(
        worker_pool_size = config.worker_pool_size,
        payload_len = config.generator.payload_len,
        interval = ?config.generator.interval,
        "starting aggregation service"
    );

    let source = RandomSource::new(SourceConfig {
        payload_len: config.generator.payload_len,
        interval: config.generator.interval,
        ..SourceConfig::default()
    });
    let mut pool = WorkerPool::new(config.worker_pool_size);

    let packets = source.start(shutdown.clone());
    pool.start(shutdown.clone(), packets);
    let Some(results) = pool.results() else {
        // A freshly constructed pool always yields its receiver.
        return Ok(RunStats::default());
    };

    let consumer = tokio::spawn(consume_results(results, repository.clone()));

    shutdown.cancelled().await;
    info!("shutdown initiated");

    // One absolute deadline bounds the whole teardown: each stage gets
    // whatever budget the previous stages left over.
    let grace = config.shutdown_timeout;
    let deadline = time::Instant::now() + grace;
    let mut first_error: Option<PipelineError> = None;

    // The source observes the token itself and closes its output; the pool
    // must finish draining that output before the repository goes away.
    if let Err(err) = pool.shutdown(remaining(deadline)).await {
        record_shutdown_error(&mut first_error, pool_error(err));
    }

    let stats = match time::timeout(remaining(deadline), consumer).await {
        Ok(Ok(stats)) => stats,
        Ok(Err(join_err)) => {
            record_shutdown_error(&mut first_error, PipelineError::TaskJoin { source: join_err });
            RunStats::default()
        }
        Err(_) => {
            record_shutdown_error(
                &mut first_error,
                PipelineError::DrainTimeout { deadline: grace },
            );
            RunStats::default()
        }
    };

    if let Err(err) = repository.close(remaining(deadline)).await {
        record_shutdown_error(&mut first_error, storage_error(err));
    }

    match &first_error {
        Some(err) => error!(error = %err, "shutdown completed with error"),
        None => info!(
            persisted = stats.reductions_persisted,
            errors = stats.persist_errors,
            "shutdown completed"
        ),
    }

    Ok(stats)
}

/// Drain the result queue into the repository.
///
/// Runs with a token that never fires: reductions drained after the global
/// cancellation must still reach the repository intake, which stays open
/// until the controller closes it afterwards.
async fn consume_results(
    mut results: mpsc::Receiver<Reduction>,
    repository: RepositoryRef,
) -> RunStats {
    let save_token = CancellationToken::new();
    let mut stats = RunStats::default();

    while let Some(reduction) = results.recv().await {
        match repository
            .save(&save_token, std::slice::from_ref(&reduction))
            .await
        {
            Ok(()) => {
                stats.reductions_persisted += 1;
                debug!(
                    packet_id = %reduction.packet_id,
                    max_value = reduction.max_value,
                    "packet processed"
                );
            }
            Err(err) => {
                stats.persist_errors += 1;
                emit!(SaveFailed { count: 1 });
                error!(
                    packet_id = %reduction.packet_id,
                    error = %err,
                    "failed to persist reduction"
                );
            }
        }
    }

    stats
}

/// Budget left before the shared teardown deadline; zero once it has passed.
fn remaining(deadline: time::Instant) -> Duration {
    deadline.saturating_duration_since(time::Instant::now())
}

/// Keep the first shutdown error; log the ones that follow.
fn record_shutdown_error(slot: &mut Option<PipelineError>, err: PipelineError) {
    if slot.is_none() {
        *slot = Some(err);
    } else {
        error!(error = %err, "additional shutdown error");
    }
}

fn pool_error(source: PoolError) -> PipelineError {
    PipelineError::Pool { source }
}

fn storage_error(source: RepositoryError) -> PipelineError {
    PipelineError::Storage { source }
}
