//! squall: a streaming max-aggregation service.
//!
//! A timer-driven source emits packets of random integers, a worker pool
//! reduces each packet to its maximum, and a batching repository persists
//! the reductions with idempotent upserts.

mod config;
mod error;
mod metrics;
mod pipeline;
mod pool;
mod query;
mod repository;
mod source;
mod types;

use tracing::info;
use tracing_subscriber::EnvFilter;

use config::Config;
use error::{ConfigSnafu, PipelineError};
use pipeline::run_pipeline;
use snafu::prelude::*;

#[snafu::report]
#[tokio::main]
async fn main() -> Result<(), PipelineError> {
    dotenv::dotenv().ok();

    let config = Config::from_env().context(ConfigSnafu)?;

    // RUST_LOG wins over the configured level when present.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        http_port = config.http_port,
        grpc_port = config.grpc_port,
        db_driver = %config.db_driver,
        "squall starting"
    );

    let stats = run_pipeline(config).await?;

    info!("Pipeline completed");
    info!("  Reductions persisted: {}", stats.reductions_persisted);
    info!("  Persist errors: {}", stats.persist_errors);

    Ok(())
}
