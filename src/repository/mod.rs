//! Repository layer: durable persistence and reads for reductions.
//!
//! The `Repository` trait exposes exactly four operations; the pipeline and
//! the query layer only ever see a [`RepositoryRef`]. The Postgres variant
//! batches writes behind an intake queue; the in-memory variant (used by
//! tests and the redis/clickhouse driver stubs) writes synchronously and
//! has no flusher.

pub mod batcher;
pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use snafu::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::Config;
use crate::error::{
    ConfigSnafu, MissingDsnSnafu, PipelineError, RepositoryError, StorageSnafu,
    UnsupportedDriverSnafu,
};
use crate::types::Reduction;

pub use memory::InMemoryRepository;
pub use postgres::PostgresRepository;

/// Storage abstraction over aggregated results.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Queue reductions for persistence.
    ///
    /// Waits only while the intake is full, honouring `cancel`. Returns the
    /// first background write error observed since the last `save` that
    /// returned one, then clears it; a caller that skips a `save` call can
    /// miss an error. A call racing `close` may fail with either
    /// [`RepositoryError::Cancelled`] or [`RepositoryError::Closed`];
    /// treat both as terminal.
    async fn save(
        &self,
        cancel: &CancellationToken,
        batch: &[Reduction],
    ) -> Result<(), RepositoryError>;

    /// Point read by packet id. `Ok(None)` for an unknown id.
    async fn get_by_id(&self, packet_id: &str) -> Result<Option<Reduction>, RepositoryError>;

    /// Range read over `from <= timestamp < to`, ascending by timestamp.
    async fn get_by_time_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Reduction>, RepositoryError>;

    /// Close the intake, drain buffered writes within `deadline`, and
    /// release the underlying store. Idempotent.
    async fn close(&self, deadline: Duration) -> Result<(), RepositoryError>;
}

/// Shared handle to a repository implementation.
pub type RepositoryRef = Arc<dyn Repository>;

/// Build the repository selected by `DB_DRIVER`.
pub async fn for_driver(config: &Config) -> Result<RepositoryRef, PipelineError> {
    match config.db_driver.as_str() {
        "postgres" | "pgx" => {
            if config.db_dsn.is_empty() {
                return MissingDsnSnafu.fail().context(ConfigSnafu);
            }
            let repo = PostgresRepository::connect(&config.db_dsn)
                .await
                .context(StorageSnafu)?;
            Ok(Arc::new(repo))
        }
        "redis" | "clickhouse" => {
            warn!(driver = %config.db_driver, "using in-memory stub repository");
            Ok(Arc::new(InMemoryRepository::new()))
        }
        other => UnsupportedDriverSnafu { driver: other }
            .fail()
            .context(ConfigSnafu),
    }
}
