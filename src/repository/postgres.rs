//! Postgres repository: batched idempotent upserts plus point/range reads.
//!
//! Writes flow through the batching engine; reads go straight to the pool
//! and never touch intake state. The upsert statement is built per batch
//! (batch sizes vary) with positional parameters and last-writer-wins
//! conflict handling on `packet_id`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use snafu::prelude::*;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::fmt::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{ConnectSnafu, RepositoryError, SqlSnafu};
use crate::repository::Repository;
use crate::repository::batcher::{BatchConfig, BatchSink, Batcher};
use crate::types::Reduction;

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS reductions (
    packet_id TEXT PRIMARY KEY,
    timestamp TIMESTAMPTZ NOT NULL,
    max_value BIGINT NOT NULL
)";

const CREATE_TIMESTAMP_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS reductions_timestamp_idx ON reductions (timestamp)";

const SELECT_BY_ID: &str =
    "SELECT packet_id, timestamp, max_value FROM reductions WHERE packet_id = $1";

const SELECT_BY_RANGE: &str = "SELECT packet_id, timestamp, max_value FROM reductions \
     WHERE timestamp >= $1 AND timestamp < $2 ORDER BY timestamp";

/// Durable repository backed by a Postgres connection pool.
pub struct PostgresRepository {
    pool: PgPool,
    batcher: Batcher,
    released: AtomicBool,
}

impl PostgresRepository {
    /// Connect with default batching parameters.
    pub async fn connect(dsn: &str) -> Result<Self, RepositoryError> {
        Self::connect_with(dsn, BatchConfig::default()).await
    }

    /// Connect and start the flusher with explicit batching parameters.
    pub async fn connect_with(dsn: &str, cfg: BatchConfig) -> Result<Self, RepositoryError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .max_lifetime(Duration::from_secs(30 * 60))
            .idle_timeout(Duration::from_secs(5 * 60))
            .connect(dsn)
            .await
            .context(ConnectSnafu)?;

        ensure_schema(&pool).await?;

        let batcher = Batcher::spawn(PgSink { pool: pool.clone() }, cfg);

        Ok(Self {
            pool,
            batcher,
            released: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl Repository for PostgresRepository {
    async fn save(
        &self,
        cancel: &CancellationToken,
        batch: &[Reduction],
    ) -> Result<(), RepositoryError> {
        self.batcher.save(cancel, batch).await
    }

    async fn get_by_id(&self, packet_id: &str) -> Result<Option<Reduction>, RepositoryError> {
        sqlx::query_as::<_, Reduction>(SELECT_BY_ID)
            .bind(packet_id)
            .fetch_optional(&self.pool)
            .await
            .context(SqlSnafu)
    }

    async fn get_by_time_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Reduction>, RepositoryError> {
        sqlx::query_as::<_, Reduction>(SELECT_BY_RANGE)
            .bind(from)
            .bind(to)
            .fetch_all(&self.pool)
            .await
            .context(SqlSnafu)
    }

    async fn close(&self, deadline: Duration) -> Result<(), RepositoryError> {
        self.batcher.close(deadline).await?;

        // Release the pool exactly once, and only after a clean drain.
        if self
            .released
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.pool.close().await;
            debug!("postgres connection pool released");
        }
        Ok(())
    }
}

/// Flush destination executing one upsert per batch.
struct PgSink {
    pool: PgPool,
}

#[async_trait]
impl BatchSink for PgSink {
    async fn write_batch(&self, batch: &[Reduction]) -> Result<(), RepositoryError> {
        let sql = build_upsert(batch.len());
        let mut query = sqlx::query(&sql);
        for reduction in batch {
            query = query
                .bind(&reduction.packet_id)
                .bind(reduction.timestamp)
                .bind(reduction.max_value);
        }
        query.execute(&self.pool).await.context(SqlSnafu)?;
        Ok(())
    }
}

async fn ensure_schema(pool: &PgPool) -> Result<(), RepositoryError> {
    sqlx::query(CREATE_TABLE)
        .execute(pool)
        .await
        .context(SqlSnafu)?;
    sqlx::query(CREATE_TIMESTAMP_INDEX)
        .execute(pool)
        .await
        .context(SqlSnafu)?;
    Ok(())
}

/// Build the upsert statement for a batch of `rows` rows.
///
/// Three positional parameters per row; on a `packet_id` conflict the new
/// row wins (timestamp and max_value are overwritten).
fn build_upsert(rows: usize) -> String {
    let mut sql =
        String::from("INSERT INTO reductions (packet_id, timestamp, max_value) VALUES ");

    for i in 0..rows {
        if i > 0 {
            sql.push(',');
        }
        let base = i * 3;
        let _ = write!(sql, "(${},${},${})", base + 1, base + 2, base + 3);
    }

    sql.push_str(
        " ON CONFLICT (packet_id) DO UPDATE \
         SET timestamp = EXCLUDED.timestamp, max_value = EXCLUDED.max_value",
    );

    sql
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_upsert_single_row() {
        assert_eq!(
            build_upsert(1),
            "INSERT INTO reductions (packet_id, timestamp, max_value) VALUES ($1,$2,$3) \
             ON CONFLICT (packet_id) DO UPDATE \
             SET timestamp = EXCLUDED.timestamp, max_value = EXCLUDED.max_value"
        );
    }

    #[test]
    fn test_build_upsert_two_rows() {
        assert_eq!(
            build_upsert(2),
            "INSERT INTO reductions (packet_id, timestamp, max_value) VALUES \
             ($1,$2,$3),($4,$5,$6) \
             ON CONFLICT (packet_id) DO UPDATE \
             SET timestamp = EXCLUDED.timestamp, max_value = EXCLUDED.max_value"
        );
    }

    #[test]
    fn test_build_upsert_binds_three_parameters_per_row() {
        let sql = build_upsert(3);
        assert_eq!(sql.matches('$').count(), 9);
        assert!(sql.contains("($7,$8,$9)"));
    }
}
