//! Error types for squall using snafu.
//!
//! This module defines structured error types with context selectors for
//! all error conditions in the codebase.

use snafu::prelude::*;
use std::time::Duration;

// ============ Config Errors ============

/// Errors that can occur while loading configuration from the environment.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    /// An environment variable held a malformed integer.
    #[snafu(display("Invalid integer in {key}"))]
    InvalidInt {
        key: &'static str,
        source: std::num::ParseIntError,
    },

    /// An environment variable held a malformed duration.
    #[snafu(display("Invalid duration in {key}"))]
    InvalidDuration {
        key: &'static str,
        source: humantime::DurationError,
    },

    /// The postgres driver was selected without a connection string.
    #[snafu(display("DB_DSN is required for the postgres driver"))]
    MissingDsn,

    /// The configured driver is not recognised.
    #[snafu(display("Unsupported repository driver: {driver}"))]
    UnsupportedDriver { driver: String },
}

// ============ Worker Pool Errors ============

/// Errors reported by the worker pool.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum PoolError {
    /// Workers did not all return within the shutdown deadline.
    #[snafu(display("Worker pool shutdown deadline exceeded after {deadline:?}"))]
    ShutdownTimeout { deadline: Duration },
}

// ============ Repository Errors ============

/// Errors surfaced by repository implementations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum RepositoryError {
    /// The repository was closed before or during the call.
    ///
    /// A `save` racing `close` may observe either this or `Cancelled`;
    /// callers must treat the two as equivalent terminal outcomes.
    #[snafu(display("Repository is closed"))]
    Closed,

    /// The per-call cancellation token fired while blocked on the intake.
    #[snafu(display("Save cancelled while waiting for intake capacity"))]
    Cancelled,

    /// Drain did not complete within the close deadline.
    #[snafu(display("Repository close deadline exceeded after {deadline:?}"))]
    CloseTimeout { deadline: Duration },

    /// The final flush was abandoned at the close deadline; these rows are lost.
    #[snafu(display("Final flush abandoned with {rows} rows unflushed"))]
    FlushAbandoned { rows: usize },

    /// Failed to establish the database connection pool.
    #[snafu(display("Failed to connect to the database"))]
    Connect { source: sqlx::Error },

    /// An SQL statement failed.
    #[snafu(display("Database operation failed"))]
    Sql { source: sqlx::Error },
}

// ============ Validation Errors ============

/// Request validation failures on the query surface.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ValidationError {
    /// The packet id is not a canonical lowercase hyphenated UUID.
    #[snafu(display("Invalid packet id: {packet_id}"))]
    InvalidPacketId { packet_id: String },

    /// The requested range is empty or inverted.
    #[snafu(display("Invalid time range: end must be after start"))]
    InvalidRange,
}

// ============ Query Errors ============

/// Errors returned by the read API consumed by external transports.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum QueryError {
    /// The request failed validation.
    #[snafu(display("Validation failed"))]
    Validation { source: ValidationError },

    /// The underlying repository read failed.
    #[snafu(display("Repository read failed"))]
    Repository { source: RepositoryError },
}

impl QueryError {
    /// Check if this error maps to a bad-request response rather than an
    /// internal failure.
    pub fn is_bad_request(&self) -> bool {
        matches!(self, QueryError::Validation { .. })
    }
}

// ============ Pipeline Error (top-level) ============

/// Top-level pipeline errors that aggregate all error types.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum PipelineError {
    /// Configuration error.
    #[snafu(display("Configuration error"))]
    Config { source: ConfigError },

    /// Repository error.
    #[snafu(display("Repository error"))]
    Storage { source: RepositoryError },

    /// Worker pool error.
    #[snafu(display("Worker pool error"))]
    Pool { source: PoolError },

    /// Task join error.
    #[snafu(display("Task join error"))]
    TaskJoin { source: tokio::task::JoinError },

    /// The result consumer did not finish draining within the grace period.
    #[snafu(display("Result drain did not complete within {deadline:?}"))]
    DrainTimeout { deadline: Duration },
}
