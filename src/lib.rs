//! squall: a streaming max-aggregation service.
//!
//! A timer-driven source emits packets of random 64-bit integers, a worker
//! pool reduces each packet to its maximum, and a batching repository
//! persists the reductions to Postgres with idempotent upserts, serving
//! point and range reads.
//!
//! # Example
//!
//! ```ignore
//! use squall::{Config, run_pipeline, error::PipelineError};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), PipelineError> {
//!     let config = Config::from_env()?;
//!     let stats = run_pipeline(config).await?;
//!     println!("Persisted {} reductions", stats.reductions_persisted);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod metrics;
pub mod pipeline;
pub mod pool;
pub mod query;
pub mod repository;
pub mod source;
pub mod types;

// Re-export main types
pub use config::Config;
pub use pipeline::{RunStats, run_pipeline};
pub use repository::{Repository, RepositoryRef};
pub use types::{Packet, Reduction};
