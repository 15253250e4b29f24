//! In-memory repository stub.
//!
//! Serves the `redis` and `clickhouse` driver selections and the test
//! suites. Writes are synchronous (no intake, no flusher) but keep the same
//! contract: at most one row per packet id, last writer wins, half-open
//! range reads in ascending timestamp order. Iteration order of the backing
//! map is meaningless, so range reads sort explicitly.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::RepositoryError;
use crate::repository::Repository;
use crate::types::Reduction;

/// Repository keeping all rows in process memory.
#[derive(Default)]
pub struct InMemoryRepository {
    rows: RwLock<HashMap<String, Reduction>>,
    closed: AtomicBool,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows currently stored.
    pub fn len(&self) -> usize {
        self.rows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn save(
        &self,
        _cancel: &CancellationToken,
        batch: &[Reduction],
    ) -> Result<(), RepositoryError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RepositoryError::Closed);
        }

        let mut rows = self.rows.write().unwrap_or_else(PoisonError::into_inner);
        for reduction in batch {
            rows.insert(reduction.packet_id.clone(), reduction.clone());
        }
        Ok(())
    }

    async fn get_by_id(&self, packet_id: &str) -> Result<Option<Reduction>, RepositoryError> {
        let rows = self.rows.read().unwrap_or_else(PoisonError::into_inner);
        Ok(rows.get(packet_id).cloned())
    }

    async fn get_by_time_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Reduction>, RepositoryError> {
        let rows = self.rows.read().unwrap_or_else(PoisonError::into_inner);
        let mut results: Vec<Reduction> = rows
            .values()
            .filter(|r| r.timestamp >= from && r.timestamp < to)
            .cloned()
            .collect();
        results.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.packet_id.cmp(&b.packet_id))
        });
        Ok(results)
    }

    async fn close(&self, _deadline: Duration) -> Result<(), RepositoryError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn reduction(id: &str, timestamp: DateTime<Utc>, max_value: i64) -> Reduction {
        Reduction {
            packet_id: id.to_string(),
            timestamp,
            max_value,
        }
    }

    #[tokio::test]
    async fn test_round_trip() {
        let repo = InMemoryRepository::new();
        let cancel = CancellationToken::new();
        let r = reduction("p-1", Utc::now(), 42);

        repo.save(&cancel, std::slice::from_ref(&r)).await.unwrap();
        assert_eq!(repo.get_by_id("p-1").await.unwrap(), Some(r));
        assert_eq!(repo.get_by_id("p-2").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_duplicate_saves_are_idempotent() {
        let repo = InMemoryRepository::new();
        let cancel = CancellationToken::new();
        let r = reduction("p-1", Utc::now(), 10);

        repo.save(&cancel, &[r.clone(), r.clone(), r.clone()])
            .await
            .unwrap();
        assert_eq!(repo.len(), 1);

        let again = InMemoryRepository::new();
        again.save(&cancel, std::slice::from_ref(&r)).await.unwrap();
        assert_eq!(
            repo.get_by_id("p-1").await.unwrap(),
            again.get_by_id("p-1").await.unwrap()
        );
    }

    #[tokio::test]
    async fn test_conflicting_write_is_last_writer_wins() {
        let repo = InMemoryRepository::new();
        let cancel = CancellationToken::new();
        let t1 = Utc::now();
        let t2 = t1 + TimeDelta::seconds(1);

        repo.save(&cancel, &[reduction("x", t1, 10)]).await.unwrap();
        repo.save(&cancel, &[reduction("x", t2, 20)]).await.unwrap();

        let row = repo.get_by_id("x").await.unwrap().unwrap();
        assert_eq!(row.timestamp, t2);
        assert_eq!(row.max_value, 20);
        assert_eq!(repo.len(), 1);
    }

    #[tokio::test]
    async fn test_range_is_half_open_and_sorted() {
        let repo = InMemoryRepository::new();
        let cancel = CancellationToken::new();
        let base = Utc::now();

        // Inserted out of order on purpose.
        repo.save(
            &cancel,
            &[
                reduction("c", base + TimeDelta::seconds(2), 3),
                reduction("a", base, 1),
                reduction("b", base + TimeDelta::seconds(1), 2),
            ],
        )
        .await
        .unwrap();

        let results = repo
            .get_by_time_range(base, base + TimeDelta::seconds(2))
            .await
            .unwrap();
        let ids: Vec<_> = results.iter().map(|r| r.packet_id.as_str()).collect();
        // "c" sits exactly on the exclusive upper bound.
        assert_eq!(ids, vec!["a", "b"]);

        let empty = repo
            .get_by_time_range(base + TimeDelta::seconds(10), base + TimeDelta::seconds(20))
            .await
            .unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn test_save_after_close_fails() {
        let repo = InMemoryRepository::new();
        let cancel = CancellationToken::new();

        repo.close(Duration::from_secs(1)).await.unwrap();
        repo.close(Duration::from_secs(1)).await.unwrap();

        let err = repo
            .save(&cancel, &[reduction("p", Utc::now(), 1)])
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Closed));

        // Reads still work after close.
        assert_eq!(repo.get_by_id("p").await.unwrap(), None);
    }
}
