//! Worker pool computing per-packet maxima.
//!
//! `N` workers race on a shared input of packets; each packet is reduced by
//! exactly one worker and published on a bounded result channel. The result
//! channel closes exactly once, when the last worker exits.
//!
//! # Cancellation & drain
//!
//! Cancellation stops workers from idling on the input, but a worker never
//! abandons queued work: after the token fires it keeps consuming until the
//! source closes the input. If the source emitted P packets before closing,
//! the pool publishes exactly P reductions before the result channel closes.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::emit;
use crate::error::PoolError;
use crate::metrics::events::ReductionsComputed;
use crate::types::{Packet, Reduction};

type SharedInput = Arc<Mutex<mpsc::Receiver<Packet>>>;

/// Pool of concurrent packet reducers.
pub struct WorkerPool {
    worker_count: usize,
    result_tx: Option<mpsc::Sender<Reduction>>,
    result_rx: Option<mpsc::Receiver<Reduction>>,
    done_tx: Option<watch::Sender<bool>>,
    done_rx: watch::Receiver<bool>,
}

impl WorkerPool {
    /// Create a pool of `worker_count` workers; values `<= 0` are coerced to 1.
    ///
    /// The result channel is bounded to the worker count.
    pub fn new(worker_count: i64) -> Self {
        let worker_count = if worker_count <= 0 {
            1
        } else {
            worker_count as usize
        };

        let (result_tx, result_rx) = mpsc::channel(worker_count);
        let (done_tx, done_rx) = watch::channel(false);

        Self {
            worker_count,
            result_tx: Some(result_tx),
            result_rx: Some(result_rx),
            done_tx: Some(done_tx),
            done_rx,
        }
    }

    /// Spawn the workers over `input`. Idempotent: only the first call
    /// starts anything; later calls are ignored.
    pub fn start(&mut self, cancel: CancellationToken, input: mpsc::Receiver<Packet>) {
        let Some(result_tx) = self.result_tx.take() else {
            return;
        };
        let Some(done_tx) = self.done_tx.take() else {
            return;
        };

        let input: SharedInput = Arc::new(Mutex::new(input));

        let handles: Vec<_> = (0..self.worker_count)
            .map(|id| {
                tokio::spawn(worker(
                    id,
                    input.clone(),
                    result_tx.clone(),
                    cancel.clone(),
                ))
            })
            .collect();

        // The workers hold the only senders; when the last one exits the
        // result channel closes and the completion latch flips.
        tokio::spawn(async move {
            drop(result_tx);
            for handle in handles {
                let _ = handle.await;
            }
            let _ = done_tx.send(true);
            debug!("all workers returned");
        });
    }

    /// Take the result receiver. Yields `Some` exactly once.
    pub fn results(&mut self) -> Option<mpsc::Receiver<Reduction>> {
        self.result_rx.take()
    }

    /// Wait until every worker has returned, or fail once `deadline` elapses.
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), PoolError> {
        let mut done = self.done_rx.clone();
        match time::timeout(deadline, done.wait_for(|finished| *finished)).await {
            Ok(_) => Ok(()),
            Err(_) => Err(PoolError::ShutdownTimeout { deadline }),
        }
    }
}

async fn worker(
    id: usize,
    input: SharedInput,
    results: mpsc::Sender<Reduction>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            maybe_packet = recv_next(&input) => {
                match maybe_packet {
                    Some(packet) => {
                        if !publish(&packet, &results).await {
                            return;
                        }
                    }
                    None => return,
                }
            }
            _ = cancel.cancelled() => {
                // Stop idling, but never abandon queued packets: consume
                // until the source closes the input.
                while let Some(packet) = recv_next(&input).await {
                    if !publish(&packet, &results).await {
                        return;
                    }
                }
                debug!(worker = id, "input drained after cancellation");
                return;
            }
        }
    }
}

async fn recv_next(input: &SharedInput) -> Option<Packet> {
    input.lock().await.recv().await
}

/// Reduce a packet and deliver the result. Returns false when the result
/// channel is gone and the worker should stop.
async fn publish(packet: &Packet, results: &mpsc::Sender<Reduction>) -> bool {
    let reduction = Reduction::from_packet(packet);
    if results.send(reduction).await.is_err() {
        return false;
    }
    emit!(ReductionsComputed { count: 1 });
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::HashMap;
    use tokio::time::timeout;
    use uuid::Uuid;

    fn packet(payload: Vec<i64>) -> Packet {
        Packet {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            payload,
        }
    }

    async fn collect(mut rx: mpsc::Receiver<Reduction>) -> Vec<Reduction> {
        let mut out = Vec::new();
        while let Some(r) = rx.recv().await {
            out.push(r);
        }
        out
    }

    #[test]
    fn test_worker_count_coercion() {
        assert_eq!(WorkerPool::new(0).worker_count, 1);
        assert_eq!(WorkerPool::new(-3).worker_count, 1);
        assert_eq!(WorkerPool::new(4).worker_count, 4);
    }

    #[tokio::test]
    async fn test_max_correctness() {
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(8);
        let mut pool = WorkerPool::new(2);

        let packets = vec![
            packet(vec![1, 5, 3, 4]),
            packet(vec![-10, -5, -7]),
            packet(vec![42]),
        ];
        let expected: HashMap<String, i64> = packets
            .iter()
            .map(|p| {
                (
                    p.id.as_hyphenated().to_string(),
                    p.payload.iter().copied().max().unwrap(),
                )
            })
            .collect();

        pool.start(cancel, rx);
        let results = pool.results().unwrap();

        for p in packets {
            tx.send(p).await.unwrap();
        }
        drop(tx);

        let reductions = timeout(Duration::from_secs(5), collect(results))
            .await
            .expect("pool did not close its result channel");
        assert_eq!(reductions.len(), 3);
        for r in &reductions {
            assert_eq!(expected[&r.packet_id], r.max_value);
        }

        pool.shutdown(Duration::from_secs(5)).await.unwrap();
    }

    /// Cancellation must not lose queued packets: 200 packets through a
    /// capacity-16 buffer, cancelled a quarter of the way in, still yield
    /// exactly 200 reductions before the result channel closes.
    #[tokio::test]
    async fn test_cancellation_drains_all_queued_packets() {
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(16);
        let mut pool = WorkerPool::new(2);

        pool.start(cancel.clone(), rx);
        let mut results = pool.results().unwrap();

        let producer = tokio::spawn(async move {
            for _ in 0..200 {
                if tx.send(packet(vec![1, 2, 3])).await.is_err() {
                    return;
                }
            }
            // tx dropped here: the input closes once all 200 are delivered.
        });

        let mut received = 0usize;
        while let Some(_r) = timeout(Duration::from_secs(5), results.recv())
            .await
            .expect("timed out draining results")
        {
            received += 1;
            if received == 50 {
                cancel.cancel();
            }
        }

        assert_eq!(received, 200, "pool must emit one reduction per packet");
        producer.await.unwrap();
        pool.shutdown(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(8);
        let (_tx2, rx2) = mpsc::channel::<Packet>(8);
        let mut pool = WorkerPool::new(2);

        pool.start(cancel.clone(), rx);
        // Second start must be a no-op; its input is discarded.
        pool.start(cancel.clone(), rx2);

        let results = pool.results().unwrap();
        assert!(pool.results().is_none());

        for _ in 0..5 {
            tx.send(packet(vec![7])).await.unwrap();
        }
        drop(tx);

        let reductions = timeout(Duration::from_secs(5), collect(results))
            .await
            .expect("result channel did not close");
        assert_eq!(reductions.len(), 5);

        pool.shutdown(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_deadline_exceeded() {
        let cancel = CancellationToken::new();
        let (_tx, rx) = mpsc::channel(8);
        let mut pool = WorkerPool::new(1);

        // Input never closes and cancel never fires: workers cannot exit.
        pool.start(cancel, rx);

        let err = pool.shutdown(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, PoolError::ShutdownTimeout { .. }));
    }

    #[tokio::test]
    async fn test_empty_payload_reduces_to_zero() {
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(2);
        let mut pool = WorkerPool::new(1);

        pool.start(cancel, rx);
        let results = pool.results().unwrap();

        tx.send(packet(vec![])).await.unwrap();
        drop(tx);

        let reductions = timeout(Duration::from_secs(5), collect(results))
            .await
            .unwrap();
        assert_eq!(reductions.len(), 1);
        assert_eq!(reductions[0].max_value, 0);
    }
}
