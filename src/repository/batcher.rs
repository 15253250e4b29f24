//! Batching engine behind the SQL repository.
//!
//! Decouples `save` callers from store latency: items land on a bounded
//! intake and a single flusher task writes them out in batches, either when
//! the buffer reaches `batch_size` or when the flush timer fires.
//!
//! # State machine
//!
//! `OPEN → CLOSING → CLOSED`. Exactly one caller performs the
//! `OPEN → CLOSING` transition (CAS guard); it stores the close deadline and
//! drops the intake sender. The flusher drains whatever is still queued,
//! writes a final batch bounded by that deadline, and exits (`CLOSED`).
//!
//! # Error carry
//!
//! Flush failures never stop the flusher. The first failure since the last
//! error returned from `save` is latched in a one-slot field; the next
//! `save` call returns it and clears the slot. A caller that skips a `save`
//! call can therefore miss an error; this is the documented contract.

use async_trait::async_trait;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::emit;
use crate::error::RepositoryError;
use crate::metrics::events::{FlushCompleted, FlushFailed};
use crate::types::Reduction;

const DEFAULT_BATCH_SIZE: usize = 100;
const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(250);

/// Destination of a flush. The SQL adapter is the production implementation;
/// tests substitute a recording sink.
#[async_trait]
pub trait BatchSink: Send + Sync + 'static {
    /// Persist one batch. Must be atomic per call: either the whole batch
    /// lands or the error describes the whole batch.
    async fn write_batch(&self, batch: &[Reduction]) -> Result<(), RepositoryError>;
}

/// Tuning knobs for the batching engine.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Maximum rows per flush.
    pub batch_size: usize,
    /// Maximum age of the oldest buffered row before a flush is forced.
    /// Zero disables the timer.
    pub flush_interval: Duration,
    /// Intake capacity; floored to `batch_size`.
    pub queue_size: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            queue_size: DEFAULT_BATCH_SIZE * 4,
        }
    }
}

impl BatchConfig {
    fn normalized(mut self) -> Self {
        if self.batch_size == 0 {
            self.batch_size = DEFAULT_BATCH_SIZE;
        }
        if self.queue_size < self.batch_size {
            self.queue_size = self.batch_size;
        }
        self
    }
}

struct Shared {
    last_error: Mutex<Option<RepositoryError>>,
    close_deadline: Mutex<Option<Instant>>,
}

impl Shared {
    /// Latch `err` unless an earlier one is still unreturned.
    fn latch_error(&self, err: RepositoryError) {
        let mut slot = self
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    fn take_error(&self) -> Option<RepositoryError> {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn set_close_deadline(&self, deadline: Instant) {
        let mut slot = self
            .close_deadline
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(deadline);
        }
    }

    fn close_deadline(&self) -> Option<Instant> {
        *self
            .close_deadline
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle to the intake and the background flusher.
pub struct Batcher {
    intake: Mutex<Option<mpsc::Sender<Reduction>>>,
    shared: Arc<Shared>,
    closing: AtomicBool,
    done_rx: watch::Receiver<bool>,
}

impl Batcher {
    /// Start the flusher over `sink` and return the intake handle.
    pub fn spawn<S: BatchSink>(sink: S, cfg: BatchConfig) -> Self {
        let cfg = cfg.normalized();
        let (tx, rx) = mpsc::channel(cfg.queue_size);
        let (done_tx, done_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            last_error: Mutex::new(None),
            close_deadline: Mutex::new(None),
        });

        tokio::spawn(run_flusher(rx, sink, cfg, shared.clone(), done_tx));

        Self {
            intake: Mutex::new(Some(tx)),
            shared,
            closing: AtomicBool::new(false),
            done_rx,
        }
    }

    /// Enqueue reductions for asynchronous persistence.
    ///
    /// Blocks only while the intake is full, honouring `cancel`. Every call,
    /// including one with an empty batch, returns the first unreturned
    /// background flush error observed so far and clears it.
    pub async fn save(
        &self,
        cancel: &CancellationToken,
        batch: &[Reduction],
    ) -> Result<(), RepositoryError> {
        if self.closing.load(Ordering::Acquire) {
            return Err(RepositoryError::Closed);
        }
        if let Some(err) = self.shared.take_error() {
            return Err(err);
        }
        if batch.is_empty() {
            return Ok(());
        }

        // Clone the sender out so no lock is held across an await point.
        let tx = {
            let guard = self.intake.lock().unwrap_or_else(PoisonError::into_inner);
            match guard.as_ref() {
                Some(tx) => tx.clone(),
                None => return Err(RepositoryError::Closed),
            }
        };

        for reduction in batch {
            tokio::select! {
                _ = cancel.cancelled() => return Err(RepositoryError::Cancelled),
                sent = tx.send(reduction.clone()) => {
                    if sent.is_err() {
                        return Err(RepositoryError::Closed);
                    }
                }
            }
        }

        match self.shared.take_error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Close the intake and wait for the flusher to drain, bounded by
    /// `deadline`. Idempotent; concurrent callers all wait on the same
    /// completion latch.
    pub async fn close(&self, deadline: Duration) -> Result<(), RepositoryError> {
        if self
            .closing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.shared.set_close_deadline(Instant::now() + deadline);
            // Dropping the sole sender closes the intake; the flusher exits
            // once it has drained what is already queued.
            let tx = self
                .intake
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            drop(tx);
        }

        let mut done = self.done_rx.clone();
        match time::timeout(deadline, done.wait_for(|finished| *finished)).await {
            Ok(_) => Ok(()),
            Err(_) => Err(RepositoryError::CloseTimeout { deadline }),
        }
    }
}

async fn run_flusher<S: BatchSink>(
    mut rx: mpsc::Receiver<Reduction>,
    sink: S,
    cfg: BatchConfig,
    shared: Arc<Shared>,
    done_tx: watch::Sender<bool>,
) {
    let mut buffer: Vec<Reduction> = Vec::with_capacity(cfg.batch_size);

    let mut ticker = if cfg.flush_interval.is_zero() {
        None
    } else {
        let mut t = time::interval_at(
            Instant::now() + cfg.flush_interval,
            cfg.flush_interval,
        );
        t.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Some(t)
    };

    loop {
        tokio::select! {
            maybe_item = rx.recv() => {
                match maybe_item {
                    Some(item) => {
                        buffer.push(item);
                        if buffer.len() >= cfg.batch_size {
                            flush(&sink, &mut buffer, &shared, None).await;
                        }
                    }
                    None => break,
                }
            }
            _ = tick(ticker.as_mut()) => {
                flush(&sink, &mut buffer, &shared, None).await;
            }
        }
    }

    // Intake closed: write whatever is left, bounded by the close deadline.
    let deadline = shared.close_deadline();
    flush(&sink, &mut buffer, &shared, deadline).await;

    let _ = done_tx.send(true);
    debug!("repository flusher exited");
}

/// Resolves on the next timer tick, or never when the timer is disabled.
async fn tick(ticker: Option<&mut time::Interval>) {
    match ticker {
        Some(t) => {
            t.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn flush<S: BatchSink>(
    sink: &S,
    buffer: &mut Vec<Reduction>,
    shared: &Shared,
    deadline: Option<Instant>,
) {
    if buffer.is_empty() {
        return;
    }

    let started = std::time::Instant::now();
    let result = match deadline {
        None => sink.write_batch(buffer).await,
        Some(at) => match time::timeout_at(at, sink.write_batch(buffer)).await {
            Ok(result) => result,
            Err(_) => Err(RepositoryError::FlushAbandoned { rows: buffer.len() }),
        },
    };

    match result {
        Ok(()) => {
            emit!(FlushCompleted {
                rows: buffer.len(),
                duration: started.elapsed(),
            });
        }
        Err(err) => {
            warn!(rows = buffer.len(), error = %err, "batch flush failed");
            emit!(FlushFailed { rows: buffer.len() });
            shared.latch_error(err);
        }
    }

    buffer.clear();
}
