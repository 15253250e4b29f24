//! Internal events for metrics emission.
//!
//! Each event struct represents a measurable occurrence in the pipeline.
//! Events implement the `InternalEvent` trait which records the
//! corresponding metric.

use metrics::{counter, histogram};
use std::time::Duration;
use tracing::trace;

/// Trait for internal events that can be emitted as metrics.
pub trait InternalEvent {
    /// Emit this event as a metric.
    fn emit(self);
}

/// Event emitted when the source delivers packets downstream.
pub struct PacketsEmitted {
    pub count: u64,
}

impl InternalEvent for PacketsEmitted {
    fn emit(self) {
        trace!(count = self.count, "Packets emitted");
        counter!("squall_packets_emitted_total").increment(self.count);
    }
}

/// Event emitted when workers publish reductions.
pub struct ReductionsComputed {
    pub count: u64,
}

impl InternalEvent for ReductionsComputed {
    fn emit(self) {
        trace!(count = self.count, "Reductions computed");
        counter!("squall_reductions_computed_total").increment(self.count);
    }
}

/// Event emitted when a batch flush reaches the durable store.
pub struct FlushCompleted {
    pub rows: usize,
    pub duration: Duration,
}

impl InternalEvent for FlushCompleted {
    fn emit(self) {
        trace!(
            rows = self.rows,
            duration_ms = self.duration.as_millis(),
            "Flush completed"
        );
        counter!("squall_flushes_total").increment(1);
        counter!("squall_reductions_persisted_total").increment(self.rows as u64);
        histogram!("squall_flush_duration_seconds").record(self.duration.as_secs_f64());
    }
}

/// Event emitted when a batch flush fails; the rows stay unpersisted.
pub struct FlushFailed {
    pub rows: usize,
}

impl InternalEvent for FlushFailed {
    fn emit(self) {
        trace!(rows = self.rows, "Flush failed");
        counter!("squall_flush_failures_total").increment(1);
    }
}

/// Event emitted when the lifecycle consumer fails to hand a reduction to
/// the repository.
pub struct SaveFailed {
    pub count: u64,
}

impl InternalEvent for SaveFailed {
    fn emit(self) {
        trace!(count = self.count, "Save failed");
        counter!("squall_save_errors_total").increment(self.count);
    }
}
