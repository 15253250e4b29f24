//! Timer-driven random packet source.
//!
//! Emits one [`Packet`] per interval tick onto a bounded channel until the
//! cancellation token fires. Backpressure from a full channel blocks the
//! emitter; cancellation is observed both on the timer and on delivery, so
//! the output closes promptly either way.

use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::emit;
use crate::metrics::events::PacketsEmitted;
use crate::types::Packet;

/// Source settings, normalized on construction.
#[derive(Debug, Clone)]
pub struct SourceConfig {
    /// Payload elements per packet.
    pub payload_len: i64,
    /// Emission cadence.
    pub interval: Duration,
    /// Capacity of the output channel towards the worker pool.
    pub buffer_size: i64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            payload_len: 1,
            interval: Duration::from_millis(1),
            buffer_size: 1024,
        }
    }
}

impl SourceConfig {
    /// Coerce out-of-range settings onto safe minimums.
    fn normalized(mut self) -> Self {
        if self.payload_len <= 0 {
            self.payload_len = 1;
        }
        if self.interval.is_zero() {
            self.interval = Duration::from_millis(1);
        }
        if self.buffer_size <= 0 {
            self.buffer_size = 1024;
        }
        self
    }
}

/// Packet source backed by a pseudo-random generator seeded at construction.
pub struct RandomSource {
    cfg: SourceConfig,
    rng: StdRng,
}

impl RandomSource {
    pub fn new(cfg: SourceConfig) -> Self {
        Self {
            cfg: cfg.normalized(),
            rng: StdRng::from_os_rng(),
        }
    }

    /// Start emitting packets until `cancel` fires.
    ///
    /// Consumes the source: the returned receiver is a finite,
    /// non-restartable sequence. The channel closes within one interval of
    /// cancellation, whether the emitter is waiting on the timer or blocked
    /// on a full channel.
    pub fn start(mut self, cancel: CancellationToken) -> mpsc::Receiver<Packet> {
        let (tx, rx) = mpsc::channel(self.cfg.buffer_size as usize);

        tokio::spawn(async move {
            let start = time::Instant::now() + self.cfg.interval;
            let mut ticker = time::interval_at(start, self.cfg.interval);
            // A full output channel must not cause a catch-up burst.
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let packet = Packet {
                            id: Uuid::new_v4(),
                            timestamp: Utc::now(),
                            payload: self.generate_payload(),
                        };

                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            sent = tx.send(packet) => {
                                if sent.is_err() {
                                    break;
                                }
                                emit!(PacketsEmitted { count: 1 });
                            }
                        }
                    }
                }
            }

            debug!("packet source stopped");
        });

        rx
    }

    fn generate_payload(&mut self) -> Vec<i64> {
        (0..self.cfg.payload_len).map(|_| self.rng.random()).collect()
    }
}
