//! Core domain types shared across pipeline stages.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// A unit of data emitted by the source and consumed by exactly one worker.
///
/// Packets are transient: they exist only between emission and reduction.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    /// Unique per emission.
    pub id: Uuid,
    /// UTC instant of emission, monotonic within one source.
    pub timestamp: DateTime<Utc>,
    /// Fixed-length payload of signed 64-bit values.
    pub payload: Vec<i64>,
}

/// The persisted summary of a packet: its maximum payload value.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct Reduction {
    /// Canonical lowercase hyphenated form of the packet id.
    pub packet_id: String,
    /// Copied from the originating packet.
    pub timestamp: DateTime<Utc>,
    /// `max(payload)`, or 0 for an empty payload.
    pub max_value: i64,
}

impl Reduction {
    /// Reduce a packet to its maximum payload value.
    pub fn from_packet(packet: &Packet) -> Self {
        Self {
            packet_id: packet.id.as_hyphenated().to_string(),
            timestamp: packet.timestamp,
            max_value: packet.payload.iter().copied().max().unwrap_or(0),
        }
    }
}
