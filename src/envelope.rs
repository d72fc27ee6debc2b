//! The event envelope: one delivery unit from the source provider.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::slice::slice_for_persistence_id;

/// Which delivery channel produced an envelope.
///
/// The channel matters for gap classification: the live tail may simply
/// not have delivered intermediate events yet, while the backtracking
/// channel is the slower catch-up pass -- a gap it reports means the
/// events are genuinely missing and must be replayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvelopeOrigin {
    /// The authoritative live event stream.
    Live,
    /// The slower catch-up stream. Envelopes from it may omit the event
    /// payload and carry only position information.
    Backtracking,
    /// A low-latency pub-sub shortcut ahead of the durable stream.
    PubSub,
}

/// One delivery unit: an event (or placeholder) for a single entity at a
/// specific position in its stream.
///
/// `event` is `None` when the envelope was delivered through the
/// backtracking channel as a placeholder, or when the producer filtered
/// the payload out; in the backtracking case the driver lazily loads the
/// full event before invoking the handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope<E> {
    /// Opaque id of the logical entity this event belongs to.
    pub persistence_id: String,
    /// Monotonically increasing per-entity sequence number, starting at 1.
    pub seq_nr: u64,
    /// The event's commit timestamp at the source.
    pub timestamp: DateTime<Utc>,
    /// The event payload, if delivered.
    pub event: Option<E>,
    /// Which channel delivered this envelope.
    pub origin: EnvelopeOrigin,
    /// Producer stripped the payload; the offset must still advance.
    pub filtered: bool,
}

impl<E> EventEnvelope<E> {
    /// Create a live envelope carrying an event payload.
    pub fn new(
        persistence_id: impl Into<String>,
        seq_nr: u64,
        timestamp: DateTime<Utc>,
        event: E,
    ) -> Self {
        Self {
            persistence_id: persistence_id.into(),
            seq_nr,
            timestamp,
            event: Some(event),
            origin: EnvelopeOrigin::Live,
            filtered: false,
        }
    }

    /// Create a backtracking placeholder envelope (no payload).
    pub fn backtracking(
        persistence_id: impl Into<String>,
        seq_nr: u64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            persistence_id: persistence_id.into(),
            seq_nr,
            timestamp,
            event: None,
            origin: EnvelopeOrigin::Backtracking,
            filtered: false,
        }
    }

    /// Override the delivery origin.
    pub fn with_origin(mut self, origin: EnvelopeOrigin) -> Self {
        self.origin = origin;
        self
    }

    /// Mark the envelope as filtered (payload stripped by the producer).
    pub fn with_filtered(mut self, filtered: bool) -> Self {
        self.filtered = filtered;
        self
    }

    /// The slice this envelope's entity maps to.
    pub fn slice(&self) -> u16 {
        slice_for_persistence_id(&self.persistence_id)
    }

    /// Whether the driver must lazily load the full event before handing
    /// the envelope to the user handler.
    pub(crate) fn needs_load(&self) -> bool {
        self.origin == EnvelopeOrigin::Backtracking && self.event.is_none() && !self.filtered
    }
}
