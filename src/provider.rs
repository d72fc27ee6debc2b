//! The event source provider port consumed by the projection driver.

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::envelope::EventEnvelope;
use crate::error::SourceError;
use crate::offset::TimestampOffset;
use crate::slice::SliceRange;

/// Stream of envelopes produced by [`SourceProvider::events_by_slices`].
pub type EnvelopeStream<E> = BoxStream<'static, Result<EventEnvelope<E>, SourceError>>;

/// Produces the envelopes a projection consumes.
///
/// Implementations typically wrap an event journal or a message log; the
/// driver never sees the transport. The stream is expected to stay open
/// indefinitely -- a clean end is treated as a source failure and the
/// driver reconnects through its restart policy.
///
/// # Replay
///
/// `trigger_replay` is an optional capability: the default implementation
/// reports it as unsupported. Providers that can re-deliver a range of an
/// entity's events should override both
/// [`supports_replay`](SourceProvider::supports_replay) and
/// [`trigger_replay`](SourceProvider::trigger_replay). Replay requests
/// are idempotent from the consumer's perspective: re-delivered
/// duplicates are dropped by validation.
#[async_trait]
pub trait SourceProvider: Send + Sync + 'static {
    /// The user event payload type carried in envelopes.
    type Event: Send + Sync + 'static;

    /// Open the envelope stream for a slice range.
    ///
    /// # Arguments
    ///
    /// * `stream_id` - Which logical entity stream to consume
    ///   (e.g. an entity type name).
    /// * `slice_range` - The contiguous slice sub-range this projection
    ///   instance owns.
    /// * `from_offsets` - Resume point per slice, as loaded from the
    ///   offset store. Slices absent from the map start from the
    ///   beginning.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError`] if the stream cannot be opened; individual
    /// stream elements may also fail with [`SourceError`].
    async fn events_by_slices(
        &self,
        stream_id: &str,
        slice_range: SliceRange,
        from_offsets: BTreeMap<u16, TimestampOffset>,
    ) -> Result<EnvelopeStream<Self::Event>, SourceError>;

    /// Load the full envelope for a position.
    ///
    /// Used by the driver when a backtracking envelope arrived as a
    /// placeholder without its payload.
    async fn load_envelope(
        &self,
        persistence_id: &str,
        seq_nr: u64,
    ) -> Result<EventEnvelope<Self::Event>, SourceError>;

    /// Whether this provider can replay a range of an entity's events.
    fn supports_replay(&self) -> bool {
        false
    }

    /// Ask the source to re-deliver events for `persistence_id` from
    /// `from_seq_nr` up to (at least) `triggered_by_seq_nr`.
    ///
    /// # Errors
    ///
    /// The default implementation always fails; providers advertising
    /// [`supports_replay`](SourceProvider::supports_replay) must
    /// override it.
    async fn trigger_replay(
        &self,
        persistence_id: &str,
        from_seq_nr: u64,
        triggered_by_seq_nr: u64,
    ) -> Result<(), SourceError> {
        let _ = (from_seq_nr, triggered_by_seq_nr);
        Err(SourceError::new(format!(
            "provider does not support replay (persistence_id: {persistence_id})"
        )))
    }
}
