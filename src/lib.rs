//! Resumable offset tracking for sliced, timestamp-ordered event-stream
//! projections.
//!
//! `offsetfold` is the offset-tracking core for stateless event-stream
//! consumers: it remembers, per projection and per slice, exactly which
//! `(persistence_id, seq_nr)` positions have been processed, so a
//! consumer can resume from a precise point across restarts, drop
//! redelivered duplicates, detect sequence gaps that need replay, and
//! run many parallel consumer shards ("slices") against one shared
//! offset store.
//!
//! # Key Types
//!
//! | Type | Role |
//! |------|------|
//! | [`ProjectionDriver`] | Pull-validate-dispatch-commit loop with restart backoff |
//! | [`SourceProvider`] | Port producing the envelope stream (your journal) |
//! | [`Handler`] / [`TransactionalHandler`] / [`GroupedHandler`] / [`FlowHandler`] | User side-effect ports per delivery strategy |
//! | [`OffsetStore`] | In-memory offset state plus persistence protocol |
//! | [`OffsetBackend`] | Port for the key-value persistence backend |
//! | [`ProjectionManagement`] | Pause, resume, read and rewrite offsets |
//!
//! # Quick Start
//!
//! ```no_run
//! use std::collections::BTreeMap;
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use offsetfold::{
//!     EnvelopeStream, EventEnvelope, Handler, HandlerError, InMemoryOffsetBackend,
//!     ProjectionDriver, ProjectionId, SliceRange, SourceError, SourceProvider,
//!     TimestampOffset,
//! };
//!
//! // 1. Expose your event journal as a source provider.
//! struct Journal;
//!
//! #[async_trait]
//! impl SourceProvider for Journal {
//!     type Event = String;
//!
//!     async fn events_by_slices(
//!         &self,
//!         _stream_id: &str,
//!         _slice_range: SliceRange,
//!         _from_offsets: BTreeMap<u16, TimestampOffset>,
//!     ) -> Result<EnvelopeStream<String>, SourceError> {
//!         // Open a stream from your journal, resuming per slice.
//!         Ok(Box::pin(futures::stream::pending()))
//!     }
//!
//!     async fn load_envelope(
//!         &self,
//!         persistence_id: &str,
//!         seq_nr: u64,
//!     ) -> Result<EventEnvelope<String>, SourceError> {
//!         Err(SourceError::new(format!("{persistence_id}/{seq_nr} not found")))
//!     }
//! }
//!
//! // 2. Write a handler for validated envelopes.
//! struct Printer;
//!
//! #[async_trait]
//! impl Handler<String> for Printer {
//!     async fn process(&mut self, envelope: &EventEnvelope<String>) -> Result<(), HandlerError> {
//!         println!("{} @ {}: {:?}", envelope.persistence_id, envelope.seq_nr, envelope.event);
//!         Ok(())
//!     }
//! }
//!
//! // 3. Run the projection.
//! # async fn run() {
//! let backend = Arc::new(InMemoryOffsetBackend::new());
//! let handle = ProjectionDriver::at_least_once(
//!     ProjectionId::for_slice_range("printer", SliceRange::full()),
//!     "orders",
//!     SliceRange::full(),
//!     Arc::new(Journal),
//!     backend,
//!     Box::new(Printer),
//! )
//! .run();
//! // ... later:
//! handle.stop().await.expect("projection failed");
//! # }
//! ```
//!
//! # Delivery semantics
//!
//! The driver factory picks the offset strategy: at-least-once (handler
//! first, offsets batched afterwards), exactly-once (handler returns
//! write items committed atomically with the offset), at-most-once
//! (offset first, a failed handler loses the event), grouped (group
//! offsets commit together), and an at-least-once flow with explicit
//! handler parallelism.

mod backend;
mod config;
mod driver;
mod envelope;
mod error;
mod handler;
mod management;
mod observer;
mod offset;
mod provider;
mod slice;
mod store;

pub use backend::{InMemoryOffsetBackend, ManagementState, OffsetBackend, WriteItem};
pub use config::{
    AtLeastOnceConfig, GroupedConfig, ManagementConfig, OffsetStoreConfig, ProjectionConfig,
    RestartBackoffConfig, TimeToLiveSettings,
};
pub use driver::{ProjectionDriver, ProjectionHandle, ProjectionId};
pub use envelope::{EnvelopeOrigin, EventEnvelope};
pub use error::{ConfigError, HandlerError, OffsetStoreError, ProjectionError, SourceError};
pub use handler::{FlowHandler, GroupedHandler, Handler, RecoveryStrategy, TransactionalHandler};
pub use management::ProjectionManagement;
pub use observer::{LogObserver, NoopObserver, ProgressEvent, StatusObserver};
pub use offset::{OffsetState, Record, TimestampOffset};
pub use provider::{EnvelopeStream, SourceProvider};
pub use slice::{slice_for_persistence_id, SliceRange, NUMBER_OF_SLICES};
pub use store::{OffsetStore, Validation};
