//! The offset store: in-memory state plus persistence protocol.
//!
//! One [`OffsetStore`] belongs to one projection instance and is owned by
//! its driver task; every mutation happens between the driver's
//! suspension points, so no internal locking is needed. The store wires
//! together the [`OffsetState`] machine, the in-flight set of accepted
//! but not yet committed envelopes, the persistence backend, and the
//! eviction policy that bounds memory.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::stream::{self, StreamExt, TryStreamExt};

use crate::backend::{ManagementState, OffsetBackend, WriteItem};
use crate::config::{OffsetStoreConfig, ProjectionConfig};
use crate::envelope::{EnvelopeOrigin, EventEnvelope};
use crate::error::OffsetStoreError;
use crate::offset::{OffsetState, Record, TimestampOffset};
use crate::slice::SliceRange;

/// Bounded retries for transient persistence failures. Offsets are
/// correctness-critical: once the budget is spent the error propagates
/// and the driver restarts.
const WRITE_RETRIES: u32 = 3;
const WRITE_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Classification of an incoming envelope against the offset state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validation {
    /// In sequence; process and commit.
    Accepted,
    /// Already observed; drop silently.
    Duplicate,
    /// A sequence gap seen by the live (or pub-sub) stream. Transient:
    /// the intermediate events may simply not have been delivered yet.
    RejectedSeqNr,
    /// A sequence gap surfaced by the slower backtracking stream. The
    /// missing events will not arrive on their own; an explicit replay
    /// is required.
    RejectedBacktrackingSeqNr,
}

/// Offset state and persistence for one projection instance.
pub struct OffsetStore {
    projection_name: String,
    slice_range: SliceRange,
    backend: Arc<dyn OffsetBackend>,
    config: OffsetStoreConfig,
    ttl: Option<Duration>,
    state: OffsetState,
    /// Accepted envelopes whose offsets are not yet durable, by pid.
    inflight: HashMap<String, u64>,
    last_eviction: Option<Instant>,
}

impl OffsetStore {
    /// Create a store for a projection instance.
    ///
    /// The offset TTL is resolved from the config's
    /// [`TimeToLiveSettings`](crate::config::TimeToLiveSettings) using
    /// the projection name.
    pub fn new(
        projection_name: impl Into<String>,
        slice_range: SliceRange,
        backend: Arc<dyn OffsetBackend>,
        config: &ProjectionConfig,
    ) -> Self {
        let projection_name = projection_name.into();
        let ttl = config.time_to_live.offset_ttl_for(&projection_name);
        Self {
            projection_name,
            slice_range,
            backend,
            config: config.offset_store.clone(),
            ttl,
            state: OffsetState::new(),
            inflight: HashMap::new(),
            last_eviction: None,
        }
    }

    /// The projection this store belongs to.
    pub fn projection_name(&self) -> &str {
        &self.projection_name
    }

    /// The slice sub-range this store covers.
    pub fn slice_range(&self) -> SliceRange {
        self.slice_range
    }

    /// Replace the in-memory state with what the backend holds.
    ///
    /// Reads every slice in the range, up to
    /// `offset_slice_read_parallelism` slices concurrently, keeps the
    /// records within `time_window` of each slice's latest timestamp,
    /// and merges them into a fresh state. In-flight tracking is reset:
    /// anything not persisted before a restart will be redelivered.
    ///
    /// # Returns
    ///
    /// The number of records loaded.
    ///
    /// # Errors
    ///
    /// Returns [`OffsetStoreError`] if any slice read fails.
    pub async fn load_offsets(&mut self) -> Result<usize, OffsetStoreError> {
        let parallelism = self.config.offset_slice_read_parallelism.max(1);
        let backend = Arc::clone(&self.backend);
        let name = self.projection_name.clone();
        let per_slice: Vec<Vec<Record>> = stream::iter(self.slice_range.iter())
            .map(|slice| {
                let backend = Arc::clone(&backend);
                let name = name.clone();
                async move { backend.read_slice(&name, slice).await }
            })
            .buffer_unordered(parallelism)
            .try_collect()
            .await?;

        let mut state = OffsetState::new();
        let mut loaded = 0;
        for records in per_slice {
            let recent = keep_within_window(records, self.config.time_window);
            loaded += recent.len();
            state.add(recent);
        }
        self.state = state;
        self.inflight.clear();
        self.last_eviction = None;
        tracing::info!(
            projection = %self.projection_name,
            slice_range = %self.slice_range,
            records = loaded,
            "offsets loaded"
        );
        Ok(loaded)
    }

    /// Resume point per populated slice, for the source provider.
    pub fn offsets_by_slice(&self) -> BTreeMap<u16, TimestampOffset> {
        self.state.offsets_by_slice()
    }

    /// Resume point for one slice.
    pub fn offset_by_slice(&self, slice: u16) -> Option<TimestampOffset> {
        self.state.offset_by_slice(slice)
    }

    /// Classify an incoming envelope.
    ///
    /// The effective previous sequence number for the entity is the
    /// maximum of the committed state and the in-flight set, so an
    /// envelope following an accepted-but-uncommitted predecessor is
    /// accepted rather than reported as a gap.
    pub fn validate<E>(&self, envelope: &EventEnvelope<E>) -> Validation {
        let stored = self.state.seq_nr_for(&envelope.persistence_id);
        let inflight = self.inflight.get(&envelope.persistence_id).copied();
        let prev = match (stored, inflight) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        let seq_nr = envelope.seq_nr;
        match prev {
            Some(prev) if seq_nr <= prev => Validation::Duplicate,
            Some(prev) if seq_nr == prev + 1 => Validation::Accepted,
            None if seq_nr == 1 => Validation::Accepted,
            _ if envelope.origin == EnvelopeOrigin::Backtracking => {
                Validation::RejectedBacktrackingSeqNr
            }
            _ => Validation::RejectedSeqNr,
        }
    }

    /// Mark an accepted envelope as in-flight until its offset is
    /// persisted.
    pub fn accept_in_flight<E>(&mut self, envelope: &EventEnvelope<E>) {
        let entry = self
            .inflight
            .entry(envelope.persistence_id.clone())
            .or_insert(envelope.seq_nr);
        *entry = (*entry).max(envelope.seq_nr);
    }

    /// Number of in-flight entries (test and introspection hook).
    pub fn inflight_count(&self) -> usize {
        self.inflight.len()
    }

    /// Highest known sequence number for an entity across committed
    /// state and in-flight envelopes; `0` if the entity is unknown.
    ///
    /// Used by the replay trigger to compute the first missing
    /// sequence number.
    pub fn stored_seq_nr(&self, persistence_id: &str) -> u64 {
        let stored = self.state.seq_nr_for(persistence_id).unwrap_or(0);
        let inflight = self.inflight.get(persistence_id).copied().unwrap_or(0);
        stored.max(inflight)
    }

    /// Number of records tracked in memory.
    pub fn state_size(&self) -> usize {
        self.state.size()
    }

    /// Persist a single offset record.
    ///
    /// # Errors
    ///
    /// Returns [`OffsetStoreError`] when persistence fails past its
    /// bounded retries.
    pub async fn save_offset(&mut self, record: Record) -> Result<(), OffsetStoreError> {
        self.save_offsets(vec![record]).await
    }

    /// Persist a batch of offset records.
    ///
    /// Records are written in groups of `offset_batch_size`; each group
    /// is atomic, the whole call is not. Transient backend failures are
    /// retried a bounded number of times. On success the records are
    /// folded into the in-memory state, their in-flight entries are
    /// cleared, and eviction runs if the state has outgrown
    /// `keep_number_of_entries` and `evict_interval` has elapsed.
    pub async fn save_offsets(&mut self, records: Vec<Record>) -> Result<(), OffsetStoreError> {
        if records.is_empty() {
            return Ok(());
        }
        let expires_at = self.expiry();
        for chunk in records.chunks(self.config.offset_batch_size.max(1)) {
            self.write_chunk_with_retry(chunk, expires_at).await?;
        }
        self.note_committed(records);
        Ok(())
    }

    /// Commit user write items and offset records in one atomic unit.
    ///
    /// # Errors
    ///
    /// [`OffsetStoreError::TransactionConflict`] fails the batch without
    /// applying anything; transient unavailability is retried like
    /// [`save_offsets`](OffsetStore::save_offsets).
    pub async fn transact_save_offsets(
        &mut self,
        items: Vec<WriteItem>,
        records: Vec<Record>,
    ) -> Result<(), OffsetStoreError> {
        let expires_at = self.expiry();
        let mut attempts = 0;
        loop {
            match self
                .backend
                .transact_write(&self.projection_name, &items, &records, expires_at)
                .await
            {
                Ok(()) => break,
                Err(OffsetStoreError::Unavailable(reason)) if attempts < WRITE_RETRIES => {
                    attempts += 1;
                    tracing::warn!(
                        projection = %self.projection_name,
                        attempt = attempts,
                        %reason,
                        "transactional offset write failed, retrying"
                    );
                    tokio::time::sleep(WRITE_RETRY_DELAY).await;
                }
                Err(e) => return Err(e),
            }
        }
        self.note_committed(records);
        Ok(())
    }

    /// Commit a single user transaction: write items plus one offset.
    pub async fn transact_save_offset(
        &mut self,
        items: Vec<WriteItem>,
        record: Record,
    ) -> Result<(), OffsetStoreError> {
        self.transact_save_offsets(items, vec![record]).await
    }

    /// Fold records the handler persisted on its own into the state
    /// without writing to the backend (offset-stored-by-handler
    /// strategy).
    pub fn note_saved_by_handler(&mut self, records: Vec<Record>) {
        self.note_committed(records);
    }

    /// Read the shared management record.
    pub async fn read_management_state(
        &self,
    ) -> Result<Option<ManagementState>, OffsetStoreError> {
        self.backend
            .read_management_state(&self.projection_name)
            .await
    }

    /// Write the pause flag (last writer wins).
    pub async fn save_paused(&self, paused: bool) -> Result<(), OffsetStoreError> {
        self.backend
            .save_management_state(&self.projection_name, ManagementState { paused })
            .await
    }

    fn expiry(&self) -> Option<chrono::DateTime<Utc>> {
        let ttl = self.ttl?;
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        Utc::now().checked_add_signed(ttl)
    }

    async fn write_chunk_with_retry(
        &self,
        chunk: &[Record],
        expires_at: Option<chrono::DateTime<Utc>>,
    ) -> Result<(), OffsetStoreError> {
        let mut attempts = 0;
        loop {
            match self
                .backend
                .write_batch(&self.projection_name, chunk, expires_at)
                .await
            {
                Ok(()) => return Ok(()),
                Err(OffsetStoreError::Unavailable(reason)) if attempts < WRITE_RETRIES => {
                    attempts += 1;
                    tracing::warn!(
                        projection = %self.projection_name,
                        attempt = attempts,
                        batch = chunk.len(),
                        %reason,
                        "offset batch write failed, retrying"
                    );
                    tokio::time::sleep(WRITE_RETRY_DELAY).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn note_committed(&mut self, records: Vec<Record>) {
        for record in &records {
            if let Some(inflight) = self.inflight.get(&record.persistence_id) {
                if *inflight <= record.seq_nr {
                    self.inflight.remove(&record.persistence_id);
                }
            }
        }
        self.state.add(records);
        self.maybe_evict();
    }

    /// Run eviction across the slice range once the state has outgrown
    /// its threshold and the eviction interval has elapsed.
    fn maybe_evict(&mut self) {
        if self.state.size() <= self.config.keep_number_of_entries {
            return;
        }
        let now = Instant::now();
        if let Some(last) = self.last_eviction {
            if now.duration_since(last) < self.config.evict_interval {
                return;
            }
        }
        let mut evicted = 0;
        for slice in self.slice_range.iter() {
            evicted += self.state.evict(slice, self.config.time_window);
        }
        self.last_eviction = Some(now);
        if evicted > 0 {
            tracing::debug!(
                projection = %self.projection_name,
                evicted,
                remaining = self.state.size(),
                "evicted aged offset records"
            );
        }
    }
}

/// Keep only the records within `window` of the newest timestamp in the
/// batch. Used per slice when merging persisted records on load.
fn keep_within_window(records: Vec<Record>, window: Duration) -> Vec<Record> {
    let Some(latest) = records.iter().map(|r| r.timestamp).max() else {
        return records;
    };
    let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX);
    let Some(threshold) = latest.checked_sub_signed(window) else {
        return records;
    };
    records
        .into_iter()
        .filter(|r| r.timestamp >= threshold)
        .collect()
}
