//! The offset persistence port and its in-memory implementation.
//!
//! The backend is a narrow key-value abstraction: offset records keyed by
//! `(projection_name, slice, persistence_id)`, plus one management record
//! per projection. Real deployments implement [`OffsetBackend`] against a
//! database with batched conditional writes and TTL sweeps; tests and
//! local runs use [`InMemoryOffsetBackend`].

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::OffsetStoreError;
use crate::offset::Record;
use crate::slice::SliceRange;

/// Shared administrative state for one projection, stored alongside its
/// offsets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagementState {
    /// Halts event consumption at the driver's pull point when set.
    pub paused: bool,
}

/// A user-supplied write committed atomically with offset records under
/// exactly-once semantics.
///
/// The payload is type-erased JSON so handlers for any domain can ride
/// the same transactional path; real backends map it onto their native
/// write-item representation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteItem {
    /// Destination key in the user's own table or keyspace.
    pub key: String,
    /// The value to write.
    pub value: serde_json::Value,
}

impl WriteItem {
    /// Create a write item.
    pub fn new(key: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }
}

/// Key-value persistence port for offsets and management state.
///
/// All record writes are upserts. A batch handed to
/// [`write_batch`](OffsetBackend::write_batch) or
/// [`transact_write`](OffsetBackend::transact_write) is atomic: either
/// every record lands or none does. Atomicity across separate calls is
/// not required.
#[async_trait]
pub trait OffsetBackend: Send + Sync + 'static {
    /// All live (non-expired) records for one slice of a projection.
    async fn read_slice(
        &self,
        projection_name: &str,
        slice: u16,
    ) -> Result<Vec<Record>, OffsetStoreError>;

    /// Upsert a batch of offset records atomically.
    ///
    /// `expires_at` is the TTL deletion timestamp stamped on every record
    /// in the batch; `None` means the records never expire.
    async fn write_batch(
        &self,
        projection_name: &str,
        records: &[Record],
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), OffsetStoreError>;

    /// Commit user write items and offset records in a single atomic
    /// unit. Fails the whole batch on any conflict.
    async fn transact_write(
        &self,
        projection_name: &str,
        items: &[WriteItem],
        records: &[Record],
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), OffsetStoreError>;

    /// Delete every offset record in a slice range.
    async fn delete_slices(
        &self,
        projection_name: &str,
        range: SliceRange,
    ) -> Result<(), OffsetStoreError>;

    /// Read the projection's management record, if one exists.
    async fn read_management_state(
        &self,
        projection_name: &str,
    ) -> Result<Option<ManagementState>, OffsetStoreError>;

    /// Write the projection's management record (last writer wins).
    async fn save_management_state(
        &self,
        projection_name: &str,
        state: ManagementState,
    ) -> Result<(), OffsetStoreError>;
}

/// One stored offset row: the value half of the key-value pair.
#[derive(Debug, Clone)]
struct StoredRow {
    seq_nr: u64,
    timestamp: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Tables {
    /// `projection_name -> (slice, persistence_id) -> row`.
    offsets: HashMap<String, BTreeMap<(u16, String), StoredRow>>,
    /// `projection_name -> management record`.
    management: HashMap<String, ManagementState>,
    /// User write items applied through `transact_write`.
    user_items: HashMap<String, serde_json::Value>,
}

/// In-memory [`OffsetBackend`] for tests and local development.
///
/// TTL is honored at read time: rows whose `expires_at` has passed are
/// invisible, matching a backend-level sweep that may lag deletion.
///
/// We use `std::sync::Mutex` (not `tokio::sync::Mutex`) because the lock
/// is held only for short, non-async map operations.
#[derive(Debug, Default)]
pub struct InMemoryOffsetBackend {
    tables: Mutex<Tables>,
    fail_writes: AtomicU32,
}

impl InMemoryOffsetBackend {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` write operations fail with
    /// [`OffsetStoreError::Unavailable`]. Used by tests to exercise the
    /// bounded commit-retry path.
    pub fn fail_next_writes(&self, count: u32) {
        self.fail_writes.store(count, Ordering::SeqCst);
    }

    /// Number of live offset rows stored for a projection.
    pub fn record_count(&self, projection_name: &str) -> usize {
        let tables = self.tables.lock().expect("backend lock poisoned");
        tables
            .offsets
            .get(projection_name)
            .map_or(0, |rows| rows.len())
    }

    /// The value last written for a user write-item key, if any.
    ///
    /// Lets tests assert the exactly-once property: the payload is
    /// applied iff the offset of the same transaction is persisted.
    pub fn applied_item(&self, key: &str) -> Option<serde_json::Value> {
        let tables = self.tables.lock().expect("backend lock poisoned");
        tables.user_items.get(key).cloned()
    }

    fn consume_write_failure(&self) -> bool {
        self.fail_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn upsert(
        tables: &mut Tables,
        projection_name: &str,
        records: &[Record],
        expires_at: Option<DateTime<Utc>>,
    ) {
        let rows = tables.offsets.entry(projection_name.to_string()).or_default();
        for record in records {
            rows.insert(
                (record.slice, record.persistence_id.clone()),
                StoredRow {
                    seq_nr: record.seq_nr,
                    timestamp: record.timestamp,
                    expires_at,
                },
            );
        }
    }
}

#[async_trait]
impl OffsetBackend for InMemoryOffsetBackend {
    async fn read_slice(
        &self,
        projection_name: &str,
        slice: u16,
    ) -> Result<Vec<Record>, OffsetStoreError> {
        let now = Utc::now();
        let tables = self.tables.lock().expect("backend lock poisoned");
        let Some(rows) = tables.offsets.get(projection_name) else {
            return Ok(Vec::new());
        };
        let records = rows
            .iter()
            .filter(|((s, _), _)| *s == slice)
            .filter(|(_, row)| row.expires_at.map_or(true, |at| at > now))
            .map(|((_, pid), row)| Record::new(pid.clone(), row.seq_nr, row.timestamp))
            .collect();
        Ok(records)
    }

    async fn write_batch(
        &self,
        projection_name: &str,
        records: &[Record],
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), OffsetStoreError> {
        if self.consume_write_failure() {
            return Err(OffsetStoreError::Unavailable(
                "injected write failure".to_string(),
            ));
        }
        let mut tables = self.tables.lock().expect("backend lock poisoned");
        Self::upsert(&mut tables, projection_name, records, expires_at);
        Ok(())
    }

    async fn transact_write(
        &self,
        projection_name: &str,
        items: &[WriteItem],
        records: &[Record],
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), OffsetStoreError> {
        if self.consume_write_failure() {
            return Err(OffsetStoreError::TransactionConflict(
                "injected transaction conflict".to_string(),
            ));
        }
        let mut tables = self.tables.lock().expect("backend lock poisoned");
        // Single lock scope: items and offsets land together or not at all.
        for item in items {
            tables
                .user_items
                .insert(item.key.clone(), item.value.clone());
        }
        Self::upsert(&mut tables, projection_name, records, expires_at);
        Ok(())
    }

    async fn delete_slices(
        &self,
        projection_name: &str,
        range: SliceRange,
    ) -> Result<(), OffsetStoreError> {
        let mut tables = self.tables.lock().expect("backend lock poisoned");
        if let Some(rows) = tables.offsets.get_mut(projection_name) {
            rows.retain(|(slice, _), _| !range.contains(*slice));
        }
        Ok(())
    }

    async fn read_management_state(
        &self,
        projection_name: &str,
    ) -> Result<Option<ManagementState>, OffsetStoreError> {
        let tables = self.tables.lock().expect("backend lock poisoned");
        Ok(tables.management.get(projection_name).copied())
    }

    async fn save_management_state(
        &self,
        projection_name: &str,
        state: ManagementState,
    ) -> Result<(), OffsetStoreError> {
        let mut tables = self.tables.lock().expect("backend lock poisoned");
        tables.management.insert(projection_name.to_string(), state);
        Ok(())
    }
}
