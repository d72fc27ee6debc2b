//! The management surface: administrative reads and writes against a
//! projection's offsets and pause flag.
//!
//! Management operates out-of-band through the shared offset backend, so
//! it works whether or not the projection is currently running. Offset
//! rewrites (`set_offset`, `clear_offset`) require the projection to be
//! paused: a running driver re-subscribes from the stored offsets when
//! it observes the pause flag clear, which is how administrative offset
//! changes take effect.
//!
//! Every request is retried on timeout: each attempt gets `ask_timeout`,
//! the whole operation `operation_timeout`.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use crate::backend::{ManagementState, OffsetBackend};
use crate::config::{ManagementConfig, ProjectionConfig};
use crate::error::OffsetStoreError;
use crate::offset::{Record, TimestampOffset};
use crate::slice::SliceRange;

/// Administrative handle for one projection's offsets and pause flag.
pub struct ProjectionManagement {
    projection_name: String,
    slice_range: SliceRange,
    backend: Arc<dyn OffsetBackend>,
    config: ManagementConfig,
}

impl ProjectionManagement {
    /// Create a management handle.
    pub fn new(
        projection_name: impl Into<String>,
        slice_range: SliceRange,
        backend: Arc<dyn OffsetBackend>,
        config: &ProjectionConfig,
    ) -> Self {
        Self {
            projection_name: projection_name.into(),
            slice_range,
            backend,
            config: config.management,
        }
    }

    /// Read the management record; a missing record reads as the
    /// default (not paused).
    pub async fn get_management_state(&self) -> Result<ManagementState, OffsetStoreError> {
        let state = self
            .retrying(|| self.backend.read_management_state(&self.projection_name))
            .await?;
        Ok(state.unwrap_or_default())
    }

    /// Whether the projection is paused.
    pub async fn is_paused(&self) -> Result<bool, OffsetStoreError> {
        Ok(self.get_management_state().await?.paused)
    }

    /// Set or clear the pause flag. The running driver notices the
    /// change at its pull point; pausing does not tear down the stream.
    pub async fn set_paused(&self, paused: bool) -> Result<(), OffsetStoreError> {
        self.retrying(|| {
            self.backend
                .save_management_state(&self.projection_name, ManagementState { paused })
        })
        .await
    }

    /// The highest resume point across the projection's slice range, or
    /// `None` when no offsets are stored.
    pub async fn get_offset(&self) -> Result<Option<TimestampOffset>, OffsetStoreError> {
        let offsets = self.get_offsets_by_slice().await?;
        Ok(offsets
            .into_values()
            .max_by(|a, b| a.timestamp.cmp(&b.timestamp)))
    }

    /// The resume point for every populated slice in the range.
    pub async fn get_offsets_by_slice(
        &self,
    ) -> Result<BTreeMap<u16, TimestampOffset>, OffsetStoreError> {
        let mut offsets = BTreeMap::new();
        for slice in self.slice_range.iter() {
            let records = self
                .retrying(|| self.backend.read_slice(&self.projection_name, slice))
                .await?;
            if let Some(offset) = offset_from_records(&records) {
                offsets.insert(slice, offset);
            }
        }
        Ok(offsets)
    }

    /// Overwrite the stored offset. `Some(offset)` writes a record per
    /// entry in `seen`; `None` clears the slice range.
    ///
    /// # Errors
    ///
    /// [`OffsetStoreError::NotPaused`] unless the projection is paused:
    /// rewriting offsets under a live consumer would race its in-memory
    /// state.
    pub async fn set_offset(
        &self,
        offset: Option<TimestampOffset>,
    ) -> Result<(), OffsetStoreError> {
        self.require_paused().await?;
        match offset {
            Some(offset) => {
                let records: Vec<Record> = offset
                    .seen
                    .iter()
                    .map(|(pid, seq_nr)| Record::new(pid.clone(), *seq_nr, offset.timestamp))
                    .collect();
                self.retrying(|| {
                    self.backend
                        .write_batch(&self.projection_name, &records, None)
                })
                .await
            }
            None => self.delete_range().await,
        }
    }

    /// Delete every stored offset in the slice range.
    ///
    /// # Errors
    ///
    /// [`OffsetStoreError::NotPaused`] unless the projection is paused.
    pub async fn clear_offset(&self) -> Result<(), OffsetStoreError> {
        self.require_paused().await?;
        self.delete_range().await
    }

    async fn delete_range(&self) -> Result<(), OffsetStoreError> {
        self.retrying(|| {
            self.backend
                .delete_slices(&self.projection_name, self.slice_range)
        })
        .await
    }

    async fn require_paused(&self) -> Result<(), OffsetStoreError> {
        if self.get_management_state().await?.paused {
            Ok(())
        } else {
            Err(OffsetStoreError::NotPaused(self.projection_name.clone()))
        }
    }

    /// Retry `op` with `ask_timeout` per attempt until it completes or
    /// `operation_timeout` is spent.
    async fn retrying<T, Fut, F>(&self, mut op: F) -> Result<T, OffsetStoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, OffsetStoreError>>,
    {
        let deadline = tokio::time::Instant::now() + self.config.operation_timeout;
        loop {
            match tokio::time::timeout(self.config.ask_timeout, op()).await {
                Ok(result) => return result,
                Err(_elapsed) => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(OffsetStoreError::Timeout(self.config.operation_timeout));
                    }
                    tracing::debug!(
                        projection = %self.projection_name,
                        ask_timeout_ms = self.config.ask_timeout.as_millis() as u64,
                        "management request timed out, retrying"
                    );
                }
            }
        }
    }
}

/// Derive a slice's resume point from its persisted records: the latest
/// timestamp plus all entities observed at exactly that timestamp.
fn offset_from_records(records: &[Record]) -> Option<TimestampOffset> {
    let latest = records.iter().map(|r| r.timestamp).max()?;
    let seen = records
        .iter()
        .filter(|r| r.timestamp == latest)
        .map(|r| (r.persistence_id.clone(), r.seq_nr))
        .collect();
    Some(TimestampOffset::new(latest, seen))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{InMemoryOffsetBackend, WriteItem};
    use crate::config::ManagementConfig;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::time::Duration;

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).expect("valid timestamp")
    }

    fn ms(millis: i64) -> chrono::Duration {
        chrono::Duration::milliseconds(millis)
    }

    fn management(backend: Arc<InMemoryOffsetBackend>) -> ProjectionManagement {
        ProjectionManagement::new(
            "proj",
            SliceRange::full(),
            backend,
            &ProjectionConfig::default(),
        )
    }

    #[tokio::test]
    async fn management_state_defaults_to_not_paused() {
        let mgmt = management(Arc::new(InMemoryOffsetBackend::new()));
        assert!(!mgmt.is_paused().await.expect("read should succeed"));
    }

    #[tokio::test]
    async fn set_paused_roundtrips() {
        let mgmt = management(Arc::new(InMemoryOffsetBackend::new()));
        mgmt.set_paused(true).await.expect("pause should succeed");
        assert!(mgmt.is_paused().await.expect("read should succeed"));
        mgmt.set_paused(false).await.expect("resume should succeed");
        assert!(!mgmt.is_paused().await.expect("read should succeed"));
    }

    #[tokio::test]
    async fn get_offset_returns_highest_across_slices() {
        let backend = Arc::new(InMemoryOffsetBackend::new());
        backend
            .write_batch(
                "proj",
                &[
                    Record::new("p1", 3, t0()),
                    Record::new("p2", 5, t0() + ms(10)),
                ],
                None,
            )
            .await
            .expect("write should succeed");
        let mgmt = management(backend);

        let offset = mgmt
            .get_offset()
            .await
            .expect("get should succeed")
            .expect("offset should exist");
        assert_eq!(offset.timestamp, t0() + ms(10));
        assert_eq!(offset.seen.get("p2"), Some(&5));

        let by_slice = mgmt
            .get_offsets_by_slice()
            .await
            .expect("get should succeed");
        assert_eq!(by_slice.len(), 2);
        assert_eq!(by_slice[&449].seen.get("p1"), Some(&3));
    }

    #[tokio::test]
    async fn get_offset_on_empty_store_is_none() {
        let mgmt = management(Arc::new(InMemoryOffsetBackend::new()));
        assert!(mgmt.get_offset().await.expect("get should succeed").is_none());
    }

    #[tokio::test]
    async fn set_offset_requires_pause() {
        let mgmt = management(Arc::new(InMemoryOffsetBackend::new()));
        let result = mgmt.set_offset(None).await;
        assert!(matches!(result, Err(OffsetStoreError::NotPaused(_))));
        let result = mgmt.clear_offset().await;
        assert!(matches!(result, Err(OffsetStoreError::NotPaused(_))));
    }

    #[tokio::test]
    async fn set_offset_writes_seen_records_while_paused() {
        let backend = Arc::new(InMemoryOffsetBackend::new());
        let mgmt = management(Arc::clone(&backend));
        mgmt.set_paused(true).await.expect("pause should succeed");

        let mut seen = BTreeMap::new();
        seen.insert("p1".to_string(), 7u64);
        seen.insert("p2".to_string(), 2u64);
        mgmt.set_offset(Some(TimestampOffset::new(t0(), seen)))
            .await
            .expect("set should succeed");

        assert_eq!(backend.record_count("proj"), 2);
        let offset = mgmt
            .get_offset()
            .await
            .expect("get should succeed")
            .expect("offset should exist");
        assert_eq!(offset.seen.len(), 2);
        assert_eq!(offset.seen.get("p1"), Some(&7));
    }

    #[tokio::test]
    async fn clear_offset_removes_the_range_while_paused() {
        let backend = Arc::new(InMemoryOffsetBackend::new());
        backend
            .write_batch("proj", &[Record::new("p1", 3, t0())], None)
            .await
            .expect("write should succeed");
        let mgmt = management(Arc::clone(&backend));
        mgmt.set_paused(true).await.expect("pause should succeed");

        mgmt.clear_offset().await.expect("clear should succeed");
        assert_eq!(backend.record_count("proj"), 0);
    }

    #[tokio::test]
    async fn set_offset_none_clears_while_paused() {
        let backend = Arc::new(InMemoryOffsetBackend::new());
        backend
            .write_batch("proj", &[Record::new("p1", 3, t0())], None)
            .await
            .expect("write should succeed");
        let mgmt = management(Arc::clone(&backend));
        mgmt.set_paused(true).await.expect("pause should succeed");

        mgmt.set_offset(None).await.expect("clear should succeed");
        assert_eq!(backend.record_count("proj"), 0);
    }

    // --- Timeout behavior ---

    /// Backend whose reads hang long enough to trip `ask_timeout`.
    struct SlowBackend {
        delay: Duration,
    }

    #[async_trait]
    impl OffsetBackend for SlowBackend {
        async fn read_slice(
            &self,
            _projection_name: &str,
            _slice: u16,
        ) -> Result<Vec<Record>, OffsetStoreError> {
            tokio::time::sleep(self.delay).await;
            Ok(Vec::new())
        }

        async fn write_batch(
            &self,
            _projection_name: &str,
            _records: &[Record],
            _expires_at: Option<DateTime<Utc>>,
        ) -> Result<(), OffsetStoreError> {
            Ok(())
        }

        async fn transact_write(
            &self,
            _projection_name: &str,
            _items: &[WriteItem],
            _records: &[Record],
            _expires_at: Option<DateTime<Utc>>,
        ) -> Result<(), OffsetStoreError> {
            Ok(())
        }

        async fn delete_slices(
            &self,
            _projection_name: &str,
            _range: SliceRange,
        ) -> Result<(), OffsetStoreError> {
            Ok(())
        }

        async fn read_management_state(
            &self,
            _projection_name: &str,
        ) -> Result<Option<ManagementState>, OffsetStoreError> {
            tokio::time::sleep(self.delay).await;
            Ok(None)
        }

        async fn save_management_state(
            &self,
            _projection_name: &str,
            _state: ManagementState,
        ) -> Result<(), OffsetStoreError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn slow_backend_exhausts_the_operation_budget() {
        let config = ProjectionConfig {
            management: ManagementConfig {
                ask_timeout: Duration::from_millis(20),
                operation_timeout: Duration::from_millis(70),
            },
            ..ProjectionConfig::default()
        };
        let mgmt = ProjectionManagement::new(
            "proj",
            SliceRange::full(),
            Arc::new(SlowBackend {
                delay: Duration::from_millis(200),
            }),
            &config,
        );

        let result = mgmt.get_management_state().await;
        assert!(matches!(result, Err(OffsetStoreError::Timeout(_))));
    }

    #[test]
    fn offset_from_records_collects_the_tie_set() {
        let records = vec![
            Record::new("p1", 1, t0()),
            Record::new("p2", 4, t0() + ms(5)),
            Record::new("p3", 2, t0() + ms(5)),
        ];
        let offset = offset_from_records(&records).expect("offset should exist");
        assert_eq!(offset.timestamp, t0() + ms(5));
        assert_eq!(offset.seen.len(), 2);
        assert!(!offset.seen.contains_key("p1"));
    }
}
