//! The offset state machine: per-entity latest records, per-slice sorted
//! indexes, and bounded-memory eviction.
//!
//! [`OffsetState`] is the in-memory half of the offset store. It answers
//! three questions in O(log n) or better: has this `(pid, seq_nr)` been
//! seen already (duplicate detection), what is the latest sequence number
//! for a pid (gap detection), and what is each slice's resume point
//! (`offset_by_slice`). The state is owned by a single projection
//! instance and mutated only on the driver task; durable truth lives in
//! the offset backend.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::envelope::EventEnvelope;
use crate::slice::slice_for_persistence_id;

/// The most recently observed event position for one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// `slice_for_persistence_id(persistence_id)`, stored to avoid
    /// rehashing on every index operation.
    pub slice: u16,
    /// The entity this record tracks.
    pub persistence_id: String,
    /// Latest accepted sequence number for the entity.
    pub seq_nr: u64,
    /// Commit timestamp of that event.
    pub timestamp: DateTime<Utc>,
}

impl Record {
    /// Create a record, computing the slice from the persistence id.
    pub fn new(persistence_id: impl Into<String>, seq_nr: u64, timestamp: DateTime<Utc>) -> Self {
        let persistence_id = persistence_id.into();
        Self {
            slice: slice_for_persistence_id(&persistence_id),
            persistence_id,
            seq_nr,
            timestamp,
        }
    }

    /// Create the record corresponding to an envelope's position.
    pub fn from_envelope<E>(envelope: &EventEnvelope<E>) -> Self {
        Self::new(
            envelope.persistence_id.clone(),
            envelope.seq_nr,
            envelope.timestamp,
        )
    }
}

/// A slice's resume point.
///
/// All events with `timestamp < self.timestamp` are fully observed for
/// the slice. `seen` enumerates the entities observed at exactly
/// `self.timestamp`, so those specific `(pid, seq_nr)` pairs can be
/// recognized as duplicates when the stream is re-read from this offset
/// after a restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimestampOffset {
    /// The slice's high-water commit timestamp.
    pub timestamp: DateTime<Utc>,
    /// Entities observed at exactly `timestamp`, with their seq_nrs.
    pub seen: BTreeMap<String, u64>,
}

impl TimestampOffset {
    /// Create an offset from a timestamp and its tie set.
    pub fn new(timestamp: DateTime<Utc>, seen: BTreeMap<String, u64>) -> Self {
        Self { timestamp, seen }
    }
}

/// Index key ordered by `(timestamp, seq_nr, persistence_id)`.
///
/// The derived `Ord` is lexicographic over the field order, which is
/// exactly the sort the per-slice index requires.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct SliceKey {
    timestamp: DateTime<Utc>,
    seq_nr: u64,
    persistence_id: String,
}

impl SliceKey {
    fn of(record: &Record) -> Self {
        Self {
            timestamp: record.timestamp,
            seq_nr: record.seq_nr,
            persistence_id: record.persistence_id.clone(),
        }
    }
}

/// In-memory offset state for one projection instance.
///
/// Maintains two views of the same records: `by_pid` for O(1) latest
/// seq_nr lookups, and `by_slice` sorted by `(timestamp, seq_nr, pid)`
/// for eviction and resume-point derivation. The two views never
/// diverge: every mutation updates both.
#[derive(Debug, Clone, Default)]
pub struct OffsetState {
    by_pid: HashMap<String, Record>,
    by_slice: BTreeMap<u16, BTreeSet<SliceKey>>,
    latest_timestamp: Option<DateTime<Utc>>,
}

impl OffsetState {
    /// An empty state with no observed records.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold records into the state.
    ///
    /// For each incoming record the entity's entry is replaced only when
    /// the incoming seq_nr is strictly higher than the stored one, so the
    /// result is independent of input order and per-entity seq_nrs never
    /// move backwards. `latest_timestamp` ratchets up monotonically and
    /// never rewinds, even when a record with an older timestamp arrives.
    pub fn add(&mut self, records: impl IntoIterator<Item = Record>) {
        for record in records {
            match self.by_pid.get(&record.persistence_id) {
                Some(existing) if existing.seq_nr >= record.seq_nr => continue,
                Some(existing) => {
                    let old_key = SliceKey::of(existing);
                    if let Some(set) = self.by_slice.get_mut(&existing.slice) {
                        set.remove(&old_key);
                    }
                }
                None => {}
            }

            self.latest_timestamp = Some(match self.latest_timestamp {
                Some(latest) => latest.max(record.timestamp),
                None => record.timestamp,
            });
            self.by_slice
                .entry(record.slice)
                .or_default()
                .insert(SliceKey::of(&record));
            self.by_pid.insert(record.persistence_id.clone(), record);
        }
    }

    /// Whether a record's position has already been observed: true iff a
    /// record exists for the same entity with `seq_nr >= record.seq_nr`.
    pub fn is_duplicate(&self, record: &Record) -> bool {
        self.by_pid
            .get(&record.persistence_id)
            .is_some_and(|existing| existing.seq_nr >= record.seq_nr)
    }

    /// Latest accepted seq_nr for an entity, or `None` if unobserved.
    pub fn seq_nr_for(&self, persistence_id: &str) -> Option<u64> {
        self.by_pid.get(persistence_id).map(|r| r.seq_nr)
    }

    /// Maximum observed commit timestamp across all slices.
    pub fn latest_timestamp(&self) -> Option<DateTime<Utc>> {
        self.latest_timestamp
    }

    /// Total number of tracked records.
    pub fn size(&self) -> usize {
        self.by_pid.len()
    }

    /// Number of tracked records in one slice.
    pub fn slice_size(&self, slice: u16) -> usize {
        self.by_slice.get(&slice).map_or(0, BTreeSet::len)
    }

    /// Remove records from `slice` whose timestamp is older than
    /// `latest_timestamp - time_window`, always retaining at least the
    /// newest record so the slice keeps a valid resume point. Removed
    /// records disappear from both indexes. Other slices are untouched.
    ///
    /// # Returns
    ///
    /// The number of records evicted.
    pub fn evict(&mut self, slice: u16, time_window: Duration) -> usize {
        let Some(latest) = self.latest_timestamp else {
            return 0;
        };
        let window = chrono::Duration::from_std(time_window).unwrap_or(chrono::Duration::MAX);
        // A window wider than representable time means nothing is stale.
        let Some(threshold) = latest.checked_sub_signed(window) else {
            return 0;
        };

        let Some(set) = self.by_slice.get_mut(&slice) else {
            return 0;
        };
        let Some(newest) = set.iter().next_back().cloned() else {
            return 0;
        };

        let stale: Vec<SliceKey> = set
            .iter()
            .take_while(|key| key.timestamp < threshold)
            .filter(|key| **key != newest)
            .cloned()
            .collect();
        for key in &stale {
            set.remove(key);
            self.by_pid.remove(&key.persistence_id);
        }
        stale.len()
    }

    /// The resume point for one slice, derived from the tail of its
    /// sorted index: the newest record supplies the timestamp and `seen`
    /// collects every entity in the slice observed at that timestamp.
    ///
    /// Returns `None` for a slice that has never accepted a record.
    pub fn offset_by_slice(&self, slice: u16) -> Option<TimestampOffset> {
        let set = self.by_slice.get(&slice)?;
        let newest = set.iter().next_back()?;
        let seen = set
            .iter()
            .rev()
            .take_while(|key| key.timestamp == newest.timestamp)
            .map(|key| (key.persistence_id.clone(), key.seq_nr))
            .collect();
        Some(TimestampOffset::new(newest.timestamp, seen))
    }

    /// Resume points for every slice that holds at least one record.
    pub fn offsets_by_slice(&self) -> BTreeMap<u16, TimestampOffset> {
        self.by_slice
            .keys()
            .filter_map(|slice| Some((*slice, self.offset_by_slice(*slice)?)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).expect("valid timestamp")
    }

    fn ms(millis: i64) -> chrono::Duration {
        chrono::Duration::milliseconds(millis)
    }

    #[test]
    fn sequential_adds_track_latest_per_pid() {
        let mut state = OffsetState::new();
        state.add([
            Record::new("p1", 1, t0()),
            Record::new("p1", 2, t0() + ms(1)),
            Record::new("p1", 3, t0() + ms(2)),
        ]);

        assert_eq!(state.seq_nr_for("p1"), Some(3));
        assert_eq!(state.latest_timestamp(), Some(t0() + ms(2)));
        let offset = state.offset_by_slice(449).expect("slice 449 should have an offset");
        assert_eq!(offset.timestamp, t0() + ms(2));
        assert_eq!(offset.seen.get("p1"), Some(&3));
        assert_eq!(offset.seen.len(), 1);
        // The superseded positions are gone from the slice index.
        assert_eq!(state.slice_size(449), 1);
    }

    #[test]
    fn older_timestamp_does_not_rewind_latest() {
        let mut state = OffsetState::new();
        state.add([
            Record::new("p1", 1, t0()),
            Record::new("p1", 2, t0() + ms(1)),
            Record::new("p1", 3, t0() + ms(2)),
        ]);
        state.add([Record::new("p2", 2, t0() + ms(1))]);

        assert_eq!(state.latest_timestamp(), Some(t0() + ms(2)));
        let offset = state.offset_by_slice(450).expect("slice 450 should have an offset");
        assert_eq!(offset.timestamp, t0() + ms(1));
        assert_eq!(offset.seen.get("p2"), Some(&2));
    }

    #[test]
    fn add_is_order_independent() {
        let records = [
            Record::new("p1", 1, t0()),
            Record::new("p1", 3, t0() + ms(2)),
            Record::new("p1", 2, t0() + ms(1)),
        ];
        let mut forward = OffsetState::new();
        forward.add(records.clone());
        let mut reversed = OffsetState::new();
        reversed.add(records.iter().rev().cloned());

        assert_eq!(forward.seq_nr_for("p1"), reversed.seq_nr_for("p1"));
        assert_eq!(forward.latest_timestamp(), reversed.latest_timestamp());
        assert_eq!(forward.offset_by_slice(449), reversed.offset_by_slice(449));
    }

    #[test]
    fn lower_seq_nr_never_replaces_higher() {
        let mut state = OffsetState::new();
        state.add([Record::new("p1", 5, t0() + ms(4))]);
        state.add([Record::new("p1", 3, t0() + ms(1))]);

        assert_eq!(state.seq_nr_for("p1"), Some(5));
        assert_eq!(
            state.offset_by_slice(449).expect("offset").timestamp,
            t0() + ms(4)
        );
    }

    #[test]
    fn is_duplicate_matches_seen_positions() {
        let mut state = OffsetState::new();
        state.add([Record::new("p1", 3, t0())]);

        assert!(state.is_duplicate(&Record::new("p1", 3, t0())));
        assert!(state.is_duplicate(&Record::new("p1", 2, t0())));
        assert!(!state.is_duplicate(&Record::new("p1", 4, t0())));
        assert!(!state.is_duplicate(&Record::new("p2", 1, t0())));
    }

    #[test]
    fn same_slice_same_timestamp_tie_is_retained() {
        // p863 and p984 both hash into slice 645.
        let mut state = OffsetState::new();
        state.add([
            Record::new("p863", 9, t0() + ms(3)),
            Record::new("p984", 9, t0() + ms(3)),
        ]);

        let offset = state.offset_by_slice(645).expect("slice 645 should have an offset");
        assert_eq!(offset.timestamp, t0() + ms(3));
        assert_eq!(offset.seen.len(), 2);
        assert_eq!(offset.seen.get("p863"), Some(&9));
        assert_eq!(offset.seen.get("p984"), Some(&9));
    }

    #[test]
    fn seen_excludes_older_timestamps_in_slice() {
        let mut state = OffsetState::new();
        state.add([
            Record::new("p500", 1, t0() + ms(1)),
            Record::new("p863", 4, t0() + ms(3)),
            Record::new("p984", 9, t0() + ms(3)),
        ]);

        let offset = state.offset_by_slice(645).expect("offset");
        assert_eq!(offset.timestamp, t0() + ms(3));
        assert!(!offset.seen.contains_key("p500"));
        assert_eq!(offset.seen.len(), 2);
    }

    #[test]
    fn eviction_drops_stale_records_only_in_target_slice() {
        // Five pids in slice 645 at t0+1ms..t0+4ms, one pid in slice 905
        // at t0+6ms driving latest_timestamp.
        let mut state = OffsetState::new();
        state.add([
            Record::new("p500", 1, t0() + ms(1)),
            Record::new("p621", 1, t0() + ms(2)),
            Record::new("p742", 1, t0() + ms(3)),
            Record::new("p863", 1, t0() + ms(4)),
            Record::new("p984", 1, t0() + ms(4)),
            Record::new("p92", 1, t0() + ms(6)),
        ]);
        assert_eq!(state.latest_timestamp(), Some(t0() + ms(6)));

        let evicted = state.evict(645, Duration::from_millis(2));
        // Threshold is t0+4ms: p500, p621, p742 go; the t0+4ms pair stays.
        assert_eq!(evicted, 3);
        assert_eq!(state.slice_size(645), 2);
        assert!(state.seq_nr_for("p500").is_none());
        assert!(state.seq_nr_for("p621").is_none());
        assert!(state.seq_nr_for("p742").is_none());
        assert_eq!(state.seq_nr_for("p863"), Some(1));
        assert_eq!(state.seq_nr_for("p984"), Some(1));
        // Slice 905 is untouched.
        assert_eq!(state.slice_size(905), 1);
        assert_eq!(state.seq_nr_for("p92"), Some(1));
    }

    #[test]
    fn eviction_always_retains_the_newest_record() {
        let mut state = OffsetState::new();
        state.add([
            Record::new("p500", 1, t0() + ms(1)),
            Record::new("p621", 1, t0() + ms(2)),
            Record::new("p92", 1, t0() + ms(100)),
        ]);

        // Window of zero would empty slice 645; the newest survives.
        let evicted = state.evict(645, Duration::from_millis(0));
        assert_eq!(evicted, 1);
        assert_eq!(state.slice_size(645), 1);
        let offset = state.offset_by_slice(645).expect("resume point must survive");
        assert_eq!(offset.timestamp, t0() + ms(2));
        assert_eq!(offset.seen.get("p621"), Some(&1));
    }

    #[test]
    fn evict_on_empty_or_unknown_slice_is_noop() {
        let mut state = OffsetState::new();
        assert_eq!(state.evict(645, Duration::from_secs(1)), 0);

        state.add([Record::new("p1", 1, t0())]);
        assert_eq!(state.evict(905, Duration::from_secs(1)), 0);
        assert_eq!(state.size(), 1);
    }

    #[test]
    fn offsets_by_slice_lists_every_populated_slice() {
        let mut state = OffsetState::new();
        state.add([
            Record::new("p1", 1, t0()),
            Record::new("p2", 4, t0() + ms(1)),
            Record::new("p863", 2, t0() + ms(2)),
        ]);

        let offsets = state.offsets_by_slice();
        assert_eq!(offsets.len(), 3);
        assert_eq!(offsets[&449].seen.get("p1"), Some(&1));
        assert_eq!(offsets[&450].seen.get("p2"), Some(&4));
        assert_eq!(offsets[&645].seen.get("p863"), Some(&2));
    }

    #[test]
    fn timestamp_offset_serde_roundtrip() {
        let mut seen = BTreeMap::new();
        seen.insert("p1".to_string(), 3u64);
        let offset = TimestampOffset::new(t0(), seen);

        let json = serde_json::to_string(&offset).expect("serialization should succeed");
        let back: TimestampOffset =
            serde_json::from_str(&json).expect("deserialization should succeed");
        assert_eq!(back, offset);
    }
}
