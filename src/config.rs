//! Configuration for projection instances.
//!
//! All knobs live under one [`ProjectionConfig`] tree with defaults
//! matching production-tested values. Construct with
//! `ProjectionConfig::default()` and override fields with struct-update
//! syntax:
//!
//! ```
//! use std::time::Duration;
//! use offsetfold::{AtLeastOnceConfig, ProjectionConfig};
//!
//! let config = ProjectionConfig {
//!     at_least_once: AtLeastOnceConfig {
//!         save_offset_after_envelopes: 50,
//!         save_offset_after_duration: Duration::from_millis(250),
//!     },
//!     ..ProjectionConfig::default()
//! };
//! assert_eq!(config.at_least_once.save_offset_after_envelopes, 50);
//! assert_eq!(config.offset_store.offset_batch_size, 20);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::handler::RecoveryStrategy;

/// Restart policy applied when a projection instance fails.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RestartBackoffConfig {
    /// Delay before the first restart.
    pub min_backoff: Duration,
    /// Upper bound for the doubling delay.
    pub max_backoff: Duration,
    /// Random jitter added to each delay, as a fraction of the delay
    /// (`0.2` means up to 20% extra).
    pub random_factor: f64,
    /// Maximum restarts before the failure is surfaced to the caller.
    /// `-1` restarts forever; `0` disables restarts entirely.
    pub max_restarts: i32,
}

impl Default for RestartBackoffConfig {
    fn default() -> Self {
        Self {
            min_backoff: Duration::from_secs(3),
            max_backoff: Duration::from_secs(30),
            random_factor: 0.2,
            max_restarts: -1,
        }
    }
}

/// Commit cadence for the at-least-once offset strategy.
///
/// The offset is persisted after either `save_offset_after_envelopes`
/// processed envelopes or `save_offset_after_duration` elapsed since the
/// last commit, whichever comes first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AtLeastOnceConfig {
    /// Commit after this many processed envelopes.
    pub save_offset_after_envelopes: usize,
    /// Commit after this much time since the previous commit.
    pub save_offset_after_duration: Duration,
}

impl Default for AtLeastOnceConfig {
    fn default() -> Self {
        Self {
            save_offset_after_envelopes: 100,
            save_offset_after_duration: Duration::from_secs(1),
        }
    }
}

/// Group boundaries for the grouped handler strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupedConfig {
    /// Hand a group to the handler once it reaches this size.
    pub group_after_envelopes: usize,
    /// Hand a partial group to the handler after this much time.
    pub group_after_duration: Duration,
}

impl Default for GroupedConfig {
    fn default() -> Self {
        Self {
            group_after_envelopes: 20,
            group_after_duration: Duration::from_millis(500),
        }
    }
}

/// Timeouts for the management surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagementConfig {
    /// Overall budget for one management operation, across retries.
    pub operation_timeout: Duration,
    /// Budget for a single attempt within an operation.
    pub ask_timeout: Duration,
}

impl Default for ManagementConfig {
    fn default() -> Self {
        Self {
            operation_timeout: Duration::from_secs(10),
            ask_timeout: Duration::from_secs(3),
        }
    }
}

/// Tuning for the offset store: memory bounds, eviction, batching, and
/// load parallelism.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetStoreConfig {
    /// Logical table (or keyspace) name backends store offset records
    /// under. Consumed when constructing the backend.
    pub timestamp_offset_table: String,
    /// How far behind the latest timestamp in-memory records are kept.
    /// Also bounds how far back persisted records are merged on load.
    pub time_window: Duration,
    /// In-memory eviction does not run below this record count.
    pub keep_number_of_entries: usize,
    /// Minimum interval between eviction passes.
    pub evict_interval: Duration,
    /// Records per persisted batch; each batch is atomic.
    pub offset_batch_size: usize,
    /// Concurrent slice reads while loading initial offsets. Backends
    /// sharing a connection pool across projection instances must size
    /// the pool to at least this many connections.
    pub offset_slice_read_parallelism: usize,
}

impl Default for OffsetStoreConfig {
    fn default() -> Self {
        Self {
            timestamp_offset_table: "timestamp_offset".to_string(),
            time_window: Duration::from_secs(300),
            keep_number_of_entries: 10_000,
            evict_interval: Duration::from_secs(10),
            offset_batch_size: 20,
            offset_slice_read_parallelism: 10,
        }
    }
}

/// Time-to-live for persisted offset records.
///
/// `offset_time_to_live` applies to every projection unless a per-name
/// override matches. Override patterns are either exact projection names
/// or prefixes ending in `*`; the most specific (longest) match wins.
/// The TTL should be at least the in-memory `time_window` plus expected
/// downtime, or a restart will re-accept old duplicates as new.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeToLiveSettings {
    /// Default TTL for offset records; `None` means records never expire.
    pub offset_time_to_live: Option<Duration>,
    overrides: Vec<(String, Option<Duration>)>,
}

impl TimeToLiveSettings {
    /// Settings with no default TTL and no overrides.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default offset TTL.
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.offset_time_to_live = Some(ttl);
        self
    }

    /// Add a per-projection override. `pattern` is an exact projection
    /// name, or a prefix match when it ends in `*`.
    pub fn with_override(mut self, pattern: impl Into<String>, ttl: Option<Duration>) -> Self {
        self.overrides.push((pattern.into(), ttl));
        self
    }

    /// Resolve the offset TTL for a projection name.
    pub fn offset_ttl_for(&self, projection_name: &str) -> Option<Duration> {
        let mut best: Option<(&str, Option<Duration>)> = None;
        for (pattern, ttl) in &self.overrides {
            let matches = match pattern.strip_suffix('*') {
                Some(prefix) => projection_name.starts_with(prefix),
                None => projection_name == pattern,
            };
            if matches && best.map_or(true, |(prev, _)| pattern.len() > prev.len()) {
                best = Some((pattern, *ttl));
            }
        }
        match best {
            Some((_, ttl)) => ttl,
            None => self.offset_time_to_live,
        }
    }
}

/// The full configuration tree for one projection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProjectionConfig {
    /// Restart policy for failed instances.
    pub restart_backoff: RestartBackoffConfig,
    /// Handler-failure policy.
    pub recovery_strategy: RecoveryStrategy,
    /// At-least-once commit cadence.
    pub at_least_once: AtLeastOnceConfig,
    /// Grouped handler boundaries.
    pub grouped: GroupedConfig,
    /// Management operation timeouts.
    pub management: ManagementConfig,
    /// Offset store tuning.
    pub offset_store: OffsetStoreConfig,
    /// Persisted offset record TTL.
    pub time_to_live: TimeToLiveSettings,
}
