//! Status observer port: progress and error callbacks for telemetry.
//!
//! The driver reports every envelope outcome and offset commit through a
//! [`StatusObserver`]. Observers are strictly best-effort: a panicking
//! observer is caught and logged, never propagated, so telemetry can
//! never take down a projection.

use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::error::ProjectionError;

/// A progress event reported to the observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressEvent<'a> {
    /// An envelope was accepted and (unless filtered) handed to the
    /// handler.
    Accepted {
        /// Entity the envelope belongs to.
        persistence_id: &'a str,
        /// Its sequence number.
        seq_nr: u64,
    },
    /// An envelope was recognized as already processed and dropped.
    Duplicate {
        /// Entity the envelope belongs to.
        persistence_id: &'a str,
        /// Its sequence number.
        seq_nr: u64,
    },
    /// An envelope revealed a sequence gap and was not processed.
    Rejected {
        /// Entity the envelope belongs to.
        persistence_id: &'a str,
        /// Its sequence number.
        seq_nr: u64,
        /// Whether the slower backtracking stream surfaced the gap.
        backtracking: bool,
    },
    /// A failing element was discarded by a `skip` recovery and its
    /// offset committed forward.
    Skipped {
        /// Entity the envelope belongs to.
        persistence_id: &'a str,
        /// Its sequence number.
        seq_nr: u64,
    },
    /// A replay was requested from the source provider.
    ReplayTriggered {
        /// Entity to replay.
        persistence_id: &'a str,
        /// First sequence number to re-deliver.
        from_seq_nr: u64,
    },
    /// A batch of offsets was durably committed.
    OffsetsCommitted {
        /// Number of offset records in the commit.
        count: usize,
    },
}

/// Receives progress events and errors from a projection instance.
///
/// All methods have no-op defaults; implement only what you need.
pub trait StatusObserver: Send + Sync + 'static {
    /// Called for every progress event.
    fn progress(&self, projection_name: &str, event: ProgressEvent<'_>) {
        let _ = (projection_name, event);
    }

    /// Called for every error the driver observes, including those the
    /// restart policy will absorb.
    fn failure(&self, projection_name: &str, error: &ProjectionError) {
        let _ = (projection_name, error);
    }
}

/// Observer that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl StatusObserver for NoopObserver {}

/// Observer that logs progress at debug level and failures at warn.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogObserver;

impl StatusObserver for LogObserver {
    fn progress(&self, projection_name: &str, event: ProgressEvent<'_>) {
        tracing::debug!(projection = %projection_name, ?event, "projection progress");
    }

    fn failure(&self, projection_name: &str, error: &ProjectionError) {
        tracing::warn!(projection = %projection_name, error = %error, "projection failure");
    }
}

/// Invoke the observer's progress callback, swallowing panics.
pub(crate) fn notify_progress(
    observer: &dyn StatusObserver,
    projection_name: &str,
    event: ProgressEvent<'_>,
) {
    if catch_unwind(AssertUnwindSafe(|| observer.progress(projection_name, event))).is_err() {
        tracing::error!(projection = %projection_name, "status observer panicked in progress");
    }
}

/// Invoke the observer's failure callback, swallowing panics.
pub(crate) fn notify_failure(
    observer: &dyn StatusObserver,
    projection_name: &str,
    error: &ProjectionError,
) {
    if catch_unwind(AssertUnwindSafe(|| observer.failure(projection_name, error))).is_err() {
        tracing::error!(projection = %projection_name, "status observer panicked in failure");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct CountingObserver {
        progress: AtomicUsize,
        failures: AtomicUsize,
    }

    impl StatusObserver for Arc<CountingObserver> {
        fn progress(&self, _projection_name: &str, _event: ProgressEvent<'_>) {
            self.progress.fetch_add(1, Ordering::SeqCst);
        }

        fn failure(&self, _projection_name: &str, _error: &ProjectionError) {
            self.failures.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct PanickingObserver;

    impl StatusObserver for PanickingObserver {
        fn progress(&self, _projection_name: &str, _event: ProgressEvent<'_>) {
            panic!("observer bug");
        }
    }

    #[test]
    fn counting_observer_sees_events() {
        let observer = Arc::new(CountingObserver::default());
        notify_progress(
            &observer,
            "proj",
            ProgressEvent::Accepted {
                persistence_id: "p1",
                seq_nr: 1,
            },
        );
        notify_failure(&observer, "proj", &ProjectionError::Abort);
        assert_eq!(observer.progress.load(Ordering::SeqCst), 1);
        assert_eq!(observer.failures.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_observer_is_contained() {
        // Must not propagate the panic.
        notify_progress(
            &PanickingObserver,
            "proj",
            ProgressEvent::OffsetsCommitted { count: 3 },
        );
    }

    #[test]
    fn noop_and_log_observers_accept_all_events() {
        notify_progress(
            &NoopObserver,
            "proj",
            ProgressEvent::Duplicate {
                persistence_id: "p1",
                seq_nr: 2,
            },
        );
        notify_progress(
            &LogObserver,
            "proj",
            ProgressEvent::ReplayTriggered {
                persistence_id: "p1",
                from_seq_nr: 4,
            },
        );
    }
}
