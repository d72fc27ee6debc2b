//! Crate-level error types for offset persistence, handler invocation, and
//! the projection driver.

use std::time::Duration;

/// Error returned by the event source provider.
///
/// Wraps whatever transport or storage failure the provider encountered as
/// a human-readable message. Providers construct it with
/// [`SourceError::new`]; the driver converts it into
/// [`ProjectionError::Source`] when it must surface through the stream.
#[derive(Debug, thiserror::Error)]
#[error("source provider error: {0}")]
pub struct SourceError(String);

impl SourceError {
    /// Create a new source error from any displayable message.
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Error returned when reading or writing the offset persistence backend.
#[derive(Debug, thiserror::Error)]
pub enum OffsetStoreError {
    /// The backend could not serve the request (connectivity, capacity,
    /// throttling). Treated as transient by the batched-write retry loop.
    #[error("offset backend unavailable: {0}")]
    Unavailable(String),

    /// A transactional write (user items + offsets) hit a conflict.
    ///
    /// The whole batch failed; nothing was applied.
    #[error("transactional offset commit conflict: {0}")]
    TransactionConflict(String),

    /// An administrative offset operation was attempted on a projection
    /// that is not paused.
    #[error("projection `{0}` must be paused for this operation")]
    NotPaused(String),

    /// A management request did not complete within the operation budget.
    #[error("management operation timed out after {0:?}")]
    Timeout(Duration),
}

/// Error produced by a user handler.
///
/// Handlers are free to fail for domain reasons; the driver applies the
/// configured [`RecoveryStrategy`](crate::handler::RecoveryStrategy) and
/// either retries, skips, or fails the projection. The optional `source`
/// preserves the underlying error chain for logs.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl HandlerError {
    /// Create a handler error from a plain message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Create a handler error wrapping an underlying error.
    pub fn from_err(error: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self {
            message: error.to_string(),
            source: Some(Box::new(error)),
        }
    }
}

/// Error used to reject an invalid driver configuration at construction.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// At-most-once commits the offset before the handler runs, so a
    /// failed handler invocation cannot be retried without violating the
    /// "at most one attempt" contract. Only `Fail` and `Skip` are valid.
    #[error("at-most-once permits only `fail` or `skip` recovery, got `{0}`")]
    InvalidAtMostOnceRecovery(String),
}

/// Terminal errors surfaced by the projection driver.
///
/// Any of these fails the current projection instance; the driver then
/// restarts with backoff according to the restart policy, except for
/// [`Abort`](ProjectionError::Abort), which is only injected by `stop()`.
#[derive(Debug, thiserror::Error)]
pub enum ProjectionError {
    /// The event source stream failed or ended unexpectedly.
    #[error(transparent)]
    Source(#[from] SourceError),

    /// The handler failed and the recovery strategy exhausted its budget.
    #[error("handler failed after {attempts} attempt(s): {source}")]
    Handler {
        /// Total invocation attempts, including the first.
        attempts: u32,
        /// The last handler error observed.
        source: HandlerError,
    },

    /// Offset persistence failed past its bounded retries.
    ///
    /// Offsets are correctness-critical, so this is never skipped; it
    /// propagates and triggers a stream restart.
    #[error("offset commit failed: {0}")]
    OffsetCommit(#[from] OffsetStoreError),

    /// A backtracking envelope revealed a sequence-number gap and the
    /// provider cannot replay the missing events.
    #[error(
        "rejected envelope for `{persistence_id}` seq_nr {seq_nr}: \
         backtracking gap and replay is not possible"
    )]
    RejectedEnvelope {
        /// The entity whose gap was detected.
        persistence_id: String,
        /// The sequence number that surfaced the gap.
        seq_nr: u64,
    },

    /// Injected on `stop()` to abandon in-progress handler retries.
    #[error("projection aborted by stop request")]
    Abort,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_error_display() {
        let err = SourceError::new("connection refused");
        assert_eq!(err.to_string(), "source provider error: connection refused");
    }

    #[test]
    fn handler_error_preserves_source() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let err = HandlerError::from_err(io);
        assert_eq!(err.to_string(), "disk full");
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn projection_error_wraps_offset_store_error() {
        let err: ProjectionError = OffsetStoreError::Unavailable("throttled".to_string()).into();
        assert!(err.to_string().contains("throttled"));
    }

    #[test]
    fn rejected_envelope_names_pid_and_seq_nr() {
        let err = ProjectionError::RejectedEnvelope {
            persistence_id: "p1".to_string(),
            seq_nr: 7,
        };
        let msg = err.to_string();
        assert!(msg.contains("p1"));
        assert!(msg.contains('7'));
    }

    // Verify `Send + Sync` bounds are satisfied so errors can cross task
    // boundaries, which is required for use with `tokio` channels.
    const _: () = {
        #[allow(dead_code)]
        fn assert_send_sync<T: Send + Sync>() {}

        #[allow(dead_code)]
        fn check() {
            assert_send_sync::<SourceError>();
            assert_send_sync::<OffsetStoreError>();
            assert_send_sync::<HandlerError>();
            assert_send_sync::<ProjectionError>();
        }
    };
}
