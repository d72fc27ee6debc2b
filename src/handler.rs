//! User handler ports and the handler-failure recovery policy.
//!
//! A handler consumes validated envelopes and produces side effects. The
//! shape of the port depends on the delivery strategy: single envelopes,
//! transactional write items, groups, or a concurrent flow. All ports
//! take envelopes by reference so a retrying driver can re-invoke them
//! without cloning payloads.

use std::time::Duration;

use async_trait::async_trait;

use crate::backend::WriteItem;
use crate::envelope::EventEnvelope;
use crate::error::HandlerError;

/// Handler for one envelope at a time (at-least-once, at-most-once, and
/// offset-stored-by-handler strategies).
#[async_trait]
pub trait Handler<E: Send + Sync + 'static>: Send + Sync {
    /// Process a single envelope.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError`] to invoke the configured
    /// [`RecoveryStrategy`].
    async fn process(&mut self, envelope: &EventEnvelope<E>) -> Result<(), HandlerError>;
}

/// Handler whose side effects commit atomically with the offset
/// (exactly-once strategy).
///
/// Instead of applying side effects directly, the handler describes them
/// as [`WriteItem`]s; the offset store commits them and the offset record
/// in a single transaction.
#[async_trait]
pub trait TransactionalHandler<E: Send + Sync + 'static>: Send + Sync {
    /// Process a single envelope, returning the writes to commit with
    /// its offset.
    async fn process(&mut self, envelope: &EventEnvelope<E>) -> Result<Vec<WriteItem>, HandlerError>;
}

/// Handler for a batch of envelopes whose offsets commit together
/// (grouped strategy).
#[async_trait]
pub trait GroupedHandler<E: Send + Sync + 'static>: Send + Sync {
    /// Process a whole group. The group either succeeds as a unit or is
    /// retried/skipped as a unit.
    async fn process_group(&mut self, envelopes: &[EventEnvelope<E>]) -> Result<(), HandlerError>;
}

/// Handler invoked concurrently by the flow strategy.
///
/// Takes `&self` because up to `parallelism` invocations run at once;
/// implementations hold their own interior state.
#[async_trait]
pub trait FlowHandler<E: Send + Sync + 'static>: Send + Sync {
    /// Process a single envelope. Offset correspondence is preserved by
    /// the driver; completion order may differ from delivery order.
    async fn process(&self, envelope: &EventEnvelope<E>) -> Result<(), HandlerError>;
}

/// What to do when a handler invocation fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStrategy {
    /// Fail the projection instance; the restart policy takes over.
    Fail,
    /// Discard the offending element and commit its offset forward.
    Skip,
    /// Retry up to `retries` times with exponential waits bounded by
    /// `delay`, then fail the projection instance.
    RetryAndFail {
        /// Retry attempts after the initial invocation.
        retries: u32,
        /// Upper bound on the wait between attempts.
        delay: Duration,
    },
    /// Retry up to `retries` times with exponential waits bounded by
    /// `delay`, then discard the element and commit forward.
    RetryAndSkip {
        /// Retry attempts after the initial invocation.
        retries: u32,
        /// Upper bound on the wait between attempts.
        delay: Duration,
    },
}

impl Default for RecoveryStrategy {
    fn default() -> Self {
        Self::Fail
    }
}

impl RecoveryStrategy {
    /// Number of retry attempts after the initial invocation.
    pub(crate) fn retries(&self) -> u32 {
        match self {
            Self::Fail | Self::Skip => 0,
            Self::RetryAndFail { retries, .. } | Self::RetryAndSkip { retries, .. } => *retries,
        }
    }

    /// Whether the element is skipped (offset committed forward) once
    /// the retry budget is exhausted.
    pub(crate) fn skips_on_exhaustion(&self) -> bool {
        matches!(self, Self::Skip | Self::RetryAndSkip { .. })
    }

    /// Wait before retry attempt `attempt` (1-based).
    ///
    /// Waits double from `delay / 2^(retries-1)` up to exactly `delay` on
    /// the final attempt, so the configured delay bounds every wait.
    pub(crate) fn wait_before(&self, attempt: u32) -> Duration {
        let (retries, delay) = match self {
            Self::Fail | Self::Skip => return Duration::ZERO,
            Self::RetryAndFail { retries, delay } | Self::RetryAndSkip { retries, delay } => {
                (*retries, *delay)
            }
        };
        let shift = retries.saturating_sub(attempt).min(16);
        delay / 2u32.pow(shift)
    }

    /// Whether this strategy is permitted under at-most-once delivery.
    pub(crate) fn valid_for_at_most_once(&self) -> bool {
        matches!(self, Self::Fail | Self::Skip)
    }

    /// Short name for logs and config errors.
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Self::Fail => "fail",
            Self::Skip => "skip",
            Self::RetryAndFail { .. } => "retry-and-fail",
            Self::RetryAndSkip { .. } => "retry-and-skip",
        }
    }
}

impl std::fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
