//! The projection driver: the pull-validate-dispatch-commit loop.
//!
//! A driver owns one projection instance end to end: it loads offsets,
//! subscribes to the source provider's envelope stream, classifies each
//! envelope against the offset store, dispatches accepted envelopes to
//! the user handler under the chosen delivery strategy, and commits
//! offsets. On unrecovered failure the instance restarts with
//! exponential backoff, re-reading offsets from the store so the
//! in-memory state is reconstructed.
//!
//! Exactly one pipeline pulls from the provider and advances the offset
//! state; handler invocations run concurrently only under the flow
//! strategy with explicit parallelism.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_stream::StreamExt;

use crate::backend::OffsetBackend;
use crate::config::ProjectionConfig;
use crate::envelope::EventEnvelope;
use crate::error::{ConfigError, HandlerError, ProjectionError, SourceError};
use crate::handler::{
    FlowHandler, GroupedHandler, Handler, RecoveryStrategy, TransactionalHandler,
};
use crate::observer::{
    notify_failure, notify_progress, NoopObserver, ProgressEvent, StatusObserver,
};
use crate::offset::Record;
use crate::provider::SourceProvider;
use crate::slice::SliceRange;
use crate::store::{OffsetStore, Validation};

/// How often the driver re-reads the shared management record to notice
/// pause and resume requests.
const PAUSE_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Lazy `load_envelope` calls are counted per instance and logged at
/// this interval.
const LOAD_LOG_INTERVAL: u64 = 1000;

/// Identifies a projection instance: the shared projection `name` plus
/// an instance `key` (conventionally the slice range).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProjectionId {
    name: String,
    key: String,
}

impl ProjectionId {
    /// Create an id from explicit name and key.
    pub fn new(name: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key: key.into(),
        }
    }

    /// Create an id keyed by a slice range, the conventional layout for
    /// sliced projections.
    pub fn for_slice_range(name: impl Into<String>, range: SliceRange) -> Self {
        Self {
            name: name.into(),
            key: range.to_string(),
        }
    }

    /// The projection name shared by all instances.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The instance key.
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl std::fmt::Display for ProjectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.name, self.key)
    }
}

/// Delivery pipeline: the offset strategy paired with the handler shape
/// it supports. Constructed through the `ProjectionDriver` factory
/// methods so invalid pairings cannot be expressed.
enum Pipeline<E: Send + Sync + 'static> {
    /// Handler first, offsets committed in batches afterwards.
    AtLeastOnce { handler: Box<dyn Handler<E>> },
    /// Handler returns write items committed atomically with the offset.
    ExactlyOnce { handler: Box<dyn TransactionalHandler<E>> },
    /// Offset committed before the handler runs; a failed handler loses
    /// the event. `recovery` is validated to `fail`/`skip` only.
    AtMostOnce {
        handler: Box<dyn Handler<E>>,
        recovery: RecoveryStrategy,
    },
    /// The handler persists offsets itself; the driver only tracks
    /// in-memory state for dedup and reporting.
    OffsetStoredByHandler { handler: Box<dyn Handler<E>> },
    /// Envelopes are batched and the group's offsets commit together.
    Grouped { handler: Box<dyn GroupedHandler<E>> },
    /// Concurrent handler invocations with offsets committed
    /// at-least-once as completions arrive.
    Flow {
        handler: Arc<dyn FlowHandler<E>>,
        parallelism: usize,
    },
}

/// Outcome of one flow task: the record to commit and whether the
/// element was skipped by recovery.
type FlowOutcome = Result<(Record, bool), ProjectionError>;

/// Result of a handler invocation run through the recovery strategy.
enum Invoked<T> {
    Done(T),
    Skipped,
}

/// Why a projection instance ended without an error.
enum InstanceExit {
    /// Cooperative stop was requested.
    Stopped,
    /// The instance must re-subscribe from freshly loaded offsets
    /// (resume after pause, where management may have rewritten them).
    Resubscribe,
}

/// Drives one projection instance.
///
/// Construct with one of the strategy factories
/// ([`at_least_once`](ProjectionDriver::at_least_once),
/// [`exactly_once`](ProjectionDriver::exactly_once), ...), customize
/// with [`with_config`](ProjectionDriver::with_config) /
/// [`with_observer`](ProjectionDriver::with_observer), then call
/// [`run`](ProjectionDriver::run) to spawn the background task.
pub struct ProjectionDriver<P: SourceProvider> {
    id: ProjectionId,
    stream_id: String,
    slice_range: SliceRange,
    provider: Arc<P>,
    backend: Arc<dyn OffsetBackend>,
    config: ProjectionConfig,
    observer: Arc<dyn StatusObserver>,
    pipeline: Pipeline<P::Event>,
}

impl<P: SourceProvider> ProjectionDriver<P> {
    fn with_pipeline(
        id: ProjectionId,
        stream_id: impl Into<String>,
        slice_range: SliceRange,
        provider: Arc<P>,
        backend: Arc<dyn OffsetBackend>,
        pipeline: Pipeline<P::Event>,
    ) -> Self {
        Self {
            id,
            stream_id: stream_id.into(),
            slice_range,
            provider,
            backend,
            config: ProjectionConfig::default(),
            observer: Arc::new(NoopObserver),
            pipeline,
        }
    }

    /// At-least-once delivery: the handler runs first, offsets are
    /// committed in batches afterwards. A crash between handler success
    /// and commit re-delivers the envelope.
    pub fn at_least_once(
        id: ProjectionId,
        stream_id: impl Into<String>,
        slice_range: SliceRange,
        provider: Arc<P>,
        backend: Arc<dyn OffsetBackend>,
        handler: Box<dyn Handler<P::Event>>,
    ) -> Self {
        Self::with_pipeline(
            id,
            stream_id,
            slice_range,
            provider,
            backend,
            Pipeline::AtLeastOnce { handler },
        )
    }

    /// Exactly-once delivery: the handler returns transactional write
    /// items that commit atomically with the offset.
    pub fn exactly_once(
        id: ProjectionId,
        stream_id: impl Into<String>,
        slice_range: SliceRange,
        provider: Arc<P>,
        backend: Arc<dyn OffsetBackend>,
        handler: Box<dyn TransactionalHandler<P::Event>>,
    ) -> Self {
        Self::with_pipeline(
            id,
            stream_id,
            slice_range,
            provider,
            backend,
            Pipeline::ExactlyOnce { handler },
        )
    }

    /// At-most-once delivery: the offset is persisted before the handler
    /// runs, so a failed handler loses the event.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidAtMostOnceRecovery`] for `retry*`
    /// strategies: retrying would violate the single-attempt contract.
    pub fn at_most_once(
        id: ProjectionId,
        stream_id: impl Into<String>,
        slice_range: SliceRange,
        provider: Arc<P>,
        backend: Arc<dyn OffsetBackend>,
        handler: Box<dyn Handler<P::Event>>,
        recovery: RecoveryStrategy,
    ) -> Result<Self, ConfigError> {
        if !recovery.valid_for_at_most_once() {
            return Err(ConfigError::InvalidAtMostOnceRecovery(
                recovery.to_string(),
            ));
        }
        Ok(Self::with_pipeline(
            id,
            stream_id,
            slice_range,
            provider,
            backend,
            Pipeline::AtMostOnce { handler, recovery },
        ))
    }

    /// The handler persists offsets itself; the driver tracks in-memory
    /// state for dedup and reports progress, but writes nothing.
    pub fn offset_stored_by_handler(
        id: ProjectionId,
        stream_id: impl Into<String>,
        slice_range: SliceRange,
        provider: Arc<P>,
        backend: Arc<dyn OffsetBackend>,
        handler: Box<dyn Handler<P::Event>>,
    ) -> Self {
        Self::with_pipeline(
            id,
            stream_id,
            slice_range,
            provider,
            backend,
            Pipeline::OffsetStoredByHandler { handler },
        )
    }

    /// Grouped delivery: envelopes are buffered into groups (bounded by
    /// count and time) and each group's offsets commit together.
    pub fn grouped(
        id: ProjectionId,
        stream_id: impl Into<String>,
        slice_range: SliceRange,
        provider: Arc<P>,
        backend: Arc<dyn OffsetBackend>,
        handler: Box<dyn GroupedHandler<P::Event>>,
    ) -> Self {
        Self::with_pipeline(
            id,
            stream_id,
            slice_range,
            provider,
            backend,
            Pipeline::Grouped { handler },
        )
    }

    /// At-least-once flow delivery: up to `parallelism` concurrent
    /// handler invocations; offsets commit as completions arrive.
    pub fn at_least_once_flow(
        id: ProjectionId,
        stream_id: impl Into<String>,
        slice_range: SliceRange,
        provider: Arc<P>,
        backend: Arc<dyn OffsetBackend>,
        handler: Arc<dyn FlowHandler<P::Event>>,
        parallelism: usize,
    ) -> Self {
        Self::with_pipeline(
            id,
            stream_id,
            slice_range,
            provider,
            backend,
            Pipeline::Flow {
                handler,
                parallelism: parallelism.max(1),
            },
        )
    }

    /// Replace the configuration tree.
    pub fn with_config(mut self, config: ProjectionConfig) -> Self {
        self.config = config;
        self
    }

    /// Attach a status observer.
    pub fn with_observer(mut self, observer: Arc<dyn StatusObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Spawn the projection as a background task and return its handle.
    pub fn run(self) -> ProjectionHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (abort_tx, abort_rx) = watch::channel(false);
        let task = tokio::spawn(run_projection(self, shutdown_rx, abort_rx));
        ProjectionHandle {
            shutdown_tx,
            abort_tx,
            task: Arc::new(tokio::sync::Mutex::new(Some(task))),
        }
    }
}

/// Handle for controlling a running projection.
///
/// `Clone` is cheap: all fields are `Arc`-wrapped or cloneable senders.
/// Dropping the handle does **not** stop the projection -- call
/// [`stop`](ProjectionHandle::stop) for a cooperative shutdown.
#[derive(Clone)]
pub struct ProjectionHandle {
    /// Signals the driver loop to stop at its next suspension point.
    shutdown_tx: watch::Sender<bool>,
    /// Aborts in-progress handler retry waits immediately.
    abort_tx: watch::Sender<bool>,
    /// The spawned task. Wrapped in `Option` so it can be taken and
    /// awaited exactly once by `stop`.
    task: Arc<tokio::sync::Mutex<Option<tokio::task::JoinHandle<Result<(), ProjectionError>>>>>,
}

impl ProjectionHandle {
    /// Request a cooperative shutdown and wait for the task to finish.
    ///
    /// The pull source is cancelled, the current handler invocation is
    /// allowed to finish, pending retries are aborted, and pending
    /// batched offsets are dropped (at-least-once semantics tolerate the
    /// replay). Calling `stop` more than once is safe.
    ///
    /// # Errors
    ///
    /// Returns the projection's terminal error if it had already failed
    /// past its restart budget before `stop` was called.
    pub async fn stop(&self) -> Result<(), ProjectionError> {
        let _ = self.shutdown_tx.send(true);
        let _ = self.abort_tx.send(true);

        let task = self.task.lock().await.take();
        let Some(join_handle) = task else {
            return Ok(());
        };
        match join_handle.await {
            Ok(Ok(())) | Ok(Err(ProjectionError::Abort)) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(e) => Err(ProjectionError::Source(SourceError::new(format!(
                "projection task panicked: {e}"
            )))),
        }
    }

    /// Whether the background task has finished (stopped, or failed past
    /// its restart budget).
    pub async fn is_finished(&self) -> bool {
        match self.task.lock().await.as_ref() {
            Some(task) => task.is_finished(),
            None => true,
        }
    }
}

/// Apply the configured random factor to a backoff delay.
fn jittered(delay: Duration, random_factor: f64) -> Duration {
    if random_factor <= 0.0 {
        return delay;
    }
    delay.mul_f64(1.0 + rand::random::<f64>() * random_factor)
}

/// Outer restart loop: runs instances until graceful stop, a disabled or
/// exhausted restart budget, or an abort.
async fn run_projection<P: SourceProvider>(
    driver: ProjectionDriver<P>,
    mut shutdown_rx: watch::Receiver<bool>,
    abort_rx: watch::Receiver<bool>,
) -> Result<(), ProjectionError> {
    let ProjectionDriver {
        id,
        stream_id,
        slice_range,
        provider,
        backend,
        config,
        observer,
        mut pipeline,
    } = driver;
    let restart = config.restart_backoff;
    let mut backoff = restart.min_backoff;
    let mut restarts: i32 = 0;

    loop {
        if *shutdown_rx.borrow() {
            return Ok(());
        }

        let progressed = AtomicBool::new(false);
        let result = run_instance(
            &id,
            &stream_id,
            slice_range,
            provider.as_ref(),
            Arc::clone(&backend),
            &config,
            observer.as_ref(),
            &mut pipeline,
            &mut shutdown_rx,
            &abort_rx,
            &progressed,
        )
        .await;

        let err = match result {
            Ok(InstanceExit::Stopped) => return Ok(()),
            Ok(InstanceExit::Resubscribe) => {
                // Not a failure: re-subscribe immediately from the
                // freshly persisted offsets.
                continue;
            }
            Err(err) => err,
        };
        notify_failure(observer.as_ref(), id.name(), &err);
        if *shutdown_rx.borrow() || matches!(err, ProjectionError::Abort) {
            return Ok(());
        }
        if progressed.load(Ordering::SeqCst) {
            // The failed instance committed offsets, so the failure is
            // fresh: start the backoff ladder over.
            backoff = restart.min_backoff;
            restarts = 0;
        }
        if restart.max_restarts == 0 {
            return Err(err);
        }
        if restart.max_restarts > 0 && restarts >= restart.max_restarts {
            tracing::error!(
                projection = %id,
                restarts,
                error = %err,
                "restart budget exhausted, giving up"
            );
            return Err(err);
        }
        restarts += 1;
        let delay = jittered(backoff, restart.random_factor);
        tracing::warn!(
            projection = %id,
            error = %err,
            restart = restarts,
            delay_ms = delay.as_millis() as u64,
            "projection instance failed, restarting"
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown_rx.changed() => return Ok(()),
        }
        backoff = (backoff * 2).min(restart.max_backoff);
    }
}

/// Run one projection instance until stop or failure.
#[allow(clippy::too_many_arguments)]
async fn run_instance<P: SourceProvider>(
    id: &ProjectionId,
    stream_id: &str,
    slice_range: SliceRange,
    provider: &P,
    backend: Arc<dyn OffsetBackend>,
    config: &ProjectionConfig,
    observer: &dyn StatusObserver,
    pipeline: &mut Pipeline<P::Event>,
    shutdown_rx: &mut watch::Receiver<bool>,
    abort_rx: &watch::Receiver<bool>,
    progressed: &AtomicBool,
) -> Result<InstanceExit, ProjectionError> {
    let mut store = OffsetStore::new(id.name(), slice_range, backend, config);
    store.load_offsets().await?;
    let mut paused = read_paused(&store).await?;
    if paused {
        tracing::info!(projection = %id, "starting paused");
    }

    let mut stream = provider
        .events_by_slices(stream_id, slice_range, store.offsets_by_slice())
        .await?;

    let mut instance = Instance {
        id,
        provider,
        config,
        observer,
        pipeline,
        store,
        abort_rx: abort_rx.clone(),
        progressed,
        pending: Vec::new(),
        group: Vec::new(),
        group_records: Vec::new(),
        load_count: 0,
    };
    let mut tasks: JoinSet<FlowOutcome> = JoinSet::new();

    let commit_period = instance.commit_period().max(Duration::from_millis(1));
    let mut commit_interval = tokio::time::interval(commit_period);
    // The first tick completes immediately; consume it.
    commit_interval.tick().await;
    let mut pause_interval = tokio::time::interval(PAUSE_POLL_INTERVAL);
    pause_interval.tick().await;

    let flow_capacity = instance.flow_capacity();
    loop {
        // Evaluated before the select borrows `tasks` for `join_next`.
        let tasks_active = !tasks.is_empty();
        let has_capacity = tasks.len() < flow_capacity;
        tokio::select! {
            _ = shutdown_rx.changed() => {
                // Cooperative stop: pending batched offsets are dropped,
                // at-least-once semantics tolerate the replay.
                tracing::info!(projection = %id, "projection stopping");
                return Ok(InstanceExit::Stopped);
            }
            _ = commit_interval.tick() => {
                instance.flush_timed().await?;
            }
            _ = pause_interval.tick() => {
                let now_paused = read_paused(&instance.store).await?;
                if paused && !now_paused {
                    // Management may have rewritten offsets while paused:
                    // re-subscribe from the stored resume points.
                    tracing::info!(projection = %id, "projection resumed");
                    return Ok(InstanceExit::Resubscribe);
                } else if !paused && now_paused {
                    tracing::info!(projection = %id, "projection paused");
                }
                paused = now_paused;
            }
            Some(joined) = tasks.join_next(), if tasks_active => {
                instance.on_flow_completion(joined).await?;
            }
            next = stream.next(), if !paused && has_capacity => {
                match next {
                    Some(Ok(envelope)) => instance.process(envelope, &mut tasks).await?,
                    Some(Err(e)) => return Err(e.into()),
                    None => {
                        return Err(SourceError::new("event stream ended unexpectedly").into());
                    }
                }
            }
        }
    }
}

async fn read_paused(store: &OffsetStore) -> Result<bool, ProjectionError> {
    Ok(store
        .read_management_state()
        .await?
        .map(|m| m.paused)
        .unwrap_or(false))
}

/// Mutable per-instance state shared by the select-loop arms.
struct Instance<'a, P: SourceProvider> {
    id: &'a ProjectionId,
    provider: &'a P,
    config: &'a ProjectionConfig,
    observer: &'a dyn StatusObserver,
    pipeline: &'a mut Pipeline<P::Event>,
    store: OffsetStore,
    abort_rx: watch::Receiver<bool>,
    progressed: &'a AtomicBool,
    /// At-least-once and flow commit queue.
    pending: Vec<Record>,
    /// Grouped envelopes awaiting the handler.
    group: Vec<EventEnvelope<P::Event>>,
    /// Records for the whole group, including filtered envelopes that
    /// never reach the handler.
    group_records: Vec<Record>,
    load_count: u64,
}

impl<P: SourceProvider> Instance<'_, P> {
    fn commit_period(&self) -> Duration {
        match &*self.pipeline {
            Pipeline::Grouped { .. } => self.config.grouped.group_after_duration,
            _ => self.config.at_least_once.save_offset_after_duration,
        }
    }

    fn flow_capacity(&self) -> usize {
        match &*self.pipeline {
            Pipeline::Flow { parallelism, .. } => *parallelism,
            _ => usize::MAX,
        }
    }

    /// Validate one envelope and dispatch on the outcome.
    async fn process(
        &mut self,
        envelope: EventEnvelope<P::Event>,
        tasks: &mut JoinSet<FlowOutcome>,
    ) -> Result<(), ProjectionError> {
        match self.store.validate(&envelope) {
            Validation::Duplicate => {
                tracing::trace!(
                    projection = %self.id,
                    persistence_id = %envelope.persistence_id,
                    seq_nr = envelope.seq_nr,
                    "duplicate envelope dropped"
                );
                notify_progress(
                    self.observer,
                    self.id.name(),
                    ProgressEvent::Duplicate {
                        persistence_id: &envelope.persistence_id,
                        seq_nr: envelope.seq_nr,
                    },
                );
                Ok(())
            }
            Validation::RejectedSeqNr => {
                notify_progress(
                    self.observer,
                    self.id.name(),
                    ProgressEvent::Rejected {
                        persistence_id: &envelope.persistence_id,
                        seq_nr: envelope.seq_nr,
                        backtracking: false,
                    },
                );
                // Opportunistic: the live stream may still deliver the
                // missing events, so a failed replay request is not an
                // error here.
                match self.try_trigger_replay(&envelope).await {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::debug!(
                            projection = %self.id,
                            persistence_id = %envelope.persistence_id,
                            seq_nr = envelope.seq_nr,
                            "sequence gap, waiting for delivery"
                        );
                    }
                    Err(e) => {
                        tracing::debug!(
                            projection = %self.id,
                            persistence_id = %envelope.persistence_id,
                            error = %e,
                            "replay request failed, waiting for delivery"
                        );
                    }
                }
                Ok(())
            }
            Validation::RejectedBacktrackingSeqNr => {
                notify_progress(
                    self.observer,
                    self.id.name(),
                    ProgressEvent::Rejected {
                        persistence_id: &envelope.persistence_id,
                        seq_nr: envelope.seq_nr,
                        backtracking: true,
                    },
                );
                // The backtracking stream has passed the gap: the events
                // will not arrive on their own. Replay or fail.
                match self.try_trigger_replay(&envelope).await {
                    Ok(true) => Ok(()),
                    Ok(false) | Err(_) => {
                        tracing::error!(
                            projection = %self.id,
                            persistence_id = %envelope.persistence_id,
                            seq_nr = envelope.seq_nr,
                            "backtracking gap and no replay possible"
                        );
                        Err(ProjectionError::RejectedEnvelope {
                            persistence_id: envelope.persistence_id.clone(),
                            seq_nr: envelope.seq_nr,
                        })
                    }
                }
            }
            Validation::Accepted => {
                self.store.accept_in_flight(&envelope);
                notify_progress(
                    self.observer,
                    self.id.name(),
                    ProgressEvent::Accepted {
                        persistence_id: &envelope.persistence_id,
                        seq_nr: envelope.seq_nr,
                    },
                );
                self.dispatch_accepted(envelope, tasks).await
            }
        }
    }

    /// Ask the provider to replay from the first missing seq_nr.
    ///
    /// Returns `Ok(false)` when the provider lacks the capability or the
    /// envelope cannot have predecessors.
    async fn try_trigger_replay(
        &self,
        envelope: &EventEnvelope<P::Event>,
    ) -> Result<bool, SourceError> {
        if !self.provider.supports_replay() || envelope.seq_nr <= 1 {
            return Ok(false);
        }
        let from_seq_nr = self.store.stored_seq_nr(&envelope.persistence_id) + 1;
        self.provider
            .trigger_replay(&envelope.persistence_id, from_seq_nr, envelope.seq_nr)
            .await?;
        tracing::info!(
            projection = %self.id,
            persistence_id = %envelope.persistence_id,
            from_seq_nr,
            triggered_by = envelope.seq_nr,
            "replay triggered"
        );
        notify_progress(
            self.observer,
            self.id.name(),
            ProgressEvent::ReplayTriggered {
                persistence_id: &envelope.persistence_id,
                from_seq_nr,
            },
        );
        Ok(true)
    }

    /// Route an accepted envelope through the delivery pipeline.
    async fn dispatch_accepted(
        &mut self,
        envelope: EventEnvelope<P::Event>,
        tasks: &mut JoinSet<FlowOutcome>,
    ) -> Result<(), ProjectionError> {
        let record = Record::from_envelope(&envelope);
        if envelope.filtered {
            // The producer stripped the payload; the handler is skipped
            // but the offset must advance or filtering would stall the
            // projection.
            return self.commit_without_handler(record).await;
        }
        let envelope = self.maybe_load_full(envelope).await?;

        match &mut *self.pipeline {
            Pipeline::AtLeastOnce { handler } => {
                let invoked = invoke_single(
                    handler.as_mut(),
                    &envelope,
                    self.config.recovery_strategy,
                    &self.abort_rx,
                    self.id.name(),
                )
                .await?;
                if matches!(invoked, Invoked::Skipped) {
                    self.notify_skipped(&envelope);
                }
                self.pending.push(record);
                self.flush_pending_if_full().await
            }
            Pipeline::ExactlyOnce { handler } => {
                let invoked = invoke_transactional(
                    handler.as_mut(),
                    &envelope,
                    self.config.recovery_strategy,
                    &self.abort_rx,
                    self.id.name(),
                )
                .await?;
                match invoked {
                    Invoked::Done(items) => {
                        self.store.transact_save_offsets(items, vec![record]).await?;
                    }
                    Invoked::Skipped => {
                        // Skip discards the element but commits forward.
                        self.notify_skipped(&envelope);
                        self.store.save_offsets(vec![record]).await?;
                    }
                }
                self.committed(1);
                Ok(())
            }
            Pipeline::AtMostOnce { handler, recovery } => {
                let recovery = *recovery;
                // Offset first: the event is lost if the handler fails.
                self.store.save_offsets(vec![record]).await?;
                let invoked = invoke_single(
                    handler.as_mut(),
                    &envelope,
                    recovery,
                    &self.abort_rx,
                    self.id.name(),
                )
                .await;
                self.committed(1);
                if matches!(invoked?, Invoked::Skipped) {
                    self.notify_skipped(&envelope);
                }
                Ok(())
            }
            Pipeline::OffsetStoredByHandler { handler } => {
                let invoked = invoke_single(
                    handler.as_mut(),
                    &envelope,
                    self.config.recovery_strategy,
                    &self.abort_rx,
                    self.id.name(),
                )
                .await?;
                if matches!(invoked, Invoked::Skipped) {
                    self.notify_skipped(&envelope);
                }
                self.store.note_saved_by_handler(vec![record]);
                self.progressed.store(true, Ordering::SeqCst);
                Ok(())
            }
            Pipeline::Grouped { .. } => {
                self.group.push(envelope);
                self.group_records.push(record);
                if self.group_records.len() >= self.config.grouped.group_after_envelopes {
                    self.flush_group().await
                } else {
                    Ok(())
                }
            }
            Pipeline::Flow { handler, .. } => {
                let handler = Arc::clone(handler);
                let recovery = self.config.recovery_strategy;
                let abort_rx = self.abort_rx.clone();
                let projection = self.id.name().to_string();
                tasks.spawn(flow_task(
                    handler, envelope, record, recovery, abort_rx, projection,
                ));
                Ok(())
            }
        }
    }

    /// Advance the offset for an envelope that never reaches the
    /// handler (filtered).
    async fn commit_without_handler(&mut self, record: Record) -> Result<(), ProjectionError> {
        match &*self.pipeline {
            Pipeline::AtLeastOnce { .. } | Pipeline::Flow { .. } => {
                self.pending.push(record);
                self.flush_pending_if_full().await
            }
            Pipeline::ExactlyOnce { .. } | Pipeline::AtMostOnce { .. } => {
                self.store.save_offsets(vec![record]).await?;
                self.committed(1);
                Ok(())
            }
            Pipeline::OffsetStoredByHandler { .. } => {
                self.store.note_saved_by_handler(vec![record]);
                Ok(())
            }
            Pipeline::Grouped { .. } => {
                self.group_records.push(record);
                if self.group_records.len() >= self.config.grouped.group_after_envelopes {
                    self.flush_group().await
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Lazily load the full envelope for backtracking placeholders.
    async fn maybe_load_full(
        &mut self,
        envelope: EventEnvelope<P::Event>,
    ) -> Result<EventEnvelope<P::Event>, ProjectionError> {
        if !envelope.needs_load() {
            return Ok(envelope);
        }
        self.load_count += 1;
        if self.load_count % LOAD_LOG_INTERVAL == 0 {
            tracing::info!(
                projection = %self.id,
                loads = self.load_count,
                "lazy envelope loads"
            );
        }
        let loaded = self
            .provider
            .load_envelope(&envelope.persistence_id, envelope.seq_nr)
            .await
            .map_err(ProjectionError::Source)?;
        Ok(loaded)
    }

    /// Time-based flush from the commit interval tick.
    async fn flush_timed(&mut self) -> Result<(), ProjectionError> {
        if matches!(&*self.pipeline, Pipeline::Grouped { .. }) {
            self.flush_group().await
        } else {
            self.flush_pending().await
        }
    }

    async fn flush_pending_if_full(&mut self) -> Result<(), ProjectionError> {
        if self.pending.len() >= self.config.at_least_once.save_offset_after_envelopes {
            self.flush_pending().await
        } else {
            Ok(())
        }
    }

    async fn flush_pending(&mut self) -> Result<(), ProjectionError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let records = std::mem::take(&mut self.pending);
        let count = records.len();
        self.store.save_offsets(records).await?;
        self.committed(count);
        Ok(())
    }

    /// Invoke the grouped handler for the buffered group and commit the
    /// group's offsets together.
    async fn flush_group(&mut self) -> Result<(), ProjectionError> {
        if self.group_records.is_empty() {
            return Ok(());
        }
        let envelopes = std::mem::take(&mut self.group);
        let records = std::mem::take(&mut self.group_records);

        if !envelopes.is_empty() {
            let Pipeline::Grouped { handler } = &mut *self.pipeline else {
                return Ok(());
            };
            let invoked = invoke_grouped(
                handler.as_mut(),
                &envelopes,
                self.config.recovery_strategy,
                &self.abort_rx,
                self.id.name(),
            )
            .await?;
            if matches!(invoked, Invoked::Skipped) {
                for envelope in &envelopes {
                    self.notify_skipped(envelope);
                }
            }
        }

        let count = records.len();
        self.store.save_offsets(records).await?;
        self.committed(count);
        Ok(())
    }

    /// Fold a finished flow task into the commit queue.
    async fn on_flow_completion(
        &mut self,
        joined: Result<FlowOutcome, tokio::task::JoinError>,
    ) -> Result<(), ProjectionError> {
        let outcome = match joined {
            Ok(outcome) => outcome,
            Err(e) if e.is_cancelled() => return Ok(()),
            Err(e) => Err(ProjectionError::Handler {
                attempts: 1,
                source: HandlerError::new(format!("flow handler panicked: {e}")),
            }),
        };
        let (record, skipped) = outcome?;
        if skipped {
            notify_progress(
                self.observer,
                self.id.name(),
                ProgressEvent::Skipped {
                    persistence_id: &record.persistence_id,
                    seq_nr: record.seq_nr,
                },
            );
        }
        self.pending.push(record);
        self.flush_pending_if_full().await
    }

    fn notify_skipped(&self, envelope: &EventEnvelope<P::Event>) {
        notify_progress(
            self.observer,
            self.id.name(),
            ProgressEvent::Skipped {
                persistence_id: &envelope.persistence_id,
                seq_nr: envelope.seq_nr,
            },
        );
    }

    fn committed(&self, count: usize) {
        self.progressed.store(true, Ordering::SeqCst);
        notify_progress(
            self.observer,
            self.id.name(),
            ProgressEvent::OffsetsCommitted { count },
        );
    }
}

/// Sleep between handler retries, aborting immediately on `stop()`.
async fn wait_or_abort(
    wait: Duration,
    abort_rx: &watch::Receiver<bool>,
) -> Result<(), ProjectionError> {
    if *abort_rx.borrow() {
        return Err(ProjectionError::Abort);
    }
    let mut abort_rx = abort_rx.clone();
    tokio::select! {
        _ = tokio::time::sleep(wait) => Ok(()),
        _ = abort_rx.changed() => Err(ProjectionError::Abort),
    }
}

/// Run a single-envelope handler through the recovery strategy.
async fn invoke_single<E: Send + Sync + 'static>(
    handler: &mut (dyn Handler<E> + '_),
    envelope: &EventEnvelope<E>,
    recovery: RecoveryStrategy,
    abort_rx: &watch::Receiver<bool>,
    projection: &str,
) -> Result<Invoked<()>, ProjectionError> {
    let mut attempts: u32 = 0;
    loop {
        attempts += 1;
        match handler.process(envelope).await {
            Ok(()) => return Ok(Invoked::Done(())),
            Err(err) => {
                if attempts <= recovery.retries() {
                    tracing::warn!(
                        projection = %projection,
                        persistence_id = %envelope.persistence_id,
                        seq_nr = envelope.seq_nr,
                        attempt = attempts,
                        error = %err,
                        "handler failed, retrying"
                    );
                    wait_or_abort(recovery.wait_before(attempts), abort_rx).await?;
                    continue;
                }
                if recovery.skips_on_exhaustion() {
                    tracing::warn!(
                        projection = %projection,
                        persistence_id = %envelope.persistence_id,
                        seq_nr = envelope.seq_nr,
                        error = %err,
                        "handler failed, skipping element"
                    );
                    return Ok(Invoked::Skipped);
                }
                return Err(ProjectionError::Handler {
                    attempts,
                    source: err,
                });
            }
        }
    }
}

/// Run a transactional handler through the recovery strategy.
async fn invoke_transactional<E: Send + Sync + 'static>(
    handler: &mut (dyn TransactionalHandler<E> + '_),
    envelope: &EventEnvelope<E>,
    recovery: RecoveryStrategy,
    abort_rx: &watch::Receiver<bool>,
    projection: &str,
) -> Result<Invoked<Vec<crate::backend::WriteItem>>, ProjectionError> {
    let mut attempts: u32 = 0;
    loop {
        attempts += 1;
        match handler.process(envelope).await {
            Ok(items) => return Ok(Invoked::Done(items)),
            Err(err) => {
                if attempts <= recovery.retries() {
                    tracing::warn!(
                        projection = %projection,
                        persistence_id = %envelope.persistence_id,
                        seq_nr = envelope.seq_nr,
                        attempt = attempts,
                        error = %err,
                        "handler failed, retrying"
                    );
                    wait_or_abort(recovery.wait_before(attempts), abort_rx).await?;
                    continue;
                }
                if recovery.skips_on_exhaustion() {
                    return Ok(Invoked::Skipped);
                }
                return Err(ProjectionError::Handler {
                    attempts,
                    source: err,
                });
            }
        }
    }
}

/// Run a grouped handler through the recovery strategy. The group
/// succeeds, retries, or is skipped as a unit.
async fn invoke_grouped<E: Send + Sync + 'static>(
    handler: &mut (dyn GroupedHandler<E> + '_),
    envelopes: &[EventEnvelope<E>],
    recovery: RecoveryStrategy,
    abort_rx: &watch::Receiver<bool>,
    projection: &str,
) -> Result<Invoked<()>, ProjectionError> {
    let mut attempts: u32 = 0;
    loop {
        attempts += 1;
        match handler.process_group(envelopes).await {
            Ok(()) => return Ok(Invoked::Done(())),
            Err(err) => {
                if attempts <= recovery.retries() {
                    tracing::warn!(
                        projection = %projection,
                        group_size = envelopes.len(),
                        attempt = attempts,
                        error = %err,
                        "group handler failed, retrying"
                    );
                    wait_or_abort(recovery.wait_before(attempts), abort_rx).await?;
                    continue;
                }
                if recovery.skips_on_exhaustion() {
                    tracing::warn!(
                        projection = %projection,
                        group_size = envelopes.len(),
                        error = %err,
                        "group handler failed, skipping group"
                    );
                    return Ok(Invoked::Skipped);
                }
                return Err(ProjectionError::Handler {
                    attempts,
                    source: err,
                });
            }
        }
    }
}

/// One concurrent flow invocation, retried per the recovery strategy.
async fn flow_task<E: Send + Sync + 'static>(
    handler: Arc<dyn FlowHandler<E>>,
    envelope: EventEnvelope<E>,
    record: Record,
    recovery: RecoveryStrategy,
    abort_rx: watch::Receiver<bool>,
    projection: String,
) -> FlowOutcome {
    let mut attempts: u32 = 0;
    loop {
        attempts += 1;
        match handler.process(&envelope).await {
            Ok(()) => return Ok((record, false)),
            Err(err) => {
                if attempts <= recovery.retries() {
                    wait_or_abort(recovery.wait_before(attempts), &abort_rx).await?;
                    continue;
                }
                if recovery.skips_on_exhaustion() {
                    tracing::warn!(
                        projection = %projection,
                        persistence_id = %envelope.persistence_id,
                        seq_nr = envelope.seq_nr,
                        error = %err,
                        "flow handler failed, skipping element"
                    );
                    return Ok((record, true));
                }
                return Err(ProjectionError::Handler {
                    attempts,
                    source: err,
                });
            }
        }
    }
}
