//! Stream runtime.
//!
//! Owns the poll-process-commit loop: pulls record batches, drives each
//! record through the processing stage, advances partition cursors,
//! stages offsets for periodic commit, and reacts to assignment changes
//! and transient transport failures. Graceful shutdown drains in-flight
//! work and flushes offsets before stopping.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::backpressure::BackpressureController;
use crate::committer::{OffsetCommitter, OffsetStore};
use crate::config::EngineConfig;
use crate::cursor::{CursorSet, PartitionCursor};
use crate::error::EngineError;
use crate::metrics::{EngineMetrics, MetricsSnapshot};
use crate::puller::{PullBatch, RecordPuller};
use crate::record::Record;
use crate::retry::RetryPolicy;
use crate::sink::{DeadLetterSink, EmitSink, LoggingDeadLetterSink};
use crate::stage::{ProcessingStage, StageOutcome, Transform};
use crate::state::{StateStore, StateStoreFactory};

/// Lifecycle state of a [`StreamRuntime`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    /// Loading committed offsets and seeding cursors.
    Starting,
    /// Poll-process-commit loop is active.
    Running,
    /// Shutdown signalled; finishing in-flight work and flushing offsets.
    Draining,
    /// Stopped cleanly after a final commit.
    Stopped,
    /// Stopped on an unrecoverable error.
    Failed,
}

impl std::fmt::Display for RuntimeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// The poll-process-commit engine.
///
/// Generic over the record source and the offset store so tests can run
/// it entirely in memory.
pub struct StreamRuntime<P: RecordPuller, S: OffsetStore> {
    config: EngineConfig,
    puller: P,
    stage: ProcessingStage,
    committer: OffsetCommitter<S>,
    cursors: CursorSet,
    stores: HashMap<i32, Box<dyn StateStore>>,
    store_factory: Option<StateStoreFactory>,
    emit: Option<Box<dyn EmitSink>>,
    emit_retry: RetryPolicy,
    dead_letter: Box<dyn DeadLetterSink>,
    backpressure: BackpressureController,
    state: Arc<RwLock<RuntimeState>>,
    metrics: Arc<EngineMetrics>,
}

impl<P, S> StreamRuntime<P, S>
where
    P: RecordPuller,
    S: OffsetStore,
{
    /// Builds a runtime from configuration, a record source, an offset
    /// store, and the per-record transform.
    #[must_use]
    pub fn new(config: EngineConfig, puller: P, store: S, transform: Box<dyn Transform>) -> Self {
        let processing_retry =
            RetryPolicy::exponential(config.processing_max_attempts, config.processing_backoff);
        let commit_retry =
            RetryPolicy::exponential(config.commit_max_attempts, config.commit_backoff);
        let backpressure = BackpressureController::new(
            config.max_poll_records,
            config.min_poll_records,
            config.backpressure_latency_threshold,
            config.backpressure_shrink_factor,
        );
        let committer = OffsetCommitter::new(store, config.commit_interval, commit_retry);

        Self {
            emit_retry: processing_retry.clone(),
            stage: ProcessingStage::new(transform, processing_retry),
            committer,
            cursors: CursorSet::new(),
            stores: HashMap::new(),
            store_factory: None,
            emit: None,
            dead_letter: Box::new(LoggingDeadLetterSink),
            backpressure,
            state: Arc::new(RwLock::new(RuntimeState::Starting)),
            metrics: Arc::new(EngineMetrics::new()),
            config,
            puller,
        }
    }

    /// Routes `Emit` outputs to the given sink. Without one, emitted
    /// values are counted and discarded.
    #[must_use]
    pub fn with_emit_sink(mut self, sink: Box<dyn EmitSink>) -> Self {
        self.emit = Some(sink);
        self
    }

    /// Replaces the default logging dead-letter sink.
    #[must_use]
    pub fn with_dead_letter_sink(mut self, sink: Box<dyn DeadLetterSink>) -> Self {
        self.dead_letter = sink;
        self
    }

    /// Enables per-partition state stores built by `factory`. Stores are
    /// created lazily on first record for a partition and dropped when
    /// the partition is revoked.
    #[must_use]
    pub fn with_state_store_factory(mut self, factory: StateStoreFactory) -> Self {
        self.store_factory = Some(factory);
        self
    }

    /// Returns the current lifecycle state.
    #[must_use]
    pub fn state(&self) -> RuntimeState {
        *self.state.read()
    }

    /// Returns a snapshot of the runtime counters.
    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Runs the poll-process-commit loop until `shutdown` fires or an
    /// unrecoverable error occurs.
    ///
    /// On shutdown the runtime drains: no new polls, in-flight records
    /// finished, offsets flushed, then `Stopped`.
    ///
    /// # Errors
    ///
    /// Returns the error that stopped the loop; the state is `Failed`.
    pub async fn run(mut self, mut shutdown: oneshot::Receiver<()>) -> Result<(), EngineError> {
        info!(
            group_id = %self.config.group_id,
            topic = %self.config.topic,
            "stream runtime starting"
        );

        let initial = self.puller.assignment();
        if !initial.is_empty() {
            self.install_partitions(&initial).await?;
        }
        self.set_state(RuntimeState::Running);

        let result = loop {
            let max_wait = self.config.poll_timeout;
            let batch_size = self.backpressure.batch_size();
            let pulled = tokio::select! {
                _ = &mut shutdown => break Ok(()),
                pulled = self.puller.poll(max_wait, batch_size) => pulled,
            };

            match pulled {
                Ok(PullBatch::AssignmentChanged(assignment)) => {
                    if let Err(e) = self.apply_assignment(assignment).await {
                        break Err(e);
                    }
                }
                Ok(PullBatch::Records(records)) => {
                    if records.is_empty() {
                        self.backpressure.observe(std::time::Duration::ZERO);
                    } else {
                        let started = Instant::now();
                        if let Err(e) = self.process_batch(records).await {
                            break Err(e);
                        }
                        self.backpressure.observe(started.elapsed());
                    }
                    if let Err(e) = self.maybe_commit().await {
                        break Err(e);
                    }
                }
                Err(e) if e.is_retryable() => {
                    warn!(
                        error = %e,
                        backoff_ms = self.config.reconnect_backoff.as_millis() as u64,
                        "transient pull failure, backing off"
                    );
                    sleep(self.config.reconnect_backoff).await;
                }
                Err(e) => break Err(e),
            }
        };

        match result {
            Ok(()) => {
                self.set_state(RuntimeState::Draining);
                info!("shutdown signalled, draining");
                self.final_commit().await;
                self.set_state(RuntimeState::Stopped);
                info!("stream runtime stopped");
                Ok(())
            }
            Err(e) => {
                self.set_state(RuntimeState::Failed);
                error!(error = %e, "stream runtime failed");
                Err(e)
            }
        }
    }

    /// Spawns the runtime onto the current tokio runtime and returns a
    /// handle for shutdown and observation.
    #[must_use]
    pub fn spawn(self) -> RuntimeHandle
    where
        P: 'static,
        S: 'static,
    {
        let state = Arc::clone(&self.state);
        let metrics = Arc::clone(&self.metrics);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(self.run(shutdown_rx));
        RuntimeHandle {
            state,
            metrics,
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        }
    }

    fn set_state(&self, next: RuntimeState) {
        let mut state = self.state.write();
        debug!(from = %*state, to = %next, "runtime state transition");
        *state = next;
    }

    /// Rebalance barrier: flush and discard revoked partitions, then
    /// seed cursors for newly assigned ones before the next poll.
    async fn apply_assignment(&mut self, assignment: Vec<i32>) -> Result<(), EngineError> {
        self.metrics.record_rebalance();
        let revoked: Vec<i32> = self
            .cursors
            .partitions()
            .into_iter()
            .filter(|p| !assignment.contains(p))
            .collect();
        let added: Vec<i32> = assignment
            .iter()
            .copied()
            .filter(|p| !self.cursors.contains(*p))
            .collect();
        info!(?assignment, ?revoked, ?added, "assignment changed");

        if !revoked.is_empty() {
            match self.committer.flush_partitions(&revoked).await {
                Ok(committed) => {
                    if !committed.is_empty() {
                        self.metrics.record_commit();
                        self.ack_commit(&committed)?;
                    }
                }
                Err(e) => {
                    // Under at-least-once the next owner re-reads from
                    // the last durable offset, so losing this flush only
                    // widens the duplicate window.
                    self.metrics.record_commit_failure();
                    warn!(error = %e, "flush for revoked partitions failed");
                }
            }
            self.committer.discard_partitions(&revoked);
            for p in &revoked {
                self.cursors.remove(*p);
                self.stores.remove(p);
            }
        }

        self.install_partitions(&added).await
    }

    /// Seeds a cursor per partition from the durable committed offset
    /// and repositions the puller there.
    async fn install_partitions(&mut self, partitions: &[i32]) -> Result<(), EngineError> {
        for &partition in partitions {
            let seed = match self.committer.committed(partition).await? {
                Some(offset) => {
                    self.puller.seek(partition, offset).await?;
                    offset
                }
                None => {
                    // No durable offset: the client's reset policy picks
                    // the read position and the cursor follows the first
                    // pulled record.
                    debug!(
                        partition,
                        reset = %self.config.offset_reset,
                        "no committed offset, deferring to reset policy"
                    );
                    0
                }
            };
            self.cursors.insert(PartitionCursor::seeded(partition, seed));
            info!(partition, seed, "partition cursor installed");
        }
        Ok(())
    }

    async fn process_batch(&mut self, records: Vec<Record>) -> Result<(), EngineError> {
        self.metrics.record_batch(records.len() as u64);
        for record in records {
            let partition = record.partition;
            if !self.cursors.contains(partition) {
                // Static-assignment pullers deliver without an explicit
                // assignment event; seed the cursor on first contact.
                self.install_partitions(&[partition]).await?;
            }

            let store = match &self.store_factory {
                Some(factory) => Some(
                    self.stores
                        .entry(partition)
                        .or_insert_with(|| factory(partition)),
                ),
                None => None,
            };
            let outcome = self
                .stage
                .process(&record, store, self.dead_letter.as_mut())
                .await;

            match outcome {
                StageOutcome::Emit(value) => {
                    self.metrics.record_emit();
                    self.emit_value(&record, &value).await;
                }
                StageOutcome::Dropped => self.metrics.record_drop(),
                StageOutcome::DeadLettered => self.metrics.record_dead_letter(),
            }

            let Some(cursor) = self.cursors.get_mut(partition) else {
                continue;
            };
            let delta = (record.offset + 1) - cursor.next_offset();
            if delta > 0 {
                cursor.advance(delta)?;
                self.committer.stage(partition, cursor.next_offset());
            } else {
                // Redelivery below the cursor: already counted, never
                // moves the commit position backwards.
                debug!(
                    partition,
                    offset = record.offset,
                    next = cursor.next_offset(),
                    "duplicate record, cursor unchanged"
                );
            }
        }
        Ok(())
    }

    /// Delivers an emitted value with retry; exhausted retries route the
    /// source record to the dead-letter sink so the offset can still
    /// advance.
    async fn emit_value(&mut self, record: &Record, value: &[u8]) {
        let Some(sink) = self.emit.as_mut() else {
            return;
        };
        let mut attempts = 0;
        loop {
            attempts += 1;
            match sink.emit(record.key.as_deref(), value).await {
                Ok(()) => return,
                Err(e) if self.emit_retry.should_retry(attempts) => {
                    let delay = self.emit_retry.delay_for_attempt(attempts);
                    warn!(
                        partition = record.partition,
                        offset = record.offset,
                        attempts,
                        error = %e,
                        "emit failed, retrying"
                    );
                    sleep(delay).await;
                }
                Err(e) => {
                    warn!(
                        partition = record.partition,
                        offset = record.offset,
                        attempts,
                        error = %e,
                        "emit attempts exhausted, routing to dead letter"
                    );
                    let reason = format!("emit failed: {e}");
                    if let Err(dl) = self.dead_letter.publish(record, &reason).await {
                        warn!(
                            partition = record.partition,
                            offset = record.offset,
                            error = %dl,
                            "dead-letter delivery failed"
                        );
                    }
                    self.metrics.record_dead_letter();
                    return;
                }
            }
        }
    }

    /// Commits staged offsets when the interval is due. Commit failures
    /// are absorbed; the offsets stay staged, so a later commit closes
    /// the gap. Cursor bookkeeping errors remain fatal.
    async fn maybe_commit(&mut self) -> Result<(), EngineError> {
        match self.committer.commit_due().await {
            Ok(Some(committed)) => {
                self.metrics.record_commit();
                self.ack_commit(&committed)
            }
            Ok(None) => Ok(()),
            Err(e) => {
                self.metrics.record_commit_failure();
                warn!(error = %e, "periodic commit failed, offsets retained");
                Ok(())
            }
        }
    }

    async fn final_commit(&mut self) {
        match self.committer.flush().await {
            Ok(committed) => {
                if !committed.is_empty() {
                    self.metrics.record_commit();
                    if let Err(e) = self.ack_commit(&committed) {
                        warn!(error = %e, "cursor bookkeeping failed during drain");
                    }
                }
            }
            Err(e) => {
                self.metrics.record_commit_failure();
                warn!(error = %e, "final commit failed during drain");
            }
        }
    }

    fn ack_commit(&mut self, committed: &HashMap<i32, i64>) -> Result<(), EngineError> {
        for (partition, offset) in committed {
            if let Some(cursor) = self.cursors.get_mut(*partition) {
                cursor.mark_committed(*offset)?;
            }
        }
        Ok(())
    }
}

/// Handle to a spawned [`StreamRuntime`].
pub struct RuntimeHandle {
    state: Arc<RwLock<RuntimeState>>,
    metrics: Arc<EngineMetrics>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<Result<(), EngineError>>>,
}

impl RuntimeHandle {
    /// Returns the runtime's current lifecycle state.
    #[must_use]
    pub fn state(&self) -> RuntimeState {
        *self.state.read()
    }

    /// Returns a snapshot of the runtime counters.
    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Signals graceful shutdown. Idempotent.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Waits for the runtime task to finish and returns its result.
    ///
    /// # Errors
    ///
    /// Returns the runtime's failure, or a `Processing` error if the
    /// task panicked.
    pub async fn join(mut self) -> Result<(), EngineError> {
        match self.task.take() {
            Some(task) => task
                .await
                .map_err(|e| EngineError::Processing(format!("runtime task panicked: {e}")))?,
            None => Ok(()),
        }
    }
}
