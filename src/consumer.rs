//! Per-shard consumer: reads records, drives the processing callback,
//! and flushes checkpoints until the shard ends or the lease goes away.

use crate::error::{EngineError, ProcessingError};
use crate::lease::LeaseCoordinator;
use crate::monitoring::{ConsumerStateLabel, EngineEvent};
use crate::processor::{Checkpointer, RecordProcessor};
use crate::retry::{Backoff, ExponentialBackoff, FixedBackoff};
use crate::store::LeaseStore;
use crate::topology::ShardTopologyTracker;
use crate::transport::{ReadPosition, StreamTransport};
use crate::types::{Checkpoint, InitialPosition, Record, SequencePosition, ShutdownReason};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// Per-shard processing knobs.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Maximum records per transport read.
    pub batch_size: usize,
    /// Where to start on a shard with no checkpoint.
    pub initial_position: InitialPosition,
    /// How long to wait after an empty read before polling again.
    pub idle_poll_delay: Duration,
    /// How often to re-check parent shard completion while waiting.
    pub parent_poll_interval: Duration,
    /// How often pending checkpoints are flushed to the store.
    pub checkpoint_interval: Duration,
    /// Total attempt budget per record before it is skipped; `None`
    /// retries a soft-failing record forever.
    pub max_record_attempts: Option<u32>,
    /// Fixed delay between attempts on the same record.
    pub record_retry_delay: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            initial_position: InitialPosition::TrimHorizon,
            idle_poll_delay: Duration::from_millis(1000),
            parent_poll_interval: Duration::from_secs(1),
            checkpoint_interval: Duration::from_secs(60),
            max_record_attempts: Some(10),
            record_retry_delay: Duration::from_secs(3),
        }
    }
}

enum DispatchOutcome {
    Completed,
    Interrupted(ShutdownReason),
}

/// Owns the full lifecycle of one shard on one worker.
///
/// State transitions are strictly Initializing -> Processing ->
/// ShutdownRequested -> ShuttingDown -> Done; the current state is
/// published on a watch channel for the scheduler.
pub(crate) struct ShardConsumer<T, P, S> {
    shard_id: String,
    transport: Arc<T>,
    processor: Arc<P>,
    coordinator: Arc<LeaseCoordinator<S>>,
    topology: Arc<ShardTopologyTracker<T>>,
    config: ConsumerConfig,
    state_tx: watch::Sender<ConsumerStateLabel>,
    monitoring_tx: Option<mpsc::Sender<EngineEvent>>,
}

impl<T, P, S> ShardConsumer<T, P, S>
where
    T: StreamTransport + 'static,
    P: RecordProcessor + 'static,
    S: LeaseStore + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        shard_id: String,
        transport: Arc<T>,
        processor: Arc<P>,
        coordinator: Arc<LeaseCoordinator<S>>,
        topology: Arc<ShardTopologyTracker<T>>,
        config: ConsumerConfig,
        state_tx: watch::Sender<ConsumerStateLabel>,
        monitoring_tx: Option<mpsc::Sender<EngineEvent>>,
    ) -> Self {
        Self {
            shard_id,
            transport,
            processor,
            coordinator,
            topology,
            config,
            state_tx,
            monitoring_tx,
        }
    }

    fn set_state(&self, state: ConsumerStateLabel) {
        debug!(shard_id = %self.shard_id, state = ?state, "Consumer state change");
        let _ = self.state_tx.send(state);
        self.send_event(EngineEvent::state_change(self.shard_id.clone(), state));
    }

    fn send_event(&self, event: EngineEvent) {
        if let Some(tx) = &self.monitoring_tx {
            if tx.try_send(event).is_err() {
                warn!(shard_id = %self.shard_id, "Monitoring channel full, dropping event");
            }
        }
    }

    /// Run the consumer to completion.
    #[instrument(skip_all, fields(shard_id = %self.shard_id))]
    pub async fn run(self, mut shutdown_rx: watch::Receiver<Option<ShutdownReason>>) {
        self.set_state(ConsumerStateLabel::Initializing);

        let initial_checkpoint = self
            .coordinator
            .owned_lease(&self.shard_id)
            .await
            .and_then(|lease| lease.checkpoint);

        if initial_checkpoint == Some(Checkpoint::ShardEnd) {
            // Nothing left to read; should not normally be scheduled.
            warn!(shard_id = %self.shard_id, "Consumer started on a completed shard");
            self.set_state(ConsumerStateLabel::Done);
            return;
        }

        let checkpointer = Checkpointer::new(initial_checkpoint.clone());
        let mut position = match initial_checkpoint {
            Some(Checkpoint::At(sequence)) => ReadPosition::After(sequence),
            _ => ReadPosition::Origin(self.config.initial_position),
        };

        self.processor.initialize(&self.shard_id).await;

        // Records from a parent must never be seen after records from
        // its child, so the consumer idles here until every parent has
        // a terminal checkpoint (or its lease has aged out).
        let reason = match self.wait_for_parents(&mut shutdown_rx).await {
            Some(reason) => reason,
            None => {
                self.set_state(ConsumerStateLabel::Processing);
                self.process_until_shutdown(&mut position, &checkpointer, &mut shutdown_rx)
                    .await
            }
        };

        info!(shard_id = %self.shard_id, reason = %reason, "Consumer shutting down");
        self.set_state(ConsumerStateLabel::ShuttingDown);
        self.processor.shutdown(reason, &checkpointer).await;

        match reason {
            ShutdownReason::ShardEnd => {
                if self.flush(&checkpointer).await.is_ok() {
                    match self
                        .coordinator
                        .update_checkpoint(&self.shard_id, Checkpoint::ShardEnd)
                        .await
                    {
                        Ok(()) => {
                            info!(shard_id = %self.shard_id, "Shard fully consumed");
                            self.send_event(EngineEvent::shard_completed(self.shard_id.clone()));
                        }
                        Err(e) => {
                            // Another worker will redo the tail of the shard.
                            warn!(shard_id = %self.shard_id, error = %e, "Terminal checkpoint failed");
                        }
                    }
                }
            }
            ShutdownReason::WorkerShutdown => {
                if let Err(e) = self.flush(&checkpointer).await {
                    warn!(shard_id = %self.shard_id, error = %e, "Final flush failed at shutdown");
                }
            }
            // The lease belongs to someone else now; any write here
            // could clobber their progress.
            ShutdownReason::LeaseLost => {}
        }

        self.set_state(ConsumerStateLabel::Done);
    }

    /// Idle in `Initializing` until every parent shard is fully
    /// consumed. Returns a reason if shutdown arrives while waiting.
    async fn wait_for_parents(
        &self,
        shutdown_rx: &mut watch::Receiver<Option<ShutdownReason>>,
    ) -> Option<ShutdownReason> {
        loop {
            match self.coordinator.list_leases().await {
                Ok(leases) => {
                    if self
                        .topology
                        .parents_satisfied(&self.shard_id, &leases)
                        .await
                    {
                        return None;
                    }
                    debug!(shard_id = %self.shard_id, "Waiting for parent shards to finish");
                }
                Err(e) => {
                    warn!(shard_id = %self.shard_id, error = %e, "Lease listing failed while waiting on parents");
                }
            }
            if let Some(reason) = self
                .interruptible_sleep(self.config.parent_poll_interval, shutdown_rx)
                .await
            {
                return Some(reason);
            }
        }
    }

    async fn process_until_shutdown(
        &self,
        position: &mut ReadPosition,
        checkpointer: &Checkpointer,
        shutdown_rx: &mut watch::Receiver<Option<ShutdownReason>>,
    ) -> ShutdownReason {
        let mut checkpoint_ticker = tokio::time::interval(self.config.checkpoint_interval);
        checkpoint_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick of a tokio interval fires immediately.
        checkpoint_ticker.reset();

        let mut transport_backoff =
            ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(10));
        let mut transport_failures: u32 = 0;

        loop {
            if let Some(reason) = *shutdown_rx.borrow() {
                self.set_state(ConsumerStateLabel::ShutdownRequested);
                return reason;
            }

            tokio::select! {
                changed = shutdown_rx.changed() => {
                    // Re-checked at the top of the loop. A dropped
                    // sender means the scheduler is gone.
                    if changed.is_err() {
                        return ShutdownReason::WorkerShutdown;
                    }
                }
                _ = checkpoint_ticker.tick() => {
                    match self.flush(checkpointer).await {
                        Ok(()) => {}
                        Err(EngineError::LeaseLost(_)) => return ShutdownReason::LeaseLost,
                        Err(e) => {
                            warn!(shard_id = %self.shard_id, error = %e, "Checkpoint flush failed");
                            self.send_event(EngineEvent::checkpoint_failure(
                                self.shard_id.clone(),
                                e.to_string(),
                            ));
                        }
                    }
                }
                result = self.transport.get_records(&self.shard_id, position, self.config.batch_size) => {
                    match result {
                        Ok(batch) => {
                            transport_failures = 0;
                            transport_backoff.reset();

                            if let Some(last) = batch.records.last() {
                                *position = ReadPosition::After(last.sequence.clone());
                            }
                            let was_empty = batch.records.is_empty();
                            if !was_empty {
                                match self.dispatch_batch(batch.records, checkpointer, shutdown_rx).await {
                                    DispatchOutcome::Completed => {}
                                    DispatchOutcome::Interrupted(reason) => return reason,
                                }
                            }
                            if batch.shard_closed {
                                return ShutdownReason::ShardEnd;
                            }
                            if was_empty {
                                if let Some(reason) = self
                                    .interruptible_sleep(self.config.idle_poll_delay, shutdown_rx)
                                    .await
                                {
                                    return reason;
                                }
                            }
                        }
                        Err(crate::error::TransportError::ShardNotFound(_)) => {
                            // The shard aged out of retention entirely.
                            warn!(shard_id = %self.shard_id, "Shard no longer exists, treating as consumed");
                            return ShutdownReason::ShardEnd;
                        }
                        Err(e) => {
                            let delay = transport_backoff.next_delay(transport_failures);
                            transport_failures = transport_failures.saturating_add(1);
                            warn!(
                                shard_id = %self.shard_id,
                                error = %e,
                                delay_ms = delay.as_millis() as u64,
                                "Transport read failed, backing off"
                            );
                            if let Some(reason) =
                                self.interruptible_sleep(delay, shutdown_rx).await
                            {
                                return reason;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Drive one batch through the callback, retrying or skipping
    /// individual records on failure.
    ///
    /// The callback names the failing record; everything before it
    /// counts as dispatched. Soft failures get a fixed-delay retry from
    /// the failing record until the attempt budget runs out, hard
    /// failures skip immediately.
    async fn dispatch_batch(
        &self,
        records: Vec<Record>,
        checkpointer: &Checkpointer,
        shutdown_rx: &mut watch::Receiver<Option<ShutdownReason>>,
    ) -> DispatchOutcome {
        let started = Instant::now();
        let total = records.len();
        let retry_backoff = FixedBackoff::new(self.config.record_retry_delay);

        // Callbacks may checkpoint at any record of the batch they are
        // currently handling.
        checkpointer.mark_delivered(records[total - 1].sequence.clone());

        let mut start = 0usize;
        let mut failing: Option<SequencePosition> = None;
        let mut attempts: u32 = 0;

        while start < total {
            match self
                .processor
                .process_records(&records[start..], checkpointer)
                .await
            {
                Ok(()) => {
                    checkpointer.mark_dispatched(records[total - 1].sequence.clone());
                    break;
                }
                Err(err) => {
                    let sequence = err.sequence().clone();
                    let index = records[start..]
                        .iter()
                        .position(|r| r.sequence == sequence)
                        .map(|i| start + i);

                    let Some(index) = index else {
                        // Defective callback: the named record is not in
                        // the slice we handed over.
                        error!(
                            shard_id = %self.shard_id,
                            sequence = %sequence,
                            "Callback reported a record outside the batch, dropping remainder"
                        );
                        checkpointer.mark_dispatched(records[total - 1].sequence.clone());
                        break;
                    };

                    if index > start {
                        checkpointer.mark_dispatched(records[index - 1].sequence.clone());
                    }

                    if failing.as_ref() != Some(&sequence) {
                        failing = Some(sequence.clone());
                        attempts = 0;
                    }
                    attempts += 1;

                    let exhausted = self
                        .config
                        .max_record_attempts
                        .is_some_and(|max| attempts >= max);
                    if matches!(err, ProcessingError::HardFailure { .. }) || exhausted {
                        warn!(
                            shard_id = %self.shard_id,
                            sequence = %sequence,
                            attempts = attempts,
                            error = %err,
                            "Skipping record"
                        );
                        self.send_event(EngineEvent::record_skipped(
                            self.shard_id.clone(),
                            sequence.sequence_number.clone(),
                            attempts,
                            err.to_string(),
                        ));
                        checkpointer.mark_dispatched(sequence);
                        start = index + 1;
                        failing = None;
                        attempts = 0;
                    } else {
                        debug!(
                            shard_id = %self.shard_id,
                            sequence = %sequence,
                            attempt = attempts,
                            "Record failed, retrying"
                        );
                        let delay = retry_backoff.next_delay(attempts);
                        if let Some(reason) =
                            self.interruptible_sleep(delay, shutdown_rx).await
                        {
                            return DispatchOutcome::Interrupted(reason);
                        }
                        start = index;
                    }
                }
            }
        }

        self.send_event(EngineEvent::batch_complete(
            self.shard_id.clone(),
            total,
            started.elapsed(),
        ));
        DispatchOutcome::Completed
    }

    /// Persist the pending checkpoint, if it advances.
    ///
    /// Throttling gets a few immediate retries; a lost lease is
    /// propagated so the consumer can stop.
    async fn flush(&self, checkpointer: &Checkpointer) -> crate::error::Result<()> {
        let Some(target) = checkpointer.flush_target() else {
            return Ok(());
        };
        let checkpoint = Checkpoint::At(target);

        let mut last_error = None;
        for attempt in 0..3u32 {
            match self
                .coordinator
                .update_checkpoint(&self.shard_id, checkpoint.clone())
                .await
            {
                Ok(()) => {
                    checkpointer.note_flushed(checkpoint);
                    return Ok(());
                }
                Err(e @ EngineError::LeaseLost(_)) => return Err(e),
                Err(e) => {
                    warn!(
                        shard_id = %self.shard_id,
                        attempt = attempt,
                        error = %e,
                        "Checkpoint write failed"
                    );
                    last_error = Some(e);
                    tokio::time::sleep(Duration::from_millis(200 * (attempt as u64 + 1))).await;
                }
            }
        }
        Err(last_error
            .unwrap_or_else(|| EngineError::StoreUnavailable("checkpoint flush".to_string())))
    }

    async fn interruptible_sleep(
        &self,
        delay: Duration,
        shutdown_rx: &mut watch::Receiver<Option<ShutdownReason>>,
    ) -> Option<ShutdownReason> {
        tokio::select! {
            _ = tokio::time::sleep(delay) => None,
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    return Some(ShutdownReason::WorkerShutdown);
                }
                let reason = *shutdown_rx.borrow();
                if reason.is_some() {
                    self.set_state(ConsumerStateLabel::ShutdownRequested);
                }
                reason
            }
        }
    }
}
