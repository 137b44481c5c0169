//! The application-facing processing callback and its checkpointer.

use crate::error::{CheckpointRejected, ProcessingError};
use crate::types::{Checkpoint, Record, SequencePosition, ShutdownReason};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::trace;

/// Trait for implementing record processing logic.
///
/// The engine guarantees call ordering per shard: `initialize` once,
/// then zero-or-more `process_records` calls with records in
/// non-decreasing sequence order, then exactly one `shutdown`.
///
/// A failing `process_records` call names the record it could not
/// handle; the engine treats every record before it as dispatched,
/// retries soft failures from that record with backoff, and skips the
/// record once the attempt budget is exhausted. Callbacks that need
/// stronger guarantees than at-most-once for a skipped record must be
/// idempotent and re-drive from checkpoints externally.
///
/// # Examples
///
/// ```rust
/// use shardflow::{Checkpointer, ProcessingError, Record, RecordProcessor, ShutdownReason};
///
/// struct LoggingProcessor;
///
/// #[async_trait::async_trait]
/// impl RecordProcessor for LoggingProcessor {
///     async fn initialize(&self, shard_id: &str) {
///         println!("starting shard {shard_id}");
///     }
///
///     async fn process_records(
///         &self,
///         records: &[Record],
///         _checkpointer: &Checkpointer,
///     ) -> Result<(), ProcessingError> {
///         for record in records {
///             match std::str::from_utf8(&record.data) {
///                 Ok(text) => println!("{}: {}", record.sequence, text),
///                 Err(e) => {
///                     // Malformed payloads can never succeed; skip immediately.
///                     return Err(ProcessingError::hard(record.sequence.clone(), e));
///                 }
///             }
///         }
///         Ok(())
///     }
///
///     async fn shutdown(&self, reason: ShutdownReason, _checkpointer: &Checkpointer) {
///         println!("shard done: {reason}");
///     }
/// }
/// ```
#[async_trait]
pub trait RecordProcessor: Send + Sync {
    /// Called once before any records are delivered for a shard.
    async fn initialize(&self, shard_id: &str);

    /// Process a batch of records, in order.
    ///
    /// Returning `Err` names the failing record; records before it in
    /// the batch count as processed.
    async fn process_records(
        &self,
        records: &[Record],
        checkpointer: &Checkpointer,
    ) -> Result<(), ProcessingError>;

    /// Called exactly once when the shard consumer stops.
    async fn shutdown(&self, reason: ShutdownReason, checkpointer: &Checkpointer);
}

#[derive(Debug, Default)]
struct CheckpointerInner {
    last_delivered: Option<SequencePosition>,
    last_dispatched: Option<SequencePosition>,
    requested: Option<SequencePosition>,
    last_flushed: Option<Checkpoint>,
}

/// Tracks dispatch progress for one shard and accepts checkpoint
/// requests from the callback.
///
/// Requests are validated against the last dispatched record, recorded,
/// and persisted by the engine on its checkpoint interval; the engine
/// itself falls back to the last dispatched position when the callback
/// never asks for anything specific. Positions can never move backward.
#[derive(Debug, Clone)]
pub struct Checkpointer {
    inner: Arc<Mutex<CheckpointerInner>>,
}

impl Checkpointer {
    pub(crate) fn new(last_flushed: Option<Checkpoint>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CheckpointerInner {
                last_delivered: None,
                last_dispatched: None,
                requested: None,
                last_flushed,
            })),
        }
    }

    /// Request a checkpoint at `position`.
    ///
    /// Only positions at-or-before the last record delivered to the
    /// callback are accepted; that includes every record of the batch
    /// currently inside `process_records`, so checkpointing from within
    /// the callback works. The write itself happens on the engine's
    /// checkpoint interval, not here.
    pub fn checkpoint_at(&self, position: SequencePosition) -> Result<(), CheckpointRejected> {
        let mut inner = self.inner.lock();
        match &inner.last_delivered {
            Some(last) if &position <= last => {
                trace!(position = %position, "Checkpoint requested");
                // Keep the furthest request; requests never move backward.
                if inner
                    .requested
                    .as_ref()
                    .map(|r| &position > r)
                    .unwrap_or(true)
                {
                    inner.requested = Some(position);
                }
                Ok(())
            }
            _ => Err(CheckpointRejected { position }),
        }
    }

    /// The last record whose processing completed, if any.
    pub fn last_dispatched(&self) -> Option<SequencePosition> {
        self.inner.lock().last_dispatched.clone()
    }

    /// Widen the bound for callback checkpoint requests to cover a
    /// batch that is about to be handed over.
    pub(crate) fn mark_delivered(&self, position: SequencePosition) {
        let mut inner = self.inner.lock();
        if inner
            .last_delivered
            .as_ref()
            .map(|last| &position > last)
            .unwrap_or(true)
        {
            inner.last_delivered = Some(position);
        }
    }

    pub(crate) fn mark_dispatched(&self, position: SequencePosition) {
        let mut inner = self.inner.lock();
        // A dispatched record was necessarily delivered.
        if inner
            .last_delivered
            .as_ref()
            .map(|last| &position > last)
            .unwrap_or(true)
        {
            inner.last_delivered = Some(position.clone());
        }
        if inner
            .last_dispatched
            .as_ref()
            .map(|last| &position > last)
            .unwrap_or(true)
        {
            inner.last_dispatched = Some(position);
        }
    }

    /// The position the next flush should persist, if it would advance
    /// the durable checkpoint: the callback's explicit request if there
    /// is one, otherwise the last dispatched record.
    pub(crate) fn flush_target(&self) -> Option<SequencePosition> {
        let mut inner = self.inner.lock();
        let candidate = inner.requested.take().or_else(|| inner.last_dispatched.clone())?;
        match &inner.last_flushed {
            Some(flushed) if &Checkpoint::At(candidate.clone()) <= flushed => None,
            _ => Some(candidate),
        }
    }

    pub(crate) fn note_flushed(&self, checkpoint: Checkpoint) {
        self.inner.lock().last_flushed = Some(checkpoint);
    }
}
