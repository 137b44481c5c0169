use crate::error::{ProcessingError, TransportError};
use crate::processor::{Checkpointer, RecordProcessor};
use crate::transport::{ReadPosition, RecordBatch, StreamTransport};
use crate::types::{Record, Shard, ShutdownReason};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Mock stream transport for testing.
///
/// `list_shards` returns whatever was last set with [`set_shards`];
/// `get_records` pops scripted responses per shard and yields an empty
/// open batch once the script runs dry, like an idle live shard.
///
/// [`set_shards`]: MockStreamTransport::set_shards
#[derive(Debug, Default, Clone)]
pub struct MockStreamTransport {
    shards: Arc<Mutex<Vec<Shard>>>,
    #[allow(clippy::type_complexity)]
    batches: Arc<Mutex<HashMap<String, VecDeque<Result<RecordBatch, TransportError>>>>>,
    read_positions: Arc<Mutex<Vec<(String, ReadPosition)>>>,
}

impl MockStreamTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_shards(&self, shards: Vec<Shard>) {
        *self.shards.lock().await = shards;
    }

    /// Queue one `get_records` response for a shard.
    pub async fn queue_batch(&self, shard_id: &str, batch: RecordBatch) {
        self.batches
            .lock()
            .await
            .entry(shard_id.to_string())
            .or_default()
            .push_back(Ok(batch));
    }

    /// Queue an open (not end-of-shard) batch of records.
    pub async fn queue_records(&self, shard_id: &str, records: Vec<Record>) {
        self.queue_batch(
            shard_id,
            RecordBatch {
                records,
                millis_behind: Some(0),
                shard_closed: false,
            },
        )
        .await;
    }

    /// Queue a final batch after which the shard reports closed.
    pub async fn queue_closing_records(&self, shard_id: &str, records: Vec<Record>) {
        self.queue_batch(
            shard_id,
            RecordBatch {
                records,
                millis_behind: Some(0),
                shard_closed: true,
            },
        )
        .await;
    }

    /// Queue a transport error for a shard.
    pub async fn queue_error(&self, shard_id: &str, error: TransportError) {
        self.batches
            .lock()
            .await
            .entry(shard_id.to_string())
            .or_default()
            .push_back(Err(error));
    }

    /// Every `(shard_id, position)` pair `get_records` was called with.
    pub async fn read_positions(&self) -> Vec<(String, ReadPosition)> {
        self.read_positions.lock().await.clone()
    }
}

#[async_trait]
impl StreamTransport for MockStreamTransport {
    async fn list_shards(&self) -> Result<Vec<Shard>, TransportError> {
        Ok(self.shards.lock().await.clone())
    }

    async fn get_records(
        &self,
        shard_id: &str,
        from: &ReadPosition,
        _limit: usize,
    ) -> Result<RecordBatch, TransportError> {
        self.read_positions
            .lock()
            .await
            .push((shard_id.to_string(), from.clone()));

        let scripted = self
            .batches
            .lock()
            .await
            .get_mut(shard_id)
            .and_then(|queue| queue.pop_front());

        match scripted {
            Some(response) => response,
            None => {
                debug!(shard_id = %shard_id, "Mock script exhausted, returning idle batch");
                Ok(RecordBatch {
                    records: vec![],
                    millis_behind: Some(0),
                    shard_closed: false,
                })
            }
        }
    }
}

#[derive(Debug, Default)]
struct FailurePlan {
    soft_failures_remaining: u32,
    hard: bool,
}

#[derive(Debug, Default)]
struct MockProcessorState {
    processed: Vec<Record>,
    initialized_shards: Vec<String>,
    shutdown_reasons: Vec<ShutdownReason>,
    failures: HashMap<String, FailurePlan>,
}

/// Mock record processor that captures every callback and can be
/// scripted to fail on specific sequence numbers.
#[derive(Debug, Default, Clone)]
pub struct MockRecordProcessor {
    state: Arc<Mutex<MockProcessorState>>,
}

impl MockRecordProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail softly on `sequence_number` for the next `times` attempts,
    /// then succeed.
    pub async fn fail_soft(&self, sequence_number: &str, times: u32) {
        self.state.lock().await.failures.insert(
            sequence_number.to_string(),
            FailurePlan {
                soft_failures_remaining: times,
                hard: false,
            },
        );
    }

    /// Fail hard (non-retriable) every time `sequence_number` is seen.
    pub async fn fail_hard(&self, sequence_number: &str) {
        self.state.lock().await.failures.insert(
            sequence_number.to_string(),
            FailurePlan {
                soft_failures_remaining: 0,
                hard: true,
            },
        );
    }

    /// Sequence numbers of every record processed so far, in order.
    pub async fn processed_sequences(&self) -> Vec<String> {
        self.state
            .lock()
            .await
            .processed
            .iter()
            .map(|r| r.sequence.sequence_number.clone())
            .collect()
    }

    pub async fn processed_count(&self) -> usize {
        self.state.lock().await.processed.len()
    }

    pub async fn initialized_shards(&self) -> Vec<String> {
        self.state.lock().await.initialized_shards.clone()
    }

    pub async fn shutdown_reasons(&self) -> Vec<ShutdownReason> {
        self.state.lock().await.shutdown_reasons.clone()
    }
}

#[async_trait]
impl RecordProcessor for MockRecordProcessor {
    async fn initialize(&self, shard_id: &str) {
        self.state
            .lock()
            .await
            .initialized_shards
            .push(shard_id.to_string());
    }

    async fn process_records(
        &self,
        records: &[Record],
        _checkpointer: &Checkpointer,
    ) -> Result<(), ProcessingError> {
        let mut state = self.state.lock().await;
        for record in records {
            let key = record.sequence.sequence_number.clone();
            if let Some(plan) = state.failures.get_mut(&key) {
                if plan.hard {
                    return Err(ProcessingError::hard(
                        record.sequence.clone(),
                        anyhow::anyhow!("scripted hard failure"),
                    ));
                }
                if plan.soft_failures_remaining > 0 {
                    plan.soft_failures_remaining -= 1;
                    return Err(ProcessingError::soft(
                        record.sequence.clone(),
                        anyhow::anyhow!("scripted soft failure"),
                    ));
                }
            }
            state.processed.push(record.clone());
        }
        Ok(())
    }

    async fn shutdown(&self, reason: ShutdownReason, _checkpointer: &Checkpointer) {
        self.state.lock().await.shutdown_reasons.push(reason);
    }
}
