// tests/common/mod.rs
#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use shardflow::error::TransportError;
use shardflow::{
    EngineConfig, InitialPosition, LeaseConfig, MonitoringConfig, ProcessingError, ReadPosition,
    Record, RecordBatch, RecordProcessor, RetryConfig, SequencePosition, Shard, ShutdownReason,
    StreamTransport,
};
use std::collections::HashMap;
use std::sync::{Arc, Once};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

static INIT: Once = Once::new();

pub fn init_logging() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive("shardflow=debug".parse().unwrap()),
            )
            .with_test_writer()
            .try_init()
            .ok();
    });
}

pub fn create_test_config(worker_id: &str) -> EngineConfig {
    EngineConfig {
        application_name: "test-app".to_string(),
        stream_name: "test-stream".to_string(),
        worker_id: Some(worker_id.to_string()),
        batch_size: 100,
        scheduler_tick: Duration::from_millis(20),
        checkpoint_interval: Duration::from_millis(40),
        parent_poll_interval: Duration::from_millis(10),
        idle_poll_delay: Duration::from_millis(10),
        initial_position: InitialPosition::TrimHorizon,
        shutdown_timeout: Duration::from_secs(5),
        lease: LeaseConfig {
            renew_interval: Duration::from_millis(20),
            lease_grace_period: Duration::from_millis(300),
            rebalance_enabled: true,
        },
        record_retry: RetryConfig {
            max_retries: Some(3),
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(5),
            jitter_factor: 0.0,
        },
        monitoring: MonitoringConfig::default(),
    }
}

/// Build a record whose payload names its shard, so a processor shared
/// across shards can still attribute what it saw.
pub fn tagged_record(shard_id: &str, sequence: u64) -> Record {
    Record {
        sequence: SequencePosition::new(sequence.to_string()),
        partition_key: "test-partition-key".to_string(),
        data: Bytes::from(format!("{}:{}", shard_id, sequence)),
        arrival_timestamp: Some(Utc::now()),
    }
}

pub fn tagged_records(shard_id: &str, start: u64, count: u64) -> Vec<Record> {
    (start..start + count)
        .map(|seq| tagged_record(shard_id, seq))
        .collect()
}

#[derive(Default)]
struct ShardScript {
    records: Vec<Record>,
    closes_at_end: bool,
}

/// In-memory stream that honors read positions, so resuming after a
/// checkpoint behaves like the real transport.
#[derive(Default)]
pub struct ScriptedTransport {
    shards: RwLock<Vec<Shard>>,
    scripts: RwLock<HashMap<String, ShardScript>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_shards(&self, shards: Vec<Shard>) {
        *self.shards.write().await = shards;
    }

    /// Seed a shard's full record sequence; the shard reports closed
    /// once a reader drains it.
    pub async fn script_closing_shard(&self, shard_id: &str, records: Vec<Record>) {
        self.scripts.write().await.insert(
            shard_id.to_string(),
            ShardScript {
                records,
                closes_at_end: true,
            },
        );
    }

    /// Seed a shard that stays open after its records run out.
    pub async fn script_open_shard(&self, shard_id: &str, records: Vec<Record>) {
        self.scripts.write().await.insert(
            shard_id.to_string(),
            ShardScript {
                records,
                closes_at_end: false,
            },
        );
    }
}

#[async_trait]
impl StreamTransport for ScriptedTransport {
    async fn list_shards(&self) -> Result<Vec<Shard>, TransportError> {
        Ok(self.shards.read().await.clone())
    }

    async fn get_records(
        &self,
        shard_id: &str,
        from: &ReadPosition,
        limit: usize,
    ) -> Result<RecordBatch, TransportError> {
        let scripts = self.scripts.read().await;
        let script = scripts
            .get(shard_id)
            .ok_or_else(|| TransportError::ShardNotFound(shard_id.to_string()))?;

        let start = match from {
            ReadPosition::Origin(InitialPosition::Latest) => script.records.len(),
            ReadPosition::Origin(_) => 0,
            ReadPosition::After(position) => script
                .records
                .iter()
                .position(|r| r.sequence > *position)
                .unwrap_or(script.records.len()),
        };

        let end = (start + limit).min(script.records.len());
        let records = script.records[start..end].to_vec();
        let drained = end == script.records.len();
        Ok(RecordBatch {
            records,
            millis_behind: Some(0),
            shard_closed: script.closes_at_end && drained,
        })
    }
}

/// Poll the store until the shard's checkpoint equals `expected`.
/// Panics when `timeout` passes first.
pub async fn wait_for_checkpoint(
    store: &shardflow::InMemoryLeaseStore,
    shard_id: &str,
    expected: &shardflow::Checkpoint,
    timeout: Duration,
) {
    use shardflow::LeaseStore;

    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Ok(Some(lease)) = store.get_lease(shard_id).await {
            if lease.checkpoint.as_ref() == Some(expected) {
                return;
            }
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("shard {} never reached checkpoint {}", shard_id, expected);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Processor that appends every payload to a shared log.
pub struct CollectingProcessor {
    log: Arc<Mutex<Vec<String>>>,
}

impl CollectingProcessor {
    pub fn new() -> (Self, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        (Self { log: log.clone() }, log)
    }

    /// A processor feeding an existing log, for multi-worker tests.
    pub fn with_log(log: Arc<Mutex<Vec<String>>>) -> Self {
        Self { log }
    }
}

#[async_trait]
impl RecordProcessor for CollectingProcessor {
    async fn initialize(&self, _shard_id: &str) {}

    async fn process_records(
        &self,
        records: &[Record],
        _checkpointer: &shardflow::Checkpointer,
    ) -> Result<(), ProcessingError> {
        let mut log = self.log.lock().await;
        for record in records {
            log.push(String::from_utf8_lossy(&record.data).into_owned());
        }
        Ok(())
    }

    async fn shutdown(&self, _reason: ShutdownReason, _checkpointer: &shardflow::Checkpointer) {}
}
