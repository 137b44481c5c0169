use crate::types::Checkpoint;
use std::time::{Duration, SystemTime};

/// Configuration for the monitoring system.
#[derive(Debug, Clone)]
pub struct MonitoringConfig {
    /// Whether monitoring is enabled.
    pub enabled: bool,
    /// Size of the monitoring channel buffer.
    pub channel_size: usize,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            channel_size: 1000,
        }
    }
}

/// Consumer state as reported on the event channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerStateLabel {
    Initializing,
    Processing,
    ShutdownRequested,
    ShuttingDown,
    Done,
}

/// A monitoring event from the engine.
#[derive(Debug, Clone)]
pub struct EngineEvent {
    /// When the event occurred.
    pub timestamp: SystemTime,
    /// ID of the shard this event relates to, if any.
    pub shard_id: Option<String>,
    /// The type of event and its details.
    pub event_type: EngineEventType,
}

/// The different types of events the engine reports.
#[derive(Debug, Clone)]
pub enum EngineEventType {
    LeaseAcquired {
        counter: u64,
    },
    LeaseRenewed {
        counter: u64,
    },
    LeaseLost,
    LeaseReleased,
    CheckpointSaved {
        checkpoint: Checkpoint,
    },
    CheckpointFailure {
        error: String,
    },
    RecordSkipped {
        sequence_number: String,
        attempts: u32,
        error: String,
    },
    BatchComplete {
        record_count: usize,
        duration: Duration,
    },
    ConsumerStateChange {
        state: ConsumerStateLabel,
    },
    ShardCompleted,
}

impl EngineEvent {
    fn new(shard_id: Option<String>, event_type: EngineEventType) -> Self {
        Self {
            timestamp: SystemTime::now(),
            shard_id,
            event_type,
        }
    }

    pub fn lease_acquired(shard_id: String, counter: u64) -> Self {
        Self::new(Some(shard_id), EngineEventType::LeaseAcquired { counter })
    }

    pub fn lease_renewed(shard_id: String, counter: u64) -> Self {
        Self::new(Some(shard_id), EngineEventType::LeaseRenewed { counter })
    }

    pub fn lease_lost(shard_id: String) -> Self {
        Self::new(Some(shard_id), EngineEventType::LeaseLost)
    }

    pub fn lease_released(shard_id: String) -> Self {
        Self::new(Some(shard_id), EngineEventType::LeaseReleased)
    }

    pub fn checkpoint_saved(shard_id: String, checkpoint: Checkpoint) -> Self {
        Self::new(
            Some(shard_id),
            EngineEventType::CheckpointSaved { checkpoint },
        )
    }

    pub fn checkpoint_failure(shard_id: String, error: String) -> Self {
        Self::new(Some(shard_id), EngineEventType::CheckpointFailure { error })
    }

    pub fn record_skipped(
        shard_id: String,
        sequence_number: String,
        attempts: u32,
        error: String,
    ) -> Self {
        Self::new(
            Some(shard_id),
            EngineEventType::RecordSkipped {
                sequence_number,
                attempts,
                error,
            },
        )
    }

    pub fn batch_complete(shard_id: String, record_count: usize, duration: Duration) -> Self {
        Self::new(
            Some(shard_id),
            EngineEventType::BatchComplete {
                record_count,
                duration,
            },
        )
    }

    pub fn state_change(shard_id: String, state: ConsumerStateLabel) -> Self {
        Self::new(Some(shard_id), EngineEventType::ConsumerStateChange { state })
    }

    pub fn shard_completed(shard_id: String) -> Self {
        Self::new(Some(shard_id), EngineEventType::ShardCompleted)
    }
}
