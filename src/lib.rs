//! Shardflow - a lease-based shard consumption engine
//!
//! This crate coordinates a fleet of workers over a sharded stream:
//! workers claim per-shard leases with conditional writes, consume each
//! owned shard in order, checkpoint durably, and respect parent/child
//! shard boundaries across splits and merges.

pub mod consumer;
pub mod error;
pub mod lease;
pub mod monitoring;
pub mod processor;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod topology;
pub mod transport;
pub mod types;

// Make test utilities available for integration tests
#[cfg(any(test, feature = "test-utils"))]
pub mod test;

pub use error::{EngineError, ProcessingError, Result};
pub use processor::{Checkpointer, RecordProcessor};
pub use retry::{Backoff, ExponentialBackoff, FixedBackoff, RetryConfig};
pub use scheduler::{EngineConfig, WorkerScheduler};
pub use types::{
    Checkpoint, InitialPosition, Lease, Record, SequencePosition, Shard, ShardStatus,
    ShutdownReason,
};

// Re-export main traits
pub use crate::store::{LeaseStore, PutOutcome};
pub use crate::transport::{ReadPosition, RecordBatch, StreamTransport};

// Re-export implementations
#[cfg(feature = "memory-store")]
pub use crate::store::memory::InMemoryLeaseStore;

#[cfg(feature = "dynamodb-store")]
pub use crate::store::dynamodb::DynamoDbLeaseStore;

pub use crate::lease::{is_worker_registration, LeaseConfig, LeaseCoordinator};
pub use crate::monitoring::{EngineEvent, EngineEventType, MonitoringConfig};
pub use crate::transport::KinesisStreamTransport;
