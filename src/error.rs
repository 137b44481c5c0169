//! Error types for the shard consumption engine.

use crate::types::SequencePosition;
use thiserror::Error;
use tokio::task::JoinError;

/// Main error type for engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Lease for shard {0} is held by another worker")]
    LeaseLost(String),

    #[error("Throttled: {0}")]
    Throttling(String),

    #[error("Lease store unreachable beyond retry budget: {0}")]
    StoreUnavailable(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Record processing failed: {0}")]
    RecordProcessing(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Shutdown requested")]
    Shutdown,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Error type for lease store operations.
///
/// A conditional write that loses the race is not an error; the store
/// reports it as `PutOutcome::Rejected`. These variants cover the store
/// itself misbehaving.
#[derive(Debug, Error)]
pub enum LeaseStoreError {
    #[error("Lease store throttled the request")]
    Throttled,

    #[error("Lease store unavailable: {0}")]
    Unavailable(String),

    #[error("Corrupt lease record: {0}")]
    Corrupt(String),
}

impl From<LeaseStoreError> for EngineError {
    fn from(err: LeaseStoreError) -> Self {
        match err {
            LeaseStoreError::Throttled => EngineError::Throttling("lease store".to_string()),
            LeaseStoreError::Unavailable(msg) => EngineError::StoreUnavailable(msg),
            LeaseStoreError::Corrupt(msg) => EngineError::StoreUnavailable(msg),
        }
    }
}

/// Error type for stream transport operations.
///
/// A closed shard is reported on the record batch, never as an error, so
/// callers can always distinguish "shard finished" from "read failed".
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Transport throttled the request")]
    Throttled,

    #[error("Shard not found: {0}")]
    ShardNotFound(String),

    #[error("Transport I/O failure: {0}")]
    Io(String),
}

/// Error returned by an application `RecordProcessor` callback.
///
/// Both variants name the record the callback could not handle, so the
/// engine can retry or skip from exactly that position. Records earlier
/// in the batch are taken as dispatched.
#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("Soft failure (retriable) at {sequence}: {source}")]
    SoftFailure {
        sequence: SequencePosition,
        #[source]
        source: anyhow::Error,
    },

    #[error("Hard failure (non-retriable) at {sequence}: {source}")]
    HardFailure {
        sequence: SequencePosition,
        #[source]
        source: anyhow::Error,
    },
}

impl ProcessingError {
    pub fn soft(sequence: SequencePosition, err: impl Into<anyhow::Error>) -> Self {
        ProcessingError::SoftFailure {
            sequence,
            source: err.into(),
        }
    }

    pub fn hard(sequence: SequencePosition, err: impl Into<anyhow::Error>) -> Self {
        ProcessingError::HardFailure {
            sequence,
            source: err.into(),
        }
    }

    pub fn sequence(&self) -> &SequencePosition {
        match self {
            ProcessingError::SoftFailure { sequence, .. } => sequence,
            ProcessingError::HardFailure { sequence, .. } => sequence,
        }
    }
}

/// A checkpoint request pointing past the last dispatched record.
#[derive(Debug, Error)]
#[error("Checkpoint position {position} is past the last dispatched record")]
pub struct CheckpointRejected {
    pub position: SequencePosition,
}

/// Error type for retry operations.
#[derive(Debug, Error)]
pub enum RetryError {
    #[error("Maximum retries ({0}) exceeded: {1}")]
    MaxRetriesExceeded(u32, String),

    #[error("Backoff interrupted")]
    Interrupted,
}

impl From<RetryError> for EngineError {
    fn from(err: RetryError) -> Self {
        match err {
            RetryError::MaxRetriesExceeded(attempts, msg) => {
                EngineError::StoreUnavailable(format!("After {} attempts: {}", attempts, msg))
            }
            RetryError::Interrupted => EngineError::Shutdown,
        }
    }
}

impl From<JoinError> for EngineError {
    fn from(err: JoinError) -> Self {
        EngineError::Other(err.into())
    }
}
