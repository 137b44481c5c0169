//! Core data model: shards, leases, checkpoints and records.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Whether a shard can still receive records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShardStatus {
    Open,
    Closed,
}

/// A partition of the stream as reported by the transport.
///
/// Shards are immutable once discovered, except for the
/// `Open` -> `Closed` status transition. A shard has zero parents
/// (original shard), one parent (split) or two parents (merge).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shard {
    pub shard_id: String,
    pub parent_shard_ids: Vec<String>,
    pub status: ShardStatus,
}

impl Shard {
    pub fn new(shard_id: impl Into<String>) -> Self {
        Self {
            shard_id: shard_id.into(),
            parent_shard_ids: Vec::new(),
            status: ShardStatus::Open,
        }
    }

    pub fn with_parents(mut self, parents: Vec<String>) -> Self {
        self.parent_shard_ids = parents;
        self
    }

    pub fn closed(mut self) -> Self {
        self.status = ShardStatus::Closed;
        self
    }
}

/// A position within a shard's record sequence.
///
/// Sequence numbers are decimal strings of arbitrary length; ordering is
/// numeric (shorter strings compare smaller, equal lengths compare
/// lexicographically). The sub-sequence number disambiguates de-aggregated
/// records sharing one sequence number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequencePosition {
    pub sequence_number: String,
    pub sub_sequence_number: Option<u64>,
}

impl SequencePosition {
    pub fn new(sequence_number: impl Into<String>) -> Self {
        Self {
            sequence_number: sequence_number.into(),
            sub_sequence_number: None,
        }
    }

    pub fn with_sub_sequence(sequence_number: impl Into<String>, sub: u64) -> Self {
        Self {
            sequence_number: sequence_number.into(),
            sub_sequence_number: Some(sub),
        }
    }

    fn digits(&self) -> &str {
        let trimmed = self.sequence_number.trim_start_matches('0');
        if trimmed.is_empty() {
            "0"
        } else {
            trimmed
        }
    }
}

impl Ord for SequencePosition {
    fn cmp(&self, other: &Self) -> Ordering {
        let a = self.digits();
        let b = other.digits();
        a.len()
            .cmp(&b.len())
            .then_with(|| a.cmp(b))
            .then_with(|| {
                self.sub_sequence_number
                    .unwrap_or(0)
                    .cmp(&other.sub_sequence_number.unwrap_or(0))
            })
    }
}

impl PartialOrd for SequencePosition {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Equality and hashing must agree with the numeric ordering, which
// ignores leading zeros.
impl PartialEq for SequencePosition {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SequencePosition {}

impl std::hash::Hash for SequencePosition {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.digits().hash(state);
        self.sub_sequence_number.unwrap_or(0).hash(state);
    }
}

impl fmt::Display for SequencePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.sub_sequence_number {
            Some(sub) => write!(f, "{}#{}", self.sequence_number, sub),
            None => write!(f, "{}", self.sequence_number),
        }
    }
}

/// Durably recorded progress within one shard.
///
/// `ShardEnd` is the terminal marker: the shard has been fully consumed
/// and child shards become eligible for processing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Checkpoint {
    At(SequencePosition),
    ShardEnd,
}

impl Checkpoint {
    pub fn at(sequence_number: impl Into<String>) -> Self {
        Checkpoint::At(SequencePosition::new(sequence_number))
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Checkpoint::ShardEnd)
    }
}

impl Ord for Checkpoint {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Checkpoint::ShardEnd, Checkpoint::ShardEnd) => Ordering::Equal,
            (Checkpoint::ShardEnd, _) => Ordering::Greater,
            (_, Checkpoint::ShardEnd) => Ordering::Less,
            (Checkpoint::At(a), Checkpoint::At(b)) => a.cmp(b),
        }
    }
}

impl PartialOrd for Checkpoint {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Checkpoint::At(pos) => write!(f, "{}", pos),
            Checkpoint::ShardEnd => write!(f, "SHARD_END"),
        }
    }
}

/// An ownership claim over one shard, persisted in the lease store.
///
/// The counter increases on every successful write and backs the
/// optimistic concurrency scheme: a write conditioned on a stale counter
/// is rejected by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub shard_id: String,
    pub owner: Option<String>,
    pub checkpoint: Option<Checkpoint>,
    pub lease_counter: u64,
}

impl Lease {
    /// A fresh, unowned lease for a newly discovered shard.
    pub fn unowned(shard_id: impl Into<String>) -> Self {
        Self {
            shard_id: shard_id.into(),
            owner: None,
            checkpoint: None,
            lease_counter: 0,
        }
    }

    pub fn is_unowned(&self) -> bool {
        self.owner.is_none()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.checkpoint, Some(Checkpoint::ShardEnd))
    }
}

/// A single record pulled from a shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub sequence: SequencePosition,
    pub partition_key: String,
    pub data: Bytes,
    pub arrival_timestamp: Option<DateTime<Utc>>,
}

impl Record {
    pub fn new(sequence: SequencePosition, partition_key: impl Into<String>, data: Bytes) -> Self {
        Self {
            sequence,
            partition_key: partition_key.into(),
            data,
            arrival_timestamp: None,
        }
    }
}

/// Why a shard consumer is shutting down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// The shard is closed and every record was dispatched. A final
    /// terminal checkpoint is written so child shards become eligible.
    ShardEnd,
    /// Another worker now owns the lease. No checkpoint may be written
    /// after this is observed.
    LeaseLost,
    /// Fleet-wide graceful shutdown was requested.
    WorkerShutdown,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::ShardEnd => write!(f, "shard end"),
            ShutdownReason::LeaseLost => write!(f, "lease lost"),
            ShutdownReason::WorkerShutdown => write!(f, "worker shutdown"),
        }
    }
}

/// Where to start reading a shard that has no checkpoint yet.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InitialPosition {
    /// Start from the oldest available record.
    TrimHorizon,
    /// Start from the newest record.
    Latest,
    /// Start from a specific timestamp.
    AtTimestamp(DateTime<Utc>),
}
