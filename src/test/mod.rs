//! Test utilities and mock implementations for exercising the engine
//! without a live stream or lease table.

pub mod mocks;

use crate::types::{Record, SequencePosition};
use bytes::Bytes;
use chrono::Utc;

/// Helper functions for creating test data
pub struct TestUtils;

impl TestUtils {
    /// Create a test record with given sequence number and payload.
    pub fn create_test_record(sequence_number: &str, data: &[u8]) -> Record {
        Record {
            sequence: SequencePosition::new(sequence_number),
            partition_key: "test-partition-key".to_string(),
            data: Bytes::copy_from_slice(data),
            arrival_timestamp: Some(Utc::now()),
        }
    }

    /// Create `count` records with consecutive sequence numbers starting
    /// at `start`.
    pub fn create_sequential_records(start: u64, count: u64) -> Vec<Record> {
        (start..start + count)
            .map(|seq| Self::create_test_record(&seq.to_string(), format!("data-{}", seq).as_bytes()))
            .collect()
    }
}
