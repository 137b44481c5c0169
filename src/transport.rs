//! Stream transport abstraction and the Kinesis-backed implementation.

use crate::error::TransportError;
use crate::types::{InitialPosition, Record, SequencePosition, Shard, ShardStatus};
use async_trait::async_trait;
use aws_sdk_kinesis::types::ShardIteratorType;
use aws_sdk_kinesis::Client;
use aws_smithy_types_convert::date_time::DateTimeExt;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::{debug, trace, warn};

/// Where to start a read within one shard.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadPosition {
    /// No checkpoint yet; apply the configured initial position policy.
    Origin(InitialPosition),
    /// Resume after the given (checkpointed) position.
    After(SequencePosition),
}

/// One transport read.
///
/// `shard_closed` is an explicit signal from the transport; an empty
/// `records` list by itself never means the shard is finished.
#[derive(Debug, Clone, Default)]
pub struct RecordBatch {
    pub records: Vec<Record>,
    pub millis_behind: Option<i64>,
    pub shard_closed: bool,
}

/// Trait for pulling shard topology and records from the stream.
#[async_trait]
pub trait StreamTransport: Send + Sync {
    /// List every shard of the stream, including closed ones, with
    /// parent relationships.
    async fn list_shards(&self) -> Result<Vec<Shard>, TransportError>;

    /// Read up to `limit` records from `shard_id` starting after `from`.
    async fn get_records(
        &self,
        shard_id: &str,
        from: &ReadPosition,
        limit: usize,
    ) -> Result<RecordBatch, TransportError>;
}

enum FetchError {
    Expired,
    Other(TransportError),
}

/// Kinesis-backed transport.
///
/// Keeps one shard iterator per shard between calls and transparently
/// refreshes it when it expires. A missing next-iterator from the
/// service is the closed-shard signal.
pub struct KinesisStreamTransport {
    client: Client,
    stream_name: String,
    iterators: Mutex<HashMap<String, String>>,
}

impl KinesisStreamTransport {
    pub fn new(client: Client, stream_name: impl Into<String>) -> Self {
        Self {
            client,
            stream_name: stream_name.into(),
            iterators: Mutex::new(HashMap::new()),
        }
    }

    async fn fetch_iterator(
        &self,
        shard_id: &str,
        from: &ReadPosition,
    ) -> Result<String, TransportError> {
        let mut request = self
            .client
            .get_shard_iterator()
            .stream_name(&self.stream_name)
            .shard_id(shard_id);

        request = match from {
            ReadPosition::After(pos) => request
                .shard_iterator_type(ShardIteratorType::AfterSequenceNumber)
                .starting_sequence_number(&pos.sequence_number),
            ReadPosition::Origin(InitialPosition::TrimHorizon) => {
                request.shard_iterator_type(ShardIteratorType::TrimHorizon)
            }
            ReadPosition::Origin(InitialPosition::Latest) => {
                request.shard_iterator_type(ShardIteratorType::Latest)
            }
            ReadPosition::Origin(InitialPosition::AtTimestamp(ts)) => request
                .shard_iterator_type(ShardIteratorType::AtTimestamp)
                .timestamp(aws_smithy_types::DateTime::from_chrono_utc(*ts)),
        };

        let response = request.send().await.map_err(|e| {
            if let Some(service_err) = e.as_service_error() {
                if service_err.is_resource_not_found_exception() {
                    return TransportError::ShardNotFound(shard_id.to_string());
                }
                if service_err.is_provisioned_throughput_exceeded_exception() {
                    return TransportError::Throttled;
                }
            }
            TransportError::Io(e.to_string())
        })?;

        response
            .shard_iterator
            .ok_or_else(|| TransportError::Io("service returned no shard iterator".to_string()))
    }

    async fn try_get_records(
        &self,
        iterator: &str,
        limit: usize,
    ) -> Result<(Vec<Record>, Option<String>, Option<i64>), FetchError> {
        let response = self
            .client
            .get_records()
            .shard_iterator(iterator)
            .limit(limit as i32)
            .send()
            .await
            .map_err(|e| {
                if let Some(service_err) = e.as_service_error() {
                    if service_err.is_expired_iterator_exception() {
                        return FetchError::Expired;
                    }
                    if service_err.is_provisioned_throughput_exceeded_exception() {
                        return FetchError::Other(TransportError::Throttled);
                    }
                }
                FetchError::Other(TransportError::Io(e.to_string()))
            })?;

        let records = response.records().iter().map(convert_record).collect();
        let next = response.next_shard_iterator().map(String::from);
        Ok((records, next, response.millis_behind_latest))
    }
}

#[async_trait]
impl StreamTransport for KinesisStreamTransport {
    async fn list_shards(&self) -> Result<Vec<Shard>, TransportError> {
        let mut shards = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            let mut request = self.client.list_shards();
            // The service rejects stream_name on continuation calls.
            request = match &next_token {
                Some(token) => request.next_token(token),
                None => request.stream_name(&self.stream_name),
            };

            let response = request.send().await.map_err(|e| {
                if e.as_service_error()
                    .map(|se| se.is_resource_not_found_exception())
                    .unwrap_or(false)
                {
                    TransportError::ShardNotFound(self.stream_name.clone())
                } else {
                    TransportError::Io(e.to_string())
                }
            })?;

            shards.extend(response.shards().iter().map(convert_shard));

            match response.next_token() {
                Some(token) => next_token = Some(token.to_string()),
                None => break,
            }
        }

        debug!(stream = %self.stream_name, count = shards.len(), "Listed shards");
        Ok(shards)
    }

    async fn get_records(
        &self,
        shard_id: &str,
        from: &ReadPosition,
        limit: usize,
    ) -> Result<RecordBatch, TransportError> {
        let cached = self.iterators.lock().get(shard_id).cloned();
        let iterator = match cached {
            Some(it) => it,
            None => self.fetch_iterator(shard_id, from).await?,
        };

        let fetched = match self.try_get_records(&iterator, limit).await {
            Ok(fetched) => fetched,
            Err(FetchError::Expired) => {
                warn!(shard_id = %shard_id, "Shard iterator expired, refreshing");
                self.iterators.lock().remove(shard_id);
                let iterator = self.fetch_iterator(shard_id, from).await?;
                self.try_get_records(&iterator, limit)
                    .await
                    .map_err(|e| match e {
                        FetchError::Expired => {
                            TransportError::Io("iterator expired immediately after refresh".to_string())
                        }
                        FetchError::Other(err) => err,
                    })?
            }
            Err(FetchError::Other(err)) => return Err(err),
        };

        let (records, next_iterator, millis_behind) = fetched;
        let shard_closed = next_iterator.is_none();
        {
            let mut iterators = self.iterators.lock();
            match next_iterator {
                Some(next) => {
                    iterators.insert(shard_id.to_string(), next);
                }
                None => {
                    iterators.remove(shard_id);
                }
            }
        }

        trace!(
            shard_id = %shard_id,
            count = records.len(),
            shard_closed = shard_closed,
            "Fetched record batch"
        );

        Ok(RecordBatch {
            records,
            millis_behind,
            shard_closed,
        })
    }
}

fn convert_shard(shard: &aws_sdk_kinesis::types::Shard) -> Shard {
    let mut parents = Vec::new();
    if let Some(parent) = shard.parent_shard_id() {
        parents.push(parent.to_string());
    }
    if let Some(adjacent) = shard.adjacent_parent_shard_id() {
        parents.push(adjacent.to_string());
    }

    let status = if shard
        .sequence_number_range()
        .and_then(|range| range.ending_sequence_number())
        .is_some()
    {
        ShardStatus::Closed
    } else {
        ShardStatus::Open
    };

    Shard {
        shard_id: shard.shard_id().to_string(),
        parent_shard_ids: parents,
        status,
    }
}

fn convert_record(record: &aws_sdk_kinesis::types::Record) -> Record {
    Record {
        sequence: SequencePosition::new(record.sequence_number()),
        partition_key: record.partition_key().to_string(),
        data: Bytes::copy_from_slice(record.data().as_ref()),
        arrival_timestamp: record
            .approximate_arrival_timestamp()
            .and_then(|ts| ts.to_chrono_utc().ok()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_kinesis::types::{SequenceNumberRange, Shard as AwsShard};

    fn aws_shard(
        shard_id: &str,
        parent: Option<&str>,
        adjacent: Option<&str>,
        ending: Option<&str>,
    ) -> AwsShard {
        let mut range = SequenceNumberRange::builder().starting_sequence_number("0");
        if let Some(end) = ending {
            range = range.ending_sequence_number(end);
        }

        let mut builder = AwsShard::builder()
            .shard_id(shard_id)
            .hash_key_range(
                aws_sdk_kinesis::types::HashKeyRange::builder()
                    .starting_hash_key("0")
                    .ending_hash_key("1")
                    .build()
                    .unwrap(),
            )
            .sequence_number_range(range.build().unwrap());
        if let Some(parent) = parent {
            builder = builder.parent_shard_id(parent);
        }
        if let Some(adjacent) = adjacent {
            builder = builder.adjacent_parent_shard_id(adjacent);
        }
        builder.build().unwrap()
    }

    #[test]
    fn test_convert_open_shard_without_parents() {
        let shard = convert_shard(&aws_shard("shard-0", None, None, None));
        assert_eq!(shard.shard_id, "shard-0");
        assert!(shard.parent_shard_ids.is_empty());
        assert_eq!(shard.status, ShardStatus::Open);
    }

    #[test]
    fn test_convert_merged_shard_has_two_parents() {
        let shard = convert_shard(&aws_shard("shard-2", Some("shard-0"), Some("shard-1"), None));
        assert_eq!(shard.parent_shard_ids, vec!["shard-0", "shard-1"]);
    }

    #[test]
    fn test_ending_sequence_number_marks_closed() {
        let shard = convert_shard(&aws_shard("shard-0", None, None, Some("100")));
        assert_eq!(shard.status, ShardStatus::Closed);
    }

    #[test]
    fn test_convert_record_copies_payload() {
        let aws_record = aws_sdk_kinesis::types::Record::builder()
            .sequence_number("42")
            .partition_key("pk-1")
            .data(aws_smithy_types::Blob::new(b"payload".to_vec()))
            .build()
            .unwrap();

        let record = convert_record(&aws_record);
        assert_eq!(record.sequence, SequencePosition::new("42"));
        assert_eq!(record.partition_key, "pk-1");
        assert_eq!(record.data.as_ref(), b"payload");
    }
}
