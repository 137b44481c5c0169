use crate::error::LeaseStoreError;
use crate::retry::{ExponentialBackoff, RetryConfig, RetryHandle};
use crate::store::{LeaseStore, PutOutcome};
use crate::types::{Checkpoint, Lease, SequencePosition};
use async_trait::async_trait;
use aws_sdk_dynamodb::{types::AttributeValue, Client as DynamoClient};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, instrument, trace};

const ATTR_SHARD_ID: &str = "shard_id";
const ATTR_OWNER: &str = "lease_owner";
const ATTR_COUNTER: &str = "lease_counter";
const ATTR_CHECKPOINT: &str = "checkpoint";
const ATTR_CHECKPOINT_SUB: &str = "checkpoint_sub_sequence";

// Sentinel stored in the checkpoint attribute for fully consumed shards.
const SHARD_END_SENTINEL: &str = "SHARD_END";

/// DynamoDB-backed lease store.
///
/// One item per shard, keyed by `shard_id`. Optimistic concurrency is
/// expressed with condition expressions on the lease counter; a failed
/// condition maps to `PutOutcome::Rejected`, throttling maps to
/// `LeaseStoreError::Throttled` and is retried with backoff.
#[derive(Debug, Clone)]
pub struct DynamoDbLeaseStore {
    client: DynamoClient,
    table_name: String,
    retry_config: RetryConfig,
    backoff: ExponentialBackoff,
}

impl DynamoDbLeaseStore {
    pub fn builder() -> DynamoDbLeaseStoreBuilder {
        DynamoDbLeaseStoreBuilder::new()
    }

    pub fn new(client: DynamoClient, table_name: String) -> Self {
        Self::builder()
            .with_client(client)
            .with_table_name(table_name)
            .build()
            .expect("Failed to create DynamoDbLeaseStore with default configuration")
    }

    fn lease_to_item(lease: &Lease) -> HashMap<String, AttributeValue> {
        let mut item = HashMap::new();
        item.insert(
            ATTR_SHARD_ID.to_string(),
            AttributeValue::S(lease.shard_id.clone()),
        );
        item.insert(
            ATTR_COUNTER.to_string(),
            AttributeValue::N(lease.lease_counter.to_string()),
        );
        if let Some(owner) = &lease.owner {
            item.insert(ATTR_OWNER.to_string(), AttributeValue::S(owner.clone()));
        }
        match &lease.checkpoint {
            Some(Checkpoint::ShardEnd) => {
                item.insert(
                    ATTR_CHECKPOINT.to_string(),
                    AttributeValue::S(SHARD_END_SENTINEL.to_string()),
                );
            }
            Some(Checkpoint::At(pos)) => {
                item.insert(
                    ATTR_CHECKPOINT.to_string(),
                    AttributeValue::S(pos.sequence_number.clone()),
                );
                if let Some(sub) = pos.sub_sequence_number {
                    item.insert(
                        ATTR_CHECKPOINT_SUB.to_string(),
                        AttributeValue::N(sub.to_string()),
                    );
                }
            }
            None => {}
        }
        item
    }

    fn item_to_lease(item: &HashMap<String, AttributeValue>) -> Result<Lease, LeaseStoreError> {
        let shard_id = item
            .get(ATTR_SHARD_ID)
            .and_then(|v| v.as_s().ok())
            .ok_or_else(|| LeaseStoreError::Corrupt("missing shard_id attribute".to_string()))?
            .to_string();

        let lease_counter = item
            .get(ATTR_COUNTER)
            .and_then(|v| v.as_n().ok())
            .and_then(|n| n.parse::<u64>().ok())
            .ok_or_else(|| {
                LeaseStoreError::Corrupt(format!("bad lease_counter for shard {}", shard_id))
            })?;

        let owner = item
            .get(ATTR_OWNER)
            .and_then(|v| v.as_s().ok())
            .map(|s| s.to_string());

        let checkpoint = match item.get(ATTR_CHECKPOINT).and_then(|v| v.as_s().ok()) {
            None => None,
            Some(s) if s == SHARD_END_SENTINEL => Some(Checkpoint::ShardEnd),
            Some(s) => {
                let sub = item
                    .get(ATTR_CHECKPOINT_SUB)
                    .and_then(|v| v.as_n().ok())
                    .and_then(|n| n.parse::<u64>().ok());
                Some(Checkpoint::At(SequencePosition {
                    sequence_number: s.to_string(),
                    sub_sequence_number: sub,
                }))
            }
        };

        Ok(Lease {
            shard_id,
            owner,
            checkpoint,
            lease_counter,
        })
    }
}

#[async_trait]
impl LeaseStore for DynamoDbLeaseStore {
    #[instrument(skip(self), fields(table = %self.table_name))]
    async fn get_lease(&self, shard_id: &str) -> Result<Option<Lease>, LeaseStoreError> {
        let mut retry = RetryHandle::new(self.retry_config.clone(), self.backoff.clone());
        let (_shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);

        let item = retry
            .retry(
                || async {
                    self.client
                        .get_item()
                        .table_name(&self.table_name)
                        .key(ATTR_SHARD_ID, AttributeValue::S(shard_id.to_string()))
                        .consistent_read(true)
                        .send()
                        .await
                        .map(|response| response.item)
                        .map_err(|e| e.to_string())
                },
                &mut shutdown_rx,
            )
            .await
            .map_err(|e| LeaseStoreError::Unavailable(e.to_string()))?;

        trace!(shard_id = %shard_id, found = item.is_some(), "Fetched lease item");
        item.as_ref().map(Self::item_to_lease).transpose()
    }

    #[instrument(skip(self), fields(table = %self.table_name))]
    async fn list_leases(&self) -> Result<Vec<Lease>, LeaseStoreError> {
        let mut leases = Vec::new();
        let mut start_key: Option<HashMap<String, AttributeValue>> = None;

        loop {
            let response = self
                .client
                .scan()
                .table_name(&self.table_name)
                .consistent_read(true)
                .set_exclusive_start_key(start_key.clone())
                .send()
                .await
                .map_err(|e| {
                    if e.as_service_error()
                        .map(|se| se.is_provisioned_throughput_exceeded_exception())
                        .unwrap_or(false)
                    {
                        LeaseStoreError::Throttled
                    } else {
                        LeaseStoreError::Unavailable(e.to_string())
                    }
                })?;

            for item in response.items() {
                leases.push(Self::item_to_lease(item)?);
            }

            match response.last_evaluated_key() {
                Some(key) => start_key = Some(key.clone()),
                None => break,
            }
        }

        debug!(count = leases.len(), "Listed leases from DynamoDB");
        Ok(leases)
    }

    #[instrument(skip(self, lease), fields(table = %self.table_name, shard_id = %lease.shard_id))]
    async fn put_lease(
        &self,
        lease: &Lease,
        expected_counter: Option<u64>,
    ) -> Result<PutOutcome, LeaseStoreError> {
        let mut request = self
            .client
            .put_item()
            .table_name(&self.table_name)
            .set_item(Some(Self::lease_to_item(lease)));

        request = match expected_counter {
            None => request.condition_expression(format!("attribute_not_exists({})", ATTR_SHARD_ID)),
            Some(expected) => request
                .condition_expression(format!("{} = :expected", ATTR_COUNTER))
                .expression_attribute_values(":expected", AttributeValue::N(expected.to_string())),
        };

        match request.send().await {
            Ok(_) => {
                debug!(
                    shard_id = %lease.shard_id,
                    counter = lease.lease_counter,
                    "Lease written to DynamoDB"
                );
                Ok(PutOutcome::Applied)
            }
            Err(e) => {
                if let Some(service_err) = e.as_service_error() {
                    if service_err.is_conditional_check_failed_exception() {
                        debug!(
                            shard_id = %lease.shard_id,
                            expected = ?expected_counter,
                            "Conditional lease write rejected"
                        );
                        return Ok(PutOutcome::Rejected);
                    }
                    if service_err.is_provisioned_throughput_exceeded_exception() {
                        return Err(LeaseStoreError::Throttled);
                    }
                }
                Err(LeaseStoreError::Unavailable(e.to_string()))
            }
        }
    }
}

#[derive(Debug)]
pub struct DynamoDbLeaseStoreBuilder {
    client: Option<DynamoClient>,
    table_name: Option<String>,
    retry_config: RetryConfig,
    backoff: ExponentialBackoff,
}

impl Default for DynamoDbLeaseStoreBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DynamoDbLeaseStoreBuilder {
    pub fn new() -> Self {
        Self {
            client: None,
            table_name: None,
            retry_config: RetryConfig::default(),
            backoff: ExponentialBackoff::builder()
                .initial_delay(Duration::from_millis(100))
                .max_delay(Duration::from_secs(30))
                .build(),
        }
    }

    pub fn with_client(mut self, client: DynamoClient) -> Self {
        self.client = Some(client);
        self
    }

    pub fn with_table_name(mut self, table_name: String) -> Self {
        self.table_name = Some(table_name);
        self
    }

    pub fn with_retry_config(mut self, config: RetryConfig) -> Self {
        self.retry_config = config;
        self
    }

    pub fn with_backoff(mut self, backoff: ExponentialBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn build(self) -> anyhow::Result<DynamoDbLeaseStore> {
        Ok(DynamoDbLeaseStore {
            client: self
                .client
                .ok_or_else(|| anyhow::anyhow!("DynamoDB client is required"))?,
            table_name: self
                .table_name
                .ok_or_else(|| anyhow::anyhow!("Table name is required"))?,
            retry_config: self.retry_config,
            backoff: self.backoff,
        })
    }
}
