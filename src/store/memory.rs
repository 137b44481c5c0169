use crate::error::LeaseStoreError;
use crate::store::{LeaseStore, PutOutcome};
use crate::types::Lease;
use async_trait::async_trait;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::RwLock;
use tracing::{debug, instrument, trace};

/// In-memory implementation of lease storage.
///
/// Compare-and-swap semantics match the durable implementations, so a
/// single instance shared between workers in tests behaves like a real
/// coordination table.
#[derive(Debug, Default, Clone)]
pub struct InMemoryLeaseStore {
    leases: Arc<RwLock<HashMap<String, Lease>>>,
}

impl InMemoryLeaseStore {
    pub fn new() -> Self {
        debug!("Initializing in-memory lease store");
        Self {
            leases: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Clear all leases (useful for testing).
    #[cfg(any(test, feature = "test-utils"))]
    pub async fn clear(&self) {
        self.leases.write().await.clear();
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    #[instrument(skip(self))]
    async fn get_lease(&self, shard_id: &str) -> Result<Option<Lease>, LeaseStoreError> {
        let leases = self.leases.read().await;
        let lease = leases.get(shard_id).cloned();
        trace!(shard_id = %shard_id, lease = ?lease, "Retrieved lease from memory");
        Ok(lease)
    }

    async fn list_leases(&self) -> Result<Vec<Lease>, LeaseStoreError> {
        let leases = self.leases.read().await;
        let mut all: Vec<Lease> = leases.values().cloned().collect();
        all.sort_by(|a, b| a.shard_id.cmp(&b.shard_id));
        Ok(all)
    }

    #[instrument(skip(self, lease), fields(shard_id = %lease.shard_id))]
    async fn put_lease(
        &self,
        lease: &Lease,
        expected_counter: Option<u64>,
    ) -> Result<PutOutcome, LeaseStoreError> {
        let mut leases = self.leases.write().await;

        let matches = match (leases.get(&lease.shard_id), expected_counter) {
            (None, None) => true,
            (Some(stored), Some(expected)) => stored.lease_counter == expected,
            _ => false,
        };

        if !matches {
            debug!(
                shard_id = %lease.shard_id,
                expected = ?expected_counter,
                "Conditional lease write rejected"
            );
            return Ok(PutOutcome::Rejected);
        }

        leases.insert(lease.shard_id.clone(), lease.clone());
        trace!(
            shard_id = %lease.shard_id,
            counter = lease.lease_counter,
            "Lease written to memory"
        );
        Ok(PutOutcome::Applied)
    }
}
