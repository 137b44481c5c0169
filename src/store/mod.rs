//! Durable lease storage for fleet-wide coordination.
//!
//! The lease store is the single source of truth: every mutation is a
//! conditional write keyed by the lease counter, so contention across
//! workers is resolved by "loser's write rejected" instead of a
//! distributed lock.

use crate::error::LeaseStoreError;
use crate::types::Lease;
use async_trait::async_trait;

#[cfg(feature = "dynamodb-store")]
pub mod dynamodb;
pub mod memory;

/// Outcome of a conditional lease write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// The expected counter matched and the lease was written.
    Applied,
    /// Another writer got there first; the stored lease is unchanged.
    Rejected,
}

/// Trait for durable, strongly consistent lease storage.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Retrieve the lease for a given shard.
    async fn get_lease(&self, shard_id: &str) -> Result<Option<Lease>, LeaseStoreError>;

    /// List every lease in the table.
    async fn list_leases(&self) -> Result<Vec<Lease>, LeaseStoreError>;

    /// Conditionally write a lease.
    ///
    /// `expected_counter` is the counter the caller last observed;
    /// `None` means the lease must not exist yet (create). The write is
    /// applied only if the stored state matches.
    async fn put_lease(
        &self,
        lease: &Lease,
        expected_counter: Option<u64>,
    ) -> Result<PutOutcome, LeaseStoreError>;
}

// Re-export implementations
#[cfg(feature = "dynamodb-store")]
pub use dynamodb::DynamoDbLeaseStore;
pub use memory::InMemoryLeaseStore;
