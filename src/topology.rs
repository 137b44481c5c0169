//! Shard topology tracking: discovery and parent/child prerequisites.

use crate::error::TransportError;
use crate::transport::StreamTransport;
use crate::types::{Checkpoint, Lease, Shard};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, trace};

/// Discovers shards from the transport and answers the one topology
/// question the engine needs: may this shard be consumed yet?
///
/// A shard's parents must be fully consumed (terminal checkpoint) before
/// the shard itself starts, which keeps ordering across splits and
/// merges. A parent with no lease record at all is treated as consumed;
/// that is what an aged-out, garbage-collected lease looks like.
pub struct ShardTopologyTracker<T> {
    transport: Arc<T>,
    shards: RwLock<HashMap<String, Shard>>,
}

impl<T: StreamTransport> ShardTopologyTracker<T> {
    pub fn new(transport: Arc<T>) -> Self {
        Self {
            transport,
            shards: RwLock::new(HashMap::new()),
        }
    }

    /// Refresh the shard map from the transport.
    ///
    /// Shards are immutable once discovered apart from the open->closed
    /// transition, so refreshing only ever adds entries or flips status.
    pub async fn refresh(&self) -> Result<(), TransportError> {
        let listed = self.transport.list_shards().await?;
        let mut shards = self.shards.write().await;
        for shard in listed {
            trace!(shard_id = %shard.shard_id, status = ?shard.status, "Discovered shard");
            shards.insert(shard.shard_id.clone(), shard);
        }
        debug!(count = shards.len(), "Refreshed shard topology");
        Ok(())
    }

    /// Snapshot of all known shards.
    pub async fn shards(&self) -> Vec<Shard> {
        let shards = self.shards.read().await;
        let mut all: Vec<Shard> = shards.values().cloned().collect();
        all.sort_by(|a, b| a.shard_id.cmp(&b.shard_id));
        all
    }

    /// Look up a single shard.
    pub async fn get(&self, shard_id: &str) -> Option<Shard> {
        self.shards.read().await.get(shard_id).cloned()
    }

    /// True iff every parent of `shard_id` has a terminal checkpoint in
    /// the given lease listing (or no lease record at all).
    ///
    /// An unknown shard has no known parents and is satisfiable; the
    /// next refresh will correct that if the transport disagrees.
    pub async fn parents_satisfied(&self, shard_id: &str, leases: &[Lease]) -> bool {
        let parents = match self.shards.read().await.get(shard_id) {
            Some(shard) => shard.parent_shard_ids.clone(),
            None => return true,
        };

        for parent in &parents {
            let parent_lease = leases.iter().find(|l| &l.shard_id == parent);
            match parent_lease {
                None => continue,
                Some(lease) if lease.checkpoint == Some(Checkpoint::ShardEnd) => continue,
                Some(_) => {
                    trace!(
                        shard_id = %shard_id,
                        parent = %parent,
                        "Parent shard not fully consumed yet"
                    );
                    return false;
                }
            }
        }
        true
    }
}
