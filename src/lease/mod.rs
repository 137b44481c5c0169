//! Lease coordination: claiming, renewing, stealing and rebalancing
//! shard leases across a worker fleet.
//!
//! All coordination happens through conditional writes against the lease
//! store. There is no central scheduler and no lock service: a worker
//! that loses a write race simply relinquishes, and a worker that stops
//! renewing is presumed dead once its lease counter has not moved for a
//! grace period.

use crate::error::{EngineError, LeaseStoreError, Result};
use crate::monitoring::EngineEvent;
use crate::store::{LeaseStore, PutOutcome};
use crate::types::{Checkpoint, Lease};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Configuration for lease coordination.
#[derive(Debug, Clone)]
pub struct LeaseConfig {
    /// How often owned leases are re-written to prove liveness.
    pub renew_interval: Duration,
    /// How long a lease counter may stay unchanged before the owner is
    /// presumed dead and the lease becomes stealable. Also bounds how
    /// long this worker keeps claiming ownership when the store is
    /// unreachable.
    pub lease_grace_period: Duration,
    /// Whether this worker voluntarily sheds excess leases.
    pub rebalance_enabled: bool,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            renew_interval: Duration::from_secs(10),
            lease_grace_period: Duration::from_secs(30),
            rebalance_enabled: true,
        }
    }
}

/// Shard-id prefix for per-worker registration rows in the lease table.
/// Real shard ids never contain `#`, so the namespaces cannot collide.
const WORKER_KEY_PREFIX: &str = "worker#";

/// Whether a lease row is a worker registration rather than a shard
/// lease.
pub fn is_worker_registration(lease: &Lease) -> bool {
    lease.shard_id.starts_with(WORKER_KEY_PREFIX)
}

/// Lease ownership changes reported to the scheduler.
#[derive(Debug, Clone)]
pub enum LeaseEvent {
    Acquired(Lease),
    Renewed(Lease),
    Lost(String),
    Released(String),
}

#[derive(Debug)]
struct LeaseObservation {
    counter: u64,
    last_changed: Instant,
}

/// Claims, renews and releases leases on behalf of one worker.
pub struct LeaseCoordinator<S> {
    store: Arc<S>,
    worker_id: String,
    config: LeaseConfig,
    owned: RwLock<HashMap<String, Lease>>,
    observations: parking_lot::Mutex<HashMap<String, LeaseObservation>>,
    registration_counter: parking_lot::Mutex<u64>,
    event_tx: mpsc::Sender<LeaseEvent>,
    monitoring_tx: Option<mpsc::Sender<EngineEvent>>,
}

impl<S: LeaseStore> LeaseCoordinator<S> {
    pub fn new(
        store: Arc<S>,
        worker_id: impl Into<String>,
        config: LeaseConfig,
        monitoring_tx: Option<mpsc::Sender<EngineEvent>>,
    ) -> (Arc<Self>, mpsc::Receiver<LeaseEvent>) {
        let (event_tx, event_rx) = mpsc::channel(64);
        let coordinator = Arc::new(Self {
            store,
            worker_id: worker_id.into(),
            config,
            owned: RwLock::new(HashMap::new()),
            observations: parking_lot::Mutex::new(HashMap::new()),
            registration_counter: parking_lot::Mutex::new(0),
            event_tx,
            monitoring_tx,
        });
        (coordinator, event_rx)
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    async fn send_event(&self, event: LeaseEvent) {
        // Best-effort: the scheduler reconciles against the owned set on
        // every tick, so a dropped event only delays a consumer start.
        if let Err(e) = self.event_tx.try_send(event) {
            trace!(error = %e, "Lease event not delivered");
        }
    }

    async fn send_monitoring_event(&self, event: EngineEvent) {
        if let Some(tx) = &self.monitoring_tx {
            if tx.try_send(event).is_err() {
                warn!("Monitoring channel full, dropping lease event");
            }
        }
    }

    /// Read the full lease table. Never mutates.
    pub async fn list_leases(&self) -> Result<Vec<Lease>> {
        Ok(self.store.list_leases().await?)
    }

    fn registration_key(&self) -> String {
        format!("{}{}", WORKER_KEY_PREFIX, self.worker_id)
    }

    /// Announce this worker in the lease table.
    ///
    /// Idle workers are otherwise invisible: rebalancing counts live
    /// workers, and a worker owning no lease would never receive one.
    /// The registration row is kept alive by the renewal loop, expires
    /// on the same grace period as a shard lease, and is cleared at
    /// deregistration.
    pub async fn register_worker(&self) -> Result<()> {
        self.heartbeat().await?;
        info!(worker_id = %self.worker_id, "Worker registered");
        Ok(())
    }

    /// Bump the registration row's counter to prove liveness. Creates
    /// the row when missing, adopts it after a restart with the same
    /// worker id.
    async fn heartbeat(&self) -> std::result::Result<(), LeaseStoreError> {
        let key = self.registration_key();
        let current = *self.registration_counter.lock();
        let mut row = Lease {
            shard_id: key.clone(),
            owner: Some(self.worker_id.clone()),
            checkpoint: None,
            lease_counter: current + 1,
        };

        if self.store.put_lease(&row, Some(current)).await? == PutOutcome::Applied {
            *self.registration_counter.lock() = row.lease_counter;
            return Ok(());
        }

        // Stale counter (restart with a stable id) or no row yet.
        match self.store.get_lease(&key).await? {
            Some(existing) => {
                row.lease_counter = existing.lease_counter + 1;
                if self
                    .store
                    .put_lease(&row, Some(existing.lease_counter))
                    .await?
                    == PutOutcome::Applied
                {
                    *self.registration_counter.lock() = row.lease_counter;
                } else {
                    warn!(
                        worker_id = %self.worker_id,
                        "Worker registration contested; is the worker id unique?"
                    );
                }
            }
            None => {
                row.lease_counter = 0;
                if self.store.put_lease(&row, None).await? == PutOutcome::Applied {
                    *self.registration_counter.lock() = 0;
                }
            }
        }
        Ok(())
    }

    /// Clear this worker's registration row so peers stop counting it
    /// immediately instead of waiting out the grace period.
    pub async fn deregister_worker(&self) {
        let current = *self.registration_counter.lock();
        let row = Lease {
            shard_id: self.registration_key(),
            owner: None,
            checkpoint: None,
            lease_counter: current + 1,
        };
        match self.store.put_lease(&row, Some(current)).await {
            Ok(PutOutcome::Applied) => {
                info!(worker_id = %self.worker_id, "Worker deregistered");
            }
            Ok(PutOutcome::Rejected) => {
                debug!(worker_id = %self.worker_id, "Deregistration raced; row will expire");
            }
            Err(e) => {
                warn!(worker_id = %self.worker_id, error = %e, "Worker deregistration failed");
            }
        }
    }

    /// Write a fresh unowned lease for a newly discovered shard.
    ///
    /// Losing the create race to another worker is the expected outcome
    /// for every worker but one, so a rejection is not an error.
    pub async fn create_lease_if_absent(&self, shard_id: &str) -> Result<()> {
        let lease = Lease::unowned(shard_id);
        match self.store.put_lease(&lease, None).await? {
            PutOutcome::Applied => {
                info!(shard_id = %shard_id, "Created lease for new shard");
            }
            PutOutcome::Rejected => {
                trace!(shard_id = %shard_id, "Lease already exists");
            }
        }
        Ok(())
    }

    /// Record counter movement for every listed lease. Expiry decisions
    /// are based on how long a counter has been stationary.
    pub fn observe(&self, leases: &[Lease]) {
        let now = Instant::now();
        let mut observations = self.observations.lock();
        for lease in leases {
            match observations.get_mut(&lease.shard_id) {
                Some(obs) if obs.counter == lease.lease_counter => {}
                Some(obs) => {
                    obs.counter = lease.lease_counter;
                    obs.last_changed = now;
                }
                None => {
                    observations.insert(
                        lease.shard_id.clone(),
                        LeaseObservation {
                            counter: lease.lease_counter,
                            last_changed: now,
                        },
                    );
                }
            }
        }
    }

    /// Whether the lease's owner has failed to renew for longer than the
    /// grace period, making the lease stealable.
    pub fn is_expired(&self, lease: &Lease) -> bool {
        let observations = self.observations.lock();
        match observations.get(&lease.shard_id) {
            Some(obs) if obs.counter == lease.lease_counter => {
                obs.last_changed.elapsed() > self.config.lease_grace_period
            }
            // Counter moved since we last looked, or never observed:
            // the owner is live as far as we know.
            _ => false,
        }
    }

    /// Whether this lease may be claimed by this worker right now.
    ///
    /// A lease recorded under our own worker id but absent from the
    /// local owned set is left over from a previous session and may be
    /// re-adopted immediately.
    pub async fn is_acquirable(&self, lease: &Lease) -> bool {
        if lease.is_terminal() || is_worker_registration(lease) {
            return false;
        }
        match &lease.owner {
            None => true,
            Some(owner) if owner == &self.worker_id => {
                !self.owned.read().await.contains_key(&lease.shard_id)
            }
            Some(_) => self.is_expired(lease),
        }
    }

    /// Attempt to claim `lease` with a conditional write.
    ///
    /// Fails with `LeaseLost` if another worker wrote first; the caller
    /// must re-list leases and move on.
    pub async fn acquire_lease(&self, lease: &Lease) -> Result<Lease> {
        let mut claimed = lease.clone();
        claimed.owner = Some(self.worker_id.clone());
        claimed.lease_counter = lease.lease_counter + 1;

        match self
            .store
            .put_lease(&claimed, Some(lease.lease_counter))
            .await?
        {
            PutOutcome::Applied => {
                info!(
                    shard_id = %claimed.shard_id,
                    counter = claimed.lease_counter,
                    previous_owner = ?lease.owner,
                    "Acquired lease"
                );
                self.owned
                    .write()
                    .await
                    .insert(claimed.shard_id.clone(), claimed.clone());
                self.send_monitoring_event(EngineEvent::lease_acquired(
                    claimed.shard_id.clone(),
                    claimed.lease_counter,
                ))
                .await;
                self.send_event(LeaseEvent::Acquired(claimed.clone())).await;
                Ok(claimed)
            }
            PutOutcome::Rejected => {
                debug!(shard_id = %lease.shard_id, "Lost acquire race");
                Err(EngineError::LeaseLost(lease.shard_id.clone()))
            }
        }
    }

    /// Re-write every owned lease with an incremented counter.
    ///
    /// A rejected renewal means the lease was stolen: it is dropped
    /// locally and reported as lost. Store errors are returned so the
    /// renewal loop can track how stale our claims are.
    pub async fn renew_owned(&self) -> std::result::Result<(), LeaseStoreError> {
        let snapshot: Vec<Lease> = self.owned.read().await.values().cloned().collect();

        for lease in snapshot {
            let mut renewed = lease.clone();
            renewed.lease_counter = lease.lease_counter + 1;

            match self
                .store
                .put_lease(&renewed, Some(lease.lease_counter))
                .await?
            {
                PutOutcome::Applied => {
                    trace!(
                        shard_id = %renewed.shard_id,
                        counter = renewed.lease_counter,
                        "Renewed lease"
                    );
                    self.owned
                        .write()
                        .await
                        .insert(renewed.shard_id.clone(), renewed.clone());
                    self.send_monitoring_event(EngineEvent::lease_renewed(
                        renewed.shard_id.clone(),
                        renewed.lease_counter,
                    ))
                    .await;
                    self.send_event(LeaseEvent::Renewed(renewed)).await;
                }
                PutOutcome::Rejected => {
                    warn!(shard_id = %lease.shard_id, "Lease stolen, dropping locally");
                    self.drop_owned(&lease.shard_id).await;
                }
            }
        }
        Ok(())
    }

    /// Conditionally persist a checkpoint for an owned lease.
    ///
    /// Checkpoints are monotone: a position at-or-before the stored one
    /// is silently skipped (flushing the same position twice is normal).
    /// A rejected write means another worker took the lease; the caller
    /// must stop processing the shard immediately.
    pub async fn update_checkpoint(&self, shard_id: &str, checkpoint: Checkpoint) -> Result<()> {
        let current = {
            let owned = self.owned.read().await;
            owned
                .get(shard_id)
                .cloned()
                .ok_or_else(|| EngineError::LeaseLost(shard_id.to_string()))?
        };

        if let Some(existing) = &current.checkpoint {
            if &checkpoint <= existing {
                trace!(
                    shard_id = %shard_id,
                    checkpoint = %checkpoint,
                    existing = %existing,
                    "Checkpoint does not advance, skipping write"
                );
                return Ok(());
            }
        }

        let mut updated = current.clone();
        updated.checkpoint = Some(checkpoint.clone());
        updated.lease_counter = current.lease_counter + 1;

        match self
            .store
            .put_lease(&updated, Some(current.lease_counter))
            .await?
        {
            PutOutcome::Applied => {
                debug!(
                    shard_id = %shard_id,
                    checkpoint = %checkpoint,
                    "Checkpoint persisted"
                );
                self.owned
                    .write()
                    .await
                    .insert(shard_id.to_string(), updated);
                self.send_monitoring_event(EngineEvent::checkpoint_saved(
                    shard_id.to_string(),
                    checkpoint,
                ))
                .await;
                Ok(())
            }
            PutOutcome::Rejected => {
                warn!(shard_id = %shard_id, "Checkpoint write rejected, lease lost");
                self.drop_owned(shard_id).await;
                Err(EngineError::LeaseLost(shard_id.to_string()))
            }
        }
    }

    /// Voluntarily give a lease back (owner = none) so another worker
    /// can claim it without waiting out the grace period.
    pub async fn release_lease(&self, shard_id: &str) -> Result<()> {
        let current = {
            let owned = self.owned.read().await;
            match owned.get(shard_id) {
                Some(lease) => lease.clone(),
                None => return Ok(()),
            }
        };

        let mut released = current.clone();
        released.owner = None;
        released.lease_counter = current.lease_counter + 1;

        match self
            .store
            .put_lease(&released, Some(current.lease_counter))
            .await?
        {
            PutOutcome::Applied => {
                info!(shard_id = %shard_id, "Released lease");
            }
            PutOutcome::Rejected => {
                // Someone already took it; same end state for us.
                debug!(shard_id = %shard_id, "Release raced with a steal");
            }
        }

        self.owned.write().await.remove(shard_id);
        self.send_monitoring_event(EngineEvent::lease_released(shard_id.to_string()))
            .await;
        self.send_event(LeaseEvent::Released(shard_id.to_string()))
            .await;
        Ok(())
    }

    /// Release every owned lease. Used at fleet shutdown so other
    /// workers can pick the shards up immediately.
    pub async fn release_all(&self) {
        let shard_ids: Vec<String> = self.owned.read().await.keys().cloned().collect();
        for shard_id in shard_ids {
            if let Err(e) = self.release_lease(&shard_id).await {
                warn!(shard_id = %shard_id, error = %e, "Failed to release lease at shutdown");
            }
        }
    }

    /// Shed excess leases so the fleet converges to an even spread.
    ///
    /// With `total` leases and `workers` live owners, nobody should hold
    /// more than `ceil(total / workers)`; the excess is released for
    /// idle workers to claim. Returns how many leases were released.
    /// This worker's fair-share ceiling: `ceil(shard leases / live
    /// workers)`, where live workers are non-expired lease owners plus
    /// registered-but-idle workers. Without the latter, a freshly
    /// joined worker would never be shed anything.
    pub fn fleet_target(&self, leases: &[Lease]) -> usize {
        let (registrations, shard_leases): (Vec<&Lease>, Vec<&Lease>) =
            leases.iter().partition(|l| is_worker_registration(l));
        if shard_leases.is_empty() {
            return 0;
        }

        let mut owners: HashSet<&str> = shard_leases
            .iter()
            .filter(|l| !self.is_expired(l))
            .filter_map(|l| l.owner.as_deref())
            .collect();
        owners.extend(
            registrations
                .iter()
                .filter(|l| !self.is_expired(l))
                .filter_map(|l| l.owner.as_deref()),
        );
        owners.insert(self.worker_id.as_str());

        shard_leases.len().div_ceil(owners.len())
    }

    pub async fn rebalance(&self, leases: &[Lease]) -> Result<usize> {
        if !self.config.rebalance_enabled {
            return Ok(0);
        }
        let target = self.fleet_target(leases);
        if target == 0 {
            return Ok(0);
        }

        let mut my_shards: Vec<String> = self.owned.read().await.keys().cloned().collect();
        if my_shards.len() <= target {
            return Ok(0);
        }

        let excess = my_shards.len() - target;
        my_shards.sort();
        let to_release: Vec<String> = my_shards.into_iter().rev().take(excess).collect();

        info!(
            target = target,
            releasing = to_release.len(),
            "Rebalancing: shedding excess leases"
        );

        let mut released = 0;
        for shard_id in to_release {
            self.release_lease(&shard_id).await?;
            released += 1;
        }
        Ok(released)
    }

    /// Shards currently held by this worker.
    pub async fn owned_shards(&self) -> Vec<String> {
        let mut shards: Vec<String> = self.owned.read().await.keys().cloned().collect();
        shards.sort();
        shards
    }

    /// This worker's copy of an owned lease.
    pub async fn owned_lease(&self, shard_id: &str) -> Option<Lease> {
        self.owned.read().await.get(shard_id).cloned()
    }

    async fn drop_owned(&self, shard_id: &str) {
        if self.owned.write().await.remove(shard_id).is_some() {
            self.send_monitoring_event(EngineEvent::lease_lost(shard_id.to_string()))
                .await;
            self.send_event(LeaseEvent::Lost(shard_id.to_string())).await;
        }
    }

    /// Drop every owned lease locally without touching the store.
    ///
    /// Used when the store has been unreachable past the grace period:
    /// other workers will steal our leases on that schedule, so
    /// continuing to process would risk double ownership.
    async fn presume_all_lost(&self) {
        let shard_ids: Vec<String> = self.owned.read().await.keys().cloned().collect();
        for shard_id in shard_ids {
            warn!(shard_id = %shard_id, "Presuming lease stolen after renewal blackout");
            self.drop_owned(&shard_id).await;
        }
    }

    /// Interval-driven renewal task; runs until fleet shutdown.
    pub async fn renewal_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.renew_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_success = Instant::now();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let renewed = self.renew_owned().await;
                    match renewed.and(self.heartbeat().await) {
                        Ok(()) => last_success = Instant::now(),
                        Err(e) => {
                            warn!(error = %e, "Lease renewal failed");
                            if last_success.elapsed() > self.config.lease_grace_period {
                                self.presume_all_lost().await;
                                last_success = Instant::now();
                            }
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("Renewal loop stopping");
                        break;
                    }
                }
            }
        }
    }
}
