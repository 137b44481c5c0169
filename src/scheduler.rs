//! Worker scheduler: the per-process entry point that discovers shards,
//! claims leases, and runs one consumer task per owned shard.

use crate::consumer::{ConsumerConfig, ShardConsumer};
use crate::error::{EngineError, Result};
use crate::lease::{LeaseConfig, LeaseCoordinator, LeaseEvent};
use crate::monitoring::{ConsumerStateLabel, EngineEvent, MonitoringConfig};
use crate::processor::RecordProcessor;
use crate::retry::RetryConfig;
use crate::store::LeaseStore;
use crate::topology::ShardTopologyTracker;
use crate::transport::StreamTransport;
use crate::types::{InitialPosition, ShutdownReason};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Top-level engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Name of this consumer application; identifies the fleet.
    pub application_name: String,
    /// Name of the stream being consumed.
    pub stream_name: String,
    /// Stable worker identity; generated when not set.
    pub worker_id: Option<String>,
    /// Maximum records per transport read.
    pub batch_size: usize,
    /// How often the scheduler re-syncs topology and leases.
    pub scheduler_tick: Duration,
    /// How often consumers flush pending checkpoints. Shorter intervals
    /// narrow the reprocessing window after a crash at the cost of more
    /// store writes.
    pub checkpoint_interval: Duration,
    /// How often a waiting child consumer re-checks its parents.
    pub parent_poll_interval: Duration,
    /// How long consumers wait after an empty read.
    pub idle_poll_delay: Duration,
    /// Where to start on shards with no checkpoint.
    pub initial_position: InitialPosition,
    /// How long graceful shutdown waits for consumers to finish.
    pub shutdown_timeout: Duration,
    /// Lease renewal, expiry and rebalancing.
    pub lease: LeaseConfig,
    /// Attempt budget and delay for failing records.
    pub record_retry: RetryConfig,
    /// Optional monitoring event channel.
    pub monitoring: MonitoringConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            application_name: String::new(),
            stream_name: String::new(),
            worker_id: None,
            batch_size: 1000,
            scheduler_tick: Duration::from_secs(10),
            checkpoint_interval: Duration::from_secs(60),
            parent_poll_interval: Duration::from_secs(1),
            idle_poll_delay: Duration::from_secs(1),
            initial_position: InitialPosition::TrimHorizon,
            shutdown_timeout: Duration::from_secs(30),
            lease: LeaseConfig::default(),
            record_retry: RetryConfig {
                max_retries: Some(10),
                initial_backoff: Duration::from_secs(3),
                max_backoff: Duration::from_secs(3),
                jitter_factor: 0.0,
            },
            monitoring: MonitoringConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Validate before the fleet starts; an invalid configuration must
    /// never reach a consumer.
    pub fn validate(&self) -> Result<()> {
        if self.application_name.is_empty() {
            return Err(EngineError::Config("application_name is required".into()));
        }
        if self.stream_name.is_empty() {
            return Err(EngineError::Config("stream_name is required".into()));
        }
        if self.batch_size == 0 || self.batch_size > 10_000 {
            return Err(EngineError::Config(format!(
                "batch_size must be within 1..=10000, got {}",
                self.batch_size
            )));
        }
        if self.scheduler_tick.is_zero() {
            return Err(EngineError::Config("scheduler_tick must be non-zero".into()));
        }
        if self.checkpoint_interval.is_zero() {
            return Err(EngineError::Config(
                "checkpoint_interval must be non-zero".into(),
            ));
        }
        if self.lease.renew_interval >= self.lease.lease_grace_period {
            return Err(EngineError::Config(
                "lease renew_interval must be shorter than the grace period".into(),
            ));
        }
        if self.record_retry.max_retries == Some(0) {
            return Err(EngineError::Config(
                "record_retry.max_retries must be at least 1".into(),
            ));
        }
        Ok(())
    }

    fn consumer_config(&self) -> ConsumerConfig {
        ConsumerConfig {
            batch_size: self.batch_size,
            initial_position: self.initial_position,
            idle_poll_delay: self.idle_poll_delay,
            parent_poll_interval: self.parent_poll_interval,
            checkpoint_interval: self.checkpoint_interval,
            max_record_attempts: self.record_retry.max_retries,
            record_retry_delay: self.record_retry.initial_backoff,
        }
    }
}

struct ConsumerHandle {
    shutdown_tx: watch::Sender<Option<ShutdownReason>>,
    state_rx: watch::Receiver<ConsumerStateLabel>,
    task: JoinHandle<()>,
}

/// Runs one worker: a scheduler loop plus one task per owned shard.
pub struct WorkerScheduler<T, P, S> {
    config: EngineConfig,
    transport: Arc<T>,
    processor: Arc<P>,
    topology: Arc<ShardTopologyTracker<T>>,
    coordinator: Arc<LeaseCoordinator<S>>,
    lease_events: Mutex<mpsc::Receiver<LeaseEvent>>,
    consumers: Mutex<HashMap<String, ConsumerHandle>>,
    monitoring_tx: Option<mpsc::Sender<EngineEvent>>,
}

impl<T, P, S> WorkerScheduler<T, P, S>
where
    T: StreamTransport + 'static,
    P: RecordProcessor + 'static,
    S: LeaseStore + 'static,
{
    /// Build a scheduler. Returns the monitoring event receiver when
    /// monitoring is enabled.
    pub fn new(
        config: EngineConfig,
        transport: Arc<T>,
        store: Arc<S>,
        processor: Arc<P>,
    ) -> Result<(Self, Option<mpsc::Receiver<EngineEvent>>)> {
        config.validate()?;

        let (monitoring_tx, monitoring_rx) = if config.monitoring.enabled {
            let (tx, rx) = mpsc::channel(config.monitoring.channel_size);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let worker_id = config
            .worker_id
            .clone()
            .unwrap_or_else(|| format!("worker-{:08x}", rand::random::<u32>()));

        let (coordinator, lease_events) = LeaseCoordinator::new(
            store,
            worker_id,
            config.lease.clone(),
            monitoring_tx.clone(),
        );
        let topology = Arc::new(ShardTopologyTracker::new(transport.clone()));

        Ok((
            Self {
                config,
                transport,
                processor,
                topology,
                coordinator,
                lease_events: Mutex::new(lease_events),
                consumers: Mutex::new(HashMap::new()),
                monitoring_tx,
            },
            monitoring_rx,
        ))
    }

    pub fn worker_id(&self) -> &str {
        self.coordinator.worker_id()
    }

    /// Main loop; returns after a graceful shutdown.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) -> Result<()> {
        info!(
            application = %self.config.application_name,
            stream = %self.config.stream_name,
            worker_id = %self.coordinator.worker_id(),
            "Starting worker"
        );

        // Make this worker count for rebalancing before it owns
        // anything; the renewal loop keeps the registration alive.
        if let Err(e) = self.coordinator.register_worker().await {
            warn!(error = %e, "Worker registration failed, retrying on renewal");
        }

        let renewal_task = tokio::spawn(
            self.coordinator
                .clone()
                .renewal_loop(shutdown_rx.clone()),
        );

        let mut ticker = tokio::time::interval(self.config.scheduler_tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut lease_events = self.lease_events.lock().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        // One bad pass must not take the worker down.
                        warn!(error = %e, "Scheduler pass failed");
                    }
                }
                event = lease_events.recv() => {
                    match event {
                        Some(event) => self.handle_lease_event(event).await,
                        None => {}
                    }
                }
                changed = shutdown_rx.changed() => {
                    // A dropped sender counts as a shutdown request.
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        drop(lease_events);

        self.shutdown().await;
        if let Err(e) = renewal_task.await {
            error!(error = %e, "Renewal task panicked");
        }
        info!(worker_id = %self.coordinator.worker_id(), "Worker stopped");
        Ok(())
    }

    /// One scheduler pass: sync topology, grow the lease table, claim
    /// what is claimable, shed what is excess, reconcile consumer tasks.
    async fn run_once(&self) -> Result<()> {
        self.topology.refresh().await?;
        let shards = self.topology.shards().await;
        let mut leases = self.coordinator.list_leases().await?;

        let known: HashSet<&str> = leases.iter().map(|l| l.shard_id.as_str()).collect();
        let mut created = false;
        for shard in &shards {
            if !known.contains(shard.shard_id.as_str()) {
                self.coordinator.create_lease_if_absent(&shard.shard_id).await?;
                created = true;
            }
        }
        if created {
            leases = self.coordinator.list_leases().await?;
        }
        self.coordinator.observe(&leases);

        // Claim only up to the fair share; what this worker leaves
        // unowned is meant for its peers.
        let target = self.coordinator.fleet_target(&leases);
        let mut owned_count = self.coordinator.owned_shards().await.len();
        for lease in &leases {
            if owned_count >= target {
                break;
            }
            if !self.coordinator.is_acquirable(lease).await {
                continue;
            }
            if !self
                .topology
                .parents_satisfied(&lease.shard_id, &leases)
                .await
            {
                debug!(shard_id = %lease.shard_id, "Skipping lease with unconsumed parents");
                continue;
            }
            match self.coordinator.acquire_lease(lease).await {
                Ok(_) => owned_count += 1,
                // Another worker was faster; nothing to do.
                Err(EngineError::LeaseLost(_)) => {}
                Err(e) => warn!(shard_id = %lease.shard_id, error = %e, "Lease acquire failed"),
            }
        }

        let leases = self.coordinator.list_leases().await?;
        self.coordinator.rebalance(&leases).await?;

        self.reconcile_consumers().await;
        Ok(())
    }

    async fn handle_lease_event(&self, event: LeaseEvent) {
        match event {
            LeaseEvent::Acquired(lease) => {
                self.start_consumer(&lease.shard_id).await;
            }
            LeaseEvent::Lost(shard_id) | LeaseEvent::Released(shard_id) => {
                // Either way the lease is no longer ours; the consumer
                // must stop without touching the checkpoint.
                let consumers = self.consumers.lock().await;
                if let Some(handle) = consumers.get(&shard_id) {
                    let _ = handle.shutdown_tx.send(Some(ShutdownReason::LeaseLost));
                }
            }
            LeaseEvent::Renewed(_) => {}
        }
    }

    async fn start_consumer(&self, shard_id: &str) {
        let mut consumers = self.consumers.lock().await;
        if consumers.contains_key(shard_id) {
            return;
        }
        match self.coordinator.owned_lease(shard_id).await {
            Some(lease) if !lease.is_terminal() => {}
            // Not ours anymore, or already fully consumed.
            _ => return,
        }

        debug!(shard_id = %shard_id, "Starting shard consumer");
        let (consumer_shutdown_tx, consumer_shutdown_rx) = watch::channel(None);
        let (state_tx, state_rx) = watch::channel(ConsumerStateLabel::Initializing);
        let consumer = ShardConsumer::new(
            shard_id.to_string(),
            self.transport.clone(),
            self.processor.clone(),
            self.coordinator.clone(),
            self.topology.clone(),
            self.config.consumer_config(),
            state_tx,
            self.monitoring_tx.clone(),
        );
        let task = tokio::spawn(consumer.run(consumer_shutdown_rx));
        consumers.insert(
            shard_id.to_string(),
            ConsumerHandle {
                shutdown_tx: consumer_shutdown_tx,
                state_rx,
                task,
            },
        );
    }

    /// Align running consumer tasks with current lease ownership.
    async fn reconcile_consumers(&self) {
        let owned: HashSet<String> = self
            .coordinator
            .owned_shards()
            .await
            .into_iter()
            .collect();

        {
            let mut consumers = self.consumers.lock().await;
            consumers.retain(|shard_id, handle| {
                let done = handle.task.is_finished()
                    || *handle.state_rx.borrow() == ConsumerStateLabel::Done;
                if done {
                    debug!(shard_id = %shard_id, "Reaping finished consumer");
                }
                !done
            });

            for (shard_id, handle) in consumers.iter() {
                if !owned.contains(shard_id) {
                    debug!(shard_id = %shard_id, "Lease gone, signalling consumer");
                    let _ = handle.shutdown_tx.send(Some(ShutdownReason::LeaseLost));
                }
            }
        }

        for shard_id in owned {
            self.start_consumer(&shard_id).await;
        }
    }

    /// Graceful shutdown: stop consumers, bounded wait, then hand every
    /// lease back so other workers pick the shards up immediately.
    async fn shutdown(&self) {
        info!(worker_id = %self.coordinator.worker_id(), "Worker shutting down");

        let tasks: Vec<JoinHandle<()>> = {
            let mut consumers = self.consumers.lock().await;
            for handle in consumers.values() {
                let _ = handle.shutdown_tx.send(Some(ShutdownReason::WorkerShutdown));
            }
            consumers.drain().map(|(_, handle)| handle.task).collect()
        };

        if !tasks.is_empty() {
            let joined = tokio::time::timeout(
                self.config.shutdown_timeout,
                futures::future::join_all(tasks),
            )
            .await;
            if joined.is_err() {
                warn!("Timed out waiting for consumers to stop");
            }
        }

        self.coordinator.release_all().await;
        self.coordinator.deregister_worker().await;
    }
}
