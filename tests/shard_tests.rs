//! End-to-end coverage of shard topology handling: splits, merges,
//! multi-worker lease distribution, and dead-worker takeover.

mod common;

use common::{
    create_test_config, init_logging, tagged_records, wait_for_checkpoint, CollectingProcessor,
    ScriptedTransport,
};
use anyhow::Result;
use shardflow::{Checkpoint, InMemoryLeaseStore, Lease, LeaseStore, Shard, WorkerScheduler};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[tokio::test]
async fn test_split_children_process_after_parent() -> Result<()> {
    init_logging();

    let transport = Arc::new(ScriptedTransport::new());
    transport
        .set_shards(vec![
            Shard::new("shard-0000").closed(),
            Shard::new("shard-0001").with_parents(vec!["shard-0000".to_string()]),
            Shard::new("shard-0002").with_parents(vec!["shard-0000".to_string()]),
        ])
        .await;
    transport
        .script_closing_shard("shard-0000", tagged_records("shard-0000", 100, 4))
        .await;
    transport
        .script_closing_shard("shard-0001", tagged_records("shard-0001", 200, 3))
        .await;
    transport
        .script_closing_shard("shard-0002", tagged_records("shard-0002", 300, 3))
        .await;

    let store = Arc::new(InMemoryLeaseStore::new());
    let (processor, log) = CollectingProcessor::new();
    let (scheduler, _monitoring) = WorkerScheduler::new(
        create_test_config("worker-1"),
        transport,
        store.clone(),
        Arc::new(processor),
    )?;
    let scheduler = Arc::new(scheduler);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let runner = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.run(shutdown_rx).await })
    };

    for shard in ["shard-0000", "shard-0001", "shard-0002"] {
        wait_for_checkpoint(&store, shard, &Checkpoint::ShardEnd, Duration::from_secs(5)).await;
    }
    shutdown_tx.send(true)?;
    runner.await??;

    // Every parent record precedes every child record.
    let log = log.lock().await;
    let last_parent = log
        .iter()
        .rposition(|entry| entry.starts_with("shard-0000"))
        .expect("parent records processed");
    let first_child = log
        .iter()
        .position(|entry| !entry.starts_with("shard-0000"))
        .expect("child records processed");
    assert!(
        last_parent < first_child,
        "parent records must finish before children start: {:?}",
        *log
    );
    assert_eq!(log.len(), 10);
    Ok(())
}

#[tokio::test]
async fn test_merge_waits_for_both_parents() -> Result<()> {
    init_logging();

    let transport = Arc::new(ScriptedTransport::new());
    transport
        .set_shards(vec![
            Shard::new("shard-a").closed(),
            Shard::new("shard-b").closed(),
            Shard::new("shard-merged")
                .with_parents(vec!["shard-a".to_string(), "shard-b".to_string()]),
        ])
        .await;
    transport
        .script_closing_shard("shard-a", tagged_records("shard-a", 0, 3))
        .await;
    transport
        .script_closing_shard("shard-b", tagged_records("shard-b", 10, 3))
        .await;
    transport
        .script_closing_shard("shard-merged", tagged_records("shard-merged", 20, 3))
        .await;

    let store = Arc::new(InMemoryLeaseStore::new());
    let (processor, log) = CollectingProcessor::new();
    let (scheduler, _monitoring) = WorkerScheduler::new(
        create_test_config("worker-1"),
        transport,
        store.clone(),
        Arc::new(processor),
    )?;
    let scheduler = Arc::new(scheduler);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let runner = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.run(shutdown_rx).await })
    };

    wait_for_checkpoint(&store, "shard-merged", &Checkpoint::ShardEnd, Duration::from_secs(5))
        .await;
    shutdown_tx.send(true)?;
    runner.await??;

    let log = log.lock().await;
    let first_merged = log
        .iter()
        .position(|entry| entry.starts_with("shard-merged"))
        .expect("merged shard processed");
    let parents_done = log
        .iter()
        .filter(|entry| !entry.starts_with("shard-merged"))
        .count();
    assert_eq!(
        parents_done, 6,
        "both parents fully processed before the merged shard"
    );
    assert!(first_merged >= 6, "merged shard started too early: {:?}", *log);
    Ok(())
}

#[tokio::test]
async fn test_two_workers_drain_the_stream() -> Result<()> {
    init_logging();

    let transport = Arc::new(ScriptedTransport::new());
    let shard_ids = ["shard-0", "shard-1", "shard-2", "shard-3"];
    transport
        .set_shards(shard_ids.iter().map(|id| Shard::new(*id)).collect())
        .await;
    for (i, shard_id) in shard_ids.iter().enumerate() {
        transport
            .script_closing_shard(shard_id, tagged_records(shard_id, (i as u64) * 100, 5))
            .await;
    }

    let store = Arc::new(InMemoryLeaseStore::new());
    let log = CollectingProcessor::new().1;

    let mut runners = Vec::new();
    let mut shutdowns = Vec::new();
    for worker_id in ["worker-1", "worker-2"] {
        let (scheduler, _monitoring) = WorkerScheduler::new(
            create_test_config(worker_id),
            transport.clone(),
            store.clone(),
            Arc::new(CollectingProcessor::with_log(log.clone())),
        )?;
        let scheduler = Arc::new(scheduler);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        runners.push({
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.run(shutdown_rx).await })
        });
        shutdowns.push(shutdown_tx);
    }

    for shard_id in shard_ids {
        wait_for_checkpoint(&store, shard_id, &Checkpoint::ShardEnd, Duration::from_secs(10))
            .await;
    }
    for shutdown_tx in shutdowns {
        shutdown_tx.send(true)?;
    }
    for runner in runners {
        runner.await??;
    }

    // Delivery is at-least-once: every record was seen, duplicates are
    // tolerated if a lease moved mid-shard.
    let seen: HashSet<String> = log.lock().await.iter().cloned().collect();
    for (i, shard_id) in shard_ids.iter().enumerate() {
        for seq in (i as u64) * 100..(i as u64) * 100 + 5 {
            assert!(
                seen.contains(&format!("{}:{}", shard_id, seq)),
                "missing record {}:{}",
                shard_id,
                seq
            );
        }
    }
    Ok(())
}

#[tokio::test]
async fn test_fleet_rebalances_toward_newly_joined_worker() -> Result<()> {
    init_logging();

    let transport = Arc::new(ScriptedTransport::new());
    let shard_ids = ["shard-0", "shard-1", "shard-2", "shard-3"];
    transport
        .set_shards(shard_ids.iter().map(|id| Shard::new(*id)).collect())
        .await;
    for (i, shard_id) in shard_ids.iter().enumerate() {
        // Open shards: the leases stay held instead of completing.
        transport
            .script_open_shard(shard_id, tagged_records(shard_id, (i as u64) * 100, 2))
            .await;
    }

    let store = Arc::new(InMemoryLeaseStore::new());

    async fn shard_leases_owned_by(store: &InMemoryLeaseStore, worker_id: &str) -> usize {
        store
            .list_leases()
            .await
            .unwrap()
            .iter()
            .filter(|l| l.shard_id.starts_with("shard-"))
            .filter(|l| l.owner.as_deref() == Some(worker_id))
            .count()
    }

    // Worker A starts alone and claims the whole stream.
    let (processor_a, _log_a) = CollectingProcessor::new();
    let (scheduler_a, _monitoring_a) = WorkerScheduler::new(
        create_test_config("worker-a"),
        transport.clone(),
        store.clone(),
        Arc::new(processor_a),
    )?;
    let scheduler_a = Arc::new(scheduler_a);
    let (shutdown_a_tx, shutdown_a_rx) = watch::channel(false);
    let runner_a = {
        let scheduler = scheduler_a.clone();
        tokio::spawn(async move { scheduler.run(shutdown_a_rx).await })
    };

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while shard_leases_owned_by(&store, "worker-a").await < shard_ids.len() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "worker A never claimed the stream"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // Worker B joins owning nothing. Its registration alone must make
    // A shed leases for B to pick up, without any expiry in between.
    let (processor_b, _log_b) = CollectingProcessor::new();
    let (scheduler_b, _monitoring_b) = WorkerScheduler::new(
        create_test_config("worker-b"),
        transport,
        store.clone(),
        Arc::new(processor_b),
    )?;
    let scheduler_b = Arc::new(scheduler_b);
    let (shutdown_b_tx, shutdown_b_rx) = watch::channel(false);
    let runner_b = {
        let scheduler = scheduler_b.clone();
        tokio::spawn(async move { scheduler.run(shutdown_b_rx).await })
    };

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while shard_leases_owned_by(&store, "worker-b").await == 0 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "fleet never converged: worker B still owns nothing"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    shutdown_a_tx.send(true)?;
    shutdown_b_tx.send(true)?;
    runner_a.await??;
    runner_b.await??;
    Ok(())
}

#[tokio::test]
async fn test_worker_takes_over_expired_lease() -> Result<()> {
    init_logging();

    let transport = Arc::new(ScriptedTransport::new());
    transport.set_shards(vec![Shard::new("shard-0")]).await;
    transport
        .script_closing_shard("shard-0", tagged_records("shard-0", 100, 4))
        .await;

    // A dead worker still holds the lease; its counter will never move.
    let store = Arc::new(InMemoryLeaseStore::new());
    store.put_lease(&Lease::unowned("shard-0"), None).await?;
    store
        .put_lease(
            &Lease {
                shard_id: "shard-0".to_string(),
                owner: Some("worker-dead".to_string()),
                checkpoint: Some(Checkpoint::at("101")),
                lease_counter: 42,
            },
            Some(0),
        )
        .await?;

    let (processor, log) = CollectingProcessor::new();
    let (scheduler, _monitoring) = WorkerScheduler::new(
        create_test_config("worker-live"),
        transport,
        store.clone(),
        Arc::new(processor),
    )?;
    let scheduler = Arc::new(scheduler);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let runner = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.run(shutdown_rx).await })
    };

    // Takeover happens only after the 300ms grace period.
    wait_for_checkpoint(&store, "shard-0", &Checkpoint::ShardEnd, Duration::from_secs(5)).await;
    shutdown_tx.send(true)?;
    runner.await??;

    // The thief resumed from the dead worker's checkpoint.
    assert_eq!(*log.lock().await, vec!["shard-0:102", "shard-0:103"]);
    Ok(())
}
