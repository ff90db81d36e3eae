//! Controller runtime
//!
//! Wires a [`Context`] to the cluster: seeds both caches from a full list,
//! feeds the queues from kube watchers and a resync ticker, runs the worker
//! pools and shuts everything down when the token is cancelled. With leader
//! election enabled nothing starts until the lease is held, and losing the
//! lease stops the controller.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, Resource};
use lattice_common::crd::{VolumeSnapshot, VolumeSnapshotContent};
use lattice_common::events::KubeEventPublisher;
use lattice_common::leader_election::{lease_name_for_driver, LeaderElector};
use lattice_common::{Error, Result};
use serde::de::DeserializeOwned;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::KubeSnapshotApi;
use crate::cache::object_key;
use crate::config::ControllerConfig;
use crate::controller::Context;
use crate::driver::SnapshotDriver;
use crate::queue::WorkQueue;

/// Watcher timeout (seconds) - must be less than client read_timeout
/// This forces the API server to close the watch before the client times out,
/// preventing "body read timed out" errors on idle watches.
pub const WATCH_TIMEOUT_SECS: u32 = 25;

/// How long shutdown waits for in-flight driver operations
pub const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Run the snapshot controller for `driver` until `shutdown` is cancelled
pub async fn run(
    client: Client,
    driver: Arc<dyn SnapshotDriver>,
    config: ControllerConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    config.validate()?;
    info!(
        driver = %config.driver_name,
        workers = config.workers,
        resync_secs = config.resync_period_secs,
        "snapshot controller starting"
    );

    let api = Arc::new(KubeSnapshotApi::new(client.clone()));
    let events = Arc::new(KubeEventPublisher::new(
        client.clone(),
        &format!("csi-snapshotter {}", config.driver_name),
    ));
    let ctx = Context::builder(api, driver, config.clone())
        .events(events)
        .build();

    if !config.leader_election {
        return run_controller(ctx, client, shutdown).await;
    }

    let identity = config
        .leader_election_identity
        .clone()
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| format!("{}-{}", config.driver_name, std::process::id()));
    let elector = Arc::new(LeaderElector::new(
        client.clone(),
        &lease_name_for_driver(&config.driver_name),
        &config.leader_election_namespace,
        &identity,
    ));
    let mut guard = tokio::select! {
        guard = elector.acquire() => guard,
        _ = shutdown.cancelled() => {
            info!("shutdown requested before leadership was acquired");
            return Ok(());
        }
    };

    let stop = shutdown.child_token();
    let controller = run_controller(ctx, client, stop.clone());
    tokio::pin!(controller);
    tokio::select! {
        result = &mut controller => result,
        _ = guard.lost() => {
            warn!(identity = %identity, "leadership lost, stopping controller");
            stop.cancel();
            controller.await?;
            Err(Error::internal_with_context("leader-election", "leadership lost"))
        }
    }
}

async fn run_controller(
    ctx: Arc<Context>,
    client: Client,
    shutdown: CancellationToken,
) -> Result<()> {
    seed_caches(&ctx).await?;

    let mut tasks = JoinSet::new();
    tasks.spawn(watch(
        Api::<VolumeSnapshot>::all(client.clone()),
        ctx.snapshot_queue.clone(),
        shutdown.clone(),
    ));
    tasks.spawn(watch(
        Api::<VolumeSnapshotContent>::all(client),
        ctx.content_queue.clone(),
        shutdown.clone(),
    ));
    run_workers(ctx, tasks, shutdown).await
}

/// List both kinds into the caches and enqueue every key
async fn seed_caches(ctx: &Context) -> Result<()> {
    let contents = ctx.api.list_contents("").await.map_err(|e| {
        Error::internal_with_context(
            "startup",
            format!("failed to list VolumeSnapshotContents: {}", e),
        )
    })?;
    let snapshots = ctx.api.list_snapshots("").await.map_err(|e| {
        Error::internal_with_context("startup", format!("failed to list VolumeSnapshots: {}", e))
    })?;

    for content in &contents {
        ctx.contents.upsert(content)?;
        ctx.content_queue.add(content.key());
    }
    for snapshot in &snapshots {
        ctx.snapshots.upsert(snapshot)?;
        ctx.snapshot_queue.add(snapshot.key());
    }
    info!(
        contents = contents.len(),
        snapshots = snapshots.len(),
        "caches seeded"
    );
    Ok(())
}

/// Enqueue the key of every object the watch stream reports
async fn watch<K>(api: Api<K>, queue: WorkQueue, shutdown: CancellationToken)
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
{
    let stream = watcher(api, watcher::Config::default().timeout(WATCH_TIMEOUT_SECS))
        .default_backoff();
    futures::pin_mut!(stream);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            event = stream.next() => match event {
                Some(Ok(watcher::Event::Apply(obj)))
                | Some(Ok(watcher::Event::InitApply(obj)))
                | Some(Ok(watcher::Event::Delete(obj))) => queue.add(object_key(&obj)),
                Some(Ok(watcher::Event::Init)) | Some(Ok(watcher::Event::InitDone)) => {}
                Some(Err(e)) => warn!(queue = queue.name(), error = %e, "watch error"),
                None => break,
            },
        }
    }
    debug!(queue = queue.name(), "watch stopped");
}

/// Re-enqueue every cached key once per resync period
async fn resync_loop(ctx: Arc<Context>, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(ctx.config.resync_period());
    // the first tick completes immediately and the initial list already enqueued everything
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let snapshots = ctx.snapshots.keys();
                let contents = ctx.contents.keys();
                debug!(snapshots = snapshots.len(), contents = contents.len(), "resync");
                for key in snapshots {
                    ctx.snapshot_queue.add(key);
                }
                for key in contents {
                    ctx.content_queue.add(key);
                }
            }
        }
    }
}

/// Run the worker pools next to `tasks` until `shutdown`, then drain
async fn run_workers(
    ctx: Arc<Context>,
    mut tasks: JoinSet<()>,
    shutdown: CancellationToken,
) -> Result<()> {
    tasks.spawn(resync_loop(ctx.clone(), shutdown.clone()));
    for _ in 0..ctx.config.workers {
        tasks.spawn(ctx.clone().run_snapshot_worker());
        tasks.spawn(ctx.clone().run_content_worker());
    }
    info!(workers = ctx.config.workers, "snapshot controller running");

    shutdown.cancelled().await;
    info!("snapshot controller shutting down");
    ctx.snapshot_queue.shutdown();
    ctx.content_queue.shutdown();
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            warn!(error = %e, "controller task ended abnormally");
        }
    }
    ctx.operations.drain(SHUTDOWN_DRAIN_TIMEOUT).await;
    info!("snapshot controller stopped");
    Ok(())
}
