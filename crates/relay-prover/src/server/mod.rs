use std::sync::Arc;

use anyhow::{Context, Result};
use relay_types::Update;
use storage::jobs::{JobStore, RocksDbJobStore};
use storage::proofs::{ProofStore, RocksDbProofStore};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::pipeline::{
    BeaconApiSource, ChainVerifier, ProofGeneratorWorker, RelayContext, UpdatePoller, UpdateScheduler,
};
use crate::prover::prover_from_env;
use crate::queue::{spawn_event_logger, EventMonitor, WorkQueue, PROOF_QUEUE, UPDATE_QUEUE};

pub mod api;

pub use api::{router, ApiState};

/// Opens both queues on top of the given stores.
pub fn open_context(
    config: &Config,
    proof_store: Arc<dyn ProofStore>,
    job_store: Arc<dyn JobStore>,
    events: EventMonitor,
) -> Result<RelayContext> {
    let update_queue = WorkQueue::<Update>::open(UPDATE_QUEUE, config.queue.clone(), job_store.clone(), events.clone())
        .context("Failed to open update queue")?;
    let proof_queue = WorkQueue::<Update>::open(PROOF_QUEUE, config.queue.clone(), job_store, events.clone())
        .context("Failed to open proof queue")?;

    Ok(RelayContext {
        chain: config.chain,
        proof_store,
        update_queue: Arc::new(update_queue),
        proof_queue: Arc::new(proof_queue),
        events,
    })
}

/// Returns the slot new updates are chained after.
///
/// That is the highest slot already stored or still queued, or `configured` on a fresh relay. Queued
/// updates count because their proofs will be stored after the restart.
pub async fn resume_slot(ctx: &RelayContext, configured: Option<u64>) -> Result<Option<u64>> {
    let stored = ctx.proof_store.get_latest(ctx.chain).await?.map(|record| record.update_slot);
    let queued = [ctx.update_queue.max_key().await, ctx.proof_queue.max_key().await];

    Ok(std::iter::once(stored)
        .chain(queued)
        .flatten()
        .max()
        .or(configured))
}

pub async fn start_server(config: Config) -> Result<()> {
    let listener = TcpListener::bind(&config.http_address)
        .await
        .with_context(|| format!("Failed to bind {}", config.http_address))?;

    // Initialize RocksDB storage in the default data directory
    let storage_path = Config::storage_path()?;
    let proof_store: Arc<dyn ProofStore> = Arc::new(RocksDbProofStore::new(&storage_path)?);
    let job_store: Arc<dyn JobStore> = Arc::new(RocksDbJobStore::new(&storage_path)?);

    let events = EventMonitor::new(config.event_capacity);
    let event_logger = spawn_event_logger(&events);
    let ctx = open_context(&config, proof_store, job_store, events)?;

    let (prover, verifier) = prover_from_env(&config.prover);
    let chain_verifier = Arc::new(ChainVerifier::new(ctx.proof_store.clone(), verifier, ctx.chain));

    let checkpoint = resume_slot(&ctx, config.checkpoint_slot).await?;
    info!(chain = %ctx.chain, ?checkpoint, "starting relay pipeline");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = JoinSet::new();

    let poller = UpdatePoller::new(
        ctx.clone(),
        Arc::new(BeaconApiSource::new(config.beacon_rpc.clone(), checkpoint)),
        config.poll_interval(),
    );
    let poller_shutdown = shutdown_rx.clone();
    tasks.spawn(async move {
        if let Err(e) = poller.run(poller_shutdown).await {
            error!("Update poller task failed: {e:?}");
        }
    });

    let scheduler = UpdateScheduler::new(ctx.clone());
    tasks.spawn(async move {
        if let Err(e) = scheduler.run().await {
            error!("Update scheduler task failed: {e:?}");
        }
    });

    for id in 0..config.workers {
        let worker = ProofGeneratorWorker::new(
            id,
            ctx.clone(),
            prover.clone(),
            config.prover.prove_timeout(),
            config.defer_delay(),
        );
        tasks.spawn(async move {
            if let Err(e) = worker.run().await {
                error!(worker = id, "Proof worker task failed: {e:?}");
            }
        });
    }

    let app = router(ApiState {
        ctx: ctx.clone(),
        verifier: chain_verifier,
    });
    let mut server_shutdown = shutdown_rx.clone();
    let mut server_task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = server_shutdown.changed().await;
            })
            .await
    });
    info!("admin api listening on {}", config.http_address);

    tokio::select! {
        r = &mut server_task => {
            match r {
                Ok(Ok(())) => debug!("admin api stopped"),
                Ok(Err(e)) => error!("admin api failed: {e:?}"),
                Err(e) => error!("admin api task panicked: {e:?}"),
            }
        }
        r = tokio::signal::ctrl_c() => {
            if let Err(e) = r {
                error!("Failed to listen for shutdown signal: {e:?}");
            }
            info!("shutdown signal received");
        }
    }

    let _ = shutdown_tx.send(true);
    ctx.close().await;
    while let Some(r) = tasks.join_next().await {
        if let Err(e) = r {
            error!("pipeline task panicked: {e:?}");
        }
    }
    if !server_task.is_finished() {
        let _ = server_task.await;
    }
    event_logger.abort();

    info!("relay stopped");
    Ok(())
}
