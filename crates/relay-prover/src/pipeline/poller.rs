use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use relay_types::Update;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::pipeline::RelayContext;
use crate::queue::{EnqueueOutcome, QueueError};

/// UpdateSource yields updates observed since the previous call.
#[async_trait]
pub trait UpdateSource: Send + Sync {
    async fn poll_updates(&self) -> Result<Vec<Update>>;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub enqueued: usize,
    pub already_present: usize,
    pub already_proven: usize,
    pub rejected: usize,
}

/// UpdatePoller feeds newly observed updates into the update queue.
pub struct UpdatePoller {
    ctx: RelayContext,
    source: Arc<dyn UpdateSource>,
    poll_interval: Duration,
}

impl UpdatePoller {
    pub fn new(ctx: RelayContext, source: Arc<dyn UpdateSource>, poll_interval: Duration) -> Self {
        Self {
            ctx,
            source,
            poll_interval,
        }
    }

    /// Polls the source once and enqueues every update that is well formed and not yet proven.
    pub async fn poll_once(&self) -> Result<PollSummary> {
        let mut summary = PollSummary::default();

        for update in self.source.poll_updates().await? {
            if let Err(e) = update.validate() {
                warn!(slot = update.slot, "rejecting update: {e}");
                summary.rejected += 1;
                continue;
            }

            if self.ctx.proof_store.get(update.slot, self.ctx.chain).await?.is_some() {
                debug!(slot = update.slot, "update already proven, skipping");
                summary.already_proven += 1;
                continue;
            }

            match self.ctx.update_queue.enqueue(update.slot, &update).await? {
                EnqueueOutcome::Enqueued => {
                    info!(slot = update.slot, prev_slot = ?update.predecessor(), "new update queued");
                    summary.enqueued += 1;
                }
                EnqueueOutcome::AlreadyPresent => summary.already_present += 1,
            }
        }

        Ok(summary)
    }

    /// Polls on a fixed interval until shutdown is signalled or the update queue is closed.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => {
                    info!("Update poller shutting down");
                    return Ok(());
                }
            }

            match self.poll_once().await {
                Ok(summary) if summary.enqueued > 0 => debug!(?summary, "poll finished"),
                Ok(_) => {}
                Err(e) => match e.downcast_ref::<QueueError>() {
                    Some(QueueError::Closed(_)) => return Ok(()),
                    _ => error!("Failed to poll updates: {e:?}"),
                },
            }
        }
    }
}

/// Testing utilities for UpdateSource implementations.
pub mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays pre-recorded batches of updates, one batch per poll.
    #[derive(Default)]
    pub struct ReplaySource {
        batches: Mutex<VecDeque<Vec<Update>>>,
    }

    impl ReplaySource {
        pub fn new(batches: Vec<Vec<Update>>) -> Self {
            Self {
                batches: Mutex::new(batches.into()),
            }
        }

        pub fn push(&self, batch: Vec<Update>) {
            self.batches.lock().unwrap().push_back(batch);
        }
    }

    #[async_trait]
    impl UpdateSource for ReplaySource {
        async fn poll_updates(&self) -> Result<Vec<Update>> {
            Ok(self.batches.lock().unwrap().pop_front().unwrap_or_default())
        }
    }
}
