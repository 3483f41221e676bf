use anyhow::Result;
use relay_types::Update;
use tracing::{debug, error, info};

use crate::pipeline::RelayContext;
use crate::queue::{EnqueueOutcome, Job};

/// UpdateScheduler moves observed updates from the update queue onto the proof queue.
///
/// Updates whose proof is already stored are completed without scheduling any proving work.
pub struct UpdateScheduler {
    ctx: RelayContext,
}

impl UpdateScheduler {
    pub fn new(ctx: RelayContext) -> Self {
        Self { ctx }
    }

    /// Runs until the update queue is closed.
    pub async fn run(&self) -> Result<()> {
        while let Some(job) = self.ctx.update_queue.dequeue().await? {
            if let Err(e) = self.schedule(job).await {
                error!("Failed to schedule update: {e:?}");
            }
        }
        info!("Update scheduler shutting down");
        Ok(())
    }

    pub async fn schedule(&self, job: Job<Update>) -> Result<()> {
        let update_queue = &self.ctx.update_queue;
        let lease = job.lease();
        let slot = job.key;

        match self.ctx.proof_store.get(slot, self.ctx.chain).await {
            Ok(Some(_)) => {
                debug!(slot, "proof already stored, nothing to schedule");
                update_queue.ack(lease).await?;
                return Ok(());
            }
            Ok(None) => {}
            Err(e) => {
                update_queue.fail(lease, &e.to_string()).await?;
                return Ok(());
            }
        }

        match self.ctx.proof_queue.enqueue(slot, &job.payload).await {
            Ok(outcome) => {
                if outcome == EnqueueOutcome::Enqueued {
                    debug!(slot, "proof job scheduled");
                }
                update_queue.ack(lease).await?;
            }
            Err(e) => {
                update_queue.fail(lease, &e.to_string()).await?;
            }
        }
        Ok(())
    }
}
