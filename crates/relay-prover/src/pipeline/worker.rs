use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use relay_types::Update;
use storage::proofs::ProofRecord;
use tracing::{debug, error, info, warn};

use crate::pipeline::RelayContext;
use crate::prover::{ProveError, UpdateProver};
use crate::queue::{FailOutcome, Job, JobOutcome, Lease, QueueError, QueueEvent};

/// A deferred job is reported as stalled every this many deferrals.
pub const STALL_REPORT_INTERVAL: u32 = 20;

/// What happened to a single proof job.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobResult {
    /// A new proof record was stored.
    Stored,
    /// The record already existed, the prover was not invoked.
    AlreadyStored,
    /// The predecessor proof is not stored yet, the job will be retried after a delay.
    Deferred,
    /// The attempt failed and the job will be retried with backoff.
    Retrying,
    /// The job failed terminally.
    Failed,
}

/// ProofGeneratorWorker consumes proof jobs, proves each update on top of its stored predecessor and
/// persists the resulting record.
pub struct ProofGeneratorWorker {
    id: usize,
    ctx: RelayContext,
    prover: Arc<dyn UpdateProver>,
    prove_timeout: Duration,
    defer_delay: Duration,
}

impl ProofGeneratorWorker {
    pub fn new(
        id: usize,
        ctx: RelayContext,
        prover: Arc<dyn UpdateProver>,
        prove_timeout: Duration,
        defer_delay: Duration,
    ) -> Self {
        Self {
            id,
            ctx,
            prover,
            prove_timeout,
            defer_delay,
        }
    }

    /// Runs until the proof queue is closed.
    pub async fn run(&self) -> Result<()> {
        while let Some(job) = self.ctx.proof_queue.dequeue().await? {
            let slot = job.key;
            match self.process(job).await {
                Ok(result) => debug!(worker = self.id, slot, ?result, "proof job processed"),
                Err(QueueError::LeaseLost(_)) => {
                    warn!(worker = self.id, slot, "lease lost before the job was settled, leaving it to its new owner")
                }
                Err(e) => error!(worker = self.id, slot, "Failed to settle proof job: {e:?}"),
            }
        }
        info!(worker = self.id, "Proof worker shutting down");
        Ok(())
    }

    /// Processes one leased job and settles it on the queue.
    pub async fn process(&self, job: Job<Update>) -> Result<JobResult, QueueError> {
        let queue = &self.ctx.proof_queue;
        let chain = self.ctx.chain;
        let lease = job.lease();
        let update = job.payload;
        let slot = job.key;

        if slot != update.slot {
            queue
                .fail_permanently(lease, &format!("job key {slot} does not match update slot {}", update.slot))
                .await?;
            return Ok(JobResult::Failed);
        }

        match self.ctx.proof_store.get(slot, chain).await {
            Ok(Some(_)) => {
                debug!(worker = self.id, slot, "proof already stored, skipping");
                queue.ack(lease).await?;
                return Ok(JobResult::AlreadyStored);
            }
            Ok(None) => {}
            Err(e) => return self.retry(lease, &format!("proof store read failed: {e}")).await,
        }

        let predecessor = match update.predecessor() {
            None => None,
            Some(prev_slot) => match self.ctx.proof_store.get(prev_slot, chain).await {
                Ok(Some(record)) => Some(record.proof_data()),
                Ok(None) => {
                    debug!(worker = self.id, slot, prev_slot, "predecessor proof missing, deferring");
                    queue.defer(lease, self.defer_delay).await?;
                    self.report_stall(slot, prev_slot, job.deferrals.saturating_add(1)).await;
                    return Ok(JobResult::Deferred);
                }
                Err(e) => return self.retry(lease, &format!("proof store read failed: {e}")).await,
            },
        };

        info!(worker = self.id, slot, attempt = job.attempts + 1, "proving update");
        let proved = tokio::time::timeout(self.prove_timeout, self.prover.prove(predecessor.as_ref(), &update)).await;
        let proof = match proved {
            Ok(Ok(proof)) => proof,
            Ok(Err(ProveError::Malformed(reason))) => {
                error!(worker = self.id, slot, %reason, "update cannot be proven");
                queue.fail_permanently(lease, &reason).await?;
                return Ok(JobResult::Failed);
            }
            Ok(Err(e @ ProveError::Transient(_))) => return self.retry(lease, &e.to_string()).await,
            Err(_) => {
                let reason = format!("prover timed out after {}s", self.prove_timeout.as_secs_f64());
                return self.retry(lease, &reason).await;
            }
        };

        let record = ProofRecord::new(&update, proof, chain);
        match self.ctx.proof_store.put(&record).await {
            Ok(()) => {
                info!(worker = self.id, slot, %chain, "proof stored");
                queue.ack(lease).await?;
                Ok(JobResult::Stored)
            }
            Err(e) if e.is_integrity_violation() => {
                error!(
                    worker = self.id,
                    slot,
                    %chain,
                    "INTEGRITY ERROR: stored chain contradicts freshly generated proof: {e}"
                );
                queue.fail_permanently(lease, &format!("integrity error: {e}")).await?;
                Ok(JobResult::Failed)
            }
            Err(e) => self.retry(lease, &format!("proof store write failed: {e}")).await,
        }
    }

    /// Reports a job that keeps waiting for a predecessor proof which never shows up.
    async fn report_stall(&self, slot: u64, prev_slot: u64, deferrals: u32) {
        if deferrals % STALL_REPORT_INTERVAL != 0 {
            return;
        }
        let predecessor = match self.ctx.proof_queue.job_state(prev_slot).await {
            Ok(Some(state)) => format!("{state:?}"),
            Ok(None) => "not queued".to_string(),
            Err(e) => format!("unknown ({e})"),
        };
        let detail = format!("waiting for proof of slot {prev_slot}, predecessor job {predecessor}");
        warn!(worker = self.id, slot, prev_slot, deferrals, %predecessor, "proof job stalled on missing predecessor");
        self.ctx.events.publish(QueueEvent::new(
            self.ctx.proof_queue.name(),
            slot,
            JobOutcome::Stalled { deferrals },
            Some(detail),
        ));
    }

    async fn retry(&self, lease: Lease, reason: &str) -> Result<JobResult, QueueError> {
        warn!(worker = self.id, slot = lease.key, %reason, "proof attempt failed");
        match self.ctx.proof_queue.fail(lease, reason).await? {
            FailOutcome::Retrying { .. } => Ok(JobResult::Retrying),
            FailOutcome::Failed { .. } => Ok(JobResult::Failed),
        }
    }
}
