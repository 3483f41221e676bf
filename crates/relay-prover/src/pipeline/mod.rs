use std::sync::Arc;

use relay_types::{ChainId, Update};
use storage::proofs::ProofStore;

use crate::queue::{EventMonitor, WorkQueue};

pub mod beacon;
pub mod poller;
pub mod scheduler;
pub mod verifier;
pub mod worker;

pub use beacon::BeaconApiSource;
pub use poller::{PollSummary, UpdatePoller, UpdateSource};
pub use scheduler::UpdateScheduler;
pub use verifier::{ChainError, ChainVerifier, VerifiedChain};
pub use worker::{JobResult, ProofGeneratorWorker, STALL_REPORT_INTERVAL};

/// RelayContext holds the shared handles every pipeline stage works against.
#[derive(Clone)]
pub struct RelayContext {
    pub chain: ChainId,
    pub proof_store: Arc<dyn ProofStore>,
    pub update_queue: Arc<WorkQueue<Update>>,
    pub proof_queue: Arc<WorkQueue<Update>>,
    pub events: EventMonitor,
}

impl RelayContext {
    /// Returns the queue registered under `name`.
    pub fn queue(&self, name: &str) -> Option<&Arc<WorkQueue<Update>>> {
        if name == self.update_queue.name() {
            Some(&self.update_queue)
        } else if name == self.proof_queue.name() {
            Some(&self.proof_queue)
        } else {
            None
        }
    }

    /// Closes both queues, which stops every stage blocked on them.
    pub async fn close(&self) {
        self.update_queue.close().await;
        self.proof_queue.close().await;
    }
}
