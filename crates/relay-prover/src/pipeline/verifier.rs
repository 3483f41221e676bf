use std::sync::Arc;

use relay_types::{ChainId, GENESIS_PREV_SLOT};
use serde::Serialize;
use storage::proofs::{ProofStore, ProofStoreError};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::prover::ProofVerifier;

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("chain broken at slot {slot}: {reason}")]
    ChainBroken { slot: u64, reason: String },
    #[error("invalid proof at slot {slot}")]
    InvalidProof { slot: u64 },
    #[error("Storage error: {0}")]
    Storage(#[from] ProofStoreError),
    #[error("verification step failed at slot {slot}: {source}")]
    Verifier {
        slot: u64,
        #[source]
        source: anyhow::Error,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct VerifiedChain {
    /// Slot the walk started after, None for genesis.
    pub checkpoint: Option<u64>,
    /// Highest verified slot, None if no record follows the checkpoint.
    pub head: Option<u64>,
    /// Number of records verified.
    pub verified: usize,
}

/// ChainVerifier walks the stored chain forward from a trusted checkpoint and verifies every record.
///
/// The walk stops at the first broken link or rejected proof and never skips ahead.
pub struct ChainVerifier {
    store: Arc<dyn ProofStore>,
    verifier: Arc<dyn ProofVerifier>,
    chain: ChainId,
}

impl ChainVerifier {
    pub fn new(store: Arc<dyn ProofStore>, verifier: Arc<dyn ProofVerifier>, chain: ChainId) -> Self {
        Self { store, verifier, chain }
    }

    /// Verifies the chain after `from` (genesis if None) up to and including `to` (the head if None).
    pub async fn verify(&self, from: Option<u64>, to: Option<u64>) -> Result<VerifiedChain, ChainError> {
        let mut current = from.unwrap_or(GENESIS_PREV_SLOT);
        let mut head = None;
        let mut verified = 0;

        while let Some(record) = self.store.get_next(self.chain, current).await? {
            let slot = record.update_slot;
            if to.is_some_and(|to| slot > to) {
                break;
            }

            if record.prev_update_slot != current {
                return Err(self.broken(
                    slot,
                    format!("links to {} instead of {}", record.prev_update_slot, display_slot(current)),
                ));
            }
            if current != GENESIS_PREV_SLOT && slot <= current {
                return Err(self.broken(slot, format!("does not advance past {current}")));
            }

            match self.verifier.verify(&record.proof_data()).await {
                Ok(true) => debug!(slot, "proof verified"),
                Ok(false) => {
                    error!(slot, chain = %self.chain, "invalid proof, halting verification");
                    return Err(ChainError::InvalidProof { slot });
                }
                Err(source) => return Err(ChainError::Verifier { slot, source }),
            }

            verified += 1;
            head = Some(slot);
            current = slot;
        }

        // records beyond the end of the walk are unreachable from the checkpoint
        if to.map_or(true, |to| current == GENESIS_PREV_SLOT || current < to) {
            let after = if current == GENESIS_PREV_SLOT { 0 } else { current + 1 };
            let end = to.unwrap_or(GENESIS_PREV_SLOT - 1);
            if after <= end {
                if let Some(orphan) = self.store.get_first_in_range(self.chain, after, end).await? {
                    return Err(self.broken(
                        orphan.update_slot,
                        format!("unreachable from {}", display_slot(current)),
                    ));
                }
            }
        }

        info!(chain = %self.chain, ?head, verified, "chain verified");
        Ok(VerifiedChain {
            checkpoint: from,
            head,
            verified,
        })
    }

    fn broken(&self, slot: u64, reason: String) -> ChainError {
        error!(slot, chain = %self.chain, %reason, "chain broken, halting verification");
        ChainError::ChainBroken { slot, reason }
    }
}

fn display_slot(slot: u64) -> String {
    if slot == GENESIS_PREV_SLOT {
        "genesis".to_string()
    } else {
        slot.to_string()
    }
}
