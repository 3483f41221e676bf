use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use relay_types::{ProofData, Update};
use thiserror::Error;
use tracing::debug;

pub mod command;
pub mod config;
pub mod mock;

pub use command::{CommandProver, CommandVerifier};
pub use config::{ProverConfig, ProverMode};
pub use mock::{MockProver, MockVerifier};

#[derive(Debug, Error)]
pub enum ProveError {
    /// The proving step failed in a way that may succeed on retry.
    #[error("transient prover error: {0}")]
    Transient(#[from] anyhow::Error),
    /// The inputs can never be proven; retrying is pointless.
    #[error("malformed prover input: {0}")]
    Malformed(String),
}

/// UpdateProver produces a recursive proof for one update on top of its predecessor proof.
///
/// The predecessor is `None` only for the genesis update of a chain.
#[async_trait]
pub trait UpdateProver: Send + Sync {
    async fn prove(&self, predecessor: Option<&ProofData>, update: &Update) -> Result<ProofData, ProveError>;
}

/// ProofVerifier checks a single stored proof.
#[async_trait]
pub trait ProofVerifier: Send + Sync {
    /// Returns Ok(false) if the proof is rejected, Err if the verification step itself could not run.
    async fn verify(&self, proof: &ProofData) -> Result<bool>;
}

/// Construct the prover backend pair based on the RELAY_PROVER environment variable.
pub fn prover_from_env(cfg: &ProverConfig) -> (Arc<dyn UpdateProver>, Arc<dyn ProofVerifier>) {
    match ProverMode::from_env() {
        ProverMode::Mock => {
            debug!("Using mock prover backend");
            (Arc::new(MockProver::new()), Arc::new(MockVerifier))
        }
        ProverMode::Command => {
            debug!("Using command prover backend");
            (
                Arc::new(CommandProver::new(cfg.clone())),
                Arc::new(CommandVerifier::new(cfg.clone())),
            )
        }
    }
}
