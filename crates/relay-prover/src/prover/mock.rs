use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use relay_types::{ProofData, Update, UpdateProofOutput};
use sha2::{Digest, Sha256};

use crate::prover::{ProofVerifier, ProveError, UpdateProver};

const MOCK_PROOF_DOMAIN: &[u8] = b"relay-prover/mock-proof/v1";

fn mock_proof(public_inputs: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(MOCK_PROOF_DOMAIN);
    hasher.update(public_inputs);
    hasher.finalize().to_vec()
}

/// MockProver produces hash-based stand-in proofs that commit to the update and its predecessor.
///
/// Proofs are deterministic, so proving the same update twice yields identical records.
#[derive(Debug, Default)]
pub struct MockProver {
    invocations: AtomicUsize,
    delay: Option<Duration>,
}

impl MockProver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates proving latency.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            invocations: AtomicUsize::new(0),
            delay: Some(delay),
        }
    }

    /// Number of times `prove` has been called.
    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UpdateProver for MockProver {
    async fn prove(&self, predecessor: Option<&ProofData>, update: &Update) -> Result<ProofData, ProveError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        update.validate().map_err(|e| ProveError::Malformed(e.to_string()))?;
        if !update.is_genesis() && predecessor.is_none() {
            return Err(ProveError::Malformed(format!(
                "missing predecessor proof for slot {}",
                update.prev_slot
            )));
        }

        let public_inputs = UpdateProofOutput::new(update, predecessor).to_bytes();
        Ok(ProofData::new(mock_proof(&public_inputs), public_inputs))
    }
}

/// MockVerifier accepts exactly the proofs produced by [`MockProver`].
#[derive(Debug, Default, Clone, Copy)]
pub struct MockVerifier;

#[async_trait]
impl ProofVerifier for MockVerifier {
    async fn verify(&self, proof: &ProofData) -> Result<bool> {
        if UpdateProofOutput::from_bytes(&proof.public_inputs).is_err() {
            return Ok(false);
        }
        Ok(proof.proof == mock_proof(&proof.public_inputs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_proof_roundtrip() {
        let prover = MockProver::new();
        let genesis = prover.prove(None, &Update::genesis(100, vec![1])).await.unwrap();
        let next = prover
            .prove(Some(&genesis), &Update::new(101, 100, vec![2]))
            .await
            .unwrap();

        assert!(MockVerifier.verify(&genesis).await.unwrap());
        assert!(MockVerifier.verify(&next).await.unwrap());
        assert_eq!(prover.invocations(), 2);

        let output = UpdateProofOutput::from_bytes(&next.public_inputs).unwrap();
        assert_eq!(output.prev_commitment, genesis.commitment());
    }

    #[tokio::test]
    async fn test_tampered_proof_is_rejected() {
        let mut proof = MockProver::new()
            .prove(None, &Update::genesis(100, vec![1]))
            .await
            .unwrap();
        proof.proof[0] ^= 0xff;

        assert!(!MockVerifier.verify(&proof).await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_predecessor_is_malformed() {
        let result = MockProver::new().prove(None, &Update::new(101, 100, vec![1])).await;
        assert!(matches!(result, Err(ProveError::Malformed(_))));
    }
}
