use std::path::Path;
use std::process::Stdio;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use relay_types::{ProofData, Update};
use serde::Serialize;
use serde_json::Value;
use tempfile::TempDir;
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::prover::{ProofVerifier, ProveError, ProverConfig, UpdateProver};

/// Input file handed to the witness generator.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WitnessInput {
    slot: u64,
    prev_slot: Option<u64>,
    update: Value,
    prev_proof: Option<Value>,
    prev_public: Option<Value>,
}

/// CommandProver drives the circuit toolchain out of process.
///
/// For each update it writes the circuit input, runs the witness generator and then the prover, reads
/// back `proof.json` and `public.json` and removes the witness file. Proof and public inputs are stored
/// as the JSON bytes emitted by the prover.
pub struct CommandProver {
    cfg: ProverConfig,
}

impl CommandProver {
    pub fn new(cfg: ProverConfig) -> Self {
        Self { cfg }
    }

    async fn prove_in(&self, dir: &Path, input: &WitnessInput) -> Result<ProofData> {
        let input_path = dir.join("input.json");
        let witness_path = dir.join("witness.wtns");
        let proof_path = dir.join("proof.json");
        let public_path = dir.join("public.json");

        fs::write(&input_path, serde_json::to_vec(input)?).await?;

        run(
            Command::new(&self.cfg.witness_generator)
                .arg(&input_path)
                .arg(&witness_path),
        )
        .await
        .context("witness generation failed")?;

        let proved = run(
            Command::new(&self.cfg.prover_binary)
                .arg(&self.cfg.zkey)
                .arg(&witness_path)
                .arg(&proof_path)
                .arg(&public_path),
        )
        .await
        .context("proof generation failed");

        if let Err(e) = fs::remove_file(&witness_path).await {
            warn!(slot = input.slot, "failed to remove witness file: {e}");
        }
        proved?;

        let proof = fs::read(&proof_path).await.context("failed to read proof.json")?;
        let public_inputs = fs::read(&public_path).await.context("failed to read public.json")?;
        Ok(ProofData::new(proof, public_inputs))
    }
}

#[async_trait]
impl UpdateProver for CommandProver {
    async fn prove(&self, predecessor: Option<&ProofData>, update: &Update) -> Result<ProofData, ProveError> {
        update.validate().map_err(|e| ProveError::Malformed(e.to_string()))?;
        if !update.is_genesis() && predecessor.is_none() {
            return Err(ProveError::Malformed(format!(
                "missing predecessor proof for slot {}",
                update.prev_slot
            )));
        }
        let input = witness_input(predecessor, update)?;

        let dir = scratch_dir(&self.cfg.work_dir, &format!("slot_{}_", update.slot))?;
        debug!(slot = update.slot, dir = %dir.path().display(), "running external prover");
        let result = self.prove_in(dir.path(), &input).await;
        if let Err(e) = dir.close() {
            warn!(slot = update.slot, "failed to clean up work dir: {e}");
        }
        Ok(result?)
    }
}

/// Builds the circuit input. Inputs that are not valid JSON can never be proven.
fn witness_input(predecessor: Option<&ProofData>, update: &Update) -> Result<WitnessInput, ProveError> {
    let json = |bytes: &[u8], what: &str| {
        serde_json::from_slice::<Value>(bytes)
            .map_err(|e| ProveError::Malformed(format!("{what} for slot {} is not valid JSON: {e}", update.slot)))
    };

    Ok(WitnessInput {
        slot: update.slot,
        prev_slot: update.predecessor(),
        update: json(&update.payload, "update payload")?,
        prev_proof: predecessor.map(|p| json(&p.proof, "predecessor proof")).transpose()?,
        prev_public: predecessor
            .map(|p| json(&p.public_inputs, "predecessor public inputs"))
            .transpose()?,
    })
}

/// CommandVerifier runs the configured verifier binary and maps its exit status to a verdict.
pub struct CommandVerifier {
    cfg: ProverConfig,
}

impl CommandVerifier {
    pub fn new(cfg: ProverConfig) -> Self {
        Self { cfg }
    }
}

#[async_trait]
impl ProofVerifier for CommandVerifier {
    async fn verify(&self, proof: &ProofData) -> Result<bool> {
        let dir = scratch_dir(&self.cfg.work_dir, "verify_")?;
        let proof_path = dir.path().join("proof.json");
        let public_path = dir.path().join("public.json");
        fs::write(&proof_path, &proof.proof).await?;
        fs::write(&public_path, &proof.public_inputs).await?;

        let status = Command::new(&self.cfg.verifier_binary)
            .kill_on_drop(true)
            .arg(&self.cfg.verification_key)
            .arg(&public_path)
            .arg(&proof_path)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .with_context(|| format!("failed to spawn {}", self.cfg.verifier_binary.display()));

        if let Err(e) = dir.close() {
            warn!("failed to clean up verifier dir: {e}");
        }
        Ok(status?.success())
    }
}

/// Creates a scratch dir under `work_dir`. It is removed when dropped, including when the owning future
/// is cancelled by a timeout.
fn scratch_dir(work_dir: &Path, prefix: &str) -> Result<TempDir> {
    std::fs::create_dir_all(work_dir).with_context(|| format!("failed to create work dir {}", work_dir.display()))?;
    tempfile::Builder::new()
        .prefix(prefix)
        .tempdir_in(work_dir)
        .with_context(|| format!("failed to create scratch dir in {}", work_dir.display()))
}

/// Runs a toolchain step. The child is killed if the returned future is dropped before it exits.
async fn run(cmd: &mut Command) -> Result<()> {
    let output = cmd
        .kill_on_drop(true)
        .stdin(Stdio::null())
        .output()
        .await
        .with_context(|| format!("failed to spawn {:?}", cmd.as_std().get_program()))?;
    if !output.status.success() {
        return Err(anyhow!(
            "{:?} exited with {}: {}",
            cmd.as_std().get_program(),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }
    Ok(())
}
