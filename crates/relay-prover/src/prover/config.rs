use std::env;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Environment variable selecting the prover backend.
pub const PROVER_MODE_ENV: &str = "RELAY_PROVER";

/// ProverMode defines the backend used for proving: [Mock, Command].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProverMode {
    Mock,
    Command,
}

impl ProverMode {
    /// Returns the ProverMode by reading the RELAY_PROVER environment variable.
    /// If RELAY_PROVER is not set, this method provides a fallback of Mock mode.
    pub fn from_env() -> ProverMode {
        let mode_str = env::var(PROVER_MODE_ENV).unwrap_or_default();
        Self::parse(&mode_str).unwrap_or_else(|| {
            warn!("{PROVER_MODE_ENV} unset or invalid ('{mode_str}'), defaulting to mock mode");
            Self::Mock
        })
    }

    fn parse(mode: &str) -> Option<ProverMode> {
        match mode.trim().to_ascii_lowercase().as_str() {
            "mock" => Some(Self::Mock),
            "command" | "rapidsnark" => Some(Self::Command),
            _ => None,
        }
    }
}

/// Paths and limits for the out-of-process proving toolchain.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ProverConfig {
    /// Upper bound for a single proving call in seconds. Must stay below the queue visibility timeout.
    pub prove_timeout_secs: u64,

    /// Compiled witness generator of the light client circuit.
    pub witness_generator: PathBuf,

    /// Prover binary invoked as `<prover> <zkey> <witness> <proof.json> <public.json>`.
    pub prover_binary: PathBuf,

    /// Proving key of the circuit.
    pub zkey: PathBuf,

    /// Verifier binary invoked as `<verifier> <verification_key> <public.json> <proof.json>`.
    pub verifier_binary: PathBuf,

    /// Verification key of the circuit.
    pub verification_key: PathBuf,

    /// Scratch directory for witness and proof files.
    pub work_dir: PathBuf,
}

impl Default for ProverConfig {
    fn default() -> Self {
        Self {
            prove_timeout_secs: 300,
            witness_generator: "light_client".into(),
            prover_binary: "prover".into(),
            zkey: "light_client.zkey".into(),
            verifier_binary: "verifier".into(),
            verification_key: "verification_key.json".into(),
            work_dir: env::temp_dir().join("relay-prover"),
        }
    }
}

impl ProverConfig {
    pub fn prove_timeout(&self) -> Duration {
        Duration::from_secs(self.prove_timeout_secs)
    }
}
