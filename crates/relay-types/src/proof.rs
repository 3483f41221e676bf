use std::fmt::{Display, Formatter, Result as FmtResult};

use hex::encode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::update::Update;

/// ChainId selects one independent proof chain: a merkle tree index paired with a proof format version.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChainId {
    pub merkle_tree_index: u32,
    pub format_version: u32,
}

impl ChainId {
    pub fn new(merkle_tree_index: u32, format_version: u32) -> Self {
        Self {
            merkle_tree_index,
            format_version,
        }
    }

    /// Big-endian key prefix used to group records of this chain in ordered storage.
    pub fn to_prefix(&self) -> [u8; 8] {
        let mut prefix = [0u8; 8];
        prefix[..4].copy_from_slice(&self.merkle_tree_index.to_be_bytes());
        prefix[4..].copy_from_slice(&self.format_version.to_be_bytes());
        prefix
    }
}

impl Display for ChainId {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}/v{}", self.merkle_tree_index, self.format_version)
    }
}

/// ProofData is the raw output of the proving step.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofData {
    pub proof: Vec<u8>,
    pub public_inputs: Vec<u8>,
}

impl ProofData {
    pub fn new(proof: Vec<u8>, public_inputs: Vec<u8>) -> Self {
        Self { proof, public_inputs }
    }

    /// Digest of the public inputs, committed to by the successor proof.
    pub fn commitment(&self) -> [u8; 32] {
        Sha256::digest(&self.public_inputs).into()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OutputDecodeError {
    #[error("invalid public inputs length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

/// UpdateProofOutput is the public output of an update proof.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateProofOutput {
    // slot is the attested slot proven by this update.
    pub slot: u64,
    // prev_slot is the slot of the update this proof recursively extends.
    pub prev_slot: u64,
    // prev_commitment is the commitment of the predecessor proof outputs, zeroed for genesis.
    pub prev_commitment: [u8; 32],
    // payload_hash is the sha256 digest of the raw update payload.
    pub payload_hash: [u8; 32],
}

impl UpdateProofOutput {
    pub const ENCODED_LEN: usize = 8 + 8 + 32 + 32;

    pub fn new(update: &Update, predecessor: Option<&ProofData>) -> Self {
        Self {
            slot: update.slot,
            prev_slot: update.prev_slot,
            prev_commitment: predecessor.map(ProofData::commitment).unwrap_or_default(),
            payload_hash: update.payload_hash(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::ENCODED_LEN);
        out.extend_from_slice(&self.slot.to_be_bytes());
        out.extend_from_slice(&self.prev_slot.to_be_bytes());
        out.extend_from_slice(&self.prev_commitment);
        out.extend_from_slice(&self.payload_hash);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, OutputDecodeError> {
        if bytes.len() != Self::ENCODED_LEN {
            return Err(OutputDecodeError::InvalidLength {
                expected: Self::ENCODED_LEN,
                actual: bytes.len(),
            });
        }

        let mut slot = [0u8; 8];
        let mut prev_slot = [0u8; 8];
        let mut prev_commitment = [0u8; 32];
        let mut payload_hash = [0u8; 32];
        slot.copy_from_slice(&bytes[..8]);
        prev_slot.copy_from_slice(&bytes[8..16]);
        prev_commitment.copy_from_slice(&bytes[16..48]);
        payload_hash.copy_from_slice(&bytes[48..]);

        Ok(Self {
            slot: u64::from_be_bytes(slot),
            prev_slot: u64::from_be_bytes(prev_slot),
            prev_commitment,
            payload_hash,
        })
    }
}

/// Display trait implementation to format hashes as hex encoded output.
impl Display for UpdateProofOutput {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        writeln!(f, "UpdateProofOutput {{")?;
        writeln!(f, "  slot: {}", self.slot)?;
        writeln!(f, "  prev_slot: {}", self.prev_slot)?;
        writeln!(f, "  prev_commitment: {}", encode(self.prev_commitment))?;
        writeln!(f, "  payload_hash: {}", encode(self.payload_hash))?;
        write!(f, "}}")
    }
}
