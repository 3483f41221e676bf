use std::fmt::{Display, Formatter, Result as FmtResult};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Sentinel predecessor slot carried by the first update of a chain.
pub const GENESIS_PREV_SLOT: u64 = u64::MAX;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UpdateError {
    #[error("malformed update at slot {slot}: {reason}")]
    Malformed { slot: u64, reason: String },
}

/// Update is a single light-client update observed on the beacon chain.
///
/// `slot` identifies the attested header the update finalizes, `prev_slot` the update it chains after.
/// The payload is opaque to the relay and is handed to the prover as-is.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Update {
    pub slot: u64,
    pub prev_slot: u64,
    pub payload: Vec<u8>,
}

impl Update {
    pub fn new(slot: u64, prev_slot: u64, payload: Vec<u8>) -> Self {
        Self {
            slot,
            prev_slot,
            payload,
        }
    }

    /// Creates the first update of a chain, which has no predecessor.
    pub fn genesis(slot: u64, payload: Vec<u8>) -> Self {
        Self::new(slot, GENESIS_PREV_SLOT, payload)
    }

    pub fn is_genesis(&self) -> bool {
        self.prev_slot == GENESIS_PREV_SLOT
    }

    /// Returns the predecessor slot, or None for a genesis update.
    pub fn predecessor(&self) -> Option<u64> {
        (!self.is_genesis()).then_some(self.prev_slot)
    }

    pub fn payload_hash(&self) -> [u8; 32] {
        Sha256::digest(&self.payload).into()
    }

    /// Checks the shape of the update before it is admitted into the pipeline.
    pub fn validate(&self) -> Result<(), UpdateError> {
        if self.slot == GENESIS_PREV_SLOT {
            return Err(self.malformed("slot collides with the genesis sentinel"));
        }
        if !self.is_genesis() && self.prev_slot >= self.slot {
            return Err(self.malformed(format!(
                "predecessor slot {} does not precede slot {}",
                self.prev_slot, self.slot
            )));
        }
        if self.payload.is_empty() {
            return Err(self.malformed("empty payload"));
        }
        Ok(())
    }

    fn malformed(&self, reason: impl Into<String>) -> UpdateError {
        UpdateError::Malformed {
            slot: self.slot,
            reason: reason.into(),
        }
    }
}

impl Display for Update {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self.predecessor() {
            Some(prev) => write!(f, "update {prev} -> {}", self.slot),
            None => write!(f, "update genesis -> {}", self.slot),
        }
    }
}
