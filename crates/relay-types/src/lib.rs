pub mod proof;
pub mod update;

pub use proof::{ChainId, OutputDecodeError, ProofData, UpdateProofOutput};
pub use update::{Update, UpdateError, GENESIS_PREV_SLOT};
