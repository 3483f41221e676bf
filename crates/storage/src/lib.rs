pub mod jobs;
pub mod proofs;
