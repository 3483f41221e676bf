pub mod command;
pub mod config;
pub mod pipeline;
pub mod prover;
pub mod queue;
pub mod server;
#[cfg(test)]
pub mod tests;
