use anyhow::{anyhow, Result};
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use storage::jobs::{JobStore, RocksDbJobStore};
use storage::proofs::{ProofStore, RocksDbProofStore};
use tracing::{error, info};

use crate::command::cli::{QueryCommands, VERSION};
use crate::config::Config;
use crate::server::api::{ErrorResponse, ProofRecordView, StatusResponse, VerifyRequest, VerifyResponse};
use crate::server::start_server;

pub mod cli;
pub use cli::{Cli, Commands};

pub fn init() -> Result<()> {
    Config::init()?;

    Ok(())
}

pub async fn start() -> Result<()> {
    let config = Config::load()?;
    info!("starting relay with admin API at {}", config.http_address);
    start_server(config).await?;

    Ok(())
}

pub fn unsafe_reset_db() -> Result<()> {
    let storage_path = Config::storage_path()?;
    info!("resetting db state at {}", storage_path.display());

    let mut proofs = RocksDbProofStore::new(&storage_path)?;
    proofs.unsafe_reset()?;
    let jobs = RocksDbJobStore::new(&storage_path)?;
    jobs.reset_db()?;
    Ok(())
}

pub fn version() {
    info!("version: {VERSION}");
}

pub async fn verify(from: Option<u64>, to: Option<u64>, server: String) -> Result<()> {
    let client = reqwest::Client::new();
    let response = client
        .post(format!("{server}/verify"))
        .json(&VerifyRequest { from, to })
        .send()
        .await?;

    if response.status() == StatusCode::CONFLICT {
        let failure: ErrorResponse = response.json().await?;
        error!("Chain verification failed ({}): {}", failure.kind, failure.message);
        return Err(anyhow!("chain verification failed: {}", failure.message));
    }

    let verified: VerifyResponse = decode(response).await?;
    info!("Chain verified:");
    info!("  From: {}", display_slot(verified.checkpoint));
    info!("  Head: {}", display_head(verified.head));
    info!("  Verified proofs: {}", verified.verified);
    Ok(())
}

pub async fn cancel(queue: String, slot: u64, server: String) -> Result<()> {
    let client = reqwest::Client::new();
    let response = client.delete(format!("{server}/jobs/{queue}/{slot}")).send().await?;

    if response.status() == StatusCode::NOT_FOUND {
        info!("No pending job for slot {slot} in queue {queue}");
        return Ok(());
    }
    decode_empty(response).await?;
    info!("Cancelled job for slot {slot} in queue {queue}");
    Ok(())
}

pub async fn query(query_cmd: QueryCommands) -> Result<()> {
    let client = reqwest::Client::new();
    match query_cmd {
        QueryCommands::Latest { server } => {
            let response = client.get(format!("{server}/proofs/latest")).send().await?;
            match decode_optional::<ProofRecordView>(response).await? {
                Some(proof) => {
                    info!("Latest update proof:");
                    log_proof(&proof);
                }
                None => info!("No proof data returned"),
            }
        }
        QueryCommands::Proof { slot, server } => {
            let response = client.get(format!("{server}/proofs/{slot}")).send().await?;
            match decode_optional::<ProofRecordView>(response).await? {
                Some(proof) => {
                    info!("Update proof for slot {slot}:");
                    log_proof(&proof);
                }
                None => info!("No proof data returned"),
            }
        }
        QueryCommands::Range {
            start_slot,
            end_slot,
            server,
        } => {
            let response = client
                .get(format!("{server}/proofs"))
                .query(&[("start", start_slot), ("end", end_slot)])
                .send()
                .await?;
            let proofs: Vec<ProofRecordView> = decode(response).await?;
            info!("Found {} update proof(s):\n", proofs.len());

            for (i, proof) in proofs.iter().enumerate() {
                info!("Proof {} of {}:", i + 1, proofs.len());
                log_proof(proof);
                info!("");
            }
        }
        QueryCommands::Status { server } => {
            let response = client.get(format!("{server}/status")).send().await?;
            let status: StatusResponse = decode(response).await?;
            info!("Chain {}:", status.chain);
            info!("  Head: {}", display_head(status.head));
            info!(
                "  Update queue: {} pending, {} active",
                status.update_queue.pending, status.update_queue.active
            );
            info!(
                "  Proof queue: {} pending, {} active",
                status.proof_queue.pending, status.proof_queue.active
            );
        }
    }

    Ok(())
}

fn log_proof(proof: &ProofRecordView) {
    info!("  Slot: {}", proof.update_slot);
    info!("  Previous slot: {}", display_slot(proof.prev_update_slot));
    info!("  Chain: {}/v{}", proof.merkle_tree_index, proof.format_version);
    info!("  Proof size: {} bytes", proof.proof.len() / 2);
    info!("  Public inputs size: {} bytes", proof.public_inputs.len() / 2);
    info!("  Created at (Unix): {}", proof.created_at);
}

fn display_slot(slot: Option<u64>) -> String {
    slot.map_or_else(|| "genesis".to_string(), |slot| slot.to_string())
}

fn display_head(slot: Option<u64>) -> String {
    slot.map_or_else(|| "none".to_string(), |slot| slot.to_string())
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
    let response = check_status(response).await?;
    Ok(response.json().await?)
}

async fn decode_optional<T: DeserializeOwned>(response: Response) -> Result<Option<T>> {
    if response.status() == StatusCode::NOT_FOUND {
        return Ok(None);
    }
    decode(response).await.map(Some)
}

async fn decode_empty(response: Response) -> Result<()> {
    check_status(response).await.map(|_| ())
}

async fn check_status(response: Response) -> Result<Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    match response.json::<ErrorResponse>().await {
        Ok(failure) => Err(anyhow!("request failed with {status} ({}): {}", failure.kind, failure.message)),
        Err(_) => Err(anyhow!("request failed with {status}")),
    }
}
