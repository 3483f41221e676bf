use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use relay_types::{ChainId, GENESIS_PREV_SLOT};
use serde::{Deserialize, Serialize};
use storage::proofs::ProofRecord;
use tracing::error;

use crate::pipeline::{ChainError, ChainVerifier, RelayContext, VerifiedChain};
use crate::queue::{QueueError, QueueStats};

/// Shared state of the admin API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub ctx: RelayContext,
    pub verifier: Arc<ChainVerifier>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/verify", post(verify))
        .route("/jobs/:queue/:slot", delete(cancel_job))
        .route("/proofs", get(proofs_in_range))
        .route("/proofs/latest", get(latest_proof))
        .route("/proofs/:slot", get(proof))
        .with_state(state)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub chain: ChainId,
    pub head: Option<u64>,
    pub update_queue: QueueStatsView,
    pub proof_queue: QueueStatsView,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct QueueStatsView {
    pub pending: usize,
    pub active: usize,
}

impl From<QueueStats> for QueueStatsView {
    fn from(stats: QueueStats) -> Self {
        Self {
            pending: stats.pending,
            active: stats.active,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct VerifyRequest {
    pub from: Option<u64>,
    pub to: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VerifyResponse {
    pub checkpoint: Option<u64>,
    pub head: Option<u64>,
    pub verified: usize,
}

impl From<VerifiedChain> for VerifyResponse {
    fn from(chain: VerifiedChain) -> Self {
        Self {
            checkpoint: chain.checkpoint,
            head: chain.head,
            verified: chain.verified,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RangeQuery {
    pub start: u64,
    pub end: u64,
}

/// ProofRecordView is the JSON representation of a stored proof record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProofRecordView {
    pub update_slot: u64,
    /// None for the genesis record.
    pub prev_update_slot: Option<u64>,
    pub proof: String,
    pub public_inputs: String,
    pub merkle_tree_index: u32,
    pub format_version: u32,
    pub created_at: u64,
}

impl From<&ProofRecord> for ProofRecordView {
    fn from(record: &ProofRecord) -> Self {
        Self {
            update_slot: record.update_slot,
            prev_update_slot: (record.prev_update_slot != GENESIS_PREV_SLOT).then_some(record.prev_update_slot),
            proof: hex::encode(&record.proof_bytes),
            public_inputs: hex::encode(&record.public_inputs),
            merkle_tree_index: record.merkle_tree_index,
            format_version: record.format_version,
            created_at: record.created_at,
        }
    }
}

/// Error body returned by every failing endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub kind: String,
    pub message: String,
    pub slot: Option<u64>,
}

pub struct ApiError {
    status: StatusCode,
    body: ErrorResponse,
}

impl ApiError {
    fn new(status: StatusCode, kind: &str, message: impl Into<String>, slot: Option<u64>) -> Self {
        Self {
            status,
            body: ErrorResponse {
                kind: kind.to_string(),
                message: message.into(),
                slot,
            },
        }
    }

    fn internal(e: impl std::fmt::Display) -> Self {
        error!("admin api request failed: {e}");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", e.to_string(), None)
    }

    fn not_found(message: impl Into<String>, slot: Option<u64>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message, slot)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<ChainError> for ApiError {
    fn from(e: ChainError) -> Self {
        match &e {
            ChainError::ChainBroken { slot, .. } => {
                Self::new(StatusCode::CONFLICT, "chain_broken", e.to_string(), Some(*slot))
            }
            ChainError::InvalidProof { slot } => {
                Self::new(StatusCode::CONFLICT, "invalid_proof", e.to_string(), Some(*slot))
            }
            ChainError::Verifier { slot, .. } => {
                Self::new(StatusCode::BAD_GATEWAY, "verifier", e.to_string(), Some(*slot))
            }
            ChainError::Storage(_) => Self::internal(e),
        }
    }
}

impl From<QueueError> for ApiError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::NotFound(slot) => Self::not_found(e.to_string(), Some(slot)),
            QueueError::JobActive(slot) => Self::new(StatusCode::CONFLICT, "job_active", e.to_string(), Some(slot)),
            _ => Self::internal(e),
        }
    }
}

async fn status(State(state): State<ApiState>) -> Result<Json<StatusResponse>, ApiError> {
    let ctx = &state.ctx;
    let head = ctx
        .proof_store
        .get_latest(ctx.chain)
        .await
        .map_err(ApiError::internal)?
        .map(|record| record.update_slot);

    Ok(Json(StatusResponse {
        chain: ctx.chain,
        head,
        update_queue: ctx.update_queue.stats().await.into(),
        proof_queue: ctx.proof_queue.stats().await.into(),
    }))
}

async fn verify(
    State(state): State<ApiState>,
    Json(request): Json<VerifyRequest>,
) -> Result<Json<VerifyResponse>, ApiError> {
    let verified = state.verifier.verify(request.from, request.to).await?;
    Ok(Json(verified.into()))
}

async fn cancel_job(
    State(state): State<ApiState>,
    Path((queue, slot)): Path<(String, u64)>,
) -> Result<StatusCode, ApiError> {
    let queue = state
        .ctx
        .queue(&queue)
        .ok_or_else(|| ApiError::not_found(format!("unknown queue {queue}"), None))?;
    queue.cancel(slot).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn latest_proof(State(state): State<ApiState>) -> Result<Json<ProofRecordView>, ApiError> {
    let ctx = &state.ctx;
    let record = ctx
        .proof_store
        .get_latest(ctx.chain)
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::not_found("no proof stored", None))?;
    Ok(Json((&record).into()))
}

async fn proof(State(state): State<ApiState>, Path(slot): Path<u64>) -> Result<Json<ProofRecordView>, ApiError> {
    let ctx = &state.ctx;
    let record = ctx
        .proof_store
        .get(slot, ctx.chain)
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::not_found(format!("no proof stored for slot {slot}"), Some(slot)))?;
    Ok(Json((&record).into()))
}

async fn proofs_in_range(
    State(state): State<ApiState>,
    Query(range): Query<RangeQuery>,
) -> Result<Json<Vec<ProofRecordView>>, ApiError> {
    if range.start > range.end {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "invalid_range",
            format!("start {} is after end {}", range.start, range.end),
            None,
        ));
    }
    let ctx = &state.ctx;
    let records = ctx
        .proof_store
        .get_range(ctx.chain, range.start, range.end)
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(records.iter().map(ProofRecordView::from).collect()))
}
