use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use relay_types::{Update, GENESIS_PREV_SLOT};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use crate::pipeline::UpdateSource;

const FINALITY_UPDATE_PATH: &str = "/eth/v1/beacon/light_client/finality_update";

#[derive(Debug, Deserialize)]
struct FinalityUpdateResponse {
    data: Value,
}

/// BeaconApiSource polls a beacon node for the latest light client finality update.
///
/// Every new update is chained after the previously observed one, starting from the checkpoint slot.
pub struct BeaconApiSource {
    client: reqwest::Client,
    base_url: String,
    last_slot: Mutex<Option<u64>>,
}

impl BeaconApiSource {
    pub fn new(base_url: impl Into<String>, checkpoint: Option<u64>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            last_slot: Mutex::new(checkpoint),
        }
    }

    async fn fetch_finality_update(&self) -> Result<Value> {
        let url = format!("{}{FINALITY_UPDATE_PATH}", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Failed to fetch {url}"))?
            .error_for_status()?;
        let body: FinalityUpdateResponse = response.json().await.context("Failed to decode finality update")?;
        Ok(body.data)
    }
}

#[async_trait]
impl UpdateSource for BeaconApiSource {
    async fn poll_updates(&self) -> Result<Vec<Update>> {
        let data = self.fetch_finality_update().await?;
        let slot = attested_slot(&data)?;

        let mut last_slot = self.last_slot.lock().await;
        if last_slot.is_some_and(|last| slot <= last) {
            debug!(slot, "no new finality update");
            return Ok(Vec::new());
        }

        let prev_slot = last_slot.unwrap_or(GENESIS_PREV_SLOT);
        *last_slot = Some(slot);
        Ok(vec![Update::new(slot, prev_slot, serde_json::to_vec(&data)?)])
    }
}

/// Extracts the attested header slot, accepting both the post-capella and the legacy header layout.
pub fn attested_slot(data: &Value) -> Result<u64> {
    let header = data
        .get("attested_header")
        .ok_or_else(|| anyhow!("finality update has no attested_header"))?;
    let slot = header
        .get("beacon")
        .and_then(|beacon| beacon.get("slot"))
        .or_else(|| header.get("slot"))
        .ok_or_else(|| anyhow!("attested_header has no slot"))?;

    match slot {
        Value::String(s) => s.parse().with_context(|| format!("invalid slot {s}")),
        Value::Number(n) => n.as_u64().ok_or_else(|| anyhow!("invalid slot {n}")),
        other => Err(anyhow!("unexpected slot value {other}")),
    }
}
