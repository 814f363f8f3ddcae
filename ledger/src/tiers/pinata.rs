//! # Pinata (IPFS pinning) Backend
//!
//! Uploads go through the pinning service API; downloads go through public
//! IPFS gateways, first success wins.
//!
//! | Operation       | Call                                    |
//! |-----------------|-----------------------------------------|
//! | `put`           | `POST {api}/pinning/pinFileToIPFS`      |
//! | `tag`           | `PUT  {api}/pinning/hashMetadata`       |
//! | `latest_tagged` | `GET  {api}/data/pinList`               |
//! | `get`           | `GET  {gateway}/ipfs/{cid}` per gateway |
//!
//! Without credentials every API call reports the tier unavailable. Gateway
//! reads still work, since they need no account. Each gateway request carries
//! its own timeout so one stalled gateway cannot starve the rest.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use super::content::{ContentAddressedStore, ContentId, PointerMetadata};
use super::{check_status, http_client, TierError, TierResult};
use crate::config::{
    BLOB_PROJECT_TAG, DEFAULT_IPFS_GATEWAYS, GATEWAY_REQUEST_TIMEOUT, MIN_GATEWAY_REQUEST_TIMEOUT,
};

pub const DEFAULT_PINATA_API: &str = "https://api.pinata.cloud";

const BLOB_TYPE_TAG: &str = "ledger_snapshot";
const UPLOAD_FILE_NAME: &str = "snapshot.enc";

#[derive(Clone)]
pub struct PinataConfig {
    pub api_key: Option<String>,
    pub secret_key: Option<String>,
    pub api_base: String,
    pub gateways: Vec<String>,
    /// Bound on each gateway request in `get`.
    pub gateway_timeout: Duration,
}

impl std::fmt::Debug for PinataConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinataConfig")
            .field("credentials", &self.has_credentials())
            .field("api_base", &self.api_base)
            .field("gateways", &self.gateways)
            .field("gateway_timeout", &self.gateway_timeout)
            .finish()
    }
}

impl Default for PinataConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            secret_key: None,
            api_base: DEFAULT_PINATA_API.to_string(),
            gateways: DEFAULT_IPFS_GATEWAYS.iter().map(|g| g.to_string()).collect(),
            gateway_timeout: GATEWAY_REQUEST_TIMEOUT,
        }
    }
}

impl PinataConfig {
    pub fn has_credentials(&self) -> bool {
        self.credentials().is_some()
    }

    /// Split `budget` evenly across the gateways, so trying all of them fits
    /// inside one caller timeout.
    pub fn with_fetch_budget(mut self, budget: Duration) -> Self {
        let gateways = u32::try_from(self.gateways.len().max(1)).unwrap_or(u32::MAX);
        self.gateway_timeout = (budget / gateways).max(MIN_GATEWAY_REQUEST_TIMEOUT);
        self
    }

    fn credentials(&self) -> Option<(&str, &str)> {
        match (self.api_key.as_deref(), self.secret_key.as_deref()) {
            (Some(k), Some(s)) if !k.is_empty() && !s.is_empty() => Some((k, s)),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct PinResponse {
    #[serde(rename = "IpfsHash")]
    ipfs_hash: String,
}

#[derive(Debug, Deserialize)]
struct PinList {
    #[serde(default)]
    rows: Vec<PinRow>,
}

#[derive(Debug, Deserialize)]
struct PinRow {
    ipfs_pin_hash: String,
    #[serde(default)]
    date_pinned: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PinataStore {
    config: PinataConfig,
    client: Client,
}

impl PinataStore {
    pub fn new(config: PinataConfig) -> TierResult<Self> {
        Ok(Self {
            config,
            client: http_client()?,
        })
    }

    pub fn config(&self) -> &PinataConfig {
        &self.config
    }

    fn auth(&self, request: reqwest::RequestBuilder) -> TierResult<reqwest::RequestBuilder> {
        let (key, secret) = self
            .config
            .credentials()
            .ok_or_else(|| TierError::Unavailable("pinning service credentials not configured".into()))?;
        Ok(request
            .header("pinata_api_key", key)
            .header("pinata_secret_api_key", secret))
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/{}", self.config.api_base.trim_end_matches('/'), path)
    }

    fn gateway_urls(&self, cid: &ContentId) -> Vec<String> {
        self.config
            .gateways
            .iter()
            .map(|g| format!("{}/ipfs/{}", g.trim_end_matches('/'), cid))
            .collect()
    }
}

#[async_trait]
impl ContentAddressedStore for PinataStore {
    fn name(&self) -> &'static str {
        "pinata"
    }

    async fn put(&self, bytes: &[u8]) -> TierResult<ContentId> {
        let metadata = json!({
            "name": format!("deedchain-snapshot-{}", Utc::now().format("%Y%m%d_%H%M%S")),
            "keyvalues": { "type": BLOB_TYPE_TAG, "project": BLOB_PROJECT_TAG },
        });
        let file = Part::bytes(bytes.to_vec())
            .file_name(UPLOAD_FILE_NAME)
            .mime_str("application/octet-stream")?;
        let form = Form::new()
            .part("file", file)
            .text("pinataMetadata", metadata.to_string());

        let request = self.auth(self.client.post(self.api_url("pinning/pinFileToIPFS")))?;
        let response = check_status(request.multipart(form).send().await?).await?;
        let pinned: PinResponse = response.json().await?;

        let cid = ContentId::parse(&pinned.ipfs_hash).ok_or_else(|| {
            TierError::Serialization(format!("service returned bad CID {:?}", pinned.ipfs_hash))
        })?;
        debug!(%cid, bytes = bytes.len(), "snapshot pinned");
        Ok(cid)
    }

    async fn get(&self, cid: &ContentId) -> TierResult<Option<Vec<u8>>> {
        let mut last_error = None;
        for url in self.gateway_urls(cid) {
            let attempt = async {
                let request = self.client.get(&url).timeout(self.config.gateway_timeout);
                let response = check_status(request.send().await?).await?;
                Ok::<_, TierError>(response.bytes().await?.to_vec())
            };
            match attempt.await {
                Ok(bytes) => return Ok(Some(bytes)),
                Err(e) => {
                    debug!(%url, error = %e, "gateway fetch failed");
                    last_error = Some(e);
                }
            }
        }
        warn!(%cid, "no gateway served the snapshot");
        Err(last_error.unwrap_or_else(|| TierError::Unavailable("no IPFS gateways configured".into())))
    }

    async fn tag(&self, cid: &ContentId, metadata: &PointerMetadata) -> TierResult<()> {
        let body = json!({
            "ipfsPinHash": cid.as_str(),
            "name": format!("deedchain-snapshot-{}", metadata.recorded_at.format("%Y%m%d_%H%M%S")),
            "keyvalues": {
                "latest": "true",
                "timestamp": metadata.recorded_at.to_rfc3339(),
                "blocks": metadata.blocks.to_string(),
                "type": BLOB_TYPE_TAG,
                "project": BLOB_PROJECT_TAG,
            },
        });
        let request = self.auth(self.client.put(self.api_url("pinning/hashMetadata")))?;
        check_status(request.json(&body).send().await?).await?;
        Ok(())
    }

    async fn latest_tagged(&self) -> TierResult<Option<ContentId>> {
        let filter = json!({
            "type": { "value": BLOB_TYPE_TAG, "op": "eq" },
            "project": { "value": BLOB_PROJECT_TAG, "op": "eq" },
            "latest": { "value": "true", "op": "eq" },
        });
        let request = self.auth(self.client.get(self.api_url("data/pinList")))?;
        let response = check_status(
            request
                .query(&[
                    ("status", "pinned".to_string()),
                    ("metadata[keyvalues]", filter.to_string()),
                    ("pageLimit", "10".to_string()),
                ])
                .send()
                .await?,
        )
        .await?;
        let list: PinList = response.json().await?;
        Ok(newest_pin(list.rows))
    }
}

/// Pick the most recently pinned row. RFC 3339 timestamps sort lexically.
fn newest_pin(mut rows: Vec<PinRow>) -> Option<ContentId> {
    rows.sort_by(|a, b| b.date_pinned.cmp(&a.date_pinned));
    rows.into_iter()
        .find_map(|row| ContentId::parse(&row.ipfs_pin_hash))
}
