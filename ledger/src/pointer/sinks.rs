//! The four pointer sinks.
//!
//! | Sink                 | Persisted form                                      |
//! |----------------------|-----------------------------------------------------|
//! | [`ControlPlaneSink`] | env var on the hosting service (`DEEDCHAIN_LATEST_CID`) |
//! | [`BlobTagSink`]      | `latest` metadata on the uploaded blob              |
//! | [`NoteStoreSink`]    | JSON file in a gist                                 |
//! | [`LocalFileSink`]    | `latest_cid.txt` plus `pointer_history.json`        |

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use super::{PointerSink, SinkKind};
use crate::config::{
    CONTROL_PLANE_POINTER_VAR, LOCAL_POINTER_FILE, NOTE_STORE_FILE_NAME, POINTER_HISTORY_FILE,
    POINTER_HISTORY_LIMIT,
};
use crate::tiers::{
    check_status, http_client, ContentAddressedStore, ContentId, PointerMetadata, TierError,
    TierResult,
};

pub const DEFAULT_CONTROL_PLANE_API: &str = "https://api.render.com";
pub const DEFAULT_NOTE_STORE_API: &str = "https://api.github.com";

// ---------------------------------------------------------------------------
// ControlPlaneSink
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct ControlPlaneConfig {
    /// Value of the pointer variable as injected at process start.
    pub injected: Option<String>,
    pub api_key: Option<String>,
    pub service_id: Option<String>,
    pub api_base: Option<String>,
}

impl std::fmt::Debug for ControlPlaneConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlPlaneConfig")
            .field("injected", &self.injected)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("service_id", &self.service_id)
            .finish()
    }
}

impl ControlPlaneConfig {
    /// Capture the pointer variable from the current process environment.
    pub fn capture_injected(mut self) -> Self {
        self.injected = std::env::var(CONTROL_PLANE_POINTER_VAR)
            .ok()
            .filter(|v| !v.trim().is_empty());
        self
    }
}

/// The hosting platform's environment variable for the service.
///
/// The platform injects updated variables on the next restart, so the value
/// captured at start is what a restoring process reads first. Updating goes
/// through the platform API.
pub struct ControlPlaneSink {
    config: ControlPlaneConfig,
    client: Client,
    latest: Mutex<Option<String>>,
}

impl ControlPlaneSink {
    pub fn new(config: ControlPlaneConfig) -> TierResult<Self> {
        let latest = Mutex::new(config.injected.clone());
        Ok(Self {
            config,
            client: http_client()?,
            latest,
        })
    }

    fn api(&self) -> Option<(&str, &str)> {
        match (self.config.api_key.as_deref(), self.config.service_id.as_deref()) {
            (Some(k), Some(s)) if !k.is_empty() && !s.is_empty() => Some((k, s)),
            _ => None,
        }
    }

    fn var_url(&self, service_id: &str) -> String {
        let base = self
            .config
            .api_base
            .as_deref()
            .unwrap_or(DEFAULT_CONTROL_PLANE_API)
            .trim_end_matches('/');
        format!("{base}/v1/services/{service_id}/env-vars/{CONTROL_PLANE_POINTER_VAR}")
    }
}

#[async_trait]
impl PointerSink for ControlPlaneSink {
    fn kind(&self) -> SinkKind {
        SinkKind::ControlPlane
    }

    fn is_configured(&self) -> bool {
        self.api().is_some() || self.latest.lock().is_some()
    }

    async fn record(&self, cid: &ContentId, _metadata: &PointerMetadata) -> TierResult<()> {
        let (api_key, service_id) = self
            .api()
            .ok_or_else(|| TierError::Unavailable("control-plane API credentials not configured".into()))?;
        let request = self
            .client
            .put(self.var_url(service_id))
            .bearer_auth(api_key)
            .json(&json!({ "value": cid.as_str() }));
        check_status(request.send().await?).await?;
        *self.latest.lock() = Some(cid.to_string());
        Ok(())
    }

    async fn read(&self) -> TierResult<Option<String>> {
        let known = self.latest.lock().clone();
        if known.is_some() {
            return Ok(known);
        }
        let Some((api_key, service_id)) = self.api() else {
            return Ok(None);
        };
        let response = self
            .client
            .get(self.var_url(service_id))
            .bearer_auth(api_key)
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body: Value = check_status(response).await?.json().await?;
        Ok(body
            .get("value")
            .or_else(|| body.pointer("/envVar/value"))
            .and_then(Value::as_str)
            .map(str::to_string))
    }
}

// ---------------------------------------------------------------------------
// BlobTagSink
// ---------------------------------------------------------------------------

/// Reads and writes `latest` tags on the content store itself.
pub struct BlobTagSink {
    store: Arc<dyn ContentAddressedStore>,
}

impl BlobTagSink {
    pub fn new(store: Arc<dyn ContentAddressedStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl PointerSink for BlobTagSink {
    fn kind(&self) -> SinkKind {
        SinkKind::BlobTag
    }

    async fn record(&self, cid: &ContentId, metadata: &PointerMetadata) -> TierResult<()> {
        self.store.tag(cid, metadata).await
    }

    async fn read(&self) -> TierResult<Option<String>> {
        Ok(self.store.latest_tagged().await?.map(String::from))
    }
}

// ---------------------------------------------------------------------------
// NoteStoreSink
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct NoteStoreConfig {
    pub token: Option<String>,
    pub gist_id: Option<String>,
    pub api_base: Option<String>,
}

impl std::fmt::Debug for NoteStoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NoteStoreConfig")
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("gist_id", &self.gist_id)
            .finish()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Note {
    cid: String,
    metadata: PointerMetadata,
    updated_at: DateTime<Utc>,
}

/// A JSON document in a gist.
pub struct NoteStoreSink {
    config: NoteStoreConfig,
    client: Client,
}

impl NoteStoreSink {
    pub fn new(config: NoteStoreConfig) -> TierResult<Self> {
        Ok(Self {
            config,
            client: http_client()?,
        })
    }

    fn target(&self) -> TierResult<(String, &str)> {
        match (self.config.token.as_deref(), self.config.gist_id.as_deref()) {
            (Some(token), Some(id)) if !token.is_empty() && !id.is_empty() => {
                let base = self
                    .config
                    .api_base
                    .as_deref()
                    .unwrap_or(DEFAULT_NOTE_STORE_API)
                    .trim_end_matches('/');
                Ok((format!("{base}/gists/{id}"), token))
            }
            _ => Err(TierError::Unavailable("note store token or id not configured".into())),
        }
    }
}

/// Pull the identifier out of a gist API response.
fn cid_from_gist(body: &Value) -> Option<String> {
    let content = body
        .get("files")?
        .get(NOTE_STORE_FILE_NAME)?
        .get("content")?
        .as_str()?;
    let note: Note = serde_json::from_str(content).ok()?;
    Some(note.cid)
}

#[async_trait]
impl PointerSink for NoteStoreSink {
    fn kind(&self) -> SinkKind {
        SinkKind::NoteStore
    }

    fn is_configured(&self) -> bool {
        self.target().is_ok()
    }

    async fn record(&self, cid: &ContentId, metadata: &PointerMetadata) -> TierResult<()> {
        let (url, token) = self.target()?;
        let note = Note {
            cid: cid.to_string(),
            metadata: metadata.clone(),
            updated_at: Utc::now(),
        };
        let content =
            serde_json::to_string_pretty(&note).map_err(|e| TierError::Serialization(e.to_string()))?;
        let body = json!({ "files": { NOTE_STORE_FILE_NAME: { "content": content } } });
        let request = self
            .client
            .patch(url)
            .header("Authorization", format!("token {token}"))
            .header("Accept", "application/vnd.github.v3+json")
            .json(&body);
        check_status(request.send().await?).await?;
        Ok(())
    }

    async fn read(&self) -> TierResult<Option<String>> {
        let (url, token) = self.target()?;
        let response = self
            .client
            .get(url)
            .header("Authorization", format!("token {token}"))
            .header("Accept", "application/vnd.github.v3+json")
            .send()
            .await?;
        let body: Value = check_status(response).await?.json().await?;
        Ok(cid_from_gist(&body))
    }
}

// ---------------------------------------------------------------------------
// LocalFileSink
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointerHistoryEntry {
    pub cid: String,
    pub recorded_at: DateTime<Utc>,
    pub blocks: usize,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PointerHistory {
    latest_cid: Option<String>,
    last_updated: Option<DateTime<Utc>>,
    #[serde(default)]
    history: Vec<PointerHistoryEntry>,
}

/// Bare identifier in a text file, plus a short JSON history next to it.
///
/// Reads fall back to the history's `latest_cid` when the text file is
/// missing or empty.
#[derive(Debug, Clone)]
pub struct LocalFileSink {
    pointer: PathBuf,
    history: PathBuf,
}

impl LocalFileSink {
    pub fn in_dir(data_dir: impl AsRef<Path>) -> Self {
        let dir = data_dir.as_ref();
        Self {
            pointer: dir.join(LOCAL_POINTER_FILE),
            history: dir.join(POINTER_HISTORY_FILE),
        }
    }

    pub fn pointer_path(&self) -> &Path {
        &self.pointer
    }

    /// Recorded identifiers, oldest first.
    pub async fn history(&self) -> TierResult<Vec<PointerHistoryEntry>> {
        Ok(self.load_history().await?.history)
    }

    /// Delete both files.
    pub async fn clear(&self) -> TierResult<()> {
        for path in [&self.pointer, &self.history] {
            match tokio::fs::remove_file(path).await {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
                _ => {}
            }
        }
        Ok(())
    }

    async fn load_history(&self) -> TierResult<PointerHistory> {
        match tokio::fs::read(&self.history).await {
            // An unreadable history is replaced, never fatal.
            Ok(bytes) => Ok(serde_json::from_slice(&bytes).unwrap_or_default()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(PointerHistory::default()),
            Err(e) => Err(e.into()),
        }
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> TierResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(".tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[async_trait]
impl PointerSink for LocalFileSink {
    fn kind(&self) -> SinkKind {
        SinkKind::LocalFile
    }

    async fn record(&self, cid: &ContentId, metadata: &PointerMetadata) -> TierResult<()> {
        write_atomic(&self.pointer, cid.as_str().as_bytes()).await?;

        let mut history = self.load_history().await?;
        history.history.push(PointerHistoryEntry {
            cid: cid.to_string(),
            recorded_at: metadata.recorded_at,
            blocks: metadata.blocks,
        });
        let excess = history.history.len().saturating_sub(POINTER_HISTORY_LIMIT);
        history.history = history.history.split_off(excess);
        history.latest_cid = Some(cid.to_string());
        history.last_updated = Some(Utc::now());

        let json = serde_json::to_vec_pretty(&history)
            .map_err(|e| TierError::Serialization(e.to_string()))?;
        write_atomic(&self.history, &json).await?;
        debug!(path = %self.pointer.display(), %cid, "local pointer written");
        Ok(())
    }

    async fn read(&self) -> TierResult<Option<String>> {
        match tokio::fs::read_to_string(&self.pointer).await {
            Ok(s) if !s.trim().is_empty() => return Ok(Some(s.trim().to_string())),
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(self.load_history().await?.latest_cid)
    }
}
