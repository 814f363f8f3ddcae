//! # Persistence Tiers
//!
//! Three independent places a sealed snapshot can live:
//!
//! | Tier                                      | Handle            | Knows "latest"? |
//! |-------------------------------------------|-------------------|-----------------|
//! | [`LocalStore`](local::LocalStore)         | file path         | yes (one file)  |
//! | [`RelationalBackupStore`](relational::RelationalBackupStore) | record id | yes (newest row) |
//! | [`ContentTier`](content::ContentTier)     | content id (CID)  | no              |
//!
//! Every tier stores the same opaque bytes produced by the snapshot codec.
//! None of them looks inside.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::HTTP_CONNECT_TIMEOUT;

pub mod content;
pub mod local;
pub mod pinata;
pub mod relational;

pub use content::{
    ContentAddressedStore, ContentId, ContentTier, DirectoryContentStore, MemoryContentStore,
    PointerMetadata,
};
pub use local::LocalStore;
pub use pinata::{PinataConfig, PinataStore};
pub use relational::{BackupRecord, BackupSummary, RelationalBackupStore};

// ---------------------------------------------------------------------------
// Handles and Kinds
// ---------------------------------------------------------------------------

/// Which tier a handle or outcome refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierKind {
    Local,
    Relational,
    ContentAddressed,
}

impl TierKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Relational => "relational",
            Self::ContentAddressed => "content_addressed",
        }
    }
}

impl fmt::Display for TierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a tier put a snapshot, or which one to fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum TierHandle {
    Path(PathBuf),
    Record(u64),
    MostRecent,
    Content(ContentId),
}

impl fmt::Display for TierHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path(p) => write!(f, "{}", p.display()),
            Self::Record(id) => write!(f, "record #{id}"),
            Self::MostRecent => f.write_str("most recent"),
            Self::Content(cid) => write!(f, "{cid}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A tier could not complete a call. Always recoverable: the caller skips
/// the tier and moves on.
#[derive(Debug, Error)]
pub enum TierError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("remote returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("tier unavailable: {0}")]
    Unavailable(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("content does not match its identifier {0}")]
    Integrity(String),

    #[error("{tier} tier cannot resolve handle {handle}")]
    UnsupportedHandle { tier: TierKind, handle: TierHandle },

    #[error("serialization error: {0}")]
    Serialization(String),
}

pub type TierResult<T> = Result<T, TierError>;

// ---------------------------------------------------------------------------
// The Tier Contract
// ---------------------------------------------------------------------------

/// Common contract over every persistence backend.
#[async_trait]
pub trait SnapshotTier: Send + Sync {
    fn kind(&self) -> TierKind;

    /// Store `bytes` and return where they went.
    async fn put(&self, bytes: &[u8]) -> TierResult<TierHandle>;

    /// Fetch by handle. `Ok(None)` means the tier is reachable but holds
    /// nothing under that handle.
    async fn get(&self, handle: &TierHandle) -> TierResult<Option<Vec<u8>>>;

    /// The newest snapshot this tier holds, for tiers that know.
    async fn latest(&self) -> TierResult<Option<(TierHandle, Vec<u8>)>> {
        Ok(None)
    }
}

/// Shared HTTP client for remote tiers and pointer sinks.
///
/// No client-wide request timeout is set here: callers bound each operation
/// with `tokio::time::timeout` so a stall is reported per tier, and requests
/// that need a tighter bound (gateway reads) set one per request.
pub fn http_client() -> TierResult<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(HTTP_CONNECT_TIMEOUT)
        .user_agent(concat!("deedchain/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(TierError::from)
}

/// Turn a non-2xx response into [`TierError::Status`].
pub(crate) async fn check_status(response: reqwest::Response) -> TierResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(TierError::Status {
        status: status.as_u16(),
        body: body.chars().take(200).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_display() {
        assert_eq!(TierHandle::Record(7).to_string(), "record #7");
        assert_eq!(TierHandle::MostRecent.to_string(), "most recent");
        let cid = ContentId::parse("sha256-abc").unwrap();
        assert_eq!(TierHandle::Content(cid).to_string(), "sha256-abc");
    }

    #[test]
    fn kind_names_are_stable() {
        assert_eq!(TierKind::ContentAddressed.to_string(), "content_addressed");
        assert_eq!(
            serde_json::to_string(&TierKind::Relational).unwrap(),
            "\"relational\""
        );
    }

    #[test]
    fn http_client_builds() {
        assert!(http_client().is_ok());
    }
}
