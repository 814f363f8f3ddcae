//! # Content-Addressed Store
//!
//! Stores blobs under an identifier derived from their bytes. Identifiers are
//! immutable and unrelated across uploads, so this tier cannot say which blob
//! is newest. That question belongs to the pointer registry.
//!
//! Two backends live here, [`DirectoryContentStore`] for a filesystem (or a
//! mounted volume) and [`MemoryContentStore`] for tests. The IPFS pinning
//! backend is in [`super::pinata`].

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::{SnapshotTier, TierError, TierHandle, TierKind, TierResult};
use crate::crypto::sha256_hex;

const LOCAL_CID_PREFIX: &str = "sha256-";
const TAG_SUFFIX: &str = ".tag.json";

// ---------------------------------------------------------------------------
// ContentId
// ---------------------------------------------------------------------------

/// A content identifier: IPFS CIDv0/v1, or `sha256-<hex>` for local stores.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentId(String);

impl ContentId {
    /// Accepts a trimmed, non-empty token of ASCII alphanumerics, `-` and
    /// `_`. Anything else (whitespace, path separators, URLs) is rejected.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        let ok = !s.is_empty()
            && s.len() <= 128
            && s.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
        ok.then(|| Self(s.to_string()))
    }

    /// The local identifier for `bytes`.
    pub fn for_bytes(bytes: &[u8]) -> Self {
        Self(format!("{LOCAL_CID_PREFIX}{}", sha256_hex(bytes)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this is a local `sha256-` identifier whose digest can be
    /// checked against fetched bytes.
    fn local_digest(&self) -> Option<&str> {
        self.0.strip_prefix(LOCAL_CID_PREFIX)
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ContentId {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s).ok_or_else(|| format!("invalid content identifier {s:?}"))
    }
}

impl From<ContentId> for String {
    fn from(cid: ContentId) -> Self {
        cid.0
    }
}

/// What gets attached to a blob (and every pointer sink) alongside its id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointerMetadata {
    pub blocks: usize,
    pub latest_hash: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// The Store Contract
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ContentAddressedStore: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    async fn put(&self, bytes: &[u8]) -> TierResult<ContentId>;

    async fn get(&self, cid: &ContentId) -> TierResult<Option<Vec<u8>>>;

    /// Attach `latest` metadata to an uploaded blob.
    async fn tag(&self, cid: &ContentId, metadata: &PointerMetadata) -> TierResult<()>;

    /// The most recently tagged blob, if the backend can search tags.
    async fn latest_tagged(&self) -> TierResult<Option<ContentId>>;
}

/// Refuse bytes that don't hash to their local identifier.
fn verify_local(cid: &ContentId, bytes: Vec<u8>) -> TierResult<Vec<u8>> {
    match cid.local_digest() {
        Some(digest) if digest != sha256_hex(&bytes) => Err(TierError::Integrity(cid.to_string())),
        _ => Ok(bytes),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TagFile {
    cid: ContentId,
    latest: bool,
    metadata: PointerMetadata,
}

// ---------------------------------------------------------------------------
// DirectoryContentStore
// ---------------------------------------------------------------------------

/// Blobs as files named by their identifier.
///
/// ```text
///   <dir>/sha256-<hex>            blob
///   <dir>/sha256-<hex>.tag.json   tag
/// ```
#[derive(Debug, Clone)]
pub struct DirectoryContentStore {
    dir: PathBuf,
}

impl DirectoryContentStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn blob_path(&self, cid: &ContentId) -> PathBuf {
        self.dir.join(cid.as_str())
    }

    fn tag_path(&self, cid: &ContentId) -> PathBuf {
        self.dir.join(format!("{cid}{TAG_SUFFIX}"))
    }

    /// Remove every tag file. Blobs stay.
    pub async fn clear_tags(&self) -> TierResult<()> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_name().to_string_lossy().ends_with(TAG_SUFFIX) {
                tokio::fs::remove_file(entry.path()).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ContentAddressedStore for DirectoryContentStore {
    fn name(&self) -> &'static str {
        "directory"
    }

    async fn put(&self, bytes: &[u8]) -> TierResult<ContentId> {
        let cid = ContentId::for_bytes(bytes);
        let path = self.blob_path(&cid);
        if tokio::fs::try_exists(&path).await? {
            return Ok(cid);
        }
        tokio::fs::create_dir_all(&self.dir).await?;
        let tmp = self.dir.join(format!(".{cid}.tmp"));
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(cid)
    }

    async fn get(&self, cid: &ContentId) -> TierResult<Option<Vec<u8>>> {
        match tokio::fs::read(self.blob_path(cid)).await {
            Ok(bytes) => verify_local(cid, bytes).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn tag(&self, cid: &ContentId, metadata: &PointerMetadata) -> TierResult<()> {
        let tag = TagFile {
            cid: cid.clone(),
            latest: true,
            metadata: metadata.clone(),
        };
        let json =
            serde_json::to_vec_pretty(&tag).map_err(|e| TierError::Serialization(e.to_string()))?;
        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(self.tag_path(cid), json).await?;
        Ok(())
    }

    async fn latest_tagged(&self) -> TierResult<Option<ContentId>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut newest: Option<TagFile> = None;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_name().to_string_lossy().ends_with(TAG_SUFFIX) {
                continue;
            }
            let bytes = tokio::fs::read(entry.path()).await?;
            let Ok(tag) = serde_json::from_slice::<TagFile>(&bytes) else {
                continue;
            };
            if tag.latest
                && newest
                    .as_ref()
                    .map_or(true, |n| tag.metadata.recorded_at > n.metadata.recorded_at)
            {
                newest = Some(tag);
            }
        }
        Ok(newest.map(|t| t.cid))
    }
}

// ---------------------------------------------------------------------------
// MemoryContentStore
// ---------------------------------------------------------------------------

/// In-process store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryContentStore {
    blobs: Mutex<HashMap<ContentId, Vec<u8>>>,
    tags: Mutex<Vec<(ContentId, PointerMetadata)>>,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.lock().is_empty()
    }

    /// Overwrite a stored blob in place, for corruption tests.
    pub fn corrupt(&self, cid: &ContentId, bytes: Vec<u8>) {
        self.blobs.lock().insert(cid.clone(), bytes);
    }

    pub fn clear_tags(&self) {
        self.tags.lock().clear();
    }
}

#[async_trait]
impl ContentAddressedStore for MemoryContentStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn put(&self, bytes: &[u8]) -> TierResult<ContentId> {
        let cid = ContentId::for_bytes(bytes);
        self.blobs.lock().insert(cid.clone(), bytes.to_vec());
        Ok(cid)
    }

    async fn get(&self, cid: &ContentId) -> TierResult<Option<Vec<u8>>> {
        let bytes = self.blobs.lock().get(cid).cloned();
        bytes.map(|b| verify_local(cid, b)).transpose()
    }

    async fn tag(&self, cid: &ContentId, metadata: &PointerMetadata) -> TierResult<()> {
        self.tags.lock().push((cid.clone(), metadata.clone()));
        Ok(())
    }

    async fn latest_tagged(&self) -> TierResult<Option<ContentId>> {
        Ok(self.tags.lock().last().map(|(cid, _)| cid.clone()))
    }
}

// ---------------------------------------------------------------------------
// ContentTier
// ---------------------------------------------------------------------------

/// Adapts any [`ContentAddressedStore`] to the common tier contract.
#[derive(Clone)]
pub struct ContentTier {
    store: Arc<dyn ContentAddressedStore>,
}

impl ContentTier {
    pub fn new(store: Arc<dyn ContentAddressedStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn ContentAddressedStore> {
        &self.store
    }
}

impl fmt::Debug for ContentTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentTier")
            .field("backend", &self.store.name())
            .finish()
    }
}

#[async_trait]
impl SnapshotTier for ContentTier {
    fn kind(&self) -> TierKind {
        TierKind::ContentAddressed
    }

    async fn put(&self, bytes: &[u8]) -> TierResult<TierHandle> {
        self.store.put(bytes).await.map(TierHandle::Content)
    }

    async fn get(&self, handle: &TierHandle) -> TierResult<Option<Vec<u8>>> {
        match handle {
            TierHandle::Content(cid) => self.store.get(cid).await,
            other => Err(TierError::UnsupportedHandle {
                tier: TierKind::ContentAddressed,
                handle: other.clone(),
            }),
        }
    }
}
