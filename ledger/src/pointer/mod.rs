//! # Pointer Registry
//!
//! The content-addressed tier can't answer "which blob is newest", so the
//! newest identifier is written redundantly to several independent sinks and
//! read back in a fixed priority order:
//!
//! ```text
//!   resolve():  control plane ─► blob tag ─► note store ─► local file
//!                    │              │            │             │
//!                    └── value parses AND verify(cid) succeeds? ──► accept
//!                                   otherwise: miss, try the next sink
//! ```
//!
//! No sink is authoritative. A sink holding a stale or garbage value costs
//! one failed verification, nothing more. `record` writes every sink
//! concurrently, and one failing sink never stops the others.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::tiers::{ContentId, PointerMetadata, TierResult};

pub mod sinks;

pub use sinks::{
    BlobTagSink, ControlPlaneConfig, ControlPlaneSink, LocalFileSink, NoteStoreConfig, NoteStoreSink,
    PointerHistoryEntry,
};

/// Sink identities, declared in resolution priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    ControlPlane,
    BlobTag,
    NoteStore,
    LocalFile,
}

impl fmt::Display for SinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ControlPlane => "control_plane",
            Self::BlobTag => "blob_tag",
            Self::NoteStore => "note_store",
            Self::LocalFile => "local_file",
        })
    }
}

/// One place the latest identifier is kept.
#[async_trait]
pub trait PointerSink: Send + Sync {
    fn kind(&self) -> SinkKind;

    /// Whether the sink has what it needs (credentials, ids) to be used.
    fn is_configured(&self) -> bool {
        true
    }

    async fn record(&self, cid: &ContentId, metadata: &PointerMetadata) -> TierResult<()>;

    /// The raw stored value, unparsed.
    async fn read(&self) -> TierResult<Option<String>>;
}

/// How one sink fared during `record`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum SinkStatus {
    Recorded,
    Skipped,
    Failed(String),
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SinkOutcome {
    pub sink: SinkKind,
    pub status: SinkStatus,
}

/// A sink that didn't yield an acceptable identifier during `resolve`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SinkMiss {
    pub sink: SinkKind,
    pub reason: String,
}

#[derive(Debug)]
pub struct Resolved<T> {
    pub sink: SinkKind,
    pub cid: ContentId,
    pub value: T,
}

/// Result of `resolve`: the accepted identifier (if any) plus every miss on
/// the way there.
#[derive(Debug)]
pub struct Resolution<T> {
    pub found: Option<Resolved<T>>,
    pub misses: Vec<SinkMiss>,
}

pub struct PointerRegistry {
    sinks: Vec<Arc<dyn PointerSink>>,
    timeout: Duration,
}

impl fmt::Debug for PointerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PointerRegistry")
            .field("sinks", &self.sinks.iter().map(|s| s.kind()).collect::<Vec<_>>())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl PointerRegistry {
    /// Sinks are reordered by priority regardless of the order given.
    pub fn new(mut sinks: Vec<Arc<dyn PointerSink>>, timeout: Duration) -> Self {
        sinks.sort_by_key(|s| s.kind());
        Self { sinks, timeout }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new(), Duration::from_secs(1))
    }

    pub fn sink_kinds(&self) -> Vec<SinkKind> {
        self.sinks.iter().map(|s| s.kind()).collect()
    }

    /// Write `cid` to every configured sink, concurrently, each bounded by
    /// the registry timeout.
    pub async fn record(&self, cid: &ContentId, metadata: &PointerMetadata) -> Vec<SinkOutcome> {
        let writes = self.sinks.iter().map(|sink| async move {
            let status = if !sink.is_configured() {
                SinkStatus::Skipped
            } else {
                match tokio::time::timeout(self.timeout, sink.record(cid, metadata)).await {
                    Ok(Ok(())) => SinkStatus::Recorded,
                    Ok(Err(e)) => SinkStatus::Failed(e.to_string()),
                    Err(_) => SinkStatus::TimedOut,
                }
            };
            SinkOutcome {
                sink: sink.kind(),
                status,
            }
        });

        let outcomes = join_all(writes).await;
        for outcome in &outcomes {
            match &outcome.status {
                SinkStatus::Recorded => debug!(sink = %outcome.sink, %cid, "pointer recorded"),
                SinkStatus::Skipped => debug!(sink = %outcome.sink, "pointer sink not configured"),
                SinkStatus::Failed(e) => warn!(sink = %outcome.sink, error = %e, "pointer record failed"),
                SinkStatus::TimedOut => warn!(sink = %outcome.sink, timeout = ?self.timeout, "pointer record timed out"),
            }
        }
        outcomes
    }

    /// Try sinks in priority order; accept the first value that parses and
    /// passes `verify`.
    ///
    /// A cid that already failed verification is not fetched again when a
    /// lower-priority sink repeats it.
    pub async fn resolve<T, F, Fut>(&self, mut verify: F) -> Resolution<T>
    where
        F: FnMut(ContentId) -> Fut,
        Fut: Future<Output = Result<T, String>>,
    {
        let mut misses = Vec::new();
        let mut rejected: Vec<ContentId> = Vec::new();

        for sink in &self.sinks {
            let kind = sink.kind();
            let mut miss = |reason: String| {
                debug!(sink = %kind, %reason, "pointer sink miss");
                misses.push(SinkMiss { sink: kind, reason });
            };

            if !sink.is_configured() {
                miss("not configured".into());
                continue;
            }

            let raw = match tokio::time::timeout(self.timeout, sink.read()).await {
                Ok(Ok(Some(raw))) => raw,
                Ok(Ok(None)) => {
                    miss("empty".into());
                    continue;
                }
                Ok(Err(e)) => {
                    miss(format!("read failed: {e}"));
                    continue;
                }
                Err(_) => {
                    miss(format!("read timed out after {:?}", self.timeout));
                    continue;
                }
            };

            let Some(cid) = ContentId::parse(&raw) else {
                miss(format!("unparseable value {:?}", truncate(&raw)));
                continue;
            };

            if rejected.contains(&cid) {
                miss(format!("{cid} already rejected"));
                continue;
            }

            match verify(cid.clone()).await {
                Ok(value) => {
                    info!(sink = %kind, %cid, "pointer resolved");
                    return Resolution {
                        found: Some(Resolved {
                            sink: kind,
                            cid,
                            value,
                        }),
                        misses,
                    };
                }
                Err(reason) => {
                    miss(format!("{cid} failed verification: {reason}"));
                    rejected.push(cid);
                }
            }
        }

        Resolution {
            found: None,
            misses,
        }
    }
}

fn truncate(s: &str) -> String {
    s.chars().take(64).collect()
}
