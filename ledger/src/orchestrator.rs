//! # Recovery/Backup Orchestrator
//!
//! Owns the one [`HashChain`] of the process and decides where it comes from
//! and where it goes.
//!
//! ## Lifecycle
//!
//! ```text
//!   Uninitialized ──restore()──► Restoring ──► Active ──shutdown()──► ShuttingDown ──► Terminated
//!                                    │                                      │
//!                   content-addressed (via pointer)              drain replication (bounded)
//!                   ► local ► relational ► genesis               final fan-out, each tier bounded
//! ```
//!
//! ## Write Path
//!
//! ```text
//!   append(payload)
//!     ├── [write lock] mine ► encode ► LocalStore::write   (failure rolls the block back,
//!     │                                                      block_in_place on multi-thread)
//!     └── [no lock]    spawn: relational.put, content.put ► pointer.record
//!                      (each tier and the pointer skip snapshots older than their newest)
//! ```
//!
//! The chain and the lifecycle state share one `RwLock`, so a reader never
//! sees a half-appended block and never sees an Active state without a chain.
//! Remote tiers are only ever touched outside that lock.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::chain::{Block, ChainInfo, CurrentState, Diagnostic, HashChain};
use crate::codec::SnapshotCodec;
use crate::config::{
    DEFAULT_DIFFICULTY, PRE_RESTORE_SNAPSHOT_PREFIX, REPLICATION_TIER_TIMEOUT,
    SHUTDOWN_TIER_TIMEOUT,
};
use crate::error::{LedgerError, LedgerResult};
use crate::pointer::{PointerRegistry, SinkKind, SinkOutcome};
use crate::tiers::{ContentId, LocalStore, PointerMetadata, SnapshotTier, TierHandle, TierKind};

// ---------------------------------------------------------------------------
// States and Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerState {
    Uninitialized,
    Restoring,
    Active,
    ShuttingDown,
    Terminated,
}

impl fmt::Display for LedgerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Uninitialized => "uninitialized",
            Self::Restoring => "restoring",
            Self::Active => "active",
            Self::ShuttingDown => "shutting down",
            Self::Terminated => "terminated",
        })
    }
}

/// Where the active chain came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum RestoreSource {
    ContentAddressed { cid: ContentId, sink: SinkKind },
    Local,
    Relational { id: u64 },
    Genesis,
}

impl RestoreSource {
    pub fn label(&self) -> &'static str {
        match self {
            Self::ContentAddressed { .. } => "content_addressed",
            Self::Local => "local",
            Self::Relational { .. } => "relational",
            Self::Genesis => "genesis",
        }
    }
}

/// A restoration source that was tried and passed over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestoreAttempt {
    pub source: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreOutcome {
    pub source: RestoreSource,
    pub blocks: usize,
    pub attempts: Vec<RestoreAttempt>,
}

/// Result of one write to one tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TierStatus {
    Stored { handle: TierHandle },
    Failed { error: String },
    TimedOut,
    /// Skipped: the tier already stored a snapshot of `newest` blocks.
    Superseded { newest: usize },
}

#[derive(Debug, Clone, Serialize)]
pub struct TierOutcome {
    pub tier: TierKind,
    #[serde(flatten)]
    pub status: TierStatus,
}

impl TierOutcome {
    pub fn is_stored(&self) -> bool {
        matches!(self.status, TierStatus::Stored { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ShutdownReport {
    /// Replication tasks still running at the end of the grace period.
    pub abandoned_replications: usize,
    pub tiers: Vec<TierOutcome>,
    pub pointer: Vec<SinkOutcome>,
}

/// Running health of one tier, updated by every replication attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TierHealth {
    pub tier: TierKind,
    pub degraded: bool,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub last_error: Option<String>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
}

impl TierHealth {
    fn new(tier: TierKind) -> Self {
        Self {
            tier,
            degraded: false,
            consecutive_failures: 0,
            total_failures: 0,
            last_error: None,
            last_success: None,
            last_failure: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Difficulty for a genesis chain. Restored chains keep the difficulty
    /// recorded in their snapshot.
    pub difficulty: u32,
    pub replication_timeout: Duration,
    pub shutdown_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            difficulty: DEFAULT_DIFFICULTY,
            replication_timeout: REPLICATION_TIER_TIMEOUT,
            shutdown_timeout: SHUTDOWN_TIER_TIMEOUT,
        }
    }
}

/// The persistence backends, by role.
#[derive(Clone)]
pub struct Tiers {
    pub local: LocalStore,
    pub relational: Option<Arc<dyn SnapshotTier>>,
    pub content: Option<Arc<dyn SnapshotTier>>,
}

impl Tiers {
    pub fn local_only(local: LocalStore) -> Self {
        Self {
            local,
            relational: None,
            content: None,
        }
    }

    fn remote(&self) -> Vec<Arc<dyn SnapshotTier>> {
        self.relational.iter().chain(self.content.iter()).cloned().collect()
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

struct Guarded {
    state: LedgerState,
    chain: Option<HashChain>,
}

struct Inner {
    config: OrchestratorConfig,
    guarded: RwLock<Guarded>,
    codec: SnapshotCodec,
    tiers: Tiers,
    pointer: PointerRegistry,
    /// Block count of the newest snapshot the pointer sinks were given.
    /// Held across `record` so replication tasks finishing out of order
    /// never move the pointer backwards.
    pointer_high_water: tokio::sync::Mutex<usize>,
    /// Same guard per remote tier. A put runs with its tier's guard held, so
    /// an older snapshot finishing late never lands after a newer one.
    tier_high_water: HashMap<TierKind, tokio::sync::Mutex<usize>>,
    health: Mutex<HashMap<TierKind, TierHealth>>,
    replication: Mutex<JoinSet<()>>,
}

/// Cheap to clone; every clone drives the same ledger.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("state", &self.state())
            .field("config", &self.inner.config)
            .field("pointer", &self.inner.pointer)
            .finish()
    }
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        codec: SnapshotCodec,
        tiers: Tiers,
        pointer: PointerRegistry,
    ) -> Self {
        let mut health = HashMap::new();
        let mut tier_high_water = HashMap::new();
        health.insert(TierKind::Local, TierHealth::new(TierKind::Local));
        for tier in tiers.remote() {
            health.insert(tier.kind(), TierHealth::new(tier.kind()));
            tier_high_water.insert(tier.kind(), tokio::sync::Mutex::new(0));
        }

        Self {
            inner: Arc::new(Inner {
                config,
                guarded: RwLock::new(Guarded {
                    state: LedgerState::Uninitialized,
                    chain: None,
                }),
                codec,
                tiers,
                pointer,
                pointer_high_water: tokio::sync::Mutex::new(0),
                tier_high_water,
                health: Mutex::new(health),
                replication: Mutex::new(JoinSet::new()),
            }),
        }
    }

    pub fn state(&self) -> LedgerState {
        self.inner.guarded.read().state
    }

    fn set_state(&self, state: LedgerState) {
        let mut guarded = self.inner.guarded.write();
        debug!(from = %guarded.state, to = %state, "ledger state transition");
        guarded.state = state;
    }

    // -- Restore ------------------------------------------------------------

    /// Load the chain from the first source that yields a valid one, or
    /// start a fresh genesis chain when none does.
    pub async fn restore(&self) -> LedgerResult<RestoreOutcome> {
        {
            let mut guarded = self.inner.guarded.write();
            if guarded.state != LedgerState::Uninitialized {
                return Err(LedgerError::AlreadyStarted(guarded.state));
            }
            guarded.state = LedgerState::Restoring;
        }
        info!("restoring ledger");

        let mut attempts = Vec::new();
        let (chain, source) = match self.find_snapshot(&mut attempts).await {
            Some(found) => found,
            None => match HashChain::genesis(self.inner.config.difficulty) {
                Ok(chain) => (chain, RestoreSource::Genesis),
                Err(e) => {
                    self.set_state(LedgerState::Uninitialized);
                    return Err(e.into());
                }
            },
        };

        if source != RestoreSource::Local {
            let replaced = self
                .preserve_displaced_local(&chain)
                .and_then(|_| self.write_local(&chain));
            if let Err(e) = replaced {
                self.set_state(LedgerState::Uninitialized);
                return Err(e);
            }
        }

        let blocks = chain.len();
        match &source {
            RestoreSource::Genesis => warn!(
                tried = attempts.len(),
                difficulty = chain.difficulty(),
                "no snapshot source yielded a valid chain, starting a new ledger"
            ),
            other => info!(
                source = other.label(),
                blocks,
                skipped = attempts.len(),
                "ledger restored from snapshot"
            ),
        }
        if chain.difficulty() != self.inner.config.difficulty {
            info!(
                snapshot = chain.difficulty(),
                configured = self.inner.config.difficulty,
                "keeping difficulty recorded in the snapshot"
            );
        }

        {
            let mut guarded = self.inner.guarded.write();
            guarded.chain = Some(chain);
            guarded.state = LedgerState::Active;
        }

        Ok(RestoreOutcome {
            source,
            blocks,
            attempts,
        })
    }

    async fn find_snapshot(
        &self,
        attempts: &mut Vec<RestoreAttempt>,
    ) -> Option<(HashChain, RestoreSource)> {
        let mut note = |source: &str, reason: String| {
            info!(source, %reason, "restore source skipped");
            attempts.push(RestoreAttempt {
                source: source.to_string(),
                reason,
            });
        };

        // (a) content-addressed, through the pointer registry
        match &self.inner.tiers.content {
            Some(tier) => {
                let resolution = self
                    .inner
                    .pointer
                    .resolve(|cid| self.fetch_content(tier.clone(), cid))
                    .await;
                for miss in &resolution.misses {
                    debug!(sink = %miss.sink, reason = %miss.reason, "pointer miss");
                }
                match resolution.found {
                    Some(found) => {
                        let source = RestoreSource::ContentAddressed {
                            cid: found.cid,
                            sink: found.sink,
                        };
                        return Some((found.value, source));
                    }
                    None => note(
                        "content_addressed",
                        format!("no pointer resolved ({} sinks missed)", resolution.misses.len()),
                    ),
                }
            }
            None => note("content_addressed", "tier not configured".into()),
        }

        // (b) local
        match self.inner.tiers.local.read() {
            Ok(Some(bytes)) => match self.decode_candidate(&bytes) {
                Ok(chain) => return Some((chain, RestoreSource::Local)),
                Err(reason) => note("local", reason),
            },
            Ok(None) => note("local", "no snapshot file".into()),
            Err(e) => note("local", format!("read failed: {e}")),
        }

        // (c) relational, most recent
        match &self.inner.tiers.relational {
            Some(tier) => {
                let latest =
                    tokio::time::timeout(self.inner.config.replication_timeout, tier.latest()).await;
                match latest {
                    Ok(Ok(Some((handle, bytes)))) => match self.decode_candidate(&bytes) {
                        Ok(chain) => {
                            let id = match handle {
                                TierHandle::Record(id) => id,
                                _ => 0,
                            };
                            return Some((chain, RestoreSource::Relational { id }));
                        }
                        Err(reason) => note("relational", reason),
                    },
                    Ok(Ok(None)) => note("relational", "no backup records".into()),
                    Ok(Err(e)) => note("relational", format!("read failed: {e}")),
                    Err(_) => note("relational", "timed out".into()),
                }
            }
            None => note("relational", "tier not configured".into()),
        }

        None
    }

    async fn fetch_content(
        &self,
        tier: Arc<dyn SnapshotTier>,
        cid: ContentId,
    ) -> Result<HashChain, String> {
        let handle = TierHandle::Content(cid);
        match tokio::time::timeout(self.inner.config.replication_timeout, tier.get(&handle)).await {
            Ok(Ok(Some(bytes))) => self.decode_candidate(&bytes),
            Ok(Ok(None)) => Err("blob not found".into()),
            Ok(Err(e)) => Err(format!("fetch failed: {e}")),
            Err(_) => Err("fetch timed out".into()),
        }
    }

    /// Decode and validate one candidate. An empty chain is a miss, not a
    /// restore.
    fn decode_candidate(&self, bytes: &[u8]) -> Result<HashChain, String> {
        match self.inner.codec.decode(bytes) {
            Ok(chain) if chain.is_empty() => Err("snapshot holds an empty chain".into()),
            Ok(chain) => Ok(chain),
            Err(e) => {
                warn!(error = %e, "snapshot candidate rejected");
                Err(e.to_string())
            }
        }
    }

    /// Copy the local snapshot a non-local restore is about to replace into
    /// a timestamped sidecar next to it. Nothing is copied when the file is
    /// missing or already holds `restored`.
    fn preserve_displaced_local(&self, restored: &HashChain) -> LedgerResult<Option<PathBuf>> {
        let local = &self.inner.tiers.local;
        let bytes = match local.read() {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return Ok(None),
            Err(e) => {
                warn!(error = %e, path = %local.path().display(), "local snapshot unreadable, no pre-restore copy kept");
                return Ok(None);
            }
        };

        let displaced = self.inner.codec.decode(&bytes).ok();
        if let Some(chain) = &displaced {
            if chain.len() == restored.len()
                && chain.latest().map(|b| b.hash) == restored.latest().map(|b| b.hash)
            {
                return Ok(None);
            }
        }

        let name = format!(
            "{PRE_RESTORE_SNAPSHOT_PREFIX}-{}.enc",
            Utc::now().format("%Y%m%dT%H%M%S%.3fZ")
        );
        let sidecar = local.sibling(&name);
        sidecar.write(&bytes).map_err(|e| {
            error!(error = %e, path = %sidecar.path().display(), "could not keep the displaced local snapshot");
            LedgerError::LocalStore(e)
        })?;

        match displaced {
            Some(chain) if chain.len() > restored.len() => warn!(
                local_blocks = chain.len(),
                restored_blocks = restored.len(),
                kept = %sidecar.path().display(),
                "local snapshot is ahead of the restored chain"
            ),
            Some(chain) => info!(
                local_blocks = chain.len(),
                kept = %sidecar.path().display(),
                "displaced local snapshot kept"
            ),
            None => warn!(
                kept = %sidecar.path().display(),
                "undecodable local snapshot kept"
            ),
        }
        Ok(Some(sidecar.path().to_path_buf()))
    }

    fn write_local(&self, chain: &HashChain) -> LedgerResult<()> {
        let bytes = self.inner.codec.encode(chain)?;
        self.inner.tiers.local.write(&bytes).map_err(|e| {
            error!(error = %e, path = %self.inner.tiers.local.path().display(), "local snapshot write failed");
            self.mark_failure(TierKind::Local, e.to_string());
            LedgerError::LocalStore(e)
        })?;
        self.mark_success(TierKind::Local);
        Ok(())
    }

    // -- Append -------------------------------------------------------------

    /// Mine `payload` into the chain, persist locally, and schedule
    /// best-effort replication.
    ///
    /// Returns only once the local snapshot holds the new block. Remote tier
    /// failures are never reported here.
    pub async fn append(&self, payload: Value) -> LedgerResult<Block> {
        let (block, bytes, metadata) = run_blocking(|| -> LedgerResult<(Block, Vec<u8>, PointerMetadata)> {
            let mut guarded = self.inner.guarded.write();
            if guarded.state != LedgerState::Active {
                return Err(LedgerError::NotActive(guarded.state));
            }
            let chain = guarded
                .chain
                .as_mut()
                .ok_or(LedgerError::NotActive(LedgerState::Active))?;

            let previous_len = chain.len();
            let block = chain.append(payload)?;

            let persisted = self
                .inner
                .codec
                .encode(chain)
                .map_err(LedgerError::from)
                .and_then(|bytes| {
                    self.inner
                        .tiers
                        .local
                        .write(&bytes)
                        .map(|()| bytes)
                        .map_err(LedgerError::LocalStore)
                });
            let bytes = match persisted {
                Ok(bytes) => bytes,
                Err(e) => {
                    chain.truncate(previous_len);
                    error!(index = block.index, error = %e, "append rolled back");
                    if let LedgerError::LocalStore(io) = &e {
                        self.mark_failure(TierKind::Local, io.to_string());
                    }
                    return Err(e);
                }
            };
            Ok((block, bytes, pointer_metadata(chain)))
        })?;

        self.mark_success(TierKind::Local);
        info!(index = block.index, key = block.key().unwrap_or("-"), "block appended");
        self.spawn_replication(Arc::new(bytes), metadata);
        Ok(block)
    }

    fn spawn_replication(&self, bytes: Arc<Vec<u8>>, metadata: PointerMetadata) {
        let mut set = self.inner.replication.lock();
        while set.try_join_next().is_some() {}

        for tier in self.inner.tiers.remote() {
            let this = self.clone();
            let bytes = bytes.clone();
            let metadata = metadata.clone();
            let timeout = self.inner.config.replication_timeout;
            set.spawn(async move {
                this.replicate(tier, &bytes, &metadata, timeout).await;
            });
        }
    }

    /// Write one tier, update its health, and record the pointer when the
    /// tier hands back a content id.
    async fn replicate(
        &self,
        tier: Arc<dyn SnapshotTier>,
        bytes: &[u8],
        metadata: &PointerMetadata,
        timeout: Duration,
    ) -> (TierOutcome, Vec<SinkOutcome>) {
        let kind = tier.kind();
        let gate = self.inner.tier_high_water.get(&kind);
        let write = async {
            let mut newest = match gate {
                Some(gate) => Some(gate.lock().await),
                None => None,
            };
            if let Some(stored) = newest.as_deref() {
                if metadata.blocks < *stored {
                    return Err(*stored);
                }
            }
            let result = tier.put(bytes).await;
            if let (Ok(_), Some(stored)) = (&result, newest.as_deref_mut()) {
                *stored = metadata.blocks;
            }
            Ok(result)
        };

        let status = match tokio::time::timeout(timeout, write).await {
            Ok(Err(newest)) => {
                debug!(tier = %kind, blocks = metadata.blocks, newest, "stale snapshot, tier left alone");
                TierStatus::Superseded { newest }
            }
            Ok(Ok(Ok(handle))) => {
                self.mark_success(kind);
                debug!(tier = %kind, %handle, "snapshot replicated");
                TierStatus::Stored { handle }
            }
            Ok(Ok(Err(e))) => {
                warn!(tier = %kind, error = %e, "snapshot replication failed");
                self.mark_failure(kind, e.to_string());
                TierStatus::Failed {
                    error: e.to_string(),
                }
            }
            Err(_) => {
                warn!(tier = %kind, ?timeout, "snapshot replication timed out");
                self.mark_failure(kind, format!("timed out after {timeout:?}"));
                TierStatus::TimedOut
            }
        };

        let sinks = match &status {
            TierStatus::Stored {
                handle: TierHandle::Content(cid),
            } => self.record_pointer(cid, metadata).await,
            _ => Vec::new(),
        };
        (TierOutcome { tier: kind, status }, sinks)
    }

    async fn record_pointer(&self, cid: &ContentId, metadata: &PointerMetadata) -> Vec<SinkOutcome> {
        let mut high_water = self.inner.pointer_high_water.lock().await;
        if metadata.blocks < *high_water {
            debug!(%cid, blocks = metadata.blocks, newest = *high_water, "stale snapshot, pointer left alone");
            return Vec::new();
        }
        *high_water = metadata.blocks;
        self.inner.pointer.record(cid, metadata).await
    }

    /// Wait for every in-flight replication task. Used by tests and tools
    /// that need the remote tiers settled.
    pub async fn flush_replication(&self) {
        let mut set = std::mem::take(&mut *self.inner.replication.lock());
        while set.join_next().await.is_some() {}
    }

    // -- Health -------------------------------------------------------------

    fn mark_success(&self, kind: TierKind) {
        let mut health = self.inner.health.lock();
        let entry = health.entry(kind).or_insert_with(|| TierHealth::new(kind));
        if entry.degraded {
            info!(tier = %kind, "tier recovered");
        }
        entry.degraded = false;
        entry.consecutive_failures = 0;
        entry.last_success = Some(Utc::now());
    }

    fn mark_failure(&self, kind: TierKind, error: String) {
        let mut health = self.inner.health.lock();
        let entry = health.entry(kind).or_insert_with(|| TierHealth::new(kind));
        entry.degraded = true;
        entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
        entry.total_failures = entry.total_failures.saturating_add(1);
        entry.last_error = Some(error);
        entry.last_failure = Some(Utc::now());
    }

    /// Health of every tier, local first.
    pub fn health(&self) -> Vec<TierHealth> {
        let mut all: Vec<TierHealth> = self.inner.health.lock().values().cloned().collect();
        all.sort_by_key(|h| h.tier as u8);
        all
    }

    // -- Reads --------------------------------------------------------------

    fn read_chain<T>(&self, f: impl FnOnce(&HashChain) -> T) -> LedgerResult<T> {
        let guarded = self.inner.guarded.read();
        match (&guarded.chain, guarded.state) {
            (Some(chain), LedgerState::Active | LedgerState::ShuttingDown) => Ok(f(chain)),
            (_, state) => Err(LedgerError::NotActive(state)),
        }
    }

    pub fn get(&self, index: u64) -> LedgerResult<Option<Block>> {
        self.read_chain(|c| c.get(index))
    }

    pub fn history_for_key(&self, key: &str) -> LedgerResult<Vec<Block>> {
        self.read_chain(|c| c.history_for_key(key).collect())
    }

    pub fn history_matching<P>(&self, predicate: P) -> LedgerResult<Vec<Block>>
    where
        P: FnMut(&Block) -> bool,
    {
        self.read_chain(|c| c.history_matching(predicate).collect())
    }

    pub fn current_state(&self, key: &str) -> LedgerResult<Option<CurrentState>> {
        self.read_chain(|c| c.current_state(key))
    }

    pub fn validate(&self) -> LedgerResult<(bool, Vec<Diagnostic>)> {
        self.read_chain(HashChain::validate)
    }

    pub fn info(&self) -> LedgerResult<ChainInfo> {
        self.read_chain(HashChain::info)
    }

    pub fn keys(&self) -> LedgerResult<Vec<String>> {
        self.read_chain(HashChain::keys)
    }

    // -- Shutdown -----------------------------------------------------------

    /// Final backup pass, then `Terminated`.
    ///
    /// In-flight replication gets one shutdown-timeout grace period and is
    /// then aborted. Each tier write in the final pass is bounded by the same
    /// timeout, so this always returns.
    pub async fn shutdown(&self) -> LedgerResult<ShutdownReport> {
        let bytes = {
            let mut guarded = self.inner.guarded.write();
            if guarded.state != LedgerState::Active {
                return Err(LedgerError::NotActive(guarded.state));
            }
            guarded.state = LedgerState::ShuttingDown;
            match &guarded.chain {
                Some(chain) => Some((self.inner.codec.encode(chain), pointer_metadata(chain))),
                None => None,
            }
        };
        info!("shutting down, running final backup");

        let timeout = self.inner.config.shutdown_timeout;
        let abandoned = self.drain_replication(timeout).await;

        let mut report = ShutdownReport {
            abandoned_replications: abandoned,
            tiers: Vec::new(),
            pointer: Vec::new(),
        };

        match bytes {
            Some((Ok(bytes), metadata)) => {
                report.tiers.push(self.final_local_write(&bytes));
                let writes = self
                    .inner
                    .tiers
                    .remote()
                    .into_iter()
                    .map(|tier| self.replicate(tier, &bytes, &metadata, timeout));
                for (outcome, sinks) in join_all(writes).await {
                    report.tiers.push(outcome);
                    report.pointer.extend(sinks);
                }
            }
            Some((Err(e), _)) => error!(error = %e, "final snapshot could not be encoded"),
            None => {}
        }

        let stored = report.tiers.iter().filter(|t| t.is_stored()).count();
        info!(
            stored,
            tiers = report.tiers.len(),
            abandoned,
            "final backup complete"
        );
        self.set_state(LedgerState::Terminated);
        Ok(report)
    }

    fn final_local_write(&self, bytes: &[u8]) -> TierOutcome {
        let local = &self.inner.tiers.local;
        let status = match local.write(bytes) {
            Ok(()) => {
                self.mark_success(TierKind::Local);
                TierStatus::Stored {
                    handle: TierHandle::Path(local.path().to_path_buf()),
                }
            }
            Err(e) => {
                error!(error = %e, "final local snapshot write failed");
                self.mark_failure(TierKind::Local, e.to_string());
                TierStatus::Failed {
                    error: e.to_string(),
                }
            }
        };
        TierOutcome {
            tier: TierKind::Local,
            status,
        }
    }

    /// Give in-flight replication `grace` to finish, then abort the rest.
    /// Returns how many were aborted.
    async fn drain_replication(&self, grace: Duration) -> usize {
        let mut set = std::mem::take(&mut *self.inner.replication.lock());
        if set.is_empty() {
            return 0;
        }
        let drained = tokio::time::timeout(grace, async {
            while set.join_next().await.is_some() {}
        })
        .await;
        if drained.is_ok() {
            return 0;
        }
        let abandoned = set.len();
        warn!(abandoned, "abandoning in-flight replication");
        set.shutdown().await;
        abandoned
    }
}

/// Run `f` where it may block for a while: mining and fsync under the chain
/// lock. On a multi-thread runtime the worker hands its other tasks off
/// first; elsewhere `f` runs inline.
fn run_blocking<T>(f: impl FnOnce() -> T) -> T {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}

fn pointer_metadata(chain: &HashChain) -> PointerMetadata {
    PointerMetadata {
        blocks: chain.len(),
        latest_hash: chain.latest().map(|b| b.hash),
        recorded_at: Utc::now(),
    }
}
