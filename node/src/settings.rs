//! # Node Configuration
//!
//! Three layers, later wins:
//!
//! 1. built-in defaults
//! 2. an optional TOML file (`--config`)
//! 3. environment fallbacks for credentials, then CLI flags
//!
//! ```toml
//! data_dir = "/var/lib/deedchain"
//! api_addr = "0.0.0.0:5000"
//!
//! [ledger]
//! difficulty = 3
//!
//! [relational]
//! retention = 10
//!
//! [content]
//! backend = "pinata"
//! ```
//!
//! The snapshot secret is never read from a file that gets serialized back
//! out, and never printed by `Debug`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use deedchain::config::{
    BACKUP_DB_DIR, DEFAULT_BACKUP_RETENTION, DEFAULT_DIFFICULTY, DEFAULT_IPFS_GATEWAYS,
    MAX_DIFFICULTY, REPLICATION_TIER_TIMEOUT, SHUTDOWN_TIER_TIMEOUT,
};
use deedchain::pointer::{
    BlobTagSink, ControlPlaneConfig, ControlPlaneSink, LocalFileSink, NoteStoreConfig,
    NoteStoreSink, PointerRegistry, PointerSink,
};
use deedchain::tiers::{
    ContentAddressedStore, ContentTier, DirectoryContentStore, LocalStore, PinataConfig,
    PinataStore, RelationalBackupStore, SnapshotTier,
};
use deedchain::{Orchestrator, OrchestratorConfig, SnapshotCodec, Tiers};

pub const SECRET_VAR: &str = "DEEDCHAIN_SECRET";

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub data_dir: PathBuf,
    pub api_addr: String,
    pub metrics_addr: String,
    pub ledger: LedgerSection,
    pub relational: RelationalSection,
    pub content: ContentSection,
    pub pointer: PointerSection,
    /// Snapshot encryption secret. Prefer the environment variable.
    #[serde(skip_serializing)]
    pub secret: Option<String>,
}

impl std::fmt::Debug for NodeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeConfig")
            .field("data_dir", &self.data_dir)
            .field("api_addr", &self.api_addr)
            .field("metrics_addr", &self.metrics_addr)
            .field("ledger", &self.ledger)
            .field("relational", &self.relational)
            .field("content", &self.content)
            .field("pointer", &self.pointer)
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            api_addr: "0.0.0.0:5000".to_string(),
            metrics_addr: "0.0.0.0:9100".to_string(),
            ledger: LedgerSection::default(),
            relational: RelationalSection::default(),
            content: ContentSection::default(),
            pointer: PointerSection::default(),
            secret: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerSection {
    /// Proof-of-work difficulty for a new ledger.
    pub difficulty: u32,
    pub replication_timeout_secs: u64,
    pub shutdown_timeout_secs: u64,
}

impl Default for LedgerSection {
    fn default() -> Self {
        Self {
            difficulty: DEFAULT_DIFFICULTY,
            replication_timeout_secs: REPLICATION_TIER_TIMEOUT.as_secs(),
            shutdown_timeout_secs: SHUTDOWN_TIER_TIMEOUT.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelationalSection {
    pub enabled: bool,
    /// Defaults to `<data_dir>/backups.db`.
    pub path: Option<PathBuf>,
    pub retention: usize,
}

impl Default for RelationalSection {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
            retention: DEFAULT_BACKUP_RETENTION,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentBackend {
    Disabled,
    /// Blobs in a local directory, named by digest.
    Directory,
    Pinata,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContentSection {
    pub backend: ContentBackend,
    /// For the directory backend. Defaults to `<data_dir>/blobs`.
    pub directory: Option<PathBuf>,
    #[serde(skip_serializing)]
    pub pinata_api_key: Option<String>,
    #[serde(skip_serializing)]
    pub pinata_secret_key: Option<String>,
    pub pinata_api_base: Option<String>,
    pub gateways: Vec<String>,
}

impl std::fmt::Debug for ContentSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentSection")
            .field("backend", &self.backend)
            .field("directory", &self.directory)
            .field("pinata_credentials", &self.pinata_api_key.is_some())
            .field("gateways", &self.gateways)
            .finish()
    }
}

impl Default for ContentSection {
    fn default() -> Self {
        Self {
            backend: ContentBackend::Pinata,
            directory: None,
            pinata_api_key: None,
            pinata_secret_key: None,
            pinata_api_base: None,
            gateways: DEFAULT_IPFS_GATEWAYS.iter().map(|g| g.to_string()).collect(),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PointerSection {
    pub timeout_secs: u64,
    #[serde(skip_serializing)]
    pub control_plane_api_key: Option<String>,
    pub control_plane_service_id: Option<String>,
    pub control_plane_api_base: Option<String>,
    #[serde(skip_serializing)]
    pub note_store_token: Option<String>,
    pub note_store_id: Option<String>,
    pub note_store_api_base: Option<String>,
}

impl std::fmt::Debug for PointerSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PointerSection")
            .field("timeout_secs", &self.timeout_secs)
            .field("control_plane_service_id", &self.control_plane_service_id)
            .field("control_plane_api_key", &self.control_plane_api_key.is_some())
            .field("note_store_id", &self.note_store_id)
            .field("note_store_token", &self.note_store_token.is_some())
            .finish()
    }
}

impl Default for PointerSection {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            control_plane_api_key: None,
            control_plane_service_id: None,
            control_plane_api_base: None,
            note_store_token: None,
            note_store_id: None,
            note_store_api_base: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl NodeConfig {
    /// Parse a TOML file. Missing keys take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    /// Defaults, or the given file when there is one.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::from_file(p),
            None => Ok(Self::default()),
        }
    }

    /// Fill unset credentials from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|name| std::env::var(name).ok());
    }

    /// Fill unset credentials through `lookup`. Values already present in
    /// the file win; empty variables count as unset.
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        fill(&mut self.secret, get(SECRET_VAR));
        fill(&mut self.content.pinata_api_key, get("PINATA_API_KEY"));
        fill(&mut self.content.pinata_secret_key, get("PINATA_SECRET_KEY"));
        fill(&mut self.pointer.control_plane_api_key, get("RENDER_API_KEY"));
        fill(&mut self.pointer.control_plane_service_id, get("RENDER_SERVICE_ID"));
        fill(&mut self.pointer.note_store_token, get("GITHUB_TOKEN"));
        fill(&mut self.pointer.note_store_id, get("GITHUB_GIST_ID"));
    }

    pub fn validate(&self) -> Result<()> {
        if self.ledger.difficulty > MAX_DIFFICULTY {
            bail!(
                "ledger.difficulty {} exceeds the maximum of {MAX_DIFFICULTY}",
                self.ledger.difficulty
            );
        }
        if self.relational.retention == 0 {
            bail!("relational.retention must be at least 1");
        }
        if self.ledger.replication_timeout_secs == 0 || self.ledger.shutdown_timeout_secs == 0 {
            bail!("tier timeouts must be at least one second");
        }
        Ok(())
    }

    pub fn secret(&self) -> Result<&str> {
        match self.secret.as_deref() {
            Some(s) if !s.is_empty() => Ok(s),
            _ => bail!("no snapshot secret configured; set {SECRET_VAR}"),
        }
    }

    pub fn local_store(&self) -> LocalStore {
        LocalStore::in_dir(&self.data_dir)
    }

    pub fn relational_path(&self) -> PathBuf {
        self.relational
            .path
            .clone()
            .unwrap_or_else(|| self.data_dir.join(BACKUP_DB_DIR))
    }

    pub fn codec(&self) -> Result<SnapshotCodec> {
        Ok(SnapshotCodec::from_secret(self.secret()?.as_bytes()))
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            difficulty: self.ledger.difficulty,
            replication_timeout: Duration::from_secs(self.ledger.replication_timeout_secs),
            shutdown_timeout: Duration::from_secs(self.ledger.shutdown_timeout_secs),
        }
    }

    fn content_store(&self) -> Result<Option<Arc<dyn ContentAddressedStore>>> {
        let store: Arc<dyn ContentAddressedStore> = match self.content.backend {
            ContentBackend::Disabled => return Ok(None),
            ContentBackend::Directory => Arc::new(DirectoryContentStore::new(
                self.content
                    .directory
                    .clone()
                    .unwrap_or_else(|| self.data_dir.join("blobs")),
            )),
            ContentBackend::Pinata => {
                let mut config = PinataConfig {
                    api_key: self.content.pinata_api_key.clone(),
                    secret_key: self.content.pinata_secret_key.clone(),
                    gateways: self.content.gateways.clone(),
                    ..PinataConfig::default()
                }
                .with_fetch_budget(Duration::from_secs(self.ledger.replication_timeout_secs));
                if let Some(base) = &self.content.pinata_api_base {
                    config.api_base = base.clone();
                }
                if !config.has_credentials() {
                    tracing::warn!("pinning service credentials missing, uploads will be skipped");
                }
                Arc::new(PinataStore::new(config).context("failed to build pinning client")?)
            }
        };
        Ok(Some(store))
    }

    fn pointer_registry(
        &self,
        content: Option<&Arc<dyn ContentAddressedStore>>,
    ) -> Result<PointerRegistry> {
        let control_plane = ControlPlaneConfig {
            api_key: self.pointer.control_plane_api_key.clone(),
            service_id: self.pointer.control_plane_service_id.clone(),
            api_base: self.pointer.control_plane_api_base.clone(),
            ..ControlPlaneConfig::default()
        }
        .capture_injected();
        let note_store = NoteStoreConfig {
            token: self.pointer.note_store_token.clone(),
            gist_id: self.pointer.note_store_id.clone(),
            api_base: self.pointer.note_store_api_base.clone(),
        };

        let mut sinks: Vec<Arc<dyn PointerSink>> = vec![
            Arc::new(ControlPlaneSink::new(control_plane).context("failed to build control-plane client")?),
            Arc::new(NoteStoreSink::new(note_store).context("failed to build note-store client")?),
            Arc::new(LocalFileSink::in_dir(&self.data_dir)),
        ];
        if let Some(store) = content {
            sinks.push(Arc::new(BlobTagSink::new(store.clone())));
        }
        Ok(PointerRegistry::new(
            sinks,
            Duration::from_secs(self.pointer.timeout_secs.max(1)),
        ))
    }

    /// Wire every configured tier and sink into an orchestrator.
    pub fn orchestrator(&self) -> Result<Orchestrator> {
        self.validate()?;
        std::fs::create_dir_all(&self.data_dir).with_context(|| {
            format!("failed to create data directory {}", self.data_dir.display())
        })?;

        let relational: Option<Arc<dyn SnapshotTier>> = if self.relational.enabled {
            let path = self.relational_path();
            let store = RelationalBackupStore::open(&path, self.relational.retention)
                .with_context(|| format!("failed to open backup database {}", path.display()))?;
            Some(Arc::new(store))
        } else {
            None
        };

        let content_store = self.content_store()?;
        let pointer = self.pointer_registry(content_store.as_ref())?;
        let content: Option<Arc<dyn SnapshotTier>> = content_store
            .map(|store| Arc::new(ContentTier::new(store)) as Arc<dyn SnapshotTier>);

        Ok(Orchestrator::new(
            self.orchestrator_config(),
            self.codec()?,
            Tiers {
                local: self.local_store(),
                relational,
                content,
            },
            pointer,
        ))
    }
}

fn fill(slot: &mut Option<String>, value: Option<String>) {
    if slot.as_deref().map_or(true, str::is_empty) {
        if let Some(v) = value {
            *slot = Some(v);
        }
    }
}
