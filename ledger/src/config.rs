//! # Ledger Constants
//!
//! Every policy number in deedchain lives here. Difficulty and retention are
//! policy, not structure: the node exposes both as configuration, and these
//! are only the defaults it falls back to.

use std::time::Duration;

// ---------------------------------------------------------------------------
// Chain Parameters
// ---------------------------------------------------------------------------

/// Default proof-of-work difficulty, in leading zero hex characters.
///
/// Three zeros means roughly 4096 hash attempts per block on average.
pub const DEFAULT_DIFFICULTY: u32 = 3;

/// Upper bound on difficulty. A SHA-256 hex digest has 64 characters and
/// anything past about 8 turns a single append into a coffee break.
pub const MAX_DIFFICULTY: u32 = 16;

/// `previous_hash` sentinel carried by the genesis block.
pub const GENESIS_PREVIOUS_HASH: &str = "0";

/// Payload type tag of the genesis block.
pub const GENESIS_PAYLOAD_TYPE: &str = "genesis";

/// Human-readable marker stored in the genesis payload.
pub const GENESIS_MESSAGE: &str = "Property Ledger Genesis Block";

// ---------------------------------------------------------------------------
// Snapshot Format
// ---------------------------------------------------------------------------

/// Version tag written into every snapshot document. Bump when the block
/// record layout changes in a way older readers cannot parse.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// Additional authenticated data bound to every snapshot ciphertext, so a blob
/// encrypted for some other purpose under the same key is rejected.
pub const SNAPSHOT_AAD: &[u8] = b"deedchain-snapshot-v1";

/// BLAKE3 `derive_key` context for the snapshot encryption key.
pub const SNAPSHOT_KEY_CONTEXT: &str = "deedchain snapshot encryption v1";

/// AES-256-GCM key length in bytes.
pub const AES_KEY_LENGTH: usize = 32;

/// AES-256-GCM nonce length in bytes. 96 bits, the only length we use.
pub const AES_NONCE_LENGTH: usize = 12;

/// AES-256-GCM authentication tag length in bytes.
pub const AES_TAG_LENGTH: usize = 16;

// ---------------------------------------------------------------------------
// Persistence Tiers
// ---------------------------------------------------------------------------

/// Number of relational backup records retained after each insert.
pub const DEFAULT_BACKUP_RETENTION: usize = 10;

/// File name of the local encrypted snapshot inside the data directory.
pub const LOCAL_SNAPSHOT_FILE: &str = "snapshot.enc";

/// File name of the salvaged snapshot written by the operator `salvage` tool.
pub const SALVAGED_SNAPSHOT_FILE: &str = "salvaged.enc";

/// Prefix of the file a restore keeps the displaced local snapshot under,
/// followed by a UTC timestamp and `.enc`.
pub const PRE_RESTORE_SNAPSHOT_PREFIX: &str = "pre-restore";

/// Directory (inside the data directory) holding the relational backup store.
pub const BACKUP_DB_DIR: &str = "backups.db";

/// File name of the bare latest-identifier pointer file.
pub const LOCAL_POINTER_FILE: &str = "latest_cid.txt";

/// File name of the pointer history kept next to the pointer file.
pub const POINTER_HISTORY_FILE: &str = "pointer_history.json";

/// How many entries the pointer history keeps.
pub const POINTER_HISTORY_LIMIT: usize = 10;

/// Environment variable the hosting control plane injects with the latest
/// snapshot identifier.
pub const CONTROL_PLANE_POINTER_VAR: &str = "DEEDCHAIN_LATEST_CID";

/// File name used inside the external note store.
pub const NOTE_STORE_FILE_NAME: &str = "deedchain_latest_cid.json";

/// Project tag attached to every uploaded snapshot blob.
pub const BLOB_PROJECT_TAG: &str = "deedchain";

/// Default IPFS gateways, tried in order when fetching a snapshot by CID.
pub const DEFAULT_IPFS_GATEWAYS: &[&str] = &[
    "https://gateway.pinata.cloud",
    "https://ipfs.io",
    "https://dweb.link",
];

// ---------------------------------------------------------------------------
// Timing
// ---------------------------------------------------------------------------

/// Bound on a single best-effort replication call to a remote tier.
pub const REPLICATION_TIER_TIMEOUT: Duration = Duration::from_secs(30);

/// Bound on each tier write during the final shutdown backup pass.
pub const SHUTDOWN_TIER_TIMEOUT: Duration = Duration::from_secs(20);

/// Bound on one gateway request when fetching a snapshot, so a stalled
/// gateway leaves time for the next one.
pub const GATEWAY_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Floor for a per-gateway timeout derived from a fetch budget.
pub const MIN_GATEWAY_REQUEST_TIMEOUT: Duration = Duration::from_secs(1);

/// Connect timeout used by every HTTP-backed tier and sink.
pub const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
