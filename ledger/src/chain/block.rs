//! # Block Structure
//!
//! A block is one immutable, hash-linked ledger event.
//!
//! ## Block Layout
//!
//! ```text
//! ┌───────────────────────────────────────────────────┐
//! │  index: u64            position in the chain      │
//! │  timestamp: DateTime   creation time (UTC)        │
//! │  payload: JSON value   the business event         │
//! │  previous_hash: hex    hash of block index-1      │
//! │  hash: hex             SHA-256 of the preimage    │
//! │  nonce: u64            proof-of-work solution     │
//! └───────────────────────────────────────────────────┘
//! ```
//!
//! Fields serialize in exactly that order, which is also the record layout
//! inside a decrypted snapshot.
//!
//! ## Hash Computation
//!
//! The hash covers `index`, `timestamp`, `payload`, `previous_hash` and
//! `nonce`, canonically encoded as one JSON object (see
//! [`super::canonical`]). With sorted keys the preimage always reads:
//!
//! ```text
//! {"index":I,"nonce":N,"payload":P,"previous_hash":"H","timestamp":"T"}
//! ```
//!
//! Mining exploits that layout: everything before and after the nonce is
//! encoded once, and each attempt only formats the nonce in between.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use super::canonical::{to_canonical_bytes, write_string, write_value};
use crate::config::{GENESIS_MESSAGE, GENESIS_PAYLOAD_TYPE, GENESIS_PREVIOUS_HASH};
use crate::crypto::hash::{meets_difficulty, sha256_hex};

/// A single ledger block.
///
/// There is no way to get a reference to a block stored inside a
/// [`super::HashChain`]; every block a caller holds is its own deep copy, so
/// mutating it (masking an identity number before display, say) can never
/// reach the ledger.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Block {
    /// Position in the chain (genesis = 0).
    pub index: u64,
    /// Creation time. Non-decreasing along the chain.
    pub timestamp: DateTime<Utc>,
    /// The business event, an arbitrarily nested JSON record.
    pub payload: Value,
    /// Hash of the previous block, `"0"` for genesis.
    pub previous_hash: String,
    /// Lowercase hex SHA-256 of the canonical preimage.
    pub hash: String,
    /// Proof-of-work nonce.
    pub nonce: u64,
}

/// Returned when no nonce in the `u64` space satisfies the difficulty.
///
/// Unreachable for any difficulty the config allows; kept so mining is a
/// total function instead of an unbounded loop.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("no nonce satisfies difficulty {difficulty} for block {index}")]
pub struct NonceSpaceExhausted {
    pub index: u64,
    pub difficulty: u32,
}

impl Block {
    /// Mine the genesis block for a chain of the given difficulty.
    pub fn genesis(difficulty: u32) -> Result<Self, NonceSpaceExhausted> {
        Self::mine(
            0,
            Utc::now(),
            genesis_payload(),
            GENESIS_PREVIOUS_HASH.to_string(),
            difficulty,
        )
    }

    /// Search nonces from 0 upward for the first hash meeting `difficulty`.
    ///
    /// Deterministic: the same fields always yield the same nonce and hash.
    pub fn mine(
        index: u64,
        timestamp: DateTime<Utc>,
        payload: Value,
        previous_hash: String,
        difficulty: u32,
    ) -> Result<Self, NonceSpaceExhausted> {
        let template = PreimageTemplate::new(index, &timestamp, &payload, &previous_hash);

        let mut nonce = 0u64;
        loop {
            let hash = template.hash_with_nonce(nonce);
            if meets_difficulty(&hash, difficulty) {
                return Ok(Block {
                    index,
                    timestamp,
                    payload,
                    previous_hash,
                    hash,
                    nonce,
                });
            }
            nonce = nonce
                .checked_add(1)
                .ok_or(NonceSpaceExhausted { index, difficulty })?;
        }
    }

    /// Recompute the hash from this block's own fields.
    pub fn compute_hash(&self) -> String {
        sha256_hex(&self.canonical_preimage())
    }

    /// Canonical bytes of the hashed fields.
    pub fn canonical_preimage(&self) -> Vec<u8> {
        to_canonical_bytes(&json!({
            "index": self.index,
            "timestamp": canonical_timestamp(&self.timestamp),
            "payload": self.payload,
            "previous_hash": self.previous_hash,
            "nonce": self.nonce,
        }))
    }

    /// The record key this block belongs to: `payload.key`, falling back to
    /// `payload.property_key`. Genesis and keyless events return `None`.
    pub fn key(&self) -> Option<&str> {
        self.payload
            .get("key")
            .or_else(|| self.payload.get("property_key"))
            .and_then(Value::as_str)
    }

    /// The payload's `type` tag, if it has one.
    pub fn event_type(&self) -> Option<&str> {
        self.payload.get("type").and_then(Value::as_str)
    }

    pub fn is_genesis(&self) -> bool {
        self.index == 0
    }
}

/// The payload stored in every genesis block.
pub fn genesis_payload() -> Value {
    json!({
        "type": GENESIS_PAYLOAD_TYPE,
        "message": GENESIS_MESSAGE,
    })
}

/// RFC 3339, UTC, nanosecond precision, `Z` suffix. Fixed width, so equal
/// instants always render to the same string.
pub fn canonical_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Pre-encoded halves of a block preimage around the nonce.
struct PreimageTemplate {
    prefix: Vec<u8>,
    suffix: Vec<u8>,
}

impl PreimageTemplate {
    fn new(index: u64, timestamp: &DateTime<Utc>, payload: &Value, previous_hash: &str) -> Self {
        let prefix = format!("{{\"index\":{},\"nonce\":", index).into_bytes();

        let mut suffix = String::from(",\"payload\":");
        write_value(&mut suffix, payload);
        suffix.push_str(",\"previous_hash\":");
        write_string(&mut suffix, previous_hash);
        suffix.push_str(",\"timestamp\":");
        write_string(&mut suffix, &canonical_timestamp(timestamp));
        suffix.push('}');

        Self {
            prefix,
            suffix: suffix.into_bytes(),
        }
    }

    fn hash_with_nonce(&self, nonce: u64) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.prefix);
        hasher.update(nonce.to_string().as_bytes());
        hasher.update(&self.suffix);
        hex::encode(hasher.finalize())
    }
}
