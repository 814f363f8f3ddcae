//! # Snapshot Codec
//!
//! Turns a whole [`HashChain`] into one sealed byte blob and back. Every tier
//! stores exactly these bytes.
//!
//! ```text
//!   HashChain ──serde_json──► SnapshotDocument ──AES-256-GCM──► nonce || ct
//!                                  │
//!                                  ├── format_version
//!                                  ├── difficulty
//!                                  ├── saved_at
//!                                  └── blocks [index, timestamp, payload,
//!                                              previous_hash, hash, nonce]
//! ```
//!
//! Decoding fails closed. A wrong key, a flipped bit, a malformed document
//! and a chain that doesn't validate are four different errors, and none of
//! them ever turns into an empty chain.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::chain::{Block, HashChain, IntegrityError};
use crate::config::{AES_KEY_LENGTH, MAX_DIFFICULTY, SNAPSHOT_AAD, SNAPSHOT_FORMAT_VERSION};
use crate::crypto::{derive_snapshot_key, open, seal};

/// Why a snapshot could not be produced or read.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot encryption failed")]
    Encrypt,

    #[error("snapshot decryption failed -- wrong secret or corrupted blob")]
    Decrypt,

    #[error("malformed snapshot: {0}")]
    Malformed(String),

    #[error("unsupported snapshot format version {0}")]
    UnsupportedVersion(u32),

    #[error("snapshot chain failed validation: {0}")]
    Integrity(#[from] IntegrityError),
}

/// The decrypted body of a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotDocument {
    pub format_version: u32,
    pub difficulty: u32,
    pub saved_at: DateTime<Utc>,
    pub blocks: Vec<Block>,
}

/// Borrowing twin of [`SnapshotDocument`] so encoding never clones blocks.
#[derive(Serialize)]
struct SnapshotDocumentRef<'a> {
    format_version: u32,
    difficulty: u32,
    saved_at: DateTime<Utc>,
    blocks: &'a [Block],
}

/// Encrypts and decrypts snapshots under a key derived from the process
/// secret.
#[derive(Clone)]
pub struct SnapshotCodec {
    key: [u8; AES_KEY_LENGTH],
}

impl fmt::Debug for SnapshotCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotCodec")
            .field("key", &"<redacted>")
            .finish()
    }
}

impl SnapshotCodec {
    pub fn from_secret(secret: &[u8]) -> Self {
        Self {
            key: derive_snapshot_key(secret),
        }
    }

    /// Serialize and seal the entire chain.
    pub fn encode(&self, chain: &HashChain) -> Result<Vec<u8>, SnapshotError> {
        let document = SnapshotDocumentRef {
            format_version: SNAPSHOT_FORMAT_VERSION,
            difficulty: chain.difficulty(),
            saved_at: Utc::now(),
            blocks: chain.blocks(),
        };
        let plaintext =
            serde_json::to_vec(&document).map_err(|e| SnapshotError::Malformed(e.to_string()))?;
        seal(&self.key, &plaintext, SNAPSHOT_AAD).map_err(|_| SnapshotError::Encrypt)
    }

    /// Open, parse and validate a snapshot.
    pub fn decode(&self, bytes: &[u8]) -> Result<HashChain, SnapshotError> {
        let document = self.decode_unverified(bytes)?;
        Ok(HashChain::load(document.blocks, document.difficulty)?)
    }

    /// Open and parse without validating the chain.
    ///
    /// For operator tooling that inspects or salvages damaged snapshots.
    pub fn decode_unverified(&self, bytes: &[u8]) -> Result<SnapshotDocument, SnapshotError> {
        let plaintext = open(&self.key, bytes, SNAPSHOT_AAD).map_err(|_| SnapshotError::Decrypt)?;
        let document: SnapshotDocument = serde_json::from_slice(&plaintext)
            .map_err(|e| SnapshotError::Malformed(e.to_string()))?;

        if document.format_version != SNAPSHOT_FORMAT_VERSION {
            return Err(SnapshotError::UnsupportedVersion(document.format_version));
        }
        if document.difficulty > MAX_DIFFICULTY {
            return Err(SnapshotError::Malformed(format!(
                "difficulty {} exceeds maximum {}",
                document.difficulty, MAX_DIFFICULTY
            )));
        }
        Ok(document)
    }

    /// Seal an arbitrary document. Test and tooling helper for producing
    /// snapshots that `encode` would never write.
    pub fn seal_document(&self, document: &SnapshotDocument) -> Result<Vec<u8>, SnapshotError> {
        let plaintext =
            serde_json::to_vec(document).map_err(|e| SnapshotError::Malformed(e.to_string()))?;
        seal(&self.key, &plaintext, SNAPSHOT_AAD).map_err(|_| SnapshotError::Encrypt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const D: u32 = 2;

    fn codec() -> SnapshotCodec {
        SnapshotCodec::from_secret(b"test secret")
    }

    fn chain_with(n: usize) -> HashChain {
        let mut chain = HashChain::genesis(D).unwrap();
        for i in 0..n {
            chain
                .append(json!({"type": "add", "key": format!("PROP-{i}"), "value": 1500000.5, "village": "ಹಳ್ಳಿ"}))
                .unwrap();
        }
        chain
    }

    #[test]
    fn roundtrip_preserves_every_hash() {
        for n in [0, 1, 5] {
            let chain = chain_with(n);
            let decoded = codec().decode(&codec().encode(&chain).unwrap()).unwrap();
            assert_eq!(decoded.dump(), chain.dump());
            assert_eq!(decoded.difficulty(), D);
            assert!(decoded.validate().0);
        }
    }

    #[test]
    fn empty_chain_roundtrips() {
        let chain = HashChain::load(vec![], D).unwrap();
        let decoded = codec().decode(&codec().encode(&chain).unwrap()).unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn reencoding_a_decoded_chain_keeps_hashes() {
        let chain = chain_with(3);
        let once = codec().decode(&codec().encode(&chain).unwrap()).unwrap();
        let twice = codec().decode(&codec().encode(&once).unwrap()).unwrap();
        for block in twice.dump() {
            assert_eq!(block.compute_hash(), block.hash);
        }
    }

    #[test]
    fn wrong_secret_is_decrypt_error() {
        let bytes = codec().encode(&chain_with(1)).unwrap();
        let other = SnapshotCodec::from_secret(b"other secret");
        assert!(matches!(other.decode(&bytes), Err(SnapshotError::Decrypt)));
    }

    #[test]
    fn truncated_blob_is_decrypt_error() {
        assert!(matches!(codec().decode(&[1, 2, 3]), Err(SnapshotError::Decrypt)));
    }

    #[test]
    fn garbage_plaintext_is_malformed() {
        let key = derive_snapshot_key(b"test secret");
        let bytes = seal(&key, b"not json", SNAPSHOT_AAD).unwrap();
        assert!(matches!(codec().decode(&bytes), Err(SnapshotError::Malformed(_))));
    }

    #[test]
    fn future_version_is_rejected() {
        let mut document = codec().decode_unverified(&codec().encode(&chain_with(1)).unwrap()).unwrap();
        document.format_version = 99;
        let bytes = codec().seal_document(&document).unwrap();
        assert!(matches!(
            codec().decode(&bytes),
            Err(SnapshotError::UnsupportedVersion(99))
        ));
    }

    #[test]
    fn tampered_chain_is_integrity_error() {
        let mut document = codec().decode_unverified(&codec().encode(&chain_with(2)).unwrap()).unwrap();
        document.blocks[1].payload["value"] = json!(1);
        let bytes = codec().seal_document(&document).unwrap();
        match codec().decode(&bytes) {
            Err(SnapshotError::Integrity(err)) => {
                assert!(err.diagnostics.iter().any(|d| d.index == 1));
            }
            other => panic!("expected integrity error, got {other:?}"),
        }
        // Unverified decode still hands the blocks over for salvage.
        assert_eq!(codec().decode_unverified(&bytes).unwrap().blocks.len(), 3);
    }

    #[test]
    fn debug_does_not_print_key() {
        let dbg = format!("{:?}", codec());
        assert!(dbg.contains("redacted"));
        assert!(!dbg.contains(&hex::encode(derive_snapshot_key(b"test secret"))));
    }
}
