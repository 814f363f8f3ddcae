//! # Cryptographic Primitives
//!
//! Thin wrappers around audited implementations:
//!
//! - **SHA-256** for block hashes and content identifiers.
//! - **BLAKE3** `derive_key` for turning the process secret into a key.
//! - **AES-256-GCM** for sealing snapshots at rest.

pub mod encryption;
pub mod hash;

pub use encryption::{open, seal, EncryptionError};
pub use hash::{derive_snapshot_key, is_sha256_hex, meets_difficulty, sha256, sha256_hex};
