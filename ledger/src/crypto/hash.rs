//! # Hashing Utilities
//!
//! Two hash functions, each with one job:
//!
//! - **SHA-256** computes block hashes. Block hashes are rendered as 64
//!   lowercase hex characters and compared as strings, which is also the form
//!   the proof-of-work predicate inspects.
//! - **BLAKE3** derives the snapshot encryption key from the process secret,
//!   using its `derive_key` mode for domain separation.
//!
//! ## Proof-of-work predicate
//!
//! A hash satisfies difficulty `d` when its first `d` hex characters are all
//! `'0'`, i.e. the top `4d` bits of the digest are zero.

use sha2::{Digest, Sha256};

use crate::config::{AES_KEY_LENGTH, SNAPSHOT_KEY_CONTEXT};

/// Compute the SHA-256 hash of the input data.
///
/// Returns a 32-byte digest as a fixed-size array.
///
/// # Example
///
/// ```
/// use deedchain::crypto::sha256;
///
/// let hash = sha256(b"deedchain");
/// assert_eq!(hash.len(), 32);
/// ```
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let result = hasher.finalize();
    let mut output = [0u8; 32];
    output.copy_from_slice(&result);
    output
}

/// SHA-256 rendered as 64 lowercase hex characters.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha256(data))
}

/// Returns true when `hash_hex` starts with at least `difficulty` `'0'`
/// characters.
///
/// A hash shorter than the difficulty never satisfies the predicate, so a
/// truncated or otherwise mangled hash string fails closed.
pub fn meets_difficulty(hash_hex: &str, difficulty: u32) -> bool {
    let needed = difficulty as usize;
    hash_hex.len() >= needed && hash_hex.bytes().take(needed).all(|b| b == b'0')
}

/// Returns true if `s` looks like a SHA-256 hex digest: exactly 64 lowercase
/// hex characters.
pub fn is_sha256_hex(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Derive the 32-byte snapshot encryption key from the process secret.
///
/// Uses BLAKE3's `derive_key` mode with a fixed context string, so the same
/// secret used for anything else in the process yields an unrelated key here.
/// The secret itself is never stored alongside the output.
pub fn derive_snapshot_key(secret: &[u8]) -> [u8; AES_KEY_LENGTH] {
    blake3::derive_key(SNAPSHOT_KEY_CONTEXT, secret)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_known_vector() {
        // SHA-256 of the empty string.
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn sha256_deterministic() {
        assert_eq!(sha256(b"deed"), sha256(b"deed"));
        assert_ne!(sha256(b"deed"), sha256(b"deeds"));
    }

    #[test]
    fn sha256_hex_is_lowercase_64() {
        let h = sha256_hex(b"PROP-1");
        assert!(is_sha256_hex(&h));
    }

    #[test]
    fn difficulty_predicate() {
        assert!(meets_difficulty("000abc", 3));
        assert!(!meets_difficulty("00a0bc", 3));
        assert!(meets_difficulty("abc", 0));
        assert!(!meets_difficulty("00", 3));
    }

    #[test]
    fn sha256_hex_shape_check() {
        assert!(!is_sha256_hex("0"));
        assert!(!is_sha256_hex(&"A".repeat(64)));
        assert!(is_sha256_hex(&"0".repeat(64)));
    }

    #[test]
    fn derived_key_is_deterministic_and_secret_sensitive() {
        let a = derive_snapshot_key(b"correct horse");
        let b = derive_snapshot_key(b"correct horse");
        let c = derive_snapshot_key(b"battery staple");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn derived_key_is_not_plain_blake3() {
        let secret = b"secret";
        assert_ne!(derive_snapshot_key(secret), *blake3::hash(secret).as_bytes());
    }
}
