//! # AES-256-GCM Encryption
//!
//! Authenticated encryption for snapshots at rest. Every tier stores the same
//! sealed bytes, so a snapshot that leaks from any one of them is useless
//! without the process secret.
//!
//! ## Nonce management
//!
//! Random 96-bit nonces from the OS CSPRNG. A chain is re-sealed on every
//! append, and the birthday bound for 96-bit nonces (~2^48 messages per key)
//! is far beyond anything a single-writer ledger will produce.
//!
//! ## Wire format
//!
//! [`seal`] returns `nonce || ciphertext` as a single `Vec<u8>`. The first 12
//! bytes are the nonce, the rest is the ciphertext plus the 16-byte auth tag.
//! [`open`] expects the same layout.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use thiserror::Error;

use crate::config::{AES_KEY_LENGTH, AES_NONCE_LENGTH, AES_TAG_LENGTH};

/// Errors that can occur during encryption/decryption.
///
/// Deliberately vague: "wrong key" and "corrupted ciphertext" look the same
/// from the outside.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncryptionError {
    #[error("encryption failed")]
    EncryptFailed,

    #[error("decryption failed -- wrong key or corrupted ciphertext")]
    DecryptFailed,

    #[error("ciphertext too short: must be at least {} bytes", AES_NONCE_LENGTH + AES_TAG_LENGTH)]
    CiphertextTooShort,
}

/// Encrypt `plaintext` under `key`, authenticating `aad` alongside it.
///
/// Returns `nonce || ciphertext`.
///
/// # Example
///
/// ```
/// use deedchain::crypto::encryption::{open, seal};
///
/// let key = [0x42u8; 32];
/// let sealed = seal(&key, b"ledger bytes", b"ctx").unwrap();
/// assert_eq!(open(&key, &sealed, b"ctx").unwrap(), b"ledger bytes");
/// ```
pub fn seal(
    key: &[u8; AES_KEY_LENGTH],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, EncryptionError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| EncryptionError::EncryptFailed)?;

    let mut nonce_bytes = [0u8; AES_NONCE_LENGTH];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(
            nonce,
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| EncryptionError::EncryptFailed)?;

    let mut out = Vec::with_capacity(AES_NONCE_LENGTH + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt data previously produced by [`seal`] with the same key and AAD.
///
/// # Errors
///
/// Returns `EncryptionError::DecryptFailed` if the key is wrong, the AAD
/// differs, or the bytes were modified in any way.
pub fn open(
    key: &[u8; AES_KEY_LENGTH],
    data: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, EncryptionError> {
    if data.len() < AES_NONCE_LENGTH + AES_TAG_LENGTH {
        return Err(EncryptionError::CiphertextTooShort);
    }

    let (nonce_bytes, ciphertext) = data.split_at(AES_NONCE_LENGTH);
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| EncryptionError::DecryptFailed)?;
    let nonce = Nonce::from_slice(nonce_bytes);

    cipher
        .decrypt(
            nonce,
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| EncryptionError::DecryptFailed)
}
