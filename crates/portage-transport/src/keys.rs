//! Passphrase-to-key derivation.
//!
//! Both peers derive the same 256-bit cipher key from the shared passphrase:
//! SHA-256 normalizes the passphrase, then PBKDF2-HMAC-SHA256 stretches it
//! with a fixed salt and iteration count. Fixed parameters keep derivation
//! reproducible without exchanging any session material; the threat model is
//! a shared secret between trusted peers, not password storage.

use pbkdf2::pbkdf2_hmac;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Fixed KDF salt, identical on every peer.
pub const KEY_SALT: &[u8] = b"portage-file-transfer";

/// Fixed PBKDF2 iteration count.
pub const KDF_ITERATIONS: u32 = 4096;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("passphrase must not be empty")]
    EmptyPassphrase,
}

/// Derive the 256-bit transport cipher key from a passphrase.
pub fn derive_key(passphrase: &str) -> Result<[u8; 32], KeyError> {
    if passphrase.is_empty() {
        return Err(KeyError::EmptyPassphrase);
    }
    let normalized = Sha256::digest(passphrase.as_bytes());
    let mut key = [0u8; 32];
    pbkdf2_hmac::<Sha256>(&normalized, KEY_SALT, KDF_ITERATIONS, &mut key);
    Ok(key)
}
