//! Symmetric at-rest encryption for PII fields (§4.1: full_name,
//! identity_document).
//!
//! The key is loaded once at process startup from the secret store (an env
//! var in this workspace; see `cf-config`) and held only in memory. Startup
//! fails closed if the key is absent or under the minimum length — this
//! crate enforces the minimum length, `cf-config` enforces presence.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;
use thiserror::Error;

pub const MIN_KEY_BYTES: usize = 32;
const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("encryption key must be at least {MIN_KEY_BYTES} bytes, got {0}")]
    KeyTooShort(usize),
    #[error("ciphertext is truncated or malformed")]
    MalformedCiphertext,
    #[error("AEAD encryption failed")]
    EncryptFailed,
    #[error("AEAD decryption failed (wrong key or tampered ciphertext)")]
    DecryptFailed,
}

/// A process-wide symmetric key held only in memory. Never logged; `Debug`
/// is intentionally not derived so an accidental `{:?}` does not leak it.
pub struct EncryptionKey {
    cipher: Aes256Gcm,
}

impl EncryptionKey {
    /// Derive the AEAD cipher from raw key bytes. The first 32 bytes are
    /// used directly as the AES-256 key; callers must supply >= 32 bytes
    /// (validated at startup, fail-closed if absent).
    pub fn from_bytes(raw: &[u8]) -> Result<Self, CryptoError> {
        if raw.len() < MIN_KEY_BYTES {
            return Err(CryptoError::KeyTooShort(raw.len()));
        }
        let key = Key::<Aes256Gcm>::from_slice(&raw[..MIN_KEY_BYTES]);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }

    /// Encrypt `plaintext`, returning `nonce || ciphertext` as a single blob
    /// suitable for storage in a BYTEA column.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ct = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| CryptoError::EncryptFailed)?;

        let mut out = Vec::with_capacity(NONCE_LEN + ct.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ct);
        Ok(out)
    }

    pub fn encrypt_str(&self, plaintext: &str) -> Result<Vec<u8>, CryptoError> {
        self.encrypt(plaintext.as_bytes())
    }

    /// Decrypt a blob produced by `encrypt`. Only called when a row is
    /// surfaced through the API response helper (§4.1).
    pub fn decrypt(&self, blob: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if blob.len() < NONCE_LEN {
            return Err(CryptoError::MalformedCiphertext);
        }
        let (nonce_bytes, ct) = blob.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        self.cipher
            .decrypt(nonce, ct)
            .map_err(|_| CryptoError::DecryptFailed)
    }

    pub fn decrypt_to_string(&self, blob: &[u8]) -> Result<String, CryptoError> {
        let bytes = self.decrypt(blob)?;
        String::from_utf8(bytes).map_err(|_| CryptoError::MalformedCiphertext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> EncryptionKey {
        EncryptionKey::from_bytes(&[7u8; 32]).unwrap()
    }

    #[test]
    fn round_trip() {
        let key = test_key();
        let ct = key.encrypt_str("12345678Z").unwrap();
        let pt = key.decrypt_to_string(&ct).unwrap();
        assert_eq!(pt, "12345678Z");
    }

    #[test]
    fn rejects_short_key() {
        let err = match EncryptionKey::from_bytes(&[1u8; 16]) {
            Err(e) => e,
            Ok(_) => panic!("expected from_bytes to reject a short key"),
        };
        assert!(matches!(err, CryptoError::KeyTooShort(16)));
    }

    #[test]
    fn tampered_ciphertext_fails_closed() {
        let key = test_key();
        let mut ct = key.encrypt_str("Juan Garcia Lopez").unwrap();
        let last = ct.len() - 1;
        ct[last] ^= 0xFF;
        assert!(key.decrypt(&ct).is_err());
    }

    #[test]
    fn distinct_nonces_per_call() {
        let key = test_key();
        let a = key.encrypt_str("same plaintext").unwrap();
        let b = key.encrypt_str("same plaintext").unwrap();
        assert_ne!(a, b, "nonce must differ across calls");
    }
}
