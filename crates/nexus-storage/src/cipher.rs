//! The Cipher (C1): an AES-256-GCM AEAD wrapper used by every [`crate::Backend`]
//! variant and by the KEK manager to seal/open key material.
//!
//! # Security model
//!
//! - Every `seal` call generates a fresh 96-bit nonce via `OsRng`.
//! - Wire format: `nonce (12 bytes) || ciphertext || tag (16 bytes)`.
//! - Key derivation (when needed) uses HKDF-SHA256 with a unique `info` per
//!   purpose.
//! - Key material is zeroized on drop and never appears in `Debug` output.

use std::fmt;

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use hkdf::Hkdf;
use sha2::Sha256;
use tracing::warn;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

const MIN_CIPHERTEXT_LEN: usize = 12 + 16;
const NONCE_LEN: usize = 12;

/// A 256-bit AEAD key, zeroized on drop and redacted in `Debug`.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct CipherKey([u8; 32]);

impl CipherKey {
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub fn generate() -> Self {
        let key = Aes256Gcm::generate_key(OsRng);
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&key);
        Self(bytes)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// `true` iff every byte of the key is zero. Zero keys are accepted at
    /// cipher construction but are insecure and must be logged.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl fmt::Debug for CipherKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherKey").field("bytes", &"[REDACTED]").finish()
    }
}

/// An AEAD instance bound to one 256-bit key. Immutable after construction
/// and safe for concurrent use (per spec.md 5, "Cipher AEAD is immutable
/// post-construction").
#[derive(Debug, Clone)]
pub struct Cipher {
    key: CipherKey,
}

impl Cipher {
    /// Construct a cipher from raw key bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKeyLength`] if `bytes.len() != 32`.
    /// A zero key is accepted but logged as insecure.
    pub fn new(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != 32 {
            return Err(CryptoError::InvalidKeyLength { actual: bytes.len() });
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(bytes);
        let key = CipherKey::from_bytes(arr);
        if key.is_zero() {
            warn!("cipher constructed with an all-zero key; this is insecure");
        }
        Ok(Self { key })
    }

    #[must_use]
    pub fn from_key(key: CipherKey) -> Self {
        Self { key }
    }

    #[must_use]
    pub fn generate() -> Self {
        Self { key: CipherKey::generate() }
    }

    /// Seal `plaintext`, returning `nonce (12 bytes) || ciphertext || tag (16 bytes)`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Encryption`] if the AEAD operation fails.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(self.key.as_bytes()));
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| CryptoError::Encryption { reason: e.to_string() })?;

        let mut combined = Vec::with_capacity(NONCE_LEN.saturating_add(ciphertext.len()));
        combined.extend_from_slice(&nonce);
        combined.extend_from_slice(&ciphertext);
        Ok(combined)
    }

    /// Open a value produced by [`Cipher::seal`].
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::CiphertextTooShort`] if shorter than 28 bytes,
    /// or [`CryptoError::Decryption`] on authentication failure.
    pub fn open(&self, combined: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if combined.len() < MIN_CIPHERTEXT_LEN {
            return Err(CryptoError::CiphertextTooShort {
                expected: MIN_CIPHERTEXT_LEN,
                actual: combined.len(),
            });
        }

        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(self.key.as_bytes()));

        cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| CryptoError::Decryption { reason: e.to_string() })
    }
}

/// Derive a per-purpose key from a root key using HKDF-SHA256.
///
/// `info` must be unique per purpose (e.g. `b"nexus-kek-v1"`).
///
/// # Errors
///
/// Returns [`CryptoError::KeyDerivation`] if HKDF expansion fails.
pub fn derive_key(root_key: &CipherKey, salt: Option<&[u8]>, info: &[u8]) -> Result<CipherKey, CryptoError> {
    let hk = Hkdf::<Sha256>::new(salt, root_key.as_bytes());
    let mut derived = [0u8; 32];
    hk.expand(info, &mut derived).map_err(|e| CryptoError::KeyDerivation {
        context: String::from_utf8_lossy(info).into_owned(),
        reason: e.to_string(),
    })?;
    Ok(CipherKey::from_bytes(derived))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_roundtrip() {
        let cipher = Cipher::generate();
        let plaintext = b"secret data for nexus";
        let ciphertext = cipher.seal(plaintext).unwrap();
        let opened = cipher.open(&ciphertext).unwrap();
        assert_eq!(plaintext.as_slice(), opened.as_slice());
    }

    #[test]
    fn seal_open_empty_plaintext() {
        let cipher = Cipher::generate();
        let ciphertext = cipher.seal(b"").unwrap();
        let opened = cipher.open(&ciphertext).unwrap();
        assert!(opened.is_empty());
    }

    #[test]
    fn open_wrong_key_fails() {
        let cipher1 = Cipher::generate();
        let cipher2 = Cipher::generate();
        let ciphertext = cipher1.seal(b"secret").unwrap();
        assert!(cipher2.open(&ciphertext).is_err());
    }

    #[test]
    fn open_too_short_fails() {
        let cipher = Cipher::generate();
        let result = cipher.open(&[0u8; 10]);
        assert!(matches!(
            result,
            Err(CryptoError::CiphertextTooShort { expected: 28, actual: 10 })
        ));
    }

    #[test]
    fn open_tampered_ciphertext_fails() {
        let cipher = Cipher::generate();
        let mut ciphertext = cipher.seal(b"secret").unwrap();
        if let Some(byte) = ciphertext.get_mut(NONCE_LEN) {
            *byte ^= 0xFF;
        }
        assert!(matches!(cipher.open(&ciphertext), Err(CryptoError::Decryption { .. })));
    }

    #[test]
    fn two_seals_produce_different_ciphertext() {
        let cipher = Cipher::generate();
        let plaintext = b"same data";
        let ct1 = cipher.seal(plaintext).unwrap();
        let ct2 = cipher.seal(plaintext).unwrap();
        assert_ne!(ct1, ct2);
    }

    #[test]
    fn new_rejects_short_key() {
        let result = Cipher::new(&[0u8; 16]);
        assert!(matches!(result, Err(CryptoError::InvalidKeyLength { actual: 16 })));
    }

    #[test]
    fn new_accepts_zero_key() {
        let result = Cipher::new(&[0u8; 32]);
        assert!(result.is_ok());
    }

    #[test]
    fn derive_key_is_deterministic() {
        let root = CipherKey::generate();
        let salt = b"test-salt";
        let k1 = derive_key(&root, Some(salt), b"nexus-kek-v1").unwrap();
        let k2 = derive_key(&root, Some(salt), b"nexus-kek-v1").unwrap();
        assert_eq!(k1.as_bytes(), k2.as_bytes());
    }

    #[test]
    fn derive_key_differs_by_info() {
        let root = CipherKey::generate();
        let k1 = derive_key(&root, Some(b"salt"), b"nexus-kek-v1").unwrap();
        let k2 = derive_key(&root, Some(b"salt"), b"nexus-kv-v1").unwrap();
        assert_ne!(k1.as_bytes(), k2.as_bytes());
    }

    #[test]
    fn cipher_key_debug_redacts_bytes() {
        let key = CipherKey::generate();
        let debug = format!("{key:?}");
        assert!(debug.contains("[REDACTED]"));
    }
}
