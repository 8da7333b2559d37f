//! Storage and cipher error types shared by every backend variant.

use thiserror::Error;

/// Errors surfaced by [`crate::Cipher`] construction and seal/open calls.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("key must be exactly 32 bytes, got {actual}")]
    InvalidKeyLength { actual: usize },

    #[error("encryption failed: {reason}")]
    Encryption { reason: String },

    #[error("decryption failed: {reason}")]
    Decryption { reason: String },

    #[error("ciphertext too short: expected at least {expected} bytes, got {actual}")]
    CiphertextTooShort { expected: usize, actual: usize },

    #[error("key derivation failed for {context}: {reason}")]
    KeyDerivation { context: String, reason: String },
}

/// Errors surfaced by a [`crate::Backend`] implementation.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("cancelled")]
    Cancelled,

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("bad input: {0}")]
    BadInput(String),

    #[error("internal storage error: {0}")]
    Internal(String),
}
