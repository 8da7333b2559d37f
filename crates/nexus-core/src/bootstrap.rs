//! Bootstrap Verifier (C9): proof-of-possession protocol over the root
//! cipher, called once at startup by a trusted bootstrap identity to prove
//! the service has the correct RMK. Built from [`nexus_storage::Cipher`]
//! plus `sha2::Sha256`, the same digest primitive the teacher already uses
//! for token hashing (`vaultrs-core/src/token.rs::hash_token`).

use nexus_storage::Cipher;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::NexusError;

const MAX_NONCE_LEN: usize = 12;
const MAX_CIPHERTEXT_LEN: usize = 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapRequest {
    pub nonce: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

/// Verify a proof-of-possession request.
///
/// # Errors
///
/// - [`NexusError::Unauthorized`] if `caller_identity != bootstrap_identity`.
/// - [`NexusError::BadInput`] if `nonce.len() != 12` or
///   `ciphertext.len() > 1024`.
/// - [`NexusError::Internal`] if the cipher fails to open the ciphertext.
pub fn verify(
    caller_identity: &str,
    bootstrap_identity: &str,
    cipher: &Cipher,
    request: &BootstrapRequest,
) -> Result<String, NexusError> {
    if caller_identity != bootstrap_identity {
        return Err(NexusError::Unauthorized(format!("{caller_identity} is not the bootstrap identity")));
    }
    if request.nonce.len() != MAX_NONCE_LEN {
        return Err(NexusError::BadInput(format!(
            "nonce must be exactly {MAX_NONCE_LEN} bytes, got {}",
            request.nonce.len()
        )));
    }
    if request.ciphertext.len() > MAX_CIPHERTEXT_LEN {
        return Err(NexusError::BadInput(format!(
            "ciphertext must be at most {MAX_CIPHERTEXT_LEN} bytes, got {}",
            request.ciphertext.len()
        )));
    }

    let mut combined = Vec::with_capacity(request.nonce.len() + request.ciphertext.len());
    combined.extend_from_slice(&request.nonce);
    combined.extend_from_slice(&request.ciphertext);

    let plaintext = cipher
        .open(&combined)
        .map_err(|e| NexusError::Internal(format!("bootstrap cipher open failed: {e}")))?;

    Ok(hex::encode(Sha256::digest(&plaintext)))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn correct_identity_and_payload_returns_digest() {
        let cipher = Cipher::generate();
        let sealed = cipher.seal(b"hello").unwrap();
        let (nonce, ciphertext) = sealed.split_at(12);
        let req = BootstrapRequest { nonce: nonce.to_vec(), ciphertext: ciphertext.to_vec() };

        let digest = verify("spiffe://t/bootstrap", "spiffe://t/bootstrap", &cipher, &req).unwrap();
        let expected = hex::encode(Sha256::digest(b"hello"));
        assert_eq!(digest, expected);
    }

    #[test]
    fn non_bootstrap_identity_is_unauthorized() {
        let cipher = Cipher::generate();
        let sealed = cipher.seal(b"hello").unwrap();
        let (nonce, ciphertext) = sealed.split_at(12);
        let req = BootstrapRequest { nonce: nonce.to_vec(), ciphertext: ciphertext.to_vec() };

        let result = verify("spiffe://t/other", "spiffe://t/bootstrap", &cipher, &req);
        assert!(matches!(result, Err(NexusError::Unauthorized(_))));
    }

    #[test]
    fn wrong_size_nonce_is_bad_input() {
        let cipher = Cipher::generate();
        let req = BootstrapRequest { nonce: vec![0u8; 13], ciphertext: vec![0u8; 16] };
        let result = verify("spiffe://t/bootstrap", "spiffe://t/bootstrap", &cipher, &req);
        assert!(matches!(result, Err(NexusError::BadInput(_))));
    }

    #[test]
    fn oversized_ciphertext_is_bad_input() {
        let cipher = Cipher::generate();
        let req = BootstrapRequest { nonce: vec![0u8; 12], ciphertext: vec![0u8; MAX_CIPHERTEXT_LEN + 1] };
        let result = verify("spiffe://t/bootstrap", "spiffe://t/bootstrap", &cipher, &req);
        assert!(matches!(result, Err(NexusError::BadInput(_))));
    }
}
