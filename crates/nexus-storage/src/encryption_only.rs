//! Encryption-only [`Backend`]: holds no state. Every storage method is a
//! no-op that succeeds; the only thing this backend exposes is a [`Cipher`],
//! for deployments that use Nexus purely as "encryption as a service" while
//! payloads live in external object storage.

use async_trait::async_trait;

use crate::{Backend, BackendKind, Cipher, PolicyRow, SecretRow, StorageError};

pub struct EncryptionOnlyBackend {
    cipher: Cipher,
}

impl EncryptionOnlyBackend {
    #[must_use]
    pub fn new(cipher: Cipher) -> Self {
        Self { cipher }
    }
}

#[async_trait]
impl Backend for EncryptionOnlyBackend {
    async fn init(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn store_secret(&self, _row: &SecretRow) -> Result<(), StorageError> {
        Ok(())
    }

    async fn load_secret(&self, _path: &str) -> Result<Option<SecretRow>, StorageError> {
        Ok(None)
    }

    async fn load_all_secrets(&self) -> Result<Vec<SecretRow>, StorageError> {
        Ok(Vec::new())
    }

    async fn store_policy(&self, _row: &PolicyRow) -> Result<(), StorageError> {
        Ok(())
    }

    async fn load_policy(&self, _id: &str) -> Result<Option<PolicyRow>, StorageError> {
        Ok(None)
    }

    async fn load_all_policies(&self) -> Result<Vec<PolicyRow>, StorageError> {
        Ok(Vec::new())
    }

    async fn delete_policy(&self, _id: &str) -> Result<(), StorageError> {
        Ok(())
    }

    fn get_cipher(&self) -> &Cipher {
        &self.cipher
    }

    fn kind(&self) -> BackendKind {
        BackendKind::EncryptionOnly
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn load_secret_always_none() {
        let backend = EncryptionOnlyBackend::new(Cipher::generate());
        assert!(backend.load_secret("any/path").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn store_secret_is_a_no_op_success() {
        let backend = EncryptionOnlyBackend::new(Cipher::generate());
        let row = SecretRow {
            path: "x".into(),
            current_version: 1,
            oldest_version: 1,
            created_time: chrono::Utc::now(),
            updated_time: chrono::Utc::now(),
            versions: vec![],
        };
        assert!(backend.store_secret(&row).await.is_ok());
        assert!(backend.load_secret("x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cipher_round_trips_through_backend() {
        let backend = EncryptionOnlyBackend::new(Cipher::generate());
        let sealed = backend.get_cipher().seal(b"payload").unwrap();
        let opened = backend.get_cipher().open(&sealed).unwrap();
        assert_eq!(opened, b"payload");
    }
}
