//! In-memory [`Backend`]: holds already-sealed secret rows and policy rows
//! in ordinary maps, guarded by a reader/writer lock. Used for tests and for
//! deployments that accept volatile state in exchange for no I/O.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::{Backend, BackendKind, Cipher, PolicyRow, SecretRow, StorageError};

pub struct MemoryBackend {
    cipher: Cipher,
    secrets: RwLock<BTreeMap<String, SecretRow>>,
    policies: RwLock<BTreeMap<String, PolicyRow>>,
}

impl MemoryBackend {
    #[must_use]
    pub fn new(cipher: Cipher) -> Self {
        Self { cipher, secrets: RwLock::new(BTreeMap::new()), policies: RwLock::new(BTreeMap::new()) }
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn init(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn store_secret(&self, row: &SecretRow) -> Result<(), StorageError> {
        self.secrets.write().await.insert(row.path.clone(), row.clone());
        Ok(())
    }

    async fn load_secret(&self, path: &str) -> Result<Option<SecretRow>, StorageError> {
        Ok(self.secrets.read().await.get(path).cloned())
    }

    async fn load_all_secrets(&self) -> Result<Vec<SecretRow>, StorageError> {
        Ok(self.secrets.read().await.values().cloned().collect())
    }

    async fn store_policy(&self, row: &PolicyRow) -> Result<(), StorageError> {
        self.policies.write().await.insert(row.id.clone(), row.clone());
        Ok(())
    }

    async fn load_policy(&self, id: &str) -> Result<Option<PolicyRow>, StorageError> {
        Ok(self.policies.read().await.get(id).cloned())
    }

    async fn load_all_policies(&self) -> Result<Vec<PolicyRow>, StorageError> {
        Ok(self.policies.read().await.values().cloned().collect())
    }

    async fn delete_policy(&self, id: &str) -> Result<(), StorageError> {
        self.policies.write().await.remove(id);
        Ok(())
    }

    fn get_cipher(&self) -> &Cipher {
        &self.cipher
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn backend() -> MemoryBackend {
        MemoryBackend::new(Cipher::generate())
    }

    fn row(path: &str) -> SecretRow {
        SecretRow {
            path: path.to_owned(),
            current_version: 1,
            oldest_version: 1,
            created_time: chrono::Utc::now(),
            updated_time: chrono::Utc::now(),
            versions: vec![],
        }
    }

    #[tokio::test]
    async fn store_then_load_round_trips() {
        let backend = backend();
        backend.store_secret(&row("app/db")).await.unwrap();
        let loaded = backend.load_secret("app/db").await.unwrap();
        assert_eq!(loaded.unwrap().path, "app/db");
    }

    #[tokio::test]
    async fn load_missing_returns_none() {
        let backend = backend();
        assert!(backend.load_secret("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_policy_nonexistent_succeeds() {
        let backend = backend();
        assert!(backend.delete_policy("nope").await.is_ok());
    }

    #[tokio::test]
    async fn load_all_secrets_returns_every_row() {
        let backend = backend();
        backend.store_secret(&row("a")).await.unwrap();
        backend.store_secret(&row("b")).await.unwrap();
        assert_eq!(backend.load_all_secrets().await.unwrap().len(), 2);
    }
}
