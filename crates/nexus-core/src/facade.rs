//! State Facade (C10): the single entry point consumed by route handlers,
//! generalizing the teacher's `AppState` (`vaultrs-server/src/state.rs`)
//! per the "Global mutable singletons" design note — one `NexusCore`
//! aggregate owns every lock instead of a bag of `Arc`s glued together by
//! `main`. The facade is the only code allowed to mutate the in-memory
//! stores.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::RwLock;
use tracing::warn;

use nexus_storage::{Cipher, CipherKey, PolicyRow, SecretRow, SecretVersionRow};

use crate::access;
use crate::bootstrap::{self, BootstrapRequest};
use crate::error::NexusError;
use crate::kek::{KekManager, KekManagerConfig};
use crate::kv::{KvStore, SecretEntry};
use crate::persist::{PersistConfig, PersistLayer};
use crate::policy::{Permission, Policy, PolicyStore};

pub struct NexusCoreConfig {
    pub default_max_versions: u32,
    pub kek: KekManagerConfig,
    pub persist: PersistConfig,
    pub bootstrap_identity: String,
    pub rmk_version: u32,
}

/// The aggregate root. Owns the KV store, policy store, KEK manager,
/// persist layer, and the root key's own lock, per spec.md 5's
/// shared-resource policy.
pub struct NexusCore {
    kv: KvStore,
    policies: PolicyStore,
    kek: KekManager,
    persist: PersistLayer,
    root_key: RwLock<Option<CipherKey>>,
    rmk_cipher: RwLock<Option<Cipher>>,
    bootstrap_identity: String,
}

impl NexusCore {
    #[must_use]
    pub fn new(config: NexusCoreConfig, backend: std::sync::Arc<dyn nexus_storage::Backend>) -> Self {
        Self {
            kv: KvStore::new(config.default_max_versions),
            policies: PolicyStore::new(),
            kek: KekManager::new(config.kek, config.rmk_version),
            persist: PersistLayer::new(backend, config.persist),
            root_key: RwLock::new(None),
            rmk_cipher: RwLock::new(None),
            bootstrap_identity: config.bootstrap_identity,
        }
    }

    pub fn kek(&self) -> &KekManager {
        &self.kek
    }

    pub fn kv(&self) -> &KvStore {
        &self.kv
    }

    pub fn policies(&self) -> &PolicyStore {
        &self.policies
    }

    pub fn persist(&self) -> &PersistLayer {
        &self.persist
    }

    // ---- root key lifecycle --------------------------------------------

    /// `true` iff the root key has not yet been set.
    pub async fn root_key_zero(&self) -> bool {
        self.root_key.read().await.is_none()
    }

    /// Set the root key once. Fails with [`NexusError::AlreadyInitialized`]
    /// if already set.
    pub async fn set_root_key(&self, key: CipherKey) -> Result<(), NexusError> {
        let mut guard = self.root_key.write().await;
        if guard.is_some() {
            return Err(NexusError::AlreadyInitialized);
        }
        let mut cipher_guard = self.rmk_cipher.write().await;
        *cipher_guard = Some(Cipher::from_key(key.clone()));
        *guard = Some(key);
        Ok(())
    }

    async fn rmk_cipher(&self) -> Result<Cipher, NexusError> {
        self.rmk_cipher
            .read()
            .await
            .clone()
            .ok_or_else(|| NexusError::Internal("root key not yet set".into()))
    }

    // ---- secrets ---------------------------------------------------------

    pub async fn upsert_secret(&self, path: &str, data: HashMap<String, String>) -> Result<SecretEntry, NexusError> {
        let entry = self.kv.put(path, data).await?;
        self.persist_kv_entry(&entry).await?;
        Ok(entry)
    }

    pub async fn get_secret(&self, path: &str, version: u32) -> Result<HashMap<String, String>, NexusError> {
        self.kv.get(path, version).await
    }

    pub async fn delete_secret(&self, path: &str, versions: &[u32]) -> Result<(), NexusError> {
        self.kv.delete(path, versions).await?;
        let entry = self.kv.get_raw(path).await?;
        self.persist_kv_entry(&entry).await?;
        Ok(())
    }

    pub async fn undelete_secret(&self, path: &str, versions: &[u32]) -> Result<(), NexusError> {
        self.kv.undelete(path, versions).await?;
        let entry = self.kv.get_raw(path).await?;
        self.persist_kv_entry(&entry).await?;
        Ok(())
    }

    pub async fn list_keys(&self) -> Vec<String> {
        self.kv.list().await
    }

    pub async fn get_raw_secret(&self, path: &str) -> Result<SecretEntry, NexusError> {
        self.kv.get_raw(path).await
    }

    // ---- policies ----------------------------------------------------------

    pub async fn put_policy(&self, policy: Policy) -> Result<(), NexusError> {
        self.policies.put(policy.clone()).await?;
        let cipher = self.persist.backend().await.get_cipher().clone();
        let row = policy_to_row(&policy, &cipher)?;
        self.persist.persist_policy(row).await;
        Ok(())
    }

    pub async fn get_policy(&self, id: &str) -> Option<Policy> {
        self.policies.get(id).await
    }

    pub async fn list_policies(&self) -> Vec<Policy> {
        self.policies.list().await
    }

    pub async fn delete_policy(&self, id: &str) -> Result<(), NexusError> {
        self.policies.delete(id).await;
        self.persist.delete_policy(id.to_owned()).await;
        Ok(())
    }

    pub async fn check_access(&self, spiffe_id: &str, path: &str, required: &HashSet<Permission>) -> bool {
        let policies = self.policies.list().await;
        access::check_access(&policies, spiffe_id, path, required)
    }

    // ---- bootstrap -----------------------------------------------------

    pub async fn bootstrap_verify(&self, caller_identity: &str, request: &BootstrapRequest) -> Result<String, NexusError> {
        let cipher = self.rmk_cipher().await?;
        bootstrap::verify(caller_identity, &self.bootstrap_identity, &cipher, request)
    }

    // ---- startup / shutdown --------------------------------------------

    /// Rebuild in-memory state from the Backend at startup.
    pub async fn rehydrate(&self) -> Result<(), NexusError> {
        let rows = self.persist.load_all_secrets().await;
        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            match self.row_to_kv_entry(&row).await {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(path = row.path, error = %e, "failed to rehydrate secret; skipping"),
            }
        }
        self.kv.load_snapshot(entries).await;

        let cipher = self.persist.backend().await.get_cipher().clone();
        let policy_rows = self.persist.load_all_policies().await;
        let mut policies = Vec::with_capacity(policy_rows.len());
        for row in policy_rows {
            match row_to_policy(&row, &cipher) {
                Ok(policy) => policies.push(policy),
                Err(e) => warn!(id = row.id, error = %e, "failed to rehydrate policy; skipping"),
            }
        }
        self.policies.load_snapshot(policies).await;
        Ok(())
    }

    /// Health probe against the Backend. Panics inside the backend call are
    /// caught and reported as unavailable rather than crashing the process
    /// (spec.md 5).
    pub async fn health_check(&self) -> bool {
        const HEALTH_PROBE_PATH: &str = "\0health/nexus-probe";
        let backend = self.persist.backend().await;
        let result = AssertUnwindSafe(backend.load_secret(HEALTH_PROBE_PATH)).catch_unwind().await;
        matches!(result, Ok(Ok(_)))
    }

    // ---- sweeper support -------------------------------------------------

    /// Paths whose stored versions reference a KEK other than `active_id`,
    /// and the set of non-active KEK ids still referenced by any live
    /// version anywhere in storage.
    pub async fn scan_non_active_kek_usage(&self, active_id: &str) -> (Vec<String>, HashSet<String>) {
        let rows = self.persist.load_all_secrets().await;
        let mut stale_paths = Vec::new();
        let mut referenced = HashSet::new();

        for row in &rows {
            let mut path_is_stale = false;
            for version in &row.versions {
                if version.deleted_time.is_none() && version.kek_id != active_id {
                    path_is_stale = true;
                    referenced.insert(version.kek_id.clone());
                }
            }
            if path_is_stale {
                stale_paths.push(row.path.clone());
            }
        }
        (stale_paths, referenced)
    }

    /// Re-seal every version of `path` currently bound to a non-active KEK
    /// under the active KEK, then re-store it.
    pub async fn rewrap_path(&self, path: &str) -> Result<(), NexusError> {
        let Some(mut row) = self.persist.load_secret(path).await else {
            return Err(NexusError::NotFound(path.to_owned()));
        };
        let active_id = self.kek.current_kek_id().await;

        for version in &mut row.versions {
            if version.kek_id == active_id {
                continue;
            }
            let mut combined = version.nonce.clone();
            combined.extend_from_slice(&version.ciphertext);
            let plaintext = self.kek.unwrap(&version.kek_id, &combined).await?;
            let (new_kek_id, new_ciphertext) = self.kek.wrap(&plaintext).await?;
            let (nonce, ciphertext) = new_ciphertext.split_at(12);
            version.nonce = nonce.to_vec();
            version.ciphertext = ciphertext.to_vec();
            version.kek_id = new_kek_id;
        }

        self.persist.persist_secret(row).await;
        Ok(())
    }

    // ---- internal conversion helpers -----------------------------------

    async fn persist_kv_entry(&self, entry: &SecretEntry) -> Result<(), NexusError> {
        let row = self.kv_entry_to_row(entry).await?;
        self.persist.persist_secret(row).await;
        Ok(())
    }

    /// Build the row to persist for `entry`, re-wrapping only versions that
    /// have no prior persisted counterpart. A version already stored under
    /// the active KEK — untouched by a `delete`/`undelete` on some other
    /// version, or simply carried forward unchanged — keeps its existing
    /// `kek_id`/nonce/ciphertext. Re-wrapping everything on every write would
    /// both inflate `wraps_count` per version touched (spec.md 4.7) and
    /// bypass the Sweeper's rate-limited lazy rewrap (spec.md 4.8) for any
    /// actively-written path, the way `rewrap_path` above is the deliberate,
    /// rate-limited place that re-seals old-KEK versions.
    async fn kv_entry_to_row(&self, entry: &SecretEntry) -> Result<SecretRow, NexusError> {
        let existing = self.persist.load_secret(&entry.path).await;
        let mut existing_versions: HashMap<u32, SecretVersionRow> =
            existing.map(|row| row.versions.into_iter().map(|v| (v.version, v)).collect()).unwrap_or_default();

        let mut versions = Vec::with_capacity(entry.versions.len());
        for version in entry.versions.values() {
            if let Some(mut stored) = existing_versions.remove(&version.version) {
                stored.deleted_time = version.deleted_time;
                versions.push(stored);
                continue;
            }

            let plaintext = serde_json::to_vec(&version.data)
                .map_err(|e| NexusError::Internal(format!("failed to serialize secret data: {e}")))?;
            let (kek_id, combined) = self.kek.wrap(&plaintext).await?;
            let (nonce, ciphertext) = combined.split_at(12);
            versions.push(SecretVersionRow {
                version: version.version,
                nonce: nonce.to_vec(),
                ciphertext: ciphertext.to_vec(),
                kek_id,
                created_time: version.created_time,
                deleted_time: version.deleted_time,
            });
        }
        Ok(SecretRow {
            path: entry.path.clone(),
            current_version: entry.current_version,
            oldest_version: entry.oldest_version,
            created_time: entry.created_time,
            updated_time: entry.updated_time,
            versions,
        })
    }

    async fn row_to_kv_entry(&self, row: &SecretRow) -> Result<SecretEntry, NexusError> {
        let mut versions = std::collections::BTreeMap::new();
        for version in &row.versions {
            let mut combined = version.nonce.clone();
            combined.extend_from_slice(&version.ciphertext);
            let plaintext = self.kek.unwrap(&version.kek_id, &combined).await?;
            let data: HashMap<String, String> = serde_json::from_slice(&plaintext)
                .map_err(|e| NexusError::Internal(format!("corrupt secret data for {}: {e}", row.path)))?;
            versions.insert(
                version.version,
                crate::kv::SecretVersion {
                    version: version.version,
                    data,
                    created_time: version.created_time,
                    deleted_time: version.deleted_time,
                },
            );
        }
        Ok(SecretEntry {
            path: row.path.clone(),
            current_version: row.current_version,
            oldest_version: row.oldest_version,
            created_time: row.created_time,
            updated_time: row.updated_time,
            max_versions: 10,
            versions,
        })
    }
}

fn policy_to_row(policy: &Policy, cipher: &Cipher) -> Result<PolicyRow, NexusError> {
    let permissions_json = serde_json::to_vec(&policy.permissions)
        .map_err(|e| NexusError::Internal(format!("failed to serialize permissions: {e}")))?;
    Ok(PolicyRow {
        id: policy.id.clone(),
        name: policy.name.clone(),
        encrypted_spiffe_id: cipher.seal(policy.spiffe_id_pattern.as_bytes()).map_err(NexusError::from)?,
        encrypted_path: cipher.seal(policy.path_pattern.as_bytes()).map_err(NexusError::from)?,
        encrypted_permissions: cipher.seal(&permissions_json).map_err(NexusError::from)?,
        created_at: policy.created_at,
    })
}

fn row_to_policy(row: &PolicyRow, cipher: &Cipher) -> Result<Policy, NexusError> {
    let spiffe_id_pattern = String::from_utf8(cipher.open(&row.encrypted_spiffe_id).map_err(NexusError::from)?)
        .map_err(|e| NexusError::Internal(format!("corrupt policy spiffe pattern: {e}")))?;
    let path_pattern = String::from_utf8(cipher.open(&row.encrypted_path).map_err(NexusError::from)?)
        .map_err(|e| NexusError::Internal(format!("corrupt policy path pattern: {e}")))?;
    let permissions_json = cipher.open(&row.encrypted_permissions).map_err(NexusError::from)?;
    let permissions = serde_json::from_slice(&permissions_json)
        .map_err(|e| NexusError::Internal(format!("corrupt policy permissions: {e}")))?;

    Ok(Policy {
        id: row.id.clone(),
        name: row.name.clone(),
        spiffe_id_pattern,
        path_pattern,
        permissions,
        created_at: row.created_at,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use nexus_storage::memory::MemoryBackend;
    use std::sync::Arc;

    fn core() -> NexusCore {
        let backend = Arc::new(MemoryBackend::new(Cipher::generate()));
        NexusCore::new(
            NexusCoreConfig {
                default_max_versions: 10,
                kek: KekManagerConfig::default(),
                persist: PersistConfig::default(),
                bootstrap_identity: "spiffe://t/bootstrap".into(),
                rmk_version: 1,
            },
            backend,
        )
    }

    fn data(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| ((*k).to_owned(), (*v).to_owned())).collect()
    }

    #[tokio::test]
    async fn upsert_then_get_round_trips_through_persistence() {
        let core = core();
        core.upsert_secret("app/db", data(&[("u", "a")])).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        core.rehydrate().await.unwrap();
        let got = core.get_secret("app/db", 0).await.unwrap();
        assert_eq!(got.get("u"), Some(&"a".to_owned()));
    }

    #[tokio::test]
    async fn put_policy_then_get_round_trips_through_persistence() {
        let core = core();
        let policy = Policy {
            id: "p1".into(),
            name: "p1".into(),
            spiffe_id_pattern: "^spiffe://t/app/.*$".into(),
            path_pattern: "^app/.*$".into(),
            permissions: HashSet::from([Permission::Read]),
            created_at: Utc::now(),
        };
        core.put_policy(policy).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        core.rehydrate().await.unwrap();
        let got = core.get_policy("p1").await.unwrap();
        assert_eq!(got.spiffe_id_pattern, "^spiffe://t/app/.*$");
    }

    #[tokio::test]
    async fn set_root_key_twice_fails() {
        let core = core();
        core.set_root_key(CipherKey::generate()).await.unwrap();
        assert!(matches!(core.set_root_key(CipherKey::generate()).await, Err(NexusError::AlreadyInitialized)));
    }

    #[tokio::test]
    async fn bootstrap_verify_end_to_end() {
        let core = core();
        core.set_root_key(CipherKey::generate()).await.unwrap();
        let cipher = core.rmk_cipher().await.unwrap();
        let sealed = cipher.seal(b"hello").unwrap();
        let (nonce, ciphertext) = sealed.split_at(12);
        let req = BootstrapRequest { nonce: nonce.to_vec(), ciphertext: ciphertext.to_vec() };
        let digest = core.bootstrap_verify("spiffe://t/bootstrap", &req).await.unwrap();
        assert_eq!(digest.len(), 64);
    }

    #[tokio::test]
    async fn rewrap_path_updates_kek_id_after_rotation() {
        let core = core();
        core.upsert_secret("app/db", data(&[("u", "a")])).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        core.kek.rotate().await.unwrap();
        let active_id = core.kek.current_kek_id().await;
        let (stale, _) = core.scan_non_active_kek_usage(&active_id).await;
        assert_eq!(stale, vec!["app/db".to_owned()]);

        core.rewrap_path("app/db").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let (stale_after, _) = core.scan_non_active_kek_usage(&active_id).await;
        assert!(stale_after.is_empty());
    }

    #[tokio::test]
    async fn second_write_only_wraps_the_new_version() {
        let core = core();
        core.upsert_secret("app/db", data(&[("u", "a")])).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let active_id = core.kek.current_kek_id().await;
        let wraps_after_first = core.kek.info(&active_id).await.unwrap().wraps_count;
        assert_eq!(wraps_after_first, 1);

        core.upsert_secret("app/db", data(&[("u", "b")])).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let wraps_after_second = core.kek.info(&active_id).await.unwrap().wraps_count;
        assert_eq!(wraps_after_second, 2);

        let row = core.persist.load_secret("app/db").await.unwrap();
        assert_eq!(row.versions.len(), 2);
    }

    #[tokio::test]
    async fn delete_and_undelete_do_not_rewrap_any_version() {
        let core = core();
        core.upsert_secret("app/db", data(&[("u", "a")])).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let active_id = core.kek.current_kek_id().await;
        let wraps_before = core.kek.info(&active_id).await.unwrap().wraps_count;

        core.delete_secret("app/db", &[1]).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        core.undelete_secret("app/db", &[1]).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let wraps_after = core.kek.info(&active_id).await.unwrap().wraps_count;
        assert_eq!(wraps_before, wraps_after);
    }

    #[tokio::test]
    async fn health_check_reports_ok_on_fresh_backend() {
        let core = core();
        assert!(core.health_check().await);
    }
}
