//! Versioned KV (C2): in-memory mapping of path → versioned secret with
//! soft-delete, guarded by a single reader/writer lock. Generalizes the
//! teacher's `KvEngine`/`KvSecret`/`KvVersion` (`vaultrs-core/src/engine.rs`)
//! with explicit `oldest_version` tracking, `undelete`, and live-version-aware
//! pruning.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::NexusError;

/// One version of a secret's data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretVersion {
    pub version: u32,
    pub data: HashMap<String, String>,
    pub created_time: DateTime<Utc>,
    pub deleted_time: Option<DateTime<Utc>>,
}

impl SecretVersion {
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.deleted_time.is_none()
    }
}

/// A path-addressed secret: metadata plus a map of version number → data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretEntry {
    pub path: String,
    pub current_version: u32,
    pub oldest_version: u32,
    pub created_time: DateTime<Utc>,
    pub updated_time: DateTime<Utc>,
    pub max_versions: u32,
    pub versions: BTreeMap<u32, SecretVersion>,
}

impl SecretEntry {
    fn live_versions(&self) -> impl Iterator<Item = &SecretVersion> {
        self.versions.values().filter(|v| v.is_live())
    }

    fn highest_live_version(&self) -> u32 {
        self.live_versions().map(|v| v.version).max().unwrap_or(0)
    }
}

const DEFAULT_MAX_VERSIONS: u32 = 10;

/// In-memory versioned secret store. All operations acquire the store's
/// single reader/writer lock; there is no per-path lock (spec.md 4.2:
/// "all guarded by a single reader/writer lock").
pub struct KvStore {
    inner: RwLock<BTreeMap<String, SecretEntry>>,
    default_max_versions: u32,
}

impl Default for KvStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_VERSIONS)
    }
}

impl KvStore {
    #[must_use]
    pub fn new(default_max_versions: u32) -> Self {
        Self { inner: RwLock::new(BTreeMap::new()), default_max_versions }
    }

    /// Rebuild state from a snapshot loaded from the Backend at startup.
    pub async fn load_snapshot(&self, entries: Vec<SecretEntry>) {
        let mut guard = self.inner.write().await;
        for entry in entries {
            guard.insert(entry.path.clone(), entry);
        }
    }

    /// Create a new version = `current_version + 1`. If live versions now
    /// exceed `max_versions`, the lowest-numbered live version is dropped
    /// and `oldest_version` advances.
    pub async fn put(&self, path: &str, data: HashMap<String, String>) -> Result<SecretEntry, NexusError> {
        let now = Utc::now();
        let mut guard = self.inner.write().await;

        let entry = guard.entry(path.to_owned()).or_insert_with(|| SecretEntry {
            path: path.to_owned(),
            current_version: 0,
            oldest_version: 1,
            created_time: now,
            updated_time: now,
            max_versions: self.default_max_versions,
            versions: BTreeMap::new(),
        });

        let new_version = entry.current_version.saturating_add(1);
        entry.versions.insert(
            new_version,
            SecretVersion { version: new_version, data, created_time: now, deleted_time: None },
        );
        entry.current_version = new_version;
        entry.updated_time = now;

        let live_count = entry.live_versions().count() as u32;
        if live_count > entry.max_versions {
            if let Some(lowest) = entry.live_versions().map(|v| v.version).min() {
                entry.versions.remove(&lowest);
            }
            entry.oldest_version =
                entry.versions.keys().copied().min().unwrap_or(entry.current_version);
        }

        Ok(entry.clone())
    }

    /// `version == 0` means current.
    pub async fn get(&self, path: &str, version: u32) -> Result<HashMap<String, String>, NexusError> {
        let guard = self.inner.read().await;
        let entry = guard.get(path).ok_or_else(|| NexusError::NotFound(path.to_owned()))?;

        let target = if version == 0 { entry.current_version } else { version };
        if target == 0 {
            return Err(NexusError::NotFound(format!("{path} has no live version")));
        }
        let secret_version = entry
            .versions
            .get(&target)
            .ok_or_else(|| NexusError::NotFound(format!("{path}#{target}")))?;

        if secret_version.deleted_time.is_some() {
            return Err(NexusError::SoftDeleted);
        }
        Ok(secret_version.data.clone())
    }

    /// Empty `versions` means "delete current version only". Idempotent for
    /// already-deleted versions.
    pub async fn delete(&self, path: &str, versions: &[u32]) -> Result<(), NexusError> {
        let now = Utc::now();
        let mut guard = self.inner.write().await;
        let entry = guard.get_mut(path).ok_or_else(|| NexusError::NotFound(path.to_owned()))?;

        let targets: Vec<u32> = if versions.is_empty() {
            if entry.current_version == 0 {
                Vec::new()
            } else {
                vec![entry.current_version]
            }
        } else {
            versions.to_vec()
        };

        for v in targets {
            if let Some(version) = entry.versions.get_mut(&v) {
                if version.deleted_time.is_none() {
                    version.deleted_time = Some(now);
                }
            }
        }

        entry.current_version = entry.highest_live_version();
        entry.updated_time = now;
        Ok(())
    }

    /// Clears `deleted_time` for each listed version that exists. A version
    /// number that never existed is a no-op.
    pub async fn undelete(&self, path: &str, versions: &[u32]) -> Result<(), NexusError> {
        let now = Utc::now();
        let mut guard = self.inner.write().await;
        let entry = guard.get_mut(path).ok_or_else(|| NexusError::NotFound(path.to_owned()))?;

        for v in versions {
            if let Some(version) = entry.versions.get_mut(v) {
                version.deleted_time = None;
            }
        }

        entry.current_version = entry.highest_live_version();
        entry.updated_time = now;
        Ok(())
    }

    /// All known paths, including logically empty ones, lexicographically
    /// ordered.
    pub async fn list(&self) -> Vec<String> {
        self.inner.read().await.keys().cloned().collect()
    }

    /// The whole versioned object, used by the Persist Layer for
    /// write-through.
    pub async fn get_raw(&self, path: &str) -> Result<SecretEntry, NexusError> {
        self.inner
            .read()
            .await
            .get(path)
            .cloned()
            .ok_or_else(|| NexusError::NotFound(path.to_owned()))
    }

    /// Live version numbers for `path`, ascending.
    pub async fn list_versions(&self, path: &str) -> Result<Vec<u32>, NexusError> {
        let guard = self.inner.read().await;
        let entry = guard.get(path).ok_or_else(|| NexusError::NotFound(path.to_owned()))?;
        Ok(entry.live_versions().map(|v| v.version).collect())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn data(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| ((*k).to_owned(), (*v).to_owned())).collect()
    }

    #[tokio::test]
    async fn put_get_delete_undelete_round_trip() {
        let kv = KvStore::default();
        kv.put("app/db", data(&[("u", "a"), ("p", "b")])).await.unwrap();
        let got = kv.get("app/db", 0).await.unwrap();
        assert_eq!(got.get("u"), Some(&"a".to_owned()));

        kv.delete("app/db", &[]).await.unwrap();
        assert!(matches!(kv.get("app/db", 0).await, Err(NexusError::SoftDeleted)));

        kv.undelete("app/db", &[1]).await.unwrap();
        let got = kv.get("app/db", 0).await.unwrap();
        assert_eq!(got.get("u"), Some(&"a".to_owned()));
    }

    #[tokio::test]
    async fn max_versions_prunes_lowest_live_version() {
        let kv = KvStore::new(3);
        for i in 1..=4 {
            kv.put("app/db", data(&[("n", &i.to_string())])).await.unwrap();
        }
        let mut versions = kv.list_versions("app/db").await.unwrap();
        versions.sort_unstable();
        assert_eq!(versions, vec![2, 3, 4]);

        assert!(kv.get("app/db", 2).await.is_ok());
        assert!(matches!(kv.get("app/db", 1).await, Err(NexusError::NotFound(_))));
    }

    #[tokio::test]
    async fn get_nonexistent_path_is_not_found() {
        let kv = KvStore::default();
        assert!(matches!(kv.get("nope", 0).await, Err(NexusError::NotFound(_))));
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let kv = KvStore::default();
        kv.put("app/db", data(&[("a", "1")])).await.unwrap();
        kv.delete("app/db", &[1]).await.unwrap();
        assert!(kv.delete("app/db", &[1]).await.is_ok());
    }

    #[tokio::test]
    async fn undelete_never_existed_version_is_a_no_op() {
        let kv = KvStore::default();
        kv.put("app/db", data(&[("a", "1")])).await.unwrap();
        assert!(kv.undelete("app/db", &[99]).await.is_ok());
        assert!(kv.get("app/db", 0).await.is_ok());
    }

    #[tokio::test]
    async fn list_includes_logically_empty_paths() {
        let kv = KvStore::default();
        kv.put("app/db", data(&[("a", "1")])).await.unwrap();
        kv.delete("app/db", &[]).await.unwrap();
        assert_eq!(kv.list().await, vec!["app/db".to_owned()]);
    }

    #[tokio::test]
    async fn version_never_exceeds_current_version() {
        let kv = KvStore::new(5);
        for i in 1..=3 {
            kv.put("p", data(&[("i", &i.to_string())])).await.unwrap();
        }
        let raw = kv.get_raw("p").await.unwrap();
        for (version, _) in &raw.versions {
            assert!(*version <= raw.current_version);
        }
    }
}
