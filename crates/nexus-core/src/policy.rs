//! Policy Store (C3): a keyed map of named access policies, generalizing
//! the teacher's `PolicyStore` (`vaultrs-core/src/policy.rs`) from
//! glob-path rules to anchored regex patterns over identity and path.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::NexusError;

/// A permission a policy can grant. `Super` satisfies every requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    Read,
    Write,
    List,
    Super,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    pub id: String,
    pub name: String,
    pub spiffe_id_pattern: String,
    pub path_pattern: String,
    pub permissions: HashSet<Permission>,
    pub created_at: DateTime<Utc>,
}

/// Keyed map `id → Policy` under a dedicated reader/writer lock.
#[derive(Default)]
pub struct PolicyStore {
    inner: RwLock<HashMap<String, Policy>>,
}

impl PolicyStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn load_snapshot(&self, policies: Vec<Policy>) {
        let mut guard = self.inner.write().await;
        for policy in policies {
            guard.insert(policy.id.clone(), policy);
        }
    }

    /// Requires a non-empty id; overwrites an existing policy of the same
    /// id.
    pub async fn put(&self, policy: Policy) -> Result<(), NexusError> {
        if policy.id.is_empty() {
            return Err(NexusError::BadInput("policy id must not be empty".into()));
        }
        self.inner.write().await.insert(policy.id.clone(), policy);
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Option<Policy> {
        self.inner.read().await.get(id).cloned()
    }

    pub async fn list(&self) -> Vec<Policy> {
        self.inner.read().await.values().cloned().collect()
    }

    /// Deleting a nonexistent id succeeds.
    pub async fn delete(&self, id: &str) {
        self.inner.write().await.remove(id);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn policy(id: &str) -> Policy {
        Policy {
            id: id.to_owned(),
            name: id.to_owned(),
            spiffe_id_pattern: "^spiffe://t/app/.*$".into(),
            path_pattern: "^app/.*$".into(),
            permissions: HashSet::from([Permission::Read]),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn put_requires_non_empty_id() {
        let store = PolicyStore::new();
        assert!(matches!(store.put(policy("")).await, Err(NexusError::BadInput(_))));
    }

    #[tokio::test]
    async fn put_overwrites_existing() {
        let store = PolicyStore::new();
        store.put(policy("p1")).await.unwrap();
        let mut updated = policy("p1");
        updated.name = "renamed".into();
        store.put(updated).await.unwrap();
        assert_eq!(store.get("p1").await.unwrap().name, "renamed");
    }

    #[tokio::test]
    async fn delete_nonexistent_succeeds() {
        let store = PolicyStore::new();
        store.delete("nope").await;
    }

    #[tokio::test]
    async fn list_returns_all_policies() {
        let store = PolicyStore::new();
        store.put(policy("p1")).await.unwrap();
        store.put(policy("p2")).await.unwrap();
        assert_eq!(store.list().await.len(), 2);
    }
}
