//! KEK Manager (C7): KEK lifecycle, wraps, rotation triggers, rewrap
//! budget. Generalizes the teacher's `TransitEngine`
//! (`vaultrs-core/src/transit.rs`, named/versioned keys with history) by
//! adding the `active → grace → retired` state machine, `wraps_count`,
//! `max_wraps`-triggered rotation, and the `prepare_rmk_rotation` snapshot
//! that spec.md 4.7 requires and the teacher's transit engine does not
//! model (the teacher rotates its keys on demand only, with no lifecycle
//! states).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;

use nexus_storage::Cipher;

use crate::error::NexusError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KekStatus {
    Active,
    Grace,
    Retired,
}

/// A point-in-time snapshot of one KEK's metadata, safe to hand out to
/// callers (it never exposes key material).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KekInfo {
    pub id: String,
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub retired_at: Option<DateTime<Utc>>,
    pub wraps_count: u64,
    pub status: KekStatus,
    pub rmk_version: u32,
}

struct KekEntry {
    id: String,
    version: u32,
    cipher: Cipher,
    created_at: DateTime<Utc>,
    grace_since: Option<DateTime<Utc>>,
    retired_at: Option<DateTime<Utc>>,
    status: KekStatus,
    rmk_version: u32,
    wraps_count: Arc<AtomicU64>,
}

impl KekEntry {
    fn info(&self) -> KekInfo {
        KekInfo {
            id: self.id.clone(),
            version: self.version,
            created_at: self.created_at,
            retired_at: self.retired_at,
            wraps_count: self.wraps_count.load(Ordering::SeqCst),
            status: self.status,
            rmk_version: self.rmk_version,
        }
    }
}

fn new_kek_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("kek-{}", hex::encode(bytes))
}

#[derive(Debug, Clone)]
pub struct KekManagerConfig {
    pub rotation_days: i64,
    pub max_wraps: u64,
    pub grace_days: i64,
}

impl Default for KekManagerConfig {
    fn default() -> Self {
        Self { rotation_days: 90, max_wraps: 1_000_000, grace_days: 7 }
    }
}

struct KekManagerState {
    keks: BTreeMap<String, KekEntry>,
    active_id: String,
    rmk_version: u32,
}

/// Maintains an ordered collection of KEKs and a single `current_kek_id`,
/// guarded by its own lock; `wraps_count` uses atomic increment to avoid
/// contention on the hot wrap path (spec.md 5).
pub struct KekManager {
    state: RwLock<KekManagerState>,
    config: KekManagerConfig,
}

impl KekManager {
    /// Bootstrap with a single active KEK.
    #[must_use]
    pub fn new(config: KekManagerConfig, rmk_version: u32) -> Self {
        let id = new_kek_id();
        let entry = KekEntry {
            id: id.clone(),
            version: 1,
            cipher: Cipher::generate(),
            created_at: Utc::now(),
            grace_since: None,
            retired_at: None,
            status: KekStatus::Active,
            rmk_version,
            wraps_count: Arc::new(AtomicU64::new(0)),
        };
        let mut keks = BTreeMap::new();
        keks.insert(id.clone(), entry);
        Self { state: RwLock::new(KekManagerState { keks, active_id: id, rmk_version }), config }
    }

    /// Seal `plaintext` under the active KEK, incrementing its wraps
    /// counter. Never blocks the caller on rotation; if `max_wraps` is
    /// exceeded the Scheduler will rotate on its next tick.
    pub async fn wrap(&self, plaintext: &[u8]) -> Result<(String, Vec<u8>), NexusError> {
        let state = self.state.read().await;
        let active = state
            .keks
            .get(&state.active_id)
            .ok_or_else(|| NexusError::Internal("no active kek".into()))?;
        let ciphertext = active.cipher.seal(plaintext).map_err(NexusError::from)?;
        active.wraps_count.fetch_add(1, Ordering::SeqCst);
        Ok((active.id.clone(), ciphertext))
    }

    /// Succeeds on `active` or `grace`; fails on `retired`.
    pub async fn unwrap(&self, kek_id: &str, ciphertext: &[u8]) -> Result<Vec<u8>, NexusError> {
        let state = self.state.read().await;
        let entry = state
            .keks
            .get(kek_id)
            .ok_or_else(|| NexusError::NotFound(format!("kek {kek_id}")))?;
        if entry.status == KekStatus::Retired {
            return Err(NexusError::KekRetired(kek_id.to_owned()));
        }
        entry.cipher.open(ciphertext).map_err(NexusError::from)
    }

    /// Mint a new active KEK, moving the previous active to `grace`.
    pub async fn rotate(&self) -> Result<KekInfo, NexusError> {
        let mut state = self.state.write().await;
        let now = Utc::now();
        let rmk_version = state.rmk_version;

        if let Some(previous) = state.keks.get_mut(&state.active_id.clone()) {
            previous.status = KekStatus::Grace;
            previous.grace_since = Some(now);
        }

        let next_version = state.keks.values().map(|k| k.version).max().unwrap_or(0) + 1;
        let id = new_kek_id();
        let entry = KekEntry {
            id: id.clone(),
            version: next_version,
            cipher: Cipher::generate(),
            created_at: now,
            grace_since: None,
            retired_at: None,
            status: KekStatus::Active,
            rmk_version,
            wraps_count: Arc::new(AtomicU64::new(0)),
        };
        let info = entry.info();
        state.keks.insert(id.clone(), entry);
        state.active_id = id;
        info!(kek_id = %info.id, version = info.version, "rotated kek");
        Ok(info)
    }

    /// `true` iff the active KEK's age ≥ `rotation_days` or its
    /// `wraps_count` ≥ `max_wraps`.
    pub async fn should_rotate(&self) -> bool {
        let state = self.state.read().await;
        let Some(active) = state.keks.get(&state.active_id) else {
            return false;
        };
        let age = Utc::now().signed_duration_since(active.created_at);
        age >= ChronoDuration::days(self.config.rotation_days)
            || active.wraps_count.load(Ordering::SeqCst) >= self.config.max_wraps
    }

    /// Retire every `grace` KEK that has aged past `grace_days` and for
    /// which `still_referenced` returns `false` (i.e. the Sweeper has
    /// finished rewrapping every secret that used it).
    pub async fn retire_drained_grace_keks(&self, still_referenced: impl Fn(&str) -> bool) -> Vec<String> {
        let mut state = self.state.write().await;
        let now = Utc::now();
        let grace_days = self.config.grace_days;
        let mut retired = Vec::new();

        for entry in state.keks.values_mut() {
            if entry.status != KekStatus::Grace {
                continue;
            }
            let Some(since) = entry.grace_since else { continue };
            let aged_out = now.signed_duration_since(since) >= ChronoDuration::days(grace_days);
            if aged_out && !still_referenced(&entry.id) {
                entry.status = KekStatus::Retired;
                entry.retired_at = Some(now);
                retired.push(entry.id.clone());
            }
        }
        retired
    }

    pub async fn current_kek_id(&self) -> String {
        self.state.read().await.active_id.clone()
    }

    pub async fn list(&self) -> Vec<KekInfo> {
        self.state.read().await.keks.values().map(KekEntry::info).collect()
    }

    pub async fn info(&self, id: &str) -> Option<KekInfo> {
        self.state.read().await.keks.get(id).map(KekEntry::info)
    }

    /// Snapshot used by an out-of-band ceremony to re-wrap every KEK under
    /// a new RMK without touching secret ciphertext. The ceremony itself is
    /// out of scope (spec.md 4.7).
    pub async fn prepare_rmk_rotation(&self) -> RmkRotationSnapshot {
        let state = self.state.read().await;
        RmkRotationSnapshot {
            rmk_version: state.rmk_version,
            kek_list: state.keks.values().map(KekEntry::info).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RmkRotationSnapshot {
    pub rmk_version: u32,
    pub kek_list: Vec<KekInfo>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn exactly_one_active_kek_after_construction() {
        let mgr = KekManager::new(KekManagerConfig::default(), 1);
        let active = mgr.list().await.into_iter().filter(|k| k.status == KekStatus::Active).count();
        assert_eq!(active, 1);
    }

    #[tokio::test]
    async fn wrap_unwrap_round_trips() {
        let mgr = KekManager::new(KekManagerConfig::default(), 1);
        let (id, ciphertext) = mgr.wrap(b"payload").await.unwrap();
        let plaintext = mgr.unwrap(&id, &ciphertext).await.unwrap();
        assert_eq!(plaintext, b"payload");
    }

    #[tokio::test]
    async fn rotate_leaves_exactly_one_active() {
        let mgr = KekManager::new(KekManagerConfig::default(), 1);
        mgr.rotate().await.unwrap();
        let active = mgr.list().await.into_iter().filter(|k| k.status == KekStatus::Active).count();
        assert_eq!(active, 1);
    }

    #[tokio::test]
    async fn grace_kek_can_still_unwrap() {
        let mgr = KekManager::new(KekManagerConfig::default(), 1);
        let (old_id, ciphertext) = mgr.wrap(b"payload").await.unwrap();
        mgr.rotate().await.unwrap();
        let plaintext = mgr.unwrap(&old_id, &ciphertext).await.unwrap();
        assert_eq!(plaintext, b"payload");
    }

    #[tokio::test]
    async fn retired_kek_cannot_unwrap() {
        let mgr = KekManager::new(KekManagerConfig { grace_days: -1, ..KekManagerConfig::default() }, 1);
        let (old_id, ciphertext) = mgr.wrap(b"payload").await.unwrap();
        mgr.rotate().await.unwrap();
        let retired = mgr.retire_drained_grace_keks(|_| false).await;
        assert_eq!(retired, vec![old_id.clone()]);
        assert!(matches!(mgr.unwrap(&old_id, &ciphertext).await, Err(NexusError::KekRetired(_))));
    }

    #[tokio::test]
    async fn retired_kek_never_reactivates() {
        let mgr = KekManager::new(KekManagerConfig { grace_days: -1, ..KekManagerConfig::default() }, 1);
        let (old_id, _) = mgr.wrap(b"x").await.unwrap();
        mgr.rotate().await.unwrap();
        mgr.retire_drained_grace_keks(|_| false).await;
        let info = mgr.info(&old_id).await.unwrap();
        assert_eq!(info.status, KekStatus::Retired);
    }

    #[tokio::test]
    async fn should_rotate_true_once_max_wraps_hit() {
        let mgr = KekManager::new(KekManagerConfig { max_wraps: 2, ..KekManagerConfig::default() }, 1);
        assert!(!mgr.should_rotate().await);
        mgr.wrap(b"a").await.unwrap();
        mgr.wrap(b"b").await.unwrap();
        assert!(mgr.should_rotate().await);
    }

    #[tokio::test]
    async fn prepare_rmk_rotation_lists_every_kek() {
        let mgr = KekManager::new(KekManagerConfig::default(), 1);
        mgr.rotate().await.unwrap();
        let snapshot = mgr.prepare_rmk_rotation().await;
        assert_eq!(snapshot.kek_list.len(), 2);
        assert_eq!(snapshot.rmk_version, 1);
    }
}
