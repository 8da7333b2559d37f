//! Storage backend abstraction for Nexus.
//!
//! Three pluggable variants implement [`Backend`]: [`memory::MemoryBackend`]
//! (decrypted, in-process), [`sqlite::SqliteBackend`] (persistent, encrypted
//! at rest), and [`encryption_only::EncryptionOnlyBackend`] (stateless,
//! cipher-only — "encryption as a service"). Every variant owns its own
//! [`Cipher`] instance, constructed from [`BackendConfig::encryption_key`].
//!
//! Secret rows arrive here already sealed: callers (the Persist Layer in
//! `nexus-core`) perform KEK wrap/unwrap before calling [`Backend::store_secret`]
//! / after [`Backend::load_secret`]. This keeps the KEK Manager and the
//! Backend from needing a reference to each other (see the "cyclic reference
//! avoidance" design note). Policy fields, by contrast, are encrypted directly
//! by the backend's own cipher via [`Backend::get_cipher`], since policies do
//! not carry a `kek_id`.

pub mod cipher;
pub mod encryption_only;
pub mod error;
pub mod memory;
#[cfg(feature = "sqlite-backend")]
pub mod sqlite;

pub use cipher::{Cipher, CipherKey};
pub use error::{CryptoError, StorageError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One persisted version row for a secret, matching the `secrets` table in
/// the persisted-state layout (path, version, nonce, ciphertext, kek_id,
/// created_time, deleted_time).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretVersionRow {
    pub version: u32,
    pub nonce: Vec<u8>,
    pub ciphertext: Vec<u8>,
    pub kek_id: String,
    pub created_time: DateTime<Utc>,
    pub deleted_time: Option<DateTime<Utc>>,
}

/// A whole secret as persisted, matching `secrets` joined with
/// `secret_metadata`. The Backend always stores/loads a secret as one unit;
/// the Persist Layer is responsible for reconciling this with the in-memory
/// [`nexus-core`] KV engine state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretRow {
    pub path: String,
    pub current_version: u32,
    pub oldest_version: u32,
    pub created_time: DateTime<Utc>,
    pub updated_time: DateTime<Utc>,
    pub versions: Vec<SecretVersionRow>,
}

/// A persisted policy row, matching the `policies` table. Each
/// `encrypted_*` field is a self-contained `Cipher::seal` output (its nonce
/// is embedded) rather than sharing one nonce across fields, since reusing a
/// nonce across independent AEAD calls under the same key would violate the
/// "fresh nonce per call" invariant the Cipher itself enforces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRow {
    pub id: String,
    pub name: String,
    pub encrypted_spiffe_id: Vec<u8>,
    pub encrypted_path: Vec<u8>,
    pub encrypted_permissions: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

/// Identifies which concrete [`Backend`] is in use, for health/status
/// reporting by the State Facade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Persistent,
    Memory,
    EncryptionOnly,
}

/// Pluggable persistence interface. Implementations must be safe to share
/// across tasks (`Send + Sync`) since the State Facade holds one instance
/// behind a shared pointer for the lifetime of the process.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Open any underlying connections/files. Called once at startup under
    /// the initialization timeout.
    async fn init(&self) -> Result<(), StorageError>;

    /// Release underlying resources. Called once at shutdown.
    async fn close(&self) -> Result<(), StorageError>;

    async fn store_secret(&self, row: &SecretRow) -> Result<(), StorageError>;

    /// Not-found is `Ok(None)`, distinct from other failures (spec.md 4.5).
    async fn load_secret(&self, path: &str) -> Result<Option<SecretRow>, StorageError>;

    async fn load_all_secrets(&self) -> Result<Vec<SecretRow>, StorageError>;

    async fn store_policy(&self, row: &PolicyRow) -> Result<(), StorageError>;

    async fn load_policy(&self, id: &str) -> Result<Option<PolicyRow>, StorageError>;

    async fn load_all_policies(&self) -> Result<Vec<PolicyRow>, StorageError>;

    /// Deleting a nonexistent id succeeds.
    async fn delete_policy(&self, id: &str) -> Result<(), StorageError>;

    /// The backend's own cipher. Only cipher-route handlers (encryption as a
    /// service) and the backend's own policy-field encrypt/decrypt helpers
    /// may call this; secret envelope encryption is the KEK Manager's job.
    fn get_cipher(&self) -> &Cipher;

    fn kind(&self) -> BackendKind;
}

/// Configuration for constructing a [`Backend`], matching spec.md 3's
/// Backend Config data model.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    /// Hex-encoded, exactly 32 bytes once decoded.
    pub encryption_key: String,
    pub location: String,
    #[serde(default)]
    pub options: BackendOptions,
}

/// SQLite-shaped connection and pragma options (spec.md 3): `journal_mode`
/// and `busy_timeout_ms` are SQLite PRAGMA names, which is why the
/// Persistent backend targets `sqlx`'s `sqlite` driver rather than postgres.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BackendOptions {
    pub data_dir: Option<String>,
    pub db_file: Option<String>,
    pub journal_mode: Option<String>,
    pub busy_timeout_ms: Option<u64>,
    pub max_open_conns: Option<u32>,
    pub max_idle_conns: Option<u32>,
    pub conn_max_lifetime_s: Option<u64>,
}

/// Decode [`BackendConfig::encryption_key`] into a [`Cipher`].
///
/// # Errors
///
/// Returns [`StorageError::BadInput`] if the hex is malformed or does not
/// decode to exactly 32 bytes.
pub fn cipher_from_config(config: &BackendConfig) -> Result<Cipher, StorageError> {
    let bytes = hex::decode(&config.encryption_key)
        .map_err(|e| StorageError::BadInput(format!("encryption_key is not valid hex: {e}")))?;
    Cipher::new(&bytes).map_err(StorageError::from)
}
