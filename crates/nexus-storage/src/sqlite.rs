//! Persistent (SQL) [`Backend`]: encrypts secret envelopes and policy
//! fields at rest in a SQLite database via `sqlx`.
//!
//! `BackendOptions::journal_mode` and `busy_timeout_ms` are SQLite PRAGMA
//! names (spec.md 3), which is why this backend targets `sqlx`'s `sqlite`
//! driver rather than the teacher's `postgres` driver — see `postgres_backend.rs`
//! in the teacher crate for the pool-construction and upsert idiom this
//! module generalizes.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::{info, warn};

use crate::{Backend, BackendConfig, BackendKind, Cipher, PolicyRow, SecretRow, SecretVersionRow, StorageError};

pub struct SqliteBackend {
    pool: SqlitePool,
    cipher: Cipher,
}

impl SqliteBackend {
    /// Open (creating if absent) a SQLite database per `config.options`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::BackendUnavailable`] if the pool cannot be
    /// established.
    pub async fn connect(config: &BackendConfig) -> Result<Self, StorageError> {
        let cipher = crate::cipher_from_config(config)?;

        let db_file = config
            .options
            .db_file
            .clone()
            .unwrap_or_else(|| format!("{}/nexus.db", config.options.data_dir.clone().unwrap_or_else(|| ".".into())));

        let mut connect_options = SqliteConnectOptions::from_str(&format!("sqlite://{db_file}"))
            .map_err(|e| StorageError::BackendUnavailable(format!("invalid db_file '{db_file}': {e}")))?
            .create_if_missing(true);

        if let Some(mode) = &config.options.journal_mode {
            connect_options = connect_options.pragma("journal_mode", mode.clone());
        }
        if let Some(ms) = config.options.busy_timeout_ms {
            connect_options = connect_options.busy_timeout(Duration::from_millis(ms));
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(config.options.max_open_conns.unwrap_or(5))
            .min_connections(config.options.max_idle_conns.unwrap_or(1))
            .idle_timeout(config.options.conn_max_lifetime_s.map(Duration::from_secs))
            .connect_with(connect_options)
            .await
            .map_err(|e| StorageError::BackendUnavailable(format!("failed to open sqlite pool: {e}")))?;

        Ok(Self { pool, cipher })
    }

    async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS secret_metadata (
                path TEXT PRIMARY KEY,
                current_version INTEGER NOT NULL,
                oldest_version INTEGER NOT NULL,
                created_time TEXT NOT NULL,
                updated_time TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Internal(e.to_string()))?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS secrets (
                path TEXT NOT NULL,
                version INTEGER NOT NULL,
                nonce BLOB NOT NULL,
                ciphertext BLOB NOT NULL,
                kek_id TEXT NOT NULL,
                created_time TEXT NOT NULL,
                deleted_time TEXT,
                PRIMARY KEY (path, version)
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Internal(e.to_string()))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS secrets_path_idx ON secrets(path)")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Internal(e.to_string()))?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS policies (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                encrypted_spiffe_id BLOB NOT NULL,
                encrypted_path BLOB NOT NULL,
                encrypted_permissions BLOB NOT NULL,
                created_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Internal(e.to_string()))?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS kek_metadata (
                id TEXT PRIMARY KEY,
                version INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                retired_at TEXT,
                wraps_count INTEGER NOT NULL,
                status TEXT NOT NULL,
                rmk_version INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Internal(e.to_string()))?;

        Ok(())
    }

    fn parse_ts(raw: &str) -> Result<DateTime<Utc>, StorageError> {
        DateTime::parse_from_rfc3339(raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| StorageError::Internal(format!("corrupt timestamp '{raw}': {e}")))
    }
}

#[async_trait]
impl Backend for SqliteBackend {
    async fn init(&self) -> Result<(), StorageError> {
        self.run_migrations().await?;
        info!("sqlite backend initialized");
        Ok(())
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.pool.close().await;
        Ok(())
    }

    async fn store_secret(&self, row: &SecretRow) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await.map_err(|e| StorageError::Internal(e.to_string()))?;

        sqlx::query(
            "INSERT INTO secret_metadata (path, current_version, oldest_version, created_time, updated_time)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(path) DO UPDATE SET
                current_version = excluded.current_version,
                oldest_version = excluded.oldest_version,
                updated_time = excluded.updated_time",
        )
        .bind(&row.path)
        .bind(row.current_version)
        .bind(row.oldest_version)
        .bind(row.created_time.to_rfc3339())
        .bind(row.updated_time.to_rfc3339())
        .execute(&mut *tx)
        .await
        .map_err(|e| StorageError::Internal(e.to_string()))?;

        // `row.versions` is the complete, authoritative set of versions for
        // this path (the in-memory KvStore has already physically pruned
        // anything evicted by max_versions). Delete the row's full prior
        // version set before re-inserting it so a version pruned since the
        // last persist doesn't survive a restart's rehydrate().
        sqlx::query("DELETE FROM secrets WHERE path = ?1")
            .bind(&row.path)
            .execute(&mut *tx)
            .await
            .map_err(|e| StorageError::Internal(e.to_string()))?;

        for version in &row.versions {
            sqlx::query(
                "INSERT INTO secrets (path, version, nonce, ciphertext, kek_id, created_time, deleted_time)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )
            .bind(&row.path)
            .bind(version.version)
            .bind(&version.nonce)
            .bind(&version.ciphertext)
            .bind(&version.kek_id)
            .bind(version.created_time.to_rfc3339())
            .bind(version.deleted_time.map(|t| t.to_rfc3339()))
            .execute(&mut *tx)
            .await
            .map_err(|e| StorageError::Internal(e.to_string()))?;
        }

        tx.commit().await.map_err(|e| StorageError::Internal(e.to_string()))?;
        Ok(())
    }

    async fn load_secret(&self, path: &str) -> Result<Option<SecretRow>, StorageError> {
        let meta_row = sqlx::query("SELECT current_version, oldest_version, created_time, updated_time FROM secret_metadata WHERE path = ?1")
            .bind(path)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::Internal(e.to_string()))?;

        let Some(meta_row) = meta_row else {
            return Ok(None);
        };

        let version_rows = sqlx::query("SELECT version, nonce, ciphertext, kek_id, created_time, deleted_time FROM secrets WHERE path = ?1 ORDER BY version")
            .bind(path)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::Internal(e.to_string()))?;

        let mut versions = Vec::with_capacity(version_rows.len());
        for r in version_rows {
            let created_time: String = r.try_get("created_time").map_err(|e| StorageError::Internal(e.to_string()))?;
            let deleted_time: Option<String> = r.try_get("deleted_time").map_err(|e| StorageError::Internal(e.to_string()))?;
            versions.push(SecretVersionRow {
                version: r.try_get::<i64, _>("version").map_err(|e| StorageError::Internal(e.to_string()))? as u32,
                nonce: r.try_get("nonce").map_err(|e| StorageError::Internal(e.to_string()))?,
                ciphertext: r.try_get("ciphertext").map_err(|e| StorageError::Internal(e.to_string()))?,
                kek_id: r.try_get("kek_id").map_err(|e| StorageError::Internal(e.to_string()))?,
                created_time: Self::parse_ts(&created_time)?,
                deleted_time: deleted_time.map(|s| Self::parse_ts(&s)).transpose()?,
            });
        }

        let created_time: String = meta_row.try_get("created_time").map_err(|e| StorageError::Internal(e.to_string()))?;
        let updated_time: String = meta_row.try_get("updated_time").map_err(|e| StorageError::Internal(e.to_string()))?;

        Ok(Some(SecretRow {
            path: path.to_owned(),
            current_version: meta_row.try_get::<i64, _>("current_version").map_err(|e| StorageError::Internal(e.to_string()))? as u32,
            oldest_version: meta_row.try_get::<i64, _>("oldest_version").map_err(|e| StorageError::Internal(e.to_string()))? as u32,
            created_time: Self::parse_ts(&created_time)?,
            updated_time: Self::parse_ts(&updated_time)?,
            versions,
        }))
    }

    async fn load_all_secrets(&self) -> Result<Vec<SecretRow>, StorageError> {
        let paths: Vec<String> = sqlx::query("SELECT path FROM secret_metadata")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .into_iter()
            .map(|r| r.try_get::<String, _>("path"))
            .collect::<Result<_, _>>()
            .map_err(|e| StorageError::Internal(e.to_string()))?;

        let mut out = Vec::with_capacity(paths.len());
        for path in paths {
            if let Some(row) = self.load_secret(&path).await? {
                out.push(row);
            } else {
                warn!(path, "secret_metadata row vanished between list and load");
            }
        }
        Ok(out)
    }

    async fn store_policy(&self, row: &PolicyRow) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO policies (id, name, encrypted_spiffe_id, encrypted_path, encrypted_permissions, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                encrypted_spiffe_id = excluded.encrypted_spiffe_id,
                encrypted_path = excluded.encrypted_path,
                encrypted_permissions = excluded.encrypted_permissions",
        )
        .bind(&row.id)
        .bind(&row.name)
        .bind(&row.encrypted_spiffe_id)
        .bind(&row.encrypted_path)
        .bind(&row.encrypted_permissions)
        .bind(row.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Internal(e.to_string()))?;
        Ok(())
    }

    async fn load_policy(&self, id: &str) -> Result<Option<PolicyRow>, StorageError> {
        let row = sqlx::query(
            "SELECT id, name, encrypted_spiffe_id, encrypted_path, encrypted_permissions, created_at FROM policies WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::Internal(e.to_string()))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let created_at: String = row.try_get("created_at").map_err(|e| StorageError::Internal(e.to_string()))?;

        Ok(Some(PolicyRow {
            id: row.try_get("id").map_err(|e| StorageError::Internal(e.to_string()))?,
            name: row.try_get("name").map_err(|e| StorageError::Internal(e.to_string()))?,
            encrypted_spiffe_id: row.try_get("encrypted_spiffe_id").map_err(|e| StorageError::Internal(e.to_string()))?,
            encrypted_path: row.try_get("encrypted_path").map_err(|e| StorageError::Internal(e.to_string()))?,
            encrypted_permissions: row.try_get("encrypted_permissions").map_err(|e| StorageError::Internal(e.to_string()))?,
            created_at: Self::parse_ts(&created_at)?,
        }))
    }

    async fn load_all_policies(&self) -> Result<Vec<PolicyRow>, StorageError> {
        let ids: Vec<String> = sqlx::query("SELECT id FROM policies")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .into_iter()
            .map(|r| r.try_get::<String, _>("id"))
            .collect::<Result<_, _>>()
            .map_err(|e| StorageError::Internal(e.to_string()))?;

        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(row) = self.load_policy(&id).await? {
                out.push(row);
            }
        }
        Ok(out)
    }

    async fn delete_policy(&self, id: &str) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM policies WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Internal(e.to_string()))?;
        Ok(())
    }

    fn get_cipher(&self) -> &Cipher {
        &self.cipher
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Persistent
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::BackendOptions;

    async fn backend(tmp: &tempfile::TempDir) -> SqliteBackend {
        let config = BackendConfig {
            encryption_key: hex::encode([7u8; 32]),
            location: "sqlite".into(),
            options: BackendOptions {
                db_file: Some(tmp.path().join("nexus.db").to_string_lossy().into_owned()),
                ..Default::default()
            },
        };
        let backend = SqliteBackend::connect(&config).await.unwrap();
        backend.init().await.unwrap();
        backend
    }

    #[tokio::test]
    async fn store_then_load_secret_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = backend(&tmp).await;
        let row = SecretRow {
            path: "app/db".into(),
            current_version: 1,
            oldest_version: 1,
            created_time: Utc::now(),
            updated_time: Utc::now(),
            versions: vec![SecretVersionRow {
                version: 1,
                nonce: vec![0u8; 12],
                ciphertext: vec![1, 2, 3],
                kek_id: "kek-1".into(),
                created_time: Utc::now(),
                deleted_time: None,
            }],
        };
        backend.store_secret(&row).await.unwrap();
        let loaded = backend.load_secret("app/db").await.unwrap().unwrap();
        assert_eq!(loaded.current_version, 1);
        assert_eq!(loaded.versions.len(), 1);
        assert_eq!(loaded.versions[0].kek_id, "kek-1");
    }

    #[tokio::test]
    async fn load_missing_secret_returns_none() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = backend(&tmp).await;
        assert!(backend.load_secret("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_missing_policy_succeeds() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = backend(&tmp).await;
        assert!(backend.delete_policy("nope").await.is_ok());
    }

    #[tokio::test]
    async fn restore_prunes_versions_no_longer_in_the_row() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = backend(&tmp).await;
        let version = |n: u32| SecretVersionRow {
            version: n,
            nonce: vec![0u8; 12],
            ciphertext: vec![n as u8],
            kek_id: "kek-1".into(),
            created_time: Utc::now(),
            deleted_time: None,
        };

        let mut row = SecretRow {
            path: "app/db".into(),
            current_version: 3,
            oldest_version: 1,
            created_time: Utc::now(),
            updated_time: Utc::now(),
            versions: vec![version(1), version(2), version(3)],
        };
        backend.store_secret(&row).await.unwrap();

        // version 1 pruned by max_versions, as the in-memory KvStore would do.
        row.versions.remove(0);
        row.oldest_version = 2;
        backend.store_secret(&row).await.unwrap();

        let loaded = backend.load_secret("app/db").await.unwrap().unwrap();
        assert_eq!(loaded.versions.len(), 2);
        assert!(loaded.versions.iter().all(|v| v.version != 1));
    }
}
