//! Server configuration for Nexus.
//!
//! Loads configuration from environment variables with sensible defaults,
//! following the teacher's `ServerConfig::from_env` pattern
//! (`vaultrs-server/src/config.rs`). All settings can be overridden via
//! `NEXUS_*` environment variables.

use std::net::SocketAddr;
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub backend_type: BackendType,
    pub data_dir: String,
    pub log_level: String,
    pub disable_mlock: bool,

    pub kek_rotation_days: i64,
    pub kek_max_wraps: u64,
    pub kek_grace_days: i64,
    pub kek_lazy_rewrap_enabled: bool,
    pub kek_max_rewrap_qps: u32,

    pub database_operation_timeout: Duration,
    pub database_init_timeout: Duration,

    pub bootstrap_identity: String,
}

/// Supported backend store types (spec.md 6: `memory|lite|sqlite`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendType {
    Memory,
    /// Encryption-only — no persisted state, cipher-as-a-service.
    Lite,
    Sqlite,
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `PORT` — port to bind on (Railway convention, binds to `0.0.0.0`)
    /// - `NEXUS_BIND_ADDR` — full bind address (overrides `PORT`, default: `127.0.0.1:8443`)
    /// - `NEXUS_BACKEND` — `memory`, `lite`, or `sqlite` (default: `memory`)
    /// - `NEXUS_DATA_DIR` — data folder for the sqlite backend (default: `./data`)
    /// - `NEXUS_LOG_LEVEL` — log filter (default: `info`)
    /// - `NEXUS_DISABLE_MLOCK` — skip `mlockall` for dev environments (default: `false`)
    /// - `NEXUS_KEK_ROTATION_DAYS` — active KEK max age before rotation (default: `90`)
    /// - `NEXUS_KEK_MAX_WRAPS` — active KEK max wrap count before rotation (default: `1000000`)
    /// - `NEXUS_KEK_GRACE_DAYS` — grace window before a drained KEK retires (default: `7`)
    /// - `NEXUS_KEK_LAZY_REWRAP` — enable the background rewrap sweeper (default: `true`)
    /// - `NEXUS_KEK_MAX_REWRAP_QPS` — sweeper rate limit (default: `50`)
    /// - `NEXUS_DB_OP_TIMEOUT_MS` — backend operation timeout (default: `5000`)
    /// - `NEXUS_DB_INIT_TIMEOUT_MS` — backend initialization timeout (default: `30000`)
    /// - `NEXUS_BOOTSTRAP_IDENTITY` — the SPIFFE id authorized to call bootstrap verify
    #[must_use]
    pub fn from_env() -> Self {
        let bind_addr = if let Ok(addr) = std::env::var("NEXUS_BIND_ADDR") {
            addr.parse().unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], 8443)))
        } else if let Ok(port_str) = std::env::var("PORT") {
            let port: u16 = port_str.parse().unwrap_or(8443);
            SocketAddr::from(([0, 0, 0, 0], port))
        } else {
            SocketAddr::from(([127, 0, 0, 1], 8443))
        };

        let backend_type = match std::env::var("NEXUS_BACKEND").unwrap_or_else(|_| "memory".to_owned()).to_lowercase().as_str() {
            "lite" => BackendType::Lite,
            "sqlite" => BackendType::Sqlite,
            _ => BackendType::Memory,
        };

        let data_dir = std::env::var("NEXUS_DATA_DIR").unwrap_or_else(|_| "./data".to_owned());
        let log_level = std::env::var("NEXUS_LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());

        let disable_mlock = std::env::var("NEXUS_DISABLE_MLOCK").map(|v| v == "true" || v == "1").unwrap_or(false);

        let kek_rotation_days = env_parse("NEXUS_KEK_ROTATION_DAYS", 90);
        let kek_max_wraps = env_parse("NEXUS_KEK_MAX_WRAPS", 1_000_000);
        let kek_grace_days = env_parse("NEXUS_KEK_GRACE_DAYS", 7);
        let kek_lazy_rewrap_enabled = std::env::var("NEXUS_KEK_LAZY_REWRAP").map(|v| v != "false" && v != "0").unwrap_or(true);
        let kek_max_rewrap_qps = env_parse("NEXUS_KEK_MAX_REWRAP_QPS", 50);

        let database_operation_timeout = Duration::from_millis(env_parse("NEXUS_DB_OP_TIMEOUT_MS", 5_000));
        let database_init_timeout = Duration::from_millis(env_parse("NEXUS_DB_INIT_TIMEOUT_MS", 30_000));

        let bootstrap_identity =
            std::env::var("NEXUS_BOOTSTRAP_IDENTITY").unwrap_or_else(|_| "spiffe://nexus.internal/bootstrap".to_owned());

        Self {
            bind_addr,
            backend_type,
            data_dir,
            log_level,
            disable_mlock,
            kek_rotation_days,
            kek_max_wraps,
            kek_grace_days,
            kek_lazy_rewrap_enabled,
            kek_max_rewrap_qps,
            database_operation_timeout,
            database_init_timeout,
            bootstrap_identity,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}
