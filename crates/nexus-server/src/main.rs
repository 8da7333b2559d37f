//! Nexus server entry point.
//!
//! Bootstraps the storage backend, the core secret/policy/KEK engine, and
//! the Scheduler/Sweeper background tasks, then starts the Axum HTTP server
//! with graceful shutdown, following the teacher's `vaultrs-server/src/main.rs`
//! bootstrap sequence.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use nexus_core::facade::{NexusCore, NexusCoreConfig};
use nexus_core::kek::KekManagerConfig;
use nexus_core::persist::PersistConfig;
use nexus_core::scheduler::{run_scheduler, run_sweeper, SchedulerConfig, SweeperConfig};
use nexus_storage::{cipher_from_config, Backend, BackendConfig, BackendOptions, CipherKey};

use nexus_server::config::{BackendType, ServerConfig};
use nexus_server::hardening;
use nexus_server::middleware::identity_middleware;
use nexus_server::routes;
use nexus_server::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_env();

    apply_hardening(&config);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .json()
        .init();

    info!(backend = ?config.backend_type, "Nexus starting");

    let core = build_core(&config).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scheduler_handle = {
        let core = Arc::clone(&core);
        let rx = shutdown_rx.clone();
        let sched_config = SchedulerConfig { tick_interval: Duration::from_secs((config.kek_rotation_days.max(1) as u64 * 86_400) / 4) };
        tokio::spawn(async move {
            run_scheduler(&core, sched_config, rx).await;
        })
    };

    let sweeper_handle = {
        let core = Arc::clone(&core);
        let rx = shutdown_rx.clone();
        let sweep_config = SweeperConfig {
            enabled: config.kek_lazy_rewrap_enabled,
            max_rewrap_qps: config.kek_max_rewrap_qps,
            scan_interval: Duration::from_secs(30),
        };
        tokio::spawn(async move {
            run_sweeper(&core, sweep_config, rx).await;
        })
    };

    let state = Arc::new(AppState { core: Arc::clone(&core) });
    let app = build_router(state);

    let listener = TcpListener::bind(config.bind_addr).await.with_context(|| format!("failed to bind to {}", config.bind_addr))?;

    info!(addr = %config.bind_addr, "Nexus server listening");

    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal(shutdown_tx)).await.context("server error")?;

    info!("waiting for background workers to stop");
    let _ = tokio::time::timeout(Duration::from_secs(10), scheduler_handle).await;
    let _ = tokio::time::timeout(Duration::from_secs(10), sweeper_handle).await;

    core.persist().backend().await.close().await.context("failed to close backend")?;

    info!("Nexus server stopped");
    Ok(())
}

#[allow(clippy::print_stderr)]
fn apply_hardening(config: &ServerConfig) {
    if let Err(e) = hardening::disable_core_dumps() {
        eprintln!("warning: failed to disable core dumps: {e}");
    }
    if config.disable_mlock {
        eprintln!("warning: NEXUS_DISABLE_MLOCK set; skipping mlockall");
    } else if let Err(e) = hardening::lock_memory() {
        eprintln!("warning: failed to lock memory: {e}");
    }
}

/// Build the core engine: resolve the RMK, construct the configured
/// Backend, set the root key, and rehydrate in-memory state.
async fn build_core(config: &ServerConfig) -> anyhow::Result<Arc<NexusCore>> {
    let rmk_hex = std::env::var("NEXUS_RMK_HEX").context("NEXUS_RMK_HEX must be set to a 64-character hex string (32 bytes)")?;

    let backend_config = BackendConfig {
        encryption_key: rmk_hex.clone(),
        location: config.data_dir.clone(),
        options: BackendOptions {
            data_dir: Some(config.data_dir.clone()),
            db_file: Some("nexus.db".to_owned()),
            journal_mode: Some("WAL".to_owned()),
            busy_timeout_ms: Some(5_000),
            max_open_conns: Some(10),
            max_idle_conns: Some(5),
            conn_max_lifetime_s: Some(1_800),
        },
    };

    let backend: Arc<dyn Backend> = match &config.backend_type {
        BackendType::Memory => {
            info!("using in-memory backend (data will not persist)");
            let cipher = cipher_from_config(&backend_config)?;
            Arc::new(nexus_storage::memory::MemoryBackend::new(cipher))
        }
        BackendType::Lite => {
            info!("using encryption-only backend (cipher-as-a-service)");
            let cipher = cipher_from_config(&backend_config)?;
            Arc::new(nexus_storage::encryption_only::EncryptionOnlyBackend::new(cipher))
        }
        BackendType::Sqlite => {
            info!(dir = %config.data_dir, "using sqlite backend");
            let backend = tokio::time::timeout(config.database_init_timeout, nexus_storage::sqlite::SqliteBackend::connect(&backend_config))
                .await
                .context("sqlite backend connect timed out")?
                .context("failed to connect sqlite backend")?;
            Arc::new(backend)
        }
    };

    backend.init().await.context("backend initialization failed")?;

    let rmk_bytes = hex::decode(&rmk_hex).context("NEXUS_RMK_HEX is not valid hex")?;
    let rmk_array: [u8; 32] = rmk_bytes.try_into().map_err(|_| anyhow::anyhow!("NEXUS_RMK_HEX must decode to exactly 32 bytes"))?;
    let root_key = CipherKey::from_bytes(rmk_array);
    if root_key.is_zero() {
        warn!("root key is all-zero; this is insecure and should only be used in development");
    }

    let core_config = NexusCoreConfig {
        default_max_versions: 10,
        kek: KekManagerConfig { rotation_days: config.kek_rotation_days, max_wraps: config.kek_max_wraps, grace_days: config.kek_grace_days },
        persist: PersistConfig { operation_timeout: config.database_operation_timeout, ..PersistConfig::default() },
        bootstrap_identity: config.bootstrap_identity.clone(),
        rmk_version: 1,
    };

    let core = Arc::new(NexusCore::new(core_config, backend));
    core.set_root_key(root_key).await.context("failed to set root key")?;
    core.rehydrate().await.context("failed to rehydrate state from backend")?;

    Ok(core)
}

fn build_router(state: Arc<AppState>) -> Router {
    use axum::middleware as axum_mw;
    use tower_http::trace::TraceLayer;

    Router::new()
        .merge(routes::secrets::router())
        .merge(routes::policy::router())
        .merge(routes::kek::router())
        .merge(routes::bootstrap::router())
        .merge(routes::sys::router())
        .layer(axum_mw::from_fn(identity_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut sig) = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            sig.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }

    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
}
