//! Persist Layer (C6): write-through glue between in-memory state and the
//! Backend. Memory is the source of truth; persistence is attempted
//! asynchronously with exponential backoff, bounded by an operation
//! timeout. Failure is logged and dropped — it never fails the
//! user-visible operation (spec.md 4.6).
//!
//! Per spec.md 9's "Async persistence" design note, writes are not
//! fire-and-forget `tokio::spawn` calls racing each other: each key (a
//! secret path, or a policy id) gets its own single-writer worker task fed
//! by a bounded channel, so persists for the same key are delivered to the
//! Backend strictly in submission order, and a slow Backend applies
//! backpressure to callers of that key rather than piling up unboundedly.
//! This is new code — the teacher's barrier (`zvault-core/src/barrier.rs`)
//! persists synchronously and propagates failure directly; the bounded
//! per-key queue below is modeled on the teacher's background-task shape
//! (`vaultrs-server/src/main.rs::lease_expiry_worker`, one long-lived task
//! draining a channel) applied per key instead of once globally.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tracing::{debug, warn};

use nexus_storage::{Backend, PolicyRow, SecretRow, StorageError};

#[derive(Debug, Clone)]
pub struct PersistConfig {
    pub operation_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub max_attempts: u32,
    /// Bound on each per-key worker's pending-job channel. A burst of
    /// writes to the same key beyond this bound blocks the caller
    /// (backpressure) rather than growing without limit.
    pub queue_capacity: usize,
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            operation_timeout: Duration::from_secs(5),
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
            max_attempts: 5,
            queue_capacity: 64,
        }
    }
}

/// Retries `op` with exponential backoff until it succeeds, `max_attempts`
/// is exhausted, or `operation_timeout` elapses — whichever comes first.
async fn with_retry<T, F, Fut>(config: &PersistConfig, what: &str, op: F) -> Option<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, StorageError>>,
{
    let attempt_future = async {
        let mut backoff = config.initial_backoff;
        for attempt in 1..=config.max_attempts {
            match op().await {
                Ok(value) => return Some(value),
                Err(e) => {
                    warn!(what, attempt, error = %e, "persist attempt failed");
                    if attempt == config.max_attempts {
                        return None;
                    }
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(config.max_backoff);
                }
            }
        }
        None
    };

    match tokio::time::timeout(config.operation_timeout, attempt_future).await {
        Ok(result) => result,
        Err(_) => {
            warn!(what, "persist operation timed out; dropping, memory remains source of truth");
            None
        }
    }
}

/// A bounded, per-key single-writer work queue. Each distinct key gets its
/// own worker task and its own bounded channel; jobs submitted for the
/// same key run strictly in submission order, one at a time. Jobs for
/// different keys run fully concurrently.
struct PerKeyQueue {
    workers: Mutex<HashMap<String, mpsc::Sender<BoxFuture<'static, ()>>>>,
    capacity: usize,
}

impl PerKeyQueue {
    fn new(capacity: usize) -> Self {
        Self { workers: Mutex::new(HashMap::new()), capacity: capacity.max(1) }
    }

    /// Enqueue `job` behind `key`'s worker, spawning the worker on first
    /// use. Blocks the caller only if that key's queue is already full
    /// (backpressure); never blocks on other keys' work.
    async fn enqueue(&self, key: &str, job: BoxFuture<'static, ()>) {
        let sender = {
            let mut workers = self.workers.lock().await;
            match workers.get(key) {
                Some(tx) if !tx.is_closed() => tx.clone(),
                _ => {
                    let (tx, rx) = mpsc::channel(self.capacity);
                    workers.insert(key.to_owned(), tx.clone());
                    tokio::spawn(Self::drain(rx));
                    tx
                }
            }
        };

        if sender.send(job).await.is_err() {
            warn!(key, "persist worker channel closed; job dropped");
        }
    }

    async fn drain(mut rx: mpsc::Receiver<BoxFuture<'static, ()>>) {
        while let Some(job) = rx.recv().await {
            job.await;
        }
    }

    /// Block until every job enqueued so far (across all keys) has run, by
    /// enqueuing a barrier job behind each live worker and waiting for it.
    async fn wait_idle(&self) {
        let senders: Vec<_> = self.workers.lock().await.values().cloned().collect();
        for tx in senders {
            let (done_tx, done_rx) = oneshot::channel();
            let barrier: BoxFuture<'static, ()> = Box::pin(async move {
                let _ = done_tx.send(());
            });
            if tx.send(barrier).await.is_ok() {
                let _ = done_rx.await;
            }
        }
    }
}

/// Write-through layer sitting between the in-memory stores and the
/// pluggable Backend. The backend pointer is written once at
/// initialization and read behind a lock on every call thereafter (spec.md
/// 5: "a mutex used only during initialization" is realized here as a
/// `RwLock` whose writer side is exercised only by `set_backend`).
pub struct PersistLayer {
    backend: RwLock<Arc<dyn Backend>>,
    config: PersistConfig,
    secret_queue: PerKeyQueue,
    policy_queue: PerKeyQueue,
}

impl PersistLayer {
    #[must_use]
    pub fn new(backend: Arc<dyn Backend>, config: PersistConfig) -> Self {
        let secret_queue = PerKeyQueue::new(config.queue_capacity);
        let policy_queue = PerKeyQueue::new(config.queue_capacity);
        Self { backend: RwLock::new(backend), config, secret_queue, policy_queue }
    }

    pub async fn set_backend(&self, backend: Arc<dyn Backend>) {
        *self.backend.write().await = backend;
    }

    pub async fn backend(&self) -> Arc<dyn Backend> {
        self.backend.read().await.clone()
    }

    /// Persist a secret row behind its path's single-writer worker, so
    /// concurrent writes to the same path are delivered to the Backend in
    /// the order they were submitted. Failure is logged and dropped.
    pub async fn persist_secret(&self, row: SecretRow) {
        let backend = self.backend().await;
        let config = self.config.clone();
        let path = row.path.clone();
        let job: BoxFuture<'static, ()> = Box::pin(async move {
            with_retry(&config, "store_secret", || {
                let backend = backend.clone();
                let row = row.clone();
                async move { backend.store_secret(&row).await }
            })
            .await;
        });
        self.secret_queue.enqueue(&path, job).await;
    }

    /// Best-effort read-through. Returns `None` on failure; the caller
    /// falls back to in-memory state.
    pub async fn load_secret(&self, path: &str) -> Option<SecretRow> {
        let backend = self.backend().await;
        let path = path.to_owned();
        with_retry(&self.config, "load_secret", || {
            let backend = backend.clone();
            let path = path.clone();
            async move { backend.load_secret(&path).await }
        })
        .await
        .flatten()
    }

    pub async fn load_all_secrets(&self) -> Vec<SecretRow> {
        let backend = self.backend().await;
        with_retry(&self.config, "load_all_secrets", || {
            let backend = backend.clone();
            async move { backend.load_all_secrets().await }
        })
        .await
        .unwrap_or_default()
    }

    pub async fn persist_policy(&self, row: PolicyRow) {
        let backend = self.backend().await;
        let config = self.config.clone();
        let id = row.id.clone();
        let job: BoxFuture<'static, ()> = Box::pin(async move {
            with_retry(&config, "store_policy", || {
                let backend = backend.clone();
                let row = row.clone();
                async move { backend.store_policy(&row).await }
            })
            .await;
        });
        self.policy_queue.enqueue(&id, job).await;
    }

    pub async fn load_all_policies(&self) -> Vec<PolicyRow> {
        let backend = self.backend().await;
        with_retry(&self.config, "load_all_policies", || {
            let backend = backend.clone();
            async move { backend.load_all_policies().await }
        })
        .await
        .unwrap_or_default()
    }

    pub async fn delete_policy(&self, id: String) {
        let backend = self.backend().await;
        let config = self.config.clone();
        let key = id.clone();
        let job: BoxFuture<'static, ()> = Box::pin(async move {
            with_retry(&config, "delete_policy", || {
                let backend = backend.clone();
                let id = id.clone();
                async move { backend.delete_policy(&id).await }
            })
            .await;
        });
        self.policy_queue.enqueue(&key, job).await;
    }

    /// Block until every job enqueued so far has completed, across both
    /// the secret and policy queues.
    pub async fn wait_idle(&self) {
        debug!("waiting for persist queues to drain");
        self.secret_queue.wait_idle().await;
        self.policy_queue.wait_idle().await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use nexus_storage::{memory::MemoryBackend, Cipher};

    fn layer() -> PersistLayer {
        let backend = Arc::new(MemoryBackend::new(Cipher::generate()));
        PersistLayer::new(backend, PersistConfig::default())
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
    async fn persist_then_load_round_trips() {
        let layer = layer();
        layer.persist_secret(row("app/db")).await;
        layer.wait_idle().await;
        let loaded = layer.load_secret("app/db").await;
        assert!(loaded.is_some());
    }

    #[tokio::test]
    async fn load_missing_returns_none() {
        let layer = layer();
        assert!(layer.load_secret("nope").await.is_none());
    }

    #[tokio::test]
    async fn same_path_writes_land_in_submission_order() {
        let layer = layer();
        let mut r1 = row("app/db");
        r1.current_version = 1;
        let mut r2 = row("app/db");
        r2.current_version = 2;
        let mut r3 = row("app/db");
        r3.current_version = 3;

        layer.persist_secret(r1).await;
        layer.persist_secret(r2).await;
        layer.persist_secret(r3).await;
        layer.wait_idle().await;

        let loaded = layer.load_secret("app/db").await.unwrap();
        assert_eq!(loaded.current_version, 3);
    }

    #[tokio::test]
    async fn wait_idle_with_no_pending_work_returns_immediately() {
        let layer = layer();
        layer.wait_idle().await;
    }
}
