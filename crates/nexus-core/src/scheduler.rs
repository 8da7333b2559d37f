//! Scheduler & Sweeper (C8): two long-running cooperative background
//! tasks, modeled on the teacher's `lease_expiry_worker`
//! (`vaultrs-server/src/main.rs`) `tokio::select!` tick/shutdown loop. Both
//! tasks observe a shutdown signal within one tick and finish in-flight
//! work before exiting.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info};

use crate::facade::NexusCore;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tick_interval: Duration,
}

/// Periodic tick; on each tick, rotates the active KEK if
/// `should_rotate()` holds. Errors are caught and logged, never panic the
/// task.
pub async fn run_scheduler(core: &NexusCore, config: SchedulerConfig, mut shutdown: watch::Receiver<bool>) {
    let mut tick = interval(config.tick_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = tick.tick() => {
                if core.kek().should_rotate().await {
                    match core.kek().rotate().await {
                        Ok(info) => info!(kek_id = %info.id, "scheduler rotated kek"),
                        Err(e) => error!(error = %e, "scheduler failed to rotate kek"),
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("scheduler observed shutdown; exiting");
                    break;
                }
            }
        }
    }
}

/// A simple token bucket: refills at `refill_interval`, holding at most
/// `capacity` tokens. `acquire` waits for a token to become available and
/// observes cancellation via `shutdown`.
struct TokenBucket {
    capacity: u32,
    tokens: u32,
    refill_interval: Duration,
}

impl TokenBucket {
    fn new(qps: u32) -> Self {
        let qps = qps.max(1);
        Self { capacity: qps, tokens: qps, refill_interval: Duration::from_secs(1) / qps }
    }

    /// Waits until a token is available or `shutdown` fires, returning
    /// `true` if a token was acquired.
    async fn acquire(&mut self, shutdown: &mut watch::Receiver<bool>) -> bool {
        if self.tokens == 0 {
            tokio::select! {
                () = tokio::time::sleep(self.refill_interval) => {
                    self.tokens = (self.tokens + 1).min(self.capacity);
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return false;
                    }
                }
            }
        }
        if self.tokens > 0 {
            self.tokens -= 1;
            true
        } else {
            false
        }
    }
}

#[derive(Debug, Clone)]
pub struct SweeperConfig {
    pub enabled: bool,
    pub max_rewrap_qps: u32,
    pub scan_interval: Duration,
}

/// Lists secrets still bound to a non-active KEK; for each, reads the
/// secret with the old KEK and re-stores it, which rewraps it under the
/// active KEK. Rate-limited to `max_rewrap_qps` using a token bucket.
pub async fn run_sweeper(core: &NexusCore, config: SweeperConfig, mut shutdown: watch::Receiver<bool>) {
    if !config.enabled {
        info!("lazy rewrap disabled; sweeper not running");
        return;
    }

    let mut bucket = TokenBucket::new(config.max_rewrap_qps);
    let mut scan_tick = interval(config.scan_interval);
    scan_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = scan_tick.tick() => {
                let active_id = core.kek().current_kek_id().await;
                let (stale_paths, _) = core.scan_non_active_kek_usage(&active_id).await;

                for path in stale_paths {
                    if !bucket.acquire(&mut shutdown).await {
                        break;
                    }
                    if let Err(e) = core.rewrap_path(&path).await {
                        error!(path, error = %e, "sweeper failed to rewrap secret");
                    }
                }

                let active_id = core.kek().current_kek_id().await;
                let (_, still_referenced) = core.scan_non_active_kek_usage(&active_id).await;
                let retired = core
                    .kek()
                    .retire_drained_grace_keks(|kek_id| still_referenced.contains(kek_id))
                    .await;
                for id in retired {
                    info!(kek_id = %id, "sweeper retired grace kek");
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("sweeper observed shutdown; exiting");
                    break;
                }
            }
        }
    }
}
