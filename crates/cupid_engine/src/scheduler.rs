//! Scheduler — periodic maintenance sweeps.
//!
//! Three loops: hourly replenishment, daily signed-prekey rotation, daily
//! expiry. Each sweep is also a standalone idempotent function so a restart
//! can rerun it safely: ids are reserved only by durable writes, so a crash
//! between generate and persist leaves the store consistent.
//!
//! Replenishment and rotation need the owner's passphrase; only users with a
//! cached unlocked identity are handled automatically, the rest are flagged
//! for client action.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{info, warn};

use cupid_store::ProtocolStore;

use crate::{
    config::EngineConfig,
    error::EngineError,
    keys::{KeyManager, ROTATION_KIND_SIGNED_PREKEY},
};

const REPLENISH_EVERY: Duration = Duration::from_secs(3600);
const ROTATE_EVERY: Duration = Duration::from_secs(24 * 3600);
const EXPIRE_EVERY: Duration = Duration::from_secs(24 * 3600);

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ExpirySweepReport {
    pub purged_one_time_prekeys: u64,
    pub purged_signed_prekeys: u64,
    pub purged_sessions: u64,
}

#[derive(Clone)]
pub struct Scheduler {
    store: ProtocolStore,
    config: Arc<EngineConfig>,
    keys: KeyManager,
}

impl Scheduler {
    pub fn new(store: ProtocolStore, config: Arc<EngineConfig>, keys: KeyManager) -> Self {
        Self { store, config, keys }
    }

    /// Spawn all three loops. Handles are detached by the caller or kept for
    /// shutdown.
    pub fn spawn(&self) -> Vec<JoinHandle<()>> {
        let replenish = {
            let scheduler = self.clone();
            tokio::spawn(async move {
                let mut ticker = time::interval(REPLENISH_EVERY);
                loop {
                    ticker.tick().await;
                    match scheduler.run_replenish_sweep().await {
                        Ok(added) if added > 0 => info!(added, "replenishment sweep done"),
                        Ok(_) => {}
                        Err(err) => warn!(error = %err, "replenishment sweep failed"),
                    }
                }
            })
        };
        let rotate = {
            let scheduler = self.clone();
            tokio::spawn(async move {
                let mut ticker = time::interval(ROTATE_EVERY);
                loop {
                    ticker.tick().await;
                    match scheduler.run_rotation_sweep().await {
                        Ok(rotated) if rotated > 0 => info!(rotated, "rotation sweep done"),
                        Ok(_) => {}
                        Err(err) => warn!(error = %err, "rotation sweep failed"),
                    }
                }
            })
        };
        let expire = {
            let scheduler = self.clone();
            tokio::spawn(async move {
                let mut ticker = time::interval(EXPIRE_EVERY);
                loop {
                    ticker.tick().await;
                    match scheduler.run_expiry_sweep().await {
                        Ok(report) => {
                            if report != ExpirySweepReport::default() {
                                info!(
                                    otpks = report.purged_one_time_prekeys,
                                    spks = report.purged_signed_prekeys,
                                    sessions = report.purged_sessions,
                                    "expiry sweep done"
                                );
                            }
                        }
                        Err(err) => warn!(error = %err, "expiry sweep failed"),
                    }
                }
            })
        };
        vec![replenish, rotate, expire]
    }

    /// Top up every user below the low-water mark to the target count.
    pub async fn run_replenish_sweep(&self) -> Result<u32, EngineError> {
        let mut added = 0;
        for user in self.store.users_with_identity().await? {
            let count = self.store.count_available_one_time_prekeys(&user).await?;
            if count >= self.config.one_time_prekey_low_water {
                continue;
            }
            match self.keys.unlock_cache().get(&user) {
                Some(passphrase) => {
                    let need = (self.config.one_time_prekey_target - count).max(0) as usize;
                    match self.keys.replenish_by(&user, &passphrase, need).await {
                        Ok(n) => added += n,
                        Err(err) => warn!(user, error = %err, "replenishment failed"),
                    }
                }
                None => {
                    warn!(user, count, "one-time prekeys low but identity locked; client action required");
                }
            }
        }
        Ok(added)
    }

    /// Rotate signed prekeys older than the rotation interval.
    pub async fn run_rotation_sweep(&self) -> Result<u32, EngineError> {
        let cutoff = Utc::now() - ChronoDuration::days(self.config.signed_prekey_rotation_days);
        let mut rotated = 0;
        for user in self.store.users_with_stale_signed_prekey(cutoff).await? {
            // The rotation history guards against over-rotating when the
            // sweep reruns after a crash.
            if let Some(at) = self
                .store
                .last_key_rotation(&user, ROTATION_KIND_SIGNED_PREKEY)
                .await?
            {
                if at > cutoff {
                    continue;
                }
            }
            match self.keys.unlock_cache().get(&user) {
                Some(passphrase) => {
                    match self
                        .keys
                        .rotate_signed_prekey(&user, &passphrase, "scheduled")
                        .await
                    {
                        Ok(_) => rotated += 1,
                        Err(err) => warn!(user, error = %err, "scheduled rotation failed"),
                    }
                }
                None => warn!(user, "signed prekey stale but identity locked; client action required"),
            }
        }
        Ok(rotated)
    }

    /// Purge used one-time prekeys past the grace period, signed prekeys
    /// past their overlap window, and idle sessions.
    pub async fn run_expiry_sweep(&self) -> Result<ExpirySweepReport, EngineError> {
        let now = Utc::now();
        let purged_one_time_prekeys = self
            .store
            .purge_used_one_time_prekeys(now - ChronoDuration::days(self.config.used_prekey_grace_days))
            .await?;
        let purged_signed_prekeys = self.store.purge_expired_signed_prekeys(now).await?;
        let purged_sessions = self
            .store
            .purge_idle_sessions(now - ChronoDuration::days(self.config.session_idle_days))
            .await?;
        Ok(ExpirySweepReport {
            purged_one_time_prekeys,
            purged_signed_prekeys,
            purged_sessions,
        })
    }
}
