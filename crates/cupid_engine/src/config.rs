//! Process-wide engine configuration.
//!
//! Initialized once at startup and never mutated afterwards; every component
//! holds the same `Arc<EngineConfig>`.

use std::time::Duration;

use cupid_crypto::ratchet::RatchetLimits;
use cupid_crypto::vault::VaultConfig;

/// Trust policy consulted at session initiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustPolicy {
    /// Initiation against a CHANGED identity fails until explicitly trusted.
    Strict,
    /// Trust-on-first-use: key changes are recorded and audited but do not
    /// block initiation.
    Tofu,
}

#[derive(Clone)]
pub struct EngineConfig {
    /// Passphrase sealing of long-term private keys.
    pub vault: VaultConfig,
    /// Process-wide key sealing session records at rest. Must be stable
    /// across restarts or every session becomes unreadable.
    pub store_key: [u8; 32],
    pub trust_policy: TrustPolicy,

    /// One-time prekeys generated with the initial key set.
    pub one_time_prekey_batch: usize,
    /// Bundle fetches log an alert below this count.
    pub one_time_prekey_low_water: i64,
    /// Replenishment sweep tops users back up to this count.
    pub one_time_prekey_target: i64,
    pub one_time_prekey_ttl_days: i64,
    /// Used one-time prekey rows are purged after this grace period.
    pub used_prekey_grace_days: i64,

    pub signed_prekey_rotation_days: i64,
    /// Demoted signed prekeys stay openable this long for in-flight handshakes.
    pub signed_prekey_overlap_days: i64,

    pub session_idle_days: i64,
    pub ratchet: RatchetLimits,

    pub store_timeout: Duration,
    pub session_cache_ttl: Duration,
    /// How long a passphrase-bearing operation keeps the identity unlocked.
    pub unlock_ttl: Duration,

    pub suspicious_window: Duration,
    pub suspicious_threshold: i64,
    pub audit_queue_depth: usize,

    pub max_plaintext_len: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            vault: VaultConfig::default(),
            // Deployments MUST provide a real key; an all-zero key only ever
            // appears in throwaway test stores.
            store_key: [0u8; 32],
            trust_policy: TrustPolicy::Strict,
            one_time_prekey_batch: 100,
            one_time_prekey_low_water: 20,
            one_time_prekey_target: 100,
            one_time_prekey_ttl_days: 90,
            used_prekey_grace_days: 30,
            signed_prekey_rotation_days: 7,
            signed_prekey_overlap_days: 7,
            session_idle_days: 90,
            ratchet: RatchetLimits::default(),
            store_timeout: Duration::from_secs(5),
            session_cache_ttl: Duration::from_secs(3600),
            unlock_ttl: Duration::from_secs(12 * 3600),
            suspicious_window: Duration::from_secs(600),
            suspicious_threshold: 5,
            audit_queue_depth: 1024,
            max_plaintext_len: 64 * 1024,
        }
    }
}

/// The only device id the wire accepts until a multi-device design lands.
pub const DEFAULT_DEVICE_ID: u32 = 1;
