//! cupid_engine — the end-to-end-encryption core of the Cupid chat backend.
//!
//! Wires the durable [`cupid_store::ProtocolStore`] and the primitives in
//! `cupid_crypto` into the operational components:
//!
//! - `keys`      — key material lifecycle (generate, bundles, replenish, rotate, delete)
//! - `session`   — X3DH + Double Ratchet sessions, per-session serialization
//! - `trust`     — identity pinning, fingerprint verification, MITM detection
//! - `audit`     — asynchronous audit trail and suspicious-activity alerts
//! - `scheduler` — replenishment / rotation / expiry sweeps
//! - `boundary`  — DTO validation and stable error codes
//!
//! One `E2eeCore` per process: the store handle and configuration are
//! initialized at startup and never mutated.

pub mod audit;
pub mod boundary;
pub mod config;
pub mod error;
pub mod keys;
pub mod locks;
pub mod scheduler;
pub mod session;
pub mod trust;
pub mod unlock;

use std::path::Path;
use std::sync::Arc;

use tokio::task::JoinHandle;

use cupid_store::ProtocolStore;

pub use audit::{AuditEvent, AuditOp, AuditSink};
pub use boundary::Boundary;
pub use config::{EngineConfig, TrustPolicy, DEFAULT_DEVICE_ID};
pub use error::EngineError;
pub use keys::KeyManager;
pub use scheduler::Scheduler;
pub use session::SessionEngine;
pub use trust::TrustLedger;
pub use unlock::UnlockCache;

pub struct E2eeCore {
    pub store: ProtocolStore,
    pub config: Arc<EngineConfig>,
    pub audit: AuditSink,
    pub keys: KeyManager,
    pub sessions: SessionEngine,
    pub trust: TrustLedger,
    pub scheduler: Scheduler,
    /// Background audit writer; ends when the last sink handle drops.
    audit_worker: JoinHandle<()>,
}

impl E2eeCore {
    /// Open the store, spawn the audit writer, and assemble the components.
    /// Call once at startup.
    pub async fn open(db_path: &Path, config: EngineConfig) -> Result<Self, EngineError> {
        let config = Arc::new(config);
        let store =
            ProtocolStore::open(db_path, config.store_timeout, config.session_cache_ttl).await?;

        let (audit, audit_worker) = AuditSink::spawn(
            store.clone(),
            config.audit_queue_depth,
            config.suspicious_window,
            config.suspicious_threshold,
        );
        let unlock = UnlockCache::new(config.unlock_ttl);
        let trust = TrustLedger::new(store.clone(), audit.clone());
        let keys = KeyManager::new(store.clone(), config.clone(), audit.clone(), unlock.clone());
        let sessions = SessionEngine::new(
            store.clone(),
            config.clone(),
            audit.clone(),
            unlock,
            trust.clone(),
        );
        let scheduler = Scheduler::new(store.clone(), config.clone(), keys.clone());

        Ok(Self {
            store,
            config,
            audit,
            keys,
            sessions,
            trust,
            scheduler,
            audit_worker,
        })
    }

    pub fn boundary(&self) -> Boundary {
        Boundary::new(
            self.keys.clone(),
            self.sessions.clone(),
            self.trust.clone(),
            self.config.clone(),
        )
    }

    /// Abort the audit writer (tests and orderly shutdown).
    pub fn shutdown(self) {
        self.audit_worker.abort();
    }
}
