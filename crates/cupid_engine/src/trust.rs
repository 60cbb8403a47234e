//! TrustLedger — first-seen identity pinning and MITM detection.
//!
//! Key-change policy (NON-NEGOTIABLE):
//! if a stored identity key for a known peer changes, trust transitions to
//! CHANGED, a high-severity audit entry is emitted, and nothing ever
//! auto-promotes back to TRUSTED. Re-verification is an explicit user act.

use std::time::Instant;

use cupid_crypto::identity::PublicKeyBytes;
use cupid_store::{IdentityObservation, ProtocolStore, StoreError, TrustState};

use crate::{
    audit::{AuditEvent, AuditOp, AuditSink},
    error::EngineError,
};

#[derive(Clone)]
pub struct TrustLedger {
    store: ProtocolStore,
    audit: AuditSink,
}

impl TrustLedger {
    pub fn new(store: ProtocolStore, audit: AuditSink) -> Self {
        Self { store, audit }
    }

    /// Record an observed identity key for (observer → subject).
    ///
    /// First contact inserts UNTRUSTED; an unchanged key is a no-op; a
    /// changed key flips trust to CHANGED and raises a SUSPICIOUS entry.
    pub async fn observe(
        &self,
        observer: &str,
        subject: &str,
        device: i64,
        key: &PublicKeyBytes,
    ) -> Result<IdentityObservation, EngineError> {
        let observation = self
            .store
            .upsert_remote_identity(observer, subject, device, &key.to_wire())
            .await?;

        if observation == IdentityObservation::Changed {
            tracing::warn!(observer, subject, "identity key change detected");
            self.audit.record(
                AuditEvent::new(observer, AuditOp::Suspicious)
                    .peer(subject)
                    .metadata(serde_json::json!({
                        "event": "identityKeyChanged",
                        "newFingerprint": key.fingerprint(),
                    })),
            );
        }
        Ok(observation)
    }

    pub async fn trust_state(
        &self,
        observer: &str,
        subject: &str,
        device: i64,
    ) -> Result<Option<TrustState>, EngineError> {
        Ok(self
            .store
            .load_remote_identity(observer, subject, device)
            .await?
            .map(|row| row.trust))
    }

    /// Constant-time fingerprint comparison against the stored key.
    /// Returns the boolean only — no state transition.
    pub async fn verify_fingerprint(
        &self,
        observer: &str,
        subject: &str,
        device: i64,
        claimed: &str,
    ) -> Result<bool, EngineError> {
        let start = Instant::now();
        let row = self.store.load_remote_identity(observer, subject, device).await?;
        let matches = match row {
            Some(row) => PublicKeyBytes::from_wire(&row.peer_public_key)
                .map(|key| key.fingerprint_matches(claimed))
                .unwrap_or(false),
            None => false,
        };
        self.audit.record(
            AuditEvent::new(observer, AuditOp::FingerprintVerify)
                .peer(subject)
                .latency(start.elapsed())
                .metadata(serde_json::json!({ "match": matches })),
        );
        Ok(matches)
    }

    /// Explicit user verification: UNTRUSTED | CHANGED → TRUSTED.
    pub async fn trust(
        &self,
        observer: &str,
        subject: &str,
        device: i64,
    ) -> Result<(), EngineError> {
        let start = Instant::now();
        let result = self
            .store
            .set_trust(observer, subject, device, TrustState::Trusted)
            .await
            .map_err(|err| match err {
                StoreError::NotFound(_) => EngineError::MissingKeys,
                other => other.into(),
            });
        self.audit.record(
            AuditEvent::new(observer, AuditOp::TrustMark)
                .peer(subject)
                .latency(start.elapsed())
                .outcome(result.as_ref().err().map(|e| e.code())),
        );
        result
    }
}
