//! AuditSink — asynchronous, best-effort audit trail.
//!
//! Every cryptographic operation is recorded for forensic review. Writes go
//! through a bounded channel to a background task; a full channel or a
//! failed insert logs a warning and is otherwise dropped — an audit failure
//! must never block or fail the operation it describes.
//!
//! The sink also runs suspicious-activity detection: each recorded failure
//! triggers a count of the same user's failures inside the trailing window,
//! and crossing the threshold appends a SUSPICIOUS entry.

use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use cupid_store::ProtocolStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditOp {
    KeyGen,
    KeyRegister,
    KeyDelete,
    BundleFetch,
    SessionInit,
    Encrypt,
    Decrypt,
    FingerprintVerify,
    TrustMark,
    Suspicious,
}

impl AuditOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditOp::KeyGen => "KEY_GEN",
            AuditOp::KeyRegister => "KEY_REGISTER",
            AuditOp::KeyDelete => "KEY_DELETE",
            AuditOp::BundleFetch => "BUNDLE_FETCH",
            AuditOp::SessionInit => "SESSION_INIT",
            AuditOp::Encrypt => "ENCRYPT",
            AuditOp::Decrypt => "DECRYPT",
            AuditOp::FingerprintVerify => "FINGERPRINT_VERIFY",
            AuditOp::TrustMark => "TRUST_MARK",
            AuditOp::Suspicious => "SUSPICIOUS",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub user_id: String,
    pub op: AuditOp,
    pub peer_user_id: Option<String>,
    pub success: bool,
    pub error_kind: Option<String>,
    pub latency_nanos: i64,
    pub metadata: Option<serde_json::Value>,
}

impl AuditEvent {
    pub fn new(user_id: &str, op: AuditOp) -> Self {
        Self {
            user_id: user_id.to_string(),
            op,
            peer_user_id: None,
            success: true,
            error_kind: None,
            latency_nanos: 0,
            metadata: None,
        }
    }

    pub fn peer(mut self, peer: &str) -> Self {
        self.peer_user_id = Some(peer.to_string());
        self
    }

    pub fn outcome(mut self, error_kind: Option<&str>) -> Self {
        self.success = error_kind.is_none();
        self.error_kind = error_kind.map(str::to_string);
        self
    }

    pub fn latency(mut self, elapsed: Duration) -> Self {
        self.latency_nanos = elapsed.as_nanos() as i64;
        self
    }

    pub fn metadata(mut self, value: serde_json::Value) -> Self {
        self.metadata = Some(value);
        self
    }
}

#[derive(Clone)]
pub struct AuditSink {
    tx: mpsc::Sender<AuditEvent>,
}

impl AuditSink {
    /// Spawn the background writer. Dropping every sink handle closes the
    /// channel and ends the task.
    pub fn spawn(
        store: ProtocolStore,
        queue_depth: usize,
        window: Duration,
        threshold: i64,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<AuditEvent>(queue_depth);
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                write_event(&store, &event, window, threshold).await;
            }
        });
        (Self { tx }, handle)
    }

    /// Best-effort record. Never blocks, never fails the caller.
    pub fn record(&self, event: AuditEvent) {
        if let Err(err) = self.tx.try_send(event) {
            warn!(error = %err, "audit event dropped");
        }
    }
}

/// Persist one event and run the suspicious-failure check. Failures here are
/// logged and swallowed.
pub(crate) async fn write_event(
    store: &ProtocolStore,
    event: &AuditEvent,
    window: Duration,
    threshold: i64,
) {
    let metadata = event.metadata.as_ref().map(|m| m.to_string());
    if let Err(err) = store
        .append_audit(
            &event.user_id,
            event.op.as_str(),
            event.peer_user_id.as_deref(),
            event.success,
            event.error_kind.as_deref(),
            event.latency_nanos,
            metadata.as_deref(),
        )
        .await
    {
        warn!(error = %err, op = event.op.as_str(), "audit write failed");
        return;
    }

    if event.success {
        return;
    }

    let since = Utc::now() - chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::minutes(10));
    match store.count_recent_failures(&event.user_id, since).await {
        Ok(count) if count >= threshold => {
            let alert = serde_json::json!({
                "recentFailures": count,
                "windowSecs": window.as_secs(),
                "triggeredBy": event.op.as_str(),
            });
            if let Err(err) = store
                .append_audit(
                    &event.user_id,
                    AuditOp::Suspicious.as_str(),
                    event.peer_user_id.as_deref(),
                    true,
                    None,
                    0,
                    Some(&alert.to_string()),
                )
                .await
            {
                warn!(error = %err, "suspicious-activity entry failed");
            }
        }
        Ok(_) => {}
        Err(err) => warn!(error = %err, "suspicious-activity count failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use uuid::Uuid;

    async fn open_temp() -> (ProtocolStore, PathBuf) {
        let db_path = PathBuf::from(format!("/tmp/cupid-audit-test-{}.db", Uuid::new_v4()));
        let store = ProtocolStore::open(
            &db_path,
            Duration::from_secs(5),
            Duration::from_secs(3600),
        )
        .await
        .expect("open store");
        (store, db_path)
    }

    fn cleanup(db_path: &std::path::Path) {
        let _ = std::fs::remove_file(db_path);
        let _ = std::fs::remove_file(db_path.with_extension("db-wal"));
        let _ = std::fs::remove_file(db_path.with_extension("db-shm"));
    }

    #[tokio::test]
    async fn threshold_crossing_emits_suspicious_entry() {
        let (store, path) = open_temp().await;
        let window = Duration::from_secs(600);

        for _ in 0..5 {
            let event = AuditEvent::new("mallory", AuditOp::Decrypt).outcome(Some("Undecipherable"));
            write_event(&store, &event, window, 5).await;
        }

        let suspicious: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM audit_log WHERE user_id = ? AND op = 'SUSPICIOUS'",
        )
        .bind("mallory")
        .fetch_one(&store.pool)
        .await
        .unwrap();
        assert!(suspicious >= 1, "five failures inside the window must raise an alert");
        cleanup(&path);
    }

    #[tokio::test]
    async fn below_threshold_stays_quiet() {
        let (store, path) = open_temp().await;
        let window = Duration::from_secs(600);

        for _ in 0..3 {
            let event = AuditEvent::new("alice", AuditOp::Decrypt).outcome(Some("Undecipherable"));
            write_event(&store, &event, window, 5).await;
        }

        let suspicious: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM audit_log WHERE user_id = ? AND op = 'SUSPICIOUS'",
        )
        .bind("alice")
        .fetch_one(&store.pool)
        .await
        .unwrap();
        assert_eq!(suspicious, 0);
        cleanup(&path);
    }
}
