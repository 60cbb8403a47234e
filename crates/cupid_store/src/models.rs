//! Database row models — these map to/from SQL rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Trust state of an observed remote identity key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "UPPERCASE")]
pub enum TrustState {
    Untrusted,
    Trusted,
    Changed,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct IdentityRow {
    pub user_id: String,
    pub device_id: i64,
    /// Canonical wire form (version byte + 32 raw bytes)
    pub public_key: Vec<u8>,
    /// Vault-sealed Ed25519 secret
    pub sealed_private_key: Vec<u8>,
    pub registration_id: i64,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SignedPreKeyRow {
    pub user_id: String,
    pub key_id: i64,
    /// Raw X25519 public (32 bytes)
    pub public_key: Vec<u8>,
    pub sealed_private_key: Vec<u8>,
    /// Ed25519 signature by the identity key over the raw public bytes
    pub signature: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct OneTimePreKeyRow {
    pub user_id: String,
    pub key_id: i64,
    pub public_key: Vec<u8>,
    /// None once a handshake has consumed the private half.
    pub sealed_private_key: Option<Vec<u8>>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub used: bool,
    pub used_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SessionRow {
    pub owner_user_id: String,
    pub peer_user_id: String,
    pub peer_device_id: i64,
    /// Sealed serialized ratchet state; updated on every send and receive.
    pub sealed_session_record: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RemoteIdentityRow {
    pub owner_user_id: String,
    pub peer_user_id: String,
    pub peer_device_id: i64,
    /// Canonical wire form of the peer's identity public key
    pub peer_public_key: Vec<u8>,
    pub trust: TrustState,
    pub first_seen_at: DateTime<Utc>,
    pub last_verified_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AuditRow {
    pub id: i64,
    pub user_id: String,
    pub op: String,
    pub peer_user_id: Option<String>,
    pub success: bool,
    pub error_kind: Option<String>,
    pub latency_nanos: i64,
    pub metadata: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct KeyRotationRow {
    pub id: i64,
    pub user_id: String,
    pub key_kind: String,
    pub rotated_at: DateTime<Utc>,
    pub reason: String,
}
