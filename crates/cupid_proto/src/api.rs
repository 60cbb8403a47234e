//! Request/response bodies for the key and session endpoints.
//! These map directly to JSON on the wire; field names are camelCase.
//! Key material travels as base64 of its canonical serialization.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::envelope::MessageType;

// ── Key management ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateKeysRequest {
    pub passphrase: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedPreKeyDto {
    pub key_id: u32,
    /// Base64 canonical X25519 public key
    pub public_key: String,
    /// Base64 Ed25519 signature over the raw public key bytes
    pub signature: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OneTimePreKeyDto {
    pub key_id: u32,
    /// Base64 canonical X25519 public key
    pub public_key: String,
}

/// Response to `keys/generate` — public material only, privates stay sealed
/// server-side.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateKeysResponse {
    pub registration_id: u32,
    /// Base64 canonical Ed25519 identity public key
    pub identity_public: String,
    pub device_id: u32,
    pub signed_pre_key: SignedPreKeyDto,
    pub one_time_pre_keys: Vec<OneTimePreKeyDto>,
}

/// Body of `keys/register`: the generate response minus private material,
/// posted back for acknowledgement.
pub type KeyRegistration = GenerateKeysResponse;

/// Response to `keys/bundle/{userId}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreKeyBundleDto {
    pub user_id: String,
    pub device_id: u32,
    pub registration_id: u32,
    /// Base64 canonical Ed25519 identity public key
    pub identity_key: String,
    pub signed_pre_key: SignedPreKeyDto,
    /// Absent when the user's one-time pre-keys are exhausted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub one_time_pre_key: Option<OneTimePreKeyDto>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplenishRequest {
    pub one_time_pre_keys: Vec<OneTimePreKeyDto>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplenishResponse {
    pub added: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RotateSignedPreKeyRequest {
    pub passphrase: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RotateSignedPreKeyResponse {
    pub new_key_id: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyStatusResponse {
    pub has_identity: bool,
    pub has_active_signed_pre_key: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signed_pre_key_expiry: Option<DateTime<Utc>>,
    pub available_one_time_pre_keys: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity_created_at: Option<DateTime<Utc>>,
}

// ── Sessions ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInitRequest {
    pub peer_user_id: String,
    pub peer_device_id: u32,
    pub bundle: PreKeyBundleDto,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptRequest {
    pub peer_user_id: String,
    pub peer_device_id: u32,
    pub plaintext: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptResponse {
    pub sender_id: String,
    pub recipient_id: String,
    pub device_id: u32,
    /// Base64 of the canonical envelope bytes
    pub encrypted_content: String,
    pub message_type: MessageType,
    pub registration_id: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecryptRequest {
    pub sender_id: String,
    pub device_id: u32,
    pub encrypted_content: String,
    pub message_type: MessageType,
    pub registration_id: u32,
    pub passphrase: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecryptResponse {
    pub plaintext: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HasSessionResponse {
    pub exists: bool,
}

// ── Identity verification ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyFingerprintRequest {
    pub peer: String,
    pub fingerprint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyFingerprintResponse {
    #[serde(rename = "match")]
    pub is_match: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustRequest {
    pub peer: String,
    pub device_id: u32,
}

// ── Common ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OkResponse {
    pub ok: bool,
}

impl OkResponse {
    pub fn ok() -> Self {
        Self { ok: true }
    }
}

/// Stable error surface: a code from the fixed taxonomy plus one line of
/// context. No stack traces, no internal identifiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_field_names_are_camel_case() {
        let dto = KeyStatusResponse {
            has_identity: true,
            has_active_signed_pre_key: false,
            signed_pre_key_expiry: None,
            available_one_time_pre_keys: 3,
            identity_created_at: None,
        };
        let json = serde_json::to_string(&dto).unwrap();
        assert!(json.contains("hasIdentity"));
        assert!(json.contains("availableOneTimePreKeys"));
        assert!(!json.contains("signedPreKeyExpiry"), "absent option must be omitted");
    }

    #[test]
    fn message_type_uses_upper_case_tags() {
        assert_eq!(serde_json::to_string(&MessageType::Prekey).unwrap(), "\"PREKEY\"");
        assert_eq!(serde_json::to_string(&MessageType::Normal).unwrap(), "\"NORMAL\"");
    }

    #[test]
    fn fingerprint_match_field_name() {
        let json = serde_json::to_string(&VerifyFingerprintResponse { is_match: true }).unwrap();
        assert_eq!(json, "{\"match\":true}");
    }
}
