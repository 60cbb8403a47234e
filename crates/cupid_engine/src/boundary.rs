//! Boundary — the thin request/response shell.
//!
//! Resolves the authenticated caller, validates DTOs (sizes, encodings, the
//! reserved device id), routes into the key manager / session engine /
//! trust ledger, and maps engine errors onto stable wire codes. Contains no
//! cryptographic logic.

use std::sync::Arc;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};

use cupid_proto::api::*;

use crate::{
    config::{EngineConfig, DEFAULT_DEVICE_ID},
    error::EngineError,
    keys::KeyManager,
    session::SessionEngine,
    trust::TrustLedger,
};

/// Envelopes larger than this are rejected before any decode work.
const MAX_ENVELOPE_B64_LEN: usize = 1024 * 1024;

#[derive(Clone)]
pub struct Boundary {
    keys: KeyManager,
    sessions: SessionEngine,
    trust: TrustLedger,
    config: Arc<EngineConfig>,
}

impl Boundary {
    pub fn new(
        keys: KeyManager,
        sessions: SessionEngine,
        trust: TrustLedger,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self { keys, sessions, trust, config }
    }

    /// One stable code + one line per kind; nothing internal leaks.
    pub fn error_response(err: &EngineError) -> ErrorResponse {
        ErrorResponse {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }

    // ── keys/* ───────────────────────────────────────────────────────────────

    pub async fn generate_keys(
        &self,
        caller: &str,
        req: GenerateKeysRequest,
    ) -> Result<GenerateKeysResponse, EngineError> {
        let caller = validate_user_id(caller)?;
        if req.passphrase.is_empty() {
            return Err(EngineError::WeakPassphrase("passphrase is required".into()));
        }
        self.keys.generate_initial_keys(caller, &req.passphrase).await
    }

    pub async fn register_keys(
        &self,
        caller: &str,
        registration: KeyRegistration,
    ) -> Result<OkResponse, EngineError> {
        let caller = validate_user_id(caller)?;
        validate_device_id(registration.device_id)?;
        self.keys.register_keys(caller, &registration).await?;
        Ok(OkResponse::ok())
    }

    pub async fn fetch_bundle(
        &self,
        caller: &str,
        user_id: &str,
        device_id: u32,
    ) -> Result<PreKeyBundleDto, EngineError> {
        let caller = validate_user_id(caller)?;
        let user_id = validate_user_id(user_id)?;
        validate_device_id(device_id)?;
        self.keys.fetch_prekey_bundle(caller, user_id).await
    }

    pub async fn replenish(
        &self,
        caller: &str,
        req: ReplenishRequest,
    ) -> Result<ReplenishResponse, EngineError> {
        let caller = validate_user_id(caller)?;
        let ids: Vec<i64> = req.one_time_pre_keys.iter().map(|k| k.key_id as i64).collect();
        let added = self.keys.replenish_from_request(caller, &ids).await?;
        Ok(ReplenishResponse { added })
    }

    pub async fn rotate_signed_prekey(
        &self,
        caller: &str,
        req: RotateSignedPreKeyRequest,
    ) -> Result<RotateSignedPreKeyResponse, EngineError> {
        let caller = validate_user_id(caller)?;
        if req.passphrase.is_empty() {
            return Err(EngineError::WeakPassphrase("passphrase is required".into()));
        }
        let new_key_id = self
            .keys
            .rotate_signed_prekey(caller, &req.passphrase, "manual")
            .await?;
        Ok(RotateSignedPreKeyResponse { new_key_id })
    }

    pub async fn key_status(&self, caller: &str) -> Result<KeyStatusResponse, EngineError> {
        let caller = validate_user_id(caller)?;
        self.keys.key_status(caller).await
    }

    pub async fn delete_keys(&self, caller: &str) -> Result<OkResponse, EngineError> {
        let caller = validate_user_id(caller)?;
        self.keys.delete_all_keys(caller).await?;
        Ok(OkResponse::ok())
    }

    // ── session/* ────────────────────────────────────────────────────────────

    pub async fn init_session(
        &self,
        caller: &str,
        req: SessionInitRequest,
    ) -> Result<OkResponse, EngineError> {
        let caller = validate_user_id(caller)?;
        let peer = validate_user_id(&req.peer_user_id)?;
        validate_device_id(req.peer_device_id)?;
        self.sessions
            .init_outbound(caller, peer, req.peer_device_id as i64, &req.bundle)
            .await?;
        Ok(OkResponse::ok())
    }

    pub async fn encrypt(
        &self,
        caller: &str,
        req: EncryptRequest,
    ) -> Result<EncryptResponse, EngineError> {
        let caller = validate_user_id(caller)?;
        let peer = validate_user_id(&req.peer_user_id)?;
        validate_device_id(req.peer_device_id)?;
        if req.plaintext.len() > self.config.max_plaintext_len {
            return Err(EngineError::BadKeys("plaintext exceeds size limit".into()));
        }

        let out = self
            .sessions
            .encrypt(caller, peer, req.peer_device_id as i64, req.plaintext.as_bytes())
            .await?;
        Ok(EncryptResponse {
            sender_id: caller.to_string(),
            recipient_id: peer.to_string(),
            device_id: req.peer_device_id,
            encrypted_content: URL_SAFE_NO_PAD.encode(&out.envelope),
            message_type: out.message_type,
            registration_id: out.registration_id,
        })
    }

    pub async fn decrypt(
        &self,
        caller: &str,
        req: DecryptRequest,
    ) -> Result<DecryptResponse, EngineError> {
        let caller = validate_user_id(caller)?;
        let sender = validate_user_id(&req.sender_id)?;
        validate_device_id(req.device_id)?;
        if req.encrypted_content.len() > MAX_ENVELOPE_B64_LEN {
            return Err(EngineError::BadKeys("envelope exceeds size limit".into()));
        }
        let envelope = URL_SAFE_NO_PAD
            .decode(&req.encrypted_content)
            .map_err(|e| EngineError::BadKeys(e.to_string()))?;

        let plaintext = self
            .sessions
            .decrypt(caller, sender, req.device_id as i64, &envelope, &req.passphrase)
            .await?;
        let plaintext =
            String::from_utf8(plaintext).map_err(|_| EngineError::Undecipherable)?;
        Ok(DecryptResponse { plaintext })
    }

    pub async fn has_session(
        &self,
        caller: &str,
        peer: &str,
        device_id: u32,
    ) -> Result<HasSessionResponse, EngineError> {
        let caller = validate_user_id(caller)?;
        let peer = validate_user_id(peer)?;
        validate_device_id(device_id)?;
        let exists = self.sessions.has_session(caller, peer, device_id as i64).await?;
        Ok(HasSessionResponse { exists })
    }

    pub async fn delete_session(
        &self,
        caller: &str,
        peer: &str,
        device_id: u32,
    ) -> Result<OkResponse, EngineError> {
        let caller = validate_user_id(caller)?;
        let peer = validate_user_id(peer)?;
        validate_device_id(device_id)?;
        self.sessions.delete_session(caller, peer, device_id as i64).await?;
        Ok(OkResponse::ok())
    }

    // ── identity/* ───────────────────────────────────────────────────────────

    pub async fn verify_identity(
        &self,
        caller: &str,
        req: VerifyFingerprintRequest,
    ) -> Result<VerifyFingerprintResponse, EngineError> {
        let caller = validate_user_id(caller)?;
        let peer = validate_user_id(&req.peer)?;
        let is_match = self
            .trust
            .verify_fingerprint(caller, peer, DEFAULT_DEVICE_ID as i64, &req.fingerprint)
            .await?;
        Ok(VerifyFingerprintResponse { is_match })
    }

    pub async fn trust_identity(
        &self,
        caller: &str,
        req: TrustRequest,
    ) -> Result<OkResponse, EngineError> {
        let caller = validate_user_id(caller)?;
        let peer = validate_user_id(&req.peer)?;
        validate_device_id(req.device_id)?;
        self.trust.trust(caller, peer, req.device_id as i64).await?;
        Ok(OkResponse::ok())
    }
}

fn validate_user_id(user_id: &str) -> Result<&str, EngineError> {
    if user_id.is_empty() || user_id.len() > 128 {
        return Err(EngineError::BadKeys("invalid user id".into()));
    }
    Ok(user_id)
}

/// Multi-device routing is reserved in the wire shapes but not supported;
/// anything but the default device is rejected outright.
fn validate_device_id(device_id: u32) -> Result<(), EngineError> {
    if device_id != DEFAULT_DEVICE_ID {
        return Err(EngineError::BadKeys("multi-device routing is not supported".into()));
    }
    Ok(())
}
