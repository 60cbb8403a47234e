//! KeyManager — key material lifecycle.
//!
//! Generates the initial key set (identity + signed prekey + one-time
//! batch), serves prekey bundles, replenishes one-time prekeys, rotates
//! signed prekeys, and destroys everything a user owns.
//!
//! Every private half is sealed through the vault before it touches a row;
//! sealed blobs are opened for exactly one operation.

use std::sync::Arc;
use std::time::Instant;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::warn;

use cupid_crypto::{
    identity::{generate_registration_id, IdentityKeyPair, PublicKeyBytes},
    vault::{self, KeyKind},
    x3dh,
};
use cupid_proto::api::{
    GenerateKeysResponse, KeyRegistration, KeyStatusResponse, OneTimePreKeyDto, PreKeyBundleDto,
    SignedPreKeyDto,
};
use cupid_store::models::{IdentityRow, OneTimePreKeyRow, SignedPreKeyRow};
use cupid_store::ProtocolStore;

use crate::{
    audit::{AuditEvent, AuditOp, AuditSink},
    config::{EngineConfig, DEFAULT_DEVICE_ID},
    error::EngineError,
    locks::KeyedLocks,
    unlock::UnlockCache,
};

pub const ROTATION_KIND_SIGNED_PREKEY: &str = "SIGNED_PRE_KEY";
pub const ROTATION_KIND_IDENTITY: &str = "IDENTITY";

#[derive(Clone)]
pub struct KeyManager {
    store: ProtocolStore,
    config: Arc<EngineConfig>,
    audit: AuditSink,
    unlock: UnlockCache,
    user_locks: Arc<KeyedLocks<String>>,
}

impl KeyManager {
    pub fn new(
        store: ProtocolStore,
        config: Arc<EngineConfig>,
        audit: AuditSink,
        unlock: UnlockCache,
    ) -> Self {
        Self {
            store,
            config,
            audit,
            unlock,
            user_locks: Arc::new(KeyedLocks::new()),
        }
    }

    // ── Generation ───────────────────────────────────────────────────────────

    /// Generate a complete key set. Destroys any existing material first —
    /// regenerating an identity invalidates every session the user owns.
    pub async fn generate_initial_keys(
        &self,
        user_id: &str,
        passphrase: &str,
    ) -> Result<GenerateKeysResponse, EngineError> {
        let start = Instant::now();
        let result = self.generate_inner(user_id, passphrase).await;
        self.audit.record(
            AuditEvent::new(user_id, AuditOp::KeyGen)
                .latency(start.elapsed())
                .outcome(result.as_ref().err().map(|e| e.code())),
        );
        result
    }

    async fn generate_inner(
        &self,
        user_id: &str,
        passphrase: &str,
    ) -> Result<GenerateKeysResponse, EngineError> {
        vault::check_passphrase_policy(passphrase, &self.config.vault)
            .map_err(EngineError::from_vault)?;

        let lock = self.user_locks.get(&user_id.to_string());
        let _guard = lock.lock().await;

        let had_identity = self.store.load_active_identity(user_id, 1).await?.is_some();
        if had_identity {
            self.store.append_key_rotation(user_id, ROTATION_KIND_IDENTITY, "regenerated").await?;
        }
        self.delete_all_inner(user_id).await?;

        let now = Utc::now();
        let identity = IdentityKeyPair::generate();
        let registration_id = generate_registration_id();

        let sealed_identity = vault::seal(
            identity.secret_bytes(),
            passphrase,
            user_id,
            KeyKind::Identity,
            &self.config.vault,
        )
        .map_err(EngineError::from_vault)?;

        let identity_row = IdentityRow {
            user_id: user_id.to_string(),
            device_id: 1,
            public_key: identity.public.to_wire(),
            sealed_private_key: sealed_identity,
            registration_id: registration_id as i64,
            created_at: now,
            expires_at: None,
        };

        let (spk_secret, spk_public, spk_sig) = x3dh::generate_signed_prekey(&identity);
        let sealed_spk = vault::seal(
            &spk_secret.to_bytes(),
            passphrase,
            user_id,
            KeyKind::SignedPreKey,
            &self.config.vault,
        )
        .map_err(EngineError::from_vault)?;

        let spk_row = SignedPreKeyRow {
            user_id: user_id.to_string(),
            key_id: 1,
            public_key: PublicKeyBytes(*spk_public.as_bytes()).to_wire(),
            sealed_private_key: sealed_spk,
            signature: spk_sig.clone(),
            created_at: now,
            expires_at: None,
            active: true,
        };

        let (otpk_rows, otpk_dtos) =
            self.build_one_time_batch(user_id, passphrase, 0, self.config.one_time_prekey_batch)?;

        self.store
            .save_initial_keys(&identity_row, &spk_row, &otpk_rows)
            .await?;

        self.unlock.insert(user_id, passphrase);

        Ok(GenerateKeysResponse {
            registration_id,
            identity_public: identity.public.to_b64(),
            device_id: DEFAULT_DEVICE_ID,
            signed_pre_key: SignedPreKeyDto {
                key_id: 1,
                public_key: URL_SAFE_NO_PAD.encode(&spk_row.public_key),
                signature: URL_SAFE_NO_PAD.encode(&spk_sig),
            },
            one_time_pre_keys: otpk_dtos,
        })
    }

    /// Seal a batch of fresh one-time prekeys with ids `first_id..`.
    fn build_one_time_batch(
        &self,
        user_id: &str,
        passphrase: &str,
        first_id: i64,
        count: usize,
    ) -> Result<(Vec<OneTimePreKeyRow>, Vec<OneTimePreKeyDto>), EngineError> {
        let now = Utc::now();
        let expires_at = now + ChronoDuration::days(self.config.one_time_prekey_ttl_days);
        let mut rows = Vec::with_capacity(count);
        let mut dtos = Vec::with_capacity(count);
        for (i, (secret, public)) in x3dh::generate_one_time_prekeys(count).into_iter().enumerate() {
            let key_id = first_id + i as i64;
            let sealed = vault::seal(
                &secret.to_bytes(),
                passphrase,
                user_id,
                KeyKind::OneTimePreKey,
                &self.config.vault,
            )
            .map_err(EngineError::from_vault)?;
            let public_wire = PublicKeyBytes(*public.as_bytes()).to_wire();
            dtos.push(OneTimePreKeyDto {
                key_id: key_id as u32,
                public_key: URL_SAFE_NO_PAD.encode(&public_wire),
            });
            rows.push(OneTimePreKeyRow {
                user_id: user_id.to_string(),
                key_id,
                public_key: public_wire,
                sealed_private_key: Some(sealed),
                created_at: now,
                expires_at: Some(expires_at),
                used: false,
                used_at: None,
            });
        }
        Ok((rows, dtos))
    }

    // ── Registration ─────────────────────────────────────────────────────────

    /// Acknowledge posted public material against the stored rows.
    /// Idempotent for a matching registration id; a mismatch is a conflict.
    pub async fn register_keys(
        &self,
        user_id: &str,
        registration: &KeyRegistration,
    ) -> Result<(), EngineError> {
        let start = Instant::now();
        let result = async {
            let identity = self
                .store
                .load_active_identity(user_id, 1)
                .await?
                .ok_or(EngineError::MissingKeys)?;
            let stored_public = URL_SAFE_NO_PAD.encode(&identity.public_key);
            if identity.registration_id != registration.registration_id as i64
                || stored_public != registration.identity_public
            {
                return Err(EngineError::Conflict("registration does not match stored keys".into()));
            }
            Ok(())
        }
        .await;
        self.audit.record(
            AuditEvent::new(user_id, AuditOp::KeyRegister)
                .latency(start.elapsed())
                .outcome(result.as_ref().err().map(|e| e.code())),
        );
        result
    }

    // ── Bundles ──────────────────────────────────────────────────────────────

    /// Assemble a prekey bundle, atomically claiming one one-time prekey.
    /// Shortage is not an error: the bundle simply omits the one-time key.
    pub async fn fetch_prekey_bundle(
        &self,
        requester: &str,
        user_id: &str,
    ) -> Result<PreKeyBundleDto, EngineError> {
        let start = Instant::now();
        let result = self.fetch_bundle_inner(user_id).await;
        self.audit.record(
            AuditEvent::new(user_id, AuditOp::BundleFetch)
                .peer(requester)
                .latency(start.elapsed())
                .outcome(result.as_ref().err().map(|e| e.code()))
                .metadata(serde_json::json!({ "requester": requester })),
        );
        result
    }

    async fn fetch_bundle_inner(&self, user_id: &str) -> Result<PreKeyBundleDto, EngineError> {
        let identity = self
            .store
            .load_active_identity(user_id, 1)
            .await?
            .ok_or(EngineError::MissingKeys)?;
        let spk = self
            .store
            .load_active_signed_prekey(user_id)
            .await?
            .ok_or(EngineError::MissingKeys)?;

        let claimed = self.store.claim_one_time_prekey(user_id).await?;
        let remaining = self.store.count_available_one_time_prekeys(user_id).await?;
        if remaining < self.config.one_time_prekey_low_water {
            warn!(user_id, remaining, "one-time prekeys below replenishment threshold");
        }

        Ok(PreKeyBundleDto {
            user_id: user_id.to_string(),
            device_id: DEFAULT_DEVICE_ID,
            registration_id: identity.registration_id as u32,
            identity_key: URL_SAFE_NO_PAD.encode(&identity.public_key),
            signed_pre_key: SignedPreKeyDto {
                key_id: spk.key_id as u32,
                public_key: URL_SAFE_NO_PAD.encode(&spk.public_key),
                signature: URL_SAFE_NO_PAD.encode(&spk.signature),
            },
            one_time_pre_key: claimed.map(|row| OneTimePreKeyDto {
                key_id: row.key_id as u32,
                public_key: URL_SAFE_NO_PAD.encode(&row.public_key),
            }),
        })
    }

    // ── Replenishment ────────────────────────────────────────────────────────

    /// Replenish from a wire request. The posted list drives the count and
    /// is probed for key-id collisions; material itself is generated fresh
    /// server-side with ids strictly above the current maximum.
    pub async fn replenish_from_request(
        &self,
        user_id: &str,
        requested_ids: &[i64],
    ) -> Result<u32, EngineError> {
        let start = Instant::now();
        let result = async {
            if requested_ids.is_empty() {
                return Ok(0);
            }
            self.store
                .load_active_identity(user_id, 1)
                .await?
                .ok_or(EngineError::MissingKeys)?;

            let max = self.store.max_one_time_prekey_id(user_id).await?;
            if let Some(max) = max {
                if requested_ids.iter().any(|id| *id <= max) {
                    return Err(EngineError::Conflict("duplicate one-time prekey id".into()));
                }
            }

            let passphrase = self.unlock.get(user_id).ok_or(EngineError::WrongPassphrase)?;
            let first_id = max.map(|m| m + 1).unwrap_or(0);
            let (rows, _) =
                self.build_one_time_batch(user_id, &passphrase, first_id, requested_ids.len())?;
            self.store.save_one_time_prekeys(&rows).await?;
            Ok(rows.len() as u32)
        }
        .await;
        self.audit.record(
            AuditEvent::new(user_id, AuditOp::KeyRegister)
                .latency(start.elapsed())
                .outcome(result.as_ref().err().map(|e| e.code()))
                .metadata(serde_json::json!({ "action": "replenish" })),
        );
        result
    }

    /// Scheduler entry point: top the user up by `count` keys.
    pub async fn replenish_by(
        &self,
        user_id: &str,
        passphrase: &str,
        count: usize,
    ) -> Result<u32, EngineError> {
        if count == 0 {
            return Ok(0);
        }
        let max = self.store.max_one_time_prekey_id(user_id).await?;
        let first_id = max.map(|m| m + 1).unwrap_or(0);
        let (rows, _) = self.build_one_time_batch(user_id, passphrase, first_id, count)?;
        self.store.save_one_time_prekeys(&rows).await?;
        Ok(rows.len() as u32)
    }

    // ── Signed prekey rotation ───────────────────────────────────────────────

    /// Rotate the signed prekey. The demoted key stays openable for the
    /// overlap window so in-flight handshakes still decrypt.
    pub async fn rotate_signed_prekey(
        &self,
        user_id: &str,
        passphrase: &str,
        reason: &str,
    ) -> Result<u32, EngineError> {
        let start = Instant::now();
        let result = self.rotate_inner(user_id, passphrase, reason).await;
        self.audit.record(
            AuditEvent::new(user_id, AuditOp::KeyGen)
                .latency(start.elapsed())
                .outcome(result.as_ref().err().map(|e| e.code()))
                .metadata(serde_json::json!({ "kind": "signedPreKey", "reason": reason })),
        );
        result
    }

    async fn rotate_inner(
        &self,
        user_id: &str,
        passphrase: &str,
        reason: &str,
    ) -> Result<u32, EngineError> {
        let identity_row = self
            .store
            .load_active_identity(user_id, 1)
            .await?
            .ok_or(EngineError::MissingKeys)?;
        let identity_secret = vault::open(
            &identity_row.sealed_private_key,
            passphrase,
            user_id,
            KeyKind::Identity,
        )
        .map_err(EngineError::from_vault)?;
        let identity = IdentityKeyPair::from_bytes(&identity_secret)
            .map_err(|e| EngineError::Internal(e.to_string()))?;

        let new_id = self.store.max_signed_prekey_id(user_id).await?.unwrap_or(0) + 1;
        let (secret, public, sig) = x3dh::generate_signed_prekey(&identity);
        let sealed = vault::seal(
            &secret.to_bytes(),
            passphrase,
            user_id,
            KeyKind::SignedPreKey,
            &self.config.vault,
        )
        .map_err(EngineError::from_vault)?;

        let new_row = SignedPreKeyRow {
            user_id: user_id.to_string(),
            key_id: new_id,
            public_key: PublicKeyBytes(*public.as_bytes()).to_wire(),
            sealed_private_key: sealed,
            signature: sig,
            created_at: Utc::now(),
            expires_at: None,
            active: true,
        };
        let overlap_end = Utc::now() + ChronoDuration::days(self.config.signed_prekey_overlap_days);
        self.store
            .rotate_signed_prekey(user_id, &new_row, overlap_end)
            .await?;
        self.store
            .append_key_rotation(user_id, ROTATION_KIND_SIGNED_PREKEY, reason)
            .await?;
        self.unlock.insert(user_id, passphrase);
        Ok(new_id as u32)
    }

    // ── Status ───────────────────────────────────────────────────────────────

    pub async fn key_status(&self, user_id: &str) -> Result<KeyStatusResponse, EngineError> {
        let identity = self.store.load_active_identity(user_id, 1).await?;
        let spk = self.store.load_active_signed_prekey(user_id).await?;
        let available = self.store.count_available_one_time_prekeys(user_id).await?;

        let signed_pre_key_expiry: Option<DateTime<Utc>> = spk.as_ref().map(|row| {
            row.expires_at
                .unwrap_or(row.created_at + ChronoDuration::days(self.config.signed_prekey_rotation_days))
        });

        Ok(KeyStatusResponse {
            has_identity: identity.is_some(),
            has_active_signed_pre_key: spk.is_some(),
            signed_pre_key_expiry,
            available_one_time_pre_keys: available.max(0) as u32,
            identity_created_at: identity.map(|row| row.created_at),
        })
    }

    // ── Deletion ─────────────────────────────────────────────────────────────

    /// Destroy everything the user owns. The deletion order is a hard
    /// requirement: sessions → remote identities → one-time prekeys →
    /// signed prekeys → identity.
    pub async fn delete_all_keys(&self, user_id: &str) -> Result<(), EngineError> {
        let start = Instant::now();
        let lock = self.user_locks.get(&user_id.to_string());
        let _guard = lock.lock().await;
        let result = self.delete_all_inner(user_id).await;
        self.unlock.remove(user_id);
        self.audit.record(
            AuditEvent::new(user_id, AuditOp::KeyDelete)
                .latency(start.elapsed())
                .outcome(result.as_ref().err().map(|e| e.code())),
        );
        result
    }

    async fn delete_all_inner(&self, user_id: &str) -> Result<(), EngineError> {
        self.store.delete_sessions_for_owner(user_id).await?;
        self.store.delete_remote_identities(user_id).await?;
        self.store.delete_one_time_prekeys(user_id).await?;
        self.store.delete_signed_prekeys(user_id).await?;
        self.store.delete_identity(user_id).await?;
        Ok(())
    }

    pub(crate) fn store(&self) -> &ProtocolStore {
        &self.store
    }

    pub(crate) fn unlock_cache(&self) -> &UnlockCache {
        &self.unlock
    }
}
