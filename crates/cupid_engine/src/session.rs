//! SessionEngine — X3DH initiation/acceptance and Double Ratchet messaging.
//!
//! Discipline:
//! - All operations on one (owner, peer, device) session are serialized
//!   behind a keyed mutex; disjoint sessions progress in parallel.
//! - Decrypt works on a deserialized copy of the session record and persists
//!   only after full success, so `Undecipherable` and `OutOfOrder` can never
//!   mutate durable state.
//! - Session records reference peers by opaque user id only — no entity
//!   references, no back-pointers.

use std::sync::Arc;
use std::time::Instant;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};
use x25519_dalek::StaticSecret;

use cupid_crypto::{
    aead,
    identity::{IdentityKeyPair, PublicKeyBytes},
    ratchet::{RatchetHeader, RatchetState},
    vault::{self, KeyKind},
    x3dh, CryptoError,
};
use cupid_proto::{
    codec,
    envelope::{MessageType, PrekeyHeader, WireMessage},
};
use cupid_store::{ProtocolStore, TrustState};

use crate::{
    audit::{AuditEvent, AuditOp, AuditSink},
    config::{EngineConfig, TrustPolicy},
    error::EngineError,
    locks::KeyedLocks,
    trust::TrustLedger,
    unlock::UnlockCache,
};

const RECORD_VERSION: u8 = 1;
const RECORD_AAD_CONTEXT: &[u8] = b"cupid-session-v1";

/// Handshake material re-sent with every PREKEY envelope until the first
/// reply from the peer confirms the session.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Handshake {
    ephemeral: [u8; 32],
    signed_prekey_id: u32,
    one_time_prekey_id: Option<u32>,
}

/// The serialized session state: ratchet plus the identity context the AEAD
/// associated data is built from.
#[derive(Serialize, Deserialize)]
struct SessionRecord {
    version: u8,
    local_identity: PublicKeyBytes,
    remote_identity: PublicKeyBytes,
    registration_id: u32,
    pending_handshake: Option<Handshake>,
    ratchet: RatchetState,
}

/// Result of an encrypt: canonical envelope bytes plus the response fields
/// the boundary echoes back.
pub struct EncryptedOutput {
    pub envelope: Vec<u8>,
    pub message_type: MessageType,
    pub registration_id: u32,
}

#[derive(Clone)]
pub struct SessionEngine {
    store: ProtocolStore,
    config: Arc<EngineConfig>,
    audit: AuditSink,
    unlock: UnlockCache,
    trust: TrustLedger,
    session_locks: Arc<KeyedLocks<(String, String, i64)>>,
}

impl SessionEngine {
    pub fn new(
        store: ProtocolStore,
        config: Arc<EngineConfig>,
        audit: AuditSink,
        unlock: UnlockCache,
        trust: TrustLedger,
    ) -> Self {
        Self {
            store,
            config,
            audit,
            unlock,
            trust,
            session_locks: Arc::new(KeyedLocks::new()),
        }
    }

    // ── Initiation (sender side of X3DH) ─────────────────────────────────────

    /// Build a session from a fetched peer bundle. The first encrypt after
    /// this produces a PREKEY envelope carrying the handshake.
    pub async fn init_outbound(
        &self,
        owner: &str,
        peer: &str,
        device: i64,
        bundle: &cupid_proto::api::PreKeyBundleDto,
    ) -> Result<(), EngineError> {
        let start = Instant::now();
        let result = self.init_outbound_inner(owner, peer, device, bundle).await;
        self.audit.record(
            AuditEvent::new(owner, AuditOp::SessionInit)
                .peer(peer)
                .latency(start.elapsed())
                .outcome(result.as_ref().err().map(|e| e.code()))
                .metadata(serde_json::json!({ "role": "sender" })),
        );
        result
    }

    async fn init_outbound_inner(
        &self,
        owner: &str,
        peer: &str,
        device: i64,
        bundle: &cupid_proto::api::PreKeyBundleDto,
    ) -> Result<(), EngineError> {
        let identity_row = self
            .store
            .load_active_identity(owner, 1)
            .await?
            .ok_or(EngineError::MissingKeys)?;
        let passphrase = self.unlock.get(owner).ok_or(EngineError::WrongPassphrase)?;
        let identity_secret =
            vault::open(&identity_row.sealed_private_key, &passphrase, owner, KeyKind::Identity)
                .map_err(EngineError::from_vault)?;
        let my_ik = IdentityKeyPair::from_bytes(&identity_secret)
            .map_err(|e| EngineError::Internal(e.to_string()))?;

        let peer_ik = PublicKeyBytes::from_b64(&bundle.identity_key)
            .map_err(EngineError::from_bad_material)?;
        let spk_pub = decode_x25519(&bundle.signed_pre_key.public_key)?;
        let spk_sig = URL_SAFE_NO_PAD
            .decode(&bundle.signed_pre_key.signature)
            .map_err(|e| EngineError::BadKeys(e.to_string()))?;
        let one_time = bundle
            .one_time_pre_key
            .as_ref()
            .map(|otpk| Ok::<_, EngineError>((otpk.key_id, decode_x25519(&otpk.public_key)?)))
            .transpose()?;

        // MITM gate: record the observation first, then consult policy. A
        // changed key is never silently accepted under the strict policy.
        self.trust.observe(owner, peer, device, &peer_ik).await?;
        if self.config.trust_policy == TrustPolicy::Strict {
            if let Some(TrustState::Changed) = self.trust.trust_state(owner, peer, device).await? {
                return Err(EngineError::TrustBroken);
            }
        }

        let init = x3dh::initiate(
            &my_ik,
            &x3dh::PeerBundle {
                identity: peer_ik.clone(),
                signed_prekey_id: bundle.signed_pre_key.key_id,
                signed_prekey: spk_pub,
                signed_prekey_sig: spk_sig,
                one_time_prekey: one_time,
            },
        )
        .map_err(EngineError::from_bad_material)?;

        let ratchet = RatchetState::initiator(
            init.shared_key,
            init.ephemeral_secret,
            &spk_pub,
            self.config.ratchet,
        )
        .map_err(|e| EngineError::Internal(e.to_string()))?;

        let record = SessionRecord {
            version: RECORD_VERSION,
            local_identity: my_ik.public.clone(),
            remote_identity: peer_ik,
            registration_id: identity_row.registration_id as u32,
            pending_handshake: Some(Handshake {
                ephemeral: init.ephemeral_public,
                signed_prekey_id: init.signed_prekey_id,
                one_time_prekey_id: init.one_time_prekey_id,
            }),
            ratchet,
        };

        let lock = self.session_lock(owner, peer, device);
        let _guard = lock.lock().await;
        self.persist(owner, peer, device, &record).await
    }

    // ── Encrypt ──────────────────────────────────────────────────────────────

    pub async fn encrypt(
        &self,
        owner: &str,
        peer: &str,
        device: i64,
        plaintext: &[u8],
    ) -> Result<EncryptedOutput, EngineError> {
        let start = Instant::now();
        let result = self.encrypt_inner(owner, peer, device, plaintext).await;
        self.audit.record(
            AuditEvent::new(owner, AuditOp::Encrypt)
                .peer(peer)
                .latency(start.elapsed())
                .outcome(result.as_ref().err().map(|e| e.code())),
        );
        result
    }

    async fn encrypt_inner(
        &self,
        owner: &str,
        peer: &str,
        device: i64,
        plaintext: &[u8],
    ) -> Result<EncryptedOutput, EngineError> {
        // MissingKeys beats SessionMissing: a user whose keys were deleted
        // must be told to regenerate, not to re-initiate.
        self.store
            .load_active_identity(owner, 1)
            .await?
            .ok_or(EngineError::MissingKeys)?;

        let lock = self.session_lock(owner, peer, device);
        let _guard = lock.lock().await;

        let sealed = self
            .store
            .load_session(owner, peer, device)
            .await?
            .ok_or(EngineError::SessionMissing)?;
        let mut record = self.open_record(owner, peer, device, &sealed)?;

        let (header, mk) = record.ratchet.encrypt_step().map_err(map_ratchet_err)?;
        let aad = message_aad(&record.local_identity, &record.remote_identity, &header);
        let ciphertext =
            aead::encrypt(&mk, plaintext, &aad).map_err(|e| EngineError::Internal(e.to_string()))?;

        let (message_type, prekey) = match &record.pending_handshake {
            Some(hs) => (
                MessageType::Prekey,
                Some(PrekeyHeader {
                    registration_id: record.registration_id,
                    identity_key: record.local_identity.to_wire(),
                    ephemeral_key: hs.ephemeral,
                    signed_prekey_id: hs.signed_prekey_id,
                    one_time_prekey_id: hs.one_time_prekey_id,
                }),
            ),
            None => (MessageType::Normal, None),
        };

        let envelope = codec::encode_message(&WireMessage {
            message_type,
            prekey,
            header,
            ciphertext,
        });

        let registration_id = record.registration_id;
        self.persist(owner, peer, device, &record).await?;

        Ok(EncryptedOutput { envelope, message_type, registration_id })
    }

    // ── Decrypt ──────────────────────────────────────────────────────────────

    pub async fn decrypt(
        &self,
        owner: &str,
        sender: &str,
        device: i64,
        envelope: &[u8],
        passphrase: &str,
    ) -> Result<Vec<u8>, EngineError> {
        let start = Instant::now();
        let result = self.decrypt_inner(owner, sender, device, envelope, passphrase).await;
        self.audit.record(
            AuditEvent::new(owner, AuditOp::Decrypt)
                .peer(sender)
                .latency(start.elapsed())
                .outcome(result.as_ref().err().map(|e| e.code())),
        );
        result
    }

    async fn decrypt_inner(
        &self,
        owner: &str,
        sender: &str,
        device: i64,
        envelope: &[u8],
        passphrase: &str,
    ) -> Result<Vec<u8>, EngineError> {
        self.store
            .load_active_identity(owner, 1)
            .await?
            .ok_or(EngineError::MissingKeys)?;

        let wire = codec::decode_message(envelope).map_err(|e| EngineError::BadKeys(e.to_string()))?;

        let lock = self.session_lock(owner, sender, device);
        let _guard = lock.lock().await;

        let existing = self.store.load_session(owner, sender, device).await?;
        match (wire.message_type, existing) {
            (MessageType::Prekey, Some(sealed)) => {
                let record = self.open_record(owner, sender, device, &sealed)?;
                let same_identity = wire
                    .prekey
                    .as_ref()
                    .map(|pk| pk.identity_key == record.remote_identity.to_wire())
                    .unwrap_or(false);
                if same_identity {
                    // A PREKEY retransmission for a session we already hold
                    // decrypts through the ratchet like any other message.
                    self.ratchet_decrypt(owner, sender, device, record, &wire).await
                } else {
                    // The sender reset and generated a new identity; the old
                    // session cannot read this. Rebuild from the handshake.
                    self.accept_session(owner, sender, device, &wire, passphrase).await
                }
            }
            (MessageType::Normal, Some(sealed)) => {
                let record = self.open_record(owner, sender, device, &sealed)?;
                self.ratchet_decrypt(owner, sender, device, record, &wire).await
            }
            (MessageType::Prekey, None) => {
                self.accept_session(owner, sender, device, &wire, passphrase).await
            }
            (MessageType::Normal, None) => Err(EngineError::SessionMissing),
        }
    }

    /// Decrypt against an existing record and persist the advanced state.
    async fn ratchet_decrypt(
        &self,
        owner: &str,
        sender: &str,
        device: i64,
        mut record: SessionRecord,
        wire: &WireMessage,
    ) -> Result<Vec<u8>, EngineError> {
        let aad = message_aad(&record.remote_identity, &record.local_identity, &wire.header);
        let mk = record.ratchet.decrypt_step(&wire.header).map_err(map_ratchet_err)?;
        let plaintext =
            aead::decrypt(&mk, &wire.ciphertext, &aad).map_err(|_| EngineError::Undecipherable)?;

        // A decrypted message from the peer confirms the handshake.
        record.pending_handshake = None;
        self.persist(owner, sender, device, &record).await?;
        Ok(plaintext.to_vec())
    }

    /// Recipient side of X3DH: rebuild SK from the PREKEY header, derive the
    /// ratchet, decrypt, and consume the one-time prekey irrevocably.
    async fn accept_session(
        &self,
        owner: &str,
        sender: &str,
        device: i64,
        wire: &WireMessage,
        passphrase: &str,
    ) -> Result<Vec<u8>, EngineError> {
        let handshake = wire
            .prekey
            .as_ref()
            .ok_or_else(|| EngineError::BadKeys("prekey envelope without handshake".into()))?;
        let sender_ik = PublicKeyBytes::from_wire(&handshake.identity_key)
            .map_err(EngineError::from_bad_material)?;

        let identity_row = self
            .store
            .load_active_identity(owner, 1)
            .await?
            .ok_or(EngineError::MissingKeys)?;
        let identity_secret =
            vault::open(&identity_row.sealed_private_key, passphrase, owner, KeyKind::Identity)
                .map_err(EngineError::from_vault)?;
        let my_ik = IdentityKeyPair::from_bytes(&identity_secret)
            .map_err(|e| EngineError::Internal(e.to_string()))?;

        let spk_row = self
            .store
            .load_signed_prekey(owner, handshake.signed_prekey_id as i64)
            .await?
            .ok_or(EngineError::SessionGone)?;
        let spk_secret = static_secret_from(
            &vault::open(&spk_row.sealed_private_key, passphrase, owner, KeyKind::SignedPreKey)
                .map_err(EngineError::from_vault)?,
        )?;

        let opk_secret = match handshake.one_time_prekey_id {
            None => None,
            Some(opk_id) => {
                let row = self
                    .store
                    .load_one_time_prekey(owner, opk_id as i64)
                    .await?
                    .ok_or(EngineError::SessionGone)?;
                // A nulled private means some earlier handshake consumed this
                // key; with no session on record the message is undecryptable.
                let sealed = row.sealed_private_key.ok_or(EngineError::SessionGone)?;
                Some(static_secret_from(
                    &vault::open(&sealed, passphrase, owner, KeyKind::OneTimePreKey)
                        .map_err(EngineError::from_vault)?,
                )?)
            }
        };

        let shared_key = x3dh::respond(
            &my_ik,
            &spk_secret,
            opk_secret.as_ref(),
            &sender_ik,
            &handshake.ephemeral_key,
        )
        .map_err(EngineError::from_bad_material)?;

        let mut record = SessionRecord {
            version: RECORD_VERSION,
            local_identity: my_ik.public.clone(),
            remote_identity: sender_ik.clone(),
            registration_id: identity_row.registration_id as u32,
            pending_handshake: None,
            ratchet: RatchetState::responder(shared_key, &spk_secret, self.config.ratchet),
        };

        let aad = message_aad(&record.remote_identity, &record.local_identity, &wire.header);
        let mk = record.ratchet.decrypt_step(&wire.header).map_err(map_ratchet_err)?;
        let plaintext =
            aead::decrypt(&mk, &wire.ciphertext, &aad).map_err(|_| EngineError::Undecipherable)?;

        // Success: burn the one-time prekey, pin the sender's identity,
        // persist the session, and keep the owner unlocked for followups.
        if let Some(opk_id) = handshake.one_time_prekey_id {
            self.store.consume_one_time_prekey(owner, opk_id as i64).await?;
        }
        self.trust.observe(owner, sender, device, &sender_ik).await?;
        self.unlock.insert(owner, passphrase);
        self.persist(owner, sender, device, &record).await?;

        self.audit.record(
            AuditEvent::new(owner, AuditOp::SessionInit)
                .peer(sender)
                .metadata(serde_json::json!({ "role": "recipient" })),
        );

        Ok(plaintext.to_vec())
    }

    // ── Queries & teardown ───────────────────────────────────────────────────

    pub async fn has_session(&self, owner: &str, peer: &str, device: i64) -> Result<bool, EngineError> {
        Ok(self.store.has_session(owner, peer, device).await?)
    }

    pub async fn delete_session(&self, owner: &str, peer: &str, device: i64) -> Result<(), EngineError> {
        let lock = self.session_lock(owner, peer, device);
        let _guard = lock.lock().await;
        Ok(self.store.delete_session(owner, peer, device).await?)
    }

    // ── Record sealing ───────────────────────────────────────────────────────

    fn session_lock(&self, owner: &str, peer: &str, device: i64) -> Arc<tokio::sync::Mutex<()>> {
        self.session_locks
            .get(&(owner.to_string(), peer.to_string(), device))
    }

    async fn persist(
        &self,
        owner: &str,
        peer: &str,
        device: i64,
        record: &SessionRecord,
    ) -> Result<(), EngineError> {
        let json = serde_json::to_vec(record).map_err(|e| EngineError::Internal(e.to_string()))?;
        let sealed = aead::encrypt(&self.config.store_key, &json, &record_aad(owner, peer, device))
            .map_err(|e| EngineError::Internal(e.to_string()))?;
        Ok(self.store.save_session(owner, peer, device, &sealed).await?)
    }

    fn open_record(
        &self,
        owner: &str,
        peer: &str,
        device: i64,
        sealed: &[u8],
    ) -> Result<SessionRecord, EngineError> {
        let bytes = aead::decrypt(&self.config.store_key, sealed, &record_aad(owner, peer, device))
            .map_err(|_| EngineError::SessionGone)?;
        serde_json::from_slice(&bytes).map_err(|_| EngineError::SessionGone)
    }
}

/// AEAD associated data: sender identity, then receiver identity, then the
/// canonical header bytes. Sender-first so both ends compute the same bytes.
fn message_aad(
    sender_ik: &PublicKeyBytes,
    receiver_ik: &PublicKeyBytes,
    header: &RatchetHeader,
) -> Vec<u8> {
    let mut aad = sender_ik.to_wire();
    aad.extend_from_slice(&receiver_ik.to_wire());
    aad.extend_from_slice(&codec::encode_header(header));
    aad
}

fn record_aad(owner: &str, peer: &str, device: i64) -> Vec<u8> {
    let mut aad = Vec::with_capacity(RECORD_AAD_CONTEXT.len() + owner.len() + peer.len() + 10);
    aad.extend_from_slice(RECORD_AAD_CONTEXT);
    aad.extend_from_slice(owner.as_bytes());
    aad.push(0);
    aad.extend_from_slice(peer.as_bytes());
    aad.push(0);
    aad.extend_from_slice(&device.to_be_bytes());
    aad
}

fn decode_x25519(b64: &str) -> Result<[u8; 32], EngineError> {
    let wire = URL_SAFE_NO_PAD
        .decode(b64)
        .map_err(|e| EngineError::BadKeys(e.to_string()))?;
    Ok(PublicKeyBytes::from_wire(&wire)
        .map_err(EngineError::from_bad_material)?
        .0)
}

fn static_secret_from(bytes: &[u8]) -> Result<StaticSecret, EngineError> {
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| EngineError::Internal("sealed key has wrong length".into()))?;
    Ok(StaticSecret::from(arr))
}

fn map_ratchet_err(err: CryptoError) -> EngineError {
    match err {
        CryptoError::SkipLimitExceeded { .. } => EngineError::OutOfOrder,
        CryptoError::ChainNotReady => EngineError::Undecipherable,
        other => EngineError::Internal(other.to_string()),
    }
}
