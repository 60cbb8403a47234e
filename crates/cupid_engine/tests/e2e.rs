//! End-to-end scenarios for the E2EE core: key generation through X3DH,
//! ratcheted messaging, trust handling, and teardown.

use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use uuid::Uuid;

use cupid_crypto::kdf::KdfParams;
use cupid_crypto::ratchet::RatchetLimits;
use cupid_engine::{E2eeCore, EngineConfig, EngineError};
use cupid_proto::api::*;
use cupid_proto::envelope::MessageType;

const PASS_ALPHA: &str = "P@ssw0rd-Alpha-01";
const PASS_BETA: &str = "P@ssw0rd-Beta-02";

fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    // Low-cost Argon2 keeps the suite fast; production defaults stay in
    // EngineConfig::default().
    config.vault.kdf = KdfParams { m_cost_kib: 8 * 1024, t_cost: 1, p_cost: 1 };
    config.store_key = [7u8; 32];
    config.one_time_prekey_batch = 8;
    config
}

async fn open_core(config: EngineConfig) -> (E2eeCore, PathBuf) {
    let db_path = PathBuf::from(format!("/tmp/cupid-e2e-{}.db", Uuid::new_v4()));
    let core = E2eeCore::open(&db_path, config).await.expect("open core");
    (core, db_path)
}

fn cleanup(db_path: &Path) {
    let _ = std::fs::remove_file(db_path);
    let _ = std::fs::remove_file(db_path.with_extension("db-wal"));
    let _ = std::fs::remove_file(db_path.with_extension("db-shm"));
}

async fn generate(core: &E2eeCore, user: &str, passphrase: &str) -> GenerateKeysResponse {
    core.boundary()
        .generate_keys(user, GenerateKeysRequest { passphrase: passphrase.into() })
        .await
        .expect("generate keys")
}

async fn init_session(core: &E2eeCore, owner: &str, peer: &str) {
    let bundle = core.boundary().fetch_bundle(owner, peer, 1).await.expect("fetch bundle");
    core.boundary()
        .init_session(
            owner,
            SessionInitRequest { peer_user_id: peer.into(), peer_device_id: 1, bundle },
        )
        .await
        .expect("init session");
}

async fn encrypt(core: &E2eeCore, owner: &str, peer: &str, plaintext: &str) -> EncryptResponse {
    core.boundary()
        .encrypt(
            owner,
            EncryptRequest {
                peer_user_id: peer.into(),
                peer_device_id: 1,
                plaintext: plaintext.into(),
            },
        )
        .await
        .expect("encrypt")
}

async fn decrypt(
    core: &E2eeCore,
    owner: &str,
    passphrase: &str,
    message: &EncryptResponse,
) -> Result<String, EngineError> {
    core.boundary()
        .decrypt(
            owner,
            DecryptRequest {
                sender_id: message.sender_id.clone(),
                device_id: 1,
                encrypted_content: message.encrypted_content.clone(),
                message_type: message.message_type,
                registration_id: message.registration_id,
                passphrase: passphrase.into(),
            },
        )
        .await
        .map(|resp| resp.plaintext)
}

/// Header counter of an encoded envelope (for the concurrency law).
fn header_counter(message: &EncryptResponse) -> u32 {
    let bytes = URL_SAFE_NO_PAD.decode(&message.encrypted_content).unwrap();
    cupid_proto::codec::decode_message(&bytes).unwrap().header.n
}

#[tokio::test]
async fn scenario_happy_path_pair() {
    let (core, path) = open_core(test_config()).await;
    generate(&core, "u1", PASS_ALPHA).await;
    generate(&core, "u2", PASS_BETA).await;

    // U1 fetches U2's bundle, consuming one-time key #0.
    let bundle = core.boundary().fetch_bundle("u1", "u2", 1).await.unwrap();
    assert_eq!(bundle.one_time_pre_key.as_ref().unwrap().key_id, 0);
    core.boundary()
        .init_session(
            "u1",
            SessionInitRequest { peer_user_id: "u2".into(), peer_device_id: 1, bundle },
        )
        .await
        .unwrap();

    let hello = encrypt(&core, "u1", "u2", "hello").await;
    assert_eq!(hello.message_type, MessageType::Prekey);
    assert_eq!(decrypt(&core, "u2", PASS_BETA, &hello).await.unwrap(), "hello");

    let hi = encrypt(&core, "u2", "u1", "hi").await;
    assert_eq!(hi.message_type, MessageType::Normal);
    assert_eq!(decrypt(&core, "u1", PASS_ALPHA, &hi).await.unwrap(), "hi");

    // The reply confirmed U1's handshake, so U1 drops the PREKEY framing.
    let followup = encrypt(&core, "u1", "u2", "how are you").await;
    assert_eq!(followup.message_type, MessageType::Normal);
    assert_eq!(decrypt(&core, "u2", PASS_BETA, &followup).await.unwrap(), "how are you");

    cleanup(&path);
}

#[tokio::test]
async fn scenario_one_time_key_exhaustion() {
    let mut config = test_config();
    config.one_time_prekey_batch = 100;
    config.one_time_prekey_target = 100;
    let (core, path) = open_core(config).await;
    generate(&core, "u2", PASS_BETA).await;

    // 100 peers fetch serially; every bundle carries a distinct key id.
    let mut seen = std::collections::HashSet::new();
    for i in 0..100 {
        let requester = format!("peer-{i}");
        let bundle = core.boundary().fetch_bundle(&requester, "u2", 1).await.unwrap();
        let otpk = bundle.one_time_pre_key.expect("key available");
        assert!(seen.insert(otpk.key_id), "key {} handed out twice", otpk.key_id);
    }
    assert_eq!(seen.len(), 100);

    // Peer 101 gets a bundle without a one-time key and still succeeds.
    generate(&core, "peer-101", PASS_ALPHA).await;
    let bundle = core.boundary().fetch_bundle("peer-101", "u2", 1).await.unwrap();
    assert!(bundle.one_time_pre_key.is_none());
    core.boundary()
        .init_session(
            "peer-101",
            SessionInitRequest { peer_user_id: "u2".into(), peer_device_id: 1, bundle },
        )
        .await
        .unwrap();
    let msg = encrypt(&core, "peer-101", "u2", "no otpk left").await;
    assert_eq!(decrypt(&core, "u2", PASS_BETA, &msg).await.unwrap(), "no otpk left");

    // The replenishment sweep tops U2 back up (identity is still unlocked).
    let added = core.scheduler.run_replenish_sweep().await.unwrap();
    assert!(added > 0);
    let bundle = core.boundary().fetch_bundle("peer-0", "u2", 1).await.unwrap();
    let fresh = bundle.one_time_pre_key.expect("replenished");
    assert!(fresh.key_id >= 100, "fresh ids must be strictly above the old maximum");

    cleanup(&path);
}

#[tokio::test]
async fn scenario_out_of_order_within_skip_window() {
    let (core, path) = open_core(test_config()).await;
    generate(&core, "u1", PASS_ALPHA).await;
    generate(&core, "u2", PASS_BETA).await;
    init_session(&core, "u1", "u2").await;

    let messages: Vec<EncryptResponse> = {
        let mut out = Vec::new();
        for text in ["m1", "m2", "m3", "m4", "m5"] {
            out.push(encrypt(&core, "u1", "u2", text).await);
        }
        out
    };

    // Transport reorders to {m1, m3, m2, m5, m4}; all five decrypt.
    for idx in [0usize, 2, 1, 4, 3] {
        let plaintext = decrypt(&core, "u2", PASS_BETA, &messages[idx]).await.unwrap();
        assert_eq!(plaintext, format!("m{}", idx + 1));
    }

    cleanup(&path);
}

#[tokio::test]
async fn scenario_skip_limit_overrun_drops_without_state_change() {
    let mut config = test_config();
    config.ratchet = RatchetLimits { max_skip: 2, max_skipped_entries: 1000 };
    let (core, path) = open_core(config).await;
    generate(&core, "u1", PASS_ALPHA).await;
    generate(&core, "u2", PASS_BETA).await;
    init_session(&core, "u1", "u2").await;

    let m1 = encrypt(&core, "u1", "u2", "m1").await;
    assert_eq!(decrypt(&core, "u2", PASS_BETA, &m1).await.unwrap(), "m1");

    let m2 = encrypt(&core, "u1", "u2", "m2").await;
    let mut far = None;
    for _ in 0..48 {
        far = Some(encrypt(&core, "u1", "u2", "far ahead").await);
    }

    // Far beyond the skip window: dropped, state stays at m1.
    assert!(matches!(
        decrypt(&core, "u2", PASS_BETA, &far.unwrap()).await,
        Err(EngineError::OutOfOrder)
    ));

    // The next in-order message still decrypts.
    assert_eq!(decrypt(&core, "u2", PASS_BETA, &m2).await.unwrap(), "m2");

    cleanup(&path);
}

#[tokio::test]
async fn scenario_identity_change_trust_flow() {
    let (core, path) = open_core(test_config()).await;
    generate(&core, "u1", PASS_ALPHA).await;
    generate(&core, "u2", PASS_BETA).await;

    // Establish contact and mark U2 as trusted.
    init_session(&core, "u1", "u2").await;
    let first = encrypt(&core, "u1", "u2", "first").await;
    assert_eq!(decrypt(&core, "u2", PASS_BETA, &first).await.unwrap(), "first");
    core.boundary()
        .trust_identity("u1", TrustRequest { peer: "u2".into(), device_id: 1 })
        .await
        .unwrap();

    // U2 resets: destroys everything and generates a new identity.
    core.boundary().delete_keys("u2").await.unwrap();
    generate(&core, "u2", PASS_BETA).await;

    // Strict policy: initiation against the changed identity is refused.
    let bundle = core.boundary().fetch_bundle("u1", "u2", 1).await.unwrap();
    let refused = core
        .boundary()
        .init_session(
            "u1",
            SessionInitRequest {
                peer_user_id: "u2".into(),
                peer_device_id: 1,
                bundle: bundle.clone(),
            },
        )
        .await;
    assert!(matches!(refused, Err(EngineError::TrustBroken)));

    // Explicit re-trust unblocks the pair.
    core.boundary()
        .trust_identity("u1", TrustRequest { peer: "u2".into(), device_id: 1 })
        .await
        .unwrap();
    core.boundary()
        .init_session(
            "u1",
            SessionInitRequest { peer_user_id: "u2".into(), peer_device_id: 1, bundle },
        )
        .await
        .unwrap();
    let ok = encrypt(&core, "u1", "u2", "ok").await;
    assert_eq!(decrypt(&core, "u2", PASS_BETA, &ok).await.unwrap(), "ok");

    cleanup(&path);
}

#[tokio::test]
async fn scenario_concurrent_encrypts_get_distinct_counters() {
    let (core, path) = open_core(test_config()).await;
    generate(&core, "u1", PASS_ALPHA).await;
    generate(&core, "u2", PASS_BETA).await;
    init_session(&core, "u1", "u2").await;

    let boundary_a = core.boundary();
    let boundary_b = core.boundary();
    let task_a = tokio::spawn(async move {
        boundary_a
            .encrypt(
                "u1",
                EncryptRequest {
                    peer_user_id: "u2".into(),
                    peer_device_id: 1,
                    plaintext: "a".into(),
                },
            )
            .await
            .unwrap()
    });
    let task_b = tokio::spawn(async move {
        boundary_b
            .encrypt(
                "u1",
                EncryptRequest {
                    peer_user_id: "u2".into(),
                    peer_device_id: 1,
                    plaintext: "b".into(),
                },
            )
            .await
            .unwrap()
    });
    let msg_a = task_a.await.unwrap();
    let msg_b = task_b.await.unwrap();

    // Consecutive counters in some order — never the same one twice.
    let mut counters = vec![header_counter(&msg_a), header_counter(&msg_b)];
    counters.sort_unstable();
    assert_eq!(counters, vec![0, 1]);

    // Both decrypt, in either order.
    assert_eq!(decrypt(&core, "u2", PASS_BETA, &msg_b).await.unwrap(), "b");
    assert_eq!(decrypt(&core, "u2", PASS_BETA, &msg_a).await.unwrap(), "a");

    cleanup(&path);
}

#[tokio::test]
async fn scenario_wrong_passphrase_leaves_session_intact() {
    let (core, path) = open_core(test_config()).await;
    generate(&core, "u1", PASS_ALPHA).await;
    generate(&core, "u2", PASS_BETA).await;
    init_session(&core, "u1", "u2").await;

    let msg = encrypt(&core, "u1", "u2", "hello").await;

    assert!(matches!(
        decrypt(&core, "u2", "wrong", &msg).await,
        Err(EngineError::WrongPassphrase)
    ));

    // Nothing was mutated: the same ciphertext decrypts with the right
    // passphrase afterwards.
    assert_eq!(decrypt(&core, "u2", PASS_BETA, &msg).await.unwrap(), "hello");

    cleanup(&path);
}

#[tokio::test]
async fn delete_all_keys_empties_status_and_blocks_encrypt() {
    let (core, path) = open_core(test_config()).await;
    generate(&core, "u1", PASS_ALPHA).await;
    generate(&core, "u2", PASS_BETA).await;
    init_session(&core, "u1", "u2").await;

    core.boundary().delete_keys("u1").await.unwrap();

    let status = core.boundary().key_status("u1").await.unwrap();
    assert!(!status.has_identity);
    assert!(!status.has_active_signed_pre_key);
    assert_eq!(status.available_one_time_pre_keys, 0);

    let blocked = core
        .boundary()
        .encrypt(
            "u1",
            EncryptRequest {
                peer_user_id: "u2".into(),
                peer_device_id: 1,
                plaintext: "nope".into(),
            },
        )
        .await;
    assert!(matches!(blocked, Err(EngineError::MissingKeys)));

    cleanup(&path);
}

#[tokio::test]
async fn rotation_keeps_old_handshakes_working_inside_overlap() {
    let (core, path) = open_core(test_config()).await;
    generate(&core, "u1", PASS_ALPHA).await;
    generate(&core, "u2", PASS_BETA).await;

    // U1 fetches a bundle against signed prekey #1, then U2 rotates.
    let old_bundle = core.boundary().fetch_bundle("u1", "u2", 1).await.unwrap();
    assert_eq!(old_bundle.signed_pre_key.key_id, 1);

    let rotated = core
        .boundary()
        .rotate_signed_prekey("u2", RotateSignedPreKeyRequest { passphrase: PASS_BETA.into() })
        .await
        .unwrap();
    assert_eq!(rotated.new_key_id, 2);

    let fresh_bundle = core.boundary().fetch_bundle("u1", "u2", 1).await.unwrap();
    assert_eq!(fresh_bundle.signed_pre_key.key_id, 2);

    // A handshake against the demoted key still succeeds inside the overlap.
    core.boundary()
        .init_session(
            "u1",
            SessionInitRequest {
                peer_user_id: "u2".into(),
                peer_device_id: 1,
                bundle: old_bundle,
            },
        )
        .await
        .unwrap();
    let msg = encrypt(&core, "u1", "u2", "late handshake").await;
    assert_eq!(decrypt(&core, "u2", PASS_BETA, &msg).await.unwrap(), "late handshake");

    cleanup(&path);
}

#[tokio::test]
async fn replenish_laws_hold() {
    let (core, path) = open_core(test_config()).await;
    generate(&core, "u1", PASS_ALPHA).await;

    // Empty list is a no-op.
    let noop = core
        .boundary()
        .replenish("u1", ReplenishRequest { one_time_pre_keys: vec![] })
        .await
        .unwrap();
    assert_eq!(noop.added, 0);

    // A key id colliding with stored rows is a conflict.
    let conflict = core
        .boundary()
        .replenish(
            "u1",
            ReplenishRequest {
                one_time_pre_keys: vec![OneTimePreKeyDto { key_id: 0, public_key: "AQ".into() }],
            },
        )
        .await;
    assert!(matches!(conflict, Err(EngineError::Conflict(_))));

    // Fresh ids extend the pool.
    let added = core
        .boundary()
        .replenish(
            "u1",
            ReplenishRequest {
                one_time_pre_keys: (100..102)
                    .map(|id| OneTimePreKeyDto { key_id: id, public_key: "AQ".into() })
                    .collect(),
            },
        )
        .await
        .unwrap();
    assert_eq!(added.added, 2);

    let status = core.boundary().key_status("u1").await.unwrap();
    assert_eq!(status.available_one_time_pre_keys, 10);

    cleanup(&path);
}

#[tokio::test]
async fn non_default_device_is_rejected() {
    let (core, path) = open_core(test_config()).await;
    generate(&core, "u1", PASS_ALPHA).await;
    let err = core.boundary().fetch_bundle("u1", "u1", 2).await;
    assert!(matches!(err, Err(EngineError::BadKeys(_))));
    cleanup(&path);
}
