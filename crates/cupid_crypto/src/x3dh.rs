//! X3DH asynchronous key agreement.
//!
//! References:
//!   - Signal X3DH spec: <https://signal.org/docs/specifications/x3dh/>
//!   - RFC 7748 (X25519): <https://datatracker.ietf.org/doc/html/rfc7748>
//!   - RFC 5869 (HKDF):  <https://datatracker.ietf.org/doc/html/rfc5869>
//!
//! Protocol:
//!   The initiator fetches the peer's published key bundle:
//!     IK_B  (identity, Ed25519 public → converted to X25519)
//!     SPK_B (signed prekey, X25519) + IK_B signature over SPK_B
//!     OPK_B (optional one-time prekey, X25519)
//!
//!   The initiator generates ONE ephemeral keypair EK_A (X25519).
//!
//!   DH calculations (using a single EK_A throughout):
//!     DH1 = DH(IK_A_x25519, SPK_B)      — mutual authentication
//!     DH2 = DH(EK_A,        IK_B_x25519) — forward secrecy
//!     DH3 = DH(EK_A,        SPK_B)       — replay protection
//!     DH4 = DH(EK_A,        OPK_B)       — one-time forward secrecy [optional]
//!
//!   SK = HKDF(salt=0, ikm = 0xFF*32 || DH1 || DH2 || DH3 [|| DH4],
//!             info="cupid-x3dh-v1")
//!
//! Non-negotiable:
//!   - The initiator MUST verify the SPK_B signature before computing any DH.
//!   - EK_A doubles as the initiator's first ratchet key, so the first
//!     message header carries it and the responder can mirror the DH set.
//!   - The SK feeds into the Double Ratchet as the initial root key.

use rand::rngs::OsRng;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::Zeroize;

use crate::{error::CryptoError, identity::IdentityKeyPair, identity::PublicKeyBytes, kdf};

const X3DH_INFO: &[u8] = b"cupid-x3dh-v1";

// ── Ed25519 ↔ X25519 conversion ──────────────────────────────────────────────

/// Convert an Ed25519 signing key (32 bytes) to an X25519 static secret.
/// Uses the clamped SHA-512 expansion that ed25519-dalek applies internally,
/// mirroring libsignal's IK → X25519 conversion.
pub fn ed25519_secret_to_x25519(ed_secret: &[u8; 32]) -> StaticSecret {
    use sha2::{Digest, Sha512};
    let mut h = Sha512::digest(ed_secret);
    // Clamp as per RFC 7748 §5
    h[0] &= 248;
    h[31] &= 127;
    h[31] |= 64;
    let mut key = [0u8; 32];
    key.copy_from_slice(&h[..32]);
    h.as_mut_slice().zeroize();
    StaticSecret::from(key)
}

/// Convert an Ed25519 verifying key (public, 32 bytes) to an X25519 public
/// key via the birational map from the Edwards curve to Curve25519.
pub fn ed25519_pub_to_x25519(ed_pub: &[u8; 32]) -> Result<X25519Public, CryptoError> {
    use curve25519_dalek::edwards::CompressedEdwardsY;
    let compressed = CompressedEdwardsY::from_slice(ed_pub)
        .map_err(|_| CryptoError::InvalidKey("invalid Ed25519 public key".into()))?;
    let point = compressed
        .decompress()
        .ok_or_else(|| CryptoError::InvalidKey("Ed25519 public key decompression failed".into()))?;
    Ok(X25519Public::from(point.to_montgomery().to_bytes()))
}

// ── Prekey generation ────────────────────────────────────────────────────────

/// Generate a signed prekey: an X25519 keypair with the public half signed
/// by the owner's Ed25519 identity key.
pub fn generate_signed_prekey(identity: &IdentityKeyPair) -> (StaticSecret, X25519Public, Vec<u8>) {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = X25519Public::from(&secret);
    let sig = identity.sign(public.as_bytes());
    (secret, public, sig)
}

/// Generate a batch of one-time prekeys (X25519).
pub fn generate_one_time_prekeys(count: usize) -> Vec<(StaticSecret, X25519Public)> {
    (0..count)
        .map(|_| {
            let s = StaticSecret::random_from_rng(OsRng);
            let p = X25519Public::from(&s);
            (s, p)
        })
        .collect()
}

// ── Peer bundle ──────────────────────────────────────────────────────────────

/// Decoded form of a fetched prekey bundle, ready for the DH set.
pub struct PeerBundle {
    /// Ed25519 identity public key
    pub identity: PublicKeyBytes,
    pub signed_prekey_id: u32,
    pub signed_prekey: [u8; 32],
    /// Ed25519 signature over the raw SPK public bytes
    pub signed_prekey_sig: Vec<u8>,
    pub one_time_prekey: Option<(u32, [u8; 32])>,
}

/// Result of the initiator handshake. The ephemeral secret seeds the Double
/// Ratchet's first sending chain; the rest travels in the PREKEY header.
pub struct Initiation {
    pub shared_key: [u8; 32],
    pub ephemeral_secret: StaticSecret,
    pub ephemeral_public: [u8; 32],
    pub signed_prekey_id: u32,
    pub one_time_prekey_id: Option<u32>,
}

// ── Initiator ────────────────────────────────────────────────────────────────

/// Initiate a session against a peer bundle.
///
/// Steps:
///   1. Verify the SPK signature using IK_B (Ed25519).
///   2. Convert IK_A secret → X25519; convert IK_B pub → X25519.
///   3. Generate ONE ephemeral X25519 keypair EK_A.
///   4. Compute DH1..DH4.
///   5. Derive SK via HKDF.
pub fn initiate(my_ik: &IdentityKeyPair, bundle: &PeerBundle) -> Result<Initiation, CryptoError> {
    IdentityKeyPair::verify(&bundle.identity, &bundle.signed_prekey, &bundle.signed_prekey_sig)?;

    let ik_a_x = ed25519_secret_to_x25519(my_ik.secret_bytes());
    let ik_b_x = ed25519_pub_to_x25519(&bundle.identity.0)?;
    let spk_b = X25519Public::from(bundle.signed_prekey);

    let ek_a = StaticSecret::random_from_rng(OsRng);
    let ek_a_pub = X25519Public::from(&ek_a);

    let dh1 = ik_a_x.diffie_hellman(&spk_b); // IK_A × SPK_B
    let dh2 = ek_a.diffie_hellman(&ik_b_x); //  EK_A × IK_B
    let dh3 = ek_a.diffie_hellman(&spk_b); //   EK_A × SPK_B

    let mut ikm = vec![0xFFu8; 32]; // domain separation pad
    ikm.extend_from_slice(dh1.as_bytes());
    ikm.extend_from_slice(dh2.as_bytes());
    ikm.extend_from_slice(dh3.as_bytes());

    let mut opk_id_out = None;
    if let Some((opk_id, opk_raw)) = bundle.one_time_prekey {
        let opk_b = X25519Public::from(opk_raw);
        let dh4 = ek_a.diffie_hellman(&opk_b); // EK_A × OPK_B
        ikm.extend_from_slice(dh4.as_bytes());
        opk_id_out = Some(opk_id);
    }

    let mut sk = [0u8; 32];
    kdf::hkdf_expand(&ikm, Some(&[0u8; 32]), X3DH_INFO, &mut sk)?;
    ikm.zeroize();

    Ok(Initiation {
        shared_key: sk,
        ephemeral_public: *ek_a_pub.as_bytes(),
        ephemeral_secret: ek_a,
        signed_prekey_id: bundle.signed_prekey_id,
        one_time_prekey_id: opk_id_out,
    })
}

// ── Responder ────────────────────────────────────────────────────────────────

/// Reconstruct SK from a PREKEY header's key material.
///
/// `my_ik` — the responder's Ed25519 identity keypair
/// `my_spk_secret` — the signed prekey secret named in the header
/// `my_opk_secret` — the consumed one-time prekey secret (if the init used one)
/// `sender_identity` — the initiator's Ed25519 identity public key
/// `sender_ephemeral` — EK_A from the header
pub fn respond(
    my_ik: &IdentityKeyPair,
    my_spk_secret: &StaticSecret,
    my_opk_secret: Option<&StaticSecret>,
    sender_identity: &PublicKeyBytes,
    sender_ephemeral: &[u8; 32],
) -> Result<[u8; 32], CryptoError> {
    let ek_a = X25519Public::from(*sender_ephemeral);
    let sender_ik_x = ed25519_pub_to_x25519(&sender_identity.0)?;
    let ik_b_x = ed25519_secret_to_x25519(my_ik.secret_bytes());

    // Mirror the initiator's DH order exactly (DH is commutative):
    //   DH1 = IK_A × SPK_B   →  SPK_B × IK_A
    //   DH2 = EK_A × IK_B    →  IK_B  × EK_A
    //   DH3 = EK_A × SPK_B   →  SPK_B × EK_A
    let dh1 = my_spk_secret.diffie_hellman(&sender_ik_x);
    let dh2 = ik_b_x.diffie_hellman(&ek_a);
    let dh3 = my_spk_secret.diffie_hellman(&ek_a);

    let mut ikm = vec![0xFFu8; 32];
    ikm.extend_from_slice(dh1.as_bytes());
    ikm.extend_from_slice(dh2.as_bytes());
    ikm.extend_from_slice(dh3.as_bytes());

    if let Some(opk_sec) = my_opk_secret {
        let dh4 = opk_sec.diffie_hellman(&ek_a);
        ikm.extend_from_slice(dh4.as_bytes());
    }

    let mut sk = [0u8; 32];
    kdf::hkdf_expand(&ikm, Some(&[0u8; 32]), X3DH_INFO, &mut sk)?;
    ikm.zeroize();

    Ok(sk)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle_for(
        ik: &IdentityKeyPair,
        spk_pub: &X25519Public,
        spk_sig: Vec<u8>,
        opk: Option<(u32, [u8; 32])>,
    ) -> PeerBundle {
        PeerBundle {
            identity: ik.public.clone(),
            signed_prekey_id: 1,
            signed_prekey: *spk_pub.as_bytes(),
            signed_prekey_sig: spk_sig,
            one_time_prekey: opk,
        }
    }

    #[test]
    fn roundtrip_without_opk() {
        let alice_ik = IdentityKeyPair::generate();
        let bob_ik = IdentityKeyPair::generate();

        let (bob_spk_secret, bob_spk_pub, bob_spk_sig) = generate_signed_prekey(&bob_ik);
        let bundle = bundle_for(&bob_ik, &bob_spk_pub, bob_spk_sig, None);

        let init = initiate(&alice_ik, &bundle).unwrap();
        let bob_sk = respond(
            &bob_ik,
            &bob_spk_secret,
            None,
            &alice_ik.public,
            &init.ephemeral_public,
        )
        .unwrap();

        assert_eq!(init.shared_key, bob_sk, "both sides must derive the same SK");
        assert_eq!(init.one_time_prekey_id, None);
    }

    #[test]
    fn roundtrip_with_opk() {
        let alice_ik = IdentityKeyPair::generate();
        let bob_ik = IdentityKeyPair::generate();

        let (bob_spk_secret, bob_spk_pub, bob_spk_sig) = generate_signed_prekey(&bob_ik);
        let opks = generate_one_time_prekeys(1);
        let (ref bob_opk_secret, ref bob_opk_pub) = opks[0];

        let bundle = bundle_for(
            &bob_ik,
            &bob_spk_pub,
            bob_spk_sig,
            Some((0, *bob_opk_pub.as_bytes())),
        );

        let init = initiate(&alice_ik, &bundle).unwrap();
        let bob_sk = respond(
            &bob_ik,
            &bob_spk_secret,
            Some(bob_opk_secret),
            &alice_ik.public,
            &init.ephemeral_public,
        )
        .unwrap();

        assert_eq!(init.shared_key, bob_sk);
        assert_eq!(init.one_time_prekey_id, Some(0));
    }

    #[test]
    fn rejects_invalid_spk_signature() {
        let alice_ik = IdentityKeyPair::generate();
        let bob_ik = IdentityKeyPair::generate();
        let evil_ik = IdentityKeyPair::generate();

        let (_spk_secret, spk_pub, _good_sig) = generate_signed_prekey(&bob_ik);
        // Sign SPK with the wrong key, but claim it's from bob
        let evil_sig = evil_ik.sign(spk_pub.as_bytes());
        let bundle = bundle_for(&bob_ik, &spk_pub, evil_sig, None);

        assert!(initiate(&alice_ik, &bundle).is_err(), "must reject SPK signed by wrong identity");
    }
}
