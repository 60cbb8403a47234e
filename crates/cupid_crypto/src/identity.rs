//! Identity key management
//!
//! Each user has one long-term `IdentityKeyPair` (Ed25519). The public half
//! is what peers pin: if a stored identity key for a known peer changes, the
//! trust ledger MUST surface it — never silently accept the new key.
//!
//! Wire encoding
//! -------------
//! Public keys travel and persist in their canonical serialization:
//! a version byte (currently 1) followed by the 32 raw key bytes. The
//! canonical form is preserved bit-exact across store, wire, and cache;
//! base64 (URL-safe, no padding) is layered on top for JSON bodies.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier as _, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use zeroize::ZeroizeOnDrop;

use crate::error::CryptoError;

/// Canonical key serialization version (first byte on wire and in the store).
pub const KEY_WIRE_VERSION: u8 = 1;

// ── Newtype wrapper ──────────────────────────────────────────────────────────

/// 32-byte public key. Raw bytes in memory; versioned on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKeyBytes(pub [u8; 32]);

impl PublicKeyBytes {
    pub fn from_raw(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey(format!("expected 32 bytes, got {}", bytes.len())))?;
        Ok(Self(arr))
    }

    /// Canonical serialization: version byte || 32 raw bytes.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(33);
        out.push(KEY_WIRE_VERSION);
        out.extend_from_slice(&self.0);
        out
    }

    pub fn from_wire(bytes: &[u8]) -> Result<Self, CryptoError> {
        match bytes.split_first() {
            Some((&KEY_WIRE_VERSION, rest)) => Self::from_raw(rest),
            Some((v, _)) => Err(CryptoError::InvalidKey(format!("unknown key version {v}"))),
            None => Err(CryptoError::InvalidKey("empty key".into())),
        }
    }

    /// Base64 of the canonical serialization, for JSON wire bodies.
    pub fn to_b64(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.to_wire())
    }

    pub fn from_b64(s: &str) -> Result<Self, CryptoError> {
        Self::from_wire(&URL_SAFE_NO_PAD.decode(s)?)
    }

    /// Human-readable fingerprint: BLAKE3 of the raw key bytes, truncated to
    /// 20 bytes (160 bits), hex-encoded in groups of 4 for display.
    ///
    /// Example: "a1b2 c3d4 e5f6 7890 abcd ef01 2345 6789 0abc def0"
    pub fn fingerprint(&self) -> String {
        let hash = blake3::hash(&self.0);
        let hex = hex::encode(&hash.as_bytes()[..20]);
        hex.chars()
            .collect::<Vec<_>>()
            .chunks(4)
            .map(|c| c.iter().collect::<String>())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Compare a claimed fingerprint against this key, in constant time.
    ///
    /// Both sides are hashed to fixed length first so neither content nor
    /// length of the claim leaks through timing.
    pub fn fingerprint_matches(&self, claimed: &str) -> bool {
        let ours = blake3::hash(self.fingerprint().as_bytes());
        let theirs = blake3::hash(claimed.as_bytes());
        let mut diff = 0u8;
        for (a, b) in ours.as_bytes().iter().zip(theirs.as_bytes().iter()) {
            diff |= a ^ b;
        }
        diff == 0
    }
}

// ── Identity keypair ──────────────────────────────────────────────────────────

/// Long-term identity signing key. Drop clears memory via ZeroizeOnDrop.
#[derive(ZeroizeOnDrop)]
pub struct IdentityKeyPair {
    #[zeroize(skip)]
    pub public: PublicKeyBytes,
    secret_bytes: [u8; 32],
}

impl IdentityKeyPair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let public = PublicKeyBytes(signing_key.verifying_key().to_bytes());
        let secret_bytes = signing_key.to_bytes();
        Self { public, secret_bytes }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey(format!("identity key must be 32 bytes, got {}", bytes.len())))?;
        let signing_key = SigningKey::from_bytes(&arr);
        let public = PublicKeyBytes(signing_key.verifying_key().to_bytes());
        Ok(Self { public, secret_bytes: arr })
    }

    pub fn secret_bytes(&self) -> &[u8; 32] {
        &self.secret_bytes
    }

    fn signing_key(&self) -> SigningKey {
        SigningKey::from_bytes(&self.secret_bytes)
    }

    /// Sign arbitrary bytes; returns the 64-byte raw Ed25519 signature.
    pub fn sign(&self, msg: &[u8]) -> Vec<u8> {
        self.signing_key().sign(msg).to_bytes().to_vec()
    }

    /// Verify a signature made by any Ed25519 public key.
    pub fn verify(public: &PublicKeyBytes, msg: &[u8], sig_bytes: &[u8]) -> Result<(), CryptoError> {
        let vk = VerifyingKey::from_bytes(&public.0)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let sig = Signature::from_bytes(
            sig_bytes
                .try_into()
                .map_err(|_| CryptoError::InvalidKey("bad signature length".into()))?,
        );
        vk.verify(msg, &sig).map_err(|_| CryptoError::SignatureVerification)
    }
}

/// Generate a registration id in Signal's 14-bit space (1..=16384).
pub fn generate_registration_id() -> u32 {
    use rand::RngCore;
    let mut b = [0u8; 2];
    OsRng.fill_bytes(&mut b);
    u32::from(u16::from_be_bytes(b) & 0x3FFF) + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_roundtrip_preserves_version_byte() {
        let ik = IdentityKeyPair::generate();
        let wire = ik.public.to_wire();
        assert_eq!(wire[0], KEY_WIRE_VERSION);
        assert_eq!(wire.len(), 33);
        let back = PublicKeyBytes::from_wire(&wire).unwrap();
        assert_eq!(back, ik.public);
        let b64 = ik.public.to_b64();
        assert_eq!(PublicKeyBytes::from_b64(&b64).unwrap(), ik.public);
    }

    #[test]
    fn rejects_unknown_key_version() {
        let ik = IdentityKeyPair::generate();
        let mut wire = ik.public.to_wire();
        wire[0] = 7;
        assert!(PublicKeyBytes::from_wire(&wire).is_err());
    }

    #[test]
    fn sign_verify_roundtrip() {
        let ik = IdentityKeyPair::generate();
        let sig = ik.sign(b"prekey bytes");
        IdentityKeyPair::verify(&ik.public, b"prekey bytes", &sig).unwrap();
        assert!(IdentityKeyPair::verify(&ik.public, b"other bytes", &sig).is_err());
    }

    #[test]
    fn fingerprint_is_stable_and_matches() {
        let ik = IdentityKeyPair::generate();
        let fp = ik.public.fingerprint();
        assert_eq!(fp, ik.public.fingerprint());
        assert!(ik.public.fingerprint_matches(&fp));
        assert!(!ik.public.fingerprint_matches("0000 0000"));
    }

    #[test]
    fn registration_id_in_range() {
        for _ in 0..64 {
            let id = generate_registration_id();
            assert!((1..=16384).contains(&id));
        }
    }
}
