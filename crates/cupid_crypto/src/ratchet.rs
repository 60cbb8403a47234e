//! Double Ratchet with DH ratchet steps.
//!
//! References:
//!   - Signal Double Ratchet spec: <https://signal.org/docs/specifications/doubleratchet/>
//!
//! State separation (non-negotiable):
//!   RK  — root key (updated on every DH ratchet step)
//!   CKs — sending chain key (updated per message)
//!   CKr — receiving chain key (updated per message)
//!   MK  — message key (derived from CK, used once, then DELETED)
//!
//! DH Ratchet:
//!   A new X25519 ratchet keypair is generated per "turn" (whenever a header
//!   arrives carrying a ratchet public key we have not seen). The DH output
//!   is mixed into the root key via HKDF, producing a new root key and a new
//!   chain key.
//!
//! Forward secrecy: old chain keys and message keys are deleted.
//! Post-compromise security: a new DH ratchet step restores secrecy.
//!
//! The initiator's first sending chain is seeded by the X3DH ephemeral
//! against the peer's signed prekey, so the handshake ephemeral doubles as
//! the first ratchet key and appears in the first header.

use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::Zeroize;

use crate::{error::CryptoError, kdf};

// ── Header (included with every message, unencrypted but authenticated) ─────

/// Sent alongside every ciphertext so the recipient can advance their ratchet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatchetHeader {
    /// Sender's current DH ratchet public key
    pub dh_pub: [u8; 32],
    /// Number of messages in the previous sending chain
    pub pn: u32,
    /// Message number in the current sending chain
    pub n: u32,
}

/// Bounds on the skipped-message-key cache. Persisted with the state so a
/// session keeps the limits it was created under.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RatchetLimits {
    /// Maximum counter jump tolerated within one chain.
    pub max_skip: u32,
    /// Maximum cached skipped message keys per session (LRU beyond this).
    pub max_skipped_entries: usize,
}

impl Default for RatchetLimits {
    fn default() -> Self {
        Self { max_skip: 2000, max_skipped_entries: 1000 }
    }
}

#[derive(Serialize, Deserialize)]
struct SkippedKey {
    dh_pub: [u8; 32],
    n: u32,
    mk: [u8; 32],
}

// ── Session state ────────────────────────────────────────────────────────────

/// Complete Double Ratchet state for one session.
/// Serialized into the session record and stored sealed.
#[derive(Serialize, Deserialize)]
pub struct RatchetState {
    root_key: [u8; 32],

    /// Our current DH ratchet secret. Regenerated on each DH step.
    dh_self_secret: [u8; 32],
    dh_self_pub: [u8; 32],
    /// Peer's last seen DH ratchet public key.
    dh_remote_pub: Option<[u8; 32]>,

    /// Sending chain key. None for a responder that has not ratcheted yet.
    ck_send: Option<[u8; 32]>,
    /// Receiving chain key. None until the first message arrives.
    ck_recv: Option<[u8; 32]>,

    /// Send counter in the current chain.
    pub ns: u32,
    /// Receive counter in the current chain.
    pub nr: u32,
    /// Length of the previous sending chain.
    pub pn: u32,

    /// Message keys cached for out-of-order delivery, insertion-ordered so
    /// the oldest entry is evicted first.
    skipped: Vec<SkippedKey>,

    limits: RatchetLimits,
}

impl Drop for RatchetState {
    fn drop(&mut self) {
        self.root_key.zeroize();
        self.dh_self_secret.zeroize();
        if let Some(ref mut ck) = self.ck_send {
            ck.zeroize();
        }
        if let Some(ref mut ck) = self.ck_recv {
            ck.zeroize();
        }
        for s in self.skipped.iter_mut() {
            s.mk.zeroize();
        }
    }
}

impl RatchetState {
    /// Initiator state: the X3DH shared key becomes the first root key and
    /// the handshake ephemeral (against the peer's SPK) seeds the sending
    /// chain.
    pub fn initiator(
        shared_key: [u8; 32],
        ephemeral_secret: StaticSecret,
        peer_signed_prekey: &[u8; 32],
        limits: RatchetLimits,
    ) -> Result<Self, CryptoError> {
        let spk = X25519Public::from(*peer_signed_prekey);
        let dh = ephemeral_secret.diffie_hellman(&spk);
        let (root_key, ck_send) = kdf::kdf_rk(&shared_key, dh.as_bytes())?;
        let dh_self_pub = *X25519Public::from(&ephemeral_secret).as_bytes();

        Ok(Self {
            root_key,
            dh_self_secret: ephemeral_secret.to_bytes(),
            dh_self_pub,
            dh_remote_pub: Some(*peer_signed_prekey),
            ck_send: Some(ck_send),
            ck_recv: None,
            ns: 0,
            nr: 0,
            pn: 0,
            skipped: Vec::new(),
            limits,
        })
    }

    /// Responder state: the signed prekey named in the handshake is the
    /// initial ratchet key. The first incoming header triggers the first DH
    /// ratchet, which also creates the sending chain.
    pub fn responder(
        shared_key: [u8; 32],
        signed_prekey_secret: &StaticSecret,
        limits: RatchetLimits,
    ) -> Self {
        let dh_self_pub = *X25519Public::from(signed_prekey_secret).as_bytes();
        Self {
            root_key: shared_key,
            dh_self_secret: signed_prekey_secret.to_bytes(),
            dh_self_pub,
            dh_remote_pub: None,
            ck_send: None,
            ck_recv: None,
            ns: 0,
            nr: 0,
            pn: 0,
            skipped: Vec::new(),
            limits,
        }
    }

    // ── Encrypt ──────────────────────────────────────────────────────────

    /// Advance the sending chain. Returns the header to send and the
    /// one-use message key for AEAD.
    pub fn encrypt_step(&mut self) -> Result<(RatchetHeader, [u8; 32]), CryptoError> {
        let ck = self.ck_send.as_ref().ok_or(CryptoError::ChainNotReady)?;
        let (next_ck, mk) = kdf::kdf_ck(ck)?;
        let header = RatchetHeader { dh_pub: self.dh_self_pub, pn: self.pn, n: self.ns };
        self.ck_send = Some(next_ck);
        self.ns += 1;
        Ok((header, mk))
    }

    // ── Decrypt ──────────────────────────────────────────────────────────

    /// Derive the message key for a received header.
    ///
    /// Handles three cases:
    ///   1. Skipped message in the current or a previous chain
    ///   2. New DH ratchet (peer's dh_pub changed)
    ///   3. Message from the current receiving chain (normal)
    pub fn decrypt_step(&mut self, header: &RatchetHeader) -> Result<[u8; 32], CryptoError> {
        // Case 1: cached skipped key
        if let Some(i) = self
            .skipped
            .iter()
            .position(|s| s.dh_pub == header.dh_pub && s.n == header.n)
        {
            let entry = self.skipped.remove(i);
            return Ok(entry.mk);
        }

        // Case 2: DH ratchet needed?
        let need_ratchet = match self.dh_remote_pub {
            Some(ref current) => current != &header.dh_pub,
            None => true,
        };
        if need_ratchet {
            // Cache the remainder of the current receiving chain first.
            self.skip_message_keys(header.pn)?;
            self.dh_ratchet(&header.dh_pub)?;
        }

        // Case 3: advance the chain to the header's counter.
        self.skip_message_keys(header.n)?;
        let ck = self.ck_recv.as_ref().ok_or(CryptoError::ChainNotReady)?;
        let (next_ck, mk) = kdf::kdf_ck(ck)?;
        self.ck_recv = Some(next_ck);
        self.nr += 1;
        Ok(mk)
    }

    // ── Internal ─────────────────────────────────────────────────────────

    /// Derive and cache message keys from nr up to (but not including)
    /// `until` on the current receiving chain.
    fn skip_message_keys(&mut self, until: u32) -> Result<(), CryptoError> {
        let Some(mut ck) = self.ck_recv else {
            return Ok(()); // no receiving chain yet, nothing to skip
        };
        if until <= self.nr {
            return Ok(());
        }
        let skip_count = until - self.nr;
        if skip_count > self.limits.max_skip {
            return Err(CryptoError::SkipLimitExceeded { got: skip_count, limit: self.limits.max_skip });
        }

        let dh_pub = self.dh_remote_pub.unwrap_or([0u8; 32]);
        while self.nr < until {
            let (next_ck, mk) = kdf::kdf_ck(&ck)?;
            ck = next_ck;
            self.skipped.push(SkippedKey { dh_pub, n: self.nr, mk });
            self.nr += 1;
        }
        self.ck_recv = Some(ck);

        // Bounded cache: evict oldest entries beyond the limit.
        while self.skipped.len() > self.limits.max_skipped_entries {
            let mut evicted = self.skipped.remove(0);
            evicted.mk.zeroize();
        }
        Ok(())
    }

    /// One full DH ratchet turn: new receiving chain from the peer's new
    /// key, then a fresh local keypair and a new sending chain.
    fn dh_ratchet(&mut self, new_remote: &[u8; 32]) -> Result<(), CryptoError> {
        let remote = X25519Public::from(*new_remote);

        let dh_recv = StaticSecret::from(self.dh_self_secret).diffie_hellman(&remote);
        let (new_rk, ck_recv) = kdf::kdf_rk(&self.root_key, dh_recv.as_bytes())?;
        self.root_key = new_rk;
        self.ck_recv = Some(ck_recv);
        self.dh_remote_pub = Some(*new_remote);
        self.pn = self.ns;
        self.ns = 0;
        self.nr = 0;

        let new_secret = StaticSecret::random_from_rng(OsRng);
        self.dh_self_pub = *X25519Public::from(&new_secret).as_bytes();
        let dh_send = new_secret.diffie_hellman(&remote);
        let (new_rk2, ck_send) = kdf::kdf_rk(&self.root_key, dh_send.as_bytes())?;
        self.root_key = new_rk2;
        self.ck_send = Some(ck_send);
        self.dh_self_secret = new_secret.to_bytes();
        Ok(())
    }

    /// Number of cached skipped message keys (diagnostics).
    pub fn skipped_len(&self) -> usize {
        self.skipped.len()
    }
}
