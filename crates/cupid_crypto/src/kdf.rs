//! Key derivation functions
//!
//! `sealing_key_from_passphrase` — Argon2id, derives the 32-byte key that
//!   seals private key material in the vault.
//!
//! `hkdf_expand` — HKDF-SHA256, used for X3DH shared-secret derivation.
//!
//! `kdf_rk` / `kdf_ck` — the Double Ratchet key derivation pair.

use argon2::{Argon2, Params, Version};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::ZeroizeOnDrop;

use crate::error::CryptoError;

// ── Sealing key (Argon2id) ───────────────────────────────────────────────────

/// 32-byte sealing key derived from a user passphrase. Zeroized on drop.
#[derive(ZeroizeOnDrop)]
pub struct SealingKey(pub [u8; 32]);

/// Argon2id cost parameters carried inside every sealed blob so old blobs
/// stay openable after the defaults change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    pub m_cost_kib: u32,
    pub t_cost: u32,
    pub p_cost: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self { m_cost_kib: 64 * 1024, t_cost: 3, p_cost: 4 }
    }
}

impl KdfParams {
    /// Bounds accepted on open. Blobs outside are refused, not guessed at.
    pub fn is_supported(&self) -> bool {
        (8 * 1024..=1024 * 1024).contains(&self.m_cost_kib)
            && (1..=10).contains(&self.t_cost)
            && (1..=16).contains(&self.p_cost)
    }
}

/// Derive a sealing key from a passphrase + 16-byte salt.
/// The salt is stored alongside the sealed blob (not secret).
pub fn sealing_key_from_passphrase(
    passphrase: &[u8],
    salt: &[u8; 16],
    params: &KdfParams,
) -> Result<SealingKey, CryptoError> {
    let params = Params::new(params.m_cost_kib, params.t_cost, params.p_cost, Some(32))
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    let argon2 = Argon2::new(argon2::Algorithm::Argon2id, Version::V0x13, params);
    let mut output = [0u8; 32];
    argon2
        .hash_password_into(passphrase, salt, &mut output)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok(SealingKey(output))
}

/// Generate a fresh random 16-byte salt (one per seal).
pub fn generate_salt() -> [u8; 16] {
    use rand::RngCore;
    let mut salt = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    salt
}

// ── HKDF-SHA256 ───────────────────────────────────────────────────────────────

/// Expand `ikm` + `info` into `output.len()` bytes of key material.
pub fn hkdf_expand(
    ikm: &[u8],
    salt: Option<&[u8]>,
    info: &[u8],
    output: &mut [u8],
) -> Result<(), CryptoError> {
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    hk.expand(info, output)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))
}

// ── Double Ratchet KDFs ──────────────────────────────────────────────────────

/// KDF_RK: mix a DH output into the root key.
/// Returns (new_root_key, new_chain_key).
pub fn kdf_rk(rk: &[u8; 32], dh_output: &[u8]) -> Result<([u8; 32], [u8; 32]), CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(rk), dh_output);
    let mut new_rk = [0u8; 32];
    let mut ck = [0u8; 32];
    hk.expand(b"cupid-ratchet-rk", &mut new_rk)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    hk.expand(b"cupid-ratchet-ck", &mut ck)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok((new_rk, ck))
}

/// KDF_CK: chain key → (next_chain_key, message_key).
/// HMAC-based derivation with the Signal constants.
pub fn kdf_ck(ck: &[u8; 32]) -> Result<([u8; 32], [u8; 32]), CryptoError> {
    type HmacSha256 = Hmac<Sha256>;

    let mut mac_ck = HmacSha256::new_from_slice(ck)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    mac_ck.update(&[0x01]);
    let new_ck: [u8; 32] = mac_ck.finalize().into_bytes().into();

    let mut mac_mk = HmacSha256::new_from_slice(ck)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    mac_mk.update(&[0x02]);
    let mk: [u8; 32] = mac_mk.finalize().into_bytes().into();

    Ok((new_ck, mk))
}
