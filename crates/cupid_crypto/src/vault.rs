//! Vault: passphrase sealing of private key material.
//!
//! Private keys rest sealed; they are opened for one operation and the
//! plaintext is zeroized immediately after. The sealing key is derived from
//! the owner's passphrase with Argon2id and the cipher is AES-256-GCM
//! (constant-time tag verification comes with the cipher).
//!
//! Sealed blob layout (all lengths big-endian):
//!
//!   version(1)=1 || kdfParamsLen(2) || kdfParams || saltLen(1) || salt ||
//!   nonceLen(1) || nonce || ctLen(4) || ciphertext||tag
//!
//! `kdfParams` is `mCostKiB(4) || tCost(4) || pCost(4)`.
//!
//! AAD binds each blob to its owner and purpose:
//! `"cupid-key-v1" || userId || keyKind`. A blob lifted from one row cannot
//! be opened in place of another.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use zeroize::Zeroizing;

use crate::{
    error::CryptoError,
    kdf::{self, KdfParams},
};

pub const SEALED_VERSION: u8 = 1;
const AAD_CONTEXT: &[u8] = b"cupid-key-v1";
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const KDF_PARAMS_LEN: usize = 12;
/// Sealed payloads are small key material; anything larger is a corrupt blob.
const MAX_CT_LEN: usize = 1024 * 1024;

/// What a sealed blob protects. Part of the AAD, so kinds cannot be swapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    Identity,
    SignedPreKey,
    OneTimePreKey,
    Session,
}

impl KeyKind {
    pub fn label(&self) -> &'static str {
        match self {
            KeyKind::Identity => "identity",
            KeyKind::SignedPreKey => "signed-prekey",
            KeyKind::OneTimePreKey => "one-time-prekey",
            KeyKind::Session => "session",
        }
    }
}

/// Process-wide vault configuration. Read-only after startup.
#[derive(Debug, Clone, Default)]
pub struct VaultConfig {
    /// Allows the configured development passphrase through the policy check.
    pub dev_mode: bool,
    /// Accepted verbatim when `dev_mode` is set; ignored (fails closed) otherwise.
    pub dev_passphrase: Option<String>,
    pub kdf: KdfParams,
}

/// Passphrase policy: length ≥ 12 and all of upper, lower, digit, symbol.
pub fn check_passphrase_policy(passphrase: &str, config: &VaultConfig) -> Result<(), CryptoError> {
    if config.dev_mode {
        if let Some(dev) = &config.dev_passphrase {
            if passphrase == dev {
                return Ok(());
            }
        }
    }
    if passphrase.chars().count() < 12 {
        return Err(CryptoError::WeakPassphrase("must be at least 12 characters".into()));
    }
    let upper = passphrase.chars().any(|c| c.is_uppercase());
    let lower = passphrase.chars().any(|c| c.is_lowercase());
    let digit = passphrase.chars().any(|c| c.is_ascii_digit());
    let symbol = passphrase.chars().any(|c| !c.is_alphanumeric());
    if !(upper && lower && digit && symbol) {
        return Err(CryptoError::WeakPassphrase(
            "must contain upper case, lower case, a digit, and a symbol".into(),
        ));
    }
    Ok(())
}

fn aad(user_id: &str, kind: KeyKind) -> Vec<u8> {
    let mut out = Vec::with_capacity(AAD_CONTEXT.len() + user_id.len() + 16);
    out.extend_from_slice(AAD_CONTEXT);
    out.extend_from_slice(user_id.as_bytes());
    out.extend_from_slice(kind.label().as_bytes());
    out
}

/// Seal `plaintext` under `passphrase`, bound to (user, kind).
/// Enforces the passphrase policy on every call.
pub fn seal(
    plaintext: &[u8],
    passphrase: &str,
    user_id: &str,
    kind: KeyKind,
    config: &VaultConfig,
) -> Result<Vec<u8>, CryptoError> {
    check_passphrase_policy(passphrase, config)?;

    let salt = kdf::generate_salt();
    let key = kdf::sealing_key_from_passphrase(passphrase.as_bytes(), &salt, &config.kdf)?;

    let mut nonce = [0u8; NONCE_LEN];
    {
        use rand::RngCore;
        rand::rngs::OsRng.fill_bytes(&mut nonce);
    }

    let cipher = Aes256Gcm::new_from_slice(&key.0).map_err(|_| CryptoError::AeadEncrypt)?;
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload { msg: plaintext, aad: &aad(user_id, kind) },
        )
        .map_err(|_| CryptoError::AeadEncrypt)?;

    let mut out = Vec::with_capacity(1 + 2 + KDF_PARAMS_LEN + 1 + SALT_LEN + 1 + NONCE_LEN + 4 + ciphertext.len());
    out.push(SEALED_VERSION);
    out.extend_from_slice(&(KDF_PARAMS_LEN as u16).to_be_bytes());
    out.extend_from_slice(&config.kdf.m_cost_kib.to_be_bytes());
    out.extend_from_slice(&config.kdf.t_cost.to_be_bytes());
    out.extend_from_slice(&config.kdf.p_cost.to_be_bytes());
    out.push(SALT_LEN as u8);
    out.extend_from_slice(&salt);
    out.push(NONCE_LEN as u8);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&(ciphertext.len() as u32).to_be_bytes());
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Open a sealed blob. A failed tag check means wrong passphrase or
/// tampering — the two are indistinguishable by construction.
pub fn open(
    sealed: &[u8],
    passphrase: &str,
    user_id: &str,
    kind: KeyKind,
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let mut cur = Cursor { buf: sealed, pos: 0 };

    let version = cur.take_u8()?;
    if version != SEALED_VERSION {
        return Err(CryptoError::MalformedSealed(format!("unknown version {version}")));
    }

    let params_len = cur.take_u16()? as usize;
    if params_len != KDF_PARAMS_LEN {
        return Err(CryptoError::UnsupportedParams);
    }
    let params = KdfParams {
        m_cost_kib: cur.take_u32()?,
        t_cost: cur.take_u32()?,
        p_cost: cur.take_u32()?,
    };
    if !params.is_supported() {
        return Err(CryptoError::UnsupportedParams);
    }

    let salt_len = cur.take_u8()? as usize;
    if salt_len != SALT_LEN {
        return Err(CryptoError::MalformedSealed(format!("bad salt length {salt_len}")));
    }
    let salt: [u8; SALT_LEN] = cur.take(SALT_LEN)?.try_into().expect("length checked");

    let nonce_len = cur.take_u8()? as usize;
    if nonce_len != NONCE_LEN {
        return Err(CryptoError::MalformedSealed(format!("bad nonce length {nonce_len}")));
    }
    let nonce: [u8; NONCE_LEN] = cur.take(NONCE_LEN)?.try_into().expect("length checked");

    let ct_len = cur.take_u32()? as usize;
    if ct_len > MAX_CT_LEN {
        return Err(CryptoError::MalformedSealed(format!("ciphertext length {ct_len} too large")));
    }
    let ciphertext = cur.take(ct_len)?;
    if cur.pos != sealed.len() {
        return Err(CryptoError::MalformedSealed("trailing bytes".into()));
    }

    let key = kdf::sealing_key_from_passphrase(passphrase.as_bytes(), &salt, &params)?;
    let cipher = Aes256Gcm::new_from_slice(&key.0).map_err(|_| CryptoError::AeadDecrypt)?;
    let plaintext = cipher
        .decrypt(
            Nonce::from_slice(&nonce),
            Payload { msg: ciphertext, aad: &aad(user_id, kind) },
        )
        .map_err(|_| CryptoError::AeadDecrypt)?;

    Ok(Zeroizing::new(plaintext))
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], CryptoError> {
        if self.pos + n > self.buf.len() {
            return Err(CryptoError::MalformedSealed("truncated".into()));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn take_u8(&mut self) -> Result<u8, CryptoError> {
        Ok(self.take(1)?[0])
    }

    fn take_u16(&mut self) -> Result<u16, CryptoError> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into().expect("length checked")))
    }

    fn take_u32(&mut self) -> Result<u32, CryptoError> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().expect("length checked")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> VaultConfig {
        // Low-cost Argon2 so the suite stays fast; bounds still accept it.
        VaultConfig {
            kdf: KdfParams { m_cost_kib: 8 * 1024, t_cost: 1, p_cost: 1 },
            ..VaultConfig::default()
        }
    }

    const PASS: &str = "P@ssw0rd-Alpha-01";

    #[test]
    fn seal_open_roundtrip() {
        let cfg = test_config();
        let sealed = seal(b"secret key bytes", PASS, "u1", KeyKind::Identity, &cfg).unwrap();
        assert_eq!(sealed[0], SEALED_VERSION);
        let opened = open(&sealed, PASS, "u1", KeyKind::Identity).unwrap();
        assert_eq!(opened.as_slice(), b"secret key bytes");
    }

    #[test]
    fn wrong_passphrase_fails_tag_check() {
        let cfg = test_config();
        let sealed = seal(b"secret", PASS, "u1", KeyKind::Identity, &cfg).unwrap();
        assert!(matches!(
            open(&sealed, "P@ssw0rd-Beta-02", "u1", KeyKind::Identity),
            Err(CryptoError::AeadDecrypt)
        ));
    }

    #[test]
    fn tampered_blob_fails() {
        let cfg = test_config();
        let mut sealed = seal(b"secret", PASS, "u1", KeyKind::Identity, &cfg).unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(open(&sealed, PASS, "u1", KeyKind::Identity).is_err());
    }

    #[test]
    fn aad_binds_user_and_kind() {
        let cfg = test_config();
        let sealed = seal(b"secret", PASS, "u1", KeyKind::Identity, &cfg).unwrap();
        assert!(open(&sealed, PASS, "u2", KeyKind::Identity).is_err());
        assert!(open(&sealed, PASS, "u1", KeyKind::SignedPreKey).is_err());
    }

    #[test]
    fn weak_passphrases_rejected() {
        let cfg = test_config();
        for weak in ["short1!A", "alllowercase1!", "ALLUPPERCASE1!", "NoDigitsHere!", "NoSymbols123A"] {
            assert!(matches!(
                seal(b"x", weak, "u1", KeyKind::Identity, &cfg),
                Err(CryptoError::WeakPassphrase(_))
            ));
        }
    }

    #[test]
    fn dev_passphrase_only_in_dev_mode() {
        let mut cfg = test_config();
        cfg.dev_passphrase = Some("devdevdev".into());
        // Fails closed without the flag.
        assert!(seal(b"x", "devdevdev", "u1", KeyKind::Identity, &cfg).is_err());
        cfg.dev_mode = true;
        let sealed = seal(b"x", "devdevdev", "u1", KeyKind::Identity, &cfg).unwrap();
        assert_eq!(open(&sealed, "devdevdev", "u1", KeyKind::Identity).unwrap().as_slice(), b"x");
    }

    #[test]
    fn unsupported_params_refused_on_open() {
        let cfg = test_config();
        let mut sealed = seal(b"secret", PASS, "u1", KeyKind::Identity, &cfg).unwrap();
        // Patch m_cost below the supported floor.
        sealed[3..7].copy_from_slice(&1024u32.to_be_bytes());
        assert!(matches!(
            open(&sealed, PASS, "u1", KeyKind::Identity),
            Err(CryptoError::UnsupportedParams)
        ));
    }
}
