//! Engine error taxonomy.
//!
//! The core surfaces error kinds; the Boundary alone maps them onto stable
//! wire codes. Nothing is ever silently recovered at the cost of security —
//! a mismatched identity key never auto-replaces a trusted one.

use thiserror::Error;

use cupid_crypto::CryptoError;
use cupid_store::StoreError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("identity keys have not been generated")]
    MissingKeys,

    #[error("bad key material: {0}")]
    BadKeys(String),

    #[error("passphrase rejected by policy: {0}")]
    WeakPassphrase(String),

    #[error("passphrase incorrect or identity locked")]
    WrongPassphrase,

    #[error("no session with this peer; initiate first")]
    SessionMissing,

    #[error("session is gone; delete and re-initiate")]
    SessionGone,

    #[error("message could not be decrypted")]
    Undecipherable,

    #[error("message exceeds the out-of-order window")]
    OutOfOrder,

    #[error("peer identity changed; explicit trust required")]
    TrustBroken,

    #[error("conflicting write: {0}")]
    Conflict(String),

    #[error("backing store unavailable")]
    StoreUnavailable,

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Stable code for the wire. One string per kind, never renamed.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::MissingKeys => "MissingKeys",
            EngineError::BadKeys(_) => "BadKeys",
            EngineError::WeakPassphrase(_) => "WeakPassphrase",
            EngineError::WrongPassphrase => "WrongPassphrase",
            EngineError::SessionMissing => "SessionMissing",
            EngineError::SessionGone => "SessionGone",
            EngineError::Undecipherable => "Undecipherable",
            EngineError::OutOfOrder => "OutOfOrder",
            EngineError::TrustBroken => "TrustBroken",
            EngineError::Conflict(_) => "Conflict",
            EngineError::StoreUnavailable => "StoreUnavailable",
            EngineError::Internal(_) => "Internal",
        }
    }

    /// Kinds that indicate attacker behaviour and count toward
    /// suspicious-activity detection.
    pub fn is_suspicious(&self) -> bool {
        matches!(
            self,
            EngineError::BadKeys(_)
                | EngineError::TrustBroken
                | EngineError::Undecipherable
                | EngineError::WrongPassphrase
        )
    }

    /// Map a vault open failure: the tag check cannot distinguish a wrong
    /// passphrase from tampering, so both surface as WrongPassphrase.
    pub fn from_vault(err: CryptoError) -> Self {
        match err {
            CryptoError::AeadDecrypt => EngineError::WrongPassphrase,
            CryptoError::WeakPassphrase(msg) => EngineError::WeakPassphrase(msg),
            CryptoError::MalformedSealed(msg) => EngineError::BadKeys(msg),
            CryptoError::UnsupportedParams => EngineError::BadKeys("unsupported KDF parameters".into()),
            other => EngineError::Internal(other.to_string()),
        }
    }

    /// Map a crypto failure on provided (peer) key material.
    pub fn from_bad_material(err: CryptoError) -> Self {
        match err {
            CryptoError::SignatureVerification => EngineError::BadKeys("signature verification failed".into()),
            CryptoError::InvalidKey(msg) => EngineError::BadKeys(msg),
            CryptoError::Base64Decode(e) => EngineError::BadKeys(e.to_string()),
            other => EngineError::Internal(other.to_string()),
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(msg) => EngineError::Conflict(msg),
            StoreError::Unavailable => EngineError::StoreUnavailable,
            StoreError::Database(_) | StoreError::Migration(_) => EngineError::StoreUnavailable,
            StoreError::NotFound(msg) => EngineError::Internal(msg),
            StoreError::Serialisation(e) => EngineError::Internal(e.to_string()),
        }
    }
}
