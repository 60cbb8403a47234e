use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    #[error("Signature verification failed")]
    SignatureVerification,

    #[error("AEAD encryption failed")]
    AeadEncrypt,

    #[error("AEAD decryption failed (authentication tag mismatch — possible tampering)")]
    AeadDecrypt,

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("Passphrase rejected by policy: {0}")]
    WeakPassphrase(String),

    #[error("Sealed blob is malformed: {0}")]
    MalformedSealed(String),

    #[error("Unsupported KDF parameters")]
    UnsupportedParams,

    #[error("Chain is not ready to send")]
    ChainNotReady,

    #[error("Too many skipped messages ({got} > {limit})")]
    SkipLimitExceeded { got: u32, limit: u32 },

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error("Base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),
}
