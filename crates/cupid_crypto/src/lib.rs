//! cupid_crypto — cryptographic primitives for the Cupid E2EE core
//!
//! # Design principles
//! - NO custom crypto; all primitives come from audited Rust crates.
//! - Zeroize all secret material on drop.
//! - Public APIs return opaque newtypes to prevent accidental misuse.
//!
//! # Module layout
//! - `identity` — long-term Ed25519 identity keys, wire encoding, fingerprints
//! - `vault`    — passphrase sealing of private key material (Argon2id + AES-256-GCM)
//! - `x3dh`     — asynchronous key agreement (SPK verification, proper DH set)
//! - `ratchet`  — full Double Ratchet with DH ratchet steps + skipped message keys
//! - `aead`     — XChaCha20-Poly1305 encrypt/decrypt helpers for message payloads
//! - `kdf`      — HKDF / Argon2id key derivation
//! - `error`    — unified error type

pub mod aead;
pub mod error;
pub mod identity;
pub mod kdf;
pub mod ratchet;
pub mod vault;
pub mod x3dh;

pub use error::CryptoError;
