//! cupid_store — durable protocol store for the Cupid E2EE core
//!
//! # Storage strategy
//! SQLite does NOT natively encrypt. Key material is sealed at the
//! application layer before it reaches a row:
//! - long-term privates (identity, prekeys) under the owner's passphrase
//!   via `cupid_crypto::vault` (Argon2id + AES-256-GCM),
//! - session records under the process-wide store key.
//! Non-sensitive metadata (timestamps, user ids, counters) is stored in
//! plaintext to allow efficient queries and sweeps.
//!
//! # Guarantees
//! - one-time prekey claiming is a linearizable compare-and-set,
//! - key generation and signed-prekey rotation are transactional,
//! - session records are cached in-process with a short TTL and the cache is
//!   invalidated before every write,
//! - every operation runs under a bounded timeout.

pub mod cache;
pub mod db;
pub mod error;
pub mod models;

pub use db::{IdentityObservation, ProtocolStore};
pub use error::StoreError;
pub use models::TrustState;
