//! cupid_proto — wire types and canonical serialisation for the Cupid E2EE core
//!
//! All JSON bodies are camelCase and versioned; ciphertext envelopes use a
//! compact binary layout (version byte first, big-endian length prefixes)
//! that MUST be preserved bit-exact across store, wire, and cache.
//!
//! # Modules
//! - `api`      — request/response bodies for the key and session endpoints
//! - `envelope` — the ciphertext envelope (ratchet header + optional handshake)
//! - `codec`    — binary encode/decode for envelopes and header AAD bytes

pub mod api;
pub mod codec;
pub mod envelope;

pub use envelope::{MessageType, PrekeyHeader, WireMessage};
