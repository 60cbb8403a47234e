//! Ciphertext envelope — what the transport carries between peers.
//!
//! The transport is a dumb relay: it sees the message type, the ratchet
//! header, and opaque ciphertext. A PREKEY envelope additionally carries the
//! handshake material the recipient needs to reconstruct the session; every
//! envelope after the handshake is NORMAL.

use serde::{Deserialize, Serialize};

use cupid_crypto::ratchet::RatchetHeader;

/// Wire message type. PREKEY until the initiator's handshake is confirmed
/// by a decrypted reply; NORMAL afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    #[serde(rename = "PREKEY")]
    Prekey,
    #[serde(rename = "NORMAL")]
    Normal,
}

/// Handshake material carried by a PREKEY envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrekeyHeader {
    /// Initiator's registration id.
    pub registration_id: u32,
    /// Initiator's Ed25519 identity public key, canonical wire form.
    pub identity_key: Vec<u8>,
    /// Initiator's X25519 handshake ephemeral (raw 32 bytes).
    pub ephemeral_key: [u8; 32],
    /// The recipient signed prekey the handshake used.
    pub signed_prekey_id: u32,
    /// The one-time prekey consumed, if the bundle still had one.
    pub one_time_prekey_id: Option<u32>,
}

/// A decoded envelope.
#[derive(Debug, Clone)]
pub struct WireMessage {
    pub message_type: MessageType,
    /// Present exactly when `message_type` is PREKEY.
    pub prekey: Option<PrekeyHeader>,
    pub header: RatchetHeader,
    /// AEAD output: nonce || ciphertext+tag.
    pub ciphertext: Vec<u8>,
}
