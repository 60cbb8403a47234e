//! Binary codec for ciphertext envelopes.
//!
//! Layout (all integers big-endian):
//!
//!   version(1)=1 || type(1: 1=PREKEY, 2=NORMAL)
//!   [PREKEY only]
//!     registrationId(4)
//!     ikLen(1) || identityKey          — canonical key form (version byte + 32)
//!     ephemeralKey(32)
//!     signedPreKeyId(4)
//!     opkFlag(1) || [oneTimePreKeyId(4) when flag=1]
//!   header:
//!     dhPub(32) || pn(4) || n(4)
//!   ctLen(4) || ciphertext
//!
//! The encoded bytes are the canonical serialization: they are what gets
//! base64-encoded on the wire and MUST round-trip bit-exact.

use thiserror::Error;

use cupid_crypto::ratchet::RatchetHeader;

use crate::envelope::{MessageType, PrekeyHeader, WireMessage};

pub const WIRE_VERSION: u8 = 1;

const TYPE_PREKEY: u8 = 1;
const TYPE_NORMAL: u8 = 2;
/// Ciphertext cap; an envelope larger than this is rejected before any
/// allocation happens.
const MAX_CT_LEN: usize = 512 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("envelope truncated")]
    Truncated,
    #[error("unknown envelope version {0}")]
    BadVersion(u8),
    #[error("unknown message type {0}")]
    BadType(u8),
    #[error("bad field length: {0}")]
    BadLength(String),
    #[error("trailing bytes after envelope")]
    TrailingBytes,
}

/// Encode a message into its canonical byte serialization.
pub fn encode_message(msg: &WireMessage) -> Vec<u8> {
    let mut out = Vec::with_capacity(128 + msg.ciphertext.len());
    out.push(WIRE_VERSION);
    match msg.message_type {
        MessageType::Prekey => out.push(TYPE_PREKEY),
        MessageType::Normal => out.push(TYPE_NORMAL),
    }

    if let Some(pk) = &msg.prekey {
        out.extend_from_slice(&pk.registration_id.to_be_bytes());
        out.push(pk.identity_key.len() as u8);
        out.extend_from_slice(&pk.identity_key);
        out.extend_from_slice(&pk.ephemeral_key);
        out.extend_from_slice(&pk.signed_prekey_id.to_be_bytes());
        match pk.one_time_prekey_id {
            Some(id) => {
                out.push(1);
                out.extend_from_slice(&id.to_be_bytes());
            }
            None => out.push(0),
        }
    }

    out.extend_from_slice(&encode_header(&msg.header));
    out.extend_from_slice(&(msg.ciphertext.len() as u32).to_be_bytes());
    out.extend_from_slice(&msg.ciphertext);
    out
}

/// Canonical header bytes: also used as the header portion of the AEAD AAD,
/// so any header tampering breaks the tag.
pub fn encode_header(header: &RatchetHeader) -> Vec<u8> {
    let mut out = Vec::with_capacity(40);
    out.extend_from_slice(&header.dh_pub);
    out.extend_from_slice(&header.pn.to_be_bytes());
    out.extend_from_slice(&header.n.to_be_bytes());
    out
}

/// Decode a canonical envelope.
pub fn decode_message(bytes: &[u8]) -> Result<WireMessage, CodecError> {
    let mut cur = Cursor { buf: bytes, pos: 0 };

    let version = cur.take_u8()?;
    if version != WIRE_VERSION {
        return Err(CodecError::BadVersion(version));
    }
    let message_type = match cur.take_u8()? {
        TYPE_PREKEY => MessageType::Prekey,
        TYPE_NORMAL => MessageType::Normal,
        other => return Err(CodecError::BadType(other)),
    };

    let prekey = if message_type == MessageType::Prekey {
        let registration_id = cur.take_u32()?;
        let ik_len = cur.take_u8()? as usize;
        if ik_len != 33 {
            return Err(CodecError::BadLength(format!("identity key length {ik_len}")));
        }
        let identity_key = cur.take(ik_len)?.to_vec();
        let ephemeral_key: [u8; 32] = cur.take(32)?.try_into().expect("length checked");
        let signed_prekey_id = cur.take_u32()?;
        let one_time_prekey_id = match cur.take_u8()? {
            0 => None,
            1 => Some(cur.take_u32()?),
            other => return Err(CodecError::BadLength(format!("opk flag {other}"))),
        };
        Some(PrekeyHeader {
            registration_id,
            identity_key,
            ephemeral_key,
            signed_prekey_id,
            one_time_prekey_id,
        })
    } else {
        None
    };

    let dh_pub: [u8; 32] = cur.take(32)?.try_into().expect("length checked");
    let pn = cur.take_u32()?;
    let n = cur.take_u32()?;

    let ct_len = cur.take_u32()? as usize;
    if ct_len > MAX_CT_LEN {
        return Err(CodecError::BadLength(format!("ciphertext length {ct_len}")));
    }
    let ciphertext = cur.take(ct_len)?.to_vec();
    if cur.pos != bytes.len() {
        return Err(CodecError::TrailingBytes);
    }

    Ok(WireMessage {
        message_type,
        prekey,
        header: RatchetHeader { dh_pub, pn, n },
        ciphertext,
    })
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.pos + n > self.buf.len() {
            return Err(CodecError::Truncated);
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn take_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn take_u32(&mut self) -> Result<u32, CodecError> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().expect("length checked")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normal_msg() -> WireMessage {
        WireMessage {
            message_type: MessageType::Normal,
            prekey: None,
            header: RatchetHeader { dh_pub: [3u8; 32], pn: 7, n: 42 },
            ciphertext: vec![0xAB; 80],
        }
    }

    fn prekey_msg() -> WireMessage {
        let mut ik = vec![1u8]; // canonical key version byte
        ik.extend_from_slice(&[9u8; 32]);
        WireMessage {
            message_type: MessageType::Prekey,
            prekey: Some(PrekeyHeader {
                registration_id: 1234,
                identity_key: ik,
                ephemeral_key: [5u8; 32],
                signed_prekey_id: 2,
                one_time_prekey_id: Some(17),
            }),
            header: RatchetHeader { dh_pub: [5u8; 32], pn: 0, n: 0 },
            ciphertext: vec![0xCD; 48],
        }
    }

    #[test]
    fn normal_roundtrip() {
        let msg = normal_msg();
        let bytes = encode_message(&msg);
        assert_eq!(bytes[0], WIRE_VERSION);
        let back = decode_message(&bytes).unwrap();
        assert_eq!(back.message_type, MessageType::Normal);
        assert!(back.prekey.is_none());
        assert_eq!(back.header, msg.header);
        assert_eq!(back.ciphertext, msg.ciphertext);
    }

    #[test]
    fn prekey_roundtrip() {
        let msg = prekey_msg();
        let bytes = encode_message(&msg);
        let back = decode_message(&bytes).unwrap();
        let pk = back.prekey.unwrap();
        let orig = msg.prekey.unwrap();
        assert_eq!(pk, orig);
        assert_eq!(back.header, msg.header);
    }

    #[test]
    fn prekey_roundtrip_without_opk() {
        let mut msg = prekey_msg();
        msg.prekey.as_mut().unwrap().one_time_prekey_id = None;
        let back = decode_message(&encode_message(&msg)).unwrap();
        assert_eq!(back.prekey.unwrap().one_time_prekey_id, None);
    }

    #[test]
    fn rejects_unknown_version() {
        let mut bytes = encode_message(&normal_msg());
        bytes[0] = 9;
        assert!(matches!(decode_message(&bytes), Err(CodecError::BadVersion(9))));
    }

    #[test]
    fn rejects_truncation_and_trailing() {
        let bytes = encode_message(&normal_msg());
        assert!(matches!(decode_message(&bytes[..bytes.len() - 1]), Err(CodecError::Truncated)));
        let mut long = bytes.clone();
        long.push(0);
        assert!(matches!(decode_message(&long), Err(CodecError::TrailingBytes)));
    }

    #[test]
    fn header_aad_bytes_are_stable() {
        let header = RatchetHeader { dh_pub: [1u8; 32], pn: 1, n: 2 };
        let mut expected = vec![1u8; 32];
        expected.extend_from_slice(&1u32.to_be_bytes());
        expected.extend_from_slice(&2u32.to_be_bytes());
        assert_eq!(encode_header(&header), expected);
    }
}
