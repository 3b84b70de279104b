//! HANDSHAKE message: source channel followed by TLV options, terminated by
//! the end-of-options tag. A goodbye is a handshake whose source channel is 0
//! on the wire.

use byteorder::{BE, ByteOrder};
use uuid::Uuid;

use crate::{MessageDeserializeError, MsgIdDebug, MSGID_HANDSHAKE};
use ppspp_core::constants::{MIN_PROTOCOL_VERSION, PROTOCOL_VERSION};

const OPT_VERSION: u8 = 0;
const OPT_MIN_VERSION: u8 = 1;
const OPT_SWARM_ID: u8 = 2;
const OPT_CONTENT_INTEGRITY: u8 = 3;
const OPT_MERKLE_HASH_FUNC: u8 = 4;
const OPT_LIVE_SIGNATURE_ALG: u8 = 5;
const OPT_CHUNK_ADDRESSING: u8 = 6;
const OPT_LIVE_DISCARD_WINDOW: u8 = 7;
const OPT_SUPPORTED_MESSAGES: u8 = 8;
const OPT_CHUNK_SIZE: u8 = 9;
const OPT_PEER_UUID: u8 = 10;
const OPT_END: u8 = 255;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeMsg {
    /// The sender's channel, i.e. the channel we must address replies to.
    /// 0 on the wire means goodbye.
    pub source_channel: u32,
    pub version: u8,
    pub min_version: u8,
    pub swarm_id: Option<Vec<u8>>,
    pub content_integrity_protection: u8,
    pub merkle_hash_function: Option<u8>,
    pub live_signature_algorithm: Option<u8>,
    pub chunk_addressing_method: u8,
    pub live_discard_window: Option<u32>,
    pub supported_messages: Option<Vec<u8>>,
    pub chunk_size: u32,
    pub peer_uuid: Option<Uuid>,
    /// Set by the parser when the source channel was 0.
    pub is_goodbye: bool,
}

impl HandshakeMsg {
    /// The departure handshake: source channel 0 and version options only.
    pub fn goodbye() -> Self {
        HandshakeMsg {
            source_channel: 0,
            version: PROTOCOL_VERSION,
            min_version: MIN_PROTOCOL_VERSION,
            swarm_id: None,
            content_integrity_protection: 0,
            merkle_hash_function: None,
            live_signature_algorithm: None,
            chunk_addressing_method: 0,
            live_discard_window: None,
            supported_messages: None,
            chunk_size: 0,
            peer_uuid: None,
            is_goodbye: true,
        }
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.source_channel.to_be_bytes());
        out.extend_from_slice(&[OPT_VERSION, self.version]);
        out.extend_from_slice(&[OPT_MIN_VERSION, self.min_version]);
        if self.is_goodbye {
            out.push(OPT_END);
            return;
        }
        if let Some(swarm_id) = &self.swarm_id {
            out.push(OPT_SWARM_ID);
            out.extend_from_slice(&(swarm_id.len() as u16).to_be_bytes());
            out.extend_from_slice(swarm_id);
        }
        out.extend_from_slice(&[OPT_CONTENT_INTEGRITY, self.content_integrity_protection]);
        if self.content_integrity_protection == 1 {
            if let Some(f) = self.merkle_hash_function {
                out.extend_from_slice(&[OPT_MERKLE_HASH_FUNC, f]);
            }
        }
        if let Some(alg) = self.live_signature_algorithm {
            out.extend_from_slice(&[OPT_LIVE_SIGNATURE_ALG, alg]);
        }
        out.extend_from_slice(&[OPT_CHUNK_ADDRESSING, self.chunk_addressing_method]);
        if let Some(wnd) = self.live_discard_window {
            out.push(OPT_LIVE_DISCARD_WINDOW);
            out.extend_from_slice(&wnd.to_be_bytes());
        }
        if let Some(bitmap) = &self.supported_messages {
            out.push(OPT_SUPPORTED_MESSAGES);
            out.push(bitmap.len() as u8);
            out.extend_from_slice(bitmap);
        }
        out.push(OPT_CHUNK_SIZE);
        out.extend_from_slice(&self.chunk_size.to_be_bytes());
        if let Some(uuid) = &self.peer_uuid {
            out.push(OPT_PEER_UUID);
            out.extend_from_slice(uuid.as_bytes());
        }
        out.push(OPT_END);
    }

    /// Parse the handshake body (source channel + options); returns the
    /// message and bytes consumed.
    pub fn deserialize(buf: &[u8]) -> Result<(Self, usize), MessageDeserializeError> {
        let dbg = Some(MsgIdDebug(MSGID_HANDSHAKE));
        let need = |buf: &[u8], n: usize| -> Result<(), MessageDeserializeError> {
            if buf.len() < n {
                Err(MessageDeserializeError::NotEnoughData(n - buf.len(), dbg))
            } else {
                Ok(())
            }
        };

        need(buf, 4)?;
        let source_channel = BE::read_u32(&buf[..4]);

        let mut msg = HandshakeMsg {
            source_channel,
            version: PROTOCOL_VERSION,
            min_version: MIN_PROTOCOL_VERSION,
            swarm_id: None,
            content_integrity_protection: 0,
            merkle_hash_function: None,
            live_signature_algorithm: None,
            chunk_addressing_method: 0,
            live_discard_window: None,
            supported_messages: None,
            chunk_size: 0,
            peer_uuid: None,
            is_goodbye: source_channel == 0,
        };

        let mut idx = 4usize;
        loop {
            need(&buf[idx..], 1)?;
            let tag = buf[idx];
            idx += 1;
            match tag {
                OPT_VERSION => {
                    need(&buf[idx..], 1)?;
                    msg.version = buf[idx];
                    idx += 1;
                }
                OPT_MIN_VERSION => {
                    need(&buf[idx..], 1)?;
                    msg.min_version = buf[idx];
                    idx += 1;
                }
                OPT_SWARM_ID => {
                    need(&buf[idx..], 2)?;
                    let len = BE::read_u16(&buf[idx..idx + 2]) as usize;
                    idx += 2;
                    need(&buf[idx..], len)?;
                    msg.swarm_id = Some(buf[idx..idx + len].to_vec());
                    idx += len;
                }
                OPT_CONTENT_INTEGRITY => {
                    need(&buf[idx..], 1)?;
                    msg.content_integrity_protection = buf[idx];
                    idx += 1;
                }
                OPT_MERKLE_HASH_FUNC => {
                    need(&buf[idx..], 1)?;
                    msg.merkle_hash_function = Some(buf[idx]);
                    idx += 1;
                }
                OPT_LIVE_SIGNATURE_ALG => {
                    need(&buf[idx..], 1)?;
                    msg.live_signature_algorithm = Some(buf[idx]);
                    idx += 1;
                }
                OPT_CHUNK_ADDRESSING => {
                    need(&buf[idx..], 1)?;
                    msg.chunk_addressing_method = buf[idx];
                    idx += 1;
                }
                OPT_LIVE_DISCARD_WINDOW => {
                    need(&buf[idx..], 4)?;
                    msg.live_discard_window = Some(BE::read_u32(&buf[idx..idx + 4]));
                    idx += 4;
                }
                OPT_SUPPORTED_MESSAGES => {
                    need(&buf[idx..], 1)?;
                    let len = buf[idx] as usize;
                    idx += 1;
                    need(&buf[idx..], len)?;
                    msg.supported_messages = Some(buf[idx..idx + len].to_vec());
                    idx += len;
                }
                OPT_CHUNK_SIZE => {
                    need(&buf[idx..], 4)?;
                    msg.chunk_size = BE::read_u32(&buf[idx..idx + 4]);
                    idx += 4;
                }
                OPT_PEER_UUID => {
                    need(&buf[idx..], 16)?;
                    let mut raw = [0u8; 16];
                    raw.copy_from_slice(&buf[idx..idx + 16]);
                    msg.peer_uuid = Some(Uuid::from_bytes(raw));
                    idx += 16;
                }
                OPT_END => break,
                other => return Err(MessageDeserializeError::UnknownHandshakeOption(other)),
            }
        }

        if !msg.is_goodbye && msg.swarm_id.is_none() {
            return Err(MessageDeserializeError::MissingHandshakeOption("swarm-id"));
        }

        Ok((msg, idx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{default_handshake, Message, ParseContext};

    #[test]
    fn test_handshake_round_trip() {
        let uuid = Uuid::new_v4();
        let hs = default_handshake(0xdead_beef, b"\x01\x02\x03\x04", uuid, Some(1000));
        let mut out = Vec::new();
        Message::Handshake(hs.clone()).serialize(&mut out);

        let (msg, consumed) = Message::deserialize(&out, &ParseContext::default()).unwrap();
        assert_eq!(consumed, out.len());
        let parsed = match msg {
            Message::Handshake(h) => h,
            other => panic!("expected handshake, got {other:?}"),
        };
        assert_eq!(parsed.source_channel, 0xdead_beef);
        assert_eq!(parsed.swarm_id.as_deref(), Some(&b"\x01\x02\x03\x04"[..]));
        assert_eq!(parsed.chunk_size, 1024);
        assert_eq!(parsed.chunk_addressing_method, 2);
        assert_eq!(parsed.live_discard_window, Some(1000));
        assert_eq!(parsed.peer_uuid, Some(uuid));
        assert!(!parsed.is_goodbye);
    }

    #[test]
    fn test_goodbye_round_trip() {
        let mut out = Vec::new();
        Message::Handshake(HandshakeMsg::goodbye()).serialize(&mut out);
        let (msg, _) = Message::deserialize(&out, &ParseContext::default()).unwrap();
        match msg {
            Message::Handshake(h) => {
                assert!(h.is_goodbye);
                assert_eq!(h.source_channel, 0);
            }
            other => panic!("expected handshake, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_swarm_id_is_malformed() {
        // A non-goodbye handshake with only version options.
        let mut body = Vec::new();
        body.extend_from_slice(&42u32.to_be_bytes());
        body.extend_from_slice(&[OPT_VERSION, 1, OPT_MIN_VERSION, 1, OPT_END]);
        assert!(matches!(
            HandshakeMsg::deserialize(&body),
            Err(MessageDeserializeError::MissingHandshakeOption("swarm-id"))
        ));
    }

    #[test]
    fn test_truncated_option_is_malformed() {
        let uuid = Uuid::new_v4();
        let hs = default_handshake(7, b"\xaa\xbb", uuid, None);
        let mut out = Vec::new();
        hs.serialize(&mut out);
        for cut in 0..out.len() {
            assert!(
                matches!(
                    HandshakeMsg::deserialize(&out[..cut]),
                    Err(MessageDeserializeError::NotEnoughData(..))
                ),
                "cut at {cut}"
            );
        }
    }

    #[test]
    fn test_unknown_option_rejected() {
        let mut body = Vec::new();
        body.extend_from_slice(&42u32.to_be_bytes());
        body.extend_from_slice(&[0x42]);
        assert!(matches!(
            HandshakeMsg::deserialize(&body),
            Err(MessageDeserializeError::UnknownHandshakeOption(0x42))
        ));
    }
}
