// PPSPP peer wire protocol [RFC7574]: parsing, serialization etc.
//
// A packet is a 32-bit big-endian destination channel followed by a sequence
// of messages, each prefixed with a one-byte type code. Channel 0 addresses
// first-contact handshakes. A datagram carrying only the channel id is a
// keepalive.

use byteorder::{BE, ByteOrder};
use ppspp_core::chunks::ChunkRange;
use ppspp_core::constants::{
    CHUNK_ADDRESSING_32BIT_INDEX, CHUNK_SIZE, MIN_PROTOCOL_VERSION, PROTOCOL_VERSION,
    SUPPORTED_MESSAGES,
};
use uuid::Uuid;

pub mod handshake;

pub use handshake::HandshakeMsg;

type MsgId = u8;

pub const MSGID_HANDSHAKE: MsgId = 0;
pub const MSGID_DATA: MsgId = 1;
pub const MSGID_ACK: MsgId = 2;
pub const MSGID_HAVE: MsgId = 3;
pub const MSGID_INTEGRITY: MsgId = 4;
pub const MSGID_REQUEST: MsgId = 8;

/// Channel id bytes at the head of every packet.
pub const CHANNEL_LEN: usize = 4;

/// Per-chunk overhead of a DATA message on the wire: type code, two chunk
/// ids and the send timestamp.
pub const DATA_HEADER_LEN: usize = 1 + 4 + 4 + 8;

#[derive(Clone, Copy)]
pub struct MsgIdDebug(pub(crate) MsgId);

impl MsgIdDebug {
    const fn name(&self) -> Option<&'static str> {
        let n = match self.0 {
            MSGID_HANDSHAKE => "handshake",
            MSGID_DATA => "data",
            MSGID_ACK => "ack",
            MSGID_HAVE => "have",
            MSGID_INTEGRITY => "integrity",
            MSGID_REQUEST => "request",
            _ => return None,
        };
        Some(n)
    }
}

impl core::fmt::Debug for MsgIdDebug {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "<unknown msg_id {}>", self.0),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum MessageDeserializeError {
    #[error("not enough data (msgid={1:?}): expected at least {0} more bytes")]
    NotEnoughData(usize, Option<MsgIdDebug>),
    #[error("unsupported message id {0}")]
    UnsupportedMessageId(u8),
    #[error("unknown handshake option {0}")]
    UnknownHandshakeOption(u8),
    #[error("handshake missing mandatory option: {0}")]
    MissingHandshakeOption(&'static str),
    #[error("invalid chunk range: start {start} > end {end} (msgid={msg_id:?})")]
    InvalidChunkRange {
        start: u32,
        end: u32,
        msg_id: MsgIdDebug,
    },
}

/// Per-peer parameters the codec needs to size variable-length fields.
#[derive(Debug, Clone, Copy)]
pub struct ParseContext {
    pub chunk_size: u32,
    pub hash_len: usize,
}

impl Default for ParseContext {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            // SHA-1 in the default configuration.
            hash_len: 20,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Data<'a> {
    pub range: ChunkRange,
    /// Microseconds since the Unix epoch at the sender, used for one-way
    /// delay sampling.
    pub timestamp_us: u64,
    pub payload: &'a [u8],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub range: ChunkRange,
    pub one_way_delay_us: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Integrity<'a> {
    pub range: ChunkRange,
    pub hash: &'a [u8],
}

#[derive(Debug)]
pub enum Message<'a> {
    Handshake(HandshakeMsg),
    Data(Data<'a>),
    Ack(Ack),
    Have(ChunkRange),
    Integrity(Integrity<'a>),
    Request(ChunkRange),
}

fn read_u32(buf: &[u8], msg_id: Option<MsgIdDebug>) -> Result<(u32, &[u8]), MessageDeserializeError> {
    if buf.len() < 4 {
        return Err(MessageDeserializeError::NotEnoughData(4 - buf.len(), msg_id));
    }
    Ok((BE::read_u32(&buf[..4]), &buf[4..]))
}

fn read_u64(buf: &[u8], msg_id: MsgIdDebug) -> Result<(u64, &[u8]), MessageDeserializeError> {
    if buf.len() < 8 {
        return Err(MessageDeserializeError::NotEnoughData(
            8 - buf.len(),
            Some(msg_id),
        ));
    }
    Ok((BE::read_u64(&buf[..8]), &buf[8..]))
}

fn read_range(buf: &[u8], msg_id: MsgIdDebug) -> Result<(ChunkRange, &[u8]), MessageDeserializeError> {
    let (start, buf) = read_u32(buf, Some(msg_id))?;
    let (end, buf) = read_u32(buf, Some(msg_id))?;
    if start > end {
        return Err(MessageDeserializeError::InvalidChunkRange { start, end, msg_id });
    }
    Ok((ChunkRange::new(start, end), buf))
}

/// Split the destination channel off the head of a packet.
pub fn read_channel(packet: &[u8]) -> Result<(u32, &[u8]), MessageDeserializeError> {
    read_u32(packet, None)
}

/// Start a packet destined to `channel`; messages are serialized after it.
pub fn begin_packet(channel: u32) -> Vec<u8> {
    channel.to_be_bytes().to_vec()
}

impl<'a> Message<'a> {
    /// Deserialize one message (including its type code); returns the message
    /// and the number of bytes consumed.
    pub fn deserialize(
        buf: &'a [u8],
        ctx: &ParseContext,
    ) -> Result<(Message<'a>, usize), MessageDeserializeError> {
        let msg_id = *buf
            .first()
            .ok_or(MessageDeserializeError::NotEnoughData(1, None))?;
        let body = &buf[1..];
        let dbg = MsgIdDebug(msg_id);
        match msg_id {
            MSGID_HANDSHAKE => {
                let (hs, consumed) = HandshakeMsg::deserialize(body)?;
                Ok((Message::Handshake(hs), 1 + consumed))
            }
            MSGID_DATA => {
                let (range, rest) = read_range(body, dbg)?;
                let (timestamp_us, rest) = read_u64(rest, dbg)?;
                // The final chunk of a static file may be short, so accept a
                // payload shorter than the full range length.
                let expected = (range.len() as usize).saturating_mul(ctx.chunk_size as usize);
                let take = expected.min(rest.len());
                if take == 0 {
                    return Err(MessageDeserializeError::NotEnoughData(1, Some(dbg)));
                }
                let payload = &rest[..take];
                Ok((
                    Message::Data(Data {
                        range,
                        timestamp_us,
                        payload,
                    }),
                    1 + 16 + take,
                ))
            }
            MSGID_ACK => {
                let (range, rest) = read_range(body, dbg)?;
                let (one_way_delay_us, _) = read_u64(rest, dbg)?;
                Ok((
                    Message::Ack(Ack {
                        range,
                        one_way_delay_us,
                    }),
                    1 + 16,
                ))
            }
            MSGID_HAVE => {
                let (range, _) = read_range(body, dbg)?;
                Ok((Message::Have(range), 1 + 8))
            }
            MSGID_INTEGRITY => {
                let (range, rest) = read_range(body, dbg)?;
                if rest.len() < ctx.hash_len {
                    return Err(MessageDeserializeError::NotEnoughData(
                        ctx.hash_len - rest.len(),
                        Some(dbg),
                    ));
                }
                Ok((
                    Message::Integrity(Integrity {
                        range,
                        hash: &rest[..ctx.hash_len],
                    }),
                    1 + 8 + ctx.hash_len,
                ))
            }
            MSGID_REQUEST => {
                let (range, _) = read_range(body, dbg)?;
                Ok((Message::Request(range), 1 + 8))
            }
            other => Err(MessageDeserializeError::UnsupportedMessageId(other)),
        }
    }

    /// Append the serialized message (with its type code) to `out`.
    pub fn serialize(&self, out: &mut Vec<u8>) {
        match self {
            Message::Handshake(hs) => {
                out.push(MSGID_HANDSHAKE);
                hs.serialize(out);
            }
            Message::Data(d) => {
                out.push(MSGID_DATA);
                out.extend_from_slice(&d.range.start.to_be_bytes());
                out.extend_from_slice(&d.range.end.to_be_bytes());
                out.extend_from_slice(&d.timestamp_us.to_be_bytes());
                out.extend_from_slice(d.payload);
            }
            Message::Ack(a) => {
                out.push(MSGID_ACK);
                out.extend_from_slice(&a.range.start.to_be_bytes());
                out.extend_from_slice(&a.range.end.to_be_bytes());
                out.extend_from_slice(&a.one_way_delay_us.to_be_bytes());
            }
            Message::Have(r) => {
                out.push(MSGID_HAVE);
                out.extend_from_slice(&r.start.to_be_bytes());
                out.extend_from_slice(&r.end.to_be_bytes());
            }
            Message::Integrity(i) => {
                out.push(MSGID_INTEGRITY);
                out.extend_from_slice(&i.range.start.to_be_bytes());
                out.extend_from_slice(&i.range.end.to_be_bytes());
                out.extend_from_slice(i.hash);
            }
            Message::Request(r) => {
                out.push(MSGID_REQUEST);
                out.extend_from_slice(&r.start.to_be_bytes());
                out.extend_from_slice(&r.end.to_be_bytes());
            }
        }
    }
}

/// Iterator over the messages of one packet body (the bytes after the
/// channel id). Yields an error item and then stops on malformed input.
pub struct MessageIter<'a> {
    rest: &'a [u8],
    ctx: ParseContext,
    failed: bool,
}

impl<'a> MessageIter<'a> {
    pub fn new(body: &'a [u8], ctx: ParseContext) -> Self {
        Self {
            rest: body,
            ctx,
            failed: false,
        }
    }
}

impl<'a> Iterator for MessageIter<'a> {
    type Item = Result<Message<'a>, MessageDeserializeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.rest.is_empty() {
            return None;
        }
        match Message::deserialize(self.rest, &self.ctx) {
            Ok((msg, consumed)) => {
                self.rest = &self.rest[consumed..];
                Some(Ok(msg))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

/// Default handshake options announced by this client.
pub fn default_handshake(
    source_channel: u32,
    swarm_id: &[u8],
    peer_uuid: Uuid,
    live_discard_window: Option<u32>,
) -> HandshakeMsg {
    HandshakeMsg {
        source_channel,
        version: PROTOCOL_VERSION,
        min_version: MIN_PROTOCOL_VERSION,
        swarm_id: Some(swarm_id.to_vec()),
        content_integrity_protection: 1,
        merkle_hash_function: Some(0),
        live_signature_algorithm: None,
        chunk_addressing_method: CHUNK_ADDRESSING_32BIT_INDEX,
        live_discard_window,
        supported_messages: Some(SUPPORTED_MESSAGES.to_vec()),
        chunk_size: CHUNK_SIZE,
        peer_uuid: Some(peer_uuid),
        is_goodbye: false,
    }
}
