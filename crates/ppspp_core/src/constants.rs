/// Fixed chunk size. The only size the client negotiates.
pub const CHUNK_SIZE: u32 = 1024;

pub const PROTOCOL_VERSION: u8 = 1;
pub const MIN_PROTOCOL_VERSION: u8 = 1;

/// Chunk addressing method: 32-bit chunk index.
pub const CHUNK_ADDRESSING_32BIT_INDEX: u8 = 2;

/// Supported-messages bitmap advertised in handshakes, MSB-first:
/// HANDSHAKE, DATA, ACK, HAVE, INTEGRITY in the first byte, REQUEST in the
/// second.
pub const SUPPORTED_MESSAGES: [u8; 2] = [0b1111_1000, 0b1000_0000];

pub const DEFAULT_PEER_PORT: u16 = 6778;
pub const DEFAULT_TRACKER_PORT: u16 = 6777;
