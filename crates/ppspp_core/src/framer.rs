//! Length-prefixed framing.
//!
//! Two users: the stream transports (tracker connection and TCP peer links),
//! which frame whole packets, and the live content pipeline, which reassembles
//! application frames out of a sequence of chunk payloads.

use byteorder::{BE, ByteOrder};
use bytes::{Bytes, BytesMut};

use crate::chunks::{ChunkId, ChunkRange};

/// Reassembles big-endian u32 length-prefixed frames from an arbitrary split
/// of the byte stream. Partial data is kept buffered until completed.
#[derive(Default)]
pub struct StreamFramer {
    buf: BytesMut,
    pending_len: Option<usize>,
}

impl StreamFramer {
    pub fn new() -> Self {
        Default::default()
    }

    /// Feed bytes in; get every frame completed by them out, in order.
    pub fn data_received(&mut self, data: &[u8]) -> Vec<Bytes> {
        self.buf.extend_from_slice(data);
        let mut out = Vec::new();
        loop {
            if self.pending_len.is_none() {
                if self.buf.len() < 4 {
                    break;
                }
                let len = BE::read_u32(&self.buf[..4]) as usize;
                let _ = self.buf.split_to(4);
                self.pending_len = Some(len);
            }
            let len = self.pending_len.unwrap();
            if self.buf.len() < len {
                break;
            }
            out.push(self.buf.split_to(len).freeze());
            self.pending_len = None;
        }
        out
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

/// Prepend the frame header used by [`StreamFramer`].
pub fn frame_packet(data: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(4 + data.len());
    let mut len = [0u8; 4];
    BE::write_u32(&mut len, data.len() as u32);
    out.extend_from_slice(&len);
    out.extend_from_slice(data);
    out.freeze()
}

/// Reassembles application frames from chunk payloads using the same length
/// prefix, and tracks which chunk ids contributed to the frame currently
/// being assembled.
///
/// The content source pads every frame to a whole number of chunks, so once a
/// frame completes, any trailing bytes of the current chunk are discarded.
#[derive(Default)]
pub struct ContentFramer {
    buf: BytesMut,
    pending_len: Option<usize>,
    range: Option<ChunkRange>,
    reset_range_on_data: bool,
}

impl ContentFramer {
    pub fn new() -> Self {
        Default::default()
    }

    /// Feed one chunk payload in; out come the frames it completed, each with
    /// the chunk range that produced it.
    pub fn data_received(&mut self, payload: &[u8], chunk_id: ChunkId) -> Vec<(Bytes, ChunkRange)> {
        self.buf.extend_from_slice(payload);

        if self.reset_range_on_data {
            self.range = None;
            self.reset_range_on_data = false;
        }
        match &mut self.range {
            None => self.range = Some(ChunkRange::single(chunk_id)),
            Some(r) => r.end = chunk_id,
        }

        let mut out = Vec::new();
        loop {
            if self.pending_len.is_none() {
                if self.buf.len() < 4 {
                    break;
                }
                let len = BE::read_u32(&self.buf[..4]) as usize;
                let _ = self.buf.split_to(4);
                self.pending_len = Some(len);
            }
            let len = self.pending_len.unwrap();
            if self.buf.len() < len {
                break;
            }
            let frame = self.buf.split_to(len).freeze();
            // Frames are chunk-padded: drop the padding.
            self.buf.clear();
            self.pending_len = None;
            self.reset_range_on_data = true;
            let range = self.range.unwrap_or(ChunkRange::single(chunk_id));
            out.push((frame, range));
        }
        out
    }

    /// Drop any partially assembled frame. Used when the consumer skips
    /// forward in the live stream.
    pub fn clear(&mut self) {
        self.buf.clear();
        self.pending_len = None;
        self.range = None;
        self.reset_range_on_data = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_FRAMES: &[u8] = &[
        0x00, 0x00, 0x00, 0x03, 0x41, 0x42, 0x43, 0x00, 0x00, 0x00, 0x02, 0x44, 0x45,
    ];

    #[test]
    fn test_two_frames_single_push() {
        let mut framer = StreamFramer::new();
        let frames = framer.data_received(TWO_FRAMES);
        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[0][..], &[0x41, 0x42, 0x43]);
        assert_eq!(&frames[1][..], &[0x44, 0x45]);
        assert_eq!(framer.buffered(), 0);
    }

    #[test]
    fn test_frames_invariant_under_splits() {
        // Every split point of the input must produce the same two frames.
        for split in 0..=TWO_FRAMES.len() {
            let mut framer = StreamFramer::new();
            let mut frames = framer.data_received(&TWO_FRAMES[..split]);
            frames.extend(framer.data_received(&TWO_FRAMES[split..]));
            assert_eq!(frames.len(), 2, "split at {split}");
            assert_eq!(&frames[0][..], &[0x41, 0x42, 0x43]);
            assert_eq!(&frames[1][..], &[0x44, 0x45]);
        }
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut framer = StreamFramer::new();
        let mut frames = Vec::new();
        for b in TWO_FRAMES {
            frames.extend(framer.data_received(std::slice::from_ref(b)));
        }
        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[1][..], &[0x44, 0x45]);
    }

    #[test]
    fn test_round_trip_with_frame_packet() {
        let mut framer = StreamFramer::new();
        let mut input = Vec::new();
        input.extend_from_slice(&frame_packet(b"hello"));
        input.extend_from_slice(&frame_packet(b""));
        input.extend_from_slice(&frame_packet(b"world"));
        let frames = framer.data_received(&input);
        assert_eq!(frames.len(), 3);
        assert_eq!(&frames[0][..], b"hello");
        assert_eq!(&frames[1][..], b"");
        assert_eq!(&frames[2][..], b"world");
    }

    #[test]
    fn test_content_framer_tracks_chunk_range() {
        // A 5-byte frame split over three 4-byte chunk payloads, zero padded.
        let mut framer = ContentFramer::new();
        assert!(framer.data_received(&[0, 0, 0, 5], 7).is_empty());
        assert!(framer.data_received(&[1, 2, 3, 4], 8).is_empty());
        let done = framer.data_received(&[5, 0, 0, 0], 9);
        assert_eq!(done.len(), 1);
        assert_eq!(&done[0].0[..], &[1, 2, 3, 4, 5]);
        assert_eq!(done[0].1, ChunkRange::new(7, 9));
    }

    #[test]
    fn test_content_framer_discards_padding_and_resets_range() {
        let mut framer = ContentFramer::new();
        // Frame of 2 bytes inside a 8-byte padded chunk.
        let done = framer.data_received(&[0, 0, 0, 2, 0xaa, 0xbb, 0, 0], 3);
        assert_eq!(done.len(), 1);
        assert_eq!(&done[0].0[..], &[0xaa, 0xbb]);
        assert_eq!(done[0].1, ChunkRange::new(3, 3));

        // Next frame starts fresh: padding from chunk 3 must be gone and the
        // range must restart at the next chunk.
        let done = framer.data_received(&[0, 0, 0, 1, 0xcc, 0, 0, 0], 4);
        assert_eq!(done.len(), 1);
        assert_eq!(&done[0].0[..], &[0xcc]);
        assert_eq!(done[0].1, ChunkRange::new(4, 4));
    }
}
