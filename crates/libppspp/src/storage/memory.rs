//! Memory-backed chunk storage for live streams and VOD.
//!
//! The source injects packed frames and never saves received data; relays
//! save received chunks and evict history past the discard window so a
//! long-running stream stays bounded.

use std::collections::BTreeMap;

use bytes::{BufMut, Bytes, BytesMut};
use ppspp_core::chunks::{ChunkId, ChunkRange};
use tracing::{debug, info};

use super::{ChunkState, ChunkStorage, SaveOutcome, StorageError};

/// Chunks accepted between HAVE-range rebuilds and rebroadcasts.
const HAVE_REBUILD_EVERY: u64 = 100;

/// Split an application frame into discard-eligible-marked chunks: 4 bytes of
/// big-endian frame length, then the frame, chopped into `chunk_size - 1`
/// byte payloads (the last zero-padded), each prefixed with a marker byte.
/// The marker is 0 on the first chunk of the frame and 1 on every other, so
/// late joiners can spot frame boundaries.
pub fn pack_frame_discard_eligible(frame: &[u8], chunk_size: usize) -> Vec<Bytes> {
    let payload_len = chunk_size - 1;
    let mut message = BytesMut::with_capacity(4 + frame.len());
    message.put_u32(frame.len() as u32);
    message.extend_from_slice(frame);

    let mut packs = Vec::with_capacity(message.len().div_ceil(payload_len));
    for (i, piece) in message.chunks(payload_len).enumerate() {
        let mut pack = BytesMut::with_capacity(chunk_size);
        pack.put_u8(if i == 0 { 0 } else { 1 });
        pack.extend_from_slice(piece);
        pack.resize(chunk_size, 0);
        packs.push(pack.freeze());
    }
    packs
}

pub struct InjectResult {
    /// Ids the injected chunks were assigned.
    pub range: ChunkRange,
    /// True when the 100-chunk boundary was crossed and HAVEs should go out.
    pub rebroadcast_have: bool,
}

pub struct MemoryStorage {
    chunks: BTreeMap<ChunkId, Bytes>,
    is_source: bool,
    discard_window: Option<u32>,
    /// Next id to assign on the source. Ids start at 0.
    next_inject_id: ChunkId,
    num_received: u64,
    num_unique_received: u64,
    injected_since_broadcast: u64,
    closed: bool,
}

impl MemoryStorage {
    pub fn new(is_source: bool, discard_window: Option<u32>) -> Self {
        MemoryStorage {
            chunks: BTreeMap::new(),
            is_source,
            discard_window,
            next_inject_id: 0,
            num_received: 0,
            num_unique_received: 0,
            injected_since_broadcast: 0,
            closed: false,
        }
    }

    /// Number of the last id handed out by the source.
    pub fn last_inject_id(&self) -> Option<ChunkId> {
        self.next_inject_id.checked_sub(1)
    }

    /// Source side: store freshly packed chunks under sequential ids.
    fn inject_impl(
        &mut self,
        state: &mut ChunkState,
        packs: Vec<Bytes>,
    ) -> Result<InjectResult, StorageError> {
        if self.closed {
            return Err(StorageError::Closed);
        }
        debug_assert!(self.is_source);
        debug_assert!(!packs.is_empty());

        let first = self.next_inject_id;
        for pack in packs {
            let id = self.next_inject_id;
            self.next_inject_id += 1;
            self.chunks.insert(id, pack);
            state.set_have.insert(id);
            self.injected_since_broadcast += 1;
        }
        let last = self.next_inject_id - 1;

        self.evict_discarded(state);
        self.rebuild_have_ranges_source(state);

        let rebroadcast_have = self.injected_since_broadcast >= HAVE_REBUILD_EVERY;
        if rebroadcast_have {
            self.injected_since_broadcast = 0;
        }
        Ok(InjectResult {
            range: ChunkRange::new(first, last),
            rebroadcast_have,
        })
    }

    /// The source's have-set is always one contiguous run, so its range list
    /// is built without walking the chunk map.
    fn rebuild_have_ranges_source(&self, state: &mut ChunkState) {
        let Some(last) = self.last_inject_id() else {
            return;
        };
        let first = state.last_discarded_id.map_or(0, |d| d + 1);
        state.have_ranges.clear();
        state.have_ranges.push(ChunkRange::new(first, last));
    }

    fn evict_discarded(&mut self, state: &mut ChunkState) {
        let Some(window) = self.discard_window else {
            return;
        };
        let (Some(&min_have), Some(&max_have)) =
            (state.set_have.first(), state.set_have.last())
        else {
            return;
        };
        let span = max_have as u64 - min_have as u64 + 1;
        if span <= window as u64 {
            return;
        }
        let cutoff = max_have - window + 1;
        state.set_have = state.set_have.split_off(&(cutoff + 1));
        state.set_missing = state.set_missing.split_off(&(cutoff + 1));
        self.chunks = self.chunks.split_off(&(cutoff + 1));
        state.last_discarded_id = Some(cutoff);
        debug!(cutoff, "discard window eviction");
    }
}

impl ChunkStorage for MemoryStorage {
    fn get_chunk(&mut self, id: ChunkId, allow_missing: bool) -> Result<Option<Bytes>, StorageError> {
        if self.closed {
            return Err(StorageError::Closed);
        }
        let chunk = self.chunks.get(&id).cloned();
        if chunk.is_none() && !allow_missing {
            info!(id, "received request for missing chunk");
        }
        Ok(chunk)
    }

    fn save_chunk(
        &mut self,
        state: &mut ChunkState,
        id: ChunkId,
        data: &[u8],
    ) -> Result<SaveOutcome, StorageError> {
        if self.closed {
            return Err(StorageError::Closed);
        }
        if self.is_source {
            return Err(StorageError::SaveOnLiveSource);
        }

        self.num_received += 1;
        if self.chunks.contains_key(&id) {
            debug!(id, "duplicate chunk");
            return Ok(SaveOutcome::Duplicate);
        }
        self.num_unique_received += 1;
        self.chunks.insert(id, Bytes::copy_from_slice(data));
        state.set_missing.remove(&id);
        state.set_have.insert(id);
        self.evict_discarded(state);

        let rebroadcast_have = self.num_unique_received % HAVE_REBUILD_EVERY == 0;
        if rebroadcast_have {
            state.rebuild_have_ranges();
        }
        Ok(SaveOutcome::Saved { rebroadcast_have })
    }

    fn post_complete(&mut self, state: &mut ChunkState) -> Result<(), StorageError> {
        state.rebuild_have_ranges();
        Ok(())
    }

    fn inject_chunks(
        &mut self,
        state: &mut ChunkState,
        packs: Vec<Bytes>,
    ) -> Result<Option<InjectResult>, StorageError> {
        self.inject_impl(state, packs).map(Some)
    }

    fn close(&mut self) {
        self.chunks.clear();
        self.closed = true;
    }
}
