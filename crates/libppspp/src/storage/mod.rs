//! Chunk storage backends.
//!
//! All backends speak [`ChunkStorage`] and mutate the swarm's [`ChunkState`]
//! (have/missing sets and their compressed range form) so the swarm has a
//! single source of truth for possession, regardless of where the bytes live.

pub mod file;
pub mod memory;

use std::collections::BTreeSet;

use bytes::Bytes;
use ppspp_core::chunks::{self, ChunkId, ChunkRange};
use ppspp_core::merkle::MerkleError;

pub use file::{FileInit, FileStorage};
pub use memory::{pack_frame_discard_eligible, InjectResult, MemoryStorage};

#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Merkle(#[from] MerkleError),
    #[error("cannot save received data on the live source")]
    SaveOnLiveSource,
    #[error("storage is closed")]
    Closed,
}

/// Possession state of one swarm.
#[derive(Default)]
pub struct ChunkState {
    /// Chunk ids we hold.
    pub set_have: BTreeSet<ChunkId>,
    /// Chunk ids known to exist but not yet received. Always empty on the
    /// live source.
    pub set_missing: BTreeSet<ChunkId>,
    /// Compressed range form of `set_have`. Rebuilt lazily by storage
    /// backends; always exactly covers `set_have` after a rebuild.
    pub have_ranges: Vec<ChunkRange>,
    /// Highest chunk id evicted by the live discard window, if any.
    /// Ids at or below this are refused everywhere.
    pub last_discarded_id: Option<ChunkId>,
}

impl ChunkState {
    pub fn rebuild_have_ranges(&mut self) {
        self.have_ranges = chunks::ranges_from_sorted(self.set_have.iter().copied());
    }

    /// Widest interval of `set_have` covering `range`. Ref [RFC7574] §4.3.2.
    pub fn ack_range(&self, range: ChunkRange) -> ChunkRange {
        chunks::ack_range(&self.set_have, range.start, range.end)
    }

    pub fn is_discarded(&self, id: ChunkId) -> bool {
        self.last_discarded_id.is_some_and(|d| id <= d)
    }
}

/// What a save did, so the swarm can decide whether to rebroadcast HAVEs.
#[derive(Debug, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved { rebroadcast_have: bool },
    Duplicate,
}

pub trait ChunkStorage: Send {
    /// Fetch chunk bytes. `Ok(None)` means the chunk is missing or was
    /// discarded; with `allow_missing` that is expected and not logged.
    fn get_chunk(&mut self, id: ChunkId, allow_missing: bool) -> Result<Option<Bytes>, StorageError>;

    /// Persist a received chunk and update the possession state.
    fn save_chunk(
        &mut self,
        state: &mut ChunkState,
        id: ChunkId,
        data: &[u8],
    ) -> Result<SaveOutcome, StorageError>;

    /// Called once the missing set drains (static/VOD downloads).
    fn post_complete(&mut self, state: &mut ChunkState) -> Result<(), StorageError>;

    /// Source-side injection of freshly packed chunks. Only the memory
    /// backend in source mode accepts this.
    fn inject_chunks(
        &mut self,
        _state: &mut ChunkState,
        _packs: Vec<Bytes>,
    ) -> Result<Option<InjectResult>, StorageError> {
        Ok(None)
    }

    fn close(&mut self);

    /// Timing details for the shutdown report; only the file backend has any.
    fn file_report(&self) -> Option<file::FileStorageReport> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_have_ranges_cover_have_set() {
        let mut state = ChunkState::default();
        for id in [0u32, 1, 2, 10, 11, 40] {
            state.set_have.insert(id);
        }
        state.rebuild_have_ranges();
        assert_eq!(
            state.have_ranges,
            vec![
                ChunkRange::new(0, 2),
                ChunkRange::new(10, 11),
                ChunkRange::new(40, 40)
            ]
        );
        let covered: BTreeSet<ChunkId> =
            state.have_ranges.iter().flat_map(|r| r.iter()).collect();
        assert_eq!(covered, state.set_have);
    }

    #[test]
    fn test_ack_range_covers_request() {
        let mut state = ChunkState::default();
        for id in [0u32, 1, 2, 3, 7, 8, 9, 10, 11] {
            state.set_have.insert(id);
        }
        assert_eq!(state.ack_range(ChunkRange::new(2, 3)), ChunkRange::new(0, 3));
        assert_eq!(state.ack_range(ChunkRange::new(8, 9)), ChunkRange::new(7, 11));
    }

    #[test]
    fn test_discarded_check() {
        let mut state = ChunkState::default();
        assert!(!state.is_discarded(0));
        state.last_discarded_id = Some(10);
        assert!(state.is_discarded(0));
        assert!(state.is_discarded(10));
        assert!(!state.is_discarded(11));
    }
}
