//! File-backed chunk storage for static content.
//!
//! The file holds chunks at offset `id * chunk_size`. On startup the file, if
//! present, is validated by recomputing its Merkle root hash against the
//! swarm id: a match makes this node a seed; anything else truncates and
//! re-downloads.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::time::SystemTime;

use bytes::Bytes;
use hashw::HashFunction;
use ppspp_core::chunks::ChunkId;
use ppspp_core::merkle;
use ppspp_core::SwarmId;
use tracing::{debug, info};

use super::{ChunkState, ChunkStorage, SaveOutcome, StorageError};

/// How initialization left the swarm: seeding a valid file, or downloading
/// into a fresh one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileInit {
    Seed,
    Download,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct FileStorageReport {
    pub ts_start: Option<f64>,
    pub ts_end: Option<f64>,
    pub started_as_seed: bool,
}

pub struct FileStorage {
    path: PathBuf,
    file: Option<File>,
    file_size: u64,
    chunk_size: u32,
    num_chunks: u32,
    completed: bool,
    started_as_seed: bool,
    ts_start: Option<SystemTime>,
    ts_end: Option<SystemTime>,
}

fn unix_secs(t: Option<SystemTime>) -> Option<f64> {
    t.and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
        .map(|d| d.as_secs_f64())
}

impl FileStorage {
    /// Open or create the backing file, populating `state` with either the
    /// full have-set (valid file) or the full missing-set (download).
    ///
    /// Hashing the file is CPU-bound; run initialization on a blocking
    /// worker when called from the event loop.
    pub fn new(
        path: PathBuf,
        file_size: u64,
        chunk_size: u32,
        swarm_id: &SwarmId,
        hash: HashFunction,
        state: &mut ChunkState,
    ) -> Result<(Self, FileInit), StorageError> {
        let num_chunks = file_size.div_ceil(chunk_size as u64) as u32;
        let mut storage = FileStorage {
            path,
            file: None,
            file_size,
            chunk_size,
            num_chunks,
            completed: false,
            started_as_seed: false,
            ts_start: Some(SystemTime::now()),
            ts_end: None,
        };

        let init = if storage.path.is_file() {
            info!(path = %storage.path.display(), "file found, checking integrity");
            let root = merkle::file_root_hash(&storage.path, hash, chunk_size as usize)?;
            if root == swarm_id.as_bytes() {
                storage.init_valid_file(state)?;
                FileInit::Seed
            } else {
                info!(
                    computed = %hex::encode(&root),
                    "file integrity check failed, recreating"
                );
                storage.init_new_file(state)?;
                FileInit::Download
            }
        } else {
            info!(path = %storage.path.display(), "no file found, creating empty");
            storage.init_new_file(state)?;
            FileInit::Download
        };

        Ok((storage, init))
    }

    fn init_valid_file(&mut self, state: &mut ChunkState) -> Result<(), StorageError> {
        self.file = Some(File::open(&self.path)?);
        self.completed = true;
        self.started_as_seed = true;
        for id in 0..self.num_chunks {
            state.set_have.insert(id);
        }
        state.rebuild_have_ranges();
        info!("file integrity valid, seeding");
        Ok(())
    }

    fn init_new_file(&mut self, state: &mut ChunkState) -> Result<(), StorageError> {
        self.file = Some(
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&self.path)?,
        );
        for id in 0..self.num_chunks {
            state.set_missing.insert(id);
        }
        Ok(())
    }

    fn file_mut(&mut self) -> Result<&mut File, StorageError> {
        self.file.as_mut().ok_or(StorageError::Closed)
    }

    /// Size of the chunk, accounting for a short final chunk.
    fn chunk_len(&self, id: ChunkId) -> usize {
        let start = id as u64 * self.chunk_size as u64;
        (self.file_size.saturating_sub(start)).min(self.chunk_size as u64) as usize
    }
}

impl ChunkStorage for FileStorage {
    fn get_chunk(&mut self, id: ChunkId, allow_missing: bool) -> Result<Option<Bytes>, StorageError> {
        if id >= self.num_chunks {
            if !allow_missing {
                debug!(id, "request past end of file");
            }
            return Ok(None);
        }
        let len = self.chunk_len(id);
        let offset = id as u64 * self.chunk_size as u64;
        let file = self.file_mut()?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf)?;
        Ok(Some(buf.into()))
    }

    fn save_chunk(
        &mut self,
        state: &mut ChunkState,
        id: ChunkId,
        data: &[u8],
    ) -> Result<SaveOutcome, StorageError> {
        if self.completed || state.set_have.contains(&id) {
            return Ok(SaveOutcome::Duplicate);
        }
        let offset = id as u64 * self.chunk_size as u64;
        // A padded final chunk must not grow the file past its real size.
        let len = data.len().min(self.chunk_len(id));
        let file = self.file_mut()?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&data[..len])?;
        state.set_have.insert(id);
        state.set_missing.remove(&id);
        Ok(SaveOutcome::Saved {
            rebroadcast_have: false,
        })
    }

    fn post_complete(&mut self, state: &mut ChunkState) -> Result<(), StorageError> {
        self.ts_end = Some(SystemTime::now());
        if let (Some(start), Some(end)) = (self.ts_start, self.ts_end) {
            if let Ok(elapsed) = end.duration_since(start) {
                let secs = elapsed.as_secs().max(1);
                info!(
                    elapsed_s = secs,
                    speed_bps = self.file_size / secs,
                    "download complete"
                );
            }
        }
        // Reopen read-only.
        self.file = Some(File::open(&self.path)?);
        self.completed = true;
        state.rebuild_have_ranges();
        Ok(())
    }

    fn close(&mut self) {
        self.file = None;
    }

    fn file_report(&self) -> Option<FileStorageReport> {
        Some(FileStorageReport {
            ts_start: unix_secs(self.ts_start),
            ts_end: unix_secs(self.ts_end),
            started_as_seed: self.started_as_seed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    const CHUNK: u32 = 4;

    fn swarm_id_of(data: &[u8]) -> SwarmId {
        SwarmId::new(merkle::data_root_hash(data, HashFunction::Sha1, CHUNK as usize).unwrap())
    }

    #[test]
    fn test_missing_file_starts_download() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("content.bin");
        let mut state = ChunkState::default();
        let id = SwarmId::from_str("87a5e6618b2af6f92854eb83e2664d09af7db138").unwrap();
        let (_storage, init) =
            FileStorage::new(path, 10, CHUNK, &id, HashFunction::Sha1, &mut state).unwrap();
        assert_eq!(init, FileInit::Download);
        assert!(state.set_have.is_empty());
        assert_eq!(
            state.set_missing.iter().copied().collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
    }

    #[test]
    fn test_valid_file_seeds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("content.bin");
        let data = b"0123456789";
        std::fs::write(&path, data).unwrap();

        let mut state = ChunkState::default();
        let (mut storage, init) = FileStorage::new(
            path,
            data.len() as u64,
            CHUNK,
            &swarm_id_of(data),
            HashFunction::Sha1,
            &mut state,
        )
        .unwrap();
        assert_eq!(init, FileInit::Seed);
        assert!(state.set_missing.is_empty());
        assert_eq!(state.set_have.len(), 3);
        assert_eq!(state.have_ranges, vec![ppspp_core::ChunkRange::new(0, 2)]);

        assert_eq!(&storage.get_chunk(0, false).unwrap().unwrap()[..], b"0123");
        // Short final chunk.
        assert_eq!(&storage.get_chunk(2, false).unwrap().unwrap()[..], b"89");
        assert_eq!(storage.get_chunk(3, true).unwrap(), None);
    }

    #[test]
    fn test_corrupt_file_recreated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("content.bin");
        std::fs::write(&path, b"XXXXXXXXXX").unwrap();

        let mut state = ChunkState::default();
        let (_storage, init) = FileStorage::new(
            path.clone(),
            10,
            CHUNK,
            &swarm_id_of(b"0123456789"),
            HashFunction::Sha1,
            &mut state,
        )
        .unwrap();
        assert_eq!(init, FileInit::Download);
        assert_eq!(state.set_missing.len(), 3);
        // Truncated.
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
    }

    #[test]
    fn test_download_then_complete_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("content.bin");
        let data = b"0123456789";
        let swarm_id = swarm_id_of(data);

        let mut state = ChunkState::default();
        let (mut storage, init) = FileStorage::new(
            path.clone(),
            data.len() as u64,
            CHUNK,
            &swarm_id,
            HashFunction::Sha1,
            &mut state,
        )
        .unwrap();
        assert_eq!(init, FileInit::Download);

        // Receive chunks out of order; the last one arrives chunk-padded.
        for (id, chunk) in [(2u32, &b"89\0\0"[..]), (0, b"0123"), (1, b"4567")] {
            let outcome = storage.save_chunk(&mut state, id, chunk).unwrap();
            assert!(matches!(outcome, SaveOutcome::Saved { .. }));
        }
        assert!(state.set_missing.is_empty());
        storage.post_complete(&mut state).unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), data);
        assert_eq!(
            merkle::file_root_hash(&path, HashFunction::Sha1, CHUNK as usize).unwrap(),
            swarm_id.as_bytes()
        );
        let report = storage.file_report().unwrap();
        assert!(!report.started_as_seed);
        assert!(report.ts_end.is_some());
    }

    #[test]
    fn test_duplicate_save_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("content.bin");
        let mut state = ChunkState::default();
        let id = swarm_id_of(b"0123456789");
        let (mut storage, _) =
            FileStorage::new(path, 10, CHUNK, &id, HashFunction::Sha1, &mut state).unwrap();

        assert!(matches!(
            storage.save_chunk(&mut state, 0, b"0123").unwrap(),
            SaveOutcome::Saved { .. }
        ));
        assert_eq!(
            storage.save_chunk(&mut state, 0, b"0123").unwrap(),
            SaveOutcome::Duplicate
        );
    }
}
