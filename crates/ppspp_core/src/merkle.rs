//! Merkle root hash over chunked content, used as the swarm identifier for
//! static files.
//!
//! The tree has a leaf layer whose width is the populated leaf count rounded
//! up to the next power of two. Unpopulated leaves carry a "null hash"
//! sentinel. When combining, a real hash paired with the sentinel is hashed
//! against a run of zero bytes of digest length, and two sentinels reduce to
//! the sentinel.

use std::io::Read;
use std::path::Path;

use hashw::HashFunction;

#[derive(thiserror::Error, Debug)]
pub enum MerkleError {
    #[error("cannot compute root hash of empty input")]
    EmptyInput,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// None is the null-hash sentinel.
type Node = Option<Vec<u8>>;

fn combine(hash: HashFunction, left: &Node, right: &Node) -> Node {
    match (left, right) {
        (Some(l), Some(r)) => {
            let mut h = hash.hasher();
            h.update(l);
            h.update(r);
            Some(h.finish())
        }
        (Some(l), None) => {
            let mut h = hash.hasher();
            h.update(l);
            h.update(&vec![0u8; hash.digest_len()]);
            Some(h.finish())
        }
        (None, _) => None,
    }
}

fn reduce_to_root(hash: HashFunction, mut layer: Vec<Node>) -> Result<Vec<u8>, MerkleError> {
    debug_assert!(layer.len().is_power_of_two());
    while layer.len() > 1 {
        let mut next = Vec::with_capacity(layer.len() / 2);
        for pair in layer.chunks_exact(2) {
            next.push(combine(hash, &pair[0], &pair[1]));
        }
        layer = next;
    }
    layer.pop().flatten().ok_or(MerkleError::EmptyInput)
}

fn leaf_layer_from_hashes(leaves: Vec<Vec<u8>>) -> Result<Vec<Node>, MerkleError> {
    if leaves.is_empty() {
        return Err(MerkleError::EmptyInput);
    }
    let width = leaves.len().next_power_of_two();
    let mut layer: Vec<Node> = leaves.into_iter().map(Some).collect();
    layer.resize(width, None);
    Ok(layer)
}

/// Root hash of an in-memory byte string split into `chunk_size` chunks.
pub fn data_root_hash(
    data: &[u8],
    hash: HashFunction,
    chunk_size: usize,
) -> Result<Vec<u8>, MerkleError> {
    if data.is_empty() {
        return Err(MerkleError::EmptyInput);
    }
    let leaves = data.chunks(chunk_size).map(|c| hash.digest(c)).collect();
    reduce_to_root(hash, leaf_layer_from_hashes(leaves)?)
}

/// Root hash of a file, streaming `chunk_size` bytes at a time.
///
/// CPU-bound on large files; callers on an async runtime should run it on a
/// blocking worker.
pub fn file_root_hash(
    path: &Path,
    hash: HashFunction,
    chunk_size: usize,
) -> Result<Vec<u8>, MerkleError> {
    let mut file = std::fs::File::open(path)?;
    let mut leaves = Vec::new();
    let mut buf = vec![0u8; chunk_size];
    loop {
        let mut filled = 0;
        while filled < chunk_size {
            let n = file.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            break;
        }
        leaves.push(hash.digest(&buf[..filled]));
        if filled < chunk_size {
            break;
        }
    }
    reduce_to_root(hash, leaf_layer_from_hashes(leaves)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_input_is_an_error() {
        assert!(matches!(
            data_root_hash(b"", HashFunction::Sha1, 4),
            Err(MerkleError::EmptyInput)
        ));
    }

    #[test]
    fn test_single_chunk_root_is_combined_with_padding() {
        // One populated leaf, width 1: the root is the chunk hash itself.
        let root = data_root_hash(b"abc", HashFunction::Sha1, 4).unwrap();
        assert_eq!(root, HashFunction::Sha1.digest(b"abc"));
    }

    #[test]
    fn test_odd_leaves_deterministic_root() {
        // 10 bytes, chunk size 4: three populated leaves out of a width-4 layer.
        let hash = HashFunction::Sha1;
        let input = b"0123456789";
        let root = data_root_hash(input, hash, 4).unwrap();
        assert_eq!(root.len(), 20);

        // Recompute by hand following the combine rules.
        let l0 = hash.digest(b"0123");
        let l1 = hash.digest(b"4567");
        let l2 = hash.digest(b"89");
        let n01 = {
            let mut h = hash.hasher();
            h.update(&l0);
            h.update(&l1);
            h.finish()
        };
        let n23 = {
            let mut h = hash.hasher();
            h.update(&l2);
            h.update(&[0u8; 20]);
            h.finish()
        };
        let expected = {
            let mut h = hash.hasher();
            h.update(&n01);
            h.update(&n23);
            h.finish()
        };
        assert_eq!(root, expected);
    }

    #[test]
    fn test_file_and_data_roots_match() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"0123456789").unwrap();
        tmp.flush().unwrap();

        let from_file = file_root_hash(tmp.path(), HashFunction::Sha1, 4).unwrap();
        let from_data = data_root_hash(b"0123456789", HashFunction::Sha1, 4).unwrap();
        assert_eq!(from_file, from_data);
    }

    #[test]
    fn test_larger_file_round_trip() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&data).unwrap();
        tmp.flush().unwrap();

        let from_file = file_root_hash(tmp.path(), HashFunction::Sha1, 1024).unwrap();
        let from_data = data_root_hash(&data, HashFunction::Sha1, 1024).unwrap();
        assert_eq!(from_file, from_data);
    }

    #[test]
    fn test_chunk_boundary_changes_root() {
        let a = data_root_hash(b"01234567", HashFunction::Sha1, 4).unwrap();
        let b = data_root_hash(b"01234567", HashFunction::Sha1, 8).unwrap();
        assert_ne!(a, b);
    }
}
