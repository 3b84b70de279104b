use std::collections::BTreeSet;

/// Chunk identifier. Assigned by the content source starting at 0.
pub type ChunkId = u32;

/// Inclusive range of chunk ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkRange {
    pub start: ChunkId,
    pub end: ChunkId,
}

impl ChunkRange {
    pub fn new(start: ChunkId, end: ChunkId) -> Self {
        debug_assert!(start <= end);
        Self { start, end }
    }

    pub fn single(id: ChunkId) -> Self {
        Self { start: id, end: id }
    }

    /// Number of ids covered; never zero, ranges are inclusive.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> u64 {
        self.end as u64 - self.start as u64 + 1
    }

    pub fn contains(&self, id: ChunkId) -> bool {
        self.start <= id && id <= self.end
    }

    pub fn iter(&self) -> impl Iterator<Item = ChunkId> + use<> {
        self.start..=self.end
    }
}

impl std::fmt::Display for ChunkRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

/// Compress a sorted sequence of distinct chunk ids into maximal runs of
/// consecutive ids.
pub fn ranges_from_sorted(ids: impl IntoIterator<Item = ChunkId>) -> Vec<ChunkRange> {
    let mut out = Vec::new();
    let mut cur: Option<ChunkRange> = None;
    for id in ids {
        match cur {
            None => cur = Some(ChunkRange::single(id)),
            Some(ref mut r) if id == r.end + 1 => r.end = id,
            Some(r) => {
                out.push(r);
                cur = Some(ChunkRange::single(id));
            }
        }
    }
    if let Some(r) = cur {
        out.push(r);
    }
    out
}

/// Widest interval of `have` that covers `[start, end]`, extending both ends
/// as long as the neighbouring id is present. Ref [RFC7574] §4.3.2.
///
/// The caller guarantees `[start, end] ⊆ have`.
pub fn ack_range(have: &BTreeSet<ChunkId>, start: ChunkId, end: ChunkId) -> ChunkRange {
    debug_assert!(start <= end);
    let mut min_chunk = start;
    let mut max_chunk = end;
    while min_chunk > 0 && have.contains(&(min_chunk - 1)) {
        min_chunk -= 1;
    }
    while max_chunk < ChunkId::MAX && have.contains(&(max_chunk + 1)) {
        max_chunk += 1;
    }
    ChunkRange::new(min_chunk, max_chunk)
}
