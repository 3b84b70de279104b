pub mod chunks;
pub mod constants;
pub mod framer;
pub mod merkle;
pub mod spawn_utils;
pub mod swarm_id;

pub use chunks::{ChunkId, ChunkRange};
pub use swarm_id::SwarmId;
