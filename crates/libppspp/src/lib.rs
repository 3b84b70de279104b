//! libppspp is the engine of a Peer-to-Peer Streaming Peer Protocol
//! [RFC7574] client: swarms of peers cooperatively distributing static
//! files, live streams and VOD content in fixed-size chunks, verified by a
//! Merkle root hash and congestion-controlled with LEDBAT [RFC6817] on
//! datagram transports.

pub mod alto;
pub mod consumer;
mod error;
pub mod hive;
mod peer;
pub mod storage;
pub mod swarm;
mod transport;

#[cfg(test)]
mod tests;

pub use error::{Error, Result};
pub use hive::{Hive, HiveOptions, TransportMode};
pub use peer::PeerStatsSnapshot;
pub use swarm::{RequestPolicy, Swarm, SwarmOptions, SwarmShutdownReport};
