use peer_protocol::MessageDeserializeError;

use crate::storage::StorageError;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("swarm is full")]
    SwarmFull,

    #[error("member {0} is already present")]
    DuplicateMember(std::net::SocketAddr),

    #[error("unsupported chunk addressing method {0}")]
    UnsupportedChunkAddressing(u8),

    #[error("unsupported chunk size {0}")]
    UnsupportedChunkSize(u32),

    #[error(transparent)]
    Deserialize(#[from] MessageDeserializeError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("tracker unreachable: {0:#}")]
    TrackerUnreachable(#[source] anyhow::Error),

    #[error("transport closed")]
    TransportClosed,

    #[error("no peer on channel {0}")]
    UnknownChannel(u32),

    #[error("swarm is shutting down")]
    SwarmClosed,

    #[error(transparent)]
    Anyhow(anyhow::Error),
}

pub type Result<T> = core::result::Result<T, Error>;
