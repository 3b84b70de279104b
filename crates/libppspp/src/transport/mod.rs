//! Peer-facing transports: raw datagrams (UDP) and length-prefix framed
//! streams (TCP). A peer holds one [`PeerTransport`]; sends never block the
//! caller.

pub(crate) mod tcp;
pub(crate) mod udp;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

/// Outbound write backlog above which the send scheduler throttles.
const STREAM_HIGH_WATER: usize = 256 * 1024;

#[derive(Clone)]
pub(crate) enum PeerTransport {
    Datagram {
        socket: Arc<UdpSocket>,
        addr: SocketAddr,
    },
    Stream(Arc<StreamConn>),
}

impl PeerTransport {
    /// Stream transports deliver reliably and in order; datagrams need
    /// LEDBAT, ACKs and retransmission on top.
    pub fn is_reliable(&self) -> bool {
        matches!(self, PeerTransport::Stream(_))
    }

    /// Back-pressure signal from the stream writer.
    pub fn is_throttled(&self) -> bool {
        match self {
            PeerTransport::Datagram { .. } => false,
            PeerTransport::Stream(conn) => conn.throttled.load(Ordering::Relaxed),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        match self {
            PeerTransport::Datagram { addr, .. } => *addr,
            PeerTransport::Stream(conn) => conn.peer_addr,
        }
    }

    /// Fire-and-forget send of one packet; returns the bytes handed to the
    /// transport (0 when it could not take the packet).
    pub fn send(&self, packet: Bytes) -> usize {
        match self {
            PeerTransport::Datagram { socket, addr } => {
                // Losing a datagram here is the same as losing it on the
                // wire; the LEDBAT path recovers.
                match socket.try_send_to(&packet, *addr) {
                    Ok(n) => n,
                    Err(e) => {
                        debug!(%addr, "datagram send failed: {e:#}");
                        0
                    }
                }
            }
            PeerTransport::Stream(conn) => conn.send(packet),
        }
    }

    pub fn stream_conn_id(&self) -> Option<u64> {
        match self {
            PeerTransport::Datagram { .. } => None,
            PeerTransport::Stream(conn) => Some(conn.conn_id),
        }
    }

    #[cfg(test)]
    pub(crate) fn test_sink() -> Self {
        let (conn, _rx) = StreamConn::new_for_test();
        PeerTransport::Stream(conn)
    }
}

/// One TCP connection, shared by every peer multiplexed over it. Writes are
/// queued to a writer task; the queued byte count models the socket's
/// high-water mark.
pub(crate) struct StreamConn {
    pub conn_id: u64,
    pub peer_addr: SocketAddr,
    tx: UnboundedSender<Bytes>,
    pub(crate) queued_bytes: Arc<AtomicUsize>,
    pub(crate) throttled: AtomicBool,
}

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

impl StreamConn {
    pub fn new(peer_addr: SocketAddr, tx: UnboundedSender<Bytes>) -> Arc<Self> {
        Arc::new(StreamConn {
            conn_id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            peer_addr,
            tx,
            queued_bytes: Arc::new(AtomicUsize::new(0)),
            throttled: AtomicBool::new(false),
        })
    }

    /// Queue a packet for the writer; framing happens there.
    fn send(&self, packet: Bytes) -> usize {
        let len = packet.len();
        if self.tx.send(packet).is_err() {
            return 0;
        }
        let queued = self.queued_bytes.fetch_add(len, Ordering::Relaxed) + len;
        if queued > STREAM_HIGH_WATER {
            self.throttled.store(true, Ordering::Relaxed);
        }
        len
    }

    #[cfg(test)]
    pub(crate) fn new_for_test() -> (
        Arc<Self>,
        tokio::sync::mpsc::UnboundedReceiver<Bytes>,
    ) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (Self::new("127.0.0.1:0".parse().unwrap(), tx), rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_throttles_above_high_water() {
        let (conn, mut rx) = StreamConn::new_for_test();
        let transport = PeerTransport::Stream(conn.clone());
        assert!(transport.is_reliable());
        assert!(!transport.is_throttled());

        let packet = Bytes::from(vec![0u8; 64 * 1024]);
        for _ in 0..5 {
            assert_eq!(transport.send(packet.clone()), packet.len());
        }
        assert!(transport.is_throttled());

        // Drain like the writer task does.
        while let Ok(p) = rx.try_recv() {
            let left = conn
                .queued_bytes
                .fetch_sub(p.len(), Ordering::Relaxed)
                - p.len();
            if left <= tcp::STREAM_LOW_WATER {
                conn.throttled.store(false, Ordering::Relaxed);
            }
        }
        assert!(!transport.is_throttled());
    }
}
