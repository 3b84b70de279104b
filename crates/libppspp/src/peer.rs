//! Per-peer state: handshake lifecycle, chunk maps, in-flight tracking and
//! the pending-ACK accumulator for datagram transports.

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use ledbat::LedbatController;
use peer_protocol::ParseContext;
use ppspp_core::chunks::{ChunkId, ChunkRange};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::transport::PeerTransport;

/// Contiguous run of received-but-unacked chunk ids that triggers one
/// coalesced ACK.
const ACK_RUN_LEN: u32 = 10;

/// Scheduler ticks with an unchanged backlog before in-flight data is
/// considered stuck.
pub(crate) const STALL_CHECKS: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PeerLifecycle {
    New,
    HandshakeSent,
    HandshakeReceived,
    Initialized,
    Closed,
}

impl PeerLifecycle {
    pub fn name(&self) -> &'static str {
        match self {
            PeerLifecycle::New => "new",
            PeerLifecycle::HandshakeSent => "handshake_sent",
            PeerLifecycle::HandshakeReceived => "handshake_received",
            PeerLifecycle::Initialized => "initialized",
            PeerLifecycle::Closed => "closed",
        }
    }

    pub fn is_initialized(&self) -> bool {
        matches!(self, PeerLifecycle::Initialized)
    }
}

impl std::fmt::Display for PeerLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct InFlightChunk {
    pub sent_at: Instant,
    pub resent: bool,
}

/// Byte and message counters, snapshotted into the swarm's stats map when the
/// peer dies.
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct PeerStatsSnapshot {
    pub data_tx_bytes: u64,
    pub data_rx_bytes: u64,
    pub data_msgs_rx: u64,
    pub duplicate_acks: u64,
}

pub(crate) struct Peer {
    pub num: u32,
    pub addr: SocketAddr,
    pub transport: PeerTransport,
    pub local_channel: u32,
    pub remote_channel: u32,
    pub state: PeerLifecycle,
    /// We opened this association (outbound handshake).
    pub initiator: bool,
    pub remote_uuid: Option<Uuid>,
    pub parse_ctx: ParseContext,
    pub remote_discard_window: Option<u32>,
    pub hash_type: Option<u8>,

    /// Chunks the peer advertised.
    pub set_have: BTreeSet<ChunkId>,
    /// Chunks the peer requested from us, not yet sent (or re-requested).
    pub set_requested: BTreeSet<ChunkId>,
    /// Chunks sent and awaiting ACK.
    pub set_sent: BTreeSet<ChunkId>,
    /// Chunks we requested from the peer and have not received.
    pub set_i_requested: BTreeSet<ChunkId>,

    /// Datagram transports only: what is on the wire, in send order.
    pub in_flight: BTreeMap<ChunkId, InFlightChunk>,
    /// Pending coalesced ACK: earliest and latest id of the current
    /// contiguous unacked run.
    pending_ack: Option<(ChunkId, ChunkId)>,

    pub ledbat: LedbatController,
    /// Out-of-order ACK observations since the last loss declaration.
    pub ooo_acks: u32,

    pub stats: PeerStatsSnapshot,

    /// Wakes the send scheduler out of its backoff.
    pub send_wake: Arc<Notify>,
    /// Cancels all tasks owned by this peer.
    pub cancel: CancellationToken,
    /// Cancelled separately once the handshake completes.
    pub idle_cancel: CancellationToken,

    // Stall detection for the datagram sender.
    pub stall_backlog: usize,
    pub stall_checks: u32,
}

impl Peer {
    pub fn new(
        num: u32,
        addr: SocketAddr,
        transport: PeerTransport,
        local_channel: u32,
        initiator: bool,
        swarm_cancel: &CancellationToken,
    ) -> Self {
        let cancel = swarm_cancel.child_token();
        let idle_cancel = cancel.child_token();
        Peer {
            num,
            addr,
            transport,
            local_channel,
            remote_channel: 0,
            state: PeerLifecycle::New,
            initiator,
            remote_uuid: None,
            parse_ctx: ParseContext::default(),
            remote_discard_window: None,
            hash_type: None,
            set_have: BTreeSet::new(),
            set_requested: BTreeSet::new(),
            set_sent: BTreeSet::new(),
            set_i_requested: BTreeSet::new(),
            in_flight: BTreeMap::new(),
            pending_ack: None,
            ledbat: LedbatController::new(Default::default()),
            ooo_acks: 0,
            stats: Default::default(),
            send_wake: Arc::new(Notify::new()),
            cancel,
            idle_cancel,
            stall_backlog: 0,
            stall_checks: 0,
        }
    }

    /// Fold a freshly received chunk id into the pending-ACK run. Returns a
    /// run to acknowledge when the run reaches [`ACK_RUN_LEN`] or this id
    /// broke contiguity.
    pub fn accumulate_ack(&mut self, id: ChunkId) -> Option<ChunkRange> {
        match self.pending_ack {
            None => {
                self.pending_ack = Some((id, id));
                None
            }
            Some((first, last)) if last + 1 == id => {
                if id - first + 1 >= ACK_RUN_LEN {
                    self.pending_ack = None;
                    Some(ChunkRange::new(first, id))
                } else {
                    self.pending_ack = Some((first, id));
                    None
                }
            }
            Some((first, last)) => {
                // Contiguity broke: flush the old run, start a new one.
                self.pending_ack = Some((id, id));
                Some(ChunkRange::new(first, last))
            }
        }
    }

    /// Trim the advertised have-set to the peer's own discard window after a
    /// HAVE reaching up to `max_advertised`.
    pub fn trim_have_to_discard_window(&mut self, max_advertised: ChunkId) {
        let Some(window) = self.remote_discard_window else {
            return;
        };
        let Some(cutoff) = max_advertised.checked_sub(window) else {
            return;
        };
        self.set_have = self.set_have.split_off(&(cutoff + 1));
    }

    pub fn snapshot_key(&self) -> String {
        format!("{}#{}", self.addr, self.num)
    }
}

impl std::fmt::Display for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "peer {} {} lc={} rc={} ({})",
            self.num, self.addr, self.local_channel, self.remote_channel, self.state
        )
    }
}

/// Duplicate-peer resolution: two associations to the same remote uuid, keep
/// one. Both endpoints decide from the same data — the two uuids — so they
/// keep the same association: the connection initiated by the side with the
/// greater uuid wins. The compare key is `(uuid, initiator)`.
///
/// Returns true when the existing association survives and the incoming one
/// must be destroyed.
pub(crate) fn existing_wins_duplicate(
    my_uuid: &Uuid,
    remote_uuid: &Uuid,
    existing_initiator: bool,
    incoming_initiator: bool,
) -> bool {
    let keep_initiator = my_uuid > remote_uuid;
    if existing_initiator == incoming_initiator {
        // Same direction twice: keep the established one.
        return true;
    }
    existing_initiator == keep_initiator
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> Peer {
        Peer::new(
            1,
            "127.0.0.1:6778".parse().unwrap(),
            PeerTransport::test_sink(),
            42,
            false,
            &CancellationToken::new(),
        )
    }

    #[test]
    fn test_ack_run_of_ten_flushes() {
        let mut p = peer();
        for id in 0..9 {
            assert_eq!(p.accumulate_ack(id), None, "id {id}");
        }
        assert_eq!(p.accumulate_ack(9), Some(ChunkRange::new(0, 9)));
        // Accumulator restarts empty.
        assert_eq!(p.accumulate_ack(10), None);
    }

    #[test]
    fn test_ack_flush_on_contiguity_break() {
        let mut p = peer();
        assert_eq!(p.accumulate_ack(5), None);
        assert_eq!(p.accumulate_ack(6), None);
        // 20 breaks the run: the old run is flushed, 20 starts a new one.
        assert_eq!(p.accumulate_ack(20), Some(ChunkRange::new(5, 6)));
        assert_eq!(p.accumulate_ack(21), None);
    }

    #[test]
    fn test_have_trim_to_remote_discard_window() {
        let mut p = peer();
        p.remote_discard_window = Some(10);
        for id in 0..30u32 {
            p.set_have.insert(id);
        }
        p.trim_have_to_discard_window(29);
        assert_eq!(*p.set_have.first().unwrap(), 20);
        assert_eq!(*p.set_have.last().unwrap(), 29);
    }

    #[test]
    fn test_duplicate_resolution_is_symmetric() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        // Node A (uuid a) has an initiated association (existing) and gets an
        // incoming one; node B (uuid b) has the mirror image. Exactly one
        // association must survive on both sides, and it must be the same one.
        let a_keeps_existing = existing_wins_duplicate(&a, &b, true, false);
        let b_keeps_existing = existing_wins_duplicate(&b, &a, false, true);
        // A's existing = A-initiated; B's existing = A-initiated too.
        assert_eq!(a_keeps_existing, b_keeps_existing);
    }

    #[test]
    fn test_duplicate_resolution_same_direction_keeps_established() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert!(existing_wins_duplicate(&a, &b, true, true));
        assert!(existing_wins_duplicate(&a, &b, false, false));
    }
}
