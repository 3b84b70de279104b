//! Per-peer send schedulers: pick the next requested chunk and emit DATA,
//! gated by LEDBAT on datagram transports.
//!
//! Four variants share one loop surface: static content over a reliable
//! stream, VOD/live over a reliable stream (discarded chunks are dropped
//! from the request set), LEDBAT-gated datagram, and the VOD/live datagram
//! combination of the two.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use bytes::Bytes;
use ledbat::DenyReason;
use peer_protocol::{begin_packet, Data, Message, DATA_HEADER_LEN};
use ppspp_core::chunks::{ChunkId, ChunkRange};
use tokio::sync::Notify;
use tracing::{debug, info, trace};

use super::Swarm;
use crate::peer::{InFlightChunk, Peer, STALL_CHECKS};
use crate::storage::{ChunkState, ChunkStorage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SendStrategy {
    StaticReliable,
    VodReliable,
    LedbatDatagram,
    VodDatagram,
}

impl SendStrategy {
    pub fn select(reliable: bool, live_or_vod: bool) -> Self {
        match (reliable, live_or_vod) {
            (true, false) => SendStrategy::StaticReliable,
            (true, true) => SendStrategy::VodReliable,
            (false, false) => SendStrategy::LedbatDatagram,
            (false, true) => SendStrategy::VodDatagram,
        }
    }

    fn drops_discarded(&self) -> bool {
        matches!(self, SendStrategy::VodReliable | SendStrategy::VodDatagram)
    }

    fn ledbat_gated(&self) -> bool {
        matches!(self, SendStrategy::LedbatDatagram | SendStrategy::VodDatagram)
    }
}

pub(crate) enum SendTick {
    /// Sent something; go again immediately.
    Again,
    /// Nothing to do or gated; recheck after the delay (or on wake).
    Wait(Duration),
    /// Peer is gone.
    Exit,
}

/// Delay when back-pressure throttles the transport.
const THROTTLE_DELAY: Duration = Duration::from_millis(500);
/// Recheck delay when the congestion controller refuses.
const GATED_DELAY: Duration = Duration::from_millis(10);
/// Recheck delay when a datagram peer has nothing requested.
const DATAGRAM_IDLE_DELAY: Duration = Duration::from_millis(100);
/// Recheck delay when a static stream peer has nothing requested.
const STREAM_IDLE_DELAY: Duration = Duration::from_secs(1);
/// Recheck delay for VOD/live stream peers between sends.
const VOD_IDLE_DELAY: Duration = Duration::from_millis(10);

pub(crate) async fn task_send_scheduler(
    swarm: Arc<Swarm>,
    channel: u32,
    wake: Arc<Notify>,
) -> anyhow::Result<()> {
    loop {
        match swarm.send_tick(channel) {
            SendTick::Again => tokio::task::yield_now().await,
            SendTick::Wait(delay) => {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = wake.notified() => {}
                }
            }
            SendTick::Exit => return Ok(()),
        }
    }
}

impl Swarm {
    /// One scheduler step for the peer on `channel`.
    pub(crate) fn send_tick(&self, channel: u32) -> SendTick {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let Some(peer) = inner.peers.get_mut(&channel) else {
            return SendTick::Exit;
        };
        if !peer.state.is_initialized() {
            return SendTick::Wait(STREAM_IDLE_DELAY);
        }
        if peer.transport.is_throttled() {
            return SendTick::Wait(THROTTLE_DELAY);
        }

        let strategy = SendStrategy::select(
            peer.transport.is_reliable(),
            self.opts.live || self.opts.vod,
        );

        if strategy.ledbat_gated() {
            self.check_datagram_stall(&mut inner.chunks, inner.storage.as_mut(), peer);
        }

        // Chunks we hold, the peer asked for, and we have not yet sent.
        let candidate = peer
            .set_requested
            .iter()
            .copied()
            .find(|id| inner.chunks.set_have.contains(id) && !peer.set_sent.contains(id));

        let Some(chunk_id) = candidate else {
            let delay = match strategy {
                SendStrategy::StaticReliable => STREAM_IDLE_DELAY,
                SendStrategy::VodReliable => VOD_IDLE_DELAY,
                _ => DATAGRAM_IDLE_DELAY,
            };
            return SendTick::Wait(delay);
        };

        let chunk = match inner.storage.get_chunk(chunk_id, strategy.drops_discarded()) {
            Ok(Some(chunk)) => chunk,
            Ok(None) => {
                // Fell out of the discard window since it was requested.
                if strategy.drops_discarded() {
                    peer.set_requested.remove(&chunk_id);
                    return SendTick::Again;
                }
                debug!(chunk_id, "requested chunk not available");
                peer.set_requested.remove(&chunk_id);
                return SendTick::Again;
            }
            Err(e) => {
                debug!(chunk_id, "error reading chunk: {e:#}");
                return SendTick::Wait(STREAM_IDLE_DELAY);
            }
        };

        if strategy.ledbat_gated() {
            let wire_len = (self.opts.chunk_size as usize + DATA_HEADER_LEN) as u64;
            match peer.ledbat.try_send(wire_len) {
                Ok(()) => {}
                Err(DenyReason::Cwnd) | Err(DenyReason::Cto) => {
                    // CTO recovery is driven by the controller state itself.
                    return SendTick::Wait(GATED_DELAY);
                }
            }
        }

        let packet = build_data_packet(peer.remote_channel, chunk_id, &chunk);
        let sent = peer.transport.send(packet);
        self.account_tx(sent);
        peer.stats.data_tx_bytes += sent as u64;
        peer.set_sent.insert(chunk_id);
        if strategy.ledbat_gated() {
            peer.in_flight.insert(
                chunk_id,
                InFlightChunk {
                    sent_at: Instant::now(),
                    resent: false,
                },
            );
        }
        trace!(chunk_id, "sent data");
        SendTick::Again
    }

    /// Resend everything in flight when the backlog has been stuck across
    /// many scheduler ticks with no ACK progress.
    fn check_datagram_stall(
        &self,
        chunks: &mut ChunkState,
        storage: &mut dyn ChunkStorage,
        peer: &mut Peer,
    ) {
        let outstanding = peer.set_requested.len();
        if outstanding == 0 {
            return;
        }
        if outstanding == peer.stall_backlog {
            peer.stall_checks += 1;
        } else {
            peer.stall_backlog = outstanding;
            peer.stall_checks = 0;
        }
        if peer.stall_checks <= STALL_CHECKS {
            return;
        }

        let stalled = match peer.ledbat.last_ack_received() {
            // Never got a single ACK: the first packets are stuck.
            None => true,
            Some(last_ack) => last_ack.elapsed().as_secs_f64() > peer.ledbat.rtt() * 10.0,
        };
        if stalled {
            info!(in_flight = peer.in_flight.len(), "resending all in-flight packets");
            resend_in_flight(self, chunks, storage, peer, None);
            peer.stall_checks = 0;
        }
    }
}

/// Retransmit in-flight chunks (all, or only those older than `up_to`),
/// marking them resent so their RTT samples are excluded later.
pub(crate) fn resend_in_flight(
    swarm: &Swarm,
    _chunks: &mut ChunkState,
    storage: &mut dyn ChunkStorage,
    peer: &mut Peer,
    up_to: Option<ChunkId>,
) {
    let ids: Vec<ChunkId> = match up_to {
        Some(limit) => peer.in_flight.range(..limit).map(|(id, _)| *id).collect(),
        None => peer.in_flight.keys().copied().collect(),
    };
    let now = Instant::now();
    for id in ids {
        let Ok(Some(chunk)) = storage.get_chunk(id, true) else {
            peer.in_flight.remove(&id);
            continue;
        };
        let packet = build_data_packet(peer.remote_channel, id, &chunk);
        let sent = peer.transport.send(packet);
        swarm.account_tx(sent);
        peer.stats.data_tx_bytes += sent as u64;
        if let Some(inf) = peer.in_flight.get_mut(&id) {
            inf.sent_at = now;
            inf.resent = true;
        }
    }
}

pub(crate) fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or_default()
}

fn build_data_packet(remote_channel: u32, chunk_id: ChunkId, chunk: &[u8]) -> Bytes {
    let mut packet = begin_packet(remote_channel);
    Message::Data(Data {
        range: ChunkRange::single(chunk_id),
        timestamp_us: now_micros(),
        payload: chunk,
    })
    .serialize(&mut packet);
    packet.into()
}
