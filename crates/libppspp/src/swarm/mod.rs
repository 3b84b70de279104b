//! One content distribution session: the peers, the possession state, the
//! storage backend and the schedulers that drive the chunk exchange.
//!
//! All swarm state lives behind one lock. Tasks (chunk selection, per-peer
//! send schedulers, idle timeouts, periodic stats) take the lock, mutate and
//! release; sends never block. Every task hangs off the swarm's cancellation
//! token, so shutdown is one cancel plus goodbye handshakes.

pub(crate) mod scheduler;
pub(crate) mod sender;
pub mod stats;

use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};

use anyhow::Context;
use hashw::HashFunction;
use parking_lot::Mutex;
use peer_protocol::{
    begin_packet, default_handshake, Ack, Data, HandshakeMsg, Message, MessageIter, ParseContext,
    DATA_HEADER_LEN,
};
use ppspp_core::chunks::{ChunkId, ChunkRange};
use ppspp_core::constants::{CHUNK_ADDRESSING_32BIT_INDEX, CHUNK_SIZE};
use ppspp_core::spawn_utils::spawn_with_cancel;
use ppspp_core::SwarmId;
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, info, trace, warn};
use tracker_comms::TrackerEvent;
use uuid::Uuid;

use crate::consumer::{ConsumerOptions, ContentConsumer};
use crate::error::{Error, Result};
use crate::hive::Hive;
use crate::peer::{existing_wins_duplicate, Peer, PeerLifecycle, PeerStatsSnapshot};
use crate::storage::{
    ChunkState, ChunkStorage, FileInit, FileStorage, MemoryStorage, SaveOutcome,
};
use crate::transport::PeerTransport;

pub use scheduler::RequestPolicy;
pub use stats::SwarmShutdownReport;

/// Uninitialized peers are destroyed this long after creation.
const IDLE_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub struct SwarmOptions {
    pub swarm_id: SwarmId,
    pub live: bool,
    pub live_source: bool,
    pub vod: bool,
    /// Static content: backing file and its expected size.
    pub filename: Option<PathBuf>,
    pub file_size: u64,
    pub discard_window: Option<u32>,
    pub download_forward_window: Option<u32>,
    pub max_peers: Option<usize>,
    /// Force a selection policy; None derives it from the swarm flags.
    pub request_policy: Option<RequestPolicy>,
    pub hash_function: HashFunction,
    pub chunk_size: u32,
    pub video_buffer_frames: usize,
    pub allow_tune_in: bool,
    pub skip_on_stall: bool,
    pub selection_interval: Duration,
    pub stats_interval: Duration,
    pub alto: Option<crate::alto::AltoOptions>,
}

impl SwarmOptions {
    pub fn new(swarm_id: SwarmId) -> Self {
        SwarmOptions {
            swarm_id,
            live: false,
            live_source: false,
            vod: false,
            filename: None,
            file_size: 0,
            discard_window: None,
            download_forward_window: None,
            max_peers: None,
            request_policy: None,
            hash_function: HashFunction::Sha1,
            chunk_size: CHUNK_SIZE,
            video_buffer_frames: 500,
            allow_tune_in: false,
            skip_on_stall: false,
            selection_interval: Duration::from_secs(1),
            stats_interval: Duration::from_secs(3),
            alto: None,
        }
    }
}

pub(crate) struct SwarmInner {
    pub chunks: ChunkState,
    pub storage: Box<dyn ChunkStorage>,
    /// Peers keyed by our local channel id.
    pub peers: HashMap<u32, Peer>,
    /// Everything ever requested and not yet received; cleared on fully
    /// empty selection ticks so dead peers' requests can be reissued.
    pub requested_pool: BTreeSet<ChunkId>,
    /// INTEGRITY payloads by chunk range.
    pub integrity: HashMap<(ChunkId, ChunkId), Vec<u8>>,
    pub consumer: Option<ContentConsumer>,
    /// Stats of departed peers, keyed by address and peer number.
    pub member_stats: HashMap<String, PeerStatsSnapshot>,
    pub known_peers: HashSet<SocketAddr>,
    /// Cost-ordered endpoints from ALTO, freshest last fetch.
    pub alto_order: Option<Vec<SocketAddr>>,
    pub data_chunks_rx: u64,
    pub discarded_rx: u64,
    pub next_peer_num: u32,
    pub interval: stats::IntervalStats,
}

pub struct Swarm {
    pub id: SwarmId,
    pub(crate) uuid: Uuid,
    pub(crate) opts: SwarmOptions,
    pub(crate) hive: Weak<Hive>,
    pub(crate) span: tracing::Span,
    pub(crate) cancel: CancellationToken,
    pub(crate) inner: Mutex<SwarmInner>,
    all_data_tx: AtomicU64,
    all_data_rx: AtomicU64,
    closed: AtomicBool,
    start_time: SystemTime,
}

impl Swarm {
    pub(crate) async fn new(hive: &Arc<Hive>, opts: SwarmOptions) -> anyhow::Result<Arc<Self>> {
        let span = debug_span!("swarm", id = %opts.swarm_id);
        let cancel = hive.cancel.child_token();

        let mut state = ChunkState::default();
        let mut consumer = None;
        let mut needs_selection = false;

        let storage: Box<dyn ChunkStorage> = if opts.live || opts.vod {
            let storage = MemoryStorage::new(opts.live_source, opts.discard_window);
            if !opts.live_source {
                let mut c = ContentConsumer::new(ConsumerOptions {
                    buffer_frames: opts.video_buffer_frames,
                    allow_tune_in: opts.allow_tune_in && opts.live,
                    skip_on_stall: opts.skip_on_stall,
                    ..Default::default()
                });
                c.start();
                consumer = Some(c);
                needs_selection = true;
            }
            Box::new(storage)
        } else {
            let filename = opts
                .filename
                .clone()
                .context("static swarm requires a filename")?;
            let (file_size, chunk_size) = (opts.file_size, opts.chunk_size);
            let (swarm_id, hash) = (opts.swarm_id.clone(), opts.hash_function);
            // Hashing the file is CPU-bound, keep it off the event loop.
            let (storage, init, state_built) = tokio::task::spawn_blocking(move || {
                let mut state = ChunkState::default();
                let (storage, init) = FileStorage::new(
                    filename, file_size, chunk_size, &swarm_id, hash, &mut state,
                )?;
                Ok::<_, crate::storage::StorageError>((storage, init, state))
            })
            .await??;
            state = state_built;
            needs_selection = init == FileInit::Download;
            Box::new(storage)
        };

        let swarm = Arc::new(Swarm {
            id: opts.swarm_id.clone(),
            uuid: Uuid::new_v4(),
            hive: Arc::downgrade(hive),
            span,
            cancel,
            inner: Mutex::new(SwarmInner {
                chunks: state,
                storage,
                peers: HashMap::new(),
                requested_pool: BTreeSet::new(),
                integrity: HashMap::new(),
                consumer,
                member_stats: HashMap::new(),
                known_peers: HashSet::new(),
                alto_order: None,
                data_chunks_rx: 0,
                discarded_rx: 0,
                next_peer_num: 1,
                interval: Default::default(),
            }),
            all_data_tx: AtomicU64::new(0),
            all_data_rx: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            start_time: SystemTime::now(),
            opts,
        });

        if needs_selection {
            swarm.spawn_chunk_selection();
        }
        spawn_with_cancel(
            debug_span!(parent: swarm.span.clone(), "periodic_stats"),
            swarm.cancel.clone(),
            task_periodic_stats(swarm.clone()),
        );
        if let Some(alto) = swarm.opts.alto.clone() {
            spawn_with_cancel(
                debug_span!(parent: swarm.span.clone(), "alto_refresh"),
                swarm.cancel.clone(),
                crate::alto::task_alto_refresh(swarm.clone(), alto),
            );
        }

        info!(id = %swarm.id, live = swarm.opts.live, source = swarm.opts.live_source, "created swarm");
        Ok(swarm)
    }

    fn spawn_chunk_selection(self: &Arc<Self>) {
        spawn_with_cancel(
            debug_span!(parent: self.span.clone(), "chunk_selection"),
            self.cancel.clone(),
            scheduler::task_chunk_selection(self.clone()),
        );
    }

    pub(crate) fn account_tx(&self, bytes: usize) {
        self.all_data_tx.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn account_rx(&self, bytes: usize) {
        self.all_data_rx.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Ask the swarm to establish contact with a peer at `addr` over the
    /// hive's transport.
    pub fn add_peer(self: &Arc<Self>, addr: SocketAddr) {
        self.connect_to_peer(addr)
    }

    /// Admit a member and, when we are the initiator, open the handshake.
    pub(crate) fn add_member(
        self: &Arc<Self>,
        addr: SocketAddr,
        transport: PeerTransport,
        initiator: bool,
    ) -> Result<u32> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(Error::SwarmClosed);
        }
        let hive = self.hive.upgrade().ok_or(Error::SwarmClosed)?;
        let mut inner = self.inner.lock();

        if let Some(max) = self.opts.max_peers {
            if inner.peers.len() >= max {
                info!(%addr, "swarm full, refusing member");
                return Err(Error::SwarmFull);
            }
        }
        if inner.peers.values().any(|p| p.addr == addr) {
            debug!(%addr, "member already present");
            return Err(Error::DuplicateMember(addr));
        }

        let local_channel = hive.alloc_channel();
        let num = inner.next_peer_num;
        inner.next_peer_num += 1;

        let mut peer = Peer::new(num, addr, transport, local_channel, initiator, &self.cancel);
        peer.parse_ctx = ParseContext {
            chunk_size: self.opts.chunk_size,
            hash_len: self.opts.hash_function.digest_len(),
        };
        info!(%addr, num, local_channel, initiator, "adding member");

        // Uninitialized peers are reaped after the idle timeout.
        spawn_with_cancel(
            debug_span!(parent: self.span.clone(), "idle_timeout", peer = num),
            peer.idle_cancel.clone(),
            task_idle_timeout(self.clone(), local_channel),
        );

        if initiator {
            self.start_handshake(&inner.chunks, &mut peer);
        }
        inner.peers.insert(local_channel, peer);
        drop(inner);

        hive.register_channel(local_channel, self);
        Ok(local_channel)
    }

    /// Outbound initial handshake: destination channel 0, our channel and
    /// swarm parameters, plus piggybacked HAVEs.
    fn start_handshake(&self, chunks: &ChunkState, peer: &mut Peer) {
        let mut packet = begin_packet(0);
        let mut hs = default_handshake(
            peer.local_channel,
            self.id.as_bytes(),
            self.uuid,
            self.opts.discard_window,
        );
        hs.merkle_hash_function = Some(self.opts.hash_function.to_wire());
        Message::Handshake(hs).serialize(&mut packet);
        for range in &chunks.have_ranges {
            Message::Have(*range).serialize(&mut packet);
        }
        let sent = peer.transport.send(packet.into());
        self.account_tx(sent);
        peer.state = PeerLifecycle::HandshakeSent;
        info!(
            addr = %peer.addr,
            local_channel = peer.local_channel,
            "sent handshake"
        );
    }

    fn send_reply_handshake(&self, chunks: &ChunkState, peer: &mut Peer) {
        let mut packet = begin_packet(peer.remote_channel);
        let mut hs = default_handshake(
            peer.local_channel,
            self.id.as_bytes(),
            self.uuid,
            self.opts.discard_window,
        );
        hs.merkle_hash_function = Some(self.opts.hash_function.to_wire());
        Message::Handshake(hs).serialize(&mut packet);
        for range in &chunks.have_ranges {
            Message::Have(*range).serialize(&mut packet);
        }
        let sent = peer.transport.send(packet.into());
        self.account_tx(sent);
        info!(
            addr = %peer.addr,
            local_channel = peer.local_channel,
            remote_channel = peer.remote_channel,
            "replied with handshake"
        );
    }

    /// Entry point for packets addressed to one of our channels.
    pub(crate) fn handle_packet(self: &Arc<Self>, channel: u32, body: &[u8]) {
        self.account_rx(body.len() + peer_protocol::CHANNEL_LEN);
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let Some(peer) = inner.peers.get(&channel) else {
            warn!(channel, "got data for unknown channel");
            return;
        };
        let ctx = peer.parse_ctx;

        let mut messages = Vec::new();
        for msg in MessageIter::new(body, ctx) {
            match msg {
                Ok(msg) => messages.push(msg),
                Err(e) => {
                    // Malformed mid-stream: drop the peer without a goodbye.
                    warn!(channel, "malformed message from peer: {e:#}");
                    self.destroy_peer(inner, channel, false);
                    return;
                }
            }
        }

        for msg in messages {
            let alive = match msg {
                Message::Handshake(hs) => self.on_handshake(inner, channel, hs),
                Message::Have(range) => self.on_have(inner, channel, range),
                Message::Data(data) => self.on_data(inner, channel, data),
                Message::Ack(ack) => self.on_ack(inner, channel, ack),
                Message::Request(range) => self.on_request(inner, channel, range),
                Message::Integrity(integrity) => {
                    inner
                        .integrity
                        .insert((integrity.range.start, integrity.range.end), integrity.hash.to_vec());
                    true
                }
            };
            if !alive {
                return;
            }
        }
    }

    /// First-contact packet (destination channel 0) routed here by the hive.
    pub(crate) fn handle_first_contact(
        self: &Arc<Self>,
        transport: PeerTransport,
        addr: SocketAddr,
        body: &[u8],
    ) {
        self.account_rx(body.len() + peer_protocol::CHANNEL_LEN);
        let channel = match self.add_member(addr, transport, false) {
            Ok(channel) => channel,
            Err(e) => {
                info!(%addr, "refusing first contact: {e:#}");
                return;
            }
        };

        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let ctx = match inner.peers.get(&channel) {
            Some(p) => p.parse_ctx,
            None => return,
        };
        let mut messages = Vec::new();
        for msg in MessageIter::new(body, ctx) {
            match msg {
                Ok(msg) => messages.push(msg),
                Err(e) => {
                    warn!(%addr, "malformed first contact: {e:#}");
                    self.destroy_peer(inner, channel, false);
                    return;
                }
            }
        }
        for msg in messages {
            let alive = match msg {
                Message::Handshake(hs) => self.on_handshake(inner, channel, hs),
                Message::Have(range) => self.on_have(inner, channel, range),
                Message::Request(range) => self.on_request(inner, channel, range),
                other => {
                    debug!(%addr, "ignoring {other:?} in first contact");
                    true
                }
            };
            if !alive {
                return;
            }
        }
    }

    fn on_handshake(
        self: &Arc<Self>,
        inner: &mut SwarmInner,
        channel: u32,
        hs: HandshakeMsg,
    ) -> bool {
        let Some(peer) = inner.peers.get_mut(&channel) else {
            return false;
        };

        if hs.is_goodbye {
            info!(peer = peer.num, "received goodbye handshake");
            self.destroy_peer(inner, channel, false);
            return false;
        }
        if peer.state.is_initialized() {
            info!(peer = peer.num, "non-goodbye handshake on initialized channel");
            return true;
        }

        // We only speak 32-bit chunk indexes over 1024-byte chunks.
        if hs.chunk_addressing_method != CHUNK_ADDRESSING_32BIT_INDEX {
            warn!(
                method = hs.chunk_addressing_method,
                "unsupported chunk addressing method, dropping peer"
            );
            self.destroy_peer(inner, channel, false);
            return false;
        }
        if hs.chunk_size != self.opts.chunk_size {
            warn!(chunk_size = hs.chunk_size, "unsupported chunk size, dropping peer");
            self.destroy_peer(inner, channel, false);
            return false;
        }

        peer.remote_channel = hs.source_channel;
        peer.hash_type = hs.merkle_hash_function;
        if let Some(t) = hs.merkle_hash_function {
            if let Some(f) = HashFunction::from_wire(t) {
                peer.parse_ctx.hash_len = f.digest_len();
            }
        }
        peer.remote_discard_window = hs.live_discard_window;
        peer.remote_uuid = hs.peer_uuid;
        let this_initiator = peer.initiator;

        // Crossed connections: two associations to the same identity, keep
        // exactly one, the same one on both ends.
        if let Some(uuid) = hs.peer_uuid {
            let existing = inner
                .peers
                .iter()
                .find(|(ch, p)| **ch != channel && p.remote_uuid == Some(uuid))
                .map(|(ch, p)| (*ch, p.initiator));
            if let Some((other_channel, other_initiator)) = existing {
                if existing_wins_duplicate(&self.uuid, &uuid, other_initiator, this_initiator) {
                    info!(channel, "duplicate peer, destroying the new association");
                    self.destroy_peer(inner, channel, true);
                    return false;
                }
                info!(other_channel, "duplicate peer, destroying the old association");
                self.destroy_peer(inner, other_channel, true);
            }
        }

        let SwarmInner { peers, chunks, .. } = inner;
        let Some(peer) = peers.get_mut(&channel) else {
            return false;
        };
        match peer.state {
            PeerLifecycle::HandshakeSent => {
                peer.state = PeerLifecycle::Initialized;
                info!(peer = peer.num, "received reply handshake, channel initialized");
            }
            PeerLifecycle::New | PeerLifecycle::HandshakeReceived => {
                peer.state = PeerLifecycle::HandshakeReceived;
                self.send_reply_handshake(chunks, peer);
                peer.state = PeerLifecycle::Initialized;
                info!(peer = peer.num, "received initial handshake, replied and initialized");
            }
            PeerLifecycle::Initialized | PeerLifecycle::Closed => {}
        }

        peer.idle_cancel.cancel();
        let wake = peer.send_wake.clone();
        let peer_cancel = peer.cancel.clone();
        let num = peer.num;
        spawn_with_cancel(
            debug_span!(parent: self.span.clone(), "send_scheduler", peer = num),
            peer_cancel,
            sender::task_send_scheduler(self.clone(), channel, wake),
        );
        true
    }

    fn on_have(&self, inner: &mut SwarmInner, channel: u32, range: ChunkRange) -> bool {
        let Some(peer) = inner.peers.get_mut(&channel) else {
            return false;
        };
        trace!(peer = peer.num, %range, "have");
        let prev_max = peer.set_have.last().copied();
        peer.set_have.extend(range.iter());
        if prev_max.is_none_or(|m| range.end > m) {
            peer.trim_have_to_discard_window(range.end);
        }

        // Live and VOD swarms learn what exists from HAVEs.
        if (self.opts.live || self.opts.vod) && !self.opts.live_source {
            for id in range.iter() {
                if !inner.chunks.is_discarded(id) && !inner.chunks.set_have.contains(&id) {
                    inner.chunks.set_missing.insert(id);
                }
            }
        }
        true
    }

    fn on_request(&self, inner: &mut SwarmInner, channel: u32, range: ChunkRange) -> bool {
        let Some(peer) = inner.peers.get_mut(&channel) else {
            return false;
        };
        trace!(peer = peer.num, %range, "request");
        for id in range.iter() {
            if inner.chunks.is_discarded(id) {
                continue;
            }
            peer.set_requested.insert(id);
            // A re-request of something we already sent means it never
            // arrived; let the sender push it again.
            peer.set_sent.remove(&id);
        }
        peer.send_wake.notify_one();
        true
    }

    fn on_data(&self, inner: &mut SwarmInner, channel: u32, data: Data<'_>) -> bool {
        let SwarmInner {
            peers,
            chunks,
            storage,
            consumer,
            data_chunks_rx,
            discarded_rx,
            ..
        } = inner;
        let Some(peer) = peers.get_mut(&channel) else {
            return false;
        };
        peer.stats.data_msgs_rx += 1;
        peer.stats.data_rx_bytes += data.payload.len() as u64;

        let reliable = peer.transport.is_reliable();
        let chunk_size = self.opts.chunk_size as usize;
        let static_complete =
            !self.opts.live && !self.opts.vod && chunks.set_missing.is_empty();

        let mut saved_any = false;
        let mut rebroadcast = false;
        for (i, id) in data.range.iter().enumerate() {
            peer.set_i_requested.remove(&id);

            let mut save = true;
            if chunks.is_discarded(id) {
                *discarded_rx += 1;
                info!(id, "received chunk in discarded range");
                save = false;
            } else if static_complete {
                // Late datagrams after completion.
                save = false;
            }

            if save {
                let offset = i * chunk_size;
                if offset >= data.payload.len() {
                    break;
                }
                let end = (offset + chunk_size).min(data.payload.len());
                let payload = &data.payload[offset..end];

                match storage.save_chunk(chunks, id, payload) {
                    Ok(SaveOutcome::Saved { rebroadcast_have }) => {
                        saved_any = true;
                        rebroadcast |= rebroadcast_have;
                        *data_chunks_rx += 1;
                        if let Some(consumer) = consumer.as_mut() {
                            consumer.data_received(id, payload, &mut |cid| {
                                storage.get_chunk(cid, true).ok().flatten()
                            });
                        }
                    }
                    Ok(SaveOutcome::Duplicate) => {}
                    Err(e) => {
                        warn!(id, "error saving chunk: {e:#}");
                    }
                }
            }

            // Coalesced ACKs, datagram transports only. Late and duplicate
            // data is acked too, or the sender would retransmit forever.
            if !reliable {
                if let Some(run) = peer.accumulate_ack(id) {
                    let covering = chunks.ack_range(run);
                    let delay_us = sender::now_micros().saturating_sub(data.timestamp_us);
                    let mut packet = begin_packet(peer.remote_channel);
                    Message::Ack(Ack {
                        range: covering,
                        one_way_delay_us: delay_us,
                    })
                    .serialize(&mut packet);
                    let sent = peer.transport.send(packet.into());
                    self.account_tx(sent);
                    trace!(peer = peer.num, %covering, "acked");
                }
            }
        }

        if saved_any && !self.opts.live && !self.opts.vod && chunks.set_missing.is_empty() {
            info!("no more missing chunks");
            if let Err(e) = storage.post_complete(chunks) {
                warn!("post-complete failed: {e:#}");
            }
            self.send_have_to_members_locked(chunks, peers);
        } else if rebroadcast {
            self.send_have_to_members_locked(chunks, peers);
        }
        true
    }

    fn on_ack(&self, inner: &mut SwarmInner, channel: u32, ack: Ack) -> bool {
        let SwarmInner {
            peers,
            chunks,
            storage,
            ..
        } = inner;
        let Some(peer) = peers.get_mut(&channel) else {
            return false;
        };
        trace!(peer = peer.num, range = %ack.range, "ack");

        for id in ack.range.iter() {
            peer.set_sent.remove(&id);
            peer.set_requested.remove(&id);
        }
        if peer.transport.is_reliable() {
            // Stream transports deliver; ACKs carry nothing we need.
            return true;
        }

        match peer.in_flight.first_key_value() {
            None => {
                peer.stats.duplicate_acks += 1;
                return true;
            }
            Some((&head, _)) if ack.range.end < head => {
                peer.stats.duplicate_acks += 1;
                return true;
            }
            _ => {}
        }

        let mut rtts = Vec::new();
        let mut popped = 0u64;
        for id in ack.range.iter() {
            let Some(inflight) = peer.in_flight.remove(&id) else {
                continue;
            };
            popped += 1;
            if !inflight.resent {
                rtts.push(inflight.sent_at.elapsed().as_secs_f64());
                // Were earlier non-resent sends skipped over by this ACK?
                if peer.in_flight.range(..id).any(|(_, v)| !v.resent) {
                    peer.ooo_acks += 1;
                }
            }
        }

        if peer.ooo_acks >= 3 {
            info!(peer = peer.num, "3 out-of-order acks, declaring loss");
            sender::resend_in_flight(self, chunks, storage.as_mut(), peer, Some(ack.range.end));
            peer.ledbat.on_data_loss(true, None);
            peer.ooo_acks = 0;
        }

        let bytes_acked = popped * (self.opts.chunk_size as u64 + DATA_HEADER_LEN as u64);
        let delay_ms = ack.one_way_delay_us as f64 / 1000.0;
        peer.ledbat.on_ack(Some(bytes_acked), &[delay_ms], &rtts);
        peer.send_wake.notify_one();
        true
    }

    /// One HAVE per entry of our range list, to every initialized peer.
    pub(crate) fn send_have_to_members(&self) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        self.send_have_to_members_locked(&inner.chunks, &mut inner.peers);
    }

    fn send_have_to_members_locked(&self, chunks: &ChunkState, peers: &mut HashMap<u32, Peer>) {
        let mut body = Vec::new();
        for range in &chunks.have_ranges {
            Message::Have(*range).serialize(&mut body);
        }
        if body.is_empty() {
            return;
        }
        let init_peers = peers.values_mut().filter(|p| p.state.is_initialized());
        let mut count = 0;
        for peer in init_peers {
            let mut packet = begin_packet(peer.remote_channel);
            packet.extend_from_slice(&body);
            let sent = peer.transport.send(packet.into());
            self.account_tx(sent);
            count += 1;
        }
        debug!(ranges = chunks.have_ranges.len(), peers = count, "sent have to members");
    }

    /// Live source entry point: pack an application frame and advertise it.
    pub fn inject_frame(&self, frame: &[u8]) -> Result<ChunkRange> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let packs =
            crate::storage::pack_frame_discard_eligible(frame, self.opts.chunk_size as usize);
        let result = inner
            .storage
            .inject_chunks(&mut inner.chunks, packs)?
            .ok_or(Error::SwarmClosed)?;
        if result.rebroadcast_have {
            self.send_have_to_members_locked(&inner.chunks, &mut inner.peers);
        }
        Ok(result.range)
    }

    /// Tear one peer down: cancel its tasks, unlink its channel, snapshot its
    /// stats and optionally wave goodbye.
    pub(crate) fn destroy_peer(&self, inner: &mut SwarmInner, channel: u32, send_goodbye: bool) {
        let Some(peer) = inner.peers.remove(&channel) else {
            return;
        };
        info!(peer = %peer, "removing member from swarm");
        peer.cancel.cancel();

        if send_goodbye {
            let mut packet = begin_packet(peer.remote_channel);
            Message::Handshake(HandshakeMsg::goodbye()).serialize(&mut packet);
            let sent = peer.transport.send(packet.into());
            self.account_tx(sent);
        }

        inner
            .member_stats
            .insert(peer.snapshot_key(), peer.stats.clone());

        if let Some(hive) = self.hive.upgrade() {
            hive.unregister_channel(channel);
        }
    }

    /// Transport died: drop every peer multiplexed on it, silently.
    pub(crate) fn on_stream_conn_lost(&self, conn_id: u64) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let channels: Vec<u32> = inner
            .peers
            .iter()
            .filter(|(_, p)| p.transport.stream_conn_id() == Some(conn_id))
            .map(|(ch, _)| *ch)
            .collect();
        for channel in channels {
            self.destroy_peer(inner, channel, false);
        }
    }

    /// Wire the tracker's peer-list updates into admission.
    pub fn attach_tracker(
        self: &Arc<Self>,
        events: tokio::sync::mpsc::UnboundedReceiver<TrackerEvent>,
    ) {
        spawn_with_cancel(
            debug_span!(parent: self.span.clone(), "tracker_events"),
            self.cancel.clone(),
            task_tracker_events(self.clone(), events),
        );
    }

    pub(crate) fn connect_to_peer(self: &Arc<Self>, addr: SocketAddr) {
        let Some(hive) = self.hive.upgrade() else {
            return;
        };
        {
            let mut inner = self.inner.lock();
            inner.known_peers.insert(addr);
            if inner.peers.values().any(|p| p.addr == addr) {
                return;
            }
        }
        match hive.udp_socket() {
            Some(socket) => {
                let transport = PeerTransport::Datagram { socket, addr };
                if let Err(e) = self.add_member(addr, transport, true) {
                    debug!(%addr, "not adding member: {e:#}");
                }
            }
            None => hive.connect_stream(addr, self.id.clone()),
        }
    }

    /// Graceful shutdown: cancel every task, send goodbyes, close storage and
    /// produce the final report.
    pub async fn close(&self, run_args: Option<serde_json::Value>) -> SwarmShutdownReport {
        info!(id = %self.id, "closing swarm");
        self.closed.store(true, Ordering::Relaxed);
        self.cancel.cancel();

        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let channels: Vec<u32> = inner.peers.keys().copied().collect();
        for channel in channels {
            self.destroy_peer(inner, channel, true);
        }

        let content_consumer = inner.consumer.as_mut().map(|c| c.stop());
        let file_storage = inner.storage.file_report();
        inner.storage.close();

        let now_secs = |t: SystemTime| {
            t.duration_since(SystemTime::UNIX_EPOCH)
                .map(|d| d.as_secs_f64())
                .unwrap_or_default()
        };

        SwarmShutdownReport {
            swarm_id: self.id.as_string(),
            live: self.opts.live,
            live_source: self.opts.live_source,
            vod: self.opts.vod,
            data_tx: self.all_data_tx.load(Ordering::Relaxed),
            data_rx: self.all_data_rx.load(Ordering::Relaxed),
            data_chunks_rx: inner.data_chunks_rx,
            rx_discarded: inner.discarded_rx,
            start_time: now_secs(self.start_time),
            close_time: now_secs(SystemTime::now()),
            member_stats: std::mem::take(&mut inner.member_stats),
            file_storage,
            content_consumer,
            run_args,
        }
    }

    /// Number of chunks we hold; test and stats surface.
    pub fn num_have(&self) -> usize {
        self.inner.lock().chunks.set_have.len()
    }

    pub fn num_missing(&self) -> usize {
        self.inner.lock().chunks.set_missing.len()
    }

    pub fn num_peers(&self) -> usize {
        self.inner.lock().peers.len()
    }
}

async fn task_idle_timeout(swarm: Arc<Swarm>, channel: u32) -> anyhow::Result<()> {
    tokio::time::sleep(IDLE_TIMEOUT).await;
    let mut guard = swarm.inner.lock();
    let inner = &mut *guard;
    let uninitialized = inner
        .peers
        .get(&channel)
        .is_some_and(|p| !p.state.is_initialized());
    if uninitialized {
        info!(channel, "peer did not complete handshake in time");
        swarm.destroy_peer(inner, channel, false);
    }
    Ok(())
}

async fn task_tracker_events(
    swarm: Arc<Swarm>,
    mut events: tokio::sync::mpsc::UnboundedReceiver<TrackerEvent>,
) -> anyhow::Result<()> {
    while let Some(event) = events.recv().await {
        match event {
            TrackerEvent::OtherPeers { details, .. } => {
                // The source only takes inbound connections.
                if swarm.opts.live_source {
                    continue;
                }
                let mut endpoints: Vec<SocketAddr> = details
                    .into_iter()
                    .map(|(ip, port)| SocketAddr::new(ip, port))
                    .collect();
                {
                    use rand::seq::SliceRandom;
                    endpoints.shuffle(&mut rand::rng());
                }
                for addr in endpoints {
                    swarm.connect_to_peer(addr);
                }
            }
            TrackerEvent::NewNode { endpoint, .. } => {
                if swarm.opts.live_source {
                    continue;
                }
                swarm.connect_to_peer(SocketAddr::new(endpoint.0, endpoint.1));
            }
            TrackerEvent::RemoveNode { endpoint, .. } => {
                let addr = SocketAddr::new(endpoint.0, endpoint.1);
                let mut guard = swarm.inner.lock();
                let inner = &mut *guard;
                inner.known_peers.remove(&addr);
                let gone: Vec<u32> = inner
                    .peers
                    .iter()
                    .filter(|(_, p)| p.addr == addr)
                    .map(|(ch, _)| *ch)
                    .collect();
                for channel in gone {
                    swarm.destroy_peer(inner, channel, false);
                }
            }
        }
    }
    Ok(())
}

async fn task_periodic_stats(swarm: Arc<Swarm>) -> anyhow::Result<()> {
    let mut interval = tokio::time::interval(swarm.opts.stats_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately.
    interval.tick().await;
    loop {
        interval.tick().await;
        let data_rx = swarm.all_data_rx.load(Ordering::Relaxed);
        let data_tx = swarm.all_data_tx.load(Ordering::Relaxed);

        let mut guard = swarm.inner.lock();
        let inner = &mut *guard;
        let elapsed = inner.interval.last_tick.elapsed().as_secs_f64().max(0.001);

        let chunk_rate = (inner.data_chunks_rx - inner.interval.chunks_rx) as f64 / elapsed;
        let up_rate = (data_tx - inner.interval.data_tx) as f64 / elapsed;
        let down_rate = (data_rx - inner.interval.data_rx) as f64 / elapsed;

        inner.interval.chunks_rx = inner.data_chunks_rx;
        inner.interval.data_rx = data_rx;
        inner.interval.data_tx = data_tx;
        inner.interval.last_tick = std::time::Instant::now();

        let valid = inner
            .peers
            .values()
            .filter(|p| p.state.is_initialized())
            .count();
        info!(
            have = inner.chunks.set_have.len(),
            missing = inner.chunks.set_missing.len(),
            chunks_per_s = chunk_rate as u64,
            up_bps = up_rate as u64,
            down_bps = down_rate as u64,
            members_known = inner.peers.len(),
            members_valid = valid,
            "periodic stats"
        );
    }
}
