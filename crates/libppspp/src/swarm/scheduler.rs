//! Chunk-selection scheduler: decides what to REQUEST from whom.
//!
//! Two policies, kept separate on purpose:
//!
//! - `TightReqMax` keeps up to a fixed number of requests outstanding per
//!   peer and tops up only below a threshold. Static downloads run this.
//! - `Greedy` requests everything a peer can give, bounded by a per-tick
//!   limit, and skips peers with a deep backlog. Live and VOD swarms run
//!   this, with tighter bounds while a consumer is buffering or playing.

use std::collections::BTreeSet;
use std::sync::Arc;

use peer_protocol::{begin_packet, Message};
use ppspp_core::chunks::{self, ChunkId};
use rand::seq::SliceRandom;
use tracing::{debug, info, trace};

use super::Swarm;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPolicy {
    /// Up to REQMAX outstanding per peer, top up below REQTHRESH.
    TightReqMax,
    /// Request whatever is wantable each tick, bounded per peer.
    Greedy,
}

// TightReqMax bounds.
const REQMAX: usize = 1000;
const REQTHRESH: usize = 250;

// Greedy bounds without a consumer attached.
const GREEDY_BACKLOG: usize = 350;
const GREEDY_LIMIT: usize = 500;
// Greedy bounds with a consumer: (backlog, limit).
const GREEDY_PLAYING: (usize, usize) = (150, 250);
const GREEDY_BUFFERING: (usize, usize) = (100, 150);

pub(crate) async fn task_chunk_selection(swarm: Arc<Swarm>) -> anyhow::Result<()> {
    let mut interval = tokio::time::interval(swarm.opts.selection_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        if !swarm.selection_tick() {
            info!("all chunks onboard, stopping chunk selection");
            return Ok(());
        }
    }
}

impl Swarm {
    /// One pass of the selection algorithm. Returns false once the swarm no
    /// longer needs it (static download complete).
    pub(crate) fn selection_tick(&self) -> bool {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        if self.opts.live_source {
            debug_assert!(inner.chunks.set_missing.is_empty());
            return false;
        }
        let any_missing = !inner.chunks.set_missing.is_empty();
        if !any_missing && !self.opts.live {
            return false;
        }

        let policy = self.request_policy();

        // Snapshot of everything already requested from anyone.
        let mut all_requested: BTreeSet<ChunkId> = inner.requested_pool.clone();
        for peer in inner.peers.values() {
            all_requested.extend(peer.set_i_requested.iter().copied());
        }

        let order = self.peer_order(inner, policy);

        let mut any_wantable = false;
        for channel in order {
            let Some(peer) = inner.peers.get_mut(&channel) else {
                continue;
            };
            if !peer.state.is_initialized() {
                continue;
            }

            let max_permitted = self.download_forward_limit(inner.consumer.as_ref());
            let mut want: Vec<ChunkId> = peer
                .set_have
                .iter()
                .copied()
                .filter(|id| {
                    !inner.chunks.set_have.contains(id)
                        && !all_requested.contains(id)
                        && !inner.chunks.is_discarded(*id)
                        && max_permitted.is_none_or(|max| *id < max)
                })
                .collect();

            let outstanding = peer.set_i_requested.len();
            if !want.is_empty() {
                any_wantable = true;
                trace!(
                    peer = peer.num,
                    want = want.len(),
                    outstanding,
                    "selection"
                );
            }

            let (backlog, limit) = self.policy_bounds(policy, inner.consumer.as_ref());
            if outstanding > backlog || want.is_empty() {
                continue;
            }
            want.truncate(limit);

            request_chunks(self, peer, &want);
            for id in &want {
                peer.set_i_requested.insert(*id);
                all_requested.insert(*id);
                inner.requested_pool.insert(*id);
            }
        }

        // Nothing wantable anywhere: allow re-requesting chunks whose
        // previous request died with its peer.
        if !any_wantable {
            debug!(
                missing = inner.chunks.set_missing.len(),
                "cleared requested chunk pool"
            );
            inner.requested_pool.clear();
        }

        true
    }

    pub(crate) fn request_policy(&self) -> RequestPolicy {
        self.opts.request_policy.unwrap_or({
            if self.opts.live || self.opts.vod {
                RequestPolicy::Greedy
            } else {
                RequestPolicy::TightReqMax
            }
        })
    }

    fn policy_bounds(
        &self,
        policy: RequestPolicy,
        consumer: Option<&crate::consumer::ContentConsumer>,
    ) -> (usize, usize) {
        match policy {
            RequestPolicy::TightReqMax => (REQTHRESH, REQMAX),
            RequestPolicy::Greedy => match consumer {
                Some(c) if c.playback_started() => GREEDY_PLAYING,
                Some(_) => GREEDY_BUFFERING,
                None => (GREEDY_BACKLOG, GREEDY_LIMIT),
            },
        }
    }

    /// Highest chunk id (exclusive) the VOD forward window permits.
    fn download_forward_limit(
        &self,
        consumer: Option<&crate::consumer::ContentConsumer>,
    ) -> Option<ChunkId> {
        let window = self.opts.download_forward_window?;
        let consumer = consumer?;
        Some(consumer.next_frame().saturating_add(window))
    }

    /// Peer iteration order: shuffled for the greedy live path, replaced by
    /// the ALTO cost order when one is fresh enough to cover the swarm.
    fn peer_order(&self, inner: &super::SwarmInner, policy: RequestPolicy) -> Vec<u32> {
        let mut order: Vec<u32> = inner.peers.keys().copied().collect();
        if policy != RequestPolicy::Greedy || !(self.opts.live || self.opts.vod) {
            order.sort_unstable();
            return order;
        }

        if let Some(alto) = &inner.alto_order {
            let live_peers = inner
                .peers
                .values()
                .filter(|p| p.state.is_initialized())
                .count() as i64;
            if (alto.len() as i64 - live_peers).abs() <= 3 {
                let position = |ch: &u32| {
                    let addr = inner.peers[ch].addr;
                    alto.iter().position(|a| *a == addr).unwrap_or(usize::MAX)
                };
                order.sort_by_key(position);
                return order;
            }
        }

        order.shuffle(&mut rand::rng());
        order
    }
}

/// Turn a sorted want-list into REQUEST messages, one per contiguous run,
/// batched into a single packet.
fn request_chunks(swarm: &Swarm, peer: &mut crate::peer::Peer, want: &[ChunkId]) {
    if want.is_empty() {
        return;
    }
    let mut packet = begin_packet(peer.remote_channel);
    let runs = chunks::ranges_from_sorted(want.iter().copied());
    let total = runs.len();
    for (i, run) in runs.into_iter().enumerate() {
        Message::Request(run).serialize(&mut packet);
        trace!(peer = peer.num, %run, "({}/{}) requesting", i + 1, total);
    }
    let sent = peer.transport.send(packet.into());
    swarm.account_tx(sent);
}
