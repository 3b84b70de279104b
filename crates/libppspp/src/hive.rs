//! The hive holds every swarm running in this node plus the shared transport
//! state, and routes incoming packets to the right swarm: by destination
//! channel for established associations, by swarm id (out of the handshake)
//! for first contact.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::Context;
use parking_lot::Mutex;
use peer_protocol::{read_channel, HandshakeMsg, Message, MessageIter, ParseContext};
use ppspp_core::constants::DEFAULT_PEER_PORT;
use ppspp_core::SwarmId;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, info, warn};

use crate::swarm::{Swarm, SwarmOptions, SwarmShutdownReport};
use crate::transport::{tcp, udp, PeerTransport, StreamConn};

/// Which transport peers of this node speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    Datagram,
    Stream,
}

#[derive(Debug, Clone)]
pub struct HiveOptions {
    pub transport: TransportMode,
    pub listen_ip: IpAddr,
    pub listen_port: u16,
}

impl Default for HiveOptions {
    fn default() -> Self {
        Self {
            transport: TransportMode::Datagram,
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            listen_port: DEFAULT_PEER_PORT,
        }
    }
}

pub struct Hive {
    pub(crate) cancel: CancellationToken,
    udp: Option<Arc<UdpSocket>>,
    local_addr: SocketAddr,
    swarms: Mutex<HashMap<SwarmId, Arc<Swarm>>>,
    /// Local channel id to owning swarm.
    channels: Mutex<HashMap<u32, Arc<Swarm>>>,
    /// Inbound stream connections not yet owned by any swarm.
    orphan_streams: Mutex<HashMap<u64, Arc<StreamConn>>>,
    /// Outbound stream connections being established, and the swarms that
    /// wait for them.
    pending_streams: Mutex<HashMap<SocketAddr, Vec<SwarmId>>>,
}

impl Hive {
    pub async fn new(opts: HiveOptions) -> anyhow::Result<Arc<Self>> {
        let cancel = CancellationToken::new();
        let bind = SocketAddr::new(opts.listen_ip, opts.listen_port);

        let (udp, local_addr) = match opts.transport {
            TransportMode::Datagram => {
                let socket = UdpSocket::bind(bind)
                    .await
                    .with_context(|| format!("error binding udp {bind}"))?;
                let local_addr = socket.local_addr()?;
                (Some(Arc::new(socket)), local_addr)
            }
            TransportMode::Stream => (None, bind),
        };

        let hive = Arc::new(Hive {
            cancel,
            udp,
            local_addr,
            swarms: Mutex::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
            orphan_streams: Mutex::new(HashMap::new()),
            pending_streams: Mutex::new(HashMap::new()),
        });

        match opts.transport {
            TransportMode::Datagram => {
                let socket = hive.udp.clone().unwrap_or_else(|| unreachable!());
                info!(addr = %local_addr, "listening on udp");
                ppspp_core::spawn_utils::spawn_with_cancel(
                    debug_span!("udp_reader", addr = %local_addr),
                    hive.cancel.clone(),
                    udp::task_udp_reader(hive.clone(), socket),
                );
            }
            TransportMode::Stream => {
                let listener = tokio::net::TcpListener::bind(bind)
                    .await
                    .with_context(|| format!("error binding tcp {bind}"))?;
                info!(addr = %listener.local_addr()?, "listening on tcp");
                ppspp_core::spawn_utils::spawn_with_cancel(
                    debug_span!("tcp_listener", addr = %bind),
                    hive.cancel.clone(),
                    tcp::task_tcp_listener(hive.clone(), listener),
                );
            }
        }

        Ok(hive)
    }

    /// The endpoint other peers should reach us on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Token every transport and swarm task hangs off; cancelled at
    /// shutdown.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn udp_socket(&self) -> Option<Arc<UdpSocket>> {
        self.udp.clone()
    }

    pub async fn create_swarm(self: &Arc<Self>, opts: SwarmOptions) -> anyhow::Result<Arc<Swarm>> {
        let id = opts.swarm_id.clone();
        if self.swarms.lock().contains_key(&id) {
            anyhow::bail!("swarm {id} already exists");
        }
        let swarm = Swarm::new(self, opts).await?;
        self.swarms.lock().insert(id, swarm.clone());
        Ok(swarm)
    }

    pub fn get_swarm(&self, id: &SwarmId) -> Option<Arc<Swarm>> {
        self.swarms.lock().get(id).cloned()
    }

    /// Random unused nonzero channel id.
    pub(crate) fn alloc_channel(&self) -> u32 {
        let channels = self.channels.lock();
        loop {
            let ch = rand::random::<u32>();
            if ch != 0 && !channels.contains_key(&ch) {
                return ch;
            }
        }
    }

    pub(crate) fn register_channel(&self, channel: u32, swarm: &Arc<Swarm>) {
        self.channels.lock().insert(channel, swarm.clone());
    }

    pub(crate) fn unregister_channel(&self, channel: u32) {
        self.channels.lock().remove(&channel);
    }

    pub(crate) fn add_orphan_stream(&self, conn: Arc<StreamConn>) {
        self.orphan_streams.lock().insert(conn.conn_id, conn);
    }

    /// Datagram arrived: route by channel, or by handshake for channel 0.
    pub(crate) fn dispatch_datagram(self: &Arc<Self>, addr: SocketAddr, packet: &[u8]) {
        let Ok((channel, body)) = read_channel(packet) else {
            return;
        };
        if channel != 0 {
            let swarm = self.channels.lock().get(&channel).cloned();
            match swarm {
                Some(swarm) => swarm.handle_packet(channel, body),
                None => warn!(channel, %addr, "datagram for unknown channel"),
            }
            return;
        }
        let Some(socket) = self.udp.clone() else {
            return;
        };
        let Some(swarm) = self.swarm_for_first_contact(addr, body) else {
            return;
        };
        swarm.handle_first_contact(PeerTransport::Datagram { socket, addr }, addr, body);
    }

    /// Framed packet arrived on a stream connection.
    pub(crate) fn dispatch_stream_packet(self: &Arc<Self>, conn: &Arc<StreamConn>, packet: &[u8]) {
        let Ok((channel, body)) = read_channel(packet) else {
            return;
        };
        if channel != 0 {
            let swarm = self.channels.lock().get(&channel).cloned();
            match swarm {
                Some(swarm) => swarm.handle_packet(channel, body),
                None => warn!(channel, "stream packet for unknown channel"),
            }
            return;
        }
        let Some(swarm) = self.swarm_for_first_contact(conn.peer_addr, body) else {
            return;
        };
        // The connection is owned now.
        self.orphan_streams.lock().remove(&conn.conn_id);
        swarm.handle_first_contact(PeerTransport::Stream(conn.clone()), conn.peer_addr, body);
    }

    /// First message of a channel-0 packet must be a handshake naming the
    /// swarm.
    fn swarm_for_first_contact(&self, addr: SocketAddr, body: &[u8]) -> Option<Arc<Swarm>> {
        let mut iter = MessageIter::new(body, ParseContext::default());
        let hs: HandshakeMsg = match iter.next() {
            Some(Ok(Message::Handshake(hs))) if !hs.is_goodbye => hs,
            Some(Ok(Message::Handshake(_))) => {
                debug!(%addr, "goodbye on channel 0 ignored");
                return None;
            }
            other => {
                warn!(%addr, "first contact without handshake: {other:?}");
                return None;
            }
        };
        let id = SwarmId::new(hs.swarm_id.unwrap_or_default());
        let swarm = self.get_swarm(&id);
        if swarm.is_none() {
            warn!(%addr, swarm = %id, "no swarm with this id");
        }
        swarm
    }

    /// A stream connection died: every peer on it, in every swarm, dies
    /// silently.
    pub(crate) fn on_stream_conn_lost(&self, conn_id: u64) {
        self.orphan_streams.lock().remove(&conn_id);
        let swarms: Vec<Arc<Swarm>> = self.swarms.lock().values().cloned().collect();
        for swarm in swarms {
            swarm.on_stream_conn_lost(conn_id);
        }
    }

    /// Open an outbound stream connection; the swarm joins in once it is up.
    pub(crate) fn connect_stream(self: &Arc<Self>, addr: SocketAddr, swarm_id: SwarmId) {
        {
            let mut pending = self.pending_streams.lock();
            let waiters = pending.entry(addr).or_default();
            if waiters.contains(&swarm_id) {
                return;
            }
            waiters.push(swarm_id);
            if waiters.len() > 1 {
                // A connection attempt is already in flight.
                return;
            }
        }
        let hive = self.clone();
        ppspp_core::spawn_utils::spawn_with_cancel(
            debug_span!("stream_connect", %addr),
            self.cancel.clone(),
            async move {
                let stream = match tokio::net::TcpStream::connect(addr).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!(%addr, "outgoing connection failed: {e:#}");
                        hive.pending_streams.lock().remove(&addr);
                        return Ok(());
                    }
                };
                let conn = tcp::spawn_stream_conn(&hive, stream, addr);
                let waiters = hive
                    .pending_streams
                    .lock()
                    .remove(&addr)
                    .unwrap_or_default();
                for swarm_id in waiters {
                    let Some(swarm) = hive.get_swarm(&swarm_id) else {
                        continue;
                    };
                    let transport = PeerTransport::Stream(conn.clone());
                    if let Err(e) = swarm.add_member(addr, transport, true) {
                        debug!(%addr, "swarm did not take the connection: {e:#}");
                    }
                }
                Ok(())
            },
        );
    }

    /// Close every swarm, collecting their reports, then stop the transports.
    pub async fn shutdown(&self, run_args: Option<serde_json::Value>) -> Vec<SwarmShutdownReport> {
        let swarms: Vec<Arc<Swarm>> = self.swarms.lock().drain().map(|(_, s)| s).collect();
        let mut reports = Vec::with_capacity(swarms.len());
        for swarm in swarms {
            reports.push(swarm.close(run_args.clone()).await);
        }
        self.cancel.cancel();
        reports
    }
}
