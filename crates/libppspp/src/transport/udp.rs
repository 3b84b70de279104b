//! Datagram transport: one shared UDP socket; every datagram is a complete
//! packet. A datagram of just the channel id is a keepalive.

use std::sync::Arc;

use anyhow::Context;
use tokio::net::UdpSocket;
use tracing::debug;

use crate::hive::Hive;

pub(crate) async fn task_udp_reader(hive: Arc<Hive>, socket: Arc<UdpSocket>) -> anyhow::Result<()> {
    // Max UDP datagram.
    let mut buf = vec![0u8; 65536];
    loop {
        let (n, addr) = socket.recv_from(&mut buf).await.context("udp recv error")?;
        if n < peer_protocol::CHANNEL_LEN {
            debug!(%addr, n, "runt datagram ignored");
            continue;
        }
        if n == peer_protocol::CHANNEL_LEN {
            // Keepalive: accepted, nothing to do.
            debug!(%addr, "keepalive");
            continue;
        }
        hive.dispatch_datagram(addr, &buf[..n]);
    }
}
