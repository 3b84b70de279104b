//! TCP stream transport: a listener for inbound connections, and per
//! connection a reader task (framing packets out of the byte stream) plus a
//! writer task draining the send queue.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::Context;
use ppspp_core::framer::{frame_packet, StreamFramer};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::unbounded_channel;
use tracing::{debug, debug_span, info};

use super::StreamConn;
use crate::hive::Hive;

/// Backlog below which the throttle flag clears again.
pub(crate) const STREAM_LOW_WATER: usize = 64 * 1024;

pub(crate) async fn task_tcp_listener(
    hive: Arc<Hive>,
    listener: tokio::net::TcpListener,
) -> anyhow::Result<()> {
    loop {
        let (stream, addr) = listener.accept().await.context("accept error")?;
        info!(%addr, "incoming stream connection");
        let conn = spawn_stream_conn(&hive, stream, addr);
        hive.add_orphan_stream(conn);
    }
}

/// Wire a connected TCP stream into the hive: spawns the reader and writer
/// tasks and returns the shared connection handle.
pub(crate) fn spawn_stream_conn(
    hive: &Arc<Hive>,
    stream: TcpStream,
    addr: SocketAddr,
) -> Arc<StreamConn> {
    let _ = stream.set_nodelay(true);
    let (read_half, write_half) = stream.into_split();
    let (tx, rx) = unbounded_channel();
    let conn = StreamConn::new(addr, tx);

    ppspp_core::spawn_utils::spawn_with_cancel(
        debug_span!("stream_reader", %addr, conn_id = conn.conn_id),
        hive.cancel.child_token(),
        task_conn_reader(hive.clone(), conn.clone(), read_half),
    );
    ppspp_core::spawn_utils::spawn_with_cancel(
        debug_span!("stream_writer", %addr, conn_id = conn.conn_id),
        hive.cancel.child_token(),
        task_conn_writer(conn.clone(), write_half, rx),
    );
    conn
}

async fn task_conn_reader(
    hive: Arc<Hive>,
    conn: Arc<StreamConn>,
    mut read_half: tokio::net::tcp::OwnedReadHalf,
) -> anyhow::Result<()> {
    let mut framer = StreamFramer::new();
    let mut buf = vec![0u8; 64 * 1024];
    let result = loop {
        match read_half.read(&mut buf).await {
            Ok(0) => break Ok(()),
            Ok(n) => {
                for packet in framer.data_received(&buf[..n]) {
                    hive.dispatch_stream_packet(&conn, &packet);
                }
            }
            Err(e) => break Err(e),
        }
    };
    // Socket gone, either way: every peer on it dies without goodbyes.
    debug!("stream connection closed: {result:?}");
    hive.on_stream_conn_lost(conn.conn_id);
    Ok(())
}

async fn task_conn_writer(
    conn: Arc<StreamConn>,
    mut write_half: tokio::net::tcp::OwnedWriteHalf,
    mut rx: tokio::sync::mpsc::UnboundedReceiver<bytes::Bytes>,
) -> anyhow::Result<()> {
    while let Some(packet) = rx.recv().await {
        let len = packet.len();
        let res = write_half.write_all(&frame_packet(&packet)).await;
        let left = conn.queued_bytes.fetch_sub(len, Ordering::Relaxed) - len;
        if left <= STREAM_LOW_WATER {
            conn.throttled.store(false, Ordering::Relaxed);
        }
        res.context("stream write error")?;
    }
    Ok(())
}
