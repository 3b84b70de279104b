//! Swarm state-machine tests: crafted packets through the real handlers,
//! with an inspectable in-memory stream connection standing in for a socket.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use bytes::Bytes;
use peer_protocol::{
    begin_packet, default_handshake, read_channel, HandshakeMsg, Message, MessageIter,
    ParseContext,
};
use ppspp_core::chunks::ChunkRange;
use ppspp_core::merkle;
use ppspp_core::SwarmId;
use hashw::HashFunction;
use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

use crate::hive::{Hive, HiveOptions, TransportMode};
use crate::swarm::{Swarm, SwarmOptions};
use crate::transport::{PeerTransport, StreamConn};

fn loopback_opts() -> HiveOptions {
    HiveOptions {
        transport: TransportMode::Datagram,
        listen_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
        listen_port: 0,
    }
}

async fn static_seed_swarm() -> (Arc<Hive>, Arc<Swarm>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let content: Vec<u8> = (0..5000usize).map(|i| (i % 241) as u8).collect();
    let path = dir.path().join("seed.bin");
    std::fs::write(&path, &content).unwrap();
    let swarm_id = SwarmId::new(
        merkle::data_root_hash(&content, HashFunction::Sha1, 1024).unwrap(),
    );

    let hive = Hive::new(loopback_opts()).await.unwrap();
    let mut opts = SwarmOptions::new(swarm_id);
    opts.filename = Some(path);
    opts.file_size = content.len() as u64;
    let swarm = hive.create_swarm(opts).await.unwrap();
    (hive, swarm, dir)
}

fn first_contact_packet(swarm: &Swarm, source_channel: u32, uuid: Uuid) -> Vec<u8> {
    let mut packet = begin_packet(0);
    Message::Handshake(default_handshake(
        source_channel,
        swarm.id.as_bytes(),
        uuid,
        None,
    ))
    .serialize(&mut packet);
    packet
}

fn recv_packet(rx: &mut UnboundedReceiver<Bytes>) -> Option<Bytes> {
    rx.try_recv().ok()
}

fn parse_messages(packet: &[u8]) -> (u32, Vec<String>) {
    let (channel, body) = read_channel(packet).unwrap();
    let kinds = MessageIter::new(body, ParseContext::default())
        .map(|m| match m.unwrap() {
            Message::Handshake(h) if h.is_goodbye => "goodbye".to_string(),
            Message::Handshake(_) => "handshake".to_string(),
            Message::Have(r) => format!("have {r}"),
            Message::Data(_) => "data".to_string(),
            Message::Ack(_) => "ack".to_string(),
            Message::Integrity(_) => "integrity".to_string(),
            Message::Request(r) => format!("request {r}"),
        })
        .collect();
    (channel, kinds)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_inbound_handshake_gets_reply_with_haves() {
    let (hive, swarm, _dir) = static_seed_swarm().await;
    let (conn, mut rx) = StreamConn::new_for_test();
    let addr: SocketAddr = "127.0.0.1:50001".parse().unwrap();

    let packet = first_contact_packet(&swarm, 77, Uuid::new_v4());
    swarm.handle_first_contact(PeerTransport::Stream(conn), addr, &packet[4..]);

    assert_eq!(swarm.num_peers(), 1);
    let reply = recv_packet(&mut rx).expect("no reply handshake");
    let (channel, kinds) = parse_messages(&reply);
    // Addressed to the channel we picked, with our possession piggybacked.
    assert_eq!(channel, 77);
    assert_eq!(kinds[0], "handshake");
    assert_eq!(kinds[1], "have [0, 4]");
    hive.shutdown(None).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_goodbye_destroys_peer_silently() {
    let (hive, swarm, _dir) = static_seed_swarm().await;
    let (conn, mut rx) = StreamConn::new_for_test();
    let addr: SocketAddr = "127.0.0.1:50002".parse().unwrap();

    let packet = first_contact_packet(&swarm, 42, Uuid::new_v4());
    swarm.handle_first_contact(PeerTransport::Stream(conn), addr, &packet[4..]);
    assert_eq!(swarm.num_peers(), 1);
    let _reply = recv_packet(&mut rx);

    let local_channel = *swarm.inner.lock().peers.keys().next().unwrap();
    let mut goodbye = begin_packet(local_channel);
    Message::Handshake(HandshakeMsg::goodbye()).serialize(&mut goodbye);
    swarm.handle_packet(local_channel, &goodbye[4..]);

    assert_eq!(swarm.num_peers(), 0);
    // No reply to a goodbye.
    assert!(recv_packet(&mut rx).is_none());
    hive.shutdown(None).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unsupported_chunk_size_drops_peer() {
    let (hive, swarm, _dir) = static_seed_swarm().await;
    let (conn, _rx) = StreamConn::new_for_test();
    let addr: SocketAddr = "127.0.0.1:50003".parse().unwrap();

    let mut hs = default_handshake(9, swarm.id.as_bytes(), Uuid::new_v4(), None);
    hs.chunk_size = 4096;
    let mut packet = begin_packet(0);
    Message::Handshake(hs).serialize(&mut packet);

    swarm.handle_first_contact(PeerTransport::Stream(conn), addr, &packet[4..]);
    assert_eq!(swarm.num_peers(), 0);
    hive.shutdown(None).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_malformed_message_drops_peer() {
    let (hive, swarm, _dir) = static_seed_swarm().await;
    let (conn, mut rx) = StreamConn::new_for_test();
    let addr: SocketAddr = "127.0.0.1:50004".parse().unwrap();

    let packet = first_contact_packet(&swarm, 5, Uuid::new_v4());
    swarm.handle_first_contact(PeerTransport::Stream(conn), addr, &packet[4..]);
    assert_eq!(swarm.num_peers(), 1);
    let _reply = recv_packet(&mut rx);

    let local_channel = *swarm.inner.lock().peers.keys().next().unwrap();
    // Unknown message type mid-stream.
    let mut bad = begin_packet(local_channel);
    bad.push(0x0b);
    swarm.handle_packet(local_channel, &bad[4..]);

    assert_eq!(swarm.num_peers(), 0);
    hive.shutdown(None).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_duplicate_uuid_keeps_single_association() {
    let (hive, swarm, _dir) = static_seed_swarm().await;
    let uuid = Uuid::new_v4();

    let (conn_a, mut rx_a) = StreamConn::new_for_test();
    swarm.handle_first_contact(
        PeerTransport::Stream(conn_a),
        "127.0.0.1:50005".parse().unwrap(),
        &first_contact_packet(&swarm, 100, uuid)[4..],
    );
    let (conn_b, mut rx_b) = StreamConn::new_for_test();
    swarm.handle_first_contact(
        PeerTransport::Stream(conn_b),
        "127.0.0.1:50006".parse().unwrap(),
        &first_contact_packet(&swarm, 200, uuid)[4..],
    );

    // Exactly one association survives the crossed connect.
    assert_eq!(swarm.num_peers(), 1);
    // One side got a goodbye.
    let mut all = Vec::new();
    while let Some(p) = recv_packet(&mut rx_a) {
        all.push(parse_messages(&p).1);
    }
    while let Some(p) = recv_packet(&mut rx_b) {
        all.push(parse_messages(&p).1);
    }
    assert!(
        all.iter().flatten().any(|k| k == "goodbye"),
        "expected a goodbye somewhere, got {all:?}"
    );
    hive.shutdown(None).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_request_for_discarded_chunks_is_refused() {
    let hive = Hive::new(loopback_opts()).await.unwrap();
    let mut opts = SwarmOptions::new("00ff00ff".parse().unwrap());
    opts.live = true;
    opts.live_source = true;
    opts.discard_window = Some(10);
    let swarm = hive.create_swarm(opts).await.unwrap();

    // 30 single-chunk frames through a 10-chunk window.
    for i in 0..30u32 {
        swarm.inject_frame(&[i as u8; 16]).unwrap();
    }
    let last_discarded = swarm.inner.lock().chunks.last_discarded_id.unwrap();
    assert!(last_discarded >= 19);

    let (conn, mut rx) = StreamConn::new_for_test();
    swarm.handle_first_contact(
        PeerTransport::Stream(conn),
        "127.0.0.1:50007".parse().unwrap(),
        &first_contact_packet(&swarm, 31, Uuid::new_v4())[4..],
    );
    let _reply = recv_packet(&mut rx);
    let local_channel = *swarm.inner.lock().peers.keys().next().unwrap();

    let mut packet = begin_packet(local_channel);
    Message::Request(ChunkRange::new(0, 25)).serialize(&mut packet);
    swarm.handle_packet(local_channel, &packet[4..]);

    {
        let inner = swarm.inner.lock();
        let peer = inner.peers.values().next().unwrap();
        assert!(peer.set_requested.iter().all(|id| *id > last_discarded));
        assert!(peer.set_requested.contains(&25));
    }
    hive.shutdown(None).await;
}
