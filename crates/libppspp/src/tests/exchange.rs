//! End-to-end exchange tests: two hives on loopback UDP moving real chunks
//! through the full handshake / HAVE / REQUEST / DATA / ACK machinery.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use hashw::HashFunction;
use ppspp_core::merkle;
use ppspp_core::SwarmId;

use crate::hive::{Hive, HiveOptions, TransportMode};
use crate::swarm::SwarmOptions;

fn loopback_opts() -> HiveOptions {
    HiveOptions {
        transport: TransportMode::Datagram,
        listen_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
        listen_port: 0,
    }
}

fn test_content(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

async fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    cond()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_static_file_exchange_over_udp() {
    let dir = tempfile::tempdir().unwrap();
    let content = test_content(10_000);

    let seed_path = dir.path().join("seed.bin");
    std::fs::write(&seed_path, &content).unwrap();
    let swarm_id = SwarmId::new(
        merkle::data_root_hash(&content, HashFunction::Sha1, 1024).unwrap(),
    );

    let seed_hive = Hive::new(loopback_opts()).await.unwrap();
    let mut seed_opts = SwarmOptions::new(swarm_id.clone());
    seed_opts.filename = Some(seed_path.clone());
    seed_opts.file_size = content.len() as u64;
    let seed = seed_hive.create_swarm(seed_opts).await.unwrap();
    assert_eq!(seed.num_missing(), 0);
    assert_eq!(seed.num_have(), 10);

    let leech_hive = Hive::new(loopback_opts()).await.unwrap();
    let leech_path = dir.path().join("leech.bin");
    let mut leech_opts = SwarmOptions::new(swarm_id.clone());
    leech_opts.filename = Some(leech_path.clone());
    leech_opts.file_size = content.len() as u64;
    leech_opts.selection_interval = Duration::from_millis(100);
    let leech = leech_hive.create_swarm(leech_opts).await.unwrap();
    assert_eq!(leech.num_missing(), 10);

    leech.add_peer(seed_hive.local_addr());

    assert!(
        wait_until(Duration::from_secs(20), || leech.num_missing() == 0).await,
        "download did not finish: missing={} have={}",
        leech.num_missing(),
        leech.num_have()
    );
    assert_eq!(std::fs::read(&leech_path).unwrap(), content);

    // The downloaded file re-validates against the swarm id.
    assert_eq!(
        merkle::file_root_hash(&leech_path, HashFunction::Sha1, 1024).unwrap(),
        swarm_id.as_bytes()
    );

    let reports = leech_hive.shutdown(None).await;
    assert_eq!(reports.len(), 1);
    assert!(reports[0].data_rx > 0);
    assert_eq!(reports[0].data_chunks_rx, 10);
    seed_hive.shutdown(None).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_live_stream_exchange_over_udp() {
    let swarm_id: SwarmId = "aabbccdd00112233".parse().unwrap();

    let source_hive = Hive::new(loopback_opts()).await.unwrap();
    let mut source_opts = SwarmOptions::new(swarm_id.clone());
    source_opts.live = true;
    source_opts.live_source = true;
    source_opts.discard_window = Some(10_000);
    let source = source_hive.create_swarm(source_opts).await.unwrap();

    // Single-chunk frames; advertised via the handshake piggyback.
    for i in 0..120u32 {
        let frame = vec![(i % 256) as u8; 100];
        source.inject_frame(&frame).unwrap();
    }
    assert_eq!(source.num_have(), 120);
    assert_eq!(source.num_missing(), 0);

    let leech_hive = Hive::new(loopback_opts()).await.unwrap();
    let mut leech_opts = SwarmOptions::new(swarm_id.clone());
    leech_opts.live = true;
    leech_opts.selection_interval = Duration::from_millis(100);
    let leech = leech_hive.create_swarm(leech_opts).await.unwrap();

    leech.add_peer(source_hive.local_addr());

    assert!(
        wait_until(Duration::from_secs(20), || leech.num_have() == 120).await,
        "live transfer incomplete: have={}",
        leech.num_have()
    );

    let reports = leech_hive.shutdown(None).await;
    assert_eq!(reports[0].data_chunks_rx, 120);
    assert!(reports[0].content_consumer.is_some());
    source_hive.shutdown(None).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_swarm_full_refuses_members() {
    let dir = tempfile::tempdir().unwrap();
    let content = test_content(2048);
    let path = dir.path().join("full.bin");
    std::fs::write(&path, &content).unwrap();
    let swarm_id = SwarmId::new(
        merkle::data_root_hash(&content, HashFunction::Sha1, 1024).unwrap(),
    );

    let hive = Hive::new(loopback_opts()).await.unwrap();
    let mut opts = SwarmOptions::new(swarm_id);
    opts.filename = Some(path);
    opts.file_size = content.len() as u64;
    opts.max_peers = Some(1);
    let swarm = hive.create_swarm(opts).await.unwrap();

    use crate::transport::PeerTransport;
    let socket = hive.udp_socket().unwrap();
    let a = swarm.add_member(
        "127.0.0.1:40001".parse().unwrap(),
        PeerTransport::Datagram {
            socket: socket.clone(),
            addr: "127.0.0.1:40001".parse().unwrap(),
        },
        true,
    );
    assert!(a.is_ok());
    let b = swarm.add_member(
        "127.0.0.1:40002".parse().unwrap(),
        PeerTransport::Datagram {
            socket,
            addr: "127.0.0.1:40002".parse().unwrap(),
        },
        true,
    );
    assert!(matches!(b, Err(crate::Error::SwarmFull)));
    assert_eq!(swarm.num_peers(), 1);
    hive.shutdown(None).await;
}
