//! Client side of the rendezvous tracker protocol.
//!
//! Messages are UTF-8 JSON, framed with a big-endian u32 length prefix, over
//! one TCP connection to the tracker. The tracker mirrors registrations to
//! every peer of a swarm, so after registering the client receives a stream
//! of peer-list updates until the connection dies.
//!
//! The initial connection is retried 3 times, 1 second apart; failure after
//! that is fatal to startup. Losing the tracker mid-run is tolerated: the
//! swarm keeps running with the peers it already has.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use anyhow::Context;
use backon::{ConstantBuilder, Retryable};
use ppspp_core::framer::{frame_packet, StreamFramer};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, info, warn};

/// Client to tracker messages.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TrackerRequest {
    Register {
        swarm_id: String,
        endpoint: (IpAddr, u16),
    },
    Unregister {
        swarm_id: String,
        endpoint: (IpAddr, u16),
    },
    GetPeers {
        swarm_id: String,
    },
}

/// Tracker to client messages.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TrackerEvent {
    OtherPeers {
        swarm_id: String,
        details: Vec<(IpAddr, u16)>,
    },
    NewNode {
        swarm_id: String,
        endpoint: (IpAddr, u16),
    },
    RemoveNode {
        swarm_id: String,
        endpoint: (IpAddr, u16),
    },
}

pub struct TrackerClient {
    tx: UnboundedSender<TrackerRequest>,
}

impl TrackerClient {
    /// Connect to the tracker, retrying 3 times 1 s apart. Returns the client
    /// handle and the stream of tracker events. Spawned tasks stop when the
    /// token is cancelled or the connection is lost.
    pub async fn connect(
        addr: SocketAddr,
        cancel: CancellationToken,
    ) -> anyhow::Result<(Self, UnboundedReceiver<TrackerEvent>)> {
        let stream = (|| TcpStream::connect(addr))
            .retry(
                ConstantBuilder::default()
                    .with_delay(Duration::from_secs(1))
                    .with_max_times(3),
            )
            .notify(|err, retry_in| warn!(?retry_in, "error connecting to tracker: {err:#}"))
            .await
            .with_context(|| format!("tracker {addr} unreachable"))?;
        info!(%addr, "connected to tracker");

        let (read_half, write_half) = stream.into_split();
        let (event_tx, event_rx) = unbounded_channel();
        let (req_tx, req_rx) = unbounded_channel();

        ppspp_core::spawn_utils::spawn_with_cancel(
            debug_span!("tracker_reader", %addr),
            cancel.clone(),
            task_reader(read_half, event_tx),
        );
        ppspp_core::spawn_utils::spawn_with_cancel(
            debug_span!("tracker_writer", %addr),
            cancel,
            task_writer(write_half, req_rx),
        );

        Ok((Self { tx: req_tx }, event_rx))
    }

    pub fn send(&self, req: TrackerRequest) -> anyhow::Result<()> {
        self.tx.send(req).context("tracker connection is gone")
    }

    pub fn register(&self, swarm_id: String, endpoint: (IpAddr, u16)) -> anyhow::Result<()> {
        self.send(TrackerRequest::Register { swarm_id, endpoint })
    }

    pub fn unregister(&self, swarm_id: String, endpoint: (IpAddr, u16)) -> anyhow::Result<()> {
        self.send(TrackerRequest::Unregister { swarm_id, endpoint })
    }
}

async fn task_reader(
    mut read_half: tokio::net::tcp::OwnedReadHalf,
    event_tx: UnboundedSender<TrackerEvent>,
) -> anyhow::Result<()> {
    let mut framer = StreamFramer::new();
    let mut buf = vec![0u8; 4096];
    loop {
        let n = read_half.read(&mut buf).await.context("tracker read error")?;
        if n == 0 {
            // Mid-run tracker loss is tolerated by the swarm.
            debug!("tracker closed the connection");
            return Ok(());
        }
        for frame in framer.data_received(&buf[..n]) {
            match serde_json::from_slice::<TrackerEvent>(&frame) {
                Ok(event) => {
                    debug!(?event, "tracker event");
                    if event_tx.send(event).is_err() {
                        return Ok(());
                    }
                }
                Err(e) => warn!("ignoring undecodable tracker message: {e:#}"),
            }
        }
    }
}

async fn task_writer(
    mut write_half: tokio::net::tcp::OwnedWriteHalf,
    mut req_rx: UnboundedReceiver<TrackerRequest>,
) -> anyhow::Result<()> {
    while let Some(req) = req_rx.recv().await {
        let encoded = serde_json::to_vec(&req).context("error encoding tracker request")?;
        write_half
            .write_all(&frame_packet(&encoded))
            .await
            .context("tracker write error")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_shape() {
        let req = TrackerRequest::Register {
            swarm_id: "aabb".into(),
            endpoint: ("10.0.0.1".parse().unwrap(), 6778),
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["type"], "register");
        assert_eq!(json["swarm_id"], "aabb");
        assert_eq!(json["endpoint"][0], "10.0.0.1");
        assert_eq!(json["endpoint"][1], 6778);
    }

    #[test]
    fn test_event_decoding() {
        let event: TrackerEvent = serde_json::from_str(
            r#"{"type":"other_peers","swarm_id":"aabb","details":[["10.0.0.2",6778],["10.0.0.3",7000]]}"#,
        )
        .unwrap();
        match event {
            TrackerEvent::OtherPeers { swarm_id, details } => {
                assert_eq!(swarm_id, "aabb");
                assert_eq!(details.len(), 2);
                assert_eq!(details[1].1, 7000);
            }
            other => panic!("expected other_peers, got {other:?}"),
        }
    }

    #[test]
    fn test_event_round_trip_through_framer() {
        let event = TrackerEvent::NewNode {
            swarm_id: "0102".into(),
            endpoint: ("192.168.1.5".parse().unwrap(), 6778),
        };
        let encoded = serde_json::to_vec(&event).unwrap();
        let wire = frame_packet(&encoded);

        let mut framer = StreamFramer::new();
        let frames = framer.data_received(&wire);
        assert_eq!(frames.len(), 1);
        let decoded: TrackerEvent = serde_json::from_slice(&frames[0]).unwrap();
        assert_eq!(decoded, event);
    }

    #[tokio::test]
    async fn test_connect_fails_after_retries() {
        // Nothing listens on this port.
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let res = TrackerClient::connect(addr, CancellationToken::new()).await;
        assert!(res.is_err());
    }
}
