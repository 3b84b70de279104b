//! ALTO (RFC 7285) cost lookup: fetches the network map and cost map over
//! HTTP and turns them into a cost-ordered peer list the live chunk selector
//! can prefer over random order.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::swarm::Swarm;

const ALTO_REFRESH: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub struct AltoOptions {
    /// Base URL of the ALTO server, e.g. `http://alto.example.net`.
    pub server: String,
    /// Cost metric path component, e.g. `routingcost`.
    pub cost_metric: String,
    /// Our own address, for the cost-from side.
    pub local_ip: IpAddr,
}

#[derive(Debug, Deserialize)]
struct NetworkMapResponse {
    #[serde(rename = "network-map")]
    network_map: HashMap<String, NetworkMapEntry>,
}

#[derive(Debug, Deserialize)]
struct NetworkMapEntry {
    #[serde(default)]
    ipv4: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct CostMapResponse {
    #[serde(rename = "cost-map")]
    cost_map: HashMap<String, HashMap<String, f64>>,
}

/// IPv4 prefix parsed out of `a.b.c.d/len`.
#[derive(Debug, Clone, Copy)]
struct Subnet {
    network: u32,
    mask: u32,
}

impl Subnet {
    fn parse(s: &str) -> Option<Self> {
        let (addr, len) = s.split_once('/')?;
        let addr: Ipv4Addr = addr.parse().ok()?;
        let len: u32 = len.parse().ok()?;
        if len > 32 {
            return None;
        }
        let mask = if len == 0 { 0 } else { u32::MAX << (32 - len) };
        Some(Subnet {
            network: u32::from(addr) & mask,
            mask,
        })
    }

    fn contains(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip) & self.mask == self.network
    }
}

pub struct AltoClient {
    opts: AltoOptions,
    http: reqwest::Client,
    network_map: Vec<(String, Vec<Subnet>)>,
    cost_map: HashMap<String, HashMap<String, f64>>,
}

impl AltoClient {
    pub fn new(opts: AltoOptions) -> Self {
        AltoClient {
            opts,
            http: reqwest::Client::new(),
            network_map: Vec::new(),
            cost_map: HashMap::new(),
        }
    }

    pub async fn refresh(&mut self) -> anyhow::Result<()> {
        let url = format!("{}/networkmap", self.opts.server);
        let nm: NetworkMapResponse = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {url}"))?
            .json()
            .await
            .context("error decoding network map")?;
        self.network_map = nm
            .network_map
            .into_iter()
            .map(|(pid, entry)| {
                let subnets = entry
                    .ipv4
                    .iter()
                    .filter_map(|s| Subnet::parse(s))
                    .collect();
                (pid, subnets)
            })
            .collect();

        let url = format!(
            "{}/costmap/numerical/{}",
            self.opts.server, self.opts.cost_metric
        );
        let cm: CostMapResponse = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {url}"))?
            .json()
            .await
            .context("error decoding cost map")?;
        self.cost_map = cm.cost_map;
        Ok(())
    }

    fn pid_of(&self, ip: IpAddr) -> Option<&str> {
        let IpAddr::V4(ip) = ip else {
            return None;
        };
        self.network_map
            .iter()
            .find(|(_, subnets)| subnets.iter().any(|s| s.contains(ip)))
            .map(|(pid, _)| pid.as_str())
    }

    pub fn cost_between(&self, from: IpAddr, to: IpAddr) -> Option<f64> {
        let from_pid = self.pid_of(from)?;
        let to_pid = self.pid_of(to)?;
        self.cost_map.get(from_pid)?.get(to_pid).copied()
    }

    /// Endpoints sorted by ascending routing cost from us; unknown costs go
    /// last.
    pub fn order_by_cost(&self, peers: &[SocketAddr]) -> Vec<SocketAddr> {
        let mut with_cost: Vec<(f64, SocketAddr)> = peers
            .iter()
            .map(|addr| {
                (
                    self.cost_between(self.opts.local_ip, addr.ip())
                        .unwrap_or(f64::MAX),
                    *addr,
                )
            })
            .collect();
        with_cost.sort_by(|a, b| a.0.total_cmp(&b.0));
        with_cost.into_iter().map(|(_, addr)| addr).collect()
    }
}

pub(crate) async fn task_alto_refresh(swarm: Arc<Swarm>, opts: AltoOptions) -> anyhow::Result<()> {
    let mut client = AltoClient::new(opts);
    let mut interval = tokio::time::interval(ALTO_REFRESH);
    loop {
        interval.tick().await;
        if let Err(e) = client.refresh().await {
            warn!("alto refresh failed: {e:#}");
            continue;
        }
        let known: Vec<SocketAddr> = {
            let inner = swarm.inner.lock();
            inner.known_peers.iter().copied().collect()
        };
        let ordered = client.order_by_cost(&known);
        debug!(peers = ordered.len(), "alto cost order updated");
        swarm.inner.lock().alto_order = Some(ordered);
    }
}
