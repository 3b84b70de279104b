//! Swarm statistics: the periodic log line and the final shutdown report.

use std::collections::HashMap;
use std::time::Instant;

use crate::consumer::ConsumerStats;
use crate::peer::PeerStatsSnapshot;
use crate::storage::file::FileStorageReport;

/// Counters snapshotted at the previous stats tick, for rate computation.
pub(crate) struct IntervalStats {
    pub last_tick: Instant,
    pub chunks_rx: u64,
    pub data_rx: u64,
    pub data_tx: u64,
}

impl Default for IntervalStats {
    fn default() -> Self {
        Self {
            last_tick: Instant::now(),
            chunks_rx: 0,
            data_rx: 0,
            data_tx: 0,
        }
    }
}

/// Written as JSON at shutdown.
#[derive(Debug, serde::Serialize)]
pub struct SwarmShutdownReport {
    pub swarm_id: String,
    pub live: bool,
    pub live_source: bool,
    pub vod: bool,
    pub data_tx: u64,
    pub data_rx: u64,
    pub data_chunks_rx: u64,
    pub rx_discarded: u64,
    pub start_time: f64,
    pub close_time: f64,
    pub member_stats: HashMap<String, PeerStatsSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_storage: Option<FileStorageReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_consumer: Option<ConsumerStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_args: Option<serde_json::Value>,
}
