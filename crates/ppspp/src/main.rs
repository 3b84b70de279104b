use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use libppspp::{alto::AltoOptions, Hive, HiveOptions, SwarmOptions, TransportMode};
use ppspp_core::constants::{DEFAULT_PEER_PORT, DEFAULT_TRACKER_PORT};
use ppspp_core::SwarmId;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Transport {
    /// UDP datagrams with LEDBAT congestion control.
    Udp,
    /// Length-prefix framed TCP streams.
    Tcp,
}

#[derive(Parser, Debug)]
#[command(version, author, about = "PPSPP [RFC7574] swarming client")]
struct Opts {
    /// Tracker rendezvous server, ip or ip:port.
    #[arg(short = 't', long, env = "PPSPP_TRACKER")]
    tracker: String,

    /// Hex-encoded swarm identifier (the Merkle root hash for static files).
    #[arg(short = 's', long = "swarmid", env = "PPSPP_SWARM_ID")]
    swarm_id: SwarmId,

    /// Backing file for static content.
    #[arg(short = 'f', long, required_unless_present_any = ["live", "vod"])]
    filename: Option<PathBuf>,

    /// Expected size of the static file in bytes.
    #[arg(short = 'z', long, default_value = "0")]
    filesize: u64,

    /// Join a live stream.
    #[arg(short = 'l', long, conflicts_with = "vod")]
    live: bool,

    /// Act as the source of the live stream.
    #[arg(long = "live-src", requires = "live")]
    live_source: bool,

    /// Video-on-demand: consume while downloading.
    #[arg(long)]
    vod: bool,

    /// Maximum number of peers in the swarm.
    #[arg(long = "numpeers")]
    max_peers: Option<usize>,

    /// Live discard window in chunks.
    #[arg(long = "discardwnd")]
    discard_window: Option<u32>,

    /// Do not request chunks further than this past the playback position.
    #[arg(long = "dlfwd")]
    download_forward_window: Option<u32>,

    /// Frames buffered before playback starts.
    #[arg(long = "bufsz", default_value = "500")]
    video_buffer: usize,

    /// Tune in at the next frame boundary instead of the stream start.
    #[arg(long = "tunein")]
    tune_in: bool,

    /// Skip forward after a playback stall.
    #[arg(long = "skip")]
    skip: bool,

    /// Peer transport.
    #[arg(long, value_enum, default_value = "udp")]
    transport: Transport,

    /// Listen port for peer connections.
    #[arg(long = "port", default_value_t = DEFAULT_PEER_PORT)]
    listen_port: u16,

    /// Listen address for peer connections.
    #[arg(long = "ip", default_value = "0.0.0.0")]
    listen_ip: IpAddr,

    /// ALTO server base URL; enables cost-ordered peer selection.
    #[arg(long)]
    alto: Option<String>,

    /// ALTO cost metric.
    #[arg(long = "alto-metric", default_value = "routingcost")]
    alto_metric: String,

    /// Where to write the shutdown report.
    #[arg(long = "report", default_value = "ppspp-report.json")]
    report_path: PathBuf,

    /// Directive for the log filter, e.g. "libppspp=debug,info".
    #[arg(long = "log", env = "PPSPP_LOG")]
    log: Option<String>,
}

fn parse_tracker_addr(s: &str) -> anyhow::Result<SocketAddr> {
    if let Ok(addr) = s.parse::<SocketAddr>() {
        return Ok(addr);
    }
    let ip: IpAddr = s
        .parse()
        .with_context(|| format!("invalid tracker address {s:?}"))?;
    Ok(SocketAddr::new(ip, DEFAULT_TRACKER_PORT))
}

fn init_logging(directive: Option<&str>) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(directive.unwrap_or("info")))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .init();
}

/// Synthetic talking-head frames for driving a live source without a real
/// capture pipeline: key frame every second, delta frames in between.
async fn task_content_generator(swarm: std::sync::Arc<libppspp::Swarm>) -> anyhow::Result<()> {
    const FPS: u32 = 10;
    let mut interval = tokio::time::interval(Duration::from_secs(1) / FPS);
    let mut seq: u64 = 0;
    loop {
        interval.tick().await;
        let size = if seq % FPS as u64 == 0 { 9000 } else { 1500 };
        let mut frame = vec![0xc0u8; size];
        frame[..8].copy_from_slice(&seq.to_be_bytes());
        swarm.inject_frame(&frame)?;
        seq += 1;
    }
}

fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();
    init_logging(opts.log.as_deref());

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("error building tokio runtime")?;
    let result = rt.block_on(async_main(opts));
    if let Err(e) = &result {
        error!("fatal: {e:#}");
    }
    result
}

async fn async_main(opts: Opts) -> anyhow::Result<()> {
    info!(
        tracker = %opts.tracker,
        swarm = %opts.swarm_id,
        live = opts.live,
        live_source = opts.live_source,
        vod = opts.vod,
        "ppspp starting"
    );

    let tracker_addr = parse_tracker_addr(&opts.tracker)?;

    let hive = Hive::new(HiveOptions {
        transport: match opts.transport {
            Transport::Udp => TransportMode::Datagram,
            Transport::Tcp => TransportMode::Stream,
        },
        listen_ip: opts.listen_ip,
        listen_port: opts.listen_port,
    })
    .await?;

    let mut swarm_opts = SwarmOptions::new(opts.swarm_id.clone());
    swarm_opts.live = opts.live;
    swarm_opts.live_source = opts.live_source;
    swarm_opts.vod = opts.vod;
    swarm_opts.filename = opts.filename.clone();
    swarm_opts.file_size = opts.filesize;
    swarm_opts.discard_window = opts.discard_window;
    swarm_opts.download_forward_window = opts.download_forward_window;
    swarm_opts.max_peers = opts.max_peers;
    swarm_opts.video_buffer_frames = opts.video_buffer;
    swarm_opts.allow_tune_in = opts.tune_in;
    swarm_opts.skip_on_stall = opts.skip;
    swarm_opts.alto = opts.alto.clone().map(|server| AltoOptions {
        server,
        cost_metric: opts.alto_metric.clone(),
        local_ip: opts.listen_ip,
    });

    let swarm = hive.create_swarm(swarm_opts).await?;

    // Tracker: fatal at startup, tolerated afterwards.
    let (tracker, tracker_events) =
        tracker_comms::TrackerClient::connect(tracker_addr, hive.cancel_token())
            .await
            .context("giving up on the tracker")?;
    let endpoint = (opts.listen_ip, opts.listen_port);
    tracker.register(opts.swarm_id.as_string(), endpoint)?;
    swarm.attach_tracker(tracker_events);

    if opts.live_source {
        ppspp_core::spawn_utils::spawn_with_cancel(
            tracing::debug_span!("content_generator"),
            hive.cancel_token(),
            task_content_generator(swarm.clone()),
        );
    }

    tokio::signal::ctrl_c()
        .await
        .context("error waiting for ctrl-c")?;
    info!("shutting down");

    if let Err(e) = tracker.unregister(opts.swarm_id.as_string(), endpoint) {
        warn!("tracker unregister failed: {e:#}");
    }

    let run_args = serde_json::json!({
        "tracker": opts.tracker,
        "swarm_id": opts.swarm_id.as_string(),
        "live": opts.live,
        "live_source": opts.live_source,
        "vod": opts.vod,
        "filesize": opts.filesize,
        "transport": format!("{:?}", opts.transport),
    });
    let reports = hive.shutdown(Some(run_args)).await;
    let json = serde_json::to_string_pretty(&reports)?;
    std::fs::write(&opts.report_path, json)
        .with_context(|| format!("error writing report to {}", opts.report_path.display()))?;
    info!(path = %opts.report_path.display(), "wrote shutdown report");
    Ok(())
}
