//! Live content consumer.
//!
//! Reassembled application frames go into a bounded queue; a dedicated worker
//! thread pops one per tick at the playback frame rate. Only the queue and
//! two scalars (the playback-started flag and the last shown chunk id) cross
//! the thread boundary; everything else stays on the event loop side.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use parking_lot::Mutex;
use ppspp_core::chunks::{ChunkId, ChunkRange};
use ppspp_core::framer::ContentFramer;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy)]
pub struct ConsumerOptions {
    /// Playback rate, frames per second.
    pub fps: u32,
    /// Frames buffered before playback starts.
    pub buffer_frames: usize,
    /// Start at the first recognizable frame boundary instead of chunk 0.
    pub allow_tune_in: bool,
    /// Skip forward to the next frame boundary after a stall.
    pub skip_on_stall: bool,
    /// Consecutive missed frames that trigger a skip.
    pub miss_threshold: u64,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            fps: 10,
            buffer_frames: 500,
            allow_tune_in: false,
            skip_on_stall: false,
            miss_threshold: 10,
        }
    }
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ConsumerStats {
    pub frames_consumed: u64,
    pub frames_missed: u64,
    pub consume_runs: u64,
    pub chunks_skipped: u64,
    pub first_frame_time: Option<f64>,
    pub buffer_start_time: Option<f64>,
    pub stop_time: Option<f64>,
    pub playback_start_chunk: Option<ChunkId>,
}

/// State shared with the worker thread.
struct Shared {
    queue: Mutex<VecDeque<(Bytes, ChunkRange)>>,
    playback_started: AtomicBool,
    last_showed_chunk: Mutex<Option<ChunkId>>,
    frames_consumed: AtomicU64,
    frames_missed: AtomicU64,
    consume_runs: AtomicU64,
    missed_streak: AtomicU64,
    skip_requested: AtomicBool,
    first_frame_time: Mutex<Option<SystemTime>>,
    stop: AtomicBool,
}

pub struct ContentConsumer {
    opts: ConsumerOptions,
    shared: Arc<Shared>,
    framer: ContentFramer,
    /// Next chunk id that should go to the framer.
    next_frame: ChunkId,
    /// Biggest chunk id ever seen.
    biggest_seen: ChunkId,
    /// Locked onto the data stream (tune-in resolved).
    locked: bool,
    chunks_skipped: u64,
    playback_start_chunk: Option<ChunkId>,
    buffer_start_time: Option<SystemTime>,
    stop_time: Option<SystemTime>,
    worker: Option<std::thread::JoinHandle<()>>,
}

fn unix_secs(t: Option<SystemTime>) -> Option<f64> {
    t.and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
        .map(|d| d.as_secs_f64())
}

impl ContentConsumer {
    pub fn new(opts: ConsumerOptions) -> Self {
        ContentConsumer {
            opts,
            shared: Arc::new(Shared {
                queue: Mutex::new(VecDeque::new()),
                playback_started: AtomicBool::new(false),
                last_showed_chunk: Mutex::new(None),
                frames_consumed: AtomicU64::new(0),
                frames_missed: AtomicU64::new(0),
                consume_runs: AtomicU64::new(0),
                missed_streak: AtomicU64::new(0),
                skip_requested: AtomicBool::new(false),
                first_frame_time: Mutex::new(None),
                stop: AtomicBool::new(false),
            }),
            framer: ContentFramer::new(),
            next_frame: 0,
            biggest_seen: 0,
            locked: false,
            chunks_skipped: 0,
            playback_start_chunk: None,
            buffer_start_time: None,
            stop_time: None,
            worker: None,
        }
    }

    /// Spawn the consumption worker.
    pub fn start(&mut self) {
        if self.worker.is_some() {
            warn!("content consumer already running");
            return;
        }
        self.buffer_start_time = Some(SystemTime::now());
        let shared = self.shared.clone();
        let opts = self.opts;
        self.worker = Some(
            std::thread::Builder::new()
                .name("cont_consume".into())
                .spawn(move || consume_thread(shared, opts))
                .expect("failed to spawn consumer thread"),
        );
    }

    pub fn playback_started(&self) -> bool {
        self.shared.playback_started.load(Ordering::Relaxed)
    }

    /// Next chunk id the consumer expects; the VOD forward window hangs off
    /// this.
    pub fn next_frame(&self) -> ChunkId {
        self.next_frame
    }

    /// Feed one received chunk (with its discard-eligible marker byte).
    /// `lookup` fetches already stored chunks when filling a gap or scanning
    /// for a skip target.
    pub fn data_received(
        &mut self,
        chunk_id: ChunkId,
        chunk_data: &[u8],
        lookup: &mut dyn FnMut(ChunkId) -> Option<Bytes>,
    ) {
        if chunk_data.is_empty() {
            return;
        }

        if self.shared.skip_requested.swap(false, Ordering::Relaxed) {
            self.skip_forward(lookup);
        }

        // Tune-in: accept nothing until a frame boundary at or past our
        // position shows up.
        if self.opts.allow_tune_in && !self.locked {
            if chunk_data[0] == 0 && chunk_id >= self.next_frame {
                self.next_frame = chunk_id;
                self.locked = true;
                info!(chunk_id, "locked content consumer onto stream");
            } else {
                self.next_frame = chunk_id + 1;
                return;
            }
        }

        if chunk_id > self.biggest_seen {
            self.biggest_seen = chunk_id;
        }

        if chunk_id == self.next_frame {
            self.feed_framer(&chunk_data[1..], chunk_id);
            self.next_frame += 1;
        }

        // Fill any gap from storage.
        while self.biggest_seen > self.next_frame {
            let Some(chunk) = lookup(self.next_frame) else {
                break;
            };
            let id = self.next_frame;
            self.feed_framer(&chunk[1..], id);
            self.next_frame += 1;
        }
    }

    fn feed_framer(&mut self, payload: &[u8], chunk_id: ChunkId) {
        for (frame, range) in self.framer.data_received(payload, chunk_id) {
            debug!(start = range.start, end = range.end, "frame recreated");
            if self.playback_start_chunk.is_none() {
                self.playback_start_chunk = Some(range.start);
            }
            self.shared.queue.lock().push_back((frame, range));
        }
    }

    /// Find the next frame boundary (marker byte 0) and resume there,
    /// dropping the partial frame and everything queued.
    fn skip_forward(&mut self, lookup: &mut dyn FnMut(ChunkId) -> Option<Bytes>) {
        let mut id = self.next_frame;
        while id <= self.biggest_seen {
            if let Some(chunk) = lookup(id) {
                if !chunk.is_empty() && chunk[0] == 0 {
                    break;
                }
            }
            id += 1;
        }
        if id == self.next_frame {
            return;
        }
        warn!(from = self.next_frame, to = id, "skipping forward after stall");
        self.chunks_skipped += (id - self.next_frame) as u64;
        self.next_frame = id;
        self.framer.clear();
        self.shared.queue.lock().clear();
    }

    /// Stop the worker and collect statistics.
    pub fn stop(&mut self) -> ConsumerStats {
        self.shared.stop.store(true, Ordering::Relaxed);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        self.stop_time = Some(SystemTime::now());
        self.stats()
    }

    pub fn stats(&self) -> ConsumerStats {
        ConsumerStats {
            frames_consumed: self.shared.frames_consumed.load(Ordering::Relaxed),
            frames_missed: self.shared.frames_missed.load(Ordering::Relaxed),
            consume_runs: self.shared.consume_runs.load(Ordering::Relaxed),
            chunks_skipped: self.chunks_skipped,
            first_frame_time: unix_secs(*self.shared.first_frame_time.lock()),
            buffer_start_time: unix_secs(self.buffer_start_time),
            stop_time: unix_secs(self.stop_time),
            playback_start_chunk: self.playback_start_chunk,
        }
    }
}

impl Drop for ContentConsumer {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Relaxed);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn consume_thread(shared: Arc<Shared>, opts: ConsumerOptions) {
    // Buffer before playing.
    while shared.queue.lock().len() < opts.buffer_frames {
        if shared.stop.load(Ordering::Relaxed) {
            return;
        }
        std::thread::sleep(Duration::from_millis(250));
    }

    let tick = Duration::from_secs_f64(1.0 / opts.fps as f64);
    while !shared.stop.load(Ordering::Relaxed) {
        shared.consume_runs.fetch_add(1, Ordering::Relaxed);

        let popped = shared.queue.lock().pop_front();
        match popped {
            Some((_frame, range)) => {
                {
                    let mut first = shared.first_frame_time.lock();
                    if first.is_none() {
                        *first = Some(SystemTime::now());
                        info!("first frame consumed");
                    }
                }
                shared.playback_started.store(true, Ordering::Relaxed);
                shared.frames_consumed.fetch_add(1, Ordering::Relaxed);
                shared.missed_streak.store(0, Ordering::Relaxed);
                *shared.last_showed_chunk.lock() = Some(range.end);
            }
            None => {
                // Misses only count once playback has begun.
                if shared.playback_started.load(Ordering::Relaxed) {
                    shared.frames_missed.fetch_add(1, Ordering::Relaxed);
                    let streak = shared.missed_streak.fetch_add(1, Ordering::Relaxed) + 1;
                    if opts.skip_on_stall && streak >= opts.miss_threshold {
                        shared.skip_requested.store(true, Ordering::Relaxed);
                        shared.missed_streak.store(0, Ordering::Relaxed);
                    }
                }
            }
        }
        std::thread::sleep(tick);
    }
}
