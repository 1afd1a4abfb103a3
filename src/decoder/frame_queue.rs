//! Frame buffering and pacing for smooth playback
//!
//! The decode thread pushes frames into a bounded lock-free queue; the
//! presentation thread polls a [`FramePacer`] once per tick. Pixel buffers
//! cycle through a per-screen pool so steady-state playback does not allocate.

use crate::renderer::VideoFrame;
use crossbeam::queue::ArrayQueue;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Bounded single-producer/single-consumer frame queue with a buffer pool
pub struct FrameQueue {
    /// Decoded frames in decode order
    frames: ArrayQueue<VideoFrame>,

    /// Idle pixel buffers
    pool: ArrayQueue<Vec<u32>>,

    /// Buffers handed out since the last reset
    allocated: AtomicUsize,

    /// Pixels per buffer for the current session
    pixels: AtomicUsize,

    /// Frames required before the clock starts
    preroll: usize,

    /// Monotonic ns the playback clock started at, 0 while unset
    playback_start_ns: AtomicU64,

    /// Statistics
    stats: Mutex<QueueStats>,
}

/// Queue statistics for monitoring
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueStats {
    /// Total frames added
    pub frames_added: u64,

    /// Total frames dropped because the queue was full
    pub frames_dropped: u64,

    /// Total frames handed to the consumer
    pub frames_consumed: u64,

    /// Average queue depth (exponential moving average)
    pub avg_depth: f32,

    /// Maximum queue depth reached
    pub max_depth: usize,
}

impl QueueStats {
    fn observe_depth(&mut self, depth: usize) {
        const ALPHA: f32 = 0.1;
        self.avg_depth = self.avg_depth * (1.0 - ALPHA) + depth as f32 * ALPHA;
        self.max_depth = self.max_depth.max(depth);
    }
}

impl FrameQueue {
    /// Create a queue holding `capacity` frames, backed by `pool_size` buffers
    pub fn new(capacity: usize, pool_size: usize, preroll: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: ArrayQueue::new(capacity),
            pool: ArrayQueue::new(pool_size.max(capacity)),
            allocated: AtomicUsize::new(0),
            pixels: AtomicUsize::new(0),
            preroll: preroll.clamp(1, capacity),
            playback_start_ns: AtomicU64::new(0),
            stats: Mutex::new(QueueStats::default()),
        }
    }

    /// Prepare for a new session producing `pixels`-sized frames
    ///
    /// Drops queued frames and idle buffers and re-arms pre-roll.
    pub fn reset(&self, pixels: usize) {
        while self.frames.pop().is_some() {}
        while self.pool.pop().is_some() {}
        self.pixels.store(pixels, Ordering::SeqCst);
        self.allocated.store(0, Ordering::SeqCst);
        self.playback_start_ns.store(0, Ordering::SeqCst);
    }

    /// Drop queued frames into the pool and re-arm pre-roll
    pub fn clear(&self) {
        while let Some(frame) = self.frames.pop() {
            self.return_buffer(frame.pixels);
        }
        self.playback_start_ns.store(0, Ordering::SeqCst);
    }

    /// Take an idle buffer, allocating while under the pool size
    ///
    /// `None` when every buffer is on loan.
    pub fn borrow_buffer(&self) -> Option<Vec<u32>> {
        if let Some(buf) = self.pool.pop() {
            return Some(buf);
        }
        let pixels = self.pixels.load(Ordering::SeqCst);
        if pixels == 0 {
            return None;
        }
        let limit = self.pool.capacity();
        self.allocated
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < limit).then_some(n + 1))
            .ok()
            .map(|_| vec![0u32; pixels])
    }

    /// Give a buffer back; buffers of another session's size are dropped
    pub fn return_buffer(&self, buf: Vec<u32>) {
        if buf.len() == self.pixels.load(Ordering::SeqCst) {
            let _ = self.pool.push(buf);
        }
    }

    /// Enqueue a frame, handing it back if the queue is full
    pub fn push(&self, frame: VideoFrame) -> Result<(), VideoFrame> {
        let result = self.frames.push(frame);
        let mut stats = self.stats.lock();
        match result {
            Ok(()) => {
                stats.frames_added += 1;
                stats.observe_depth(self.frames.len());
            }
            Err(_) => stats.frames_dropped += 1,
        }
        result
    }

    pub fn pop(&self) -> Option<VideoFrame> {
        let frame = self.frames.pop()?;
        let mut stats = self.stats.lock();
        stats.frames_consumed += 1;
        stats.observe_depth(self.frames.len());
        Some(frame)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.frames.capacity()
    }

    pub fn preroll(&self) -> usize {
        self.preroll
    }

    /// Producer backpressure predicate
    pub fn can_accept_frame(&self) -> bool {
        self.frames.len() < self.frames.capacity()
    }

    /// Pre-roll satisfied, or the clock already running
    pub fn is_buffer_ready(&self) -> bool {
        self.is_clock_started() || self.frames.len() >= self.preroll
    }

    pub fn is_clock_started(&self) -> bool {
        self.playback_start_ns.load(Ordering::SeqCst) != 0
    }

    pub fn playback_start_ns(&self) -> u64 {
        self.playback_start_ns.load(Ordering::SeqCst)
    }

    /// Start the playback clock unless it already runs; returns the effective start
    pub fn start_clock(&self, now_ns: u64) -> u64 {
        let now_ns = now_ns.max(1);
        match self
            .playback_start_ns
            .compare_exchange(0, now_ns, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => now_ns,
            Err(existing) => existing,
        }
    }

    pub fn stats(&self) -> QueueStats {
        self.stats.lock().clone()
    }
}

/// Result of one presentation poll
#[derive(Debug)]
pub enum PaceOutcome {
    /// Pre-roll not yet satisfied
    Buffering,

    /// Nothing due this tick
    Idle,

    /// Latest due frame; its buffer must be returned to the queue afterwards
    Present(VideoFrame),
}

/// Presentation-side pacing against the playback clock
#[derive(Debug, Default)]
pub struct FramePacer {
    /// Head frame popped but not yet due
    pending: Option<VideoFrame>,

    presented: u64,
    collapsed: u64,
}

impl FramePacer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Non-blocking: drain every due frame and return the latest
    ///
    /// Superseded due frames are recycled straight away so a late consumer
    /// catches up instead of replaying a backlog.
    pub fn poll(&mut self, queue: &FrameQueue, now_ns: u64) -> PaceOutcome {
        let mut start = queue.playback_start_ns();
        if start == 0 {
            let depth = queue.len() + self.pending.is_some() as usize;
            if depth < queue.preroll() {
                return PaceOutcome::Buffering;
            }
            start = queue.start_clock(now_ns);
        }

        let elapsed_us = (now_ns.saturating_sub(start) / 1_000) as i64;
        let mut due: Option<VideoFrame> = None;

        loop {
            let next = match self.pending.take().or_else(|| queue.pop()) {
                Some(frame) => frame,
                None => break,
            };
            if next.timestamp_us > elapsed_us {
                self.pending = Some(next);
                break;
            }
            if let Some(stale) = due.replace(next) {
                self.collapsed += 1;
                queue.return_buffer(stale.pixels);
            }
        }

        match due {
            Some(frame) => {
                self.presented += 1;
                PaceOutcome::Present(frame)
            }
            None => PaceOutcome::Idle,
        }
    }

    /// Forget the held frame, returning its buffer
    pub fn reset(&mut self, queue: &FrameQueue) {
        if let Some(frame) = self.pending.take() {
            queue.return_buffer(frame.pixels);
        }
    }

    /// Frames presented since creation
    pub fn presented(&self) -> u64 {
        self.presented
    }

    /// Due frames skipped because a later one was also due
    pub fn collapsed(&self) -> u64 {
        self.collapsed
    }
}
