//! Decode sessions
//!
//! A [`DecodeSession`] owns at most one worker thread per screen. Each start
//! takes a fresh id from the shared [`SessionToken`]; every callback the
//! worker makes goes through a guard that drops it once the id is stale, so a
//! superseded worker can never touch the screen again.

use crate::audio::{AudioBackend, AudioHandle, AudioPipeline, CpalAudioBackend};
use crate::cache::{CachedMeta, DiskCache, DownloadListener, DownloadProgress, MetaCache};
use crate::decoder::{
    target_size, FfmpegBackend, FrameSink, MediaBackend, MediaInput, RasterLimits, StreamMeta, Unit, VideoInit,
};
use crate::net::{is_http, strip_fragment, HttpClient, ReqwestClient, Resolver};
use crate::renderer::{bgr24_to_abgr, VideoFrame};
use crate::sync::ServerClock;
use crate::utils::config::Config;
use crate::utils::error::{CollinsError, Result};
use crate::utils::{monotonic_ns, Liveness};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use log::{debug, error, info, warn};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Bounded wait for a stopping worker
const STOP_JOIN_TIMEOUT: Duration = Duration::from_millis(500);

const BACKOFF_BASE_MS: u64 = 500;
const BACKOFF_CAP_MS: u64 = 10_000;

/// Native seeks landing closer than this to the target are accepted as is
const SKIP_TOLERANCE_US: i64 = 50_000;

/// Wall-clock budget for skipping frames after a seek
const MAX_SKIP_WALL: Duration = Duration::from_secs(2);

const MIN_SKIP_FRAMES: u64 = 600;
const MAX_SKIP_FRAMES: u64 = 20_000;

const PARK: Duration = Duration::from_millis(1);

/// Delay before retry number `attempt + 1` of a looping session
pub fn backoff_delay(attempt: u32) -> Duration {
    let ms = BACKOFF_BASE_MS.saturating_mul(1u64 << attempt.min(16));
    Duration::from_millis(ms.min(BACKOFF_CAP_MS))
}

/// Generation counter identifying the live session of one screen
#[derive(Debug, Default)]
pub struct SessionToken {
    live: AtomicU64,
    running: AtomicBool,
    last: AtomicU64,
}

impl SessionToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a new, strictly increasing session id and mark it live
    pub fn begin(&self) -> u64 {
        let now = monotonic_ns();
        let previous = self
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| Some(now.max(last + 1)))
            .unwrap_or(0);
        let id = now.max(previous + 1);
        self.live.store(id, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);
        id
    }

    pub fn invalidate(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.live.store(0, Ordering::SeqCst);
    }

    pub fn is_current(&self, id: u64) -> bool {
        id != 0 && self.running.load(Ordering::SeqCst) && self.live.load(Ordering::SeqCst) == id
    }

    /// Live id, 0 when none
    pub fn current(&self) -> u64 {
        self.live.load(Ordering::SeqCst)
    }
}

/// Forwards worker callbacks only while its session is current
struct GuardedSink {
    sink: Arc<dyn FrameSink>,
    token: Arc<SessionToken>,
    id: u64,
}

impl GuardedSink {
    fn live(&self) -> bool {
        self.token.is_current(self.id)
    }

    fn init_video(&self, init: VideoInit) {
        if self.live() {
            self.sink.init_video(init);
        }
    }

    fn on_frame(&self, frame: VideoFrame) {
        if self.live() {
            self.sink.on_frame(frame);
        } else {
            self.sink.return_buffer(frame.pixels);
        }
    }

    fn on_duration(&self, duration_ms: i64) {
        if self.live() {
            self.sink.on_duration(duration_ms);
        }
    }

    fn on_ended(&self, duration_ms: i64) {
        if self.live() {
            self.sink.on_ended(duration_ms);
        }
    }

    fn on_playback_clock_start(&self, start_ns: u64) {
        if self.live() {
            self.sink.on_playback_clock_start(start_ns);
        }
    }

    fn on_cached_file_used(&self, path: &Path, bytes: u64) {
        if self.live() {
            self.sink.on_cached_file_used(path, bytes);
        }
    }

    fn on_stop(&self) {
        if self.live() {
            self.sink.on_stop();
        }
    }

    /// Wait for a free pool buffer; `None` once superseded
    fn wait_for_buffer(&self) -> Option<Vec<u32>> {
        loop {
            if !self.live() {
                return None;
            }
            if let Some(buf) = self.sink.borrow_buffer() {
                return Some(buf);
            }
            thread::park_timeout(PARK);
        }
    }

    /// Park while the frame queue is full; `false` once superseded
    fn wait_for_room(&self) -> bool {
        while !self.sink.can_accept_frame() {
            if !self.live() {
                return false;
            }
            thread::park_timeout(PARK);
        }
        self.live()
    }
}

impl Liveness for GuardedSink {
    fn is_live(&self) -> bool {
        self.live()
    }
}

impl DownloadListener for GuardedSink {
    fn on_download_start(&self) {
        if self.live() {
            self.sink.on_download_start();
        }
    }

    fn on_download_progress(&self, progress: DownloadProgress) {
        if self.live() {
            self.sink.on_download_progress(progress);
        }
    }

    fn on_download_complete(&self) {
        if self.live() {
            self.sink.on_download_complete();
        }
    }
}

/// Parameters of one session start
#[derive(Debug, Clone, PartialEq)]
pub struct StartRequest {
    /// Logical source URL or local path
    pub url: String,

    /// Screen extent in blocks
    pub blocks_w: u32,
    pub blocks_h: u32,

    pub looping: bool,

    /// Timeline position to start at
    pub seek_ms: i64,

    pub gain: f32,

    /// Local time ([`ServerClock::local_now_ms`]) the seek position was computed at, 0 for none
    ///
    /// Time spent opening the source is added to the seek.
    pub request_epoch_ms: i64,
}

impl StartRequest {
    pub fn new<S: Into<String>>(url: S, blocks_w: u32, blocks_h: u32) -> Self {
        Self {
            url: url.into(),
            blocks_w,
            blocks_h,
            looping: false,
            seek_ms: 0,
            gain: 1.0,
            request_epoch_ms: 0,
        }
    }
}

/// Services shared by every session of a process
pub struct PlaybackContext {
    pub resolver: Resolver,
    pub disk: DiskCache,
    pub meta: MetaCache,
    pub media: Arc<dyn MediaBackend>,
    pub audio: Arc<dyn AudioBackend>,
    pub limits: RasterLimits,
}

impl PlaybackContext {
    pub fn new(
        config: &Config,
        http: Arc<dyn HttpClient>,
        media: Arc<dyn MediaBackend>,
        audio: Arc<dyn AudioBackend>,
    ) -> Self {
        Self {
            resolver: Resolver::new(Arc::clone(&http)),
            disk: DiskCache::new(&config.cache, http),
            meta: MetaCache::new(Duration::from_secs(config.cache.meta_ttl_secs)),
            media,
            audio,
            limits: RasterLimits::from(&config.playback),
        }
    }

    /// Context over reqwest, FFmpeg and the default audio device
    pub fn system(config: &Config) -> Self {
        let agent = config.general.user_agent.clone();
        Self::new(
            config,
            Arc::new(ReqwestClient::new(agent.clone())),
            Arc::new(FfmpegBackend::new(agent)),
            Arc::new(CpalAudioBackend::new()),
        )
    }
}

struct Worker {
    handle: JoinHandle<()>,
    done: Receiver<()>,
}

/// One screen's decode worker
pub struct DecodeSession {
    ctx: Arc<PlaybackContext>,
    sink: Arc<dyn FrameSink>,
    token: Arc<SessionToken>,
    audio: AudioHandle,
    worker: Option<Worker>,
}

impl DecodeSession {
    pub fn new(ctx: Arc<PlaybackContext>, sink: Arc<dyn FrameSink>) -> Self {
        Self {
            ctx,
            sink,
            token: Arc::new(SessionToken::new()),
            audio: AudioHandle::new(1.0),
            worker: None,
        }
    }

    /// Stop any running worker and start a new one; returns the session id
    pub fn start(&mut self, request: StartRequest) -> Result<u64> {
        self.stop();

        let id = self.token.begin();
        self.audio = AudioHandle::new(request.gain);

        let guard = GuardedSink {
            sink: Arc::clone(&self.sink),
            token: Arc::clone(&self.token),
            id,
        };
        let ctx = Arc::clone(&self.ctx);
        let audio = self.audio.clone();
        let (done_tx, done_rx) = bounded(1);

        info!("Starting decode session {} for {}", id, request.url);
        let spawned = thread::Builder::new()
            .name(format!("collins-decode-{}", id))
            .spawn(move || {
                run_worker(&ctx, &guard, &request, &audio);
                let _ = done_tx.send(());
            });

        match spawned {
            Ok(handle) => {
                self.worker = Some(Worker { handle, done: done_rx });
                Ok(id)
            }
            Err(e) => {
                self.token.invalidate();
                Err(crate::internal_error!("failed to spawn decode worker: {}", e))
            }
        }
    }

    /// Invalidate the session and wait a bounded time for the worker to exit
    pub fn stop(&mut self) {
        self.token.invalidate();
        self.audio.shutdown_now();

        let Some(worker) = self.worker.take() else {
            return;
        };
        match worker.done.recv_timeout(STOP_JOIN_TIMEOUT) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if worker.handle.join().is_err() {
                    error!("Decode worker panicked");
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!("Decode worker did not stop within {:?}, detaching", STOP_JOIN_TIMEOUT);
            }
        }
    }

    pub fn set_gain(&self, gain: f32) {
        self.audio.set_gain(gain);
    }

    /// Worker thread alive
    pub fn is_running(&self) -> bool {
        self.worker.as_ref().map(|w| !w.handle.is_finished()).unwrap_or(false)
    }

    /// Live session id, 0 when stopped
    pub fn session_id(&self) -> u64 {
        self.token.current()
    }
}

impl Drop for DecodeSession {
    fn drop(&mut self) {
        self.stop();
    }
}

/// How an attempt that did not fail ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttemptOutcome {
    Ended,
    Cancelled,
}

fn run_worker(ctx: &PlaybackContext, guard: &GuardedSink, request: &StartRequest, audio: &AudioHandle) {
    let mut attempt: u32 = 0;

    while guard.live() {
        let (seek_ms, request_epoch_ms) = if attempt == 0 {
            (request.seek_ms, request.request_epoch_ms)
        } else {
            (0, 0)
        };

        match play_once(ctx, guard, request, seek_ms, request_epoch_ms, audio) {
            Ok(outcome) => {
                debug!("Session {} attempt {} finished: {:?}", guard.id, attempt + 1, outcome);
                break;
            }
            Err(e) => {
                if !guard.live() {
                    break;
                }
                error!("Playback of {} failed (attempt {}): {}", request.url, attempt + 1, e);
                if !request.looping {
                    break;
                }
                let delay = backoff_delay(attempt);
                attempt = attempt.saturating_add(1);
                info!("Retrying {} in {:?}", request.url, delay);
                if !sleep_while_live(delay, guard) {
                    break;
                }
            }
        }
    }

    guard.on_stop();
}

fn sleep_while_live(delay: Duration, live: &dyn Liveness) -> bool {
    let deadline = Instant::now() + delay;
    while Instant::now() < deadline {
        if !live.is_live() {
            return false;
        }
        thread::sleep(Duration::from_millis(10).min(deadline.saturating_duration_since(Instant::now())));
    }
    live.is_live()
}

/// Turn a logical URL into something the demuxer can open
fn acquire(ctx: &PlaybackContext, guard: &GuardedSink, url: &str) -> Result<MediaInput> {
    if !is_http(url) {
        let path = PathBuf::from(url.strip_prefix("file://").unwrap_or(url));
        if path.is_file() {
            return Ok(MediaInput::local(path));
        }
        return Err(CollinsError::InvalidInput(format!("No such file: {}", url)));
    }

    let Some(probe) = ctx.resolver.resolve(url, guard) else {
        debug!("Probe of {} returned nothing, downloading", url);
        return download(ctx, guard, url, url);
    };

    if probe.is_error() {
        debug!("Probe of {} answered {}, downloading", url, probe.status);
        ctx.disk.clear_cooldown(url);
        return download(ctx, guard, url, url);
    }

    if probe.needs_disk_cache() {
        if let Some(file) = ctx.disk.ensure_cached(url, &probe.final_url, guard, guard) {
            return Ok(MediaInput::local(file.path));
        }
        if !guard.live() {
            return Err(CollinsError::Superseded);
        }
        ctx.disk.clear_cooldown(url);
        return download(ctx, guard, url, url);
    }

    let hint = probe.is_mp4().then(|| "mp4".to_string());
    Ok(MediaInput::remote(probe.final_url, hint))
}

fn download(ctx: &PlaybackContext, guard: &GuardedSink, key: &str, url: &str) -> Result<MediaInput> {
    match ctx.disk.ensure_cached(key, url, guard, guard) {
        Some(file) => Ok(MediaInput::local(file.path)),
        None if guard.live() => Err(CollinsError::cache_error(format!("Could not cache {}", key))),
        None => Err(CollinsError::Superseded),
    }
}

/// Frame dropping after a seek that landed early
#[derive(Debug)]
struct SeekSkipper {
    target_us: i64,
    max_frames: u64,
    skipped: u64,
    started: Instant,
}

impl SeekSkipper {
    /// `None` when the first decoded frame is already close enough
    fn arm(target_us: i64, first_us: i64, fps: f64) -> Option<Self> {
        if target_us <= 0 || first_us + SKIP_TOLERANCE_US >= target_us {
            return None;
        }
        let gap_s = (target_us - first_us) as f64 / 1_000_000.0;
        let estimate = (fps * gap_s + 120.0).max(0.0) as u64;
        Some(Self {
            target_us,
            max_frames: estimate.clamp(MIN_SKIP_FRAMES, MAX_SKIP_FRAMES),
            skipped: 0,
            started: Instant::now(),
        })
    }

    fn should_skip(&mut self, ts_us: i64) -> bool {
        if ts_us >= self.target_us - SKIP_TOLERANCE_US {
            return false;
        }
        if self.skipped >= self.max_frames || self.started.elapsed() >= MAX_SKIP_WALL {
            return false;
        }
        self.skipped += 1;
        true
    }
}

enum SkipState {
    Unarmed,
    Skipping(SeekSkipper),
    Done,
}

fn play_once(
    ctx: &PlaybackContext,
    guard: &GuardedSink,
    request: &StartRequest,
    seek_ms: i64,
    request_epoch_ms: i64,
    audio: &AudioHandle,
) -> Result<AttemptOutcome> {
    let url = strip_fragment(request.url.trim()).to_string();

    let (input, meta) = match ctx.meta.get(&url) {
        Some(cached) => {
            debug!("Metadata cache hit for {}", url);
            let input = if cached.is_local {
                MediaInput::local(&cached.source)
            } else {
                MediaInput::remote(cached.source.clone(), cached.container_hint.clone())
            };
            let meta = StreamMeta {
                width: cached.width,
                height: cached.height,
                fps: cached.fps,
                duration_ms: cached.duration_ms,
            };
            (input, meta)
        }
        None => {
            let input = acquire(ctx, guard, &url)?;
            if !guard.live() {
                return Ok(AttemptOutcome::Cancelled);
            }
            let meta = match ctx.media.probe(&input) {
                Ok(meta) => meta.normalized(),
                Err(e) => {
                    if let Some(path) = input.local_path().filter(|p| p.starts_with(ctx.disk.dir())) {
                        ctx.disk.discard(path);
                    }
                    return Err(e);
                }
            };
            ctx.meta.put(
                &url,
                CachedMeta {
                    source: input.location(),
                    is_local: input.local_path().is_some(),
                    container_hint: input.container_hint.clone(),
                    width: meta.width,
                    height: meta.height,
                    fps: meta.fps,
                    duration_ms: meta.duration_ms,
                },
            );
            (input, meta)
        }
    };

    if let Some(path) = input.local_path().filter(|p| p.starts_with(ctx.disk.dir())) {
        let bytes = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        guard.on_cached_file_used(path, bytes);
    }

    let (want_w, want_h) = target_size(request.blocks_w, request.blocks_h, meta.width, meta.height, &ctx.limits);
    let mut stream = match ctx.media.open(&input, want_w, want_h) {
        Ok(stream) => stream,
        Err(e) => {
            // Resolve afresh next time; a stream URL may have expired
            ctx.meta.invalidate(&url);
            return Err(e);
        }
    };
    if !guard.live() {
        return Ok(AttemptOutcome::Cancelled);
    }

    let open_lag_ms = if request_epoch_ms > 0 {
        (ServerClock::local_now_ms() - request_epoch_ms).max(0)
    } else {
        0
    };
    let mut target_ms = seek_ms.max(0) + open_lag_ms;
    if meta.duration_ms > 0 {
        target_ms = target_ms.min(meta.duration_ms);
    }
    let target_us = target_ms * 1_000;
    if target_us > 0 {
        debug!("Seeking {} to {} ms (open lag {} ms)", url, target_ms, open_lag_ms);
        if let Err(e) = stream.seek(target_us) {
            warn!("Seek to {} ms failed, playing from the start: {}", target_ms, e);
        }
    }

    let (width, height) = stream.target_size();
    let pixels = width as usize * height as usize;
    guard.init_video(VideoInit {
        native_width: meta.width,
        native_height: meta.height,
        target_width: width,
        target_height: height,
        fps: meta.fps,
        start_ms: target_ms,
    });
    if meta.duration_ms > 0 {
        guard.on_duration(meta.duration_ms);
    }

    let mut pipeline = match stream.audio_format() {
        Some(format) => match AudioPipeline::open(ctx.audio.as_ref(), format, audio.clone()) {
            Ok(pipeline) => Some(pipeline),
            Err(e) => {
                warn!("Audio output unavailable, playing video only: {}", e);
                None
            }
        },
        None => None,
    };

    let mut skip = if target_us > 0 { SkipState::Unarmed } else { SkipState::Done };
    let mut first_ts: Option<i64> = None;
    let mut last_rel: i64 = 0;

    loop {
        if !guard.live() {
            return Ok(AttemptOutcome::Cancelled);
        }

        let Some(unit) = stream.next_unit()? else {
            break;
        };

        match unit {
            Unit::Video {
                bgr,
                stride,
                timestamp_us,
            } => {
                if let SkipState::Unarmed = skip {
                    skip = match SeekSkipper::arm(target_us, timestamp_us, meta.fps) {
                        Some(skipper) => SkipState::Skipping(skipper),
                        None => SkipState::Done,
                    };
                }
                if let SkipState::Skipping(skipper) = &mut skip {
                    if skipper.should_skip(timestamp_us) {
                        continue;
                    }
                    debug!("Seek skipping finished after {} frames", skipper.skipped);
                    skip = SkipState::Done;
                }

                let first = *first_ts.get_or_insert(timestamp_us);
                let rel = (timestamp_us - first).max(last_rel);
                last_rel = rel;

                if !guard.wait_for_room() {
                    return Ok(AttemptOutcome::Cancelled);
                }
                let Some(mut buf) = guard.wait_for_buffer() else {
                    return Ok(AttemptOutcome::Cancelled);
                };
                buf.resize(pixels, 0);
                bgr24_to_abgr(bgr, stride, width as usize, height as usize, &mut buf);
                guard.on_frame(VideoFrame {
                    pixels: buf,
                    width,
                    height,
                    timestamp_us: rel,
                });
            }
            Unit::Audio { samples, timestamp_us } => {
                let Some(output) = pipeline.as_mut() else {
                    continue;
                };
                if !matches!(skip, SkipState::Done) && timestamp_us < target_us - SKIP_TOLERANCE_US {
                    continue;
                }

                let written = if output.is_started() {
                    output.write_samples(samples)
                } else if guard.sink.is_buffer_ready() {
                    guard.on_playback_clock_start(monotonic_ns());
                    output.start().and_then(|_| output.write_samples(samples))
                } else {
                    output.prebuffer(samples);
                    Ok(())
                };

                if let Err(e) = written {
                    warn!("Audio output failed, continuing without sound: {}", e);
                    if let Some(output) = pipeline.take() {
                        output.close();
                    }
                }
            }
        }
    }

    // Short sources may never reach pre-roll
    guard.on_playback_clock_start(monotonic_ns());
    if let Some(mut output) = pipeline.take() {
        if !output.is_started() {
            if let Err(e) = output.start() {
                debug!("Late audio start failed: {}", e);
            }
        }
        output.close();
    }

    let duration_ms = if meta.duration_ms > 0 {
        meta.duration_ms
    } else {
        target_ms + last_rel / 1_000
    };
    info!("Playback of {} reached the end at {} ms", url, duration_ms);
    guard.on_ended(duration_ms);
    Ok(AttemptOutcome::Ended)
}
