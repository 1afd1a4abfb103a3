//! One screen's playback state machine
//!
//! A [`Screen`] is driven from the presentation thread: `tick_playback`
//! reconciles its descriptor with the decode session, `render` presents due
//! frames. The decode worker only ever talks to [`ScreenShared`].

use crate::cache::{CachedFile, DownloadProgress};
use crate::decoder::{
    DecodeSession, FramePacer, FrameQueue, FrameSink, PaceOutcome, PlaybackContext, QueueStats, StartRequest,
    VideoInit, MAX_PLAUSIBLE_DURATION_MS,
};
use crate::player::state::{ScreenPhase, ScreenStatus};
use crate::renderer::{Surface, VideoFrame};
use crate::sync::{is_jump, position_ms, ScreenDescriptor, ViewerPos};
use crate::utils::config::{ClientConfig, PlaybackConfig};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Out-of-range time before audio is muted
pub const MUTE_HYSTERESIS: Duration = Duration::from_millis(250);

/// Out-of-range time before the session is torn down
pub const FREEZE_GRACE: Duration = Duration::from_secs(15);

/// How long [`Screen::is_ended`] reports a natural end
pub const ENDED_WINDOW: Duration = Duration::from_secs(5);

const GAIN_EPSILON: f32 = 0.001;

/// Everything a screen needs from the host for one tick
#[derive(Debug, Clone, Copy)]
pub struct TickInput<'a> {
    pub viewer: ViewerPos,

    /// Audibility radius in blocks, `<= 0` for unbounded
    pub hear_radius: i32,

    pub global_gain: f32,

    /// Estimated server time, 0 when unknown
    pub server_now_ms: i64,

    /// Local time the estimate was taken at
    pub local_now_ms: i64,

    pub now: Instant,
    pub client: &'a ClientConfig,
}

/// State written by the decode worker, read by the presentation thread
pub struct ScreenShared {
    queue: FrameQueue,
    pending_init: Mutex<Option<VideoInit>>,

    /// Media position the running session began at
    start_ms: AtomicI64,

    stop_pending: AtomicBool,
    duration_ms: AtomicI64,
    ended: AtomicBool,
    ended_at: Mutex<Option<Instant>>,
    downloading: AtomicBool,
    download: Mutex<Option<DownloadProgress>>,
    cached_file: Mutex<Option<CachedFile>>,
}

impl ScreenShared {
    fn new(playback: &PlaybackConfig) -> Self {
        Self {
            queue: FrameQueue::new(playback.queue_capacity, playback.pool_size, playback.preroll_frames),
            pending_init: Mutex::new(None),
            start_ms: AtomicI64::new(0),
            stop_pending: AtomicBool::new(false),
            duration_ms: AtomicI64::new(0),
            ended: AtomicBool::new(false),
            ended_at: Mutex::new(None),
            downloading: AtomicBool::new(false),
            download: Mutex::new(None),
            cached_file: Mutex::new(None),
        }
    }

    pub fn queue(&self) -> &FrameQueue {
        &self.queue
    }

    fn reset_ended(&self) {
        self.ended.store(false, Ordering::SeqCst);
        *self.ended_at.lock() = None;
    }
}

impl FrameSink for ScreenShared {
    fn init_video(&self, init: VideoInit) {
        self.queue.reset(init.pixels());
        self.start_ms.store(init.start_ms, Ordering::SeqCst);
        *self.pending_init.lock() = Some(init);
    }

    fn on_frame(&self, frame: VideoFrame) {
        if let Err(rejected) = self.queue.push(frame) {
            self.queue.return_buffer(rejected.pixels);
        }
    }

    fn on_duration(&self, duration_ms: i64) {
        if duration_ms > 0 && duration_ms <= MAX_PLAUSIBLE_DURATION_MS {
            self.duration_ms.store(duration_ms, Ordering::SeqCst);
        }
    }

    fn on_ended(&self, duration_ms: i64) {
        self.on_duration(duration_ms);
        *self.ended_at.lock() = Some(Instant::now());
        self.ended.store(true, Ordering::SeqCst);
    }

    fn on_stop(&self) {
        self.stop_pending.store(true, Ordering::SeqCst);
    }

    fn on_playback_clock_start(&self, start_ns: u64) {
        self.queue.start_clock(start_ns);
    }

    fn on_download_start(&self) {
        *self.download.lock() = None;
        self.downloading.store(true, Ordering::SeqCst);
    }

    fn on_download_progress(&self, progress: DownloadProgress) {
        *self.download.lock() = Some(progress);
    }

    fn on_download_complete(&self) {
        self.downloading.store(false, Ordering::SeqCst);
    }

    fn on_cached_file_used(&self, path: &Path, bytes: u64) {
        *self.cached_file.lock() = Some(CachedFile {
            path: path.to_path_buf(),
            bytes,
        });
    }

    fn borrow_buffer(&self) -> Option<Vec<u32>> {
        self.queue.borrow_buffer()
    }

    fn return_buffer(&self, buf: Vec<u32>) {
        self.queue.return_buffer(buf);
    }

    fn can_accept_frame(&self) -> bool {
        self.queue.can_accept_frame()
    }

    fn is_buffer_ready(&self) -> bool {
        self.queue.is_buffer_ready()
    }
}

/// A named display surface playing one source
pub struct Screen {
    descriptor: ScreenDescriptor,
    shared: Arc<ScreenShared>,
    session: DecodeSession,
    surface: Box<dyn Surface>,
    pacer: FramePacer,

    /// Configured surface size
    surface_size: Option<(u32, u32)>,

    /// A worker was started and has not been observed to exit
    session_active: bool,

    /// URL of the current or last session
    active_url: Option<String>,

    /// Last session exited without reaching the end
    failed: bool,

    /// Display position held while out of range
    frozen_ms: Option<i64>,

    out_of_range_since: Option<Instant>,
    muted: bool,
    applied_gain: Option<f32>,
}

impl Screen {
    pub fn new(
        descriptor: ScreenDescriptor,
        ctx: Arc<PlaybackContext>,
        playback: &PlaybackConfig,
        surface: Box<dyn Surface>,
    ) -> Self {
        let shared = Arc::new(ScreenShared::new(playback));
        let session = DecodeSession::new(ctx, Arc::clone(&shared) as Arc<dyn FrameSink>);
        Self {
            descriptor,
            shared,
            session,
            surface,
            pacer: FramePacer::new(),
            surface_size: None,
            session_active: false,
            active_url: None,
            failed: false,
            frozen_ms: None,
            out_of_range_since: None,
            muted: false,
            applied_gain: None,
        }
    }

    pub fn descriptor(&self) -> &ScreenDescriptor {
        &self.descriptor
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    /// Replace the descriptor after a sync
    ///
    /// An anchor jump of 250 ms or more soft-stops the session and the next
    /// tick restarts it at the new position. A new URL restarts on the next tick.
    pub fn update_state(&mut self, descriptor: ScreenDescriptor, server_now_ms: i64) {
        let old = std::mem::replace(&mut self.descriptor, descriptor);
        let new = &self.descriptor;

        if old.url.trim() != new.url.trim() {
            debug!("Screen {} changed source to {}", new.name, new.url);
            self.failed = false;
            return;
        }

        let duration = self.duration_ms();
        let before = position_ms(old.base_pos_ms, old.start_epoch_ms, server_now_ms, duration, old.looping);
        let after = position_ms(new.base_pos_ms, new.start_epoch_ms, server_now_ms, duration, new.looping);
        let toggled = old.playing != new.playing;
        if is_jump(before, after) || toggled {
            debug!("Screen {} re-anchored from {} ms to {} ms", new.name, before, after);
            self.failed = false;
            self.shared.reset_ended();
            if self.session_active && !toggled {
                self.soft_stop();
            }
        }
    }

    /// Reconcile the session with the descriptor and the viewer
    pub fn tick_playback(&mut self, input: &TickInput<'_>) {
        self.apply_worker_events();

        let d = &self.descriptor;
        if !input.client.render_video || !d.has_url() || !d.playing {
            self.hard_stop();
            return;
        }

        if !self.check_range(input) {
            return;
        }

        let url_changed = self.active_url.as_deref().map(str::trim) != Some(self.descriptor.url.trim());
        if url_changed {
            if self.active_url.is_some() {
                self.reset_for_new_source();
            }
            self.start_session(input);
        } else if !self.session_active && !self.failed {
            if self.has_ended() {
                if !self.descriptor.looping {
                    return;
                }
                self.shared.reset_ended();
            }
            self.start_session(input);
        }

        let target = if self.muted { 0.0 } else { self.gain(input) };
        let changed = self
            .applied_gain
            .map(|g| (g - target).abs() > GAIN_EPSILON)
            .unwrap_or(true);
        if changed {
            self.session.set_gain(target);
            self.applied_gain = Some(target);
        }
    }

    /// Present due frames; never blocks
    ///
    /// Returns whether a frame was uploaded.
    pub fn render(&mut self, now_ns: u64) -> bool {
        let Some((width, height)) = self.surface_size else {
            return false;
        };

        match self.pacer.poll(&self.shared.queue, now_ns) {
            PaceOutcome::Present(frame) => {
                let mut uploaded = false;
                if frame.matches(width, height) {
                    match self.surface.upload(&frame.pixels, width, height) {
                        Ok(()) => uploaded = true,
                        Err(e) => warn!("Upload for screen {} failed: {}", self.descriptor.name, e),
                    }
                }
                self.shared.queue.return_buffer(frame.pixels);
                uploaded
            }
            PaceOutcome::Buffering | PaceOutcome::Idle => false,
        }
    }

    /// Stop decoding but keep the presented raster
    pub fn soft_stop(&mut self) {
        self.session.stop();
        self.shared.stop_pending.store(false, Ordering::SeqCst);
        self.session_active = false;
        self.pacer.reset(&self.shared.queue);
        self.shared.queue.clear();
    }

    /// Release the session, the buffers and the surface
    pub fn hard_stop(&mut self) {
        let idle = !self.session_active && self.surface_size.is_none() && self.active_url.is_none();
        if idle && !self.has_ended() {
            return;
        }
        debug!("Hard stop of screen {}", self.descriptor.name);

        self.soft_stop();
        self.surface.release();
        self.surface_size = None;
        self.active_url = None;
        self.failed = false;
        self.frozen_ms = None;
        self.out_of_range_since = None;
        self.muted = false;
        self.applied_gain = None;
        self.shared.reset_ended();
        self.shared.duration_ms.store(0, Ordering::SeqCst);
        self.shared.downloading.store(false, Ordering::SeqCst);
        *self.shared.pending_init.lock() = None;
    }

    pub fn phase(&self) -> ScreenPhase {
        if self.has_ended() {
            return ScreenPhase::Ended;
        }
        if !self.session_active {
            return ScreenPhase::Idle;
        }
        if self.frozen_ms.is_some() {
            return ScreenPhase::Frozen;
        }
        if self.surface_size.is_none() {
            return ScreenPhase::Starting;
        }
        if !self.shared.queue.is_clock_started() {
            return ScreenPhase::Buffering;
        }
        ScreenPhase::Playing
    }

    /// Decoding, or holding its position out of range
    pub fn is_playing(&self) -> bool {
        self.session_active
    }

    /// Ended within the last few seconds
    pub fn is_ended(&self) -> bool {
        self.is_ended_at(Instant::now())
    }

    pub fn is_ended_at(&self, now: Instant) -> bool {
        self.has_ended()
            && self
                .shared
                .ended_at
                .lock()
                .map(|at| now.saturating_duration_since(at) < ENDED_WINDOW)
                .unwrap_or(false)
    }

    /// Ended, with no time window
    pub fn has_ended(&self) -> bool {
        self.shared.ended.load(Ordering::SeqCst)
    }

    /// 0 when unknown
    pub fn duration_ms(&self) -> i64 {
        self.shared.duration_ms.load(Ordering::SeqCst)
    }

    /// Position to show in the timeline overlay
    pub fn display_position_ms(&self, server_now_ms: i64, now_ns: u64) -> i64 {
        let duration = self.duration_ms();
        let d = &self.descriptor;
        let start_ns = self.shared.queue.playback_start_ns();

        let pos = if let Some(frozen) = self.frozen_ms {
            frozen
        } else if self.has_ended() {
            duration
        } else if self.session_active && start_ns != 0 {
            self.shared.start_ms.load(Ordering::SeqCst) + (now_ns.saturating_sub(start_ns) / 1_000_000) as i64
        } else {
            position_ms(d.base_pos_ms, d.start_epoch_ms, server_now_ms, duration, d.looping)
        };

        if duration > 0 {
            pos.clamp(0, duration)
        } else {
            pos.max(0)
        }
    }

    /// Download in progress, if any
    pub fn download(&self) -> Option<DownloadProgress> {
        if !self.shared.downloading.load(Ordering::SeqCst) {
            return None;
        }
        Some(self.shared.download.lock().unwrap_or(DownloadProgress {
            downloaded_bytes: 0,
            total_bytes: None,
        }))
    }

    /// Cache file the current source plays from
    pub fn cached_file(&self) -> Option<CachedFile> {
        self.shared.cached_file.lock().clone()
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.shared.queue.stats()
    }

    /// Decoded frames waiting for presentation
    pub fn queued_frames(&self) -> usize {
        self.shared.queue.len()
    }

    pub fn frames_presented(&self) -> u64 {
        self.pacer.presented()
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn status(&self, server_now_ms: i64, now_ns: u64) -> ScreenStatus {
        ScreenStatus {
            name: self.descriptor.name.clone(),
            url: self.descriptor.url.clone(),
            phase: self.phase(),
            position_ms: self.display_position_ms(server_now_ms, now_ns),
            duration_ms: self.duration_ms(),
            download: self.download(),
            frames_presented: self.pacer.presented(),
        }
    }

    fn gain(&self, input: &TickInput<'_>) -> f32 {
        input.global_gain.max(0.0) * self.descriptor.volume.max(0.0) * input.client.local_volume_multiplier()
    }

    /// Apply what the worker reported since the last tick
    fn apply_worker_events(&mut self) {
        let stopped = self.shared.stop_pending.swap(false, Ordering::SeqCst);
        if self.session_active && (stopped || !self.session.is_running()) {
            self.session_active = false;
            if !self.has_ended() {
                info!("Playback of {} on screen {} stopped", self.descriptor.url, self.descriptor.name);
                self.failed = true;
            }
        }

        let init = self.shared.pending_init.lock().take();
        if let Some(init) = init {
            let size = (init.target_width, init.target_height);
            if self.surface_size != Some(size) {
                match self.surface.configure(size.0, size.1) {
                    Ok(()) => self.surface_size = Some(size),
                    Err(e) => {
                        warn!("Surface for screen {} could not be configured: {}", self.descriptor.name, e);
                        self.surface_size = None;
                    }
                }
            }
            self.pacer.reset(&self.shared.queue);
        }
    }

    /// Audibility handling; `false` when the session must not run
    fn check_range(&mut self, input: &TickInput<'_>) -> bool {
        if self.descriptor.within_radius(input.viewer, input.hear_radius) {
            self.out_of_range_since = None;
            self.frozen_ms = None;
            self.muted = false;
            return true;
        }

        if !self.session_active {
            return false;
        }

        let since = *self.out_of_range_since.get_or_insert(input.now);
        let away = input.now.saturating_duration_since(since);
        if away >= FREEZE_GRACE {
            info!("Screen {} out of range for {:?}, stopping", self.descriptor.name, away);
            self.hard_stop();
            return false;
        }
        if away >= MUTE_HYSTERESIS && !self.muted {
            self.muted = true;
            let pos = self.display_position_ms(input.server_now_ms, crate::utils::monotonic_ns());
            self.frozen_ms = Some(pos);
        }
        true
    }

    fn reset_for_new_source(&mut self) {
        self.soft_stop();
        self.failed = false;
        self.shared.reset_ended();
        self.shared.duration_ms.store(0, Ordering::SeqCst);
        *self.shared.cached_file.lock() = None;
    }

    fn start_session(&mut self, input: &TickInput<'_>) {
        let d = &self.descriptor;
        let duration = self.duration_ms();
        let mut seek_ms = position_ms(d.base_pos_ms, d.start_epoch_ms, input.server_now_ms, duration, d.looping);
        if d.looping && duration > 0 {
            seek_ms %= duration;
        }
        let anchored = input.server_now_ms > 0 && d.start_epoch_ms > 0;

        let (blocks_w, blocks_h) = d.blocks_wh();
        let gain = if self.muted { 0.0 } else { self.gain(input) };
        let request = StartRequest {
            url: d.url.trim().to_string(),
            blocks_w,
            blocks_h,
            looping: d.looping,
            seek_ms,
            gain,
            request_epoch_ms: if anchored { input.local_now_ms } else { 0 },
        };

        self.session.stop();
        self.shared.stop_pending.store(false, Ordering::SeqCst);
        self.shared.start_ms.store(seek_ms, Ordering::SeqCst);
        match self.session.start(request) {
            Ok(id) => {
                debug!("Screen {} started session {} at {} ms", self.descriptor.name, id, seek_ms);
                self.session_active = true;
                self.failed = false;
                self.applied_gain = Some(gain);
            }
            Err(e) => {
                warn!("Screen {} could not start playback: {}", self.descriptor.name, e);
                self.failed = true;
            }
        }
        self.active_url = Some(self.descriptor.url.trim().to_string());
    }
}
