//! Decoder module for collins-screen
//!
//! This module owns everything between a resolved source and paced frames:
//! - capability seams for demux/decode ([`MediaBackend`], [`MediaStream`]) and
//!   for the presentation side ([`FrameSink`])
//! - the FFmpeg backend
//! - the bounded frame queue, buffer pool and pacer
//! - target raster selection
//! - the per-screen decode session with its worker thread

mod ffmpeg_decoder;
mod frame_queue;
pub mod raster;
pub mod session;

pub use ffmpeg_decoder::FfmpegBackend;
pub use frame_queue::{FramePacer, FrameQueue, PaceOutcome, QueueStats};
pub use raster::{target_size, RasterLimits};
pub use session::{DecodeSession, PlaybackContext, SessionToken, StartRequest};

use crate::audio::PcmFormat;
use crate::cache::DownloadProgress;
use crate::renderer::VideoFrame;
use crate::utils::error::Result;
use std::path::{Path, PathBuf};

/// Longest duration taken at face value
pub const MAX_PLAUSIBLE_DURATION_MS: i64 = 12 * 60 * 60 * 1000;

/// Frame rate assumed when the container does not report one
pub const FALLBACK_FPS: f64 = 30.0;

/// What to open
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaSource {
    Remote(String),
    Local(PathBuf),
}

/// A source plus demuxer hints
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaInput {
    pub source: MediaSource,

    /// Forced container format, e.g. `mp4`
    pub container_hint: Option<String>,
}

impl MediaInput {
    pub fn remote<S: Into<String>>(url: S, container_hint: Option<String>) -> Self {
        Self {
            source: MediaSource::Remote(url.into()),
            container_hint,
        }
    }

    pub fn local<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            source: MediaSource::Local(path.into()),
            container_hint: None,
        }
    }

    /// URL or path as handed to the demuxer
    pub fn location(&self) -> String {
        match &self.source {
            MediaSource::Remote(url) => url.clone(),
            MediaSource::Local(path) => path.to_string_lossy().into_owned(),
        }
    }

    pub fn local_path(&self) -> Option<&Path> {
        match &self.source {
            MediaSource::Local(path) => Some(path),
            MediaSource::Remote(_) => None,
        }
    }
}

/// Stream properties read by a metadata-only open
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamMeta {
    pub width: u32,
    pub height: u32,
    pub fps: f64,

    /// Milliseconds, 0 when unknown
    pub duration_ms: i64,
}

impl StreamMeta {
    /// Replace implausible durations with "unknown" and missing rates with a default
    pub fn normalized(self) -> Self {
        let duration_ms = if (0..=MAX_PLAUSIBLE_DURATION_MS).contains(&self.duration_ms) {
            self.duration_ms
        } else {
            0
        };
        let fps = if self.fps.is_finite() && self.fps > 0.0 {
            self.fps
        } else {
            FALLBACK_FPS
        };
        Self {
            duration_ms,
            fps,
            ..self
        }
    }
}

/// One demuxed and decoded unit, borrowed from the stream until the next call
#[derive(Debug)]
pub enum Unit<'a> {
    /// Packed BGR24 raster at the stream's target size
    Video {
        bgr: &'a [u8],
        stride: usize,
        timestamp_us: i64,
    },

    /// Interleaved signed 16-bit samples in the stream's [`PcmFormat`]
    Audio { samples: &'a [i16], timestamp_us: i64 },
}

/// An opened, decoding stream
pub trait MediaStream {
    /// Raster size video units are scaled to
    fn target_size(&self) -> (u32, u32);

    /// Output format of audio units, `None` without an audio stream
    fn audio_format(&self) -> Option<PcmFormat>;

    /// Seek near `position_us`; decoding resumes at or before it
    fn seek(&mut self, position_us: i64) -> Result<()>;

    /// Next decoded unit; `Ok(None)` at end of stream
    fn next_unit(&mut self) -> Result<Option<Unit<'_>>>;
}

/// Demux/decode library seam
pub trait MediaBackend: Send + Sync {
    /// Metadata-only open
    fn probe(&self, input: &MediaInput) -> Result<StreamMeta>;

    /// Open for decoding, scaling video to `target_w` x `target_h`
    fn open(&self, input: &MediaInput, target_w: u32, target_h: u32) -> Result<Box<dyn MediaStream>>;
}

/// Parameters of a freshly opened session
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoInit {
    pub native_width: u32,
    pub native_height: u32,
    pub target_width: u32,
    pub target_height: u32,
    pub fps: f64,

    /// Media position playback begins at, open lag included
    pub start_ms: i64,
}

impl VideoInit {
    pub fn pixels(&self) -> usize {
        self.target_width as usize * self.target_height as usize
    }
}

/// Presentation-side receiver of a decode session
///
/// Called from the decode worker. Implementations must not block beyond
/// short critical sections.
pub trait FrameSink: Send + Sync {
    /// A new session opened its stream; buffers of the old size become stale
    fn init_video(&self, init: VideoInit);

    /// Hand over a decoded frame; its buffer came from [`borrow_buffer`](Self::borrow_buffer)
    fn on_frame(&self, frame: VideoFrame);

    fn on_duration(&self, duration_ms: i64);

    /// Natural end of stream
    fn on_ended(&self, duration_ms: i64);

    /// The worker exited
    fn on_stop(&self);

    /// Audio output started; presentation should run its clock from `start_ns`
    fn on_playback_clock_start(&self, _start_ns: u64) {}

    fn on_download_start(&self) {}

    fn on_download_progress(&self, _progress: DownloadProgress) {}

    fn on_download_complete(&self) {}

    /// The session plays a file from the disk cache
    fn on_cached_file_used(&self, _path: &Path, _bytes: u64) {}

    fn borrow_buffer(&self) -> Option<Vec<u32>>;

    fn return_buffer(&self, buf: Vec<u32>);

    /// Frame queue below capacity
    fn can_accept_frame(&self) -> bool;

    /// Video pre-roll satisfied
    fn is_buffer_ready(&self) -> bool;
}
