//! Audio output for decode sessions
//!
//! Decoded audio arrives as interleaved 16-bit samples. The decode thread
//! holds it back in an [`AudioPipeline`] until video pre-roll is satisfied,
//! then feeds it, gain-scaled, into an [`AudioSink`] whose blocking writes pace
//! the whole decode loop to real time.

mod cpal_output;
pub mod pcm;

pub use cpal_output::CpalAudioBackend;

use crate::utils::error::Result;
use log::debug;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Output rate used when the stream does not dictate one
pub const DEFAULT_SAMPLE_RATE: u32 = 48_000;

/// Output channel ceiling; wider layouts are downmixed
pub const MAX_CHANNELS: u16 = 2;

/// Audio withheld during pre-roll before the oldest data is dropped
const MAX_PREBUFFER_MS: u64 = 3_000;

/// Interleaved signed 16-bit PCM layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl PcmFormat {
    /// Format with the rate defaulted and channels capped
    pub fn output(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate: if sample_rate == 0 { DEFAULT_SAMPLE_RATE } else { sample_rate },
            channels: channels.clamp(1, MAX_CHANNELS),
        }
    }

    pub fn bytes_per_second(&self) -> u64 {
        self.sample_rate as u64 * self.channels as u64 * 2
    }
}

/// Live controls shared between a session owner and its audio output
#[derive(Debug, Clone)]
pub struct AudioHandle {
    gain: Arc<AtomicU32>,
    shutdown: Arc<AtomicBool>,
}

impl AudioHandle {
    pub fn new(gain: f32) -> Self {
        Self {
            gain: Arc::new(AtomicU32::new(gain.max(0.0).to_bits())),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set_gain(&self, gain: f32) {
        self.gain.store(gain.max(0.0).to_bits(), Ordering::Relaxed);
    }

    pub fn gain(&self) -> f32 {
        f32::from_bits(self.gain.load(Ordering::Relaxed))
    }

    /// Unblock pending writes and refuse further ones
    pub fn shutdown_now(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

/// Device-side consumer of little-endian PCM
///
/// Created and used on the decode thread only.
pub trait AudioSink {
    fn start(&mut self) -> Result<()>;

    /// Queue bytes for playback, blocking while the device buffer is full
    ///
    /// Returns early once the handle is shut down.
    fn write(&mut self, pcm_le: &[u8]) -> Result<()>;

    fn shutdown(&mut self);
}

/// Factory for audio sinks
pub trait AudioBackend: Send + Sync {
    fn open(&self, format: PcmFormat, handle: AudioHandle) -> Result<Box<dyn AudioSink>>;
}

/// Gain scaling and pre-roll buffering in front of a sink
pub struct AudioPipeline {
    sink: Box<dyn AudioSink>,
    handle: AudioHandle,
    prebuffer: VecDeque<Vec<u8>>,
    prebuffer_bytes: usize,
    max_prebuffer_bytes: usize,
    started: bool,
    scratch: Vec<u8>,
}

impl AudioPipeline {
    pub fn open(backend: &dyn AudioBackend, format: PcmFormat, handle: AudioHandle) -> Result<Self> {
        let sink = backend.open(format, handle.clone())?;
        Ok(Self {
            sink,
            handle,
            prebuffer: VecDeque::new(),
            prebuffer_bytes: 0,
            max_prebuffer_bytes: pcm::bytes_for_millis(format.sample_rate, format.channels, MAX_PREBUFFER_MS),
            started: false,
            scratch: Vec::new(),
        })
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn prebuffered_bytes(&self) -> usize {
        self.prebuffer_bytes
    }

    /// Hold samples until [`start`](Self::start); the oldest blocks go first when full
    pub fn prebuffer(&mut self, samples: &[i16]) {
        let mut block = Vec::with_capacity(samples.len() * 2);
        pcm::encode_le(samples, self.handle.gain(), &mut block);
        self.prebuffer_bytes += block.len();
        self.prebuffer.push_back(block);

        while self.prebuffer_bytes > self.max_prebuffer_bytes {
            match self.prebuffer.pop_front() {
                Some(old) => self.prebuffer_bytes -= old.len(),
                None => break,
            }
        }
    }

    /// Start the device and flush everything held back
    pub fn start(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }
        self.sink.start()?;
        self.started = true;

        debug!("Flushing {} prebuffered audio bytes", self.prebuffer_bytes);
        while let Some(block) = self.prebuffer.pop_front() {
            self.prebuffer_bytes -= block.len();
            self.sink.write(&block)?;
        }
        Ok(())
    }

    /// Gain-scale and write samples to the running sink
    pub fn write_samples(&mut self, samples: &[i16]) -> Result<()> {
        self.scratch.clear();
        pcm::encode_le(samples, self.handle.gain(), &mut self.scratch);
        self.sink.write(&self.scratch)
    }

    pub fn close(mut self) {
        self.sink.shutdown();
    }
}

/// Sink without a device
///
/// With pacing enabled, writes sleep for the duration of the audio they
/// carry, standing in for a real device clock.
pub struct NullAudioBackend {
    pace: bool,
    written: Arc<AtomicU64>,
}

impl NullAudioBackend {
    pub fn new(pace: bool) -> Self {
        Self {
            pace,
            written: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Total bytes written across all sinks
    pub fn bytes_written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }
}

struct NullAudioSink {
    format: PcmFormat,
    handle: AudioHandle,
    pace: bool,
    written: Arc<AtomicU64>,
}

impl AudioBackend for NullAudioBackend {
    fn open(&self, format: PcmFormat, handle: AudioHandle) -> Result<Box<dyn AudioSink>> {
        Ok(Box::new(NullAudioSink {
            format,
            handle,
            pace: self.pace,
            written: self.written.clone(),
        }))
    }
}

impl AudioSink for NullAudioSink {
    fn start(&mut self) -> Result<()> {
        Ok(())
    }

    fn write(&mut self, pcm_le: &[u8]) -> Result<()> {
        if self.handle.is_shutdown() {
            return Ok(());
        }
        self.written.fetch_add(pcm_le.len() as u64, Ordering::Relaxed);

        if self.pace {
            let micros = pcm_le.len() as u64 * 1_000_000 / self.format.bytes_per_second().max(1);
            let mut remaining = Duration::from_micros(micros);
            let slice = Duration::from_millis(5);
            while !remaining.is_zero() && !self.handle.is_shutdown() {
                let step = remaining.min(slice);
                std::thread::sleep(step);
                remaining -= step;
            }
        }
        Ok(())
    }

    fn shutdown(&mut self) {}
}
