//! CPAL audio output
//!
//! A lock-free ring buffer sits between the decode thread (producer) and the
//! device callback (consumer). The ring holds about half a second of audio,
//! so blocking writes keep the decoder close to real time.

use crate::audio::{pcm, AudioBackend, AudioHandle, AudioSink, PcmFormat};
use crate::utils::error::{CollinsError, IntoCollinsError, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SampleRate, SizedSample, Stream, StreamConfig};
use log::{debug, error, info};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Ring capacity in milliseconds of audio
const RING_MILLIS: u64 = 500;

/// Sleep between attempts while the ring is full
const FULL_RING_BACKOFF: Duration = Duration::from_millis(2);

/// Opens sinks on the host's default output device
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalAudioBackend;

impl CpalAudioBackend {
    pub fn new() -> Self {
        Self
    }
}

impl AudioBackend for CpalAudioBackend {
    fn open(&self, format: PcmFormat, handle: AudioHandle) -> Result<Box<dyn AudioSink>> {
        Ok(Box::new(CpalAudioSink::open(format, handle)?))
    }
}

/// Counters updated from the device callback
#[derive(Debug, Default)]
struct CallbackStats {
    samples_played: AtomicU64,
    underruns: AtomicU64,
}

struct CpalAudioSink {
    stream: Stream,
    producer: HeapProd<i16>,
    playing: Arc<AtomicBool>,
    handle: AudioHandle,
    stats: Arc<CallbackStats>,
    scratch: Vec<i16>,
}

impl CpalAudioSink {
    fn open(format: PcmFormat, handle: AudioHandle) -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| CollinsError::Audio("No default output device found".to_string()))?;

        let sample_format = device
            .default_output_config()
            .map(|c| c.sample_format())
            .audio_err("Failed to query output config")?;

        let config = StreamConfig {
            channels: format.channels,
            sample_rate: SampleRate(format.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let capacity = (pcm::bytes_for_millis(format.sample_rate, format.channels, RING_MILLIS) / 2).max(1024);
        let (producer, consumer) = HeapRb::<i16>::new(capacity).split();
        let playing = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(CallbackStats::default());

        let stream = match sample_format {
            SampleFormat::I16 => build_stream::<i16>(&device, &config, consumer, playing.clone(), stats.clone()),
            SampleFormat::U16 => build_stream::<u16>(&device, &config, consumer, playing.clone(), stats.clone()),
            _ => build_stream::<f32>(&device, &config, consumer, playing.clone(), stats.clone()),
        }?;

        info!(
            "Opened audio output: {} Hz, {} channel(s), device format {:?}",
            format.sample_rate, format.channels, sample_format
        );

        Ok(Self {
            stream,
            producer,
            playing,
            handle,
            stats,
            scratch: Vec::new(),
        })
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut consumer: HeapCons<i16>,
    playing: Arc<AtomicBool>,
    stats: Arc<CallbackStats>,
) -> Result<Stream>
where
    T: SizedSample + FromSample<i16>,
{
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                if !playing.load(Ordering::Relaxed) {
                    data.fill(T::EQUILIBRIUM);
                    return;
                }

                let mut played = 0u64;
                for out in data.iter_mut() {
                    match consumer.try_pop() {
                        Some(s) => {
                            *out = T::from_sample(s);
                            played += 1;
                        }
                        None => *out = T::EQUILIBRIUM,
                    }
                }

                stats.samples_played.fetch_add(played, Ordering::Relaxed);
                if (played as usize) < data.len() {
                    stats.underruns.fetch_add(1, Ordering::Relaxed);
                }
            },
            |err| error!("Audio stream error: {}", err),
            None,
        )
        .audio_err("Failed to create audio stream")
}

impl AudioSink for CpalAudioSink {
    fn start(&mut self) -> Result<()> {
        self.playing.store(true, Ordering::Relaxed);
        self.stream.play().audio_err("Failed to start audio stream")
    }

    fn write(&mut self, pcm_le: &[u8]) -> Result<()> {
        self.scratch.clear();
        pcm::decode_le(pcm_le, &mut self.scratch);

        let mut offset = 0;
        while offset < self.scratch.len() {
            if self.handle.is_shutdown() {
                return Ok(());
            }
            let pushed = self.producer.push_slice(&self.scratch[offset..]);
            offset += pushed;
            if pushed == 0 {
                thread::sleep(FULL_RING_BACKOFF);
            }
        }
        Ok(())
    }

    fn shutdown(&mut self) {
        self.playing.store(false, Ordering::Relaxed);
        if let Err(e) = self.stream.pause() {
            debug!("Pausing audio stream failed: {}", e);
        }
        debug!(
            "Audio sink closed: {} samples played, {} underruns, {} samples left",
            self.stats.samples_played.load(Ordering::Relaxed),
            self.stats.underruns.load(Ordering::Relaxed),
            self.producer.occupied_len()
        );
    }
}

impl Drop for CpalAudioSink {
    fn drop(&mut self) {
        self.playing.store(false, Ordering::Relaxed);
    }
}
