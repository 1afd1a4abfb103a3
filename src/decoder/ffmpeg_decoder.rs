//! FFmpeg-based media backend
//!
//! Demuxes and decodes with the ffmpeg-next crate. Video is scaled straight to
//! the target raster in packed BGR24; audio is resampled to interleaved S16 at
//! no more than two channels.

use crate::audio::{PcmFormat, MAX_CHANNELS};
use crate::decoder::{MediaBackend, MediaInput, MediaSource, MediaStream, StreamMeta, Unit};
use crate::utils::error::{CollinsError, Result};
use ffmpeg_next as ffmpeg;
use ffmpeg_next::format::{self, Pixel, Sample};
use ffmpeg_next::software::{resampling, scaling};
use ffmpeg_next::{codec, frame, media, ChannelLayout, Dictionary, Packet, Rational};
use log::{debug, info};
use once_cell::sync::OnceCell;
use std::ffi::CString;

static FFMPEG_INIT: OnceCell<std::result::Result<(), String>> = OnceCell::new();

/// Initialize FFmpeg once per process
fn ensure_init() -> Result<()> {
    FFMPEG_INIT
        .get_or_init(|| {
            ffmpeg::init().map_err(|e| e.to_string())?;
            ffmpeg::format::network::init();
            ffmpeg::log::set_level(ffmpeg::log::Level::Error);
            Ok(())
        })
        .clone()
        .map_err(|e| CollinsError::decoder_error(format!("FFmpeg initialization failed: {}", e)))
}

/// Demuxer options for a source
fn demux_options(input: &MediaInput, user_agent: &str) -> Dictionary<'static> {
    let mut options = Dictionary::new();
    options.set("probesize", "500000");
    options.set("analyzeduration", "500000");
    options.set("fflags", "nobuffer");

    if let MediaSource::Remote(url) = &input.source {
        if crate::net::is_http(url) {
            options.set("reconnect", "1");
            options.set("reconnect_streamed", "1");
            options.set("reconnect_on_network_error", "1");
            options.set("reconnect_delay_max", "2");
            options.set("rw_timeout", "5000000");
            options.set("timeout", "5000000");
            options.set("user_agent", user_agent);
            options.set("seekable", "1");
            options.set("multiple_requests", "1");
        }
    }
    options
}

/// Demuxer for a container short name such as `mp4`
fn find_input_format(name: &str) -> Option<format::format::Format> {
    let cname = CString::new(name).ok()?;
    // SAFETY: av_find_input_format only reads the NUL-terminated name and
    // returns a pointer to a static table entry or null.
    let ptr = unsafe { ffmpeg::ffi::av_find_input_format(cname.as_ptr()) };
    if ptr.is_null() {
        return None;
    }
    // SAFETY: non-null demuxer descriptors live for the whole process.
    Some(format::format::Format::Input(unsafe {
        format::format::Input::wrap(ptr as *mut _)
    }))
}

fn open_input(input: &MediaInput, user_agent: &str) -> Result<format::context::Input> {
    ensure_init()?;
    let location = input.location();
    let options = demux_options(input, user_agent);

    if let Some(forced) = input.container_hint.as_deref().and_then(find_input_format) {
        debug!("Opening {} as {:?}", location, input.container_hint);
        return match format::open_with(&location, &forced, options)? {
            format::context::Context::Input(ictx) => Ok(ictx),
            format::context::Context::Output(_) => Err(crate::internal_error!("demuxer opened as output")),
        };
    }

    Ok(format::input_with_dictionary(&location, options)?)
}

fn to_micros(ts: i64, time_base: Rational) -> i64 {
    if time_base.denominator() == 0 {
        return 0;
    }
    (ts as i128 * time_base.numerator() as i128 * 1_000_000 / time_base.denominator() as i128) as i64
}

fn stream_fps(stream: &format::stream::Stream<'_>) -> f64 {
    let avg = stream.avg_frame_rate();
    if avg.numerator() > 0 && avg.denominator() > 0 {
        return f64::from(avg);
    }
    let rate = stream.rate();
    if rate.numerator() > 0 && rate.denominator() > 0 {
        f64::from(rate)
    } else {
        0.0
    }
}

/// [`MediaBackend`] over the system FFmpeg libraries
pub struct FfmpegBackend {
    user_agent: String,
}

impl FfmpegBackend {
    pub fn new<S: Into<String>>(user_agent: S) -> Self {
        Self {
            user_agent: user_agent.into(),
        }
    }
}

impl MediaBackend for FfmpegBackend {
    fn probe(&self, input: &MediaInput) -> Result<StreamMeta> {
        let ictx = open_input(input, &self.user_agent)?;
        let stream = ictx
            .streams()
            .best(media::Type::Video)
            .ok_or_else(|| CollinsError::decoder_error("No video stream found"))?;

        let decoder = codec::context::Context::from_parameters(stream.parameters())?
            .decoder()
            .video()?;

        let duration_us = ictx.duration();
        let meta = StreamMeta {
            width: decoder.width(),
            height: decoder.height(),
            fps: stream_fps(&stream),
            duration_ms: if duration_us > 0 { duration_us / 1000 } else { 0 },
        };
        debug!("Probed {}: {:?}", input.location(), meta);
        Ok(meta)
    }

    fn open(&self, input: &MediaInput, target_w: u32, target_h: u32) -> Result<Box<dyn MediaStream>> {
        let ictx = open_input(input, &self.user_agent)?;
        let stream = FfmpegStream::new(ictx, target_w, target_h)?;
        info!(
            "Opened {} for decoding at {}x{} (audio: {:?})",
            input.location(),
            target_w,
            target_h,
            stream.audio.as_ref().map(|a| a.format)
        );
        Ok(Box::new(stream))
    }
}

/// Video decoder state
struct VideoDecoder {
    /// Stream index
    index: usize,

    decoder: codec::decoder::Video,
    time_base: Rational,

    /// Scaler to BGR24 at the target size, rebuilt when the input changes
    scaler: Option<scaling::Context>,

    decoded: frame::Video,
    scaled: frame::Video,
    target: (u32, u32),

    /// Frame duration used when a frame carries no timestamp
    frame_us: i64,
    last_us: Option<i64>,
}

impl VideoDecoder {
    /// Pull one decoded frame and scale it; `false` when the decoder is empty
    fn receive(&mut self) -> Result<bool> {
        if self.decoder.receive_frame(&mut self.decoded).is_err() {
            return Ok(false);
        }

        let (format, width, height) = (self.decoded.format(), self.decoded.width(), self.decoded.height());
        let stale = self
            .scaler
            .as_ref()
            .map(|s| s.input().format != format || s.input().width != width || s.input().height != height)
            .unwrap_or(true);
        if stale {
            self.scaler = Some(scaling::Context::get(
                format,
                width,
                height,
                Pixel::BGR24,
                self.target.0,
                self.target.1,
                scaling::Flags::BILINEAR,
            )?);
        }
        if let Some(scaler) = self.scaler.as_mut() {
            scaler.run(&self.decoded, &mut self.scaled)?;
        }

        let ts = match self.decoded.timestamp() {
            Some(ts) => to_micros(ts, self.time_base),
            None => self.last_us.map(|l| l + self.frame_us).unwrap_or(0),
        };
        self.last_us = Some(ts);
        Ok(true)
    }
}

/// Audio decoder state
struct AudioDecoder {
    /// Stream index
    index: usize,

    decoder: codec::decoder::Audio,
    time_base: Rational,

    /// Resampler to packed S16, rebuilt when the input changes
    resampler: Option<resampling::Context>,

    decoded: frame::Audio,
    resampled: frame::Audio,
    format: PcmFormat,
    layout: ChannelLayout,

    samples: Vec<i16>,
    last_us: i64,
}

impl AudioDecoder {
    fn receive(&mut self) -> Result<bool> {
        if self.decoder.receive_frame(&mut self.decoded).is_err() {
            return Ok(false);
        }

        let mut in_layout = self.decoded.channel_layout();
        if in_layout.is_empty() {
            in_layout = ChannelLayout::default(self.decoded.channels() as i32);
        }
        let stale = self
            .resampler
            .as_ref()
            .map(|r| {
                r.input().format != self.decoded.format()
                    || r.input().channel_layout != in_layout
                    || r.input().rate != self.decoded.rate()
            })
            .unwrap_or(true);
        if stale {
            self.resampler = Some(resampling::Context::get(
                self.decoded.format(),
                in_layout,
                self.decoded.rate(),
                Sample::I16(format::sample::Type::Packed),
                self.layout,
                self.format.sample_rate,
            )?);
        }

        self.samples.clear();
        if let Some(resampler) = self.resampler.as_mut() {
            resampler.run(&self.decoded, &mut self.resampled)?;
            let count = self.resampled.samples() * self.format.channels as usize;
            let bytes = self.resampled.data(0);
            let usable = (count * 2).min(bytes.len());
            self.samples
                .extend(bytes[..usable].chunks_exact(2).map(|c| i16::from_ne_bytes([c[0], c[1]])));
        }

        if let Some(ts) = self.decoded.timestamp() {
            self.last_us = to_micros(ts, self.time_base);
        }
        Ok(true)
    }
}

/// An opened input with its decoders
struct FfmpegStream {
    input: format::context::Input,
    video: VideoDecoder,
    audio: Option<AudioDecoder>,
    packet: Packet,

    /// End of input reached and decoders told so
    flushed: bool,
}

impl FfmpegStream {
    fn new(input: format::context::Input, target_w: u32, target_h: u32) -> Result<Self> {
        let video = {
            let stream = input
                .streams()
                .best(media::Type::Video)
                .ok_or_else(|| CollinsError::decoder_error("No video stream found"))?;

            let mut context = codec::context::Context::from_parameters(stream.parameters())?;
            context.set_threading(codec::threading::Config {
                kind: codec::threading::Type::Frame,
                count: 0,
                ..Default::default()
            });

            let fps = stream_fps(&stream);
            VideoDecoder {
                index: stream.index(),
                decoder: context.decoder().video()?,
                time_base: stream.time_base(),
                scaler: None,
                decoded: frame::Video::empty(),
                scaled: frame::Video::empty(),
                target: (target_w.max(2), target_h.max(2)),
                frame_us: if fps > 0.0 { (1_000_000.0 / fps) as i64 } else { 33_333 },
                last_us: None,
            }
        };

        let audio = match input.streams().best(media::Type::Audio) {
            Some(stream) => {
                let decoder = codec::context::Context::from_parameters(stream.parameters())?
                    .decoder()
                    .audio()?;
                let format = PcmFormat::output(decoder.rate(), decoder.channels());
                let layout = if format.channels >= MAX_CHANNELS {
                    ChannelLayout::STEREO
                } else {
                    ChannelLayout::MONO
                };
                Some(AudioDecoder {
                    index: stream.index(),
                    decoder,
                    time_base: stream.time_base(),
                    resampler: None,
                    decoded: frame::Audio::empty(),
                    resampled: frame::Audio::empty(),
                    format,
                    layout,
                    samples: Vec::new(),
                    last_us: 0,
                })
            }
            None => None,
        };

        Ok(Self {
            input,
            video,
            audio,
            packet: Packet::empty(),
            flushed: false,
        })
    }

    /// Feed the next packet to its decoder; `false` once input is exhausted
    fn feed(&mut self) -> Result<bool> {
        match self.packet.read(&mut self.input) {
            Ok(()) => {}
            Err(ffmpeg::Error::Eof) => return Ok(false),
            Err(e) => return Err(e.into()),
        }

        let index = self.packet.stream();
        if index == self.video.index {
            if let Err(e) = self.video.decoder.send_packet(&self.packet) {
                debug!("Dropping undecodable video packet: {}", e);
            }
        } else if let Some(audio) = self.audio.as_mut().filter(|a| a.index == index) {
            if let Err(e) = audio.decoder.send_packet(&self.packet) {
                debug!("Dropping undecodable audio packet: {}", e);
            }
        }
        Ok(true)
    }
}

impl MediaStream for FfmpegStream {
    fn target_size(&self) -> (u32, u32) {
        self.video.target
    }

    fn audio_format(&self) -> Option<PcmFormat> {
        self.audio.as_ref().map(|a| a.format)
    }

    fn seek(&mut self, position_us: i64) -> Result<()> {
        self.input.seek(position_us, ..position_us)?;
        self.video.decoder.flush();
        self.video.last_us = None;
        if let Some(audio) = self.audio.as_mut() {
            audio.decoder.flush();
        }
        self.flushed = false;
        Ok(())
    }

    fn next_unit(&mut self) -> Result<Option<Unit<'_>>> {
        loop {
            if self.video.receive()? {
                let v = &self.video;
                return Ok(Some(Unit::Video {
                    bgr: v.scaled.data(0),
                    stride: v.scaled.stride(0),
                    timestamp_us: v.last_us.unwrap_or(0),
                }));
            }

            let audio_ready = match self.audio.as_mut() {
                Some(audio) => audio.receive()?,
                None => false,
            };
            if audio_ready {
                if let Some(a) = self.audio.as_ref() {
                    return Ok(Some(Unit::Audio {
                        samples: &a.samples,
                        timestamp_us: a.last_us,
                    }));
                }
            }

            if self.flushed {
                return Ok(None);
            }

            if !self.feed()? {
                let _ = self.video.decoder.send_eof();
                if let Some(audio) = self.audio.as_mut() {
                    let _ = audio.decoder.send_eof();
                }
                self.flushed = true;
            }
        }
    }
}
