//! Integration test utilities for collins-screen
//!
//! This module provides common utilities for integration testing including:
//! - A temporary cache directory and matching configuration
//! - A scripted local HTTP server
//! - Synthetic container bytes that pass cache validation
//! - A test-pattern media backend that needs no codec

use anyhow::Result;
use collins_screen::audio::PcmFormat;
use collins_screen::decoder::{MediaBackend, MediaInput, MediaStream, StreamMeta, Unit};
use collins_screen::utils::{CollinsError, Config};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

static LOGGER: Lazy<()> = Lazy::new(|| {
    let _ = env_logger::builder().is_test(true).try_init();
});

/// Route test logs through env_logger once per process
pub fn init_logging() {
    Lazy::force(&LOGGER);
}

/// Test fixture owning a scratch directory
pub struct TestFixture {
    pub temp_dir: TempDir,
}

impl TestFixture {
    pub fn new() -> Result<Self> {
        init_logging();
        Ok(Self {
            temp_dir: TempDir::new()?,
        })
    }

    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Cache directory used by [`config`](Self::config)
    pub fn cache_dir(&self) -> PathBuf {
        self.path().join("cache")
    }

    /// Default configuration pointed at the fixture's cache
    pub fn config(&self) -> Config {
        let mut config = Config::default();
        config.cache.directory = Some(self.cache_dir());
        config.cache.failure_cooldown_ms = 60_000;
        config
    }

    /// Write a file below the fixture root
    pub fn write_file(&self, name: &str, contents: &[u8]) -> Result<PathBuf> {
        let path = self.path().join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, contents)?;
        Ok(path)
    }
}

/// One ISO-BMFF atom with a 32-bit size
pub fn atom(kind: &[u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 8);
    out.extend_from_slice(&((payload.len() + 8) as u32).to_be_bytes());
    out.extend_from_slice(kind);
    out.extend_from_slice(payload);
    out
}

/// Well-formed MP4 layout (`ftyp`, `moov`, `mdat`) padded to `total` bytes
pub fn mp4_bytes(total: usize) -> Vec<u8> {
    let mut out = atom(b"ftyp", b"isom\0\0\0\0isommp41");
    out.extend(atom(b"moov", &[0u8; 64]));
    let pad = total.saturating_sub(out.len() + 8);
    out.extend(atom(b"mdat", &vec![0u8; pad]));
    out
}

/// Poll `cond` until it holds or `timeout` passes
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

/// Canned HTTP answer
#[derive(Debug, Clone)]
pub struct Route {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,

    /// Pause between the response head and the body
    pub delay: Duration,
}

impl Route {
    pub fn ok(content_type: &str, body: Vec<u8>) -> Self {
        Self {
            status: 200,
            headers: vec![("Content-Type".to_string(), content_type.to_string())],
            body,
            delay: Duration::ZERO,
        }
    }

    pub fn redirect(location: &str) -> Self {
        Self {
            status: 302,
            headers: vec![("Location".to_string(), location.to_string())],
            body: Vec::new(),
            delay: Duration::ZERO,
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
            delay: Duration::ZERO,
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

type Routes = Arc<Mutex<HashMap<String, Route>>>;
type Hits = Arc<Mutex<HashMap<String, usize>>>;

/// Minimal HTTP/1.1 server answering from a route table
///
/// Ranges are ignored; every answer carries the full body and closes the
/// connection.
pub struct TestServer {
    addr: SocketAddr,
    routes: Routes,
    hits: Hits,
    shutdown: Arc<AtomicBool>,
}

impl TestServer {
    pub fn start() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        let routes: Routes = Arc::default();
        let hits: Hits = Arc::default();
        let shutdown = Arc::new(AtomicBool::new(false));

        let (r, h, stop) = (Arc::clone(&routes), Arc::clone(&hits), Arc::clone(&shutdown));
        thread::Builder::new()
            .name("test-http".to_string())
            .spawn(move || {
                for stream in listener.incoming() {
                    if stop.load(Ordering::SeqCst) {
                        break;
                    }
                    let Ok(stream) = stream else { continue };
                    let (r, h) = (Arc::clone(&r), Arc::clone(&h));
                    thread::spawn(move || {
                        if let Err(e) = serve(stream, &r, &h) {
                            log::debug!("test server connection failed: {}", e);
                        }
                    });
                }
            })?;

        Ok(Self {
            addr,
            routes,
            hits,
            shutdown,
        })
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn route(&self, path: &str, route: Route) {
        self.routes.lock().insert(path.to_string(), route);
    }

    /// Requests seen for `path`
    pub fn hits(&self, path: &str) -> usize {
        self.hits.lock().get(path).copied().unwrap_or(0)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        // Wake the accept loop
        let _ = TcpStream::connect(self.addr);
    }
}

fn serve(mut stream: TcpStream, routes: &Routes, hits: &Hits) -> std::io::Result<()> {
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    let mut reader = BufReader::new(stream.try_clone()?);

    let mut request_line = String::new();
    reader.read_line(&mut request_line)?;
    let path = request_line.split_whitespace().nth(1).unwrap_or("/").to_string();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 || line.trim().is_empty() {
            break;
        }
    }

    *hits.lock().entry(path.clone()).or_default() += 1;
    let route = routes.lock().get(&path).cloned().unwrap_or_else(|| Route::status(404));

    let reason = match route.status {
        200 => "OK",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        403 => "Forbidden",
        404 => "Not Found",
        _ => "Status",
    };
    let mut head = format!("HTTP/1.1 {} {}\r\n", route.status, reason);
    for (name, value) in &route.headers {
        head.push_str(&format!("{}: {}\r\n", name, value));
    }
    head.push_str(&format!("Content-Length: {}\r\nConnection: close\r\n\r\n", route.body.len()));

    stream.write_all(head.as_bytes())?;
    stream.flush()?;
    if !route.delay.is_zero() {
        thread::sleep(route.delay);
    }
    stream.write_all(&route.body)?;
    stream.flush()
}

/// Media backend producing a solid test pattern without any codec
///
/// Probes report 64x36; opened streams emit `frames` video units at `fps`
/// whose blue channel counts up with the frame index.
pub struct TestPattern {
    pub frames: usize,
    pub fps: f64,
    pub opens: AtomicUsize,
    pub locations: Mutex<Vec<String>>,
}

impl TestPattern {
    pub fn new(frames: usize, fps: f64) -> Self {
        Self {
            frames,
            fps,
            opens: AtomicUsize::new(0),
            locations: Mutex::new(Vec::new()),
        }
    }

    pub fn duration_ms(&self) -> i64 {
        (self.frames as f64 * 1000.0 / self.fps) as i64
    }
}

impl MediaBackend for TestPattern {
    fn probe(&self, input: &MediaInput) -> collins_screen::utils::Result<StreamMeta> {
        if let Some(path) = input.local_path() {
            if !path.is_file() {
                return Err(CollinsError::decoder_error(format!("{} does not exist", path.display())));
            }
        }
        Ok(StreamMeta {
            width: 64,
            height: 36,
            fps: self.fps,
            duration_ms: self.duration_ms(),
        })
    }

    fn open(
        &self,
        input: &MediaInput,
        target_w: u32,
        target_h: u32,
    ) -> collins_screen::utils::Result<Box<dyn MediaStream>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.locations.lock().push(input.location());
        let (width, height) = (target_w.clamp(1, 64) as usize, target_h.clamp(1, 36) as usize);
        Ok(Box::new(PatternStream {
            width,
            height,
            frames: self.frames,
            fps: self.fps,
            next: 0,
            bgr: vec![0; width * height * 3],
        }))
    }
}

struct PatternStream {
    width: usize,
    height: usize,
    frames: usize,
    fps: f64,
    next: usize,
    bgr: Vec<u8>,
}

impl MediaStream for PatternStream {
    fn target_size(&self) -> (u32, u32) {
        (self.width as u32, self.height as u32)
    }

    fn audio_format(&self) -> Option<PcmFormat> {
        None
    }

    fn seek(&mut self, position_us: i64) -> collins_screen::utils::Result<()> {
        self.next = (position_us.max(0) as f64 * self.fps / 1_000_000.0) as usize;
        Ok(())
    }

    fn next_unit(&mut self) -> collins_screen::utils::Result<Option<Unit<'_>>> {
        if self.next >= self.frames {
            return Ok(None);
        }
        let index = self.next;
        self.next += 1;

        let blue = (index % 256) as u8;
        for px in self.bgr.chunks_exact_mut(3) {
            px.copy_from_slice(&[blue, 0x40, 0x80]);
        }
        Ok(Some(Unit::Video {
            bgr: &self.bgr,
            stride: self.width * 3,
            timestamp_us: (index as f64 * 1_000_000.0 / self.fps) as i64,
        }))
    }
}
