//! End-to-end screen playback
//!
//! Sync frames go through the wire codec into a [`ScreenManager`] whose
//! screens decode a test pattern onto headless surfaces.

use anyhow::Result;
use collins_screen::audio::NullAudioBackend;
use collins_screen::decoder::PlaybackContext;
use collins_screen::net::ReqwestClient;
use collins_screen::player::{ScreenManager, ScreenPhase, TickReport, ViewerState};
use collins_screen::renderer::{HeadlessSurface, Surface, SurfaceStats};
use collins_screen::sync::{decode_frame, encode_frame, BlockPos, PlaneAxis, ScreenDescriptor, ServerClock, SyncMessage};
use collins_screen::utils::{monotonic_ns, ClientConfig};
use collins_screen_integration_tests::{mp4_bytes, Route, TestFixture, TestPattern, TestServer};
use parking_lot::Mutex;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const WORLD: &str = "minecraft:overworld";

struct Harness {
    manager: ScreenManager,
    pattern: Arc<TestPattern>,
    surfaces: Arc<Mutex<Vec<Arc<SurfaceStats>>>>,
    client: ClientConfig,
}

impl Harness {
    fn new(fixture: &TestFixture, frames: usize) -> Self {
        let config = fixture.config();
        let pattern = Arc::new(TestPattern::new(frames, 30.0));
        let ctx = Arc::new(PlaybackContext::new(
            &config,
            Arc::new(ReqwestClient::new("collins-screen-tests")),
            pattern.clone(),
            Arc::new(NullAudioBackend::new(false)),
        ));

        let surfaces: Arc<Mutex<Vec<Arc<SurfaceStats>>>> = Arc::default();
        let registry = Arc::clone(&surfaces);
        let manager = ScreenManager::new(
            ctx,
            &config.playback,
            Box::new(move |_: &ScreenDescriptor| {
                let surface = HeadlessSurface::new();
                registry.lock().push(surface.stats());
                Box::new(surface) as Box<dyn Surface>
            }),
        );

        Self {
            manager,
            pattern,
            surfaces,
            client: config.client,
        }
    }

    /// Deliver a broadcast through the wire codec
    fn broadcast(&mut self, screens: Vec<ScreenDescriptor>) -> Result<()> {
        let frame = encode_frame(&SyncMessage::new(1.0, 64, 0, screens))?;
        self.manager.apply_sync(decode_frame(&frame)?, ServerClock::local_now_ms());
        Ok(())
    }

    /// Tick and render until `done` holds
    fn run_until(&mut self, timeout: Duration, mut done: impl FnMut(&ScreenManager, &TickReport) -> bool) -> bool {
        let screen = screen("probe", "");
        let viewer = ViewerState {
            position: screen.center(),
            world: WORLD,
            client: &self.client,
        };
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            let report = self.manager.tick(&viewer, Instant::now());
            self.manager.render(monotonic_ns());
            if done(&self.manager, &report) {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    fn surface(&self, index: usize) -> Arc<SurfaceStats> {
        Arc::clone(&self.surfaces.lock()[index])
    }
}

fn screen(name: &str, url: &str) -> ScreenDescriptor {
    ScreenDescriptor {
        name: name.to_string(),
        world: WORLD.to_string(),
        corner_a: BlockPos::new(0, 64, 0),
        corner_b: BlockPos::new(15, 72, 0),
        axis: PlaneAxis::XY,
        url: url.to_string(),
        playing: true,
        looping: false,
        volume: 1.0,
        start_epoch_ms: 0,
        base_pos_ms: 0,
    }
}

fn drained_end(manager: &ScreenManager, name: &str) -> bool {
    manager
        .screen(name)
        .map(|s| s.phase() == ScreenPhase::Ended && s.queued_frames() == 0)
        .unwrap_or(false)
}

#[test]
fn test_local_file_plays_to_end() -> Result<()> {
    let fixture = TestFixture::new()?;
    let clip = fixture.write_file("clip.mp4", b"pattern")?;
    let mut harness = Harness::new(&fixture, 45);

    harness.broadcast(vec![screen("Lobby", &clip.to_string_lossy())])?;
    assert!(harness.run_until(Duration::from_secs(10), |m, _| drained_end(m, "lobby")));

    let surface = harness.surface(0);
    assert!(surface.uploads.load(Ordering::SeqCst) > 0);
    assert_eq!(surface.configures.load(Ordering::SeqCst), 1);
    assert_eq!((surface.width.load(Ordering::SeqCst), surface.height.load(Ordering::SeqCst)), (64, 36));

    let lobby = harness.manager.screen("lobby").expect("screen");
    assert_eq!(lobby.duration_ms(), 1500);
    // Not looping: the last frame stays up
    assert_eq!(surface.releases.load(Ordering::SeqCst), 0);
    assert_eq!(harness.pattern.opens.load(Ordering::SeqCst), 1);

    let mut stopped = screen("Lobby", &clip.to_string_lossy());
    stopped.playing = false;
    harness.broadcast(vec![stopped])?;
    assert_eq!(surface.releases.load(Ordering::SeqCst), 1);
    assert_eq!(harness.manager.screen("lobby").expect("screen").phase(), ScreenPhase::Idle);
    Ok(())
}

#[test]
fn test_removed_screen_is_released() -> Result<()> {
    let fixture = TestFixture::new()?;
    let clip = fixture.write_file("clip.mp4", b"pattern")?;
    let mut harness = Harness::new(&fixture, 100_000);

    harness.broadcast(vec![screen("Lobby", &clip.to_string_lossy()), screen("Hall", "")])?;
    assert_eq!(harness.manager.len(), 2);
    assert!(harness.run_until(Duration::from_secs(10), |m, _| {
        m.screen("lobby").map(|s| s.frames_presented() > 0).unwrap_or(false)
    }));

    harness.broadcast(vec![screen("Hall", "")])?;
    assert_eq!(harness.manager.len(), 1);
    assert_eq!(harness.surface(0).releases.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn test_streamable_url_is_opened_remotely() -> Result<()> {
    let fixture = TestFixture::new()?;
    let server = TestServer::start()?;
    server.route(
        "/clip.mp4",
        Route::ok("video/mp4", mp4_bytes(16 * 1024)).header("Accept-Ranges", "bytes"),
    );
    let url = server.url("/clip.mp4");
    let mut harness = Harness::new(&fixture, 30);

    harness.broadcast(vec![screen("Lobby", &url)])?;
    assert!(harness.run_until(Duration::from_secs(10), |m, _| drained_end(m, "lobby")));

    assert_eq!(harness.pattern.locations.lock().clone(), vec![url]);
    let cached = std::fs::read_dir(fixture.cache_dir()).map(|d| d.count()).unwrap_or(0);
    assert_eq!(cached, 0);
    Ok(())
}

#[test]
fn test_unstreamable_url_is_cached_and_offered_for_deletion() -> Result<()> {
    let fixture = TestFixture::new()?;
    let server = TestServer::start()?;
    let body = mp4_bytes(16 * 1024);
    server.route("/dl/movie.mp4", Route::ok("application/octet-stream", body.clone()));
    let url = server.url("/dl/movie.mp4");
    let mut harness = Harness::new(&fixture, 30);

    harness.broadcast(vec![screen("Lobby", &url)])?;
    let mut prompts = Vec::new();
    assert!(harness.run_until(Duration::from_secs(15), |m, report| {
        prompts.extend(report.delete_prompt.clone());
        drained_end(m, "lobby") && !prompts.is_empty()
    }));

    assert_eq!(prompts.len(), 1);
    let prompt = &prompts[0];
    assert_eq!(prompt.screen, "Lobby");
    assert_eq!(prompt.bytes, body.len() as u64);
    assert!(prompt.path.starts_with(fixture.cache_dir()));

    let opened = harness.pattern.locations.lock().clone();
    assert_eq!(opened, vec![prompt.path.to_string_lossy().into_owned()]);

    assert!(harness.manager.delete_pending_file());
    assert!(!prompt.path.exists());
    Ok(())
}
