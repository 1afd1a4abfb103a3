//! Screen registry and per-tick orchestration
//!
//! The manager applies sync broadcasts to its screens, ticks them from the
//! presentation thread and derives the passive UI state: the timeline
//! overlay and the one-shot prompt offering to delete a finished cache file.

use crate::decoder::PlaybackContext;
use crate::player::screen::{Screen, TickInput};
use crate::player::state::{download_line, timeline_line, DeletePrompt, ScreenStatus};
use crate::renderer::Surface;
use crate::sync::{ScreenDescriptor, ServerClock, SyncMessage, ViewerPos};
use crate::utils::config::{ClientConfig, PlaybackConfig};
use crate::utils::monotonic_ns;
use log::{debug, info};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Minimum spacing of timeline overlay refreshes
pub const OVERLAY_INTERVAL: Duration = Duration::from_millis(500);

const MINECRAFT_NAMESPACE: &str = "minecraft:";

/// Creates the host surface for a new screen
pub type SurfaceFactory = Box<dyn FnMut(&ScreenDescriptor) -> Box<dyn Surface> + Send>;

/// Viewer-side inputs for one tick
#[derive(Debug, Clone, Copy)]
pub struct ViewerState<'a> {
    pub position: ViewerPos,

    /// World the viewer is in
    pub world: &'a str,

    pub client: &'a ClientConfig,
}

/// What changed during a tick
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TickReport {
    /// Screens with a running decode session
    pub active_sessions: usize,

    /// Refreshed overlay text; an empty string clears the line
    pub overlay: Option<String>,

    /// Raised once per screen and URL
    pub delete_prompt: Option<DeletePrompt>,
}

/// Canonical world key; default world folder names map to their dimension keys
pub fn normalize_world(name: &str) -> String {
    let name = name.trim().to_ascii_lowercase();
    let canonical = match name.as_str() {
        "world" | "overworld" => "minecraft:overworld",
        "world_nether" | "nether" | "the_nether" => "minecraft:the_nether",
        "world_the_end" | "the_end" | "end" => "minecraft:the_end",
        _ => return name,
    };
    canonical.to_string()
}

/// Whether a screen in `screen_world` plays for a viewer in `viewer_world`
///
/// Namespaced dimension keys must match exactly; anything else is compatible.
pub fn world_compatible(screen_world: &str, viewer_world: &str) -> bool {
    let (screen, viewer) = (normalize_world(screen_world), normalize_world(viewer_world));
    if screen.is_empty() || viewer.is_empty() {
        return true;
    }
    if screen.starts_with(MINECRAFT_NAMESPACE) && viewer.starts_with(MINECRAFT_NAMESPACE) {
        return screen == viewer;
    }
    true
}

/// All screens known to one client
pub struct ScreenManager {
    ctx: Arc<PlaybackContext>,
    playback: PlaybackConfig,
    surfaces: SurfaceFactory,

    /// Keyed by lower-cased name
    screens: HashMap<String, Screen>,

    clock: ServerClock,
    global_gain: f32,
    hear_radius: i32,

    /// World of the previous tick
    world_key: Option<String>,

    last_overlay: Option<Instant>,

    /// `name_url` identities already prompted for
    prompted: HashSet<String>,
    pending_delete: Option<DeletePrompt>,
}

impl ScreenManager {
    pub fn new(ctx: Arc<PlaybackContext>, playback: &PlaybackConfig, surfaces: SurfaceFactory) -> Self {
        Self {
            ctx,
            playback: playback.clone(),
            surfaces,
            screens: HashMap::new(),
            clock: ServerClock::default(),
            global_gain: 1.0,
            hear_radius: 100,
            world_key: None,
            last_overlay: None,
            prompted: HashSet::new(),
            pending_delete: None,
        }
    }

    pub fn context(&self) -> &Arc<PlaybackContext> {
        &self.ctx
    }

    /// Apply a broadcast received at local time `local_ms`
    ///
    /// Screens missing from the message are removed. Screens that are not
    /// playing or have no URL are hard-stopped.
    pub fn apply_sync(&mut self, message: SyncMessage, local_ms: i64) {
        self.clock.on_sync(message.server_now_ms, local_ms);
        self.global_gain = message.global_gain;
        self.hear_radius = message.hear_radius;
        let server_now = self.clock.estimate(local_ms);

        let incoming: HashSet<String> = message.screens.iter().map(ScreenDescriptor::key).collect();
        self.screens.retain(|key, screen| {
            let keep = incoming.contains(key);
            if !keep {
                info!("Screen {} removed", screen.name());
                screen.hard_stop();
            }
            keep
        });

        for descriptor in message.screens {
            let key = descriptor.key();
            if let Some(screen) = self.screens.get_mut(&key) {
                screen.update_state(descriptor, server_now);
                continue;
            }
            debug!("Screen {} created in {}", descriptor.name, descriptor.world);
            let surface = (self.surfaces)(&descriptor);
            let screen = Screen::new(descriptor, Arc::clone(&self.ctx), &self.playback, surface);
            self.screens.insert(key, screen);
        }

        for screen in self.screens.values_mut() {
            let d = screen.descriptor();
            if !d.playing || !d.has_url() {
                screen.hard_stop();
            }
        }
    }

    /// Advance every screen by one presentation tick
    pub fn tick(&mut self, viewer: &ViewerState<'_>, now: Instant) -> TickReport {
        let world = normalize_world(viewer.world);
        if self.world_key.as_deref() != Some(world.as_str()) {
            if let Some(previous) = self.world_key.as_deref() {
                info!("Viewer moved from {} to {}, stopping all screens", previous, world);
                self.stop_all();
            }
            self.world_key = Some(world.clone());
        }

        let local_now_ms = ServerClock::local_now_ms();
        let server_now_ms = self.clock.estimate(local_now_ms);
        let input = TickInput {
            viewer: viewer.position,
            hear_radius: self.hear_radius,
            global_gain: self.global_gain,
            server_now_ms,
            local_now_ms,
            now,
            client: viewer.client,
        };

        let mut report = TickReport::default();
        for screen in self.screens.values_mut() {
            if !world_compatible(&screen.descriptor().world, &world) {
                screen.hard_stop();
                continue;
            }
            screen.tick_playback(&input);
            if screen.is_playing() {
                report.active_sessions += 1;
            }
        }

        for screen in self.screens.values() {
            if !screen.has_ended() {
                continue;
            }
            let Some(file) = screen.cached_file() else {
                continue;
            };
            let identity = format!("{}_{}", screen.descriptor().key(), screen.descriptor().url.trim());
            if self.prompted.insert(identity) {
                let prompt = DeletePrompt {
                    screen: screen.name().to_string(),
                    path: file.path,
                    bytes: file.bytes,
                };
                info!("Offering to delete {} ({} bytes)", prompt.path.display(), prompt.bytes);
                self.pending_delete = Some(prompt.clone());
                report.delete_prompt = Some(prompt);
            }
        }

        let overlay_due = self
            .last_overlay
            .map(|at| now.saturating_duration_since(at) >= OVERLAY_INTERVAL)
            .unwrap_or(true);
        if viewer.client.render_video && viewer.client.actionbar_timeline && overlay_due {
            self.last_overlay = Some(now);
            report.overlay = Some(self.overlay_text(viewer.position, &world, server_now_ms, now));
        }

        report
    }

    /// Present due frames on every screen; returns the number of uploads
    pub fn render(&mut self, now_ns: u64) -> usize {
        let mut uploads = 0;
        for screen in self.screens.values_mut() {
            if screen.render(now_ns) {
                uploads += 1;
            }
        }
        uploads
    }

    /// Hard-stop every screen
    pub fn stop_all(&mut self) {
        for screen in self.screens.values_mut() {
            screen.hard_stop();
        }
    }

    /// Delete the file of the last delete prompt
    pub fn delete_pending_file(&mut self) -> bool {
        let Some(prompt) = self.pending_delete.take() else {
            return false;
        };
        let deleted = self.ctx.disk.delete_file(&prompt.path);
        if deleted {
            self.ctx.meta.invalidate_local();
            info!("Deleted {} after playback", prompt.path.display());
        }
        deleted
    }

    pub fn pending_delete(&self) -> Option<&DeletePrompt> {
        self.pending_delete.as_ref()
    }

    /// Screen by name, case-insensitive
    pub fn screen(&self, name: &str) -> Option<&Screen> {
        self.screens.get(&name.to_lowercase())
    }

    pub fn screens(&self) -> impl Iterator<Item = &Screen> {
        self.screens.values()
    }

    pub fn len(&self) -> usize {
        self.screens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.screens.is_empty()
    }

    pub fn clock(&self) -> &ServerClock {
        &self.clock
    }

    pub fn find_nearest_playing(&self, viewer: ViewerPos) -> Option<&Screen> {
        self.nearest(viewer, |s| s.is_playing())
    }

    /// Nearest playing screen within `radius` blocks; `radius <= 0` is unbounded
    pub fn find_nearest_playing_within(&self, viewer: ViewerPos, radius: i32) -> Option<&Screen> {
        self.nearest(viewer, |s| s.is_playing() && s.descriptor().within_radius(viewer, radius))
    }

    pub fn status(&self) -> Vec<ScreenStatus> {
        let server_now = self.clock.now();
        let now_ns = monotonic_ns();
        let mut all: Vec<ScreenStatus> = self.screens.values().map(|s| s.status(server_now, now_ns)).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    fn nearest(&self, viewer: ViewerPos, accept: impl Fn(&Screen) -> bool) -> Option<&Screen> {
        self.screens
            .values()
            .filter(|s| accept(s))
            .min_by(|a, b| {
                a.descriptor()
                    .distance_sq(viewer)
                    .total_cmp(&b.descriptor().distance_sq(viewer))
            })
    }

    fn overlay_text(&self, viewer: ViewerPos, world: &str, server_now_ms: i64, now: Instant) -> String {
        let candidate = self.nearest(viewer, |s| {
            world_compatible(&s.descriptor().world, world)
                && s.descriptor().within_radius(viewer, self.hear_radius)
                && (s.is_playing() || s.is_ended_at(now))
        });

        let Some(screen) = candidate else {
            return String::new();
        };
        if let Some(progress) = screen.download() {
            return download_line(&progress);
        }
        if screen.has_ended() {
            return String::new();
        }
        timeline_line(
            screen.name(),
            screen.display_position_ms(server_now_ms, monotonic_ns()),
            screen.duration_ms(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::NullAudioBackend;
    use crate::decoder::session::test_support::{context, wait_until, SynthBackend};
    use crate::player::ScreenPhase;
    use crate::renderer::HeadlessSurface;
    use crate::sync::descriptor::test_screen;
    use std::path::{Path, PathBuf};

    const NEAR: ViewerPos = ViewerPos::new(8.0, 68.0, 4.0);

    fn manager(cache: &Path, frames: usize) -> ScreenManager {
        let backend = Arc::new(SynthBackend::new(frames, 30.0));
        let ctx = context(cache, backend, Arc::new(NullAudioBackend::new(false)));
        ScreenManager::new(
            ctx,
            &PlaybackConfig::default(),
            Box::new(|_: &ScreenDescriptor| Box::new(HeadlessSurface::new()) as Box<dyn Surface>),
        )
    }

    fn clip(dir: &Path) -> PathBuf {
        std::fs::create_dir_all(dir).unwrap();
        let path = dir.join("clip.mp4");
        std::fs::write(&path, b"synthetic").unwrap();
        path
    }

    fn sync(screens: Vec<ScreenDescriptor>) -> SyncMessage {
        SyncMessage::new(1.0, 100, 0, screens)
    }

    #[test]
    fn test_world_normalization() {
        assert_eq!(normalize_world("World"), "minecraft:overworld");
        assert_eq!(normalize_world("world_nether"), "minecraft:the_nether");
        assert_eq!(normalize_world("world_the_end"), "minecraft:the_end");
        assert_eq!(normalize_world("Creative"), "creative");

        assert!(world_compatible("world", "minecraft:overworld"));
        assert!(!world_compatible("minecraft:overworld", "minecraft:the_nether"));
        assert!(world_compatible("lobby", "minecraft:the_nether"));
        assert!(world_compatible("", "minecraft:the_end"));
    }

    #[test]
    fn test_apply_sync_creates_updates_and_removes() {
        let dir = tempfile::tempdir().unwrap();
        let mut mgr = manager(&dir.path().join("cache"), 10);

        mgr.apply_sync(sync(vec![test_screen("Lobby", ""), test_screen("Hall", "")]), 1);
        assert_eq!(mgr.len(), 2);
        assert!(mgr.screen("lobby").is_some());
        assert!(mgr.screen("LOBBY").is_some());

        let mut renamed_case = test_screen("LOBBY", "https://a/b.mp4");
        renamed_case.volume = 0.5;
        mgr.apply_sync(sync(vec![renamed_case]), 2);
        assert_eq!(mgr.len(), 1);
        assert_eq!(mgr.screen("lobby").unwrap().descriptor().volume, 0.5);
        assert!(mgr.screen("hall").is_none());
    }

    #[test]
    fn test_tick_starts_screens_and_stops_on_world_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = clip(dir.path());
        let mut mgr = manager(&dir.path().join("cache"), 100_000);
        mgr.apply_sync(sync(vec![test_screen("Lobby", &path.to_string_lossy())]), 1);

        let client = ClientConfig::default();
        let overworld = ViewerState {
            position: NEAR,
            world: "minecraft:overworld",
            client: &client,
        };
        let report = mgr.tick(&overworld, Instant::now());
        assert_eq!(report.active_sessions, 1);
        assert!(mgr.find_nearest_playing(NEAR).is_some());
        assert!(mgr.find_nearest_playing_within(ViewerPos::new(9_000.0, 0.0, 0.0), 10).is_none());

        let nether = ViewerState {
            world: "minecraft:the_nether",
            ..overworld
        };
        let report = mgr.tick(&nether, Instant::now());
        assert_eq!(report.active_sessions, 0);
        assert_eq!(mgr.screen("lobby").unwrap().phase(), ScreenPhase::Idle);
    }

    #[test]
    fn test_overlay_refresh_cadence() {
        let dir = tempfile::tempdir().unwrap();
        let path = clip(dir.path());
        let mut mgr = manager(&dir.path().join("cache"), 100_000);
        mgr.apply_sync(sync(vec![test_screen("Lobby", &path.to_string_lossy())]), 1);

        let client = ClientConfig::default();
        let viewer = ViewerState {
            position: NEAR,
            world: "world",
            client: &client,
        };
        let t0 = Instant::now();
        let first = mgr.tick(&viewer, t0).overlay.unwrap();
        assert!(first.starts_with("Lobby: 0:"), "overlay was {:?}", first);
        assert!(mgr.tick(&viewer, t0 + Duration::from_millis(100)).overlay.is_none());
        assert!(mgr.tick(&viewer, t0 + OVERLAY_INTERVAL).overlay.is_some());

        let hidden = ClientConfig {
            actionbar_timeline: false,
            ..ClientConfig::default()
        };
        let quiet = ViewerState {
            client: &hidden,
            ..viewer
        };
        assert!(mgr.tick(&quiet, t0 + OVERLAY_INTERVAL * 4).overlay.is_none());
    }

    #[test]
    fn test_delete_prompt_is_one_shot() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("cache");
        let path = clip(&cache);
        let mut mgr = manager(&cache, 20);
        mgr.apply_sync(sync(vec![test_screen("Lobby", &path.to_string_lossy())]), 1);

        let client = ClientConfig::default();
        let viewer = ViewerState {
            position: NEAR,
            world: "minecraft:overworld",
            client: &client,
        };

        let mut prompts = Vec::new();
        assert!(wait_until(Duration::from_secs(10), || {
            if let Some(prompt) = mgr.tick(&viewer, Instant::now()).delete_prompt {
                prompts.push(prompt);
            }
            mgr.render(monotonic_ns());
            mgr.screen("lobby").map(|s| s.has_ended()).unwrap_or(false) && !prompts.is_empty()
        }));
        for _ in 0..5 {
            assert!(mgr.tick(&viewer, Instant::now()).delete_prompt.is_none());
        }

        assert_eq!(prompts.len(), 1);
        assert_eq!(prompts[0].screen, "Lobby");
        assert_eq!(prompts[0].bytes, 9);
        assert!(mgr.delete_pending_file());
        assert!(!path.exists());
        assert!(!mgr.delete_pending_file());
    }
}
