use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use env_logger::Env;
use log::{error, info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use collins_screen::decoder::{MediaInput, PlaybackContext};
use collins_screen::net::is_http;
use collins_screen::player::{ScreenManager, ScreenPhase, ViewerState};
use collins_screen::renderer::{HeadlessSurface, Surface};
use collins_screen::sync::{decode_frame, BlockPos, PlaneAxis, ScreenDescriptor, ServerClock, SyncMessage};
use collins_screen::utils::{epoch_ms, format_ms, monotonic_ns, AlwaysLive, Config};

const TICK: Duration = Duration::from_millis(50);
const STATUS_INTERVAL: Duration = Duration::from_secs(1);
const WORLD: &str = "minecraft:overworld";

/// Collins screen client - synchronized video playback for in-world screens
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Configuration file (defaults to the user config)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Print machine-readable JSON instead of log lines
    #[arg(long, global = true)]
    json: bool,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Play a URL or file onto a headless screen until it ends
    Play {
        #[arg(value_name = "URL")]
        url: String,

        /// Screen size in blocks
        #[arg(long, value_name = "WxH", default_value = "16x9", value_parser = parse_blocks)]
        blocks: (u32, u32),

        /// Restart at the end instead of stopping
        #[arg(long = "loop")]
        looping: bool,

        /// Start position
        #[arg(long, value_name = "MS", default_value_t = 0)]
        seek_ms: i64,
    },

    /// Decode a captured sync frame and print its screens
    Inspect {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },

    /// Resolve and probe a source without playing it
    Probe {
        #[arg(value_name = "URL")]
        target: String,
    },

    /// Manage the disk cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand, Debug)]
enum CacheAction {
    /// Show size and location
    Info,

    /// Remove every finalized entry
    Clear,

    /// Open the cache folder in the file browser
    Open,

    /// Delete one cached file
    Delete {
        #[arg(value_name = "PATH")]
        path: PathBuf,
    },
}

fn parse_blocks(value: &str) -> std::result::Result<(u32, u32), String> {
    let (w, h) = value
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected WxH, got {:?}", value))?;
    let w: u32 = w.trim().parse().map_err(|_| format!("bad width {:?}", w))?;
    let h: u32 = h.trim().parse().map_err(|_| format!("bad height {:?}", h))?;
    if w == 0 || h == 0 {
        return Err("screen size must be positive".to_string());
    }
    Ok((w, h))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::load()?,
    };

    let log_level = if args.debug { "debug" } else { config.general.log_level.as_str() };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_timestamp_millis()
        .init();

    info!("Starting collins-screen v{}", env!("CARGO_PKG_VERSION"));

    match args.command {
        Command::Play {
            url,
            blocks,
            looping,
            seek_ms,
        } => play(&config, url, blocks, looping, seek_ms, args.json).await,
        Command::Inspect { file } => inspect(&file, args.json),
        Command::Probe { target } => probe(&config, &target, args.json),
        Command::Cache { action } => cache(&config, action, args.json),
    }
}

fn screen_for(url: String, (w, h): (u32, u32), looping: bool, seek_ms: i64, now_ms: i64) -> ScreenDescriptor {
    let (w, h) = (w as i32, h as i32);
    ScreenDescriptor {
        name: "cli".to_string(),
        world: WORLD.to_string(),
        corner_a: BlockPos::new(0, 64, 0),
        corner_b: BlockPos::new(w - 1, 64 + h - 1, 0),
        axis: PlaneAxis::XY,
        url,
        playing: true,
        looping,
        volume: 1.0,
        start_epoch_ms: now_ms,
        base_pos_ms: seek_ms.max(0),
    }
}

async fn play(config: &Config, url: String, blocks: (u32, u32), looping: bool, seek_ms: i64, json: bool) -> Result<()> {
    let ctx = Arc::new(PlaybackContext::system(config));
    let mut manager = ScreenManager::new(
        ctx,
        &config.playback,
        Box::new(|_: &ScreenDescriptor| Box::new(HeadlessSurface::new()) as Box<dyn Surface>),
    );

    let now_ms = epoch_ms();
    let descriptor = screen_for(url, blocks, looping, seek_ms, now_ms);
    let position = descriptor.center();
    manager.apply_sync(SyncMessage::new(1.0, 0, now_ms, vec![descriptor]), ServerClock::local_now_ms());

    let viewer = ViewerState {
        position,
        world: WORLD,
        client: &config.client,
    };

    let mut ticker = tokio::time::interval(TICK);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut last_status = Instant::now();
    let mut uploads: u64 = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = &mut ctrl_c => {
                info!("Interrupted");
                break;
            }
        }

        let report = tokio::task::block_in_place(|| {
            let report = manager.tick(&viewer, Instant::now());
            uploads += manager.render(monotonic_ns()) as u64;
            report
        });

        if let Some(text) = report.overlay.filter(|t| !t.is_empty()) {
            info!("{}", text);
        }
        if let Some(prompt) = report.delete_prompt {
            info!(
                "Finished playing cached file {} ({} MB); remove it with `collins-screen cache delete`",
                prompt.path.display(),
                prompt.bytes / (1024 * 1024)
            );
        }

        if last_status.elapsed() >= STATUS_INTERVAL {
            last_status = Instant::now();
            for status in manager.status() {
                if json {
                    println!("{}", serde_json::to_string(&status)?);
                } else {
                    info!(
                        "{} {} at {} ({} frames shown)",
                        status.name,
                        status.phase,
                        format_ms(status.position_ms),
                        status.frames_presented
                    );
                }
            }
        }

        let Some(screen) = manager.screen("cli") else {
            bail!("screen disappeared");
        };
        if screen.phase() == ScreenPhase::Ended && screen.queued_frames() == 0 && !looping {
            info!("Playback ended after {} ({} frames uploaded)", format_ms(screen.duration_ms()), uploads);
            break;
        }
        if screen.phase() == ScreenPhase::Idle {
            error!("Playback failed; see the log above");
            break;
        }
    }

    manager.stop_all();
    Ok(())
}

fn probe(config: &Config, target: &str, json: bool) -> Result<()> {
    let ctx = PlaybackContext::system(config);

    let input = if is_http(target) {
        let probe = ctx.resolver.resolve_reachable(target, &AlwaysLive)?;
        info!(
            "Resolved {} -> {} (HTTP {}, {})",
            target,
            probe.final_url,
            probe.status,
            probe.content_type.as_deref().unwrap_or("no content type")
        );
        if probe.needs_disk_cache() {
            warn!("Source is not streamable; playback would download it first");
        }
        let hint = probe.is_mp4().then(|| "mp4".to_string());
        MediaInput::remote(probe.final_url, hint)
    } else {
        MediaInput::local(target.strip_prefix("file://").unwrap_or(target))
    };

    let meta = ctx.media.probe(&input)?.normalized();
    if json {
        println!(
            "{}",
            serde_json::json!({
                "location": input.location(),
                "width": meta.width,
                "height": meta.height,
                "fps": meta.fps,
                "duration_ms": meta.duration_ms,
            })
        );
    } else {
        println!(
            "{}: {}x{} @ {:.2} fps, {}",
            input.location(),
            meta.width,
            meta.height,
            meta.fps,
            if meta.duration_ms > 0 { format_ms(meta.duration_ms) } else { "unknown duration".to_string() }
        );
    }
    Ok(())
}

fn inspect(file: &Path, json: bool) -> Result<()> {
    let bytes = std::fs::read(file).with_context(|| format!("reading {}", file.display()))?;
    let message = decode_frame(&bytes)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&message.screens)?);
        return Ok(());
    }

    println!(
        "v{} gain {:.2} radius {} server time {} ms, {} screen(s)",
        message.version,
        message.global_gain,
        message.hear_radius,
        message.server_now_ms,
        message.screens.len()
    );
    for screen in &message.screens {
        let (w, h) = screen.blocks_wh();
        println!(
            "  {} [{}] {}x{} {} {}{}",
            screen.name,
            screen.world,
            w,
            h,
            if screen.url.is_empty() { "<no url>" } else { screen.url.as_str() },
            if screen.playing { "playing" } else { "stopped" },
            if screen.looping { " looping" } else { "" }
        );
    }
    Ok(())
}

fn cache(config: &Config, action: CacheAction, json: bool) -> Result<()> {
    let ctx = PlaybackContext::system(config);
    match action {
        CacheAction::Info => {
            let info = ctx.disk.info();
            if json {
                println!("{}", serde_json::to_string(&info)?);
            } else {
                println!("Cache: {}", info.directory.display());
                println!(
                    "  {} file(s), {} MB of {} MB",
                    info.file_count,
                    info.total_bytes / (1024 * 1024),
                    ctx.disk.max_bytes() / (1024 * 1024)
                );
                if let Some(free) = info.free_bytes {
                    println!("  {} MB free on disk", free / (1024 * 1024));
                }
            }
        }
        CacheAction::Clear => {
            let freed = ctx.disk.clear();
            ctx.meta.invalidate_local();
            info!("Freed {} MB", freed / (1024 * 1024));
        }
        CacheAction::Open => ctx.disk.open_in_file_browser()?,
        CacheAction::Delete { path } => {
            if !ctx.disk.delete_file(&path) {
                bail!("{} is not a file in {}", path.display(), ctx.disk.dir().display());
            }
            ctx.meta.invalidate_local();
            info!("Deleted {}", path.display());
        }
    }
    Ok(())
}
