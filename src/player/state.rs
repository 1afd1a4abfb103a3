//! Screen state types
//!
//! Passive, queryable state for the host UI layer. Nothing here drives
//! playback; [`Screen`](crate::player::Screen) derives it every tick.

use crate::cache::DownloadProgress;
use crate::utils::format_ms;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Lifecycle of a screen's playback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScreenPhase {
    /// No URL, not playing, or stopped
    Idle,

    /// Session launched, stream not yet open
    Starting,

    /// Waiting for video pre-roll
    Buffering,

    Playing,

    /// Viewer out of range; display position held, audio muted
    Frozen,

    /// Natural end reached; position pinned at the duration
    Ended,
}

impl fmt::Display for ScreenPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScreenPhase::Idle => "idle",
            ScreenPhase::Starting => "starting",
            ScreenPhase::Buffering => "buffering",
            ScreenPhase::Playing => "playing",
            ScreenPhase::Frozen => "frozen",
            ScreenPhase::Ended => "ended",
        };
        f.write_str(name)
    }
}

/// Snapshot of one screen for display or logging
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScreenStatus {
    pub name: String,
    pub url: String,
    pub phase: ScreenPhase,
    pub position_ms: i64,

    /// 0 when unknown
    pub duration_ms: i64,

    pub download: Option<DownloadProgress>,
    pub frames_presented: u64,
}

/// Cached file offered for deletion after it finished playing
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeletePrompt {
    pub screen: String,
    pub path: PathBuf,
    pub bytes: u64,
}

/// Timeline overlay line, e.g. `lobby: 1:05 / 3:20`
pub fn timeline_line(name: &str, position_ms: i64, duration_ms: i64) -> String {
    if duration_ms > 0 {
        format!("{}: {} / {}", name, format_ms(position_ms), format_ms(duration_ms))
    } else {
        format!("{}: {}", name, format_ms(position_ms))
    }
}

/// Download overlay line
pub fn download_line(progress: &DownloadProgress) -> String {
    match (progress.percent(), progress.total_mib()) {
        (Some(percent), Some(total)) => format!(
            "Downloading: {}% ({} MB / {} MB)",
            percent,
            progress.downloaded_mib(),
            total
        ),
        _ => format!("Downloading: {} MB...", progress.downloaded_mib()),
    }
}
