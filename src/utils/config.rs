//! Configuration management for collins-screen
//!
//! This module handles loading and managing engine configuration
//! from config files and environment variables.

use crate::utils::error::{CollinsError, IntoCollinsError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Name of the cache folder created under the platform cache directory
pub const CACHE_DIR_NAME: &str = "collins-cache";

/// Main engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Per-client presentation settings
    pub client: ClientConfig,

    /// Disk cache configuration
    pub cache: CacheConfig,

    /// Raster sizing and frame buffering
    pub playback: PlaybackConfig,

    /// General settings
    pub general: GeneralConfig,
}

/// Client-side presentation settings, supplied to the core every tick
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Globally enable decoding and rendering
    pub render_video: bool,

    /// Local volume in percent (0 - 100)
    pub local_volume_percent: u8,

    /// Show the textual timeline overlay
    pub actionbar_timeline: bool,
}

/// Disk cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Cache directory override
    pub directory: Option<PathBuf>,

    /// Maximum resident bytes
    pub max_bytes: u64,

    /// Suppression window after a failed download
    pub failure_cooldown_ms: u64,

    /// Lifetime of resolved stream metadata
    pub meta_ttl_secs: u64,

    /// How long to wait for another download of the same key
    pub wait_for_part_secs: u64,
}

/// Raster sizing and frame buffering
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Pixels per screen block
    pub px_per_block: u32,

    pub min_width: u32,
    pub min_height: u32,
    pub max_width: u32,
    pub max_height: u32,

    /// Frame queue capacity
    pub queue_capacity: usize,

    /// Frames required before presentation starts
    pub preroll_frames: usize,

    /// Pre-allocated pixel buffers per screen
    pub pool_size: usize,
}

/// General settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,

    /// User agent sent by the resolver, the cache and the demuxer
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            render_video: true,
            local_volume_percent: 100,
            actionbar_timeline: true,
        }
    }
}

impl ClientConfig {
    /// Local gain multiplier in [0, 1]
    pub fn local_volume_multiplier(&self) -> f32 {
        (self.local_volume_percent as f32 / 100.0).clamp(0.0, 1.0)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            directory: None,
            max_bytes: 4 * 1024 * 1024 * 1024,
            failure_cooldown_ms: 10_000,
            meta_ttl_secs: 15 * 60,
            wait_for_part_secs: 300,
        }
    }
}

impl CacheConfig {
    /// Resolved cache directory
    pub fn cache_dir(&self) -> PathBuf {
        if let Some(dir) = &self.directory {
            return dir.clone();
        }
        dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(CACHE_DIR_NAME)
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            px_per_block: 128,
            min_width: 256,
            min_height: 144,
            max_width: 1980,
            max_height: 1080,
            queue_capacity: 45,
            preroll_frames: 15,
            pool_size: 60,
        }
    }
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64)".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from various sources
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default values
    /// 2. System config file (/etc/collins/config.toml on Linux)
    /// 3. User config file (~/.config/collins/config.toml on Linux)
    /// 4. Environment variables (COLLINS_* prefix)
    pub fn load() -> Result<Self> {
        let mut config = Self::default();

        if let Some(system_path) = Self::system_config_path() {
            if system_path.exists() {
                config = Self::from_file(&system_path)?;
            }
        }

        if let Some(user_path) = Self::user_config_path() {
            if user_path.exists() {
                config = Self::from_file(&user_path)?;
            }
        }

        config.apply_env_overrides()?;
        config.validate()?;

        Ok(config)
    }

    /// Save configuration to user config file
    pub fn save(&self) -> Result<()> {
        let path = Self::user_config_path()
            .ok_or_else(|| CollinsError::Config("Cannot determine user config path".to_string()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).config_err("Failed to create config directory")?;
        }

        let toml = toml::to_string_pretty(self).config_err("Failed to serialize config")?;
        std::fs::write(&path, toml).config_err("Failed to write config file")?;

        Ok(())
    }

    /// Parse a TOML file; missing keys keep their defaults
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).config_err("Failed to read config file")?;
        toml::from_str(&contents).config_err("Failed to parse config file")
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(render) = std::env::var("COLLINS_RENDER_VIDEO") {
            self.client.render_video = parse_bool(&render)
                .ok_or_else(|| CollinsError::Config("Invalid COLLINS_RENDER_VIDEO".to_string()))?;
        }

        if let Ok(volume) = std::env::var("COLLINS_LOCAL_VOLUME") {
            self.client.local_volume_percent = volume
                .parse()
                .map_err(|_| CollinsError::Config("Invalid COLLINS_LOCAL_VOLUME".to_string()))?;
        }

        if let Ok(dir) = std::env::var("COLLINS_CACHE_DIR") {
            self.cache.directory = Some(PathBuf::from(dir));
        }

        if let Ok(max) = std::env::var("COLLINS_CACHE_MAX_BYTES") {
            self.cache.max_bytes = max
                .parse()
                .map_err(|_| CollinsError::Config("Invalid COLLINS_CACHE_MAX_BYTES".to_string()))?;
        }

        if let Ok(log_level) = std::env::var("COLLINS_LOG_LEVEL") {
            self.general.log_level = log_level;
        }

        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.client.local_volume_percent > 100 {
            return Err(CollinsError::Config("Local volume must be between 0 and 100".to_string()));
        }

        if self.cache.max_bytes == 0 {
            return Err(CollinsError::Config("Cache ceiling must be non-zero".to_string()));
        }

        let p = &self.playback;
        if p.px_per_block == 0 {
            return Err(CollinsError::Config("Pixels per block must be non-zero".to_string()));
        }
        if p.min_width == 0 || p.min_height == 0 || p.min_width > p.max_width || p.min_height > p.max_height {
            return Err(CollinsError::Config(format!(
                "Invalid raster bounds {}x{} .. {}x{}",
                p.min_width, p.min_height, p.max_width, p.max_height
            )));
        }
        if p.preroll_frames == 0 || p.preroll_frames > p.queue_capacity {
            return Err(CollinsError::Config("Pre-roll must be within 1..=queue_capacity".to_string()));
        }
        if p.pool_size < p.queue_capacity {
            return Err(CollinsError::Config("Buffer pool must be at least the queue capacity".to_string()));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.general.log_level.as_str()) {
            return Err(CollinsError::Config(format!(
                "Invalid log level '{}', must be one of: {:?}",
                self.general.log_level, valid_log_levels
            )));
        }

        Ok(())
    }

    /// Get system config file path
    fn system_config_path() -> Option<PathBuf> {
        #[cfg(target_os = "linux")]
        return Some(PathBuf::from("/etc/collins/config.toml"));

        #[cfg(target_os = "windows")]
        return std::env::var("PROGRAMDATA")
            .ok()
            .map(|p| PathBuf::from(p).join("Collins").join("config.toml"));

        #[cfg(target_os = "macos")]
        return Some(PathBuf::from("/Library/Application Support/Collins/config.toml"));

        #[allow(unreachable_code)]
        None
    }

    /// Get user config file path
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("collins").join("config.toml"))
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
