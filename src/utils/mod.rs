//! Utility module for collins-screen
//!
//! This module provides common utilities used throughout the engine:
//! - Error handling with custom error types
//! - Configuration management
//! - Process clocks (monotonic nanoseconds, wall-clock epoch milliseconds)
//! - Timeline formatting

pub mod config;
pub mod error;

pub use config::{CacheConfig, ClientConfig, Config, GeneralConfig, PlaybackConfig};
pub use error::{CollinsError, Result};

use once_cell::sync::Lazy;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

static CLOCK_BASE: Lazy<Instant> = Lazy::new(Instant::now);

/// Initialize the engine configuration
///
/// Loads configuration from:
/// 1. Default values
/// 2. System configuration file
/// 3. User configuration file
/// 4. Environment variables
pub fn load_config() -> Result<Config> {
    Config::load()
}

/// Cooperative cancellation check for long-running work
///
/// Network walks, downloads and waits poll this between steps and abandon
/// their work once it reports `false`.
pub trait Liveness: Sync {
    fn is_live(&self) -> bool;
}

impl<F: Fn() -> bool + Sync> Liveness for F {
    fn is_live(&self) -> bool {
        self()
    }
}

/// Liveness that never expires
pub struct AlwaysLive;

impl Liveness for AlwaysLive {
    fn is_live(&self) -> bool {
        true
    }
}

/// Monotonic nanoseconds since the first call in this process
///
/// Never returns 0, so 0 can mean "unset" in atomics.
pub fn monotonic_ns() -> u64 {
    CLOCK_BASE.elapsed().as_nanos() as u64 + 1
}

/// Wall-clock milliseconds since the Unix epoch
pub fn epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Format a timeline position for display
///
/// Returns "H:MM:SS" from one hour upwards, "M:SS" below. Negative input renders as zero.
pub fn format_ms(ms: i64) -> String {
    let total_secs = ms.max(0) / 1000;
    let hours = total_secs / 3600;
    let minutes = (total_secs / 60) % 60;
    let seconds = total_secs % 60;

    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{}:{:02}", minutes, seconds)
    }
}
