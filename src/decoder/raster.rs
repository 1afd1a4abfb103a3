//! Target raster selection
//!
//! The decoded raster is the largest aspect-preserving size that fits the
//! screen's block extent at a fixed pixel density, within global bounds.

use crate::utils::config::PlaybackConfig;

/// Pixel density and bounds for decoded rasters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RasterLimits {
    pub px_per_block: u32,
    pub min_width: u32,
    pub min_height: u32,
    pub max_width: u32,
    pub max_height: u32,
}

impl Default for RasterLimits {
    fn default() -> Self {
        Self::from(&PlaybackConfig::default())
    }
}

impl From<&PlaybackConfig> for RasterLimits {
    fn from(p: &PlaybackConfig) -> Self {
        Self {
            px_per_block: p.px_per_block,
            min_width: p.min_width,
            min_height: p.min_height,
            max_width: p.max_width,
            max_height: p.max_height,
        }
    }
}

/// Decoded size for a screen of `blocks_w` x `blocks_h` showing a `native_w` x `native_h` source
///
/// Width is tried first at its cap; when the derived height overflows its
/// cap, height is pinned and width derived instead. Unknown native sizes are
/// treated as 16:9.
pub fn target_size(blocks_w: u32, blocks_h: u32, native_w: u32, native_h: u32, limits: &RasterLimits) -> (u32, u32) {
    let aspect = if native_w > 0 && native_h > 0 {
        native_w as f64 / native_h as f64
    } else {
        16.0 / 9.0
    };

    let clamp_w = |w: f64| (w.round().max(0.0) as u64).clamp(limits.min_width as u64, limits.max_width as u64) as u32;
    let clamp_h = |h: f64| (h.round().max(0.0) as u64).clamp(limits.min_height as u64, limits.max_height as u64) as u32;

    let cap_w = clamp_w(blocks_w.max(1) as f64 * limits.px_per_block as f64);
    let cap_h = clamp_h(blocks_h.max(1) as f64 * limits.px_per_block as f64);

    let mut w = cap_w as f64;
    let mut h = (w / aspect).round();
    if h > cap_h as f64 {
        h = cap_h as f64;
        w = (h * aspect).round();
    }

    (clamp_w(w), clamp_h(h))
}
