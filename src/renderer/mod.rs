//! Presentation surface module for collins-screen
//!
//! The engine produces paced, correctly oriented rasters; turning them into an
//! on-screen textured surface belongs to the host renderer behind [`Surface`].

mod frame;

pub use frame::{bgr24_to_abgr, pack_abgr, VideoFrame};

use crate::utils::error::Result;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Host-side target for presented frames
pub trait Surface: Send {
    /// (Re)allocate the surface for a new raster size
    fn configure(&mut self, width: u32, height: u32) -> Result<()>;

    /// Upload one raster of `width * height` ABGR pixels (0xAABBGGRR, row-major)
    fn upload(&mut self, pixels: &[u32], width: u32, height: u32) -> Result<()>;

    /// Release everything the surface holds
    fn release(&mut self);
}

/// Counters published by [`HeadlessSurface`]
#[derive(Debug, Default)]
pub struct SurfaceStats {
    pub uploads: AtomicU64,
    pub configures: AtomicU64,
    pub releases: AtomicU64,
    pub width: AtomicU32,
    pub height: AtomicU32,
    /// First pixel of the last upload
    pub last_pixel: AtomicU32,
}

/// Surface without a display, used by the CLI and by tests
#[derive(Debug, Default)]
pub struct HeadlessSurface {
    stats: Arc<SurfaceStats>,
}

impl HeadlessSurface {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared view of the counters
    pub fn stats(&self) -> Arc<SurfaceStats> {
        Arc::clone(&self.stats)
    }
}

impl Surface for HeadlessSurface {
    fn configure(&mut self, width: u32, height: u32) -> Result<()> {
        self.stats.width.store(width, Ordering::Relaxed);
        self.stats.height.store(height, Ordering::Relaxed);
        self.stats.configures.fetch_add(1, Ordering::Relaxed);
        log::debug!("Surface configured {}x{}", width, height);
        Ok(())
    }

    fn upload(&mut self, pixels: &[u32], _width: u32, _height: u32) -> Result<()> {
        if let Some(first) = pixels.first() {
            self.stats.last_pixel.store(*first, Ordering::Relaxed);
        }
        self.stats.uploads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn release(&mut self) {
        self.stats.width.store(0, Ordering::Relaxed);
        self.stats.height.store(0, Ordering::Relaxed);
        self.stats.releases.fetch_add(1, Ordering::Relaxed);
    }
}
