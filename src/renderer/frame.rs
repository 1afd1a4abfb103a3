//! Decoded frame type and pixel layout conversion
//!
//! Frames travel from the decode thread to the presentation thread in the
//! ABGR layout hosts upload directly: one `u32` per pixel, `0xAABBGGRR`.

/// Decoded raster on loan from a screen's buffer pool
#[derive(Debug)]
pub struct VideoFrame {
    /// Pixel buffer, `width * height` entries
    pub pixels: Vec<u32>,

    /// Raster width
    pub width: u32,

    /// Raster height
    pub height: u32,

    /// Microseconds since the first timestamp observed by the session
    pub timestamp_us: i64,
}

impl VideoFrame {
    /// Whether the raster matches the given surface size
    pub fn matches(&self, width: u32, height: u32) -> bool {
        self.width == width && self.height == height
    }
}

/// Pack one pixel as 0xAABBGGRR with full opacity
#[inline]
pub fn pack_abgr(r: u8, g: u8, b: u8) -> u32 {
    0xFF00_0000 | ((b as u32) << 16) | ((g as u32) << 8) | r as u32
}

/// Convert a packed BGR24 raster (with row stride) into ABGR pixels
///
/// Rows shorter than `width * 3` bytes leave the remaining destination
/// pixels untouched.
pub fn bgr24_to_abgr(src: &[u8], stride: usize, width: usize, height: usize, dst: &mut [u32]) {
    let row_bytes = width * 3;
    let stride = if stride == 0 { row_bytes } else { stride };

    for y in 0..height {
        let start = y * stride;
        if start >= src.len() {
            break;
        }
        let end = (start + row_bytes).min(src.len());
        let row = &src[start..end];
        let out_start = y * width;
        let Some(out) = dst.get_mut(out_start..out_start + width) else {
            break;
        };

        for (px, bgr) in out.iter_mut().zip(row.chunks_exact(3)) {
            *px = pack_abgr(bgr[2], bgr[1], bgr[0]);
        }
    }
}
