//! Per-screen snapshot carried by every synchronization update

use serde::Serialize;

/// Integer block coordinate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct BlockPos {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl BlockPos {
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }
}

/// Continuous viewer position
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct ViewerPos {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl ViewerPos {
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }
}

/// Plane a screen lies in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum PlaneAxis {
    #[default]
    XY,
    XZ,
    YZ,
}

impl PlaneAxis {
    /// Unknown wire values fall back to `XY`
    pub fn from_wire(value: i8) -> Self {
        match value {
            1 => PlaneAxis::XZ,
            2 => PlaneAxis::YZ,
            _ => PlaneAxis::XY,
        }
    }

    pub fn to_wire(self) -> i8 {
        match self {
            PlaneAxis::XY => 0,
            PlaneAxis::XZ => 1,
            PlaneAxis::YZ => 2,
        }
    }
}

/// Immutable description of one screen
///
/// Replaced wholesale on every update, never edited in place.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScreenDescriptor {
    pub name: String,

    /// World scope id the screen lives in
    pub world: String,

    pub corner_a: BlockPos,
    pub corner_b: BlockPos,
    pub axis: PlaneAxis,

    /// Logical source URL, empty when unset
    pub url: String,

    pub playing: bool,
    pub looping: bool,

    /// Per-screen gain
    pub volume: f32,

    /// Server time the anchor was taken, 0 when unknown
    pub start_epoch_ms: i64,

    /// Timeline position at `start_epoch_ms`
    pub base_pos_ms: i64,
}

impl ScreenDescriptor {
    /// Lower-cased name used as the screen's identity
    pub fn key(&self) -> String {
        self.name.to_lowercase()
    }

    pub fn has_url(&self) -> bool {
        !self.url.trim().is_empty()
    }

    fn min_max(&self) -> (BlockPos, BlockPos) {
        let (a, b) = (self.corner_a, self.corner_b);
        (
            BlockPos::new(a.x.min(b.x), a.y.min(b.y), a.z.min(b.z)),
            BlockPos::new(a.x.max(b.x), a.y.max(b.y), a.z.max(b.z)),
        )
    }

    /// Screen size in blocks (width, height), both inclusive extents
    pub fn blocks_wh(&self) -> (u32, u32) {
        let (min, max) = self.min_max();
        let extent = |lo: i32, hi: i32| (hi as i64 - lo as i64 + 1).max(1) as u32;
        let (dx, dy, dz) = (extent(min.x, max.x), extent(min.y, max.y), extent(min.z, max.z));
        match self.axis {
            PlaneAxis::XY => (dx, dy),
            PlaneAxis::XZ => (dx, dz),
            PlaneAxis::YZ => (dz, dy),
        }
    }

    /// Centre of the occupied block volume
    pub fn center(&self) -> ViewerPos {
        let (min, max) = self.min_max();
        let mid = |lo: i32, hi: i32| (lo as f64 + hi as f64 + 1.0) / 2.0;
        ViewerPos::new(mid(min.x, max.x), mid(min.y, max.y), mid(min.z, max.z))
    }

    pub fn distance_sq(&self, viewer: ViewerPos) -> f64 {
        let c = self.center();
        let (dx, dy, dz) = (viewer.x - c.x, viewer.y - c.y, viewer.z - c.z);
        dx * dx + dy * dy + dz * dz
    }

    /// Whether a viewer is within the audibility radius; `radius <= 0` is unbounded
    pub fn within_radius(&self, viewer: ViewerPos, radius: i32) -> bool {
        if radius <= 0 {
            return true;
        }
        let r = radius as f64;
        self.distance_sq(viewer) <= r * r
    }
}

#[cfg(test)]
pub(crate) fn test_screen(name: &str, url: &str) -> ScreenDescriptor {
    ScreenDescriptor {
        name: name.to_string(),
        world: "minecraft:overworld".to_string(),
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
