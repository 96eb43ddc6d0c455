//! Viewport / level-selection model (C4): stateless projection functions
//! over the slide descriptor.

use crate::cache::TileCoord;
use crate::format::{LevelInfo, SlideDescriptor};

/// A rectangle in slide pixel coordinates.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ViewportRect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl ViewportRect {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self { x, y, width, height }
    }

    /// Offset by `(dx, dy)`, used to build the velocity-predicted rect.
    pub fn offset(&self, dx: f64, dy: f64) -> Self {
        Self {
            x: self.x + dx,
            y: self.y + dy,
            width: self.width,
            height: self.height,
        }
    }

    /// Inflate by `margin` pixels on every side, used to build the spatial
    /// halo rect.
    pub fn inflate(&self, margin: f64) -> Self {
        Self {
            x: self.x - margin,
            y: self.y - margin,
            width: self.width + margin * 2.0,
            height: self.height + margin * 2.0,
        }
    }
}

/// Pick the coarsest level whose `downsample <= 1/scale`.
///
/// Among levels with enough resolution for `scale`, prefer the coarsest
/// (fewest pixels, cheapest) one rather than over-fetching detail the
/// viewer cannot see. If no level has enough resolution (viewer zoomed
/// beyond the finest level), fall back to the finest level: upscaling a
/// blurry tile looks worse than it costs to fetch.
pub fn level_for_scale(descriptor: &SlideDescriptor, scale: f64) -> u32 {
    if descriptor.levels.is_empty() {
        return 0;
    }
    if scale <= 0.0 {
        return descriptor.max_level();
    }

    let target_downsample = 1.0 / scale;
    descriptor
        .levels
        .iter()
        .filter(|l| (l.downsample as f64) <= target_downsample)
        .min_by_key(|l| l.level)
        .map(|l| l.level)
        .unwrap_or_else(|| descriptor.max_level())
}

/// All tile coordinates at `level` whose footprint intersects `rect`,
/// clipped to `[0,cols) x [0,rows)`, in row-major order.
pub fn tiles_in_rect(tile_size: u32, level_info: &LevelInfo, rect: ViewportRect) -> Vec<TileCoord> {
    if rect.width <= 0.0 || rect.height <= 0.0 || level_info.cols == 0 || level_info.rows == 0 {
        return Vec::new();
    }

    let level_tile_size = (tile_size as f64) * (level_info.downsample as f64);
    if level_tile_size <= 0.0 {
        return Vec::new();
    }

    let col_start = ((rect.x / level_tile_size).floor().max(0.0)) as u32;
    let col_end = (((rect.x + rect.width) / level_tile_size).ceil() as u32).min(level_info.cols);
    let row_start = ((rect.y / level_tile_size).floor().max(0.0)) as u32;
    let row_end = (((rect.y + rect.height) / level_tile_size).ceil() as u32).min(level_info.rows);

    if col_start >= col_end || row_start >= row_end {
        return Vec::new();
    }

    let mut tiles = Vec::with_capacity(((col_end - col_start) * (row_end - row_start)) as usize);
    for row in row_start..row_end {
        for col in col_start..col_end {
            tiles.push(TileCoord::new(level_info.level, col, row));
        }
    }
    tiles
}

/// Visible tile set for a viewport at the given scale, per §4.4.
pub fn visible_tiles(descriptor: &SlideDescriptor, rect: ViewportRect, scale: f64) -> Vec<TileCoord> {
    if scale <= 0.0 || rect.width <= 0.0 || rect.height <= 0.0 {
        return Vec::new();
    }
    let level = level_for_scale(descriptor, scale);
    match descriptor.get_level(level) {
        Some(level_info) => tiles_in_rect(descriptor.tile_size, level_info, rect),
        None => Vec::new(),
    }
}
