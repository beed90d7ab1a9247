//! Tiling planner.
//!
//! Splits an image of any size into tiles the model can accept. Each
//! tile carries a *core region*: the part of the tile's output that is
//! written into the final result. Core regions partition the image
//! exactly once; the rest of each tile is context margin whose output is
//! discarded, so convolution border effects never reach the result.
//!
//! The two axes are planned independently and combined in raster order
//! (row-major), which keeps the plan deterministic.

use serde::{Deserialize, Serialize};

use crate::types::{ConfigError, Dimensions, Rect};

/// Bounds for tiles handed to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TilingParameters {
    /// Largest tile width the model is given.
    pub max_tile_width: u32,
    /// Largest tile height the model is given.
    pub max_tile_height: u32,
    /// Context pixels added left and right of each core region.
    pub margin_x: u32,
    /// Context pixels added above and below each core region.
    pub margin_y: u32,
}

impl TilingParameters {
    /// Default maximum tile edge when the model runs on an accelerator.
    pub const DEFAULT_ACCELERATED_MAX_TILE: u32 = 512;

    /// Default maximum tile edge for CPU inference, which can afford
    /// larger tiles.
    pub const DEFAULT_CPU_MAX_TILE: u32 = 4096;

    /// Parameters with the same margin on both axes.
    #[must_use]
    pub const fn new(max_tile_width: u32, max_tile_height: u32, margin: u32) -> Self {
        Self {
            max_tile_width,
            max_tile_height,
            margin_x: margin,
            margin_y: margin,
        }
    }

    /// Check the parameters against a model's minimum input dimension.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidTiling`] if either maximum is smaller
    /// than `min_input_dimension` or zero.
    pub fn validate(&self, min_input_dimension: u32) -> Result<(), ConfigError> {
        let min = min_input_dimension.max(1);
        if self.max_tile_width < min || self.max_tile_height < min {
            return Err(ConfigError::InvalidTiling(format!(
                "max tile size {}x{} is below the model's minimum input dimension {min}",
                self.max_tile_width, self.max_tile_height,
            )));
        }
        Ok(())
    }
}

impl Default for TilingParameters {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CPU_MAX_TILE, Self::DEFAULT_CPU_MAX_TILE, 0)
    }
}

/// One planned tile: the extent given to the model and the core region
/// of its output that is kept. Both are in full-image coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedTile {
    pub tile: Rect,
    pub core: Rect,
}

impl PlannedTile {
    /// Core region relative to the tile's own origin.
    #[must_use]
    pub const fn core_in_tile(&self) -> Rect {
        Rect::new(
            self.core.x - self.tile.x,
            self.core.y - self.tile.y,
            self.core.width,
            self.core.height,
        )
    }
}

/// Errors from planning tiles for a specific image.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TilingError {
    /// The image has no pixels.
    #[error("cannot tile an empty image ({0})")]
    EmptyImage(Dimensions),

    /// The image is smaller than the model accepts.
    #[error("image {image} is smaller than the model's minimum input dimension {min_input_dimension}")]
    ImageTooSmall {
        image: Dimensions,
        min_input_dimension: u32,
    },

    /// The parameters themselves are unusable.
    #[error("max tile size {max_tile_width}x{max_tile_height} is below the minimum input dimension {min_input_dimension}")]
    TileBoundsTooSmall {
        max_tile_width: u32,
        max_tile_height: u32,
        min_input_dimension: u32,
    },
}

/// Span of one tile along a single axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct AxisSpan {
    core_start: u32,
    core_len: u32,
    tile_start: u32,
    tile_len: u32,
}

/// Plan one axis of length `extent`.
///
/// Cores are balanced so they differ in length by at most one pixel.
/// Tiles are cores grown by `margin` on both sides, clipped to the
/// image, and grown inward when that leaves them shorter than
/// `min_tile`.
fn plan_axis(extent: u32, max_tile: u32, margin: u32, min_tile: u32) -> Vec<AxisSpan> {
    if extent <= max_tile {
        return vec![AxisSpan {
            core_start: 0,
            core_len: extent,
            tile_start: 0,
            tile_len: extent,
        }];
    }

    // Keep at least one core pixel per tile.
    let margin = margin.min((max_tile - 1) / 2);
    let max_core = max_tile - 2 * margin;
    let count = extent.div_ceil(max_core);
    let base = extent / count;
    let remainder = extent % count;

    let mut spans = Vec::with_capacity(count as usize);
    let mut core_start = 0;
    for i in 0..count {
        let core_len = base + u32::from(i < remainder);
        let core_end = core_start + core_len;

        let mut tile_start = core_start.saturating_sub(margin);
        let mut tile_end = core_end.saturating_add(margin).min(extent);
        if tile_end - tile_start < min_tile {
            tile_start = tile_start.min(extent - min_tile);
            tile_end = tile_end.max(tile_start + min_tile);
        }

        spans.push(AxisSpan {
            core_start,
            core_len,
            tile_start,
            tile_len: tile_end - tile_start,
        });
        core_start = core_end;
    }
    spans
}

/// Compute a covering set of tiles for an image.
///
/// Tiles are returned in raster order. Every tile is at least
/// `min_input_dimension` and at most the configured maximum on each
/// axis, and lies inside the image. The core regions partition the
/// image exactly once. An image no larger than the maximum tile size
/// yields a single tile covering the whole image.
///
/// # Errors
///
/// Returns [`TilingError::EmptyImage`] for zero-sized images,
/// [`TilingError::TileBoundsTooSmall`] when the maximum tile size is below
/// the model minimum, and [`TilingError::ImageTooSmall`] when the image
/// itself is below the model minimum on either axis.
pub fn plan(
    image: Dimensions,
    params: &TilingParameters,
    min_input_dimension: u32,
) -> Result<Vec<PlannedTile>, TilingError> {
    if image.width == 0 || image.height == 0 {
        return Err(TilingError::EmptyImage(image));
    }
    let min = min_input_dimension.max(1);
    if params.max_tile_width < min || params.max_tile_height < min {
        return Err(TilingError::TileBoundsTooSmall {
            max_tile_width: params.max_tile_width,
            max_tile_height: params.max_tile_height,
            min_input_dimension,
        });
    }
    if image.width < min || image.height < min {
        return Err(TilingError::ImageTooSmall {
            image,
            min_input_dimension,
        });
    }

    let columns = plan_axis(image.width, params.max_tile_width, params.margin_x, min);
    let rows = plan_axis(image.height, params.max_tile_height, params.margin_y, min);

    let mut tiles = Vec::with_capacity(columns.len() * rows.len());
    for row in &rows {
        for column in &columns {
            tiles.push(PlannedTile {
                tile: Rect::new(
                    column.tile_start,
                    row.tile_start,
                    column.tile_len,
                    row.tile_len,
                ),
                core: Rect::new(
                    column.core_start,
                    row.core_start,
                    column.core_len,
                    row.core_len,
                ),
            });
        }
    }
    Ok(tiles)
}
